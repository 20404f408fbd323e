use thiserror::Error;

use crate::audio::AudioError;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::ota::ProvisioningError;
use crate::router::HandlerError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, EdgeError>;

#[derive(Error, Debug)]
pub enum EdgeError {
    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Tool handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
