pub mod agent;
pub mod audio;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod mcp;
pub mod ota;
pub mod protocol;
pub mod router;
pub mod transport;

pub use agent::Agent;
pub use config::AgentConfig;
pub use engine::{AgentEvent, TurnState};
pub use error::{EdgeError, Result};
