use strum::Display;

use crate::protocol::ListenMode;

/// Conversational turn state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum TurnState {
    #[default]
    Idle,
    ListeningManual,
    ListeningAuto,
    ListeningRealtime,
    Speaking,
}

impl TurnState {
    pub fn listening(mode: ListenMode) -> Self {
        match mode {
            ListenMode::Manual => TurnState::ListeningManual,
            ListenMode::Auto => TurnState::ListeningAuto,
            ListenMode::Realtime => TurnState::ListeningRealtime,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listen_mode().is_some()
    }

    pub fn listen_mode(&self) -> Option<ListenMode> {
        match self {
            TurnState::ListeningManual => Some(ListenMode::Manual),
            TurnState::ListeningAuto => Some(ListenMode::Auto),
            TurnState::ListeningRealtime => Some(ListenMode::Realtime),
            TurnState::Idle | TurnState::Speaking => None,
        }
    }
}
