use fanout_protocol::ConnectionState;

use crate::error::TransportError;

/// Connection state with the legal transitions enforced
#[derive(Debug, Default)]
pub struct StateMachine {
    state: ConnectionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn can_transition(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::*;

        if from.is_terminal() {
            return false;
        }
        match to {
            Closed | Failed => true,
            IceGathering => from == New,
            IceConnecting => from == IceGathering,
            IceConnected => from == IceConnecting,
            DtlsHandshaking => from == IceConnected,
            Ready => from == DtlsHandshaking,
            New => false,
        }
    }

    /// Move to `to`, returning the previous state
    pub fn transition(&mut self, to: ConnectionState) -> Result<ConnectionState, TransportError> {
        if !Self::can_transition(self.state, to) {
            return Err(TransportError::InvalidState(self.state));
        }
        let from = self.state;
        self.state = to;
        Ok(from)
    }
}
