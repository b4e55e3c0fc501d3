use std::fmt;

/// Lifecycle of one account's gateway connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Not started yet.
    Disconnected,
    /// Opening the transport and waiting for hello.
    Connecting,
    /// Identify sent, waiting for the ready snapshot.
    Identifying,
    /// Snapshot applied; heartbeating and applying dispatches.
    Ready,
    /// Resume sent, waiting for the server to replay missed events.
    Resuming,
    /// Waiting out the backoff before the next connection attempt.
    Reconnecting,
    /// Final. The session will not connect again.
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Identifying => "identifying",
            Self::Ready => "ready",
            Self::Resuming => "resuming",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    pub fn is_final(self) -> bool {
        self == Self::Closed
    }

    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if next == Closed {
            return self != Closed;
        }
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Identifying)
                | (Connecting, Resuming)
                | (Connecting, Reconnecting)
                | (Identifying, Ready)
                | (Identifying, Identifying)
                | (Identifying, Reconnecting)
                | (Resuming, Ready)
                | (Resuming, Identifying)
                | (Resuming, Reconnecting)
                | (Ready, Identifying)
                | (Ready, Reconnecting)
                | (Reconnecting, Connecting)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Holds the current state and enforces the transition table.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
        }
    }
}

impl SessionMachine {
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves to `next`, returning the previous state.
    pub fn advance(&mut self, next: SessionState) -> Result<SessionState, InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionMachine, SessionState};

    #[test]
    fn happy_path_and_resume_cycle() {
        let mut machine = SessionMachine::default();
        for next in [
            SessionState::Connecting,
            SessionState::Identifying,
            SessionState::Ready,
            SessionState::Reconnecting,
            SessionState::Connecting,
            SessionState::Resuming,
            SessionState::Ready,
        ] {
            machine.advance(next).expect("allowed transition");
        }
        assert_eq!(machine.state(), SessionState::Ready);
    }

    #[test]
    fn invalid_session_falls_back_to_identify() {
        let mut machine = SessionMachine::default();
        machine.advance(SessionState::Connecting).expect("connect");
        machine.advance(SessionState::Resuming).expect("resume");
        assert_eq!(
            machine.advance(SessionState::Identifying),
            Ok(SessionState::Resuming)
        );
    }

    #[test]
    fn closed_is_final() {
        let mut machine = SessionMachine::default();
        machine.advance(SessionState::Closed).expect("close");
        assert!(machine.state().is_final());
        let err = machine
            .advance(SessionState::Connecting)
            .expect_err("closed is final");
        assert_eq!(err.from, SessionState::Closed);
        assert!(machine.advance(SessionState::Closed).is_err());
    }

    #[test]
    fn ready_requires_a_handshake() {
        let mut machine = SessionMachine::default();
        machine.advance(SessionState::Connecting).expect("connect");
        assert!(machine.advance(SessionState::Ready).is_err());
        assert_eq!(machine.state(), SessionState::Connecting);
    }
}
