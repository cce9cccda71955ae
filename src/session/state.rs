use std::fmt;

use thiserror::Error;

/// Lifecycle of one control session. Transitions only move forward.
///
/// ```text
/// Handshaking ──► Established ──► Terminating ──► Closed
///      │                               ▲
///      └───────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Handshaking,
    Established,
    Terminating,
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid session transition {from} -> {to}")]
pub struct SessionStateError {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Established => "established",
            SessionState::Terminating => "terminating",
            SessionState::Closed => "closed",
        }
    }

    /// True while the session still accepts inbound traffic.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Handshaking | SessionState::Established)
    }

    pub fn transition(self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        match (self, next) {
            (Handshaking, Established)
            | (Handshaking, Terminating)
            | (Established, Terminating)
            | (Terminating, Closed) => Ok(next),
            (from, to) => Err(SessionStateError { from, to }),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
