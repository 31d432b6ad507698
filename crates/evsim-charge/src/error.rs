//! Session and configuration errors

use evsim_bus::BusError;
use thiserror::Error;

use crate::state::Phase;

/// Failure of one session attempt
#[derive(Debug, Error)]
pub enum SessionError {
    /// An expected message did not arrive in time
    #[error("{phase}: timed out waiting for {expectation}")]
    Timeout { phase: Phase, expectation: String },

    /// The counterpart reported something the session walk cannot continue with
    #[error("{phase}: protocol violation: {detail}")]
    Violation { phase: Phase, detail: String },

    /// Transport fault, not recovered by the retry loop
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

impl SessionError {
    /// Phase the failure occurred in, if it was a protocol failure
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Timeout { phase, .. } | Self::Violation { phase, .. } => Some(*phase),
            Self::Bus(_) => None,
        }
    }

    /// Whether the retry loop recovers from this error
    pub fn is_protocol(&self) -> bool {
        !matches!(self, Self::Bus(_))
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::Timeout {
            phase: Phase::Init,
            expectation: "ChargeInfo(StateMachineState == Init)".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "init: timed out waiting for ChargeInfo(StateMachineState == Init)"
        );
        assert_eq!(err.phase(), Some(Phase::Init));
        assert!(err.is_protocol());

        let err = SessionError::from(BusError::Closed);
        assert_eq!(err.phase(), None);
        assert!(!err.is_protocol());
    }
}
