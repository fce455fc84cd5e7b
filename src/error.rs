//! Failure taxonomy for the harness.
//!
//! Three classes of fatal error exist: a polled condition never became true
//! ([`HarnessError::PollTimeout`]), a client could not be built within its
//! retry budget ([`HarnessError::ConnectFailed`]), and an assertion on
//! returned data failed outside of a poll ([`HarnessError::UnexpectedState`]).
//! Transient errors raised *inside* a poll predicate are not part of this
//! taxonomy; the poller swallows and retries them, surfacing only the last
//! one inside `PollTimeout`.

use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum HarnessError {
    /// A condition was not satisfied within its deadline. Carries the
    /// condition's label and the last error its predicate raised, if any.
    PollTimeout {
        label: String,
        timeout: Duration,
        last_error: Option<eyre::Report>,
    },

    /// Client construction (and optional probe) exhausted its retry budget.
    ConnectFailed {
        address: String,
        attempts: u32,
        cause: eyre::Report,
    },

    /// A check on returned data failed outside of a polling loop.
    UnexpectedState(String),
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PollTimeout {
                label,
                timeout,
                last_error,
            } => {
                write!(f, "condition '{label}' not satisfied within {timeout:?}")?;
                if let Some(err) = last_error {
                    write!(f, " (last error: {err})")?;
                }
                Ok(())
            }
            Self::ConnectFailed {
                address,
                attempts,
                cause,
            } => {
                write!(f, "failed to connect to {address} after {attempts} attempts: {cause}")
            }
            Self::UnexpectedState(msg) => write!(f, "unexpected state: {msg}"),
        }
    }
}

impl std::error::Error for HarnessError {}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::eyre;

    #[test]
    fn poll_timeout_display_includes_label_and_last_error() {
        let err = HarnessError::PollTimeout {
            label: "channel at bob".into(),
            timeout: Duration::from_secs(20),
            last_error: Some(eyre!("channel not yet visible")),
        };
        let msg = err.to_string();
        assert!(msg.contains("channel at bob"));
        assert!(msg.contains("channel not yet visible"));
    }

    #[test]
    fn poll_timeout_display_without_captured_error() {
        let err = HarnessError::PollTimeout {
            label: "chain rpc reachable".into(),
            timeout: Duration::from_secs(5),
            last_error: None,
        };
        assert_eq!(
            err.to_string(),
            "condition 'chain rpc reachable' not satisfied within 5s"
        );
    }

    #[test]
    fn connect_failed_display_carries_cause() {
        let err = HarnessError::ConnectFailed {
            address: "http://127.0.0.1:3301".into(),
            attempts: 5,
            cause: eyre!("connection refused"),
        };
        let msg = err.to_string();
        assert!(msg.contains("after 5 attempts"));
        assert!(msg.contains("connection refused"));
    }
}
