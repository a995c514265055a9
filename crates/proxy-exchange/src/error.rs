use std::fmt;

use proxy_wire::{EnvelopeError, FrameError};
use thiserror::Error;

use crate::collab::CollaboratorError;
use crate::store::StoreError;

/// Result vocabulary shared by every handler. Success is `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Fail,
    NotSupported,
    NetworkError,
    TimeoutError,
    AgentError,
    ConfigError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Fail => "FAIL",
            ErrorKind::NotSupported => "NOTSUPPORTED",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::AgentError => "AGENT_ERROR",
            ErrorKind::ConfigError => "CONFIG_ERROR",
        }
    }

    /// Transport failures are retried on the next schedule.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::NetworkError | ErrorKind::TimeoutError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket stage a transport failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Send,
    Recv,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Connect => "connect",
            Stage::Send => "send",
            Stage::Recv => "receive",
        })
    }
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("cannot connect to [{address}]: {reason}")]
    Connect { address: String, reason: String },
    #[error("cannot send to [{address}]: {reason}")]
    Send { address: String, reason: String },
    #[error("cannot receive from [{address}]: {reason}")]
    Recv { address: String, reason: String },
    #[error("{stage} timed out for [{address}]")]
    Timeout { stage: Stage, address: String },
    #[error("sequential redirect responses detected")]
    SequentialRedirect,
    #[error("peer rejected the request: {info}")]
    Rejected { info: String },
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    NotSupported(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl ExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Connect { .. }
            | ExchangeError::Send { .. }
            | ExchangeError::Recv { .. } => ErrorKind::NetworkError,
            ExchangeError::Timeout { .. } => ErrorKind::TimeoutError,
            ExchangeError::Rejected { .. } => ErrorKind::AgentError,
            ExchangeError::Config(_) => ErrorKind::ConfigError,
            ExchangeError::NotSupported(_) => ErrorKind::NotSupported,
            ExchangeError::SequentialRedirect
            | ExchangeError::Envelope(_)
            | ExchangeError::Protocol(_)
            | ExchangeError::Store(_)
            | ExchangeError::Collaborator(_) => ErrorKind::Fail,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            ExchangeError::Connect { .. } => Some(Stage::Connect),
            ExchangeError::Send { .. } => Some(Stage::Send),
            ExchangeError::Recv { .. } => Some(Stage::Recv),
            ExchangeError::Timeout { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub(crate) fn from_frame(stage: Stage, address: &str, err: FrameError) -> Self {
        match err {
            FrameError::Compression(err) => ExchangeError::Protocol(err.to_string()),
            FrameError::TooLarge { .. } | FrameError::Malformed(_) if stage == Stage::Recv => {
                ExchangeError::Protocol(err.to_string())
            }
            other => {
                let address = address.to_string();
                let reason = other.to_string();
                match stage {
                    Stage::Connect => ExchangeError::Connect { address, reason },
                    Stage::Send => ExchangeError::Send { address, reason },
                    Stage::Recv => ExchangeError::Recv { address, reason },
                }
            }
        }
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_network_class() {
        let err = ExchangeError::Connect {
            address: "127.0.0.1:10051".into(),
            reason: "refused".into(),
        };
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert!(err.kind().is_retryable());
        assert_eq!(err.stage(), Some(Stage::Connect));

        let err = ExchangeError::Timeout {
            stage: Stage::Recv,
            address: "proxy:10051".into(),
        };
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
        assert_eq!(err.to_string(), "receive timed out for [proxy:10051]");
    }

    #[test]
    fn protocol_errors_fail_without_retry_class() {
        assert_eq!(ExchangeError::SequentialRedirect.kind(), ErrorKind::Fail);
        assert!(!ExchangeError::SequentialRedirect.kind().is_retryable());
        assert_eq!(
            ExchangeError::Envelope(EnvelopeError::Empty).to_string(),
            "empty string received"
        );
        assert_eq!(
            ExchangeError::Config("bad".into()).kind(),
            ErrorKind::ConfigError
        );
    }

    #[test]
    fn frame_errors_map_to_their_stage() {
        let err = ExchangeError::from_frame(Stage::Recv, "a:1", FrameError::Closed);
        assert!(matches!(err, ExchangeError::Recv { .. }));
        let err = ExchangeError::from_frame(
            Stage::Recv,
            "a:1",
            FrameError::TooLarge { size: 10, max: 1 },
        );
        assert!(matches!(err, ExchangeError::Protocol(_)));
    }
}
