//! Error types for sandpool-core.

use crate::protocol::CorrelationId;
use crate::runtime::ContainerId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for sandpool-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while driving the pool or an execution.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No Ready slot was available. Callers should retry later.
    #[error("no ready sandbox available, retry later")]
    PoolExhausted,

    /// The pool was closed and accepts no new slots.
    #[error("sandbox pool is closed")]
    PoolClosed,

    /// Stdin/stdout exchange with the sandbox failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Error from the container runtime
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Creating, attaching and starting a sandbox took too long
    #[error("sandbox warm-up timed out after {0:?}")]
    WarmupTimeout(Duration),

    /// Invalid pool or sandbox configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CoreError {
    /// True when the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted)
    }

    /// True when the execution deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Protocol(ProtocolError::Timeout))
    }
}

/// Framing-level failures produced by [`FrameCodec`](crate::protocol::FrameCodec).
#[derive(Debug, Error)]
pub enum FrameError {
    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Declared payload length is above the codec limit
    #[error("frame payload of {size} bytes exceeds limit of {limit}")]
    TooLarge {
        /// Declared payload size
        size: usize,
        /// Configured maximum
        limit: usize,
    },

    /// Tag byte is not part of the protocol
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),

    /// Known tag arriving on the wrong side of the stream
    #[error("unexpected frame tag {0:#04x}")]
    UnexpectedTag(u8),

    /// Exit frame that declares a payload
    #[error("exit frame carries {0} payload bytes")]
    UnexpectedPayload(usize),
}

/// Errors from the stdin/stdout wire protocol.
///
/// Every variant leaves the slot's stream in an unknown state, so the
/// orchestrator retires the slot on any of them.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Writing a command failed (usually a broken pipe)
    #[error("protocol write failed: {0}")]
    Write(#[source] FrameError),

    /// Output stream produced malformed framing or failed to read
    #[error("protocol read failed: {0}")]
    Read(#[source] FrameError),

    /// Stream closed before the expected output arrived
    #[error("stream closed before output for execution {0} arrived")]
    Mismatch(CorrelationId),

    /// Deadline elapsed before the exchange completed
    #[error("execution deadline elapsed")]
    Timeout,
}

/// Errors from the container runtime client.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Error returned by the Docker engine API
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Runtime accepted the start call but did not start the container
    #[error("container {0} did not start")]
    NotStarted(ContainerId),

    /// Runtime could not service the request
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_exhaustion_is_retryable() {
        assert!(CoreError::PoolExhausted.is_retryable());
        assert!(!CoreError::Protocol(ProtocolError::Timeout).is_retryable());
        assert!(!CoreError::PoolClosed.is_retryable());
    }

    #[test]
    fn test_timeout_classification() {
        assert!(CoreError::Protocol(ProtocolError::Timeout).is_timeout());
        let mismatch = CoreError::Protocol(ProtocolError::Mismatch(CorrelationId::new()));
        assert!(!mismatch.is_timeout());
    }

    #[test]
    fn test_error_messages_are_distinct() {
        let exhausted = CoreError::PoolExhausted.to_string();
        let timeout = CoreError::Protocol(ProtocolError::Timeout).to_string();
        assert_ne!(exhausted, timeout);
        assert!(exhausted.contains("retry"));
    }
}
