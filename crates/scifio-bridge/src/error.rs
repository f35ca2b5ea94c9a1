use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The worker could not be started at all.
    #[error("failed to launch worker: {0}")]
    ProcessLaunch(String),

    /// The worker started but never printed its ready line.
    #[error("worker did not become ready within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("failed to write to worker: {0}")]
    ChannelWrite(String),

    #[error("no response from worker within {0:?}")]
    ChannelTimeout(Duration),

    #[error("worker channel closed: {0}")]
    ChannelClosed(String),

    /// The worker answered a well-formed request with its error marker.
    #[error("worker reported an error: {0}")]
    RemoteOperation(String),

    /// The worker's output did not match the expected grammar or length.
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("dimension order '{order}' is not a permutation of axes '{axes}'")]
    AxisOrderMismatch { order: String, axes: String },

    #[error("unsupported axis '{0}'")]
    UnsupportedAxis(char),

    #[error("series {index} out of range (series count {count})")]
    SeriesOutOfRange { index: usize, count: usize },

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("buffer holds {actual} bytes, region needs {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("no image is open: {0}")]
    NotOpen(String),
}

impl BridgeError {
    /// Whether the worker instance must be torn down after this error.
    ///
    /// Channel faults, timeouts and desyncs leave the pipe framing in an
    /// unknown state. Remote errors and argument errors leave the worker usable.
    pub fn is_fatal_to_worker(&self) -> bool {
        matches!(
            self,
            Self::ProcessLaunch(_)
                | Self::HandshakeTimeout(_)
                | Self::ChannelWrite(_)
                | Self::ChannelTimeout(_)
                | Self::ChannelClosed(_)
                | Self::ProtocolDesync(_)
                | Self::AxisOrderMismatch { .. }
                | Self::UnsupportedAxis(_)
        )
    }

    pub fn desync(message: impl Into<String>) -> Self {
        Self::ProtocolDesync(message.into())
    }

    pub fn invalid_region(message: impl Into<String>) -> Self {
        Self::InvalidRegion(message.into())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_worker() {
        assert!(!BridgeError::RemoteOperation("unreadable".into()).is_fatal_to_worker());
        assert!(
            !BridgeError::SeriesOutOfRange { index: 3, count: 3 }.is_fatal_to_worker()
        );
    }

    #[test]
    fn channel_faults_are_fatal() {
        assert!(BridgeError::ChannelClosed("eof".into()).is_fatal_to_worker());
        assert!(BridgeError::ChannelTimeout(Duration::from_secs(1)).is_fatal_to_worker());
        assert!(BridgeError::desync("bad length").is_fatal_to_worker());
    }

    #[test]
    fn messages_carry_worker_text() {
        let err = BridgeError::RemoteOperation("java.io.IOException: no such file".into());
        assert_eq!(
            err.to_string(),
            "worker reported an error: java.io.IOException: no such file"
        );
    }
}
