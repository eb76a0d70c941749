use thiserror::Error;

/// A payload that could not be turned into a delivery status or update.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("status must not be empty")]
    EmptyStatus,
}

/// Failures raised by a queue gateway.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("message of {size} bytes exceeds the {max} byte batch limit")]
    BatchOverflow { size: usize, max: usize },

    #[error("{0} is already closed")]
    Closed(&'static str),
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        QueueError::Transport(err.to_string())
    }
}

/// Why a submission did not reach the queue.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("malformed body: {0}")]
    MalformedBody(#[from] DecodeError),

    #[error("could not encode delivery update: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("queue unavailable: {0}")]
    Connect(QueueError),

    #[error("send failed: {0}")]
    Send(QueueError),

    #[error("submission task failed: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

impl SubmissionError {
    /// Whether the caller can fix this by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(self, SubmissionError::MalformedBody(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_body_is_client_error() {
        let err = SubmissionError::from(DecodeError::EmptyStatus);
        assert!(err.is_client_error());
        assert_eq!(err.to_string(), "malformed body: status must not be empty");
    }

    #[test]
    fn test_send_failure_is_not_client_error() {
        let err = SubmissionError::Send(QueueError::Transport("link detached".to_string()));
        assert!(!err.is_client_error());
    }
}
