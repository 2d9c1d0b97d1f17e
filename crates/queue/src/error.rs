//! Error type shared by every broker backend and handle.

/// Errors returned by queue and worker handles.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The Redis client reported an error (connection loss included).
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored job field could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The job id is not present in the queue.
    #[error("Job {id} not found in queue {queue}")]
    JobNotFound { queue: String, id: String },

    /// A stored job is missing a field or holds a malformed value.
    #[error("Invalid job data: {0}")]
    InvalidData(String),

    /// The initial broker connection did not complete in time.
    #[error("Timed out after {0} ms while connecting to the broker")]
    ConnectTimeout(u64),

    /// The worker's claim loop terminated abnormally.
    #[error("Worker error: {0}")]
    Worker(String),
}

/// Convenience alias for broker results.
pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    /// Whether the error means the broker is unreachable rather than that the
    /// request itself was wrong.
    pub fn is_connection_error(&self) -> bool {
        match self {
            QueueError::Redis(err) => {
                err.is_io_error()
                    || err.is_connection_refusal()
                    || err.is_connection_dropped()
                    || err.is_timeout()
            }
            QueueError::ConnectTimeout(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_timeout_is_a_connection_error() {
        assert!(QueueError::ConnectTimeout(5000).is_connection_error());
    }

    #[test]
    fn missing_job_is_not_a_connection_error() {
        let err = QueueError::JobNotFound {
            queue: "example".into(),
            id: "42".into(),
        };
        assert!(!err.is_connection_error());
        assert_eq!(err.to_string(), "Job 42 not found in queue example");
    }

    #[test]
    fn io_failure_is_a_connection_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = QueueError::Redis(redis::RedisError::from(io));
        assert!(err.is_connection_error());
    }
}
