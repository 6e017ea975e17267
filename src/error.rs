use thiserror::Error;

/// Error taxonomy shared by the CAS client, the submission/collection engine,
/// and the memoization engine.
#[derive(Error, Debug)]
pub enum SwarmError {
    /// Invalid caller input: bad digest, missing required argument, malformed
    /// isolated file. Fatal, never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transport failure or HTTP 5xx. Retried locally with backoff; this
    /// variant is only surfaced once the retry budget is exhausted.
    #[error("transient network failure after retries: {0}")]
    TransientNetwork(String),

    /// HTTP 4xx other than the registration-latency 404. Fatal for the
    /// operation, never retried.
    #[error("server rejected request ({status}): {body}")]
    ServerReject { status: u16, body: String },

    /// CAS upload/download failed after retries. Fatal for the enclosing
    /// task.
    #[error("storage operation failed for key '{key}': {source}")]
    Storage {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// A single shard did not produce a result before its deadline.
    #[error("shard {index} timed out after {elapsed_secs}s")]
    ShardTimeout { index: u32, elapsed_secs: u64 },

    /// Some shards completed, some did not.
    #[error("partial failure: missing shard indices {missing:?}")]
    PartialFailure { missing: Vec<u32> },

    /// Wraps lower-level I/O errors that don't fit the above categories.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SwarmError {
    /// True for errors the retry wrapper should attempt again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwarmError::TransientNetwork(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_not_retryable() {
        let err = SwarmError::Config("bad digest".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_network_errors_are_retryable() {
        let err = SwarmError::TransientNetwork("connection reset".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn server_reject_is_not_retryable() {
        let err = SwarmError::ServerReject {
            status: 400,
            body: "bad request".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn display_messages_are_informative() {
        let err = SwarmError::ShardTimeout {
            index: 2,
            elapsed_secs: 30,
        };
        assert!(err.to_string().contains("shard 2"));
    }
}
