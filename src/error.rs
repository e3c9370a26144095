use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnifferError {
    #[error("Interface discovery error: {0}")]
    Discovery(String),

    #[error("Capture strategy '{strategy}' failed: {reason}")]
    ProbeFailure { strategy: String, reason: String },

    #[error("All capture strategies exhausted: {0}")]
    CaptureExhausted(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("A capture session is already running")]
    Busy,

    #[error("Insufficient privileges for packet capture (run elevated): {0}")]
    Permission(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl SnifferError {
    pub fn probe(strategy: &str, reason: impl Into<String>) -> Self {
        SnifferError::ProbeFailure {
            strategy: strategy.to_string(),
            reason: reason.into(),
        }
    }

    /// Maps an I/O failure from a capture backend, keeping permission
    /// problems distinct from ordinary strategy failures.
    pub fn from_capture_io(strategy: &str, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            SnifferError::Permission(format!("{}: {}", strategy, err))
        } else {
            SnifferError::probe(strategy, err.to_string())
        }
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, SnifferError::Permission(_))
    }
}

pub type Result<T> = std::result::Result<T, SnifferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_is_surfaced_distinctly() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "socket");
        let err = SnifferError::from_capture_io("datalink-stream", &io);
        assert!(err.is_permission());

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no device");
        let err = SnifferError::from_capture_io("datalink-stream", &io);
        assert!(matches!(err, SnifferError::ProbeFailure { .. }));
    }
}
