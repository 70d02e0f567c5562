use thiserror::Error;
use std::num::ParseIntError;

#[derive(Error, Debug)]
pub enum DataHubError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    TransportError(#[from] reqwest::Error),

    #[error("Rate limited by {0}")]
    RateLimited(String),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Date parsing error: {0}")]
    DateError(#[from] chrono::ParseError),

    #[error("Parse int error: {0}")]
    ParseIntError(#[from] ParseIntError),

    #[error("Write queue capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Data error: {0}")]
    DataError(String),
}

impl DataHubError {
    /// 是否值得重试：网络错误、限流、服务端 5xx，以及响应体解码失败
    pub fn is_retryable(&self) -> bool {
        match self {
            DataHubError::TransportError(_)
            | DataHubError::RateLimited(_)
            | DataHubError::JsonError(_) => true,
            DataHubError::HttpStatus(status) => *status >= 500,
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, DataHubError::RateLimited(_))
    }
}

pub type Result<T> = std::result::Result<T, DataHubError>;

// 用于从字符串创建错误
impl From<String> for DataHubError {
    fn from(s: String) -> Self {
        DataHubError::DataError(s)
    }
}

impl From<&str> for DataHubError {
    fn from(s: &str) -> Self {
        DataHubError::DataError(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(DataHubError::RateLimited("yahoo".into()).is_retryable());
        assert!(DataHubError::HttpStatus(503).is_retryable());
        assert!(!DataHubError::HttpStatus(404).is_retryable());
        assert!(!DataHubError::ParseError("missing quote".into()).is_retryable());

        let truncated: DataHubError = serde_json::from_str::<serde_json::Value>("{\"chart\":").unwrap_err().into();
        assert!(truncated.is_retryable());
        assert!(!DataHubError::CapacityExceeded("full".into()).is_retryable());
    }
}
