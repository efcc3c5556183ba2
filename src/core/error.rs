use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "sqlite")]
    #[error("staging store error: {0}")]
    Staging(#[from] rusqlite::Error),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("archive failed for tag {tag}: {reason}")]
    Archive { tag: String, reason: String },
    #[error("corrupt data: {0}")]
    Corrupt(String),
    #[error("invalid path component for {field}: {value:?}")]
    InvalidComponent { field: &'static str, value: String },
    #[error("invalid time: {0}")]
    Time(String),
    #[error("worker failed: {0}")]
    Worker(String),
}

impl From<time::error::ComponentRange> for Error {
    fn from(value: time::error::ComponentRange) -> Self {
        Error::Time(value.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(value: csv::Error) -> Self {
        Error::Catalog(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
