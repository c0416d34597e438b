use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("Source {0} is already registered")]
    DuplicateSource(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Detection failed: {0}")]
    Detection(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Observer failed: {0}")]
    Observer(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn source_unavailable(source_id: &str, reason: impl ToString) -> Self {
        Error::SourceUnavailable {
            source_id: source_id.to_string(),
            reason: reason.to_string(),
        }
    }
}
