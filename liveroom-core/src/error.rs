use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error was caused by the caller rather than the server
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_)
                | Self::Authorization(_)
                | Self::NotFound(_)
                | Self::AlreadyExists(_)
                | Self::InvalidInput(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(Error::InvalidInput("empty".to_string()).is_client_error());
        assert!(Error::AlreadyExists("vote".to_string()).is_client_error());
        assert!(!Error::Internal("boom".to_string()).is_client_error());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
