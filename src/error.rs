use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid URL {input:?}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("discovery failed: {0}")]
    DiscoveryUnreachable(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("account record is missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("{0}")]
    Usage(String),
}

impl AuthError {
    pub fn invalid_url(input: &str, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            _ => 1,
        }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
