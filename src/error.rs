use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("message {0} not found")]
    MessageNotFound(i64),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl ChatError {
    /// Short machine-readable code sent to clients in acknowledgements.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "invalid",
            ChatError::MessageNotFound(_) => "not_found",
            ChatError::Store(_) => "internal",
        }
    }
}
