use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("a filter run is already in progress")]
    RunInProgress,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store error: {0}")]
    Store(String),
}

impl FilterError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        FilterError::Validation {
            field,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
