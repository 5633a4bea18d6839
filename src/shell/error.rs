use axum::http::StatusCode;
use thiserror::Error;

/// Typed failure raised by the supervisor and log store; the HTTP surface
/// maps each kind to a status code and renders a short single-sentence body.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ShellError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ShellError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ShellError::NotFound(_) => StatusCode::NOT_FOUND,
            ShellError::Conflict(_) => StatusCode::CONFLICT,
            ShellError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for ShellError {
    fn from(e: std::io::Error) -> Self {
        ShellError::Internal(e.into())
    }
}
