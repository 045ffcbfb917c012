use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    /// No active backend, or the backend is not yet connected/initialized.
    /// Callers get this immediately instead of blocking on a dead link.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The remote link produced no completion callback before the fixed
    /// request timeout elapsed.
    #[error("Request timed out: {0}")]
    RequestTimeout(String),

    #[error("Request rejected by backend (code {code}): {message}")]
    RequestRejected { code: u32, message: String },

    #[error("Operation '{operation}' is not valid in state '{from}'")]
    InvalidTransition { from: String, operation: String },

    #[error("Data fetch for {entry} failed after {attempts} attempts")]
    FetchFailed { entry: String, attempts: u32 },

    #[error("No playback unit at handle {0}")]
    UnknownUnit(usize),

    #[error("Player was destroyed")]
    Destroyed,

    #[error(transparent)]
    Queue(#[from] cdzqueue::Error),
}

impl PlayerError {
    pub fn backend_unavailable(message: &str) -> Self {
        PlayerError::BackendUnavailable(message.to_string())
    }

    pub fn rejected(code: u32, message: &str) -> Self {
        PlayerError::RequestRejected {
            code,
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
