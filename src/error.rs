use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Coarse classification used by callers to decide how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Realtime link problems. Retried in the background, never fatal.
    Transport,
    /// A REST call failed. Shown inline in the view that issued it.
    Request,
    /// The broker or API sent something we could not make sense of.
    Protocol,
    /// Rejected locally before anything went over the wire.
    Validation,
    Auth,
    Local,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request failed with HTTP {status}")]
    Status { status: u16 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid message: {0}")]
    Validation(String),

    #[error("a message is already being sent to conversation {0}")]
    SendInFlight(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cache error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("session closed")]
    Closed,
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Transport(_) | ChatError::Closed => ErrorKind::Transport,
            ChatError::Http(_) | ChatError::Status { .. } => ErrorKind::Request,
            ChatError::Protocol(_) | ChatError::Json(_) => ErrorKind::Protocol,
            ChatError::Validation(_) | ChatError::SendInFlight(_) => ErrorKind::Validation,
            ChatError::AuthRejected(_) => ErrorKind::Auth,
            ChatError::Config(_) | ChatError::Storage(_) | ChatError::Toml(_) | ChatError::Io(_) => {
                ErrorKind::Local
            }
        }
    }

    /// Whether trying the same thing again later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::Transport(_) => true,
            ChatError::Http(e) => e.is_timeout() || e.is_connect(),
            ChatError::Status { status } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}

impl From<url::ParseError> for ChatError {
    fn from(err: url::ParseError) -> Self {
        ChatError::Config(format!("invalid url: {err}"))
    }
}
