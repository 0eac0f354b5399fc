use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("identity file error: {0}")]
    Identity(String),

    #[error("channel transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("relay refused the channel with HTTP {status}")]
    HandshakeRejected { status: u16 },

    #[error("relay rejected registration: {0}")]
    RegistrationRejected(String),

    #[error("relay did not acknowledge registration in time")]
    RegistrationTimeout,

    #[error("channel closed")]
    ChannelClosed,

    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkerError {
    /// Errors that reconnecting cannot fix.
    pub fn is_fatal(&self) -> bool {
        match self {
            WorkerError::RegistrationRejected(_)
            | WorkerError::Config(_)
            | WorkerError::Identity(_)
            | WorkerError::ReconnectExhausted { .. } => true,
            // Wrong broker secret or a colliding identity.
            WorkerError::HandshakeRejected { status } => *status == 401,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(e: reqwest::Error) -> Self {
        WorkerError::Backend(e.to_string())
    }
}
