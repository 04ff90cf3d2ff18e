use conductor_store::StoreError;

/// Failure raised by an agent while starting or producing events.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("{0}")]
    Failed(String),

    #[error("agent cancelled")]
    Cancelled,

    #[error("max turns exceeded: {0}")]
    MaxTurnsExceeded(u32),
}

#[derive(Debug, thiserror::Error)]
#[error("callback {callback} failed: {message}")]
pub struct CallbackError {
    pub callback: String,
    pub message: String,
}

impl CallbackError {
    pub fn new(callback: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            callback: callback.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("{0}")]
    Internal(String),
}
