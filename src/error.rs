use crate::engine::EnvironmentHandle;

/// Descriptive failure reported by a solver engine operation.
///
/// The engine boundary keeps the original "last error string" flavor: a
/// failure is a message the host can display, not a structured code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error type for plugin entry points.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The environment handle is stale or was never issued by the engine.
    #[error("invalid environment handle {0}")]
    InvalidEnvironment(EnvironmentHandle),

    /// The engine attempted the operation and reported a failure.
    #[error("{0}")]
    Engine(#[from] EngineError),

    /// Caller-supplied arguments were rejected before any engine work.
    #[error("invalid argument: {0}")]
    BadArgument(String),
}

pub type PluginResult<T> = Result<T, PluginError>;
pub type EngineResult<T> = Result<T, EngineError>;
