use bridge::BridgeError;
use resilience::{Classify, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("config error: {0}")]
    Config(String),

    /// A mandatory bring-up stage failed; the instance is in `error`.
    #[error("{stage} stage failed: {message}")]
    Initialization {
        stage: &'static str,
        message: String,
    },

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("function '{0}' not found")]
    FunctionNotFound(String),

    #[error("invalid function: {0}")]
    InvalidFunction(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for OrchestratorError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Initialization { .. } | Self::Sandbox(_) => ErrorKind::Initialization,
            Self::Bridge(e) => e.kind(),
            Self::FunctionNotFound(_) => ErrorKind::NotFound,
            Self::Config(_) | Self::InvalidFunction(_) => ErrorKind::Client,
            Self::Io(_) => ErrorKind::Internal,
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
