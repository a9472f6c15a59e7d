// PulseWatch Error Types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PulseError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Run already active: {0}")]
    AlreadyActive(String),

    #[error("Stage error: {0}")]
    Stage(String),

    /// Cooperative cancellation observed at a checkpoint. Carried as an
    /// error so it unwinds through `?` to the orchestrator's top level,
    /// which maps it to the cancelled terminal state rather than failed.
    #[error("Run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PulseError>;
