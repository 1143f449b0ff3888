use thiserror::Error;

use crate::core::dag::Cycle;
use crate::core::unit::UnitId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Dependency cycle detected: {}", format_cycles(.cycles))]
    Cycle { cycles: Vec<Cycle> },

    #[error("Work unit not found: {0}")]
    UnitNotFound(UnitId),

    #[error("Foreshadowing token not found: {0}")]
    TokenNotFound(String),

    #[error("Foreshadowing token already exists: {0}")]
    DuplicateToken(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Producer error: {0}")]
    Producer(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Detail not found: {0}")]
    DetailNotFound(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("No home directory")]
    NoHomeDir,
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_cycles(cycles: &[Cycle]) -> String {
    if cycles.is_empty() {
        return "no acyclic order exists".to_string();
    }
    cycles
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
