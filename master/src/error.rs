use common::TaskCategory;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedError {
    /// Se agotaron los reintentos: la corrida no puede completarse.
    #[error("item {item} ({category}, {size} eventos, {location}) falló permanentemente: {reason}. No quedan reintentos.")]
    FatalItemFailure {
        item: String,
        category: TaskCategory,
        size: u64,
        location: String,
        reason: String,
    },
    #[error("no hay resultados disponibles")]
    NoResultsAvailable,
    #[error("la tarea {0} no se puede partir más")]
    NotDivisible(String),
    #[error("corrida abortada")]
    Aborted,
    #[error("configuración inválida: {0}")]
    Config(String),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("log de linaje: {0}")]
    Csv(#[from] csv::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SchedError>;
