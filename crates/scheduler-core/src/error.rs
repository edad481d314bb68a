//! Error taxonomy for the scheduling/execution engine.
//!
//! Per-run failures (spawn errors, timeouts, keyword failures, cancellation)
//! never propagate as `Result` errors out of the scheduler loop — they are
//! represented as data via `FinishReason`/`RunStatus` on the terminal `Run`,
//! which `retry_engine::on_terminal` then classifies for retry purposes.
//! `EngineError` covers what is actually fallible from the caller's
//! perspective: catalog (re)publication.

use crate::catalog::CatalogError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Catalog publish rejected; the previous snapshot remains in force.
    #[error("invalid job catalog: {0}")]
    Config(String),
}

impl From<CatalogError> for EngineError {
    fn from(err: CatalogError) -> Self {
        EngineError::Config(err.to_string())
    }
}

/// Convenience alias used throughout the engine.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
