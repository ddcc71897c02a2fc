// =============================================================================
// Typed errors for component boundaries
// =============================================================================
//
// Process- and task-level plumbing uses `anyhow::Result` (see main.rs and the
// background loops). At component boundaries where a caller needs to match on
// *why* something failed — risk rejections, idempotent order short-circuits,
// kill-switch preemption — we return a typed error instead so the match is
// exhaustive and the reason codes in §7 of the design stay machine-readable.

use serde_json::Value;
use thiserror::Error;

/// A single coded rejection, carrying the metric values that drove it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Rejection {
    pub code: String,
    pub values: Value,
}

impl Rejection {
    pub fn new(code: impl Into<String>, values: Value) -> Self {
        Self {
            code: code.into(),
            values,
        }
    }
}

#[derive(Debug, Error)]
pub enum TradingError {
    #[error("risk limit violation: {0:?}")]
    RiskDenied(Vec<Rejection>),

    #[error("meta-layer rejected signal: {0}")]
    MetaRejected(String),

    #[error("trading disabled by kill-switch: {reason}")]
    KillSwitchActive { reason: String },

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transient transport error after retries: {0}")]
    Transient(String),

    #[error("exchange auth/signature error: {0}")]
    Auth(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
