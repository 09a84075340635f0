//! Dispatch-layer error taxonomy
//!
//! Collaborator-reported outcomes (no face detected, spoof suspected, ...)
//! are NOT errors at this layer: they travel inside the result document of a
//! successful dispatch. Everything here short-circuits the dispatch itself.

use thiserror::Error;

/// Failures the session/dispatch core can detect and report itself.
#[derive(Debug, Error)]
pub enum FacegateError {
    #[error("unknown or destroyed session handle")]
    InvalidHandle,

    #[error("invalid session settings: {0}")]
    InvalidSettings(String),

    #[error("invalid configuration document: {0}")]
    InvalidConfiguration(String),

    #[error("invalid billing configuration: {0}")]
    InvalidBillingConfig(String),

    #[error("operation cap reached for '{kind}' (cap {cap})")]
    BillingCapExceeded { kind: &'static str, cap: u64 },

    #[error("inference did not complete within {timeout_ms} ms")]
    InferenceTimeout { timeout_ms: u64 },

    #[error("failed to allocate output: {0}")]
    AllocationFailure(String),

    #[error("buffer was not issued by this library or was already released")]
    BufferProvenance,

    #[error("inference collaborator failed: {0}")]
    InferenceFailed(anyhow::Error),
}

impl FacegateError {
    /// Stable negative code for the legacy signed return convention:
    /// a call returns either a strictly positive transaction id or one of
    /// these.
    pub fn status_code(&self) -> i32 {
        match self {
            FacegateError::InvalidHandle => -1,
            FacegateError::InvalidSettings(_) => -2,
            FacegateError::InvalidConfiguration(_) => -3,
            FacegateError::InvalidBillingConfig(_) => -4,
            FacegateError::BillingCapExceeded { .. } => -5,
            FacegateError::InferenceTimeout { .. } => -6,
            FacegateError::AllocationFailure(_) => -7,
            FacegateError::BufferProvenance => -8,
            FacegateError::InferenceFailed(_) => -9,
        }
    }

    /// Discriminator name used in result documents.
    pub fn status_name(&self) -> &'static str {
        match self {
            FacegateError::InvalidHandle => "invalid_handle",
            FacegateError::InvalidSettings(_) => "invalid_settings",
            FacegateError::InvalidConfiguration(_) => "invalid_configuration",
            FacegateError::InvalidBillingConfig(_) => "invalid_billing_config",
            FacegateError::BillingCapExceeded { .. } => "billing_cap_exceeded",
            FacegateError::InferenceTimeout { .. } => "inference_timeout",
            FacegateError::AllocationFailure(_) => "allocation_failure",
            FacegateError::BufferProvenance => "buffer_provenance",
            FacegateError::InferenceFailed(_) => "inference_failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, FacegateError>;
