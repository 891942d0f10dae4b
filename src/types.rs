//! Crate-wide error taxonomy and result alias.
//!
//! Low-level fetch wrappers never let network or parse failures escape as
//! panics. They surface as `VestiaryError` values so the calling layer can
//! choose fallback behavior deliberately (stale reuse, degrade-to-empty,
//! abort-the-cycle).

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, VestiaryError>;

/// Error types for entitlement resolution
#[derive(Debug, Error)]
pub enum VestiaryError {
    /// A single page, pointer batch or provider source failed.
    /// Recorded by the caller, does not abort the larger operation.
    #[error("Fetch failed: {0}")]
    TransientFetch(String),

    /// Constructing an HTTP client failed at startup
    #[error("HTTP client construction failed: {0}")]
    ClientBuild(String),

    /// Both provider registry sources failed and no stale value exists
    #[error("Third-party providers unavailable: {0}")]
    ProvidersUnavailable(String),

    /// The content server never reported the expected sync state
    /// within the warmer's retry budget
    #[error("Content server not ready after {attempts} attempts")]
    ReadinessTimeout { attempts: u32 },

    /// A warm cycle was requested while another is still running
    #[error("Warm cycle already in progress")]
    WarmInProgress,

    /// The warmer is configured off
    #[error("Cache warmer is disabled")]
    WarmerDisabled,

    /// Building profiles for a batch of addresses failed.
    /// The whole batch collapses to an empty result, never a partial one.
    #[error("Profile reconciliation failed: {0}")]
    Reconciliation(String),
}
