//! Setup-time error taxonomy.
//!
//! `EngineError` covers everything that can go wrong *before* an optimization
//! run starts evolving: bad configuration, an ill-formed reaction network or
//! experiment curve, and a fit objective that fails its serialization
//! preflight. Per-candidate numerical failures are deliberately **not** part
//! of this type: they are represented by [`crate::ode::IntegrationFailure`]
//! and folded into a penalty score inside the objective, so the optimizer
//! never sees them.

/// Errors surfaced to the caller at setup time or as a run-fatal condition.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An optimizer or solver configuration value is out of its valid range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The reaction network is structurally invalid.
    #[error("invalid reaction network: {0}")]
    Network(String),

    /// An experiment curve is malformed.
    #[error("invalid experiment curve: {0}")]
    Curve(String),

    /// The fit objective did not survive a serialization round trip.
    ///
    /// This indicates a configuration defect (the objective could not be
    /// reconstructed on a worker), so it is fatal and reported before any
    /// generation starts.
    #[error("objective failed serialization preflight: {0}")]
    Serialization(String),

    /// The optimizer run itself failed (e.g. the driver thread panicked).
    #[error("optimization run failed: {0}")]
    Run(String),
}
