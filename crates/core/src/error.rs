//! Error taxonomy for the multipath core.
//!
//! Each variant names one of the semantic categories the engine must
//! distinguish, not an implementation detail. Call sites that only need to
//! propagate a failure upward use `anyhow::Result`; call sites that branch
//! on the failure category match on [`CoreError`] directly.

use thiserror::Error;

/// Semantic error categories shared by the reconciliation engine, the
/// configuration resolver, and the persistence stores.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The queried kernel object or file does not exist.
    #[error("not present: {0}")]
    NotPresent(String),

    /// The target is in use (open-count > 0, or the advisory lock is held).
    #[error("busy: {0}")]
    Busy(String),

    /// A transient SCSI condition (unit attention, not-ready-becoming-ready).
    #[error("transient I/O condition: {0}")]
    TransientIo(String),

    /// SCSI reservation conflict (status 0x18).
    #[error("reservation conflict")]
    ReservationConflict,

    /// The target rejected the command as an illegal request or unsupported
    /// opcode.
    #[error("illegal request: {0}")]
    IllegalRequest(String),

    /// A configuration entry was syntactically or semantically invalid.
    /// The offending entry is discarded; parsing continues.
    #[error("configuration error: {0}")]
    Config(String),

    /// Kernel device-mapper communication failure, out-of-memory, or
    /// inconsistent internal state. The current operation must be aborted.
    #[error("fatal: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl CoreError {
    /// True when this error should be treated as success by callers doing a
    /// flush/remove operation.
    pub fn is_not_present(&self) -> bool {
        matches!(self, CoreError::NotPresent(_))
    }
}

/// A non-fatal problem discovered while parsing a configuration source.
///
/// Collected alongside a successfully parsed (partial) [`crate::config::Config`]
/// rather than aborting the load ( / `ConfigError` entries are
/// discarded and logged, not fatal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    /// Path or origin tag of the source file the warning came from.
    pub source: String,
    /// Human-readable description of the problem.
    pub message: String,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.source, self.message)
    }
}
