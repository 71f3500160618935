//! Error types for the reconciliation engine.

use thiserror::Error;

/// Errors raised while observing, planning or repairing.
#[derive(Debug, Error)]
pub enum NannyError {
    /// An upstream could not be reached or answered with a transient error.
    #[error("upstream {upstream} unavailable: {msg}")]
    Unavailable {
        /// Upstream name (compute-db, storage-db, vmgr, array, ...).
        upstream: String,
        /// What went wrong.
        msg: String,
    },

    /// Observed data violates a documented invariant.
    #[error("structural anomaly: {msg}")]
    Structural {
        /// Description of the violated invariant.
        msg: String,
    },

    /// A critical upstream returned an empty inventory.
    #[error("upstream {upstream} returned an empty inventory")]
    EmptyInventory {
        /// Upstream name.
        upstream: String,
    },

    /// A repair could not be applied.
    #[error("repair failed: {msg}")]
    Repair {
        /// Description of the failure.
        msg: String,
    },

    /// A mutation matched no rows.
    #[error("update on {table} affected no rows for key {key}")]
    NoRowsAffected {
        /// Table the update ran against.
        table: String,
        /// Row key.
        key: String,
    },

    /// The upstream needed by an action is not configured for this nanny.
    #[error("upstream {0} is not configured")]
    NotConfigured(String),

    /// Unrecoverable condition.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl NannyError {
    /// Shorthand for [`NannyError::Unavailable`].
    pub fn unavailable(upstream: impl Into<String>, msg: impl ToString) -> Self {
        NannyError::Unavailable {
            upstream: upstream.into(),
            msg: msg.to_string(),
        }
    }

    /// Shorthand for [`NannyError::Repair`].
    pub fn repair(msg: impl ToString) -> Self {
        NannyError::Repair {
            msg: msg.to_string(),
        }
    }

    /// True for failures that should only cost the current cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NannyError::Unavailable { .. } | NannyError::EmptyInventory { .. }
        )
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, NannyError>;
