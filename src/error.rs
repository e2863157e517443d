// 🚨 Error taxonomy for the reconciliation engine
//
// Two layers:
// - StoreError: what a collaborator store reports
// - ReconciliationError: what an engine operation reports to its caller
//
// Every ReconciliationError is either "nothing changed" or "partially applied,
// safe to retry". There is no third outcome.

use crate::entities::LocationType;
use crate::merge::MergeStep;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// STORE ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// A conditional write lost a race with another writer
    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// VALIDATION ERRORS (rejected before any mutation)
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("keeper {keeper_id} is not a member of the group")]
    KeeperNotInGroup { keeper_id: String },

    #[error("unknown location: {0}")]
    UnknownLocation(String),

    #[error("duplicate group has no members")]
    EmptyGroup,

    #[error("{child} ({child_type}) cannot have {parent} ({parent_type}) as parent")]
    InvalidHierarchy {
        child: String,
        child_type: LocationType,
        parent: String,
        parent_type: LocationType,
    },

    #[error("parent {0} is not active")]
    ParentNotActive(String),

    #[error("location {0} is tombstoned")]
    Tombstoned(String),

    #[error("invalid variant rule: {0}")]
    InvalidRule(String),
}

// ============================================================================
// RECONCILIATION ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A member changed since detection. Re-run detection, then retry.
    #[error("location {id} was modified concurrently: {reason}")]
    ConcurrentModification {
        id: String,
        reason: String,
        partially_applied: bool,
    },

    #[error("persistence failed during {step}: {source}")]
    Persistence {
        step: MergeStep,
        partially_applied: bool,
        #[source]
        source: StoreError,
    },

    #[error("merge deadline of {timeout:?} exceeded before {step}")]
    Timeout {
        step: MergeStep,
        timeout: Duration,
        partially_applied: bool,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ReconciliationError {
    /// True when some merge step already wrote to a store before the failure.
    /// Those writes are idempotent, so the same call can be retried.
    pub fn partially_applied(&self) -> bool {
        match self {
            ReconciliationError::ConcurrentModification {
                partially_applied, ..
            }
            | ReconciliationError::Persistence {
                partially_applied, ..
            }
            | ReconciliationError::Timeout {
                partially_applied, ..
            } => *partially_applied,
            _ => false,
        }
    }

    /// Validation and configuration problems need corrected input; everything else
    /// can be retried as-is (possibly after re-running detection).
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ReconciliationError::Validation(_) | ReconciliationError::Config(_)
        )
    }
}

pub type ReconciliationResult<T> = Result<T, ReconciliationError>;
