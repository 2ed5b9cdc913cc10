//! Tablet restore RPC descriptors and their completion status.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DbOid, HybridTime, RestorationId, ScheduleId, SnapshotId, TabletId};

/// One restore RPC to be issued against a tablet server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletRestoreOp {
    /// Target tablet.
    pub tablet_id: TabletId,
    /// Owning restoration.
    pub restoration_id: RestorationId,
    /// Snapshot being restored.
    pub snapshot_id: SnapshotId,
    /// Point in time the tablet data must reflect.
    pub restore_at: HybridTime,
    /// True when the restoration also rewrites catalog metadata.
    pub sys_catalog_restore_needed: bool,
    /// False when the tablet did not exist in the snapshot, so the tablet
    /// server must also drop data outside of it.
    pub is_tablet_part_of_snapshot: bool,
    /// Restrict the restore to one database.
    pub db_oid: Option<DbOid>,
    /// Schedule that produced the snapshot, nil for ad hoc restores.
    pub schedule_id: ScheduleId,
}

/// Failure codes reported for a tablet restore RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TabletErrorCode {
    /// Restoration was cancelled or superseded by a newer one.
    Aborted,
    /// Snapshot data is gone from the tablet server.
    InvalidSnapshot,
    /// RPC deadline expired.
    TimedOut,
    /// Transport-level failure.
    NetworkError,
    /// Tablet or leader temporarily unavailable.
    ServiceUnavailable,
    /// The RPC was dropped before reporting a result.
    Abandoned,
    /// Any other server-side error.
    Internal,
}

/// Whether a failed tablet may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retried by a later dispatch cycle.
    Retryable,
    /// Fails the whole restoration.
    Terminal,
}

/// Error stored per tablet and persisted with the restoration.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct TabletError {
    /// Failure code.
    pub code: TabletErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl TabletError {
    /// Builds an error with `code` and `message`.
    pub fn new(code: TabletErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Terminal iff the restore was aborted or the snapshot is no longer
    /// available on the tablet server.
    pub fn class(&self) -> FailureClass {
        match self.code {
            TabletErrorCode::Aborted | TabletErrorCode::InvalidSnapshot => FailureClass::Terminal,
            TabletErrorCode::TimedOut
            | TabletErrorCode::NetworkError
            | TabletErrorCode::ServiceUnavailable
            | TabletErrorCode::Abandoned
            | TabletErrorCode::Internal => FailureClass::Retryable,
        }
    }

    /// Shorthand for `class() == FailureClass::Terminal`.
    pub fn is_terminal(&self) -> bool {
        self.class() == FailureClass::Terminal
    }
}

/// Outcome of one tablet restore RPC.
pub type TabletStatus = Result<(), TabletError>;

/// True when `status` must fail the restoration permanently.
pub fn is_terminal_failure(status: &TabletStatus) -> bool {
    status.as_ref().err().is_some_and(TabletError::is_terminal)
}
