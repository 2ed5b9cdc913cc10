//! Runtime event stream payloads.

use crate::types::{OperationState, RestorationId, TabletId};

/// Events emitted from the single-writer coordinator loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// A restoration was accepted.
    Created {
        /// New restoration id.
        restoration_id: RestorationId,
    },
    /// A tablet restore RPC was handed to the executor.
    Dispatched {
        /// Owning restoration.
        restoration_id: RestorationId,
        /// Target tablet.
        tablet_id: TabletId,
    },
    /// A tablet reported a result that changed its state.
    TabletFinished {
        /// Owning restoration.
        restoration_id: RestorationId,
        /// Reporting tablet.
        tablet_id: TabletId,
        /// False when the RPC failed.
        ok: bool,
    },
    /// The aggregate state of a restoration changed.
    StateChanged {
        /// Restoration id.
        restoration_id: RestorationId,
        /// New aggregate state.
        state: OperationState,
    },
    /// The log acknowledged this version of a restoration.
    DurableUpTo {
        /// Restoration id.
        restoration_id: RestorationId,
        /// Highest version known durable.
        version: u64,
    },
}
