//! Seam between the coordinator and the tablet RPC transport.

use tokio::sync::mpsc;

use crate::{
    op::{TabletError, TabletErrorCode, TabletRestoreOp, TabletStatus},
    types::{RestorationId, TabletId},
};

/// Issues restore RPCs. Implementations must not block; the outcome is
/// reported later through the [`Completion`].
pub trait TabletRpcExecutor: Send + Sync + 'static {
    /// Starts `op`. Every issued op must eventually complete `completion`
    /// or drop it.
    fn issue(&self, op: TabletRestoreOp, completion: Completion);
}

#[derive(Debug)]
pub(crate) struct TabletCompletion {
    pub(crate) restoration_id: RestorationId,
    pub(crate) tablet_id: TabletId,
    pub(crate) status: TabletStatus,
}

/// One-shot callback for a dispatched tablet restore.
///
/// Dropping it without calling [`Completion::complete`] reports a retryable
/// [`TabletErrorCode::Abandoned`] failure, which frees the throttle slot.
#[derive(Debug)]
pub struct Completion {
    restoration_id: RestorationId,
    tablet_id: TabletId,
    tx: Option<mpsc::UnboundedSender<TabletCompletion>>,
}

impl Completion {
    pub(crate) fn new(
        restoration_id: RestorationId,
        tablet_id: TabletId,
        tx: mpsc::UnboundedSender<TabletCompletion>,
    ) -> Self {
        Self {
            restoration_id,
            tablet_id,
            tx: Some(tx),
        }
    }

    /// Restoration the RPC belongs to.
    pub fn restoration_id(&self) -> RestorationId {
        self.restoration_id
    }

    /// Target tablet.
    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    /// Reports the RPC outcome to the coordinator.
    pub fn complete(mut self, status: TabletStatus) {
        self.send(status);
    }

    fn send(&mut self, status: TabletStatus) {
        if let Some(tx) = self.tx.take() {
            // Coordinator gone: nothing left to update.
            let _ = tx.send(TabletCompletion {
                restoration_id: self.restoration_id,
                tablet_id: std::mem::take(&mut self.tablet_id),
                status,
            });
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.send(Err(TabletError::new(
            TabletErrorCode::Abandoned,
            "restore RPC dropped without a result",
        )));
    }
}
