use hashbrown::HashMap;

use crate::types::{HybridTime, OperationState, ScheduleId, SnapshotId, TabletId};

/// Snapshot metadata as reported by the snapshot subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Snapshot id.
    pub id: SnapshotId,
    /// Producing schedule, nil for ad hoc snapshots.
    pub schedule_id: ScheduleId,
    /// Every tablet in the snapshot with its snapshot state.
    pub tablets: Vec<(TabletId, OperationState)>,
}

impl SnapshotInfo {
    /// Tablets whose snapshot is in `state`. A restoration drives the
    /// [`OperationState::Complete`] ones.
    pub fn tablet_ids_in_state(&self, state: OperationState) -> impl Iterator<Item = &TabletId> {
        self.tablets
            .iter()
            .filter(move |(_, s)| *s == state)
            .map(|(id, _)| id)
    }

    /// Every tablet in the snapshot.
    pub fn tablet_ids(&self) -> impl Iterator<Item = &TabletId> {
        self.tablets.iter().map(|(id, _)| id)
    }
}

/// Services the coordinator consults but does not own: snapshot lookup,
/// cluster membership and the clock.
pub trait CoordinatorContext: Send + Sync {
    /// Looks up a snapshot by id.
    fn snapshot(&self, id: &SnapshotId) -> Option<SnapshotInfo>;

    /// Number of live tablet servers, excluding read replicas. `None` when
    /// the cluster config is not available.
    fn live_tserver_count(&self) -> Option<usize>;

    /// Current hybrid time.
    fn now(&self) -> HybridTime {
        HybridTime::now()
    }
}

/// Fixed in-memory context for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    snapshots: HashMap<SnapshotId, SnapshotInfo>,
    live_tservers: Option<usize>,
}

impl StaticContext {
    /// Empty context reporting `live_tservers` live servers.
    pub fn new(live_tservers: Option<usize>) -> Self {
        Self {
            snapshots: HashMap::new(),
            live_tservers,
        }
    }

    /// Registers `snapshot`, replacing any previous one with the same id.
    pub fn with_snapshot(mut self, snapshot: SnapshotInfo) -> Self {
        self.snapshots.insert(snapshot.id, snapshot);
        self
    }
}

impl CoordinatorContext for StaticContext {
    fn snapshot(&self, id: &SnapshotId) -> Option<SnapshotInfo> {
        self.snapshots.get(id).cloned()
    }

    fn live_tserver_count(&self) -> Option<usize> {
        self.live_tservers
    }
}
