use std::collections::BTreeSet;
use std::sync::Arc;

use hashbrown::HashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    op::{TabletRestoreOp, TabletStatus},
    persist::{
        RecordSink,
        codec::{self, CodecError, KeyValuePair},
    },
    types::{DbOid, HybridTime, OperationState, RestorationId, SnapshotId, SysRowEntryType},
};

use super::{
    context::{CoordinatorContext, SnapshotInfo},
    restoration::{RestorationInfo, RestorationState},
    state::{DispatchScope, TabletOperationState},
    tablets::ResultTransition,
    throttle::ThrottleConfig,
};

/// Registry errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No restoration with this id.
    #[error("unknown restoration {0}")]
    MissingRestoration(RestorationId),
    /// Id collision on insert.
    #[error("restoration {0} already exists")]
    AlreadyExists(RestorationId),
    /// The context does not know the snapshot to restore.
    #[error("unknown snapshot {0}")]
    MissingSnapshot(SnapshotId),
    /// Encoding a record failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One encoded record ready for the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    /// Owning restoration.
    pub restoration_id: RestorationId,
    /// Version carried by `pair`.
    pub version: u64,
    /// Aggregate state carried by `pair`.
    pub state: OperationState,
    /// Encoded record.
    pub pair: KeyValuePair,
}

/// Outcome of feeding one tablet result into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabletOutcome {
    /// Tablet-level effect.
    pub transition: ResultTransition,
    /// Aggregate state afterwards.
    pub state: OperationState,
}

/// Every restoration known to this leader, plus which ones changed since
/// the last drain.
pub struct RestorationStore {
    context: Arc<dyn CoordinatorContext>,
    throttle: ThrottleConfig,
    records: HashMap<RestorationId, RestorationState>,
    db_scopes: HashMap<RestorationId, DbOid>,
    dirty: BTreeSet<RestorationId>,
}

impl RestorationStore {
    /// Empty registry.
    pub fn new(context: Arc<dyn CoordinatorContext>, throttle: ThrottleConfig) -> Self {
        Self {
            context,
            throttle,
            records: HashMap::new(),
            db_scopes: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Rebuilds every restoration from the log, keeping the highest version
    /// per id. Records that fail structural decoding are skipped.
    pub fn load_from_sink(
        context: Arc<dyn CoordinatorContext>,
        throttle: ThrottleConfig,
        sink: &dyn RecordSink,
    ) -> crate::persist::PersistResult<Self> {
        let mut store = Self::new(context, throttle);
        for pair in sink.load_pairs(SysRowEntryType::SnapshotRestoration)? {
            store.apply_persisted(&pair);
        }
        info!(restorations = store.records.len(), "loaded restorations from log");
        Ok(store)
    }

    /// Feeds one persisted pair. A version older than the one held is
    /// ignored; an equal version replaces it.
    pub fn apply_persisted(&mut self, pair: &KeyValuePair) {
        let (restoration_id, entry) = match codec::decode_restoration(pair) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "skipping undecodable restoration record");
                return;
            }
        };
        if let Some(existing) = self.records.get(&restoration_id) {
            if existing.version() > entry.version {
                return;
            }
        }
        let limit = self.throttle_limit();
        let state = RestorationState::from_entry(
            Arc::clone(&self.context),
            restoration_id,
            entry,
            limit,
        );
        self.records.insert(restoration_id, state);
    }

    /// Starts restoring `snapshot` to `restore_at`. Catalog restore is
    /// requested whenever the snapshot came from a schedule.
    pub fn create(
        &mut self,
        snapshot: &SnapshotInfo,
        restore_at: HybridTime,
        db_oid: Option<DbOid>,
    ) -> Result<RestorationId, StoreError> {
        let restoration_id = RestorationId::random();
        self.insert_new(restoration_id, snapshot, restore_at, db_oid)?;
        Ok(restoration_id)
    }

    /// Looks up `snapshot_id` through the context and creates a restoration
    /// of it.
    pub fn start(
        &mut self,
        snapshot_id: &SnapshotId,
        restore_at: HybridTime,
        db_oid: Option<DbOid>,
    ) -> Result<RestorationId, StoreError> {
        let snapshot = self
            .context
            .snapshot(snapshot_id)
            .ok_or(StoreError::MissingSnapshot(*snapshot_id))?;
        self.create(&snapshot, restore_at, db_oid)
    }

    /// Like [`RestorationStore::create`] with a caller-chosen id.
    pub fn insert_new(
        &mut self,
        restoration_id: RestorationId,
        snapshot: &SnapshotInfo,
        restore_at: HybridTime,
        db_oid: Option<DbOid>,
    ) -> Result<(), StoreError> {
        if self.records.contains_key(&restoration_id) {
            return Err(StoreError::AlreadyExists(restoration_id));
        }
        let state = RestorationState::new(
            Arc::clone(&self.context),
            restoration_id,
            snapshot,
            restore_at,
            !snapshot.schedule_id.is_nil(),
            self.throttle_limit(),
        );
        self.records.insert(restoration_id, state);
        if let Some(oid) = db_oid {
            self.db_scopes.insert(restoration_id, oid);
        }
        self.dirty.insert(restoration_id);
        Ok(())
    }

    /// Restoration by id.
    pub fn get(&self, id: &RestorationId) -> Option<&RestorationState> {
        self.records.get(id)
    }

    /// Mutable restoration by id.
    pub fn get_mut(&mut self, id: &RestorationId) -> Option<&mut RestorationState> {
        self.records.get_mut(id)
    }

    /// Number of restorations held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no restoration is held.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forgets a restoration that never reached the log. Returns false if
    /// the id was unknown.
    pub fn discard(&mut self, id: &RestorationId) -> bool {
        self.db_scopes.remove(id);
        self.dirty.remove(id);
        let removed = self.records.remove(id).is_some();
        if removed {
            warn!(restoration_id = %id, "discarding restoration that was never persisted");
        }
        removed
    }

    /// All ids, ascending.
    pub fn ids(&self) -> Vec<RestorationId> {
        let mut ids: Vec<_> = self.records.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Ids of restorations that still have work, ascending.
    pub fn active_ids(&self) -> Vec<RestorationId> {
        let mut ids: Vec<_> = self
            .records
            .iter()
            .filter(|(_, r)| !r.state().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Reporting view of one restoration.
    pub fn info(&self, id: &RestorationId) -> Option<RestorationInfo> {
        self.records.get(id).map(RestorationState::to_info)
    }

    /// Reporting views of all restorations, ascending by id.
    pub fn infos(&self) -> Vec<RestorationInfo> {
        self.ids()
            .iter()
            .filter_map(|id| self.info(id))
            .collect()
    }

    /// One dispatch cycle across every active restoration. Restorations
    /// whose snapshot is no longer known are skipped this cycle.
    pub fn prepare_all(&mut self) -> Vec<TabletRestoreOp> {
        let mut ops = Vec::new();
        for id in self.active_ids() {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            let Some(snapshot) = self.context.snapshot(&record.snapshot_id()) else {
                warn!(
                    "{}snapshot {} not found, skipping dispatch",
                    record.log_prefix(),
                    record.snapshot_id()
                );
                continue;
            };
            let scope = DispatchScope {
                snapshot_tablets: snapshot.tablet_ids().cloned().collect(),
                db_oid: self.db_scopes.get(&id).copied(),
            };
            ops.extend(TabletOperationState::prepare_operations(record, &scope));
        }
        ops
    }

    /// Applies a tablet RPC result and marks the restoration dirty if its
    /// state changed.
    pub fn mark_tablet_result(
        &mut self,
        restoration_id: &RestorationId,
        tablet_id: &str,
        status: TabletStatus,
    ) -> Result<TabletOutcome, StoreError> {
        let record = self
            .records
            .get_mut(restoration_id)
            .ok_or(StoreError::MissingRestoration(*restoration_id))?;
        let transition = record.mark_tablet_result(tablet_id, status);
        let state = TabletOperationState::aggregate(record);
        if transition.applied {
            self.dirty.insert(*restoration_id);
        }
        Ok(TabletOutcome { transition, state })
    }

    /// Marks a restoration for rewrite on the next drain.
    pub fn touch(&mut self, restoration_id: &RestorationId) -> Result<(), StoreError> {
        if !self.records.contains_key(restoration_id) {
            return Err(StoreError::MissingRestoration(*restoration_id));
        }
        self.dirty.insert(*restoration_id);
        Ok(())
    }

    /// Encodes each dirty restoration exactly once, bumping its version.
    pub fn drain_pending_writes(&mut self) -> Result<Vec<PendingWrite>, StoreError> {
        let dirty = std::mem::take(&mut self.dirty);
        let mut writes = Vec::with_capacity(dirty.len());
        for restoration_id in dirty {
            let Some(record) = self.records.get_mut(&restoration_id) else {
                continue;
            };
            let pair = TabletOperationState::store_to_key_value_pair(record)?;
            writes.push(PendingWrite {
                restoration_id,
                version: record.version(),
                state: record.state(),
                pair,
            });
        }
        Ok(writes)
    }

    /// True when some restoration changed since the last drain.
    pub fn has_pending_writes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Applies a log acknowledgement. Returns the new durable aggregate
    /// state when it changed.
    pub fn mark_durable(
        &mut self,
        restoration_id: &RestorationId,
        version: u64,
        state: OperationState,
    ) -> Option<OperationState> {
        self.records
            .get_mut(restoration_id)?
            .mark_durable(version, state)
    }

    fn throttle_limit(&self) -> u64 {
        self.throttle.limit(self.context.live_tserver_count())
    }
}
