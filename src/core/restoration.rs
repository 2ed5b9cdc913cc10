//! Restoration record: tablet progress, throttling, aggregation and the
//! persisted form.

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::{
    op::{TabletRestoreOp, TabletStatus},
    persist::codec::{self, CodecError, KeyValuePair, MasterMetadataEntry, SysRestorationEntry},
    types::{
        HybridTime, ObjectId, OperationState, RestorationId, ScheduleId, SnapshotId,
        SysRowEntryType, TabletState,
    },
};

use super::{
    context::{CoordinatorContext, SnapshotInfo},
    state::{DispatchScope, TabletOperationState},
    tablets::{ResultTransition, TabletProgressSet},
    throttle::Throttler,
};

/// Status snapshot of one restoration for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorationInfo {
    /// Restoration id.
    pub id: RestorationId,
    /// Current in-memory state in persisted form.
    pub entry: SysRestorationEntry,
    /// Highest version acknowledged by the log; 0 before the first write.
    pub durable_version: u64,
}

/// Mutable state of one restoration. Owned by a single coordinator loop.
pub struct RestorationState {
    context: Arc<dyn CoordinatorContext>,
    restoration_id: RestorationId,
    snapshot_id: SnapshotId,
    schedule_id: ScheduleId,
    is_sys_catalog_restored: bool,
    restore_at: HybridTime,
    complete_time: Option<HybridTime>,
    master_metadata: HashMap<ObjectId, SysRowEntryType>,
    tablets: TabletProgressSet,
    throttler: Throttler,
    version: u64,
    durable_version: u64,
    durable_state: OperationState,
    log_prefix: String,
}

impl fmt::Debug for RestorationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestorationState")
            .field("restoration_id", &self.restoration_id)
            .field("snapshot_id", &self.snapshot_id)
            .field("schedule_id", &self.schedule_id)
            .field("restore_at", &self.restore_at)
            .field("version", &self.version)
            .field("durable_version", &self.durable_version)
            .field("tablets", &self.tablets)
            .finish_non_exhaustive()
    }
}

impl RestorationState {
    /// Starts a restoration of every tablet that completed in `snapshot`.
    pub fn new(
        context: Arc<dyn CoordinatorContext>,
        restoration_id: RestorationId,
        snapshot: &SnapshotInfo,
        restore_at: HybridTime,
        is_sys_catalog_restored: bool,
        throttle_limit: u64,
    ) -> Self {
        let tablets = TabletProgressSet::from_ids(
            snapshot
                .tablet_ids_in_state(OperationState::Complete)
                .cloned(),
        );
        let log_prefix = make_log_prefix(
            &restoration_id,
            Some((&snapshot.id, &snapshot.schedule_id)),
        );
        info!(
            "{log_prefix}created, {} tablets, restore at {restore_at}, throttle limit {throttle_limit}",
            tablets.len()
        );
        Self {
            context,
            restoration_id,
            snapshot_id: snapshot.id,
            schedule_id: snapshot.schedule_id,
            is_sys_catalog_restored,
            restore_at,
            complete_time: None,
            master_metadata: HashMap::new(),
            tablets,
            throttler: Throttler::new(throttle_limit),
            version: 1,
            durable_version: 0,
            durable_state: OperationState::Restoring,
            log_prefix,
        }
    }

    /// Rebuilds a restoration from its last persisted entry.
    ///
    /// Snapshot and schedule ids that fail to decode are replaced with nil
    /// and logged; the rest of the record stays usable.
    pub fn from_entry(
        context: Arc<dyn CoordinatorContext>,
        restoration_id: RestorationId,
        entry: SysRestorationEntry,
        throttle_limit: u64,
    ) -> Self {
        let snapshot_id = SnapshotId::from_slice(&entry.snapshot_id);
        let schedule_id = if entry.schedule_id.is_empty() {
            Ok(ScheduleId::nil())
        } else {
            ScheduleId::from_slice(&entry.schedule_id)
        };
        let log_prefix = match (&snapshot_id, &schedule_id) {
            (Ok(snapshot), Ok(schedule)) => {
                make_log_prefix(&restoration_id, Some((snapshot, schedule)))
            }
            _ => make_log_prefix(&restoration_id, None),
        };
        let snapshot_id = snapshot_id.unwrap_or_else(|err| {
            warn!("{log_prefix}cannot decode snapshot id, using nil: {err}");
            SnapshotId::nil()
        });
        let schedule_id = schedule_id.unwrap_or_else(|err| {
            warn!("{log_prefix}cannot decode schedule id, using nil: {err}");
            ScheduleId::nil()
        });

        let complete_time = entry.complete_time_ht.and_then(|raw| {
            let ht = HybridTime::from_u64(raw);
            if ht.is_valid() {
                Some(ht)
            } else {
                warn!("{log_prefix}error loading complete time {raw}");
                None
            }
        });

        let master_metadata = entry
            .master_metadata
            .into_iter()
            .map(|m| (m.id, m.entry_type))
            .collect();

        let state = Self {
            context,
            restoration_id,
            snapshot_id,
            schedule_id,
            is_sys_catalog_restored: entry.is_sys_catalog_restored,
            restore_at: HybridTime::from_u64(entry.restore_at_ht),
            complete_time,
            master_metadata,
            tablets: TabletProgressSet::from_progress(entry.tablet_restorations),
            throttler: Throttler::new(throttle_limit),
            version: entry.version,
            durable_version: entry.version,
            durable_state: entry.state,
            log_prefix,
        };
        debug!(
            "{}loaded version {} as {:?}",
            state.log_prefix, state.version, entry.state
        );
        state
    }

    /// Decodes a log pair and rebuilds the restoration it holds.
    pub fn load_from_persisted(
        context: Arc<dyn CoordinatorContext>,
        pair: &KeyValuePair,
        throttle_limit: u64,
    ) -> Result<Self, CodecError> {
        let (restoration_id, entry) = codec::decode_restoration(pair)?;
        Ok(Self::from_entry(context, restoration_id, entry, throttle_limit))
    }

    /// Restoration id.
    pub fn restoration_id(&self) -> RestorationId {
        self.restoration_id
    }

    /// Source snapshot; nil if the persisted id could not be decoded.
    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    /// `None` for ad hoc restorations.
    pub fn schedule_id(&self) -> Option<ScheduleId> {
        (!self.schedule_id.is_nil()).then_some(self.schedule_id)
    }

    /// Point in time tablets are restored to.
    pub fn restore_at(&self) -> HybridTime {
        self.restore_at
    }

    /// True when catalog metadata is restored along with tablet data.
    pub fn is_sys_catalog_restored(&self) -> bool {
        self.is_sys_catalog_restored
    }

    /// Set once, when every tablet is done.
    pub fn complete_time(&self) -> Option<HybridTime> {
        self.complete_time
    }

    /// Version of the last encoded record.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Highest version the log acknowledged.
    pub fn durable_version(&self) -> u64 {
        self.durable_version
    }

    /// Per-tablet progress.
    pub fn tablets(&self) -> &TabletProgressSet {
        &self.tablets
    }

    /// In-flight RPC accounting.
    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    /// `Restoration[...]: ` prefix used in every log line.
    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    /// Catalog objects touched by this restoration.
    pub fn master_metadata(&self) -> &HashMap<ObjectId, SysRowEntryType> {
        &self.master_metadata
    }

    /// Records a catalog object touched by this restoration.
    pub fn add_master_metadata(&mut self, id: impl Into<ObjectId>, entry_type: SysRowEntryType) {
        self.master_metadata.insert(id.into(), entry_type);
    }

    /// Aggregate state without side effects.
    pub fn state(&self) -> OperationState {
        if self.tablets.terminal_error().is_some() {
            OperationState::Failed
        } else if self.tablets.all_done() {
            OperationState::Complete
        } else {
            OperationState::Restoring
        }
    }

    /// Dispatches the next batch: tablets in ascending id order, stopping at
    /// the first throttle refusal.
    pub fn prepare_operations(&mut self, scope: &DispatchScope) -> Vec<TabletRestoreOp> {
        let mut ops = Vec::new();
        for tablet_id in self.tablets.dispatchable_ids() {
            if !self.throttler.try_acquire() {
                debug!(
                    "{}throttled with {} RPCs in flight",
                    self.log_prefix,
                    self.throttler.in_flight()
                );
                break;
            }
            self.tablets.mark_dispatched(&tablet_id);
            ops.push(TabletRestoreOp {
                is_tablet_part_of_snapshot: scope.snapshot_tablets.contains(&tablet_id),
                tablet_id,
                restoration_id: self.restoration_id,
                snapshot_id: self.snapshot_id,
                restore_at: self.restore_at,
                sys_catalog_restore_needed: !self.schedule_id.is_nil(),
                db_oid: scope.db_oid,
                schedule_id: self.schedule_id,
            });
        }
        if !ops.is_empty() {
            debug!("{}dispatching {} tablet restores", self.log_prefix, ops.len());
        }
        ops
    }

    /// Applies the outcome of one tablet RPC.
    ///
    /// # Panics
    ///
    /// If `tablet_id` does not belong to this restoration.
    pub fn mark_tablet_result(&mut self, tablet_id: &str, status: TabletStatus) -> ResultTransition {
        assert!(
            self.tablets.contains(tablet_id),
            "{}result for unknown tablet {tablet_id}",
            self.log_prefix
        );
        let failure = status.as_ref().err().cloned();
        let transition = self.tablets.mark_result(tablet_id, status);
        if transition.previous == TabletState::Dispatched {
            self.throttler.release();
        }
        if !transition.applied {
            debug!(
                "{}ignored result for tablet {tablet_id} in state {:?}",
                self.log_prefix, transition.previous
            );
        } else if let Some(err) = failure {
            if err.is_terminal() {
                warn!("{}tablet {tablet_id} failed terminally: {err}", self.log_prefix);
            } else {
                info!("{}tablet {tablet_id} failed, will retry: {err}", self.log_prefix);
            }
        }
        transition
    }

    /// Recomputes the aggregate state, stamping the completion time the
    /// first time every tablet is done.
    pub fn aggregate(&mut self) -> OperationState {
        let state = self.state();
        if state == OperationState::Complete && self.complete_time.is_none() {
            let now = self.context.now();
            info!("{}complete at {now}", self.log_prefix);
            self.complete_time = Some(now);
        }
        state
    }

    /// Persisted form of the current state. Does not bump the version.
    pub fn to_entry(&self) -> SysRestorationEntry {
        let tablet_restorations = self
            .tablets
            .iter()
            .map(|t| {
                let mut t = t.clone();
                if t.state == TabletState::Dispatched {
                    t.state = TabletState::Pending;
                }
                t
            })
            .collect();
        let mut master_metadata: Vec<_> = self
            .master_metadata
            .iter()
            .map(|(id, entry_type)| MasterMetadataEntry {
                id: id.clone(),
                entry_type: *entry_type,
            })
            .collect();
        master_metadata.sort_by(|a, b| a.id.cmp(&b.id));

        SysRestorationEntry {
            state: self.state(),
            tablet_restorations,
            snapshot_id: self.snapshot_id.as_bytes().to_vec(),
            schedule_id: self.schedule_id.as_bytes().to_vec(),
            is_sys_catalog_restored: self.is_sys_catalog_restored,
            restore_at_ht: self.restore_at.to_u64(),
            version: self.version,
            complete_time_ht: self.complete_time.map(HybridTime::to_u64),
            master_metadata,
        }
    }

    /// Reporting view of the current state.
    pub fn to_info(&self) -> RestorationInfo {
        RestorationInfo {
            id: self.restoration_id,
            entry: self.to_entry(),
            durable_version: self.durable_version,
        }
    }

    /// Records that the log holds `version`, encoded with aggregate `state`.
    /// Returns the new state when it differs from the previously durable one.
    /// Stale acknowledgements are ignored.
    pub fn mark_durable(&mut self, version: u64, state: OperationState) -> Option<OperationState> {
        if version <= self.durable_version {
            return None;
        }
        self.durable_version = version;
        let changed = self.durable_state != state;
        self.durable_state = state;
        changed.then_some(state)
    }

    /// Bumps the version and encodes the record. The result must reach the
    /// log before the new state is treated as durable.
    pub fn store_to_key_value_pair(&mut self) -> Result<KeyValuePair, CodecError> {
        self.version += 1;
        self.aggregate();
        codec::encode_restoration(&self.restoration_id, &self.to_entry())
    }
}

impl TabletOperationState for RestorationState {
    type Op = TabletRestoreOp;

    fn prepare_operations(&mut self, scope: &DispatchScope) -> Vec<TabletRestoreOp> {
        RestorationState::prepare_operations(self, scope)
    }

    fn aggregate(&mut self) -> OperationState {
        RestorationState::aggregate(self)
    }

    fn store_to_key_value_pair(&mut self) -> Result<KeyValuePair, CodecError> {
        RestorationState::store_to_key_value_pair(self)
    }
}

fn make_log_prefix(
    restoration_id: &RestorationId,
    ids: Option<(&SnapshotId, &ScheduleId)>,
) -> String {
    match ids {
        Some((snapshot, schedule)) if !schedule.is_nil() => {
            format!("Restoration[{restoration_id}/{snapshot}/{schedule}]: ")
        }
        Some((snapshot, _)) => format!("Restoration[{restoration_id}/{snapshot}]: "),
        None => format!("Restoration[{restoration_id}]: "),
    }
}
