use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use snaprestore::{
    core::{
        context::{SnapshotInfo, StaticContext},
        store::{RestorationStore, StoreError},
        throttle::ThrottleConfig,
    },
    op::{TabletError, TabletErrorCode, TabletRestoreOp},
    persist::{
        LogSeq, PersistError, PersistResult, RecordSink,
        codec::{self, KeyValuePair},
        sqlite::SqliteRecordSink,
    },
    runtime::{
        events::CoordinatorEvent,
        handle::{AckMode, CoordinatorHandle, RuntimeConfig, RuntimeError, spawn_coordinator},
        rpc::{Completion, TabletRpcExecutor},
    },
    types::{HybridTime, OperationState, ScheduleId, SnapshotId, SysRowEntryType, TabletState},
};
use tempfile::tempdir;
use tokio::sync::broadcast;

#[derive(Default)]
struct RecordingExecutor {
    issued: Mutex<Vec<(TabletRestoreOp, Completion)>>,
}

impl RecordingExecutor {
    fn tablets(&self) -> Vec<String> {
        let issued = self.issued.lock().expect("lock");
        issued.iter().map(|(op, _)| op.tablet_id.clone()).collect()
    }

    fn take(&self, tablet_id: &str) -> Completion {
        let mut issued = self.issued.lock().expect("lock");
        let pos = issued
            .iter()
            .position(|(op, _)| op.tablet_id == tablet_id)
            .expect("tablet was dispatched");
        issued.remove(pos).1
    }
}

impl TabletRpcExecutor for RecordingExecutor {
    fn issue(&self, op: TabletRestoreOp, completion: Completion) {
        self.issued.lock().expect("lock").push((op, completion));
    }
}

/// In-memory log that rejects appends while `failing` is set.
#[derive(Clone, Default)]
struct FlakySink {
    failing: Arc<AtomicBool>,
    rows: Arc<Mutex<Vec<KeyValuePair>>>,
}

impl FlakySink {
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn rows(&self) -> Vec<KeyValuePair> {
        self.rows.lock().expect("lock").clone()
    }
}

impl RecordSink for FlakySink {
    fn append_pairs(&mut self, pairs: &[KeyValuePair]) -> PersistResult<LogSeq> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistError::Message("sys catalog unavailable".to_string()));
        }
        let mut rows = self.rows.lock().expect("lock");
        rows.extend_from_slice(pairs);
        Ok(rows.len() as LogSeq)
    }

    fn load_pairs(&self, entry_type: SysRowEntryType) -> PersistResult<Vec<KeyValuePair>> {
        let rows = self.rows.lock().expect("lock");
        Ok(rows
            .iter()
            .filter(|p| codec::decode_key(&p.key).is_ok_and(|(t, _)| t == entry_type))
            .cloned()
            .collect())
    }
}

fn snapshot() -> SnapshotInfo {
    SnapshotInfo {
        id: SnapshotId::random(),
        schedule_id: ScheduleId::nil(),
        tablets: ["A", "B", "C"]
            .iter()
            .map(|t| (t.to_string(), OperationState::Complete))
            .collect(),
    }
}

fn store(snapshot: &SnapshotInfo) -> RestorationStore {
    RestorationStore::new(
        Arc::new(StaticContext::new(Some(3)).with_snapshot(snapshot.clone())),
        throttle(),
    )
}

fn throttle() -> ThrottleConfig {
    ThrottleConfig {
        max_concurrent_rpcs: Some(2),
        ..ThrottleConfig::default()
    }
}

fn config() -> RuntimeConfig {
    RuntimeConfig {
        poll_interval_ms: 60_000,
        ..RuntimeConfig::default()
    }
}

fn spawn(
    store: RestorationStore,
    sink: Option<SqliteRecordSink>,
) -> (CoordinatorHandle, Arc<RecordingExecutor>) {
    let executor = Arc::new(RecordingExecutor::default());
    let sink = sink.map(|s| Box::new(s) as Box<dyn RecordSink>);
    let handle = spawn_coordinator(store, sink, executor.clone(), config());
    (handle, executor)
}

fn spawn_flaky(
    store: RestorationStore,
    sink: &FlakySink,
) -> (CoordinatorHandle, Arc<RecordingExecutor>) {
    let executor = Arc::new(RecordingExecutor::default());
    let sink: Box<dyn RecordSink> = Box::new(sink.clone());
    let handle = spawn_coordinator(store, Some(sink), executor.clone(), config());
    (handle, executor)
}

async fn wait_for(
    sub: &mut broadcast::Receiver<CoordinatorEvent>,
    mut pred: impl FnMut(&CoordinatorEvent) -> bool,
) -> CoordinatorEvent {
    loop {
        let evt = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("event timeout")
            .expect("recv");
        if pred(&evt) {
            return evt;
        }
    }
}

fn dispatched(tablet: &'static str) -> impl FnMut(&CoordinatorEvent) -> bool {
    move |evt| matches!(evt, CoordinatorEvent::Dispatched { tablet_id, .. } if tablet_id == tablet)
}

#[tokio::test]
async fn restore_runs_to_completion_within_throttle() {
    let snap = snapshot();
    let (handle, executor) = spawn(store(&snap), None);
    let mut sub = handle.subscribe();

    let id = handle
        .restore(snap.id, HybridTime::from_micros(10), None)
        .await
        .expect("restore");
    let info = handle.get(id).await.expect("get").expect("restoration");
    assert_eq!(info.entry.state, OperationState::Restoring);
    assert_eq!(executor.tablets(), vec!["A", "B"]);

    assert_eq!(
        wait_for(&mut sub, |e| matches!(e, CoordinatorEvent::Created { .. })).await,
        CoordinatorEvent::Created { restoration_id: id }
    );

    executor.take("A").complete(Ok(()));
    wait_for(&mut sub, dispatched("C")).await;
    assert_eq!(executor.tablets(), vec!["B", "C"]);

    executor.take("B").complete(Ok(()));
    executor.take("C").complete(Ok(()));
    let evt = wait_for(&mut sub, |e| matches!(e, CoordinatorEvent::StateChanged { .. })).await;
    assert_eq!(
        evt,
        CoordinatorEvent::StateChanged {
            restoration_id: id,
            state: OperationState::Complete,
        }
    );

    let info = handle.get(id).await.expect("get").expect("restoration");
    assert_eq!(info.entry.state, OperationState::Complete);
    assert!(info.entry.complete_time_ht.is_some());
    assert_eq!(handle.poll().await.expect("poll"), 0);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn dropped_completion_is_retried() {
    let snap = snapshot();
    let (handle, executor) = spawn(store(&snap), None);
    let mut sub = handle.subscribe();

    let id = handle
        .restore(snap.id, HybridTime::from_micros(10), None)
        .await
        .expect("restore");
    wait_for(&mut sub, dispatched("B")).await;

    drop(executor.take("A"));
    let evt = wait_for(&mut sub, |e| {
        matches!(e, CoordinatorEvent::TabletFinished { .. })
    })
    .await;
    assert_eq!(
        evt,
        CoordinatorEvent::TabletFinished {
            restoration_id: id,
            tablet_id: "A".to_string(),
            ok: false,
        }
    );
    wait_for(&mut sub, dispatched("A")).await;
    assert_eq!(executor.tablets(), vec!["B", "A"]);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn terminal_failure_fails_restoration() {
    let snap = snapshot();
    let (handle, executor) = spawn(store(&snap), None);
    let mut sub = handle.subscribe();

    let id = handle
        .restore(snap.id, HybridTime::from_micros(10), None)
        .await
        .expect("restore");
    handle.get(id).await.expect("get");

    executor.take("B").complete(Err(TabletError::new(
        TabletErrorCode::InvalidSnapshot,
        "snapshot directory missing",
    )));
    let evt = wait_for(&mut sub, |e| matches!(e, CoordinatorEvent::StateChanged { .. })).await;
    assert_eq!(
        evt,
        CoordinatorEvent::StateChanged {
            restoration_id: id,
            state: OperationState::Failed,
        }
    );

    assert_eq!(handle.poll().await.expect("poll"), 0);
    let listed = handle.list().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].entry.state, OperationState::Failed);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn unknown_snapshot_is_rejected() {
    let snap = snapshot();
    let (handle, executor) = spawn(store(&snap), None);

    let err = handle
        .restore(SnapshotId::random(), HybridTime::from_micros(10), None)
        .await
        .expect_err("unknown snapshot");
    assert!(matches!(
        err,
        RuntimeError::Store(StoreError::MissingSnapshot(_))
    ));
    assert!(handle.list().await.expect("list").is_empty());
    assert!(executor.tablets().is_empty());

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn sqlite_log_survives_leader_change() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("sys_catalog.db");
    let snap = snapshot();

    let id = {
        let sink = SqliteRecordSink::open(&path).expect("open");
        let (handle, executor) = spawn(store(&snap), Some(sink));
        let mut sub = handle.subscribe();

        let id = handle
            .restore(snap.id, HybridTime::from_micros(10), Some(16_384))
            .await
            .expect("restore");
        executor.take("A").complete(Ok(()));
        wait_for(&mut sub, dispatched("C")).await;
        handle.flush().await.expect("flush");
        handle.shutdown().await.expect("shutdown");
        id
    };

    let sink = SqliteRecordSink::open(&path).expect("reopen");
    let context = Arc::new(StaticContext::new(Some(3)).with_snapshot(snap.clone()));
    let reloaded = RestorationStore::load_from_sink(context, throttle(), &sink).expect("load");
    let record = reloaded.get(&id).expect("restoration");
    assert_eq!(record.tablets().get("A").map(|t| t.state), Some(TabletState::Done));
    assert_eq!(record.tablets().count_in(TabletState::Pending), 2);

    let (handle, executor) = spawn(reloaded, Some(sink));
    handle.poll().await.expect("poll");
    assert_eq!(executor.tablets(), vec!["B", "C"]);

    executor.take("B").complete(Ok(()));
    executor.take("C").complete(Ok(()));
    let removed = loop {
        let info = handle.get(id).await.expect("get").expect("restoration");
        if info.entry.state == OperationState::Complete {
            break handle.checkpoint().await.expect("checkpoint");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(removed > 0);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn rejected_first_write_issues_no_rpc() {
    let snap = snapshot();
    let sink = FlakySink::default();
    sink.set_failing(true);
    let (handle, executor) = spawn_flaky(store(&snap), &sink);

    let err = handle
        .restore(snap.id, HybridTime::from_micros(10), None)
        .await
        .expect_err("log rejects the first record");
    assert!(matches!(err, RuntimeError::Persist(_)));
    assert_eq!(handle.poll().await.expect("poll"), 0);
    assert!(executor.tablets().is_empty());
    assert!(handle.list().await.expect("list").is_empty());
    assert!(sink.rows().is_empty());
    handle.flush().await.expect("nothing left to write");

    sink.set_failing(false);
    let id = handle
        .restore(snap.id, HybridTime::from_micros(10), None)
        .await
        .expect("restore");
    let info = handle.get(id).await.expect("get").expect("restoration");
    assert_eq!(info.durable_version, info.entry.version);
    assert_eq!(executor.tablets(), vec!["A", "B"]);

    let rows = sink.rows();
    assert_eq!(rows.len(), 1);
    let (row_id, _) = codec::decode_restoration(&rows[0]).expect("decode");
    assert_eq!(row_id, id);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn rejected_progress_write_is_rewritten_once_log_recovers() {
    let snap = snapshot();
    let sink = FlakySink::default();
    let (handle, executor) = spawn_flaky(store(&snap), &sink);
    let mut sub = handle.subscribe();

    let id = handle
        .restore(snap.id, HybridTime::from_micros(10), None)
        .await
        .expect("restore");
    handle.get(id).await.expect("get");
    sink.set_failing(true);

    executor.take("A").complete(Ok(()));
    wait_for(&mut sub, dispatched("C")).await;
    executor.take("B").complete(Ok(()));
    executor.take("C").complete(Ok(()));
    let info = loop {
        let info = handle.get(id).await.expect("get").expect("restoration");
        if info.entry.state == OperationState::Complete {
            break info;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(info.durable_version < info.entry.version);

    let err = handle.flush().await.expect_err("log still rejects writes");
    assert!(matches!(err, RuntimeError::Persist(_)));
    while let Ok(evt) = sub.try_recv() {
        assert!(
            !matches!(evt, CoordinatorEvent::StateChanged { .. }),
            "state reported before it was durable: {evt:?}"
        );
    }
    assert_eq!(sink.rows().len(), 1);

    sink.set_failing(false);
    handle.flush().await.expect("flush");
    let rows = sink.rows();
    assert_eq!(rows.len(), 2);
    let (_, entry) = codec::decode_restoration(&rows[1]).expect("decode");
    assert_eq!(entry.state, OperationState::Complete);
    assert!(entry.tablet_restorations.iter().all(|t| t.state == TabletState::Done));

    assert_eq!(
        wait_for(&mut sub, |e| matches!(e, CoordinatorEvent::StateChanged { .. })).await,
        CoordinatorEvent::StateChanged {
            restoration_id: id,
            state: OperationState::Complete,
        }
    );
    let info = handle.get(id).await.expect("get").expect("restoration");
    assert_eq!(info.durable_version, info.entry.version);
    assert_eq!(entry.version, info.entry.version);

    handle.shutdown().await.expect("shutdown");
}

#[test]
fn runtime_config_loads_from_json_with_defaults() {
    let cfg: RuntimeConfig =
        serde_json::from_str(r#"{ "ack_mode": "InMemory", "poll_interval_ms": 250 }"#)
            .expect("parse");
    assert_eq!(cfg.ack_mode, AckMode::InMemory);
    assert_eq!(cfg.poll_interval_ms, 250);
    assert_eq!(cfg.persist_queue_bound, 64);
    assert!(cfg.compact_on_checkpoint);
}
