use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{Duration, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    core::{
        restoration::RestorationInfo,
        store::{PendingWrite, RestorationStore, StoreError},
    },
    persist::{LogSeq, PersistError, RecordSink},
    types::{DbOid, HybridTime, OperationState, RestorationId, SnapshotId},
};

use super::{
    events::CoordinatorEvent,
    rpc::{Completion, TabletCompletion, TabletRpcExecutor},
};

/// Errors returned through [`CoordinatorHandle`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Registry rejected the request.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The log rejected a write the request depends on.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The coordinator task is gone.
    #[error("coordinator channel closed")]
    ChannelClosed,
}

/// When a new restoration is acknowledged to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AckMode {
    /// As soon as it exists in memory.
    InMemory,
    /// Once its first record is in the log. No RPC is issued before that.
    #[default]
    Durable,
}

/// Coordinator runtime tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Period of the background dispatch and write-retry cycle.
    pub poll_interval_ms: u64,
    /// Capacity of the queue in front of the log writer.
    pub persist_queue_bound: usize,
    /// When `restore` is acknowledged.
    pub ack_mode: AckMode,
    /// Compact the log on every `checkpoint`.
    pub compact_on_checkpoint: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            persist_queue_bound: 64,
            ack_mode: AckMode::Durable,
            compact_on_checkpoint: true,
        }
    }
}

/// Cloneable client of the coordinator task.
pub struct CoordinatorHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<CoordinatorEvent>,
}

impl Clone for CoordinatorHandle {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}

enum Command {
    Restore {
        snapshot_id: SnapshotId,
        restore_at: HybridTime,
        db_oid: Option<DbOid>,
        resp: oneshot::Sender<Result<RestorationId, RuntimeError>>,
    },
    Poll {
        resp: oneshot::Sender<usize>,
    },
    Get {
        id: RestorationId,
        resp: oneshot::Sender<Option<RestorationInfo>>,
    },
    List {
        resp: oneshot::Sender<Vec<RestorationInfo>>,
    },
    Flush {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Checkpoint {
        resp: oneshot::Sender<Result<usize, RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum PersistMsg {
    Write {
        writes: Vec<PendingWrite>,
        ack: Option<oneshot::Sender<Result<LogSeq, PersistError>>>,
    },
    Flush {
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
    Compact {
        resp: oneshot::Sender<Result<usize, PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// What the log holds after a write.
#[derive(Debug, Clone, Copy)]
struct WriteReceipt {
    restoration_id: RestorationId,
    version: u64,
    state: OperationState,
}

impl From<&PendingWrite> for WriteReceipt {
    fn from(write: &PendingWrite) -> Self {
        Self {
            restoration_id: write.restoration_id,
            version: write.version,
            state: write.state,
        }
    }
}

/// Result of one append, reported back to the coordinator.
#[derive(Debug)]
enum PersistFeedback {
    Durable(Vec<WriteReceipt>),
    Failed(Vec<RestorationId>),
}

struct Coordinator {
    store: RestorationStore,
    executor: Arc<dyn TabletRpcExecutor>,
    completion_tx: mpsc::UnboundedSender<TabletCompletion>,
    events_tx: broadcast::Sender<CoordinatorEvent>,
    persist_tx: Option<mpsc::Sender<PersistMsg>>,
    feedback_rx: mpsc::UnboundedReceiver<PersistFeedback>,
    config: RuntimeConfig,
}

/// Spawns the single-writer coordinator task owning `store`.
///
/// Every state change, including RPC completions and log acknowledgements,
/// is applied on that task. With no `sink`, writes are dropped and reported
/// durable immediately.
pub fn spawn_coordinator(
    store: RestorationStore,
    sink: Option<Box<dyn RecordSink>>,
    executor: Arc<dyn TabletRpcExecutor>,
    config: RuntimeConfig,
) -> CoordinatorHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
    let (events_tx, _) = broadcast::channel::<CoordinatorEvent>(1024);
    let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<TabletCompletion>();
    let (feedback_tx, feedback_rx) = mpsc::unbounded_channel::<PersistFeedback>();

    let persist_tx = sink.map(|sink| {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound);
        spawn_persistence_worker(sink, persist_rx, feedback_tx);
        persist_tx
    });

    let mut coordinator = Coordinator {
        store,
        executor,
        completion_tx,
        events_tx: events_tx.clone(),
        persist_tx,
        feedback_rx,
        config,
    };

    tokio::spawn(async move {
        let period = Duration::from_millis(coordinator.config.poll_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    if coordinator.handle_command(cmd).await {
                        break;
                    }
                }
                Some(done) = completion_rx.recv() => {
                    coordinator.handle_completion(done).await;
                }
                Some(feedback) = coordinator.feedback_rx.recv() => {
                    coordinator.apply_feedback(feedback);
                }
                _ = ticker.tick() => {
                    coordinator.retry_failed_writes().await;
                    coordinator.dispatch_cycle();
                }
            }
        }
        debug!("coordinator loop stopped");
    });

    CoordinatorHandle { cmd_tx, events_tx }
}

impl CoordinatorHandle {
    /// Receiver for events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events_tx.subscribe()
    }

    /// Starts restoring `snapshot_id` to `restore_at`, optionally scoped to
    /// one database.
    pub async fn restore(
        &self,
        snapshot_id: SnapshotId,
        restore_at: HybridTime,
        db_oid: Option<DbOid>,
    ) -> Result<RestorationId, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Restore {
                snapshot_id,
                restore_at,
                db_oid,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Runs one dispatch cycle now. Returns the number of RPCs issued.
    pub async fn poll(&self) -> Result<usize, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Poll { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Reporting view of one restoration.
    pub async fn get(&self, id: RestorationId) -> Result<Option<RestorationInfo>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Get { id, resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Reporting views of every restoration, ascending by id.
    pub async fn list(&self) -> Result<Vec<RestorationInfo>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::List { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Writes every pending change, including earlier writes the log
    /// rejected, and flushes the log. Fails while any write is rejected.
    pub async fn flush(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Flushes, then drops superseded log rows when compaction is enabled.
    /// Returns the number of rows removed.
    pub async fn checkpoint(&self) -> Result<usize, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Checkpoint { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Persists pending changes and stops the coordinator.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }
}

impl Coordinator {
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Restore {
                snapshot_id,
                restore_at,
                db_oid,
                resp,
            } => {
                let res = self.start_restoration(snapshot_id, restore_at, db_oid).await;
                let started = res.is_ok();
                let _ = resp.send(res);
                if started {
                    self.dispatch_cycle();
                }
            }
            Command::Poll { resp } => {
                let _ = resp.send(self.dispatch_cycle());
            }
            Command::Get { id, resp } => {
                let _ = resp.send(self.store.info(&id));
            }
            Command::List { resp } => {
                let _ = resp.send(self.store.infos());
            }
            Command::Flush { resp } => {
                let _ = resp.send(self.flush().await);
            }
            Command::Checkpoint { resp } => {
                let out = match self.flush().await {
                    Ok(()) if self.config.compact_on_checkpoint => self.compact().await,
                    Ok(()) => Ok(0),
                    Err(err) => Err(err),
                };
                let _ = resp.send(out);
            }
            Command::Shutdown { resp } => {
                let mut out = self.persist_pending(true).await;
                if let Some(tx) = &self.persist_tx {
                    let (done_tx, done_rx) = oneshot::channel();
                    if tx.send(PersistMsg::Shutdown { resp: done_tx }).await.is_err()
                        || done_rx.await.is_err()
                    {
                        out = out.and(Err(RuntimeError::ChannelClosed));
                    }
                }
                let _ = resp.send(out);
                return true;
            }
        }

        false
    }

    async fn start_restoration(
        &mut self,
        snapshot_id: SnapshotId,
        restore_at: HybridTime,
        db_oid: Option<DbOid>,
    ) -> Result<RestorationId, RuntimeError> {
        let restoration_id = self.store.start(&snapshot_id, restore_at, db_oid)?;
        let durable = self.config.ack_mode == AckMode::Durable;
        if let Err(err) = self.persist_pending(durable).await {
            // Not in the log: nothing may be dispatched for it.
            self.store.discard(&restoration_id);
            return Err(err);
        }
        let _ = self.events_tx.send(CoordinatorEvent::Created { restoration_id });
        info!(%restoration_id, %snapshot_id, "restoration started");
        Ok(restoration_id)
    }

    async fn handle_completion(&mut self, done: TabletCompletion) {
        let TabletCompletion {
            restoration_id,
            tablet_id,
            status,
        } = done;
        let ok = status.is_ok();
        match self.store.mark_tablet_result(&restoration_id, &tablet_id, status) {
            Ok(outcome) => {
                if outcome.transition.applied {
                    let _ = self.events_tx.send(CoordinatorEvent::TabletFinished {
                        restoration_id,
                        tablet_id,
                        ok,
                    });
                }
                if let Err(err) = self.persist_pending(false).await {
                    warn!(%restoration_id, error = %err, "failed to persist restoration progress");
                }
            }
            Err(err) => {
                warn!(%restoration_id, %tablet_id, error = %err, "dropping tablet result");
            }
        }
        self.dispatch_cycle();
    }

    fn dispatch_cycle(&mut self) -> usize {
        let ops = self.store.prepare_all();
        let issued = ops.len();
        for op in ops {
            let _ = self.events_tx.send(CoordinatorEvent::Dispatched {
                restoration_id: op.restoration_id,
                tablet_id: op.tablet_id.clone(),
            });
            let completion = Completion::new(
                op.restoration_id,
                op.tablet_id.clone(),
                self.completion_tx.clone(),
            );
            self.executor.issue(op, completion);
        }
        issued
    }

    /// Encodes dirty restorations and hands them to the log. With `wait`,
    /// returns only after the log answered, with its error if it rejected
    /// the write.
    async fn persist_pending(&mut self, wait: bool) -> Result<(), RuntimeError> {
        if !self.store.has_pending_writes() {
            return Ok(());
        }
        let writes = self.store.drain_pending_writes()?;

        let Some(tx) = self.persist_tx.clone() else {
            let receipts = writes.iter().map(WriteReceipt::from).collect();
            self.apply_feedback(PersistFeedback::Durable(receipts));
            return Ok(());
        };

        if wait {
            let (ack_tx, ack_rx) = oneshot::channel();
            tx.send(PersistMsg::Write {
                writes,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
            let result = ack_rx.await.map_err(|_| RuntimeError::ChannelClosed)?;
            // Feedback for this write is queued before the ack.
            self.drain_feedback();
            result?;
        } else {
            tx.send(PersistMsg::Write { writes, ack: None })
                .await
                .map_err(|_| RuntimeError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Re-queues restorations whose writes the log rejected.
    async fn retry_failed_writes(&mut self) {
        self.drain_feedback();
        if let Err(err) = self.persist_pending(false).await {
            warn!(error = %err, "failed to queue restoration rewrite");
        }
    }

    fn drain_feedback(&mut self) {
        while let Ok(feedback) = self.feedback_rx.try_recv() {
            self.apply_feedback(feedback);
        }
    }

    fn apply_feedback(&mut self, feedback: PersistFeedback) {
        match feedback {
            PersistFeedback::Durable(receipts) => {
                for receipt in receipts {
                    let WriteReceipt {
                        restoration_id,
                        version,
                        state,
                    } = receipt;
                    let _ = self.events_tx.send(CoordinatorEvent::DurableUpTo {
                        restoration_id,
                        version,
                    });
                    if let Some(state) = self.store.mark_durable(&restoration_id, version, state) {
                        info!(%restoration_id, version, ?state, "restoration state durable");
                        let _ = self.events_tx.send(CoordinatorEvent::StateChanged {
                            restoration_id,
                            state,
                        });
                    }
                }
            }
            PersistFeedback::Failed(ids) => {
                for restoration_id in ids {
                    // Discarded restorations are gone; nothing to rewrite.
                    if self.store.touch(&restoration_id).is_ok() {
                        debug!(%restoration_id, "restoration marked for rewrite");
                    }
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<(), RuntimeError> {
        self.persist_pending(true).await?;
        let Some(tx) = self.persist_tx.clone() else {
            return Ok(());
        };
        let (flush_tx, flush_rx) = oneshot::channel();
        tx.send(PersistMsg::Flush { resp: flush_tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        flush_rx.await.map_err(|_| RuntimeError::ChannelClosed)??;
        // Every earlier write has been answered; rewrite the rejected ones.
        self.drain_feedback();
        self.persist_pending(true).await
    }

    async fn compact(&mut self) -> Result<usize, RuntimeError> {
        let Some(tx) = &self.persist_tx else {
            return Ok(0);
        };
        let (compact_tx, compact_rx) = oneshot::channel();
        tx.send(PersistMsg::Compact { resp: compact_tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        Ok(compact_rx.await.map_err(|_| RuntimeError::ChannelClosed)??)
    }
}

fn spawn_persistence_worker(
    sink: Box<dyn RecordSink>,
    mut rx: mpsc::Receiver<PersistMsg>,
    feedback_tx: mpsc::UnboundedSender<PersistFeedback>,
) {
    let sink = Arc::new(Mutex::new(sink));
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                PersistMsg::Write { writes, ack } => {
                    let result = append_writes(&sink, &writes).await;
                    let feedback = match &result {
                        Ok(seq) => {
                            debug!(seq, writes = writes.len(), "restoration records durable");
                            PersistFeedback::Durable(writes.iter().map(WriteReceipt::from).collect())
                        }
                        Err(err) => {
                            warn!(error = %err, writes = writes.len(), "append to sys catalog log failed");
                            PersistFeedback::Failed(writes.iter().map(|w| w.restoration_id).collect())
                        }
                    };
                    let _ = feedback_tx.send(feedback);
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                }
                PersistMsg::Flush { resp } => {
                    let _ = resp.send(with_sink(&sink, |sink| sink.flush()).await);
                }
                PersistMsg::Compact { resp } => {
                    let result = with_sink(&sink, |sink| sink.compact()).await;
                    if let Ok(removed) = &result {
                        info!(removed, "compacted sys catalog log");
                    }
                    let _ = resp.send(result);
                }
                PersistMsg::Shutdown { resp } => {
                    if let Err(err) = with_sink(&sink, |sink| sink.flush()).await {
                        warn!(error = %err, "final flush failed");
                    }
                    let _ = resp.send(());
                    break;
                }
            }
        }
    });
}

async fn append_writes(
    sink: &Arc<Mutex<Box<dyn RecordSink>>>,
    writes: &[PendingWrite],
) -> Result<LogSeq, PersistError> {
    let pairs: Vec<_> = writes.iter().map(|w| w.pair.clone()).collect();
    with_sink(sink, move |sink| sink.append_pairs(&pairs)).await
}

async fn with_sink<T, F>(sink: &Arc<Mutex<Box<dyn RecordSink>>>, f: F) -> Result<T, PersistError>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn RecordSink>) -> Result<T, PersistError> + Send + 'static,
{
    let sink_ref = Arc::clone(sink);
    tokio::task::spawn_blocking(move || {
        let mut sink = sink_ref.blocking_lock();
        f(&mut *sink)
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))?
}

