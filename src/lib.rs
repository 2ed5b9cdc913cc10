//! Master-side coordinator for restoring distributed snapshots onto live
//! tablets, with throttled dispatch and versioned sys catalog persistence.
//!
//! # Examples
//!
//! Driving one restoration by hand with
//! [`core::restoration::RestorationState`]:
//! ```
//! use std::sync::Arc;
//!
//! use snaprestore::{
//!     core::{
//!         context::{SnapshotInfo, StaticContext},
//!         restoration::RestorationState,
//!         state::DispatchScope,
//!     },
//!     types::{HybridTime, OperationState, RestorationId, ScheduleId, SnapshotId},
//! };
//!
//! let snapshot = SnapshotInfo {
//!     id: SnapshotId::random(),
//!     schedule_id: ScheduleId::nil(),
//!     tablets: vec![
//!         ("t1".to_string(), OperationState::Complete),
//!         ("t2".to_string(), OperationState::Complete),
//!     ],
//! };
//! let context = Arc::new(StaticContext::new(Some(3)).with_snapshot(snapshot.clone()));
//! let mut restoration = RestorationState::new(
//!     context,
//!     RestorationId::random(),
//!     &snapshot,
//!     HybridTime::from_micros(1_000),
//!     false,
//!     1,
//! );
//!
//! let ops = restoration.prepare_operations(&DispatchScope::default());
//! assert_eq!(ops.len(), 1);
//! restoration.mark_tablet_result(&ops[0].tablet_id, Ok(()));
//! assert_eq!(restoration.aggregate(), OperationState::Restoring);
//! ```
//!
//! Coordinator runtime with a SQLite log:
//! ```no_run
//! use std::sync::Arc;
//!
//! use snaprestore::{
//!     core::{context::StaticContext, store::RestorationStore, throttle::ThrottleConfig},
//!     op::TabletRestoreOp,
//!     persist::sqlite::SqliteRecordSink,
//!     runtime::{
//!         handle::{spawn_coordinator, RuntimeConfig},
//!         rpc::{Completion, TabletRpcExecutor},
//!     },
//!     types::{HybridTime, SnapshotId},
//! };
//!
//! struct Loopback;
//!
//! impl TabletRpcExecutor for Loopback {
//!     fn issue(&self, _op: TabletRestoreOp, completion: Completion) {
//!         completion.complete(Ok(()));
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let context = Arc::new(StaticContext::new(Some(3)));
//! let sink = SqliteRecordSink::open("sys_catalog.db").expect("open sqlite");
//! let store = RestorationStore::load_from_sink(context, ThrottleConfig::default(), &sink)
//!     .expect("load");
//! let handle = spawn_coordinator(
//!     store,
//!     Some(Box::new(sink)),
//!     Arc::new(Loopback),
//!     RuntimeConfig::default(),
//! );
//! let _id = handle
//!     .restore(SnapshotId::random(), HybridTime::now(), None)
//!     .await;
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Restoration state, tablet tracking, throttling and the registry.
pub mod core;
/// Tablet restore RPC descriptors and status classification.
pub mod op;
/// Sys catalog log abstraction, codec and SQLite implementation.
pub mod persist;
/// Single-writer coordinator runtime.
pub mod runtime;
/// Shared identifiers and enums.
pub mod types;
