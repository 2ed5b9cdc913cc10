use std::sync::Arc;

use snaprestore::{
    core::{
        context::{CoordinatorContext, SnapshotInfo, StaticContext},
        restoration::RestorationState,
        state::DispatchScope,
    },
    op::{TabletError, TabletErrorCode},
    persist::codec::{
        self, CodecError, KeyValuePair, STRING_VALUE_TAG, SysRestorationEntry,
    },
    types::{
        HybridTime, OperationState, RestorationId, ScheduleId, SnapshotId, SysRowEntryType,
        TabletState,
    },
};

fn snapshot(schedule_id: ScheduleId) -> SnapshotInfo {
    SnapshotInfo {
        id: SnapshotId::random(),
        schedule_id,
        tablets: ["t1", "t2", "t3"]
            .iter()
            .map(|t| (t.to_string(), OperationState::Complete))
            .collect(),
    }
}

fn context(snapshot: &SnapshotInfo) -> Arc<dyn CoordinatorContext> {
    Arc::new(StaticContext::new(Some(3)).with_snapshot(snapshot.clone()))
}

fn restoration(snapshot: &SnapshotInfo) -> RestorationState {
    RestorationState::new(
        context(snapshot),
        RestorationId::random(),
        snapshot,
        HybridTime::from_micros(42_000),
        !snapshot.schedule_id.is_nil(),
        0,
    )
}

fn reload(snapshot: &SnapshotInfo, pair: &KeyValuePair) -> RestorationState {
    RestorationState::load_from_persisted(context(snapshot), pair, 0).expect("decode")
}

#[test]
fn each_store_bumps_version_by_one() {
    let snap = snapshot(ScheduleId::nil());
    let mut r = restoration(&snap);
    assert_eq!(r.version(), 1);

    let first = r.store_to_key_value_pair().expect("encode");
    assert_eq!(r.version(), 2);
    let second = r.store_to_key_value_pair().expect("encode");
    assert_eq!(r.version(), 3);
    assert_eq!(first.key, second.key);

    let (_, entry) = codec::decode_restoration(&second).expect("decode");
    assert_eq!(entry.version, 3);
}

#[test]
fn key_and_value_layout() {
    let snap = snapshot(ScheduleId::nil());
    let mut r = restoration(&snap);
    let pair = r.store_to_key_value_pair().expect("encode");

    assert_eq!(pair.key[0], SysRowEntryType::SnapshotRestoration.as_byte());
    assert_eq!(&pair.key[1..], r.restoration_id().as_bytes());
    assert_eq!(pair.value[0], STRING_VALUE_TAG);
}

#[test]
fn round_trip_preserves_tablets_refs_and_state() {
    let snap = snapshot(ScheduleId::random());
    let mut r = restoration(&snap);
    r.add_master_metadata("table-a", SysRowEntryType::Table);
    r.add_master_metadata("type-b", SysRowEntryType::UdType);
    r.prepare_operations(&DispatchScope::default());
    r.mark_tablet_result("t1", Ok(()));
    r.mark_tablet_result(
        "t2",
        Err(TabletError::new(TabletErrorCode::NetworkError, "connection reset")),
    );
    r.mark_tablet_result("t3", Ok(()));

    let pair = r.store_to_key_value_pair().expect("encode");
    let loaded = reload(&snap, &pair);

    assert_eq!(loaded.restoration_id(), r.restoration_id());
    assert_eq!(loaded.snapshot_id(), snap.id);
    assert_eq!(loaded.schedule_id(), Some(snap.schedule_id));
    assert!(loaded.is_sys_catalog_restored());
    assert_eq!(loaded.restore_at(), r.restore_at());
    assert_eq!(loaded.version(), r.version());
    assert_eq!(loaded.tablets(), r.tablets());
    assert_eq!(loaded.master_metadata(), r.master_metadata());
    assert_eq!(loaded.state(), OperationState::Restoring);
    assert_eq!(loaded.to_entry(), r.to_entry());
}

#[test]
fn completed_restoration_keeps_complete_time() {
    let snap = snapshot(ScheduleId::nil());
    let mut r = restoration(&snap);
    r.prepare_operations(&DispatchScope::default());
    for t in ["t1", "t2", "t3"] {
        r.mark_tablet_result(t, Ok(()));
    }

    let pair = r.store_to_key_value_pair().expect("encode");
    let (_, entry) = codec::decode_restoration(&pair).expect("decode");
    assert_eq!(entry.state, OperationState::Complete);
    assert!(entry.complete_time_ht.is_some());

    let loaded = reload(&snap, &pair);
    assert_eq!(loaded.complete_time(), r.complete_time());
    assert_eq!(loaded.state(), OperationState::Complete);
}

#[test]
fn in_flight_tablets_reload_as_pending() {
    let snap = snapshot(ScheduleId::nil());
    let mut r = restoration(&snap);
    let ops = r.prepare_operations(&DispatchScope::default());
    assert_eq!(ops.len(), 3);

    let pair = r.store_to_key_value_pair().expect("encode");
    let mut loaded = reload(&snap, &pair);
    assert_eq!(loaded.tablets().count_in(TabletState::Pending), 3);
    assert_eq!(loaded.throttler().in_flight(), 0);

    let redo = loaded.prepare_operations(&DispatchScope::default());
    assert_eq!(redo, ops);
}

#[test]
fn bad_reference_ids_are_replaced_not_fatal() {
    let snap = snapshot(ScheduleId::random());
    let mut r = restoration(&snap);
    r.prepare_operations(&DispatchScope::default());
    r.mark_tablet_result("t1", Ok(()));

    let mut entry = r.to_entry();
    entry.snapshot_id = vec![1, 2, 3];
    entry.schedule_id = vec![9; 5];
    let pair = codec::encode_restoration(&r.restoration_id(), &entry).expect("encode");

    let loaded = reload(&snap, &pair);
    assert!(loaded.snapshot_id().is_nil());
    assert_eq!(loaded.schedule_id(), None);
    assert_eq!(loaded.tablets().count_in(TabletState::Done), 1);
    assert_eq!(
        loaded.log_prefix(),
        format!("Restoration[{}]: ", r.restoration_id())
    );
}

#[test]
fn optional_fields_may_be_absent() {
    let snapshot_id = SnapshotId::random();
    let restoration_id = RestorationId::random();
    let payload = serde_json::json!({
        "state": "Restoring",
        "tablet_restorations": [
            { "tablet_id": "t1", "state": "Done" },
            { "tablet_id": "t2", "state": "Pending" }
        ],
        "snapshot_id": snapshot_id.as_bytes().to_vec(),
        "restore_at_ht": 7,
        "version": 4
    });
    let mut value = vec![STRING_VALUE_TAG];
    value.extend(serde_json::to_vec(&payload).expect("json"));
    let pair = KeyValuePair {
        key: codec::encode_key(SysRowEntryType::SnapshotRestoration, restoration_id.as_bytes()),
        value,
    };

    let snap = snapshot(ScheduleId::nil());
    let loaded = reload(&snap, &pair);
    assert_eq!(loaded.restoration_id(), restoration_id);
    assert_eq!(loaded.snapshot_id(), snapshot_id);
    assert_eq!(loaded.schedule_id(), None);
    assert!(!loaded.is_sys_catalog_restored());
    assert_eq!(loaded.complete_time(), None);
    assert_eq!(loaded.version(), 4);
    assert!(loaded.master_metadata().is_empty());
}

#[test]
fn invalid_complete_time_is_dropped() {
    let snap = snapshot(ScheduleId::nil());
    let r = restoration(&snap);
    let mut entry: SysRestorationEntry = r.to_entry();
    entry.complete_time_ht = Some(HybridTime::INVALID.to_u64());
    let pair = codec::encode_restoration(&r.restoration_id(), &entry).expect("encode");
    assert_eq!(reload(&snap, &pair).complete_time(), None);
}

#[test]
fn structural_damage_is_a_decode_error() {
    let snap = snapshot(ScheduleId::nil());
    let mut r = restoration(&snap);
    let good = r.store_to_key_value_pair().expect("encode");

    let mut bad_tag = good.clone();
    bad_tag.value[0] = b'X';
    assert!(matches!(
        codec::decode_restoration(&bad_tag),
        Err(CodecError::UnexpectedValueTag(b'X'))
    ));

    let mut wrong_type = good.clone();
    wrong_type.key[0] = SysRowEntryType::Snapshot.as_byte();
    assert!(matches!(
        codec::decode_restoration(&wrong_type),
        Err(CodecError::WrongEntryType { .. })
    ));

    let short_id = KeyValuePair {
        key: good.key[..5].to_vec(),
        value: good.value.clone(),
    };
    assert!(matches!(
        codec::decode_restoration(&short_id),
        Err(CodecError::BadKeyId(_))
    ));

    let garbage = KeyValuePair {
        key: good.key.clone(),
        value: vec![STRING_VALUE_TAG, b'{', b'x'],
    };
    assert!(matches!(
        codec::decode_restoration(&garbage),
        Err(CodecError::Payload(_))
    ));

    let empty = KeyValuePair {
        key: Vec::new(),
        value: good.value,
    };
    assert!(matches!(
        codec::decode_restoration(&empty),
        Err(CodecError::EmptyKey)
    ));
}
