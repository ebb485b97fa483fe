//! Tests for the change manager.

#[cfg(test)]
mod tests {
    use super::super::manager::*;
    use crate::error::{Result, SyncError};
    use crate::memory::{MemoryLocalStore, MemoryRemoteStore};
    use crate::record::{FieldValue, LocalObject, RecordValue, RemoteRecord, Value};
    use crate::schema::{ScalarType, SchemaDescriptor, SchemaRegistry};
    use crate::storage::MetadataStore;
    use crate::sync::ledger::ChangeState;
    use crate::sync::local::{ChangeFeed, LocalStore, LocalTransaction, WriteOrigin};
    use crate::sync::remote::{PullBatch, PushOutcome, RecordFailure, RemoteStore};
    use chrono::Duration;
    use std::sync::Arc;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder(1)
            .descriptor(
                SchemaDescriptor::new("Pilot", "id")
                    .scalar("id", ScalarType::String)
                    .scalar("name", ScalarType::String)
                    .scalar("age", ScalarType::Int),
            )
            .descriptor(
                SchemaDescriptor::new("Flight", "id")
                    .scalar("id", ScalarType::String)
                    .scalar("number", ScalarType::String)
                    .to_one("pilot", "Pilot"),
            )
            .build()
            .unwrap()
    }

    struct Harness {
        local: Arc<MemoryLocalStore>,
        remote: Arc<MemoryRemoteStore>,
        transport: Arc<dyn RemoteStore>,
        manager: ChangeManager<MemoryLocalStore>,
    }

    fn harness_with(options: ManagerOptions) -> Harness {
        let local = Arc::new(MemoryLocalStore::new(registry()));
        let remote = Arc::new(MemoryRemoteStore::new());
        let transport: Arc<dyn RemoteStore> = remote.clone();
        let mut manager = ChangeManager::new(
            local.clone(),
            MetadataStore::open_memory().unwrap(),
            options,
        );
        manager.connect(&transport);
        Harness {
            local,
            remote,
            transport,
            manager,
        }
    }

    fn harness() -> Harness {
        harness_with(ManagerOptions::default())
    }

    fn pilot(id: &str, name: &str) -> LocalObject {
        LocalObject::new("Pilot", id).with("name", name).with("age", 30_i64)
    }

    fn state(h: &Harness, object_type: &str, id: &str) -> Option<ChangeState> {
        h.manager
            .metadata()
            .ledger()
            .entity(object_type, id)
            .unwrap()
            .map(|e| e.change_state)
    }

    fn remote_pilot(h: &Harness, id: &str, name: &str) -> RemoteRecord {
        let mut record = RemoteRecord::new(h.manager.converter().record_id("Pilot", id), 1);
        record.set("name", RecordValue::Value(name.into()));
        record.set("age", RecordValue::Value(Value::Int(41)));
        record
    }

    #[test]
    fn test_observe_tracks_local_lifecycle() {
        let mut h = harness();
        h.local.save_object(pilot("p1", "Amy")).unwrap();
        assert_eq!(h.manager.drain_local_changes().unwrap(), 1);
        assert_eq!(state(&h, "Pilot", "p1"), Some(ChangeState::New));

        h.local.save_object(pilot("p1", "Amy B")).unwrap();
        h.manager.drain_local_changes().unwrap();
        assert_eq!(state(&h, "Pilot", "p1"), Some(ChangeState::Changed));

        h.local.soft_delete("Pilot", "p1").unwrap();
        h.manager.drain_local_changes().unwrap();
        assert_eq!(state(&h, "Pilot", "p1"), Some(ChangeState::Deleted));
    }

    #[test]
    fn test_push_acknowledges_and_removes_deleted() {
        let mut h = harness();
        h.local.save_object(pilot("p1", "Amy")).unwrap();
        h.local.save_object(pilot("p2", "Bo")).unwrap();
        h.manager.drain_local_changes().unwrap();
        let report = h.manager.push().unwrap();
        assert_eq!(report.saved, 2);
        assert_eq!(state(&h, "Pilot", "p1"), Some(ChangeState::Synced));

        h.local.soft_delete("Pilot", "p2").unwrap();
        h.manager.drain_local_changes().unwrap();
        let report = h.manager.push().unwrap();
        assert_eq!(report.deleted, 1);

        let entity = h.manager.metadata().ledger().entity("Pilot", "p2").unwrap().unwrap();
        assert_eq!(entity.change_state, ChangeState::Synced);
        assert!(entity.is_deleted);
        assert!(!h.local.is_soft_deleted("Pilot", "p2").unwrap());
        assert_eq!(h.remote.records().unwrap().len(), 1);
    }

    #[test]
    fn test_recreated_object_cancels_pending_deletion() {
        let mut h = harness();
        h.local.save_object(pilot("p1", "Amy")).unwrap();
        h.manager.sync().unwrap();

        h.local.soft_delete("Pilot", "p1").unwrap();
        h.manager.drain_local_changes().unwrap();
        h.local.save_object(pilot("p1", "Amy reborn")).unwrap();
        h.manager.drain_local_changes().unwrap();
        assert_eq!(state(&h, "Pilot", "p1"), Some(ChangeState::Changed));

        let report = h.manager.push().unwrap();
        assert_eq!((report.saved, report.deleted), (1, 0));
        assert!(h.local.object("Pilot", "p1").unwrap().is_some());
        let id = h.manager.converter().record_id("Pilot", "p1");
        let record = h.remote.record(&id).unwrap().unwrap();
        assert_eq!(record.get("name"), Some(&RecordValue::Value("Amy reborn".into())));
        assert_eq!(state(&h, "Pilot", "p1"), Some(ChangeState::Synced));
    }

    #[test]
    fn test_deletion_ack_spares_object_recreated_in_flight() {
        let mut h = harness();
        h.local.save_object(pilot("p1", "Amy")).unwrap();
        h.manager.sync().unwrap();
        h.local.soft_delete("Pilot", "p1").unwrap();
        h.manager.drain_local_changes().unwrap();

        let outbound = h.manager.prepare_push().unwrap();
        assert_eq!(outbound.deletions.len(), 1);
        h.local.save_object(pilot("p1", "Amy reborn")).unwrap();
        h.manager.drain_local_changes().unwrap();

        let report = h
            .manager
            .did_push(&PushOutcome {
                saved: vec![],
                deleted: outbound.deletions.clone(),
                failures: vec![],
            })
            .unwrap();
        assert_eq!(report.deleted, 0);
        assert!(h.local.object("Pilot", "p1").unwrap().is_some());
        let entity = h.manager.metadata().ledger().entity("Pilot", "p1").unwrap().unwrap();
        assert_eq!(entity.change_state, ChangeState::Changed);
        assert!(!entity.is_deleted);
    }

    #[test]
    fn test_rejected_record_stays_pending() {
        let mut h = harness();
        h.remote.reject("p1").unwrap();
        h.local.save_object(pilot("p1", "Amy")).unwrap();
        h.manager.drain_local_changes().unwrap();

        let report = h.manager.push().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(state(&h, "Pilot", "p1"), Some(ChangeState::New));

        h.remote.accept("p1").unwrap();
        h.manager.push().unwrap();
        assert_eq!(state(&h, "Pilot", "p1"), Some(ChangeState::Synced));
    }

    #[test]
    fn test_transport_failure_keeps_state() {
        let mut h = harness();
        h.local.save_object(pilot("p1", "Amy")).unwrap();
        h.remote.set_offline(true).unwrap();

        let report = h.manager.sync().unwrap();
        assert!(report.deferred.is_some());
        assert_eq!(state(&h, "Pilot", "p1"), Some(ChangeState::New));

        h.remote.set_offline(false).unwrap();
        let report = h.manager.sync().unwrap();
        assert!(report.deferred.is_none());
        assert_eq!(report.push.saved, 1);
        assert_eq!(state(&h, "Pilot", "p1"), Some(ChangeState::Synced));
    }

    #[test]
    fn test_push_is_chunked() {
        let mut h = harness_with(ManagerOptions {
            push_batch_size: 2,
            ..ManagerOptions::default()
        });
        for i in 0..5 {
            h.local.save_object(pilot(&format!("p{i}"), "x")).unwrap();
        }
        h.manager.drain_local_changes().unwrap();
        let report = h.manager.push().unwrap();
        assert_eq!(report.saved, 5);
        assert_eq!(h.remote.push_count().unwrap(), 3);
    }

    #[test]
    fn test_inbound_writes_are_not_pushed_back() {
        let mut h = harness();
        h.remote.insert(remote_pilot(&h, "p9", "Cy")).unwrap();

        let report = h.manager.sync().unwrap();
        assert_eq!(report.pull.applied, 1);
        assert_eq!(state(&h, "Pilot", "p9"), Some(ChangeState::Synced));
        let pilot = h.local.object("Pilot", "p9").unwrap().unwrap();
        assert_eq!(pilot.scalar("name"), Some(&Value::from("Cy")));

        let pushes = h.remote.push_count().unwrap();
        let report = h.manager.sync().unwrap();
        assert_eq!(report.observed, 0);
        assert_eq!(report.pull.applied, 0);
        assert_eq!(h.remote.push_count().unwrap(), pushes);
    }

    #[test]
    fn test_inbound_deletion_tombstones_entry() {
        let mut h = harness();
        h.local.save_object(pilot("p1", "Amy")).unwrap();
        h.manager.sync().unwrap();

        let id = h.manager.converter().record_id("Pilot", "p1");
        h.remote.remove(&id).unwrap();
        let report = h.manager.sync().unwrap();
        assert_eq!(report.pull.deleted, 1);
        assert!(h.local.object("Pilot", "p1").unwrap().is_none());
        let entity = h.manager.metadata().ledger().entity("Pilot", "p1").unwrap().unwrap();
        assert!(entity.is_deleted);
    }

    #[test]
    fn test_inbound_merge_keeps_local_relationship() {
        let h = harness();
        h.local.save_object(pilot("p1", "Amy")).unwrap();
        h.local
            .save_object(
                LocalObject::new("Flight", "f1")
                    .with("number", "LH1")
                    .with_field("pilot", FieldValue::ToOne(Some("p1".into()))),
            )
            .unwrap();

        let mut record = RemoteRecord::new(h.manager.converter().record_id("Flight", "f1"), 1);
        record.set("number", RecordValue::Value("LH2".into()));
        record.set("pilot", RecordValue::Reference("p404".into()));
        let report = h
            .manager
            .apply_inbound(PullBatch {
                modifications: vec![record],
                ..PullBatch::default()
            })
            .unwrap();
        assert_eq!(report.relationships.waiting, 1);

        let flight = h.local.object("Flight", "f1").unwrap().unwrap();
        assert_eq!(flight.scalar("number"), Some(&Value::from("LH2")));
        assert_eq!(flight.to_one("pilot"), Some("p1"));
        assert_eq!(h.manager.metadata().pending().len().unwrap(), 1);
    }

    #[test]
    fn test_corrupted_inbound_record_does_not_block_batch() {
        let h = harness();
        let mut bad = RemoteRecord::new(h.manager.converter().record_id("Flight", "f1"), 1);
        bad.set("pilot", RecordValue::Value(Value::Int(3)));
        let good = remote_pilot(&h, "p1", "Amy");

        let report = h
            .manager
            .apply_inbound(PullBatch {
                modifications: vec![bad, good],
                ..PullBatch::default()
            })
            .unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.applied, 1);
        assert!(h.local.object("Pilot", "p1").unwrap().is_some());
    }

    /// Local store that refuses to remove one identifier.
    struct PinnedStore {
        inner: MemoryLocalStore,
        pinned: String,
    }

    struct PinnedTransaction<'a> {
        inner: &'a mut dyn LocalTransaction,
        pinned: &'a str,
    }

    impl LocalTransaction for PinnedTransaction<'_> {
        fn object(&self, object_type: &str, id: &str) -> Result<Option<LocalObject>> {
            self.inner.object(object_type, id)
        }

        fn put(&mut self, object: LocalObject) -> Result<()> {
            self.inner.put(object)
        }

        fn remove(&mut self, object_type: &str, id: &str) -> Result<bool> {
            if id == self.pinned {
                return Err(SyncError::Store(format!("{object_type}/{id} is pinned")));
            }
            self.inner.remove(object_type, id)
        }
    }

    impl LocalStore for PinnedStore {
        fn registry(&self) -> &SchemaRegistry {
            self.inner.registry()
        }

        fn object(&self, object_type: &str, id: &str) -> Result<Option<LocalObject>> {
            self.inner.object(object_type, id)
        }

        fn identifiers(&self, object_type: &str) -> Result<Vec<String>> {
            self.inner.identifiers(object_type)
        }

        fn write(
            &self,
            origin: WriteOrigin,
            f: &mut dyn FnMut(&mut dyn LocalTransaction) -> Result<()>,
        ) -> Result<()> {
            self.inner.write(origin, &mut |tx| {
                let mut tx = PinnedTransaction {
                    inner: tx,
                    pinned: &self.pinned,
                };
                f(&mut tx)
            })
        }

        fn subscribe(&self) -> ChangeFeed {
            self.inner.subscribe()
        }
    }

    #[test]
    fn test_failed_inbound_deletion_does_not_block_batch() {
        let local = Arc::new(PinnedStore {
            inner: MemoryLocalStore::new(registry()),
            pinned: "p1".into(),
        });
        local.inner.save_object(pilot("p1", "Amy")).unwrap();
        local.inner.save_object(pilot("p2", "Bo")).unwrap();
        let manager = ChangeManager::new(
            local.clone(),
            MetadataStore::open_memory().unwrap(),
            ManagerOptions::default(),
        );
        assert_eq!(manager.track_existing().unwrap(), 2);

        let mut incoming = RemoteRecord::new(manager.converter().record_id("Pilot", "p3"), 1);
        incoming.set("name", RecordValue::Value("Cy".into()));
        let report = manager
            .apply_inbound(PullBatch {
                modifications: vec![incoming],
                deletions: vec![
                    manager.converter().record_id("Pilot", "p1"),
                    manager.converter().record_id("Pilot", "p2"),
                ],
                ..PullBatch::default()
            })
            .unwrap();

        assert_eq!((report.applied, report.deleted), (1, 1));
        assert!(local.inner.object("Pilot", "p1").unwrap().is_some());
        assert!(local.inner.object("Pilot", "p2").unwrap().is_none());
        assert!(local.inner.object("Pilot", "p3").unwrap().is_some());
        let ledger = manager.metadata().ledger();
        let kept = ledger.entity("Pilot", "p1").unwrap().unwrap();
        assert_eq!(kept.change_state, ChangeState::New);
        assert!(!kept.is_deleted);
        assert!(ledger.entity("Pilot", "p2").unwrap().unwrap().is_deleted);
    }

    #[test]
    fn test_corrupted_relationship_is_discarded() {
        let h = harness();
        h.manager
            .metadata()
            .pending()
            .enqueue(&crate::sync::pending::PendingRelationship {
                from_type: "Flight".into(),
                from_identifier: "gone".into(),
                property: "pilot".into(),
                to_type: "Pilot".into(),
                targets: vec![],
            })
            .unwrap();
        let report = h.manager.resolve_pending().unwrap();
        assert_eq!(report.discarded, 1);
        assert!(h.manager.metadata().pending().is_empty().unwrap());
    }

    #[test]
    fn test_track_existing_seeds_unseen_objects() {
        let h = harness();
        h.local
            .write(WriteOrigin::Sync, &mut |tx| {
                tx.put(pilot("p1", "Amy"))?;
                tx.put(pilot("p2", "Bo"))
            })
            .unwrap();
        assert_eq!(h.manager.track_existing().unwrap(), 2);
        assert_eq!(h.manager.track_existing().unwrap(), 0);
        assert_eq!(state(&h, "Pilot", "p2"), Some(ChangeState::New));
    }

    #[test]
    fn test_did_push_ignores_unknown_and_reports_failures() {
        let mut h = harness();
        h.local.save_object(pilot("p1", "Amy")).unwrap();
        h.manager.drain_local_changes().unwrap();

        let outbound = h.manager.prepare_push().unwrap();
        assert_eq!(outbound.records.len(), 1);
        let id = outbound.records[0].id.clone();
        let report = h
            .manager
            .did_push(&PushOutcome {
                saved: vec![],
                deleted: vec![],
                failures: vec![RecordFailure {
                    id,
                    reason: "quota".into(),
                }],
            })
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(state(&h, "Pilot", "p1"), Some(ChangeState::New));
    }

    #[test]
    fn test_dropped_transport_is_a_no_op() {
        let Harness {
            local,
            remote,
            transport,
            mut manager,
        } = harness();
        drop(transport);
        drop(remote);

        local.save_object(pilot("p1", "Amy")).unwrap();
        let report = manager.sync().unwrap();
        assert_eq!(report.observed, 1);
        assert_eq!(report.push, PushReport::default());
        let entity = manager.metadata().ledger().entity("Pilot", "p1").unwrap().unwrap();
        assert_eq!(entity.change_state, ChangeState::New);
    }

    #[test]
    fn test_cleanup_reaps_old_metadata() {
        let mut h = harness();
        h.local.save_object(pilot("p1", "Amy")).unwrap();
        h.manager.sync().unwrap();
        h.local.soft_delete("Pilot", "p1").unwrap();
        h.manager.sync().unwrap();

        let report = h.manager.cleanup(Duration::days(30)).unwrap();
        assert_eq!(report.tombstones, 0);
        let report = h.manager.cleanup(Duration::seconds(-1)).unwrap();
        assert_eq!(report.tombstones, 1);
        assert!(h.manager.metadata().ledger().entity("Pilot", "p1").unwrap().is_none());
    }

    #[test]
    fn test_cleanup_with_unbounded_retention_keeps_everything() {
        let mut h = harness();
        h.local.save_object(pilot("p1", "Amy")).unwrap();
        h.manager.sync().unwrap();
        h.local.soft_delete("Pilot", "p1").unwrap();
        h.manager.sync().unwrap();

        let report = h.manager.cleanup(Duration::days(i64::from(u32::MAX))).unwrap();
        assert_eq!(report.tombstones, 0);
        assert!(h.manager.metadata().ledger().entity("Pilot", "p1").unwrap().is_some());
        assert_eq!(
            retention_cutoff(Duration::days(i64::from(u32::MAX))),
            chrono::DateTime::<chrono::Utc>::UNIX_EPOCH
        );
    }

    #[tokio::test]
    async fn test_watch_consumes_until_feed_closes() {
        let local = Arc::new(MemoryLocalStore::new(registry()));
        let mut manager = ChangeManager::new(
            local.clone(),
            MetadataStore::open_memory().unwrap(),
            ManagerOptions::default(),
        );
        local.save_object(pilot("p1", "Amy")).unwrap();
        local.save_object(pilot("p2", "Bo")).unwrap();
        local.close_feeds().unwrap();

        let observed = manager.watch_local_changes().await.unwrap();
        assert_eq!(observed, 2);
        assert_eq!(manager.metadata().ledger().counts().unwrap().new, 2);
    }
}
