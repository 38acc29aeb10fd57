#[cfg(test)]
mod conn_test {
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    use serial_test::serial;

    use crate::codec::{Codec, JsonCodec, RefAllocator};
    use crate::connection::Connection;
    use crate::db::{self, Database};
    use crate::error::{CResult, Error};
    use crate::object::{PObject, Phase, StateMap, Value};
    use crate::storage::engine::{SharedStorage, Storage};
    use crate::storage::memory::MemoryStorage;
    use crate::storage::{Status, StoreReturn};
    use crate::types::{p64, Oid, Tid, RESOLVED_SERIAL, Z64};

    // ---- support ---------------------------------------------------------

    /// Refuses reference allocation; for building frames of ref-free state.
    struct NoRefs;

    impl RefAllocator for NoRefs {
        fn reserve(&mut self, _obj: &Arc<PObject>) -> CResult<Oid> {
            Err(Error::Internal("unexpected reference".to_string()))
        }
    }

    fn state(entries: Vec<(&str, Value)>) -> StateMap {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    /// A stored frame for the given ref-free state.
    fn frame(entries: Vec<(&str, Value)>) -> Vec<u8> {
        let obj = PObject::new(state(entries));
        JsonCodec::new().serialize(&obj, &mut NoRefs).unwrap()
    }

    #[derive(Default)]
    struct StubState {
        loads: HashMap<Oid, (Vec<u8>, Tid)>,
        before: HashMap<Oid, (Vec<u8>, Tid, Option<Tid>)>,
        /// Scripted store answers, consumed in order; when empty, stores
        /// answer `One(default_serial)`.
        store_returns: VecDeque<CResult<StoreReturn>>,
        vote_return: Option<CResult<StoreReturn>>,
        default_serial: Tid,
        next_oid: u64,
        finish_tid: Tid,
        /// (oid, prev_serial, version) per store call.
        stores: Vec<(Oid, Tid, String)>,
        events: Vec<String>,
        /// Installed via register_db; lets tpc_finish probe its own lock.
        shared: Option<SharedStorage>,
    }

    /// Scripted storage double; clones share state so tests can inspect
    /// calls after the storage moved into a database.
    #[derive(Clone)]
    struct Stub(Arc<Mutex<StubState>>);

    impl Stub {
        fn new() -> (Stub, Arc<Mutex<StubState>>) {
            let state = Arc::new(Mutex::new(StubState {
                default_serial: p64(9),
                next_oid: 1,
                finish_tid: p64(9),
                ..StubState::default()
            }));
            // Seed the root so database construction finds it.
            state.lock().unwrap().loads.insert(Z64, (frame(vec![]), p64(1)));
            (Stub(state.clone()), state)
        }
    }

    impl std::fmt::Display for Stub {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "stub")
        }
    }

    impl Storage for Stub {
        fn load(&mut self, oid: &Oid, _version: &str) -> CResult<(Vec<u8>, Tid)> {
            let state = self.0.lock()?;
            state
                .loads
                .get(oid)
                .cloned()
                .ok_or_else(|| Error::NotFound(crate::types::id_repr(oid)))
        }

        fn load_before(
            &mut self,
            oid: &Oid,
            _tid: &Tid,
        ) -> CResult<Option<(Vec<u8>, Tid, Option<Tid>)>> {
            Ok(self.0.lock()?.before.get(oid).cloned())
        }

        fn load_serial(&mut self, oid: &Oid, _tid: &Tid) -> CResult<Vec<u8>> {
            Err(Error::NotFound(crate::types::id_repr(oid)))
        }

        fn store(
            &mut self,
            oid: &Oid,
            prev_serial: &Tid,
            _data: Vec<u8>,
            version: &str,
            _txn: u64,
        ) -> CResult<StoreReturn> {
            let mut state = self.0.lock()?;
            state.stores.push((*oid, *prev_serial, version.to_string()));
            let fallback = StoreReturn::One(state.default_serial);
            state.store_returns.pop_front().unwrap_or(Ok(fallback))
        }

        fn new_oid(&mut self) -> CResult<Oid> {
            let mut state = self.0.lock()?;
            let oid = p64(state.next_oid);
            state.next_oid += 1;
            Ok(oid)
        }

        fn tpc_begin(&mut self, _txn: u64) -> CResult<()> {
            self.0.lock()?.events.push("begin".to_string());
            Ok(())
        }

        fn tpc_vote(&mut self, _txn: u64) -> CResult<StoreReturn> {
            let mut state = self.0.lock()?;
            state.events.push("vote".to_string());
            state.vote_return.take().unwrap_or(Ok(StoreReturn::Nothing))
        }

        fn tpc_finish(
            &mut self,
            _txn: u64,
            callback: Option<&mut dyn FnMut(&Tid)>,
        ) -> CResult<Tid> {
            let (tid, shared) = {
                let mut state = self.0.lock()?;
                state.events.push("finish:enter".to_string());
                (state.finish_tid, state.shared.clone())
            };
            if let Some(shared) = shared {
                // The caller must still hold the commit lock.
                let held = shared.try_lock().is_err();
                self.0
                    .lock()?
                    .events
                    .push(format!("finish:lock-held={}", held));
            }
            if let Some(cb) = callback {
                cb(&tid);
                self.0.lock()?.events.push("finish:callback-done".to_string());
            }
            self.0.lock()?.events.push("finish:exit".to_string());
            Ok(tid)
        }

        fn tpc_abort(&mut self, _txn: u64) -> CResult<()> {
            self.0.lock()?.events.push("abort".to_string());
            Ok(())
        }

        fn sort_key(&self) -> String {
            "stub".to_string()
        }

        fn size(&self) -> u64 {
            0
        }

        fn status(&self) -> CResult<Status> {
            Ok(Status { name: "stub".to_string(), objects: 0, revisions: 0, size: 0 })
        }

        fn register_db(&mut self, db: &Database) {
            let shared = db.storage_shared();
            if let Ok(mut state) = self.0.lock() {
                state.shared = Some(shared);
            }
        }
    }

    fn memory_db() -> CResult<Database> {
        Database::new(MemoryStorage::new())
    }

    /// Loads the root, stores one field on it and commits, returning the
    /// commit tid.
    fn commit_root_field(conn: &mut Connection, key: &str, value: Value) -> CResult<Tid> {
        let txn = conn.set_local_transaction();
        let root = conn.root()?;
        if root.is_ghost() {
            conn.setstate(&root)?;
        }
        root.set(key, value)?;
        conn.register(&root);
        txn.commit(conn)
    }

    // ---- scenarios -------------------------------------------------------

    #[test]
    fn s1_root_load() -> CResult<()> {
        let (stub, _state) = Stub::new();
        let db = Database::new(stub)?;
        let mut conn = db.open()?;

        let root = conn.root()?;
        assert!(root.is_ghost());
        assert_eq!(root.oid(), Some(Z64));
        assert_eq!(root.serial(), p64(1));
        assert!(Arc::ptr_eq(&conn.test_cached(&Z64).unwrap(), &root));
        assert_eq!(conn.transfer_counts(false), (1, 0));

        // Clearing resets the counters.
        conn.transfer_counts(true);
        assert_eq!(conn.transfer_counts(false), (0, 0));
        Ok(())
    }

    #[test]
    fn s2_add_and_commit() -> CResult<()> {
        let (stub, state) = Stub::new();
        state.lock().unwrap().next_oid = 5;
        let db = Database::new(stub)?;
        let mut conn = db.open()?;
        let peer = db.open()?;
        let txn = conn.set_local_transaction();

        let obj = PObject::new(state_map_one());
        let oid = conn.add(&obj)?;
        assert_eq!(oid, p64(5));
        assert_eq!(conn.test_added_len(), 1);

        let tid = txn.commit(&mut conn)?;
        assert_eq!(tid, p64(9));
        assert_eq!(obj.serial(), p64(9));
        assert_eq!(obj.phase(), Phase::Saved);
        assert!(Arc::ptr_eq(&conn.test_cached(&p64(5)).unwrap(), &obj));
        assert_eq!(conn.test_added_len(), 0);
        assert!(conn.test_creating().is_empty());
        assert!(conn.test_modified().is_empty());

        // The storage saw a first-revision store on trunk.
        let calls = state.lock().unwrap().stores.clone();
        assert_eq!(calls, vec![(p64(5), Z64, String::new())]);

        // The peer heard about the commit, the committer did not.
        assert!(peer.test_queue().is_invalidated(&p64(5)));
        assert_eq!(peer.test_queue().txn_time(), Some(p64(9)));
        assert!(conn.test_queue().is_empty());
        Ok(())
    }

    fn state_map_one() -> StateMap {
        state(vec![("n", Value::Int(1))])
    }

    #[test]
    fn s3_conflict_at_commit() -> CResult<()> {
        let (stub, state) = Stub::new();
        state
            .lock()
            .unwrap()
            .loads
            .insert(p64(7), (frame(vec![("n", Value::Int(1))]), p64(6)));
        let db = Database::new(stub)?;
        let mut conn = db.open()?;
        let txn = conn.set_local_transaction();

        let obj = conn.get(p64(7))?;
        conn.setstate(&obj)?;
        // A peer rewrites the object at tid 8.
        conn.invalidate(&p64(8), [p64(7)]);
        obj.set("n", Value::Int(2))?;
        conn.register(&obj);

        conn.tpc_begin(&txn, false)?;
        assert_eq!(conn.commit(&obj, &txn), Err(Error::Conflict(p64(7))));
        conn.tpc_abort(&txn)?;
        Ok(())
    }

    #[test]
    fn s4_mvcc_read_falls_back() -> CResult<()> {
        let (stub, state) = Stub::new();
        {
            let mut st = state.lock().unwrap();
            st.loads
                .insert(p64(7), (frame(vec![("n", Value::Int(1))]), p64(6)));
            st.before
                .insert(p64(7), (frame(vec![("n", Value::Int(0))]), p64(6), Some(p64(8))));
        }
        let db = Database::new(stub)?;
        let mut conn = db.open()?;

        let obj = conn.get(p64(7))?;
        conn.invalidate(&p64(8), [p64(7)]);
        conn.setstate(&obj)?;

        assert_eq!(obj.serial(), p64(6));
        assert_eq!(obj.get("n")?, Some(Value::Int(0)));
        assert!(conn.test_queue().noncurrent_contains(&p64(7)));
        Ok(())
    }

    #[test]
    fn s5_independent_object_accepts_the_current_revision() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let txn = conn.set_local_transaction();

        let obj = PObject::with_independent(state_map_one(), || true);
        let oid = conn.add(&obj)?;
        txn.commit(&mut conn)?;

        conn.cache_minimize(None);
        assert!(obj.is_ghost());
        conn.invalidate(&p64(99), [oid]);
        conn.setstate(&obj)?;

        assert_eq!(obj.phase(), Phase::Saved);
        assert!(!conn.test_queue().is_invalidated(&oid));
        Ok(())
    }

    #[test]
    fn s6_subtransactions_promote_into_one_commit() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let peer = db.open()?;
        let txn = conn.set_local_transaction();

        let a = PObject::new(state(vec![("name", Value::Text("a".to_string()))]));
        let oid_a = conn.add(&a)?;
        txn.commit_subtransaction(&mut conn)?;
        assert!(conn.in_subtransaction());

        let b = PObject::new(state(vec![("name", Value::Text("b".to_string()))]));
        let oid_b = conn.add(&b)?;
        txn.commit_subtransaction(&mut conn)?;

        // Nothing reached the real storage yet.
        assert_eq!(db.status()?.objects, 1);

        let tid = txn.commit(&mut conn)?;
        assert!(!conn.in_subtransaction());
        assert_eq!(db.status()?.objects, 3);
        assert_eq!(a.serial(), tid);
        assert_eq!(b.serial(), tid);

        // One broadcast carried both oids.
        assert!(peer.test_queue().is_invalidated(&oid_a));
        assert!(peer.test_queue().is_invalidated(&oid_b));
        assert_eq!(peer.test_queue().txn_time(), Some(tid));
        Ok(())
    }

    #[test]
    fn abort_sub_drops_buffered_work() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let txn = conn.set_local_transaction();

        let a = PObject::new(state_map_one());
        conn.add(&a)?;
        txn.commit_subtransaction(&mut conn)?;
        assert!(conn.in_subtransaction());

        txn.abort(&mut conn)?;
        assert!(!conn.in_subtransaction());
        assert_eq!(a.oid(), None);
        assert_eq!(a.jar(), None);
        assert_eq!(db.status()?.objects, 1);
        Ok(())
    }

    // ---- testable properties ---------------------------------------------

    #[test]
    fn identity_is_preserved_within_a_connection() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let first = conn.root()?;
        conn.setstate(&first)?;
        let second = conn.root()?;
        assert!(Arc::ptr_eq(&first, &second));
        Ok(())
    }

    #[test]
    fn isolation_invalidations_apply_only_at_the_flush() -> CResult<()> {
        let db = memory_db()?;
        let mut writer = db.open()?;
        let mut reader = db.open()?;
        reader.set_local_transaction();

        let root = reader.root()?;
        reader.setstate(&root)?;
        commit_root_field(&mut writer, "color", Value::Text("red".to_string()))?;

        // Queued, but the loaded object is untouched.
        assert!(reader.test_queue().is_invalidated(&Z64));
        assert!(!root.is_ghost());

        reader.sync()?;
        assert!(root.is_ghost());
        assert!(reader.test_queue().is_empty());
        Ok(())
    }

    #[test]
    fn mvcc_roundtrip_reads_the_older_revision() -> CResult<()> {
        let db = memory_db()?;
        let mut writer = db.open()?;
        let writer_txn = writer.set_local_transaction();

        // Publish a child object.
        let child = PObject::new(state(vec![("v", Value::Int(1))]));
        let root = writer.root()?;
        writer.setstate(&root)?;
        root.set("child", Value::Ref(child.clone()))?;
        writer.register(&root);
        let t1 = writer_txn.commit(&mut writer)?;
        let child_oid = child.oid().unwrap();

        // A reader maps the child but never loads it.
        let mut reader = db.open()?;
        reader.set_local_transaction();
        let stale = reader.get(child_oid)?;
        assert!(stale.is_ghost());

        // The writer moves on.
        child.set("v", Value::Int(2))?;
        writer.register(&child);
        let t2 = writer_txn.commit(&mut writer)?;

        // The reader still sees the revision current at its read bound.
        reader.setstate(&stale)?;
        assert_eq!(stale.serial(), t1);
        assert_eq!(stale.get("v")?, Some(Value::Int(1)));
        assert!(reader.test_queue().noncurrent_contains(&child_oid));
        assert!(t1 < t2);
        Ok(())
    }

    #[test]
    fn read_conflicts_stick_until_the_transaction_ends() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let txn = conn.set_local_transaction();

        let obj = PObject::new(state_map_one());
        let oid = conn.add(&obj)?;
        txn.commit(&mut conn)?;
        conn.cache_minimize(None);

        // Invalidated with a bound so early no revision predates it: the
        // fallback finds nothing and the read conflicts.
        conn.invalidate(&p64(1), [oid]);
        assert_eq!(conn.setstate(&obj), Err(Error::ReadConflict(oid)));
        assert!(conn.test_has_conflict(&oid));

        // Committing the object now re-raises, however clean it looks.
        conn.tpc_begin(&txn, false)?;
        assert_eq!(conn.commit(&obj, &txn), Err(Error::ReadConflict(oid)));

        // The transaction boundary clears the grudge.
        conn.tpc_abort(&txn)?;
        assert!(!conn.test_has_conflict(&oid));
        Ok(())
    }

    #[test]
    fn resolved_serial_turns_the_object_into_a_ghost() -> CResult<()> {
        let (stub, state) = Stub::new();
        state
            .lock()
            .unwrap()
            .loads
            .insert(p64(3), (frame(vec![("n", Value::Int(1))]), p64(2)));
        let db = Database::new(stub)?;
        let mut conn = db.open()?;
        let txn = conn.set_local_transaction();

        let obj = conn.get(p64(3))?;
        conn.setstate(&obj)?;
        obj.set("n", Value::Int(2))?;
        obj.set_resolvable(true);
        conn.register(&obj);

        state
            .lock()
            .unwrap()
            .store_returns
            .push_back(Ok(StoreReturn::One(RESOLVED_SERIAL)));
        txn.commit(&mut conn)?;

        // The merged state lives in the storage; nothing stays in memory.
        assert!(obj.is_ghost());
        Ok(())
    }

    #[test]
    fn storage_error_payloads_surface_without_touching_metadata() -> CResult<()> {
        let (stub, state) = Stub::new();
        state
            .lock()
            .unwrap()
            .loads
            .insert(p64(3), (frame(vec![("n", Value::Int(1))]), p64(2)));
        let db = Database::new(stub)?;
        let mut conn = db.open()?;
        let txn = conn.set_local_transaction();

        let obj = conn.get(p64(3))?;
        conn.setstate(&obj)?;
        obj.set("n", Value::Int(2))?;
        conn.register(&obj);

        state
            .lock()
            .unwrap()
            .store_returns
            .push_back(Ok(StoreReturn::Fail(Error::Internal("zap".to_string()))));
        assert_eq!(
            txn.commit(&mut conn),
            Err(Error::Internal("zap".to_string()))
        );
        assert_eq!(obj.serial(), p64(2));
        Ok(())
    }

    #[test]
    fn vote_may_answer_serials_in_batches() -> CResult<()> {
        let (stub, state) = Stub::new();
        {
            let mut st = state.lock().unwrap();
            st.loads
                .insert(p64(3), (frame(vec![("n", Value::Int(1))]), p64(2)));
            st.loads
                .insert(p64(4), (frame(vec![("n", Value::Int(1))]), p64(2)));
            // Stores answer nothing; the vote delivers both serials.
            st.store_returns.push_back(Ok(StoreReturn::Nothing));
            st.store_returns.push_back(Ok(StoreReturn::Nothing));
            st.vote_return = Some(Ok(StoreReturn::Many(vec![
                (p64(3), p64(9)),
                (p64(4), p64(9)),
            ])));
        }
        let db = Database::new(stub)?;
        let mut conn = db.open()?;
        let txn = conn.set_local_transaction();

        for oid in [p64(3), p64(4)] {
            let obj = conn.get(oid)?;
            conn.setstate(&obj)?;
            obj.set("n", Value::Int(2))?;
            conn.register(&obj);
        }
        txn.commit(&mut conn)?;

        for oid in [p64(3), p64(4)] {
            let obj = conn.get(oid)?;
            assert_eq!(obj.serial(), p64(9));
            assert_eq!(obj.phase(), Phase::Saved);
        }
        Ok(())
    }

    #[test]
    fn abort_leaves_no_trace_of_the_transaction() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let txn = conn.set_local_transaction();

        let root = conn.root()?;
        conn.setstate(&root)?;
        root.set("color", Value::Text("red".to_string()))?;
        conn.register(&root);
        let item = PObject::new(state_map_one());
        conn.add(&item)?;

        conn.tpc_begin(&txn, false)?;
        conn.commit(&root, &txn)?;
        conn.commit(&item, &txn)?;
        conn.tpc_abort(&txn)?;
        txn.clear();

        assert_eq!(item.oid(), None);
        assert_eq!(item.jar(), None);
        assert_eq!(conn.test_added_len(), 0);
        assert!(conn.test_creating().is_empty());
        assert!(root.is_ghost());

        // The next read sees the untouched committed state.
        conn.setstate(&root)?;
        assert_eq!(root.get("color")?, None);
        Ok(())
    }

    #[test]
    fn finish_broadcasts_under_the_commit_lock() -> CResult<()> {
        let (stub, state) = Stub::new();
        state
            .lock()
            .unwrap()
            .loads
            .insert(p64(3), (frame(vec![("n", Value::Int(1))]), p64(2)));
        let db = Database::new(stub)?;
        let mut conn = db.open()?;
        let peer = db.open()?;
        let txn = conn.set_local_transaction();

        let obj = conn.get(p64(3))?;
        conn.setstate(&obj)?;
        obj.set("n", Value::Int(2))?;
        conn.register(&obj);
        txn.commit(&mut conn)?;

        let events = state.lock().unwrap().events.clone();
        let enter = events.iter().position(|e| e == "finish:enter").unwrap();
        let held = events
            .iter()
            .position(|e| e == "finish:lock-held=true")
            .expect("the commit lock was not held across tpc_finish");
        let delivered = events
            .iter()
            .position(|e| e == "finish:callback-done")
            .unwrap();
        let exit = events.iter().position(|e| e == "finish:exit").unwrap();
        assert!(enter < held && held < delivered && delivered < exit);
        assert!(peer.test_queue().is_invalidated(&p64(3)));
        Ok(())
    }

    // ---- lifecycle and edges ---------------------------------------------

    #[test]
    fn closed_connections_refuse_everything() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let root = conn.root()?;
        conn.close()?;

        assert_eq!(conn.root().err(), Some(Error::Closed));
        assert_eq!(conn.get(Z64).err(), Some(Error::Closed));
        assert_eq!(conn.add(&PObject::new(StateMap::new())).err(), Some(Error::Closed));
        assert_eq!(conn.setstate(&root).err(), Some(Error::Closed));
        assert_eq!(conn.is_read_only().err(), Some(Error::Closed));
        assert_eq!(conn.version().err(), Some(Error::Closed));
        assert_eq!(conn.sort_key().err(), Some(Error::Closed));
        Ok(())
    }

    #[test]
    fn close_runs_callbacks_once_and_swallows_their_errors() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let ran = Arc::new(Mutex::new(0));
        let counter = ran.clone();
        conn.on_close_callback(move || {
            *counter.lock().unwrap() += 1;
            Err(Error::Internal("callback exploded".to_string()))
        });
        conn.close()?;
        conn.close()?;
        assert_eq!(*ran.lock().unwrap(), 1);
        Ok(())
    }

    #[test]
    fn adding_an_object_owned_elsewhere_is_refused() -> CResult<()> {
        let db = memory_db()?;
        let mut one = db.open()?;
        let mut two = db.open()?;

        let obj = PObject::new(state_map_one());
        one.add(&obj)?;
        assert!(matches!(
            two.add(&obj),
            Err(Error::InvalidObjectReference(_))
        ));
        // Adding to its own connection again just returns the oid.
        assert_eq!(one.add(&obj)?, obj.oid().unwrap());
        Ok(())
    }

    #[test]
    #[serial]
    fn closed_connections_park_their_cache_for_the_next_open() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let mut writer = db.open()?;
        let id = conn.id();
        let root = conn.root()?;
        conn.setstate(&root)?;
        conn.close()?;

        // A peer commits while the session is parked.
        commit_root_field(&mut writer, "color", Value::Text("red".to_string()))?;

        let mut revived = db.open()?;
        assert_eq!(revived.id(), id);
        let root_again = revived.root()?;
        // Same object, already flushed to a ghost on reopen.
        assert!(Arc::ptr_eq(&root, &root_again));
        assert!(root_again.is_ghost());
        revived.setstate(&root_again)?;
        assert_eq!(
            root_again.get("color")?,
            Some(Value::Text("red".to_string()))
        );
        Ok(())
    }

    #[test]
    #[serial]
    fn reset_caches_discards_parked_state_on_reopen() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let root = conn.root()?;
        conn.close()?;

        db::reset_caches();
        let mut reopened = db.open()?;
        let fresh_root = reopened.root()?;
        assert!(!Arc::ptr_eq(&root, &fresh_root));
        Ok(())
    }

    #[test]
    fn version_connections_skip_the_historical_fallback() -> CResult<()> {
        let db = memory_db()?;
        let mut trunk = db.open()?;
        let obj = PObject::new(state_map_one());
        let oid = {
            let txn = trunk.set_local_transaction();
            trunk.add(&obj)?;
            txn.commit(&mut trunk)?;
            obj.oid().unwrap()
        };

        let mut branch = db.open_version("beta")?;
        assert_eq!(branch.version()?, "beta");
        let stale = branch.get(oid)?;
        branch.invalidate(&p64(99), [oid]);
        // Trunk connections would fall back to load_before here.
        assert_eq!(branch.setstate(&stale), Err(Error::ReadConflict(oid)));
        Ok(())
    }

    #[test]
    fn version_commits_shadow_trunk_and_are_recorded() -> CResult<()> {
        let db = memory_db()?;
        let mut branch = db.open_version("beta")?;
        commit_root_field(&mut branch, "flag", Value::Bool(true))?;

        let mut trunk = db.open()?;
        assert_eq!(trunk.modified_in_version(&Z64)?, "beta");
        let root = trunk.root()?;
        trunk.setstate(&root)?;
        assert_eq!(root.get("flag")?, None);

        let branch_root = branch.root()?;
        branch.setstate(&branch_root)?;
        assert_eq!(branch_root.get("flag")?, Some(Value::Bool(true)));
        Ok(())
    }

    #[test]
    fn fresh_objects_reached_by_reference_are_stored_too() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let child = PObject::new(state(vec![("leaf", Value::Bool(true))]));
        commit_root_field(&mut conn, "child", Value::Ref(child.clone()))?;

        let oid = child.oid().expect("the walk assigns an oid");
        assert_eq!(child.jar(), Some(conn.id()));
        assert_eq!(child.phase(), Phase::Saved);

        // A second connection can reach it through the root.
        let mut other = db.open()?;
        let root = other.root()?;
        other.setstate(&root)?;
        match root.get("child")? {
            Some(Value::Ref(o)) => {
                assert_eq!(o.oid(), Some(oid));
                other.setstate(&o)?;
                assert_eq!(o.get("leaf")?, Some(Value::Bool(true)));
            }
            unexpected => panic!("expected a reference, got {:?}", unexpected),
        }
        Ok(())
    }

    #[test]
    fn exchange_rebinds_an_oid_to_a_replacement() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        commit_root_field(&mut conn, "gen", Value::Int(1))?;

        let root = conn.root()?;
        let replacement = PObject::new(state(vec![("gen", Value::Int(2))]));
        conn.exchange(&root, &replacement)?;
        assert!(Arc::ptr_eq(
            &conn.test_cached(&Z64).unwrap(),
            &replacement
        ));

        let txn = conn.transaction();
        txn.commit(&mut conn)?;

        let mut other = db.open()?;
        let seen = other.root()?;
        other.setstate(&seen)?;
        assert_eq!(seen.get("gen")?, Some(Value::Int(2)));
        Ok(())
    }

    #[test]
    fn oldstate_reads_a_historical_revision() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let t1 = commit_root_field(&mut conn, "v", Value::Int(1))?;
        commit_root_field(&mut conn, "v", Value::Int(2))?;

        let root = conn.root()?;
        let old = conn.oldstate(&root, &t1)?;
        assert_eq!(old.get("v"), Some(&Value::Int(1)));
        // The live object is untouched.
        conn.setstate(&root)?;
        assert_eq!(root.get("v")?, Some(Value::Int(2)));
        Ok(())
    }

    #[test]
    fn sort_key_combines_storage_and_connection() -> CResult<()> {
        let db = memory_db()?;
        let conn = db.open()?;
        assert_eq!(conn.sort_key()?, format!("memory:{}", conn.id()));
        Ok(())
    }

    #[test]
    fn display_names_the_version() -> CResult<()> {
        let db = memory_db()?;
        let trunk = db.open()?;
        let branch = db.open_version("beta")?;
        assert_eq!(format!("{}", trunk), format!("<Connection {}>", trunk.id()));
        assert_eq!(
            format!("{}", branch),
            format!("<Connection {} (in version \"beta\")>", branch.id())
        );
        Ok(())
    }

    #[test]
    fn debug_info_accumulates() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        conn.set_debug_info(["request-1".to_string()]);
        conn.set_debug_info(["request-2".to_string()]);
        assert_eq!(conn.debug_info(), ["request-1", "request-2"]);
        Ok(())
    }

    #[test]
    fn config_is_validated_at_open() -> CResult<()> {
        let db = memory_db()?;
        let mut config = crate::connection::ConnectionConfig::default();
        config.cache_size = 0;
        assert!(db.open_with(config).is_err());
        Ok(())
    }

    #[test]
    fn local_transactions_replace_the_ambient_one() -> CResult<()> {
        let db = memory_db()?;
        let mut conn = db.open()?;
        let local = conn.set_local_transaction();
        assert!(Arc::ptr_eq(&local, &conn.transaction()));
        assert!(Arc::ptr_eq(&local, &conn.set_local_transaction()));

        let obj = PObject::new(state_map_one());
        conn.add(&obj)?;
        assert_eq!(local.registered().len(), 1);
        Ok(())
    }
}
