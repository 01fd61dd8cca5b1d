//! The sync engine: get-then-put cycles against the remote collection.
//!
//! The engine owns the sync cursor, the last-sync timestamps and the
//! remote collection identity, persisting all four through the metadata
//! store after every change. One cycle pulls remote updates (repeating
//! while the server reports the batch incomplete), confirms the
//! collection identity, then pushes pending local records, replaying
//! missed updates when the push fails its `since` precondition.
//!
//! Cycles never overlap: all cycle state sits behind one async mutex, so
//! a second `sync_now` simply waits for the first to finish.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::metadata::{keys, MetadataStore};
use crate::protocol::{BlobRef, DeleteReason, Delta};
use crate::record::{dedup_keep_last, validate_batch, SyncRecord};
use crate::store::{LocalStore, StatusKind, SyncStatus};
use crate::transport::Transport;

/// How many times one cycle replays missed updates and retries a push
/// whose `since` precondition failed, before giving up.
const PUT_RETRY_LIMIT: usize = 5;

struct EngineState {
    /// False until the metadata store has been consulted
    loaded: bool,
    cursor: u64,
    last_sync_time: Option<i64>,
    last_sync_put: Option<i64>,
    collection_id: Option<String>,
}

/// Drives synchronization of a local record store with one remote
/// collection.
pub struct SyncEngine {
    transport: Arc<dyn Transport>,
    local: Arc<dyn LocalStore>,
    metadata: Arc<dyn MetadataStore>,
    state: Mutex<EngineState>,
}

impl SyncEngine {
    /// Creates an engine with injected collaborators. Call [`load`]
    /// before syncing; operations fail with [`SyncError::NotLoaded`]
    /// until the persisted state has been read.
    ///
    /// [`load`]: SyncEngine::load
    pub fn new(
        transport: Arc<dyn Transport>,
        local: Arc<dyn LocalStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            transport,
            local,
            metadata,
            state: Mutex::new(EngineState {
                loaded: false,
                cursor: 0,
                last_sync_time: None,
                last_sync_put: None,
                collection_id: None,
            }),
        }
    }

    /// Loads cursor, timestamps and collection identity from the
    /// metadata store.
    pub async fn load(&self) -> Result<(), SyncError> {
        let values = self
            .metadata
            .get(&[
                keys::SYNC_POSITION,
                keys::LAST_SYNC_TIME,
                keys::LAST_SYNC_PUT,
                keys::COLLECTION_ID,
            ])
            .await?;
        let mut state = self.state.lock().await;
        state.cursor = values
            .get(keys::SYNC_POSITION)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        state.last_sync_time = values.get(keys::LAST_SYNC_TIME).and_then(Value::as_i64);
        state.last_sync_put = values.get(keys::LAST_SYNC_PUT).and_then(Value::as_i64);
        state.collection_id = values
            .get(keys::COLLECTION_ID)
            .and_then(Value::as_str)
            .map(str::to_string);
        state.loaded = true;
        debug!(
            cursor = state.cursor,
            collection_id = ?state.collection_id,
            "loaded sync state"
        );
        Ok(())
    }

    /// Runs one full sync cycle: pull remote updates, then push pending
    /// local changes.
    ///
    /// If the remote collection has been deleted this fails with
    /// [`SyncError::CollectionDeleted`] before the push phase, unless
    /// `force_put` is set, in which case local state is reset and the
    /// push proceeds, effectively recreating the collection. Confirm
    /// with the user before forcing.
    pub async fn sync_now(&self, force_put: bool) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            return Err(SyncError::NotLoaded);
        }
        debug!(cursor = state.cursor, "starting sync cycle");
        match self.get_updates(&mut state).await {
            Ok(()) => {
                self.send_status(StatusKind::SyncGet);
            }
            Err(SyncError::CollectionDeleted) if force_put => {
                debug!("collection deleted remotely, continuing with push");
                self.send_status(StatusKind::Error {
                    phase: "sync_get_deleted",
                    detail: SyncError::CollectionDeleted.to_string(),
                });
                self.reset_state(&mut state).await?;
            }
            Err(e) => {
                if !matches!(e, SyncError::CollectionDeleted) {
                    self.send_status(StatusKind::Error {
                        phase: "sync_get",
                        detail: e.to_string(),
                    });
                }
                return Err(e);
            }
        }
        self.put_updates(&mut state).await
    }

    /// Deletes the server-side collection without touching local
    /// records. The reason is stored on the server.
    pub async fn delete_collection(&self, reason: DeleteReason) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            return Err(SyncError::NotLoaded);
        }
        if let Err(e) = self.transport.delete_collection(&reason).await {
            self.send_status(StatusKind::Error {
                phase: "delete_collection",
                detail: e.to_string(),
            });
            return Err(e);
        }
        state.last_sync_time = Some(0);
        state.last_sync_put = Some(0);
        let mut updates = HashMap::new();
        updates.insert(keys::LAST_SYNC_TIME.to_string(), Some(json!(0)));
        updates.insert(keys::LAST_SYNC_PUT.to_string(), Some(json!(0)));
        self.metadata.put_many(updates).await?;
        self.send_status(StatusKind::DeleteCollection);
        Ok(())
    }

    /// Clears all sync state, in memory and in the metadata store, and
    /// marks every local record pending again. Idempotent.
    pub async fn reset(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        self.reset_state(&mut state).await
    }

    /// The current sync cursor.
    pub async fn cursor(&self) -> u64 {
        self.state.lock().await.cursor
    }

    /// Epoch milliseconds of the last completed pull or push, 0 if never.
    pub async fn last_sync_time(&self) -> i64 {
        self.state.lock().await.last_sync_time.unwrap_or(0)
    }

    /// Epoch milliseconds of the last accepted push, 0 if never.
    pub async fn last_sync_put(&self) -> i64 {
        self.state.lock().await.last_sync_put.unwrap_or(0)
    }

    /// The last confirmed collection identity.
    pub async fn collection_id(&self) -> Option<String> {
        self.state.lock().await.collection_id.clone()
    }

    /// Pull phase: fetch and apply deltas until the server reports no
    /// more pending data.
    async fn get_updates(&self, state: &mut EngineState) -> Result<(), SyncError> {
        loop {
            let delta = self
                .transport
                .fetch(state.cursor, state.collection_id.as_deref())
                .await?;
            self.confirm_collection_id(state, delta.collection_id.as_deref())
                .await?;
            let incomplete = delta.incomplete;
            self.apply_delta(state, delta).await?;
            if !incomplete {
                return Ok(());
            }
            debug!(cursor = state.cursor, "delta incomplete, fetching next batch");
        }
    }

    /// Applies one delta: hand deduplicated records to the local store,
    /// advance the cursor to the delta's upper bound, stamp the sync
    /// time. An empty delta only stamps the time.
    async fn apply_delta(&self, state: &mut EngineState, delta: Delta) -> Result<(), SyncError> {
        if !delta.objects.is_empty() {
            let upper_bound = delta.upper_bound();
            let records: Vec<SyncRecord> = dedup_keep_last(delta.objects)
                .into_iter()
                .map(|(_, record)| record)
                .collect();
            debug!(count = records.len(), "applying received records");
            self.local.objects_received(records).await?;
            if let Some(position) = upper_bound {
                self.set_cursor(state, position).await?;
            }
        }
        self.stamp_sync_time(state).await
    }

    /// Push phase: validate pending records and send them, replaying
    /// missed updates on a `since` precondition failure.
    async fn put_updates(&self, state: &mut EngineState) -> Result<(), SyncError> {
        for _attempt in 0..PUT_RETRY_LIMIT {
            let records = self.local.get_pending_objects().await?;
            if records.is_empty() {
                debug!("no local updates to send");
                return Ok(());
            }
            if let Err(errors) = validate_batch(&records) {
                warn!(count = errors.len(), "pending records failed validation");
                self.send_status(StatusKind::Error {
                    phase: "sync_put",
                    detail: format!("{} record(s) failed validation", errors.len()),
                });
                self.local.report_object_errors(errors.clone()).await;
                return Err(SyncError::InvalidObjects(errors));
            }
            self.send_status(StatusKind::SyncPut {
                count: records.len(),
            });
            debug!(count = records.len(), since = state.cursor, "pushing records");
            let response = match self.transport.push(state.cursor, &records).await {
                Ok(response) => response,
                Err(e) => {
                    self.send_status(StatusKind::Error {
                        phase: "sync_put",
                        detail: e.to_string(),
                    });
                    return Err(e);
                }
            };
            self.confirm_collection_id(state, response.collection_id.as_deref())
                .await?;
            if response.since_invalid {
                debug!("push rejected by since precondition, replaying missed updates");
                self.send_status(StatusKind::SyncPutPreconditionFailed);
                self.apply_delta(state, response.embedded_delta()).await?;
                continue;
            }
            if response.object_counters.is_empty() {
                return Err(SyncError::NoObjectCounters);
            }
            let position = *response.object_counters.last().unwrap();
            let records = attach_blob_refs(records, &response.blobs);
            self.set_cursor(state, position).await?;
            self.local.objects_saved(records).await?;
            let now = Utc::now().timestamp_millis();
            state.last_sync_put = Some(now);
            state.last_sync_time = Some(now);
            let mut updates = HashMap::new();
            updates.insert(keys::LAST_SYNC_PUT.to_string(), Some(json!(now)));
            updates.insert(keys::LAST_SYNC_TIME.to_string(), Some(json!(now)));
            self.metadata.put_many(updates).await?;
            self.send_status(StatusKind::SyncPutComplete);
            return Ok(());
        }
        warn!("push precondition kept failing, giving up for this cycle");
        Err(SyncError::ConflictNotResolved {
            attempts: PUT_RETRY_LIMIT,
        })
    }

    /// Checks a collection identity from a response against the cached
    /// one. The first identity seen is adopted; a change means the
    /// remote collection was recreated, so all local sync state is reset
    /// and the triggering cycle step aborts. The new identity is
    /// recorded after the reset so the next cycle proceeds under it.
    async fn confirm_collection_id(
        &self,
        state: &mut EngineState,
        incoming: Option<&str>,
    ) -> Result<(), SyncError> {
        let Some(incoming) = incoming else {
            debug!("response carried no collection id");
            return Ok(());
        };
        match &state.collection_id {
            None => {
                debug!(collection_id = %incoming, "adopting collection id");
                state.collection_id = Some(incoming.to_string());
                self.metadata
                    .put(keys::COLLECTION_ID, Some(json!(incoming)))
                    .await
            }
            Some(current) if current == incoming => Ok(()),
            Some(current) => {
                warn!(old = %current, new = %incoming, "collection id changed, resetting");
                self.reset_state(state).await?;
                state.collection_id = Some(incoming.to_string());
                self.metadata
                    .put(keys::COLLECTION_ID, Some(json!(incoming)))
                    .await?;
                Err(SyncError::CollectionChanged)
            }
        }
    }

    async fn reset_state(&self, state: &mut EngineState) -> Result<(), SyncError> {
        state.cursor = 0;
        state.last_sync_time = None;
        state.last_sync_put = None;
        state.collection_id = None;
        let mut updates = HashMap::new();
        for key in [
            keys::SYNC_POSITION,
            keys::LAST_SYNC_TIME,
            keys::LAST_SYNC_PUT,
            keys::COLLECTION_ID,
        ] {
            updates.insert(key.to_string(), None);
        }
        self.metadata.put_many(updates).await?;
        self.local.reset_saved().await?;
        self.send_status(StatusKind::Reset);
        Ok(())
    }

    async fn set_cursor(&self, state: &mut EngineState, position: u64) -> Result<(), SyncError> {
        state.cursor = position;
        self.metadata
            .put(keys::SYNC_POSITION, Some(json!(position)))
            .await
    }

    async fn stamp_sync_time(&self, state: &mut EngineState) -> Result<(), SyncError> {
        let now = Utc::now().timestamp_millis();
        state.last_sync_time = Some(now);
        self.metadata
            .put(keys::LAST_SYNC_TIME, Some(json!(now)))
            .await
    }

    fn send_status(&self, kind: StatusKind) {
        self.local.status(SyncStatus::now(kind));
    }
}

/// Writes server-side blob locations back onto the records that carried
/// the blobs, dropping the inline payload.
fn attach_blob_refs(mut records: Vec<SyncRecord>, blobs: &[BlobRef]) -> Vec<SyncRecord> {
    for blob_ref in blobs {
        for record in records.iter_mut() {
            if record.id == blob_ref.id && record.record_type == blob_ref.record_type {
                if let Some(blob) = record.blob.as_mut() {
                    blob.href = Some(blob_ref.href.clone());
                    blob.data = None;
                }
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemoryMetadata;
    use crate::protocol::PushResponse;
    use crate::record::{Blob, ObjectError, RecordError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockStore {
        pending: StdMutex<Vec<SyncRecord>>,
        received: StdMutex<Vec<Vec<SyncRecord>>>,
        saved: StdMutex<Vec<Vec<SyncRecord>>>,
        resets: StdMutex<usize>,
        reported: StdMutex<Vec<ObjectError>>,
        statuses: StdMutex<Vec<StatusKind>>,
    }

    impl MockStore {
        fn with_pending(records: Vec<SyncRecord>) -> Self {
            let store = Self::default();
            *store.pending.lock().unwrap() = records;
            store
        }
    }

    #[async_trait]
    impl LocalStore for MockStore {
        async fn get_pending_objects(&self) -> Result<Vec<SyncRecord>, SyncError> {
            Ok(self.pending.lock().unwrap().clone())
        }

        async fn objects_saved(&self, records: Vec<SyncRecord>) -> Result<(), SyncError> {
            self.pending.lock().unwrap().clear();
            self.saved.lock().unwrap().push(records);
            Ok(())
        }

        async fn objects_received(&self, records: Vec<SyncRecord>) -> Result<(), SyncError> {
            self.received.lock().unwrap().push(records);
            Ok(())
        }

        async fn reset_saved(&self) -> Result<(), SyncError> {
            *self.resets.lock().unwrap() += 1;
            Ok(())
        }

        async fn report_object_errors(&self, errors: Vec<ObjectError>) {
            self.reported.lock().unwrap().extend(errors);
        }

        fn status(&self, status: SyncStatus) {
            self.statuses.lock().unwrap().push(status.kind);
        }
    }

    #[derive(Default)]
    struct MockTransport {
        fetches: StdMutex<VecDeque<Result<Delta, SyncError>>>,
        pushes: StdMutex<VecDeque<Result<PushResponse, SyncError>>>,
        fetch_calls: StdMutex<Vec<(u64, Option<String>)>>,
        push_calls: StdMutex<Vec<(u64, Vec<SyncRecord>)>>,
        delete_calls: StdMutex<Vec<DeleteReason>>,
    }

    impl MockTransport {
        fn on_fetch(self, result: Result<Delta, SyncError>) -> Self {
            self.fetches.lock().unwrap().push_back(result);
            self
        }

        fn on_push(self, result: Result<PushResponse, SyncError>) -> Self {
            self.pushes.lock().unwrap().push_back(result);
            self
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn fetch(
            &self,
            since: u64,
            collection_id: Option<&str>,
        ) -> Result<Delta, SyncError> {
            self.fetch_calls
                .lock()
                .unwrap()
                .push((since, collection_id.map(str::to_string)));
            self.fetches
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected fetch")
        }

        async fn push(
            &self,
            since: u64,
            records: &[SyncRecord],
        ) -> Result<PushResponse, SyncError> {
            self.push_calls
                .lock()
                .unwrap()
                .push((since, records.to_vec()));
            self.pushes
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected push")
        }

        async fn delete_collection(&self, reason: &DeleteReason) -> Result<(), SyncError> {
            self.delete_calls.lock().unwrap().push(reason.clone());
            Ok(())
        }
    }

    fn record(id: &str) -> SyncRecord {
        SyncRecord {
            record_type: None,
            id: id.to_string(),
            deleted: None,
            data: Some(json!({"v": 1})),
            blob: None,
        }
    }

    fn delta(collection_id: &str, objects: Vec<(u64, SyncRecord)>) -> Delta {
        Delta {
            collection_id: Some(collection_id.to_string()),
            objects,
            incomplete: false,
            until: None,
        }
    }

    fn accepted(collection_id: &str, counters: Vec<u64>) -> PushResponse {
        PushResponse {
            collection_id: Some(collection_id.to_string()),
            object_counters: counters,
            ..Default::default()
        }
    }

    fn rejected(collection_id: &str, objects: Vec<(u64, SyncRecord)>) -> PushResponse {
        PushResponse {
            collection_id: Some(collection_id.to_string()),
            since_invalid: true,
            objects,
            ..Default::default()
        }
    }

    async fn engine(
        transport: MockTransport,
        store: MockStore,
    ) -> (SyncEngine, Arc<MockTransport>, Arc<MockStore>, Arc<MemoryMetadata>) {
        let transport = Arc::new(transport);
        let store = Arc::new(store);
        let metadata = Arc::new(MemoryMetadata::new());
        let engine = SyncEngine::new(transport.clone(), store.clone(), metadata.clone());
        engine.load().await.unwrap();
        (engine, transport, store, metadata)
    }

    #[tokio::test]
    async fn test_operations_fail_before_load() {
        let transport = Arc::new(MockTransport::default());
        let store = Arc::new(MockStore::default());
        let engine = SyncEngine::new(transport, store, Arc::new(MemoryMetadata::new()));
        assert!(matches!(
            engine.sync_now(false).await,
            Err(SyncError::NotLoaded)
        ));
    }

    #[tokio::test]
    async fn test_load_restores_persisted_state() {
        let metadata = Arc::new(MemoryMetadata::new());
        metadata
            .put(keys::SYNC_POSITION, Some(json!(42)))
            .await
            .unwrap();
        metadata
            .put(keys::COLLECTION_ID, Some(json!("X")))
            .await
            .unwrap();
        let engine = SyncEngine::new(
            Arc::new(MockTransport::default()),
            Arc::new(MockStore::default()),
            metadata,
        );
        engine.load().await.unwrap();
        assert_eq!(engine.cursor().await, 42);
        assert_eq!(engine.collection_id().await.as_deref(), Some("X"));
        assert_eq!(engine.last_sync_time().await, 0);
    }

    #[tokio::test]
    async fn test_empty_delta_stamps_time_and_succeeds() {
        let transport = MockTransport::default().on_fetch(Ok(delta("X", vec![])));
        let (engine, transport, store, _) = engine(transport, MockStore::default()).await;

        engine.sync_now(false).await.unwrap();
        assert_eq!(engine.cursor().await, 0);
        assert!(engine.last_sync_time().await > 0);
        assert_eq!(engine.collection_id().await.as_deref(), Some("X"));
        // No pending records, so no push happened
        assert!(transport.push_calls.lock().unwrap().is_empty());
        assert!(store
            .statuses
            .lock()
            .unwrap()
            .contains(&StatusKind::SyncGet));
    }

    #[tokio::test]
    async fn test_pull_advances_cursor_to_last_position() {
        let transport = MockTransport::default()
            .on_fetch(Ok(delta("X", vec![(1, record("aaa")), (2, record("bbb"))])));
        let (engine, _, store, _) = engine(transport, MockStore::default()).await;

        engine.sync_now(false).await.unwrap();
        assert_eq!(engine.cursor().await, 2);
        let received = store.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].len(), 2);
    }

    #[tokio::test]
    async fn test_pull_prefers_explicit_until() {
        let mut batch = delta("X", vec![(3, record("aaa"))]);
        batch.until = Some(9);
        let transport = MockTransport::default().on_fetch(Ok(batch));
        let (engine, _, _, _) = engine(transport, MockStore::default()).await;

        engine.sync_now(false).await.unwrap();
        assert_eq!(engine.cursor().await, 9);
    }

    #[tokio::test]
    async fn test_incomplete_delta_repeats_pull() {
        let mut first = delta("X", vec![(1, record("aaa"))]);
        first.incomplete = true;
        let transport = MockTransport::default()
            .on_fetch(Ok(first))
            .on_fetch(Ok(delta("X", vec![(2, record("bbb"))])));
        let (engine, transport, store, _) = engine(transport, MockStore::default()).await;

        engine.sync_now(false).await.unwrap();
        assert_eq!(engine.cursor().await, 2);
        assert_eq!(store.received.lock().unwrap().len(), 2);
        // The second fetch resumed from the advanced cursor
        let calls = transport.fetch_calls.lock().unwrap();
        assert_eq!(calls[0].0, 0);
        assert_eq!(calls[1].0, 1);
        assert_eq!(calls[1].1.as_deref(), Some("X"));
    }

    #[tokio::test]
    async fn test_duplicate_keys_in_delta_keep_last() {
        let mut tombstone = record("aaa");
        tombstone.deleted = Some(true);
        tombstone.data = None;
        let transport = MockTransport::default().on_fetch(Ok(delta(
            "X",
            vec![(1, record("aaa")), (2, record("bbb")), (3, tombstone)],
        )));
        let (engine, _, store, _) = engine(transport, MockStore::default()).await;

        engine.sync_now(false).await.unwrap();
        let received = store.received.lock().unwrap();
        assert_eq!(received[0].len(), 2);
        assert_eq!(received[0][0].id, "bbb");
        assert_eq!(received[0][1].id, "aaa");
        assert!(received[0][1].is_deleted());
    }

    #[tokio::test]
    async fn test_push_advances_cursor_and_marks_saved() {
        let transport = MockTransport::default()
            .on_fetch(Ok(delta("X", vec![])))
            .on_push(Ok(accepted("X", vec![1])));
        let store = MockStore::with_pending(vec![record("aaa")]);
        let (engine, transport, store, _) = engine(transport, store).await;

        engine.sync_now(false).await.unwrap();
        assert_eq!(engine.cursor().await, 1);
        assert!(engine.last_sync_put().await > 0);
        assert_eq!(store.saved.lock().unwrap().len(), 1);
        let pushes = transport.push_calls.lock().unwrap();
        assert_eq!(pushes[0].0, 0);
        assert_eq!(pushes[0].1[0].id, "aaa");
        let statuses = store.statuses.lock().unwrap();
        assert!(statuses.contains(&StatusKind::SyncPut { count: 1 }));
        assert!(statuses.contains(&StatusKind::SyncPutComplete));
    }

    #[tokio::test]
    async fn test_deleted_record_with_data_blocks_push() {
        let mut bad = record("aaa");
        bad.deleted = Some(true);
        let transport = MockTransport::default().on_fetch(Ok(delta("X", vec![])));
        let store = MockStore::with_pending(vec![bad]);
        let (engine, transport, store, _) = engine(transport, store).await;

        let result = engine.sync_now(false).await;
        assert!(matches!(result, Err(SyncError::InvalidObjects(_))));
        // The server was never contacted
        assert!(transport.push_calls.lock().unwrap().is_empty());
        let reported = store.reported.lock().unwrap();
        assert_eq!(reported[0].error, RecordError::DeletedWithData);
    }

    #[tokio::test]
    async fn test_duplicate_key_blocks_push() {
        let transport = MockTransport::default().on_fetch(Ok(delta("X", vec![])));
        let store = MockStore::with_pending(vec![record("aaa"), record("aaa")]);
        let (engine, transport, store, _) = engine(transport, store).await;

        let result = engine.sync_now(false).await;
        assert!(matches!(result, Err(SyncError::InvalidObjects(_))));
        assert!(transport.push_calls.lock().unwrap().is_empty());
        assert!(matches!(
            store.reported.lock().unwrap()[0].error,
            RecordError::DuplicateKey(_)
        ));
    }

    #[tokio::test]
    async fn test_since_invalid_replays_delta_then_retries() {
        let transport = MockTransport::default()
            .on_fetch(Ok(delta("X", vec![])))
            .on_push(Ok(rejected("X", vec![(5, record("ccc"))])))
            .on_push(Ok(accepted("X", vec![6])));
        let store = MockStore::with_pending(vec![record("aaa")]);
        let (engine, transport, store, _) = engine(transport, store).await;

        engine.sync_now(false).await.unwrap();
        // The missed record was applied before the retry
        assert_eq!(store.received.lock().unwrap()[0][0].id, "ccc");
        // The retried push used the advanced cursor
        let pushes = transport.push_calls.lock().unwrap();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0].0, 0);
        assert_eq!(pushes[1].0, 5);
        assert_eq!(engine.cursor().await, 6);
        assert!(store
            .statuses
            .lock()
            .unwrap()
            .contains(&StatusKind::SyncPutPreconditionFailed));
    }

    #[tokio::test]
    async fn test_since_invalid_gives_up_after_retry_limit() {
        let mut transport = MockTransport::default().on_fetch(Ok(delta("X", vec![])));
        for position in 0..PUT_RETRY_LIMIT as u64 {
            transport = transport.on_push(Ok(rejected(
                "X",
                vec![(10 + position, record("other"))],
            )));
        }
        let store = MockStore::with_pending(vec![record("aaa")]);
        let (engine, transport, _, _) = engine(transport, store).await;

        let result = engine.sync_now(false).await;
        assert!(matches!(
            result,
            Err(SyncError::ConflictNotResolved { attempts: PUT_RETRY_LIMIT })
        ));
        assert_eq!(transport.push_calls.lock().unwrap().len(), PUT_RETRY_LIMIT);
    }

    #[tokio::test]
    async fn test_collection_id_change_on_fetch_resets() {
        let transport = MockTransport::default()
            .on_fetch(Ok(delta("X", vec![(1, record("aaa"))])))
            .on_fetch(Ok(delta("Y", vec![(1, record("aaa"))])));
        let (engine, _, store, _) = engine(transport, MockStore::default()).await;

        engine.sync_now(false).await.unwrap();
        assert_eq!(engine.cursor().await, 1);

        let result = engine.sync_now(false).await;
        assert!(matches!(result, Err(SyncError::CollectionChanged)));
        // Cursor and timestamps cleared, new identity adopted
        assert_eq!(engine.cursor().await, 0);
        assert_eq!(engine.last_sync_time().await, 0);
        assert_eq!(engine.collection_id().await.as_deref(), Some("Y"));
        assert_eq!(*store.resets.lock().unwrap(), 1);
        // The mismatching response's records were never applied
        assert_eq!(store.received.lock().unwrap().len(), 1);
        assert!(store.statuses.lock().unwrap().contains(&StatusKind::Reset));
    }

    #[tokio::test]
    async fn test_collection_id_change_on_push_resets() {
        let transport = MockTransport::default()
            .on_fetch(Ok(delta("X", vec![])))
            .on_push(Ok(accepted("Y", vec![1])));
        let store = MockStore::with_pending(vec![record("aaa")]);
        let (engine, _, store, _) = engine(transport, store).await;

        let result = engine.sync_now(false).await;
        assert!(matches!(result, Err(SyncError::CollectionChanged)));
        assert_eq!(engine.collection_id().await.as_deref(), Some("Y"));
        assert_eq!(*store.resets.lock().unwrap(), 1);
        // Nothing was marked saved
        assert!(store.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collection_deleted_aborts_without_push() {
        let transport = MockTransport::default().on_fetch(Err(SyncError::CollectionDeleted));
        let store = MockStore::with_pending(vec![record("aaa")]);
        let (engine, transport, _, _) = engine(transport, store).await;

        let result = engine.sync_now(false).await;
        assert!(matches!(result, Err(SyncError::CollectionDeleted)));
        assert!(transport.push_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_put_resets_and_pushes_after_deletion() {
        let transport = MockTransport::default()
            .on_fetch(Err(SyncError::CollectionDeleted))
            .on_push(Ok(accepted("Z", vec![1])));
        let store = MockStore::with_pending(vec![record("aaa")]);
        let (engine, transport, store, _) = engine(transport, store).await;

        engine.sync_now(true).await.unwrap();
        assert_eq!(*store.resets.lock().unwrap(), 1);
        assert_eq!(transport.push_calls.lock().unwrap().len(), 1);
        assert_eq!(engine.cursor().await, 1);
        assert_eq!(engine.collection_id().await.as_deref(), Some("Z"));
    }

    #[tokio::test]
    async fn test_transport_error_aborts_cycle() {
        let transport = MockTransport::default().on_fetch(Err(SyncError::TransportError {
            code: 500,
            detail: String::new(),
        }));
        let store = MockStore::with_pending(vec![record("aaa")]);
        let (engine, transport, store, _) = engine(transport, store).await;

        let result = engine.sync_now(false).await;
        assert!(matches!(
            result,
            Err(SyncError::TransportError { code: 500, .. })
        ));
        assert!(transport.push_calls.lock().unwrap().is_empty());
        assert!(store.statuses.lock().unwrap().iter().any(|kind| matches!(
            kind,
            StatusKind::Error { phase: "sync_get", .. }
        )));
    }

    #[tokio::test]
    async fn test_blob_refs_attached_to_saved_records() {
        let mut rec = record("aaa");
        rec.data = None;
        rec.blob = Some(Blob {
            content_type: "image/png".to_string(),
            data: Some("aGk=".to_string()),
            href: None,
        });
        let mut response = accepted("X", vec![1]);
        response.blobs = vec![BlobRef {
            record_type: None,
            id: "aaa".to_string(),
            href: "/blobs/aaa".to_string(),
        }];
        let transport = MockTransport::default()
            .on_fetch(Ok(delta("X", vec![])))
            .on_push(Ok(response));
        let store = MockStore::with_pending(vec![rec]);
        let (engine, _, store, _) = engine(transport, store).await;

        engine.sync_now(false).await.unwrap();
        let saved = store.saved.lock().unwrap();
        let blob = saved[0][0].blob.as_ref().unwrap();
        assert_eq!(blob.href.as_deref(), Some("/blobs/aaa"));
        assert_eq!(blob.data, None);
        assert_eq!(blob.content_type, "image/png");
    }

    #[tokio::test]
    async fn test_push_without_counters_is_an_error() {
        let transport = MockTransport::default()
            .on_fetch(Ok(delta("X", vec![])))
            .on_push(Ok(accepted("X", vec![])));
        let store = MockStore::with_pending(vec![record("aaa")]);
        let (engine, _, _, _) = engine(transport, store).await;

        assert!(matches!(
            engine.sync_now(false).await,
            Err(SyncError::NoObjectCounters)
        ));
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let (engine, _, store, metadata) =
            engine(MockTransport::default(), MockStore::default()).await;

        engine.reset().await.unwrap();
        engine.reset().await.unwrap();
        assert_eq!(engine.cursor().await, 0);
        assert_eq!(engine.collection_id().await, None);
        assert_eq!(*store.resets.lock().unwrap(), 2);
        assert!(metadata
            .get(&[keys::SYNC_POSITION, keys::COLLECTION_ID])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_cursor_persisted_across_engines() {
        let transport = MockTransport::default()
            .on_fetch(Ok(delta("X", vec![(7, record("aaa"))])));
        let (engine, _, _, metadata) = engine(transport, MockStore::default()).await;
        engine.sync_now(false).await.unwrap();

        let revived = SyncEngine::new(
            Arc::new(MockTransport::default()),
            Arc::new(MockStore::default()),
            metadata,
        );
        revived.load().await.unwrap();
        assert_eq!(revived.cursor().await, 7);
        assert_eq!(revived.collection_id().await.as_deref(), Some("X"));
    }

    #[tokio::test]
    async fn test_delete_collection_zeroes_timestamps() {
        let transport = MockTransport::default()
            .on_fetch(Ok(delta("X", vec![(1, record("aaa"))])));
        let (engine, transport, store, _) = engine(transport, MockStore::default()).await;
        engine.sync_now(false).await.unwrap();
        assert!(engine.last_sync_time().await > 0);

        engine
            .delete_collection(DeleteReason::new("user requested"))
            .await
            .unwrap();
        assert_eq!(engine.last_sync_time().await, 0);
        assert_eq!(engine.last_sync_put().await, 0);
        let deletes = transport.delete_calls.lock().unwrap();
        assert_eq!(deletes[0].reason, "user requested");
        assert!(store
            .statuses
            .lock()
            .unwrap()
            .contains(&StatusKind::DeleteCollection));
    }
}
