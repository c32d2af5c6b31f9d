//! Background sweep that removes entries left behind by attempts whose
//! client crashed or lost network before it could commit, roll back, or
//! unstage its own documents.
//!
//! Each running client heartbeats into the keyspace's client record and is
//! handed a contiguous shard range to own; only entries inside an owned
//! shard that are expired and not in a terminal state get cleaned.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;

use txn_durability::ClientRecord;
use txn_types::{
    path_flags, AtrEntry, AtrRef, AttemptState, Cas, DocumentId, KvStore, StagedContent,
    StoreSemantics, SubdocOpcode, SubdocSpec, TransactionLinks,
};

use crate::atr_store::{atr_ref_for_shard, AtrStore, NUM_ATR_SHARDS};
use crate::hooks::{HookAction, NoopHooks, TransactionHooks};

/// One bucket/scope/collection the cleaner sweeps ATR shards within.
#[derive(Debug, Clone)]
pub struct Keyspace {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
}

impl Keyspace {
    pub fn new(bucket: impl Into<String>, scope: impl Into<String>, collection: impl Into<String>) -> Self {
        Self { bucket: bucket.into(), scope: scope.into(), collection: collection.into() }
    }
}

/// Tunables for the lost-attempts cleaner.
#[derive(Clone)]
pub struct CleanerConfig {
    pub client_uuid: String,
    pub keyspaces: Vec<Keyspace>,
    pub heartbeat_interval: Duration,
    /// How long a client's heartbeat stays valid before peers consider it
    /// gone; passed through to [`ClientRecord`].
    pub cleanup_window: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            client_uuid: uuid::Uuid::new_v4().to_string(),
            keyspaces: Vec::new(),
            heartbeat_interval: Duration::from_secs(60),
            cleanup_window: Duration::from_secs(120),
        }
    }
}

/// Sweeps this client's shard range of each configured keyspace's ATR
/// documents, removing entries from attempts that expired without ever
/// reaching a terminal state.
pub struct LostAttemptsCleaner {
    config: CleanerConfig,
    kv: Arc<dyn KvStore>,
    hooks: Arc<dyn TransactionHooks>,
}

impl LostAttemptsCleaner {
    pub fn new(kv: Arc<dyn KvStore>, config: CleanerConfig) -> Self {
        Self { config, kv, hooks: Arc::new(NoopHooks) }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn TransactionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Spawn one background task per configured keyspace. Dropping every
    /// returned handle's join target stops the corresponding loop.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        self.config
            .keyspaces
            .iter()
            .cloned()
            .map(|keyspace| {
                let cleaner = Arc::clone(&self);
                tokio::spawn(async move { cleaner.run_keyspace(keyspace).await })
            })
            .collect()
    }

    async fn run_keyspace(&self, keyspace: Keyspace) {
        let record = ClientRecord::new(
            Arc::clone(&self.kv),
            keyspace.bucket.clone(),
            self.config.cleanup_window,
        );
        loop {
            match self.sweep_once(&keyspace, &record).await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(bucket = %keyspace.bucket, removed, "lost-attempts sweep removed entries");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(bucket = %keyspace.bucket, error = %e, "lost-attempts sweep failed"),
            }
            tokio::time::sleep(self.config.heartbeat_interval).await;
        }
    }

    async fn sweep_once(
        &self,
        keyspace: &Keyspace,
        record: &ClientRecord,
    ) -> Result<usize, txn_types::KvErrorKind> {
        let now_ms = now_millis();
        let (details, _active) = record
            .heartbeat_and_shard(&self.config.client_uuid, now_ms, NUM_ATR_SHARDS as u32)
            .await
            .map_err(|_| txn_types::KvErrorKind::Other("client record read failed".into()))?;

        if details.override_active {
            tracing::debug!(bucket = %keyspace.bucket, "cleanup override active, skipping sweep");
            return Ok(0);
        }

        let shards = self.shards_for_client(details.index_of_this_client, details.num_active_clients);
        self.sweep_shards(keyspace, &shards).await
    }

    /// This client's contiguous shard range, given its sorted index among
    /// active clients. Contiguous ranges (rather than modulo assignment)
    /// keep each client's work set stable as peers join and leave.
    fn shards_for_client(&self, index: u32, num_active_clients: u32) -> Vec<u16> {
        if num_active_clients == 0 {
            return (0..NUM_ATR_SHARDS).collect();
        }
        let total = NUM_ATR_SHARDS as u32;
        let start = index * total / num_active_clients;
        let end = (index + 1) * total / num_active_clients;
        (start as u16..end as u16).collect()
    }

    async fn sweep_shards(&self, keyspace: &Keyspace, shards: &[u16]) -> Result<usize, txn_types::KvErrorKind> {
        let store = AtrStore::new(Arc::clone(&self.kv));
        let server_now_ns = now_nanos();
        let mut removed = 0usize;

        for &shard in shards {
            let atr = atr_ref_for_shard(&keyspace.bucket, &keyspace.scope, &keyspace.collection, shard);
            let entries = store.get_all_entries(&atr).await?;
            for entry in entries.values() {
                if !entry.is_expired_for_cleanup(server_now_ns) {
                    continue;
                }
                if let HookAction::Err(_) = self.hooks.client_record_before_update() {
                    continue;
                }
                self.clean_entry(&atr, entry).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Unstage whatever an expired attempt left behind, then remove its
    /// entry from the ATR.
    ///
    /// `is_expired_for_cleanup` only excludes terminal states
    /// (`NotStarted`/`RolledBack`/`Completed`), and `Committed` is not one of
    /// them: a client can crash after moving its entry to `Committed` but
    /// before it finishes unstaging. So a `Committed` entry here means every
    /// staged document already has its real value and just needs its `txn`
    /// link cleared (or, for removes, actually deleted); any other state
    /// means the attempt never got that far and staging must be undone
    /// instead, mirroring `AttemptContext::commit`/`rollback`.
    async fn clean_entry(
        &self,
        atr: &AtrRef,
        entry: &AtrEntry,
    ) -> Result<(), txn_types::KvErrorKind> {
        let committing = entry.state == AttemptState::Committed;
        for id in &entry.inserted_ids {
            self.unstage_insert(id, committing).await?;
        }
        for id in &entry.replaced_ids {
            self.unstage_replace(id, committing).await?;
        }
        for id in &entry.removed_ids {
            self.unstage_remove(id, committing).await?;
        }
        let store = AtrStore::new(Arc::clone(&self.kv));
        store.remove_entry(atr, &entry.attempt_id).await
    }

    async fn unstage_insert(&self, id: &DocumentId, committing: bool) -> Result<(), txn_types::KvErrorKind> {
        if committing {
            self.finalize_links(id).await
        } else {
            match self.kv.remove(id, Cas::EMPTY).await {
                Ok(_) => Ok(()),
                Err(txn_types::KvErrorKind::DocumentNotFound) => Ok(()),
                Err(e) => Err(e),
            }
        }
    }

    async fn unstage_replace(&self, id: &DocumentId, committing: bool) -> Result<(), txn_types::KvErrorKind> {
        if committing {
            let doc = match self.kv.get(id, true).await {
                Ok(doc) => doc,
                Err(txn_types::KvErrorKind::DocumentNotFound) => return Ok(()),
                Err(e) => return Err(e),
            };
            let links = Self::read_links(&doc.xattrs);
            let content = match links.and_then(|l| l.staged_content) {
                Some(StagedContent::Json(v)) => v,
                _ => doc.body.unwrap_or(serde_json::Value::Null),
            };
            let body_spec = SubdocSpec::new(SubdocOpcode::DictUpsert, "", Some(content), 0);
            self.kv
                .mutate_in(id, &[body_spec], StoreSemantics::Upsert, Cas::EMPTY, false)
                .await?;
        }
        self.finalize_links(id).await
    }

    async fn unstage_remove(&self, id: &DocumentId, committing: bool) -> Result<(), txn_types::KvErrorKind> {
        if committing {
            match self.kv.remove(id, Cas::EMPTY).await {
                Ok(_) => Ok(()),
                Err(txn_types::KvErrorKind::DocumentNotFound) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            self.finalize_links(id).await
        }
    }

    async fn finalize_links(&self, id: &DocumentId) -> Result<(), txn_types::KvErrorKind> {
        let remove_spec = SubdocSpec::new(SubdocOpcode::Remove, "txn", None, path_flags::XATTR);
        match self
            .kv
            .mutate_in(id, &[remove_spec], StoreSemantics::Upsert, Cas::EMPTY, false)
            .await
        {
            Ok(_) => Ok(()),
            Err(txn_types::KvErrorKind::DocumentNotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn read_links(xattrs: &std::collections::BTreeMap<String, serde_json::Value>) -> Option<TransactionLinks> {
        xattrs.get("txn").and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr_store::{select_atr, AtrStore};
    use txn_durability::InMemoryKvStore;

    fn cleaner(kv: Arc<dyn KvStore>) -> LostAttemptsCleaner {
        LostAttemptsCleaner::new(
            kv,
            CleanerConfig {
                client_uuid: "client-a".into(),
                keyspaces: vec![Keyspace::new("b", "_default", "_default")],
                heartbeat_interval: Duration::from_secs(60),
                cleanup_window: Duration::from_secs(120),
            },
        )
    }

    #[test]
    fn single_client_owns_every_shard() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let cleaner = cleaner(kv);
        let shards = cleaner.shards_for_client(0, 1);
        assert_eq!(shards.len(), NUM_ATR_SHARDS as usize);
    }

    #[test]
    fn shard_ranges_partition_without_gaps_or_overlap() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let cleaner = cleaner(kv);
        let mut covered = std::collections::HashSet::new();
        for index in 0..3 {
            for shard in cleaner.shards_for_client(index, 3) {
                assert!(covered.insert(shard), "shard {shard} assigned to more than one client");
            }
        }
        assert_eq!(covered.len(), NUM_ATR_SHARDS as usize);
    }

    #[tokio::test]
    async fn sweep_removes_expired_pending_entry_and_its_orphaned_insert() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let cleaner = cleaner(Arc::clone(&kv));
        let keyspace = Keyspace::new("b", "_default", "_default");

        let atr = select_atr("b", "_default", "_default", "doc-1", Some(0));
        let store = AtrStore::new(Arc::clone(&kv));
        let mut entry = AtrEntry::new("attempt-1", 1, 0);
        entry.state = AttemptState::Pending;
        entry.inserted_ids.push(DocumentId::new("b", "doc-1"));
        store.upsert_entry(&atr, &entry).await.unwrap();

        let removed = cleaner.sweep_shards(&keyspace, &[0]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_entry(&atr, "attempt-1").await.unwrap().is_none());
    }

    /// A client that reached `Committed` but crashed before unstaging must
    /// have its committed documents left with their staged content, not
    /// deleted or reverted, when the cleaner eventually finds the expired
    /// entry.
    #[tokio::test]
    async fn sweep_unstages_committed_entry_without_touching_committed_content() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let cleaner = cleaner(Arc::clone(&kv));
        let keyspace = Keyspace::new("b", "_default", "_default");

        let config = crate::attempt::AttemptConfig {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            kv: Arc::clone(&kv),
            query: None,
            hooks: Arc::new(NoopHooks),
            expiry: crate::expiry::ExpiryClock::start_now(crate::DEFAULT_TIMEOUT),
            durability: Default::default(),
            metadata_collection: None,
        };
        let attempt = crate::attempt::AttemptContext::new(config);

        let replace_id = DocumentId::new("b", "replace-me");
        let remove_id = DocumentId::new("b", "remove-me");
        kv.mutate_in(
            &replace_id,
            &[txn_types::SubdocSpec::new(
                SubdocOpcode::DictUpsert,
                "",
                Some(serde_json::json!({"n": 1})),
                0,
            )],
            StoreSemantics::Insert,
            Cas::EMPTY,
            false,
        )
        .await
        .unwrap();
        kv.mutate_in(
            &remove_id,
            &[txn_types::SubdocSpec::new(
                SubdocOpcode::DictUpsert,
                "",
                Some(serde_json::json!({"n": 2})),
                0,
            )],
            StoreSemantics::Insert,
            Cas::EMPTY,
            false,
        )
        .await
        .unwrap();

        let insert_id = DocumentId::new("b", "insert-me");
        let staged_insert = attempt.insert(&insert_id, serde_json::json!({"n": 3})).await.unwrap();
        let replace_doc = attempt.get(&replace_id).await.unwrap().unwrap();
        attempt.replace(&replace_doc, serde_json::json!({"n": 10})).await.unwrap();
        let remove_doc = attempt.get(&remove_id).await.unwrap().unwrap();
        attempt.remove(&remove_doc).await.unwrap();

        let atr = staged_insert.links.as_ref().unwrap().atr.clone();
        let store = AtrStore::new(Arc::clone(&kv));
        let mut entry = store.get_entry(&atr, &attempt.attempt_id).await.unwrap().unwrap();
        entry.state = AttemptState::Committed;
        entry.expires_after_ms = 0;
        entry.now_ns = 1;
        store.upsert_entry(&atr, &entry).await.unwrap();

        let shards: Vec<u16> = (0..NUM_ATR_SHARDS).collect();
        let removed = cleaner.sweep_shards(&keyspace, &shards).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_entry(&atr, &attempt.attempt_id).await.unwrap().is_none());

        let insert_raw = kv.get(&insert_id, false).await.unwrap();
        assert_eq!(insert_raw.body.unwrap()["n"], serde_json::json!(3));
        assert!(!insert_raw.xattrs.contains_key("txn"));

        let replace_raw = kv.get(&replace_id, false).await.unwrap();
        assert_eq!(replace_raw.body.unwrap()["n"], serde_json::json!(10));
        assert!(!replace_raw.xattrs.contains_key("txn"));

        assert!(kv.get(&remove_id, false).await.is_err());
    }

    /// A client that crashed while still `Pending` (never committed) must
    /// have its staging undone: the insert deleted, and the replace/remove
    /// targets left with their original content and link cleared.
    #[tokio::test]
    async fn sweep_rolls_back_pending_entry_across_all_staged_kinds() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let cleaner = cleaner(Arc::clone(&kv));
        let keyspace = Keyspace::new("b", "_default", "_default");

        let config = crate::attempt::AttemptConfig {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            kv: Arc::clone(&kv),
            query: None,
            hooks: Arc::new(NoopHooks),
            expiry: crate::expiry::ExpiryClock::start_now(crate::DEFAULT_TIMEOUT),
            durability: Default::default(),
            metadata_collection: None,
        };
        let attempt = crate::attempt::AttemptContext::new(config);

        let replace_id = DocumentId::new("b", "replace-me");
        let remove_id = DocumentId::new("b", "remove-me");
        kv.mutate_in(
            &replace_id,
            &[txn_types::SubdocSpec::new(SubdocOpcode::DictUpsert, "", Some(serde_json::json!({"n": 1})), 0)],
            StoreSemantics::Insert,
            Cas::EMPTY,
            false,
        )
        .await
        .unwrap();
        kv.mutate_in(
            &remove_id,
            &[txn_types::SubdocSpec::new(SubdocOpcode::DictUpsert, "", Some(serde_json::json!({"n": 2})), 0)],
            StoreSemantics::Insert,
            Cas::EMPTY,
            false,
        )
        .await
        .unwrap();

        let insert_id = DocumentId::new("b", "insert-me");
        let staged_insert = attempt.insert(&insert_id, serde_json::json!({"n": 3})).await.unwrap();
        let replace_doc = attempt.get(&replace_id).await.unwrap().unwrap();
        attempt.replace(&replace_doc, serde_json::json!({"n": 10})).await.unwrap();
        let remove_doc = attempt.get(&remove_id).await.unwrap().unwrap();
        attempt.remove(&remove_doc).await.unwrap();

        let atr = staged_insert.links.as_ref().unwrap().atr.clone();
        let store = AtrStore::new(Arc::clone(&kv));
        let mut entry = store.get_entry(&atr, &attempt.attempt_id).await.unwrap().unwrap();
        assert_eq!(entry.state, AttemptState::Pending);
        entry.expires_after_ms = 0;
        entry.now_ns = 1;
        store.upsert_entry(&atr, &entry).await.unwrap();

        let shards: Vec<u16> = (0..NUM_ATR_SHARDS).collect();
        let removed = cleaner.sweep_shards(&keyspace, &shards).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_entry(&atr, &attempt.attempt_id).await.unwrap().is_none());

        assert!(kv.get(&insert_id, false).await.is_err());

        let replace_raw = kv.get(&replace_id, false).await.unwrap();
        assert_eq!(replace_raw.body.unwrap()["n"], serde_json::json!(1));
        assert!(!replace_raw.xattrs.contains_key("txn"));

        let remove_raw = kv.get(&remove_id, false).await.unwrap();
        assert_eq!(remove_raw.body.unwrap()["n"], serde_json::json!(2));
        assert!(!remove_raw.xattrs.contains_key("txn"));
    }

    #[tokio::test]
    async fn sweep_leaves_fresh_entries_alone() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let cleaner = cleaner(Arc::clone(&kv));
        let keyspace = Keyspace::new("b", "_default", "_default");

        let atr = select_atr("b", "_default", "_default", "doc-1", Some(0));
        let store = AtrStore::new(Arc::clone(&kv));
        let mut entry = AtrEntry::new("attempt-1", 15_000, now_nanos());
        entry.state = AttemptState::Pending;
        store.upsert_entry(&atr, &entry).await.unwrap();

        let removed = cleaner.sweep_shards(&keyspace, &[0]).await.unwrap();
        assert_eq!(removed, 0);
        assert!(store.get_entry(&atr, "attempt-1").await.unwrap().is_some());
    }
}
