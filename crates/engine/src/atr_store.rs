//! Read/write access to Active Transaction Record documents: one JSON
//! object per ATR, keyed `attempts.<attempt_id>` within the document body.

use std::collections::BTreeMap;
use std::sync::Arc;

use txn_types::{AtrEntry, AtrRef, DocumentId, KvErrorKind, KvStore, PathStatus, StoreSemantics, SubdocOpcode, SubdocSpec};

/// Number of candidate ATR documents a transaction's first write hashes
/// into.
pub const NUM_ATR_SHARDS: u16 = 1024;

/// Pick the ATR document this attempt's writes will share, by hashing the
/// first document key touched (unless a hook overrides the shard).
pub fn select_atr(
    bucket: &str,
    scope: &str,
    collection: &str,
    first_key: &str,
    override_shard: Option<u16>,
) -> AtrRef {
    let shard = override_shard.unwrap_or_else(|| hash_to_shard(first_key));
    AtrRef {
        atr_bucket: bucket.to_string(),
        atr_scope: scope.to_string(),
        atr_collection: collection.to_string(),
        atr_id: format!("_txn:atr-{shard:04}"),
    }
}

fn hash_to_shard(key: &str) -> u16 {
    let mut hash: u64 = 1469598103934665603;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    (hash % NUM_ATR_SHARDS as u64) as u16
}

fn atr_doc_id(atr: &AtrRef) -> DocumentId {
    DocumentId::with_collection(
        atr.atr_bucket.clone(),
        atr.atr_scope.clone(),
        atr.atr_collection.clone(),
        atr.atr_id.clone(),
    )
}

/// The `AtrRef` for a given shard number within a keyspace, as used by the
/// lost-attempts cleaner when it sweeps its assigned shard range.
pub fn atr_ref_for_shard(bucket: &str, scope: &str, collection: &str, shard: u16) -> AtrRef {
    AtrRef {
        atr_bucket: bucket.to_string(),
        atr_scope: scope.to_string(),
        atr_collection: collection.to_string(),
        atr_id: format!("_txn:atr-{shard:04}"),
    }
}

fn entry_path(attempt_id: &str) -> String {
    format!("attempts.{attempt_id}")
}

/// CRUD over ATR entries, standing in for the real per-entry CAS-checked
/// subdoc transitions (our underlying store only tracks whole-document
/// CAS, so a transition here is a single document-level mutate_in).
pub struct AtrStore {
    kv: Arc<dyn KvStore>,
}

impl AtrStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn get_entry(&self, atr: &AtrRef, attempt_id: &str) -> Result<Option<AtrEntry>, KvErrorKind> {
        let id = atr_doc_id(atr);
        let spec = SubdocSpec::new(SubdocOpcode::Get, &entry_path(attempt_id), None, 0);
        match self.kv.lookup_in(&id, &[spec], false).await {
            Ok((_cas, results)) => match &results[0].outcome {
                Ok(Some(value)) => Ok(Some(
                    serde_json::from_value(value.clone())
                        .map_err(|e| KvErrorKind::Other(e.to_string()))?,
                )),
                Ok(None) | Err(PathStatus::PathNotFound) => Ok(None),
                Err(status) => Err(KvErrorKind::Other(format!("{status:?}"))),
            },
            Err(KvErrorKind::DocumentNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn upsert_entry(&self, atr: &AtrRef, entry: &AtrEntry) -> Result<(), KvErrorKind> {
        let id = atr_doc_id(atr);
        let value =
            serde_json::to_value(entry).map_err(|e| KvErrorKind::Other(e.to_string()))?;
        let spec = SubdocSpec::new(SubdocOpcode::DictUpsert, &entry_path(&entry.attempt_id), Some(value), 0);
        self.kv
            .mutate_in(&id, &[spec], StoreSemantics::Upsert, txn_types::Cas::EMPTY, false)
            .await?;
        Ok(())
    }

    pub async fn remove_entry(&self, atr: &AtrRef, attempt_id: &str) -> Result<(), KvErrorKind> {
        let id = atr_doc_id(atr);
        let spec = SubdocSpec::new(SubdocOpcode::Remove, &entry_path(attempt_id), None, 0);
        match self.kv.mutate_in(&id, &[spec], StoreSemantics::Upsert, txn_types::Cas::EMPTY, false).await {
            Ok(_) => Ok(()),
            Err(KvErrorKind::Other(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Every entry currently recorded in this ATR document, for the cleaner
    /// to sweep. An ATR document that doesn't exist yet has no entries.
    pub async fn get_all_entries(&self, atr: &AtrRef) -> Result<BTreeMap<String, AtrEntry>, KvErrorKind> {
        let id = atr_doc_id(atr);
        match self.kv.get(&id, true).await {
            Ok(doc) => match doc.body.as_ref().and_then(|b| b.get("attempts")) {
                Some(value) => serde_json::from_value(value.clone())
                    .map_err(|e| KvErrorKind::Other(e.to_string())),
                None => Ok(BTreeMap::new()),
            },
            Err(KvErrorKind::DocumentNotFound) => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txn_durability::InMemoryKvStore;
    use txn_types::AttemptState;

    fn atr_ref() -> AtrRef {
        AtrRef {
            atr_bucket: "b".into(),
            atr_scope: "_default".into(),
            atr_collection: "_default".into(),
            atr_id: "_txn:atr-0001".into(),
        }
    }

    #[test]
    fn shard_selection_is_in_range() {
        for key in ["a", "document-1", "very-long-document-key-indeed"] {
            let atr = select_atr("b", "_default", "_default", key, None);
            let shard: u16 = atr.atr_id.trim_start_matches("_txn:atr-").parse().unwrap();
            assert!(shard < NUM_ATR_SHARDS);
        }
    }

    #[test]
    fn override_shard_is_honored() {
        let atr = select_atr("b", "_default", "_default", "k", Some(42));
        assert_eq!(atr.atr_id, "_txn:atr-0042");
    }

    #[tokio::test]
    async fn roundtrip_entry() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let store = AtrStore::new(kv);
        let atr = atr_ref();
        let mut entry = AtrEntry::new("attempt-1", 15_000, 0);
        entry.state = AttemptState::Pending;
        store.upsert_entry(&atr, &entry).await.unwrap();

        let fetched = store.get_entry(&atr, "attempt-1").await.unwrap().unwrap();
        assert_eq!(fetched.attempt_id, "attempt-1");
        assert_eq!(fetched.state, AttemptState::Pending);

        store.remove_entry(&atr, "attempt-1").await.unwrap();
        assert!(store.get_entry(&atr, "attempt-1").await.unwrap().is_none());
    }
}
