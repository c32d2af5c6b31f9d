//! The `_txn:client-record` document: how live clients discover each other
//! and shard lost-attempt cleanup work between themselves.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use txn_types::{
    path_flags, Cas, DocumentId, KvErrorKind, KvStore, PathStatus, StoreSemantics, SubdocOpcode,
    SubdocSpec,
};

/// Well-known key every keyspace's client record is stored under.
pub const CLIENT_RECORD_KEY: &str = "_txn:client-record";

/// Max peer entries evicted from the record in a single heartbeat.
const MAX_EXPIRED_REMOVED_PER_ROUND: usize = 12;

/// One client's entry in the shared record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
    pub heartbeat_ms: u64,
    pub expires_ms: u64,
    pub num_atrs: u32,
}

/// Cleanup-override directive an operator can set on the record to pause
/// or force cleanup behavior cluster-wide.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupOverride {
    pub enabled: bool,
    pub expires_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RecordsXattr {
    clients: BTreeMap<String, ClientEntry>,
    #[serde(rename = "override")]
    override_: CleanupOverride,
}

/// Diagnostic snapshot of one heartbeat round, returned for logging and
/// test assertions.
#[derive(Debug, Clone, Default)]
pub struct ClientRecordDetails {
    pub client_uuid: String,
    pub num_active_clients: u32,
    pub index_of_this_client: u32,
    pub num_existing_clients: u32,
    pub num_expired_clients: u32,
    pub client_is_new: bool,
    pub expired_client_ids: Vec<String>,
    pub override_enabled: bool,
    pub override_active: bool,
    pub override_expires: u64,
    pub cas_now_nanos: u64,
}

#[derive(Debug, Error)]
pub enum ClientRecordError {
    #[error("underlying kv error: {0}")]
    Kv(#[from] KvErrorKind),
    #[error("client record xattr payload was malformed")]
    Malformed,
}

/// CRUD and sharding logic for the per-keyspace client record.
pub struct ClientRecord {
    kv: Arc<dyn KvStore>,
    id: DocumentId,
    cleanup_window: Duration,
}

impl ClientRecord {
    pub fn new(kv: Arc<dyn KvStore>, bucket: impl Into<String>, cleanup_window: Duration) -> Self {
        Self {
            kv,
            id: DocumentId::new(bucket, CLIENT_RECORD_KEY),
            cleanup_window,
        }
    }

    async fn read(&self) -> Result<(Cas, RecordsXattr), ClientRecordError> {
        let spec = SubdocSpec::new(SubdocOpcode::Get, "records", None, path_flags::XATTR);
        match self.kv.lookup_in(&self.id, &[spec], false).await {
            Ok((cas, results)) => match &results[0].outcome {
                Ok(Some(value)) => {
                    let records: RecordsXattr =
                        serde_json::from_value(value.clone()).map_err(|_| ClientRecordError::Malformed)?;
                    Ok((cas, records))
                }
                Ok(None) | Err(PathStatus::PathNotFound) => Ok((cas, RecordsXattr::default())),
                Err(_) => Err(ClientRecordError::Malformed),
            },
            Err(KvErrorKind::DocumentNotFound) => Ok((Cas::EMPTY, RecordsXattr::default())),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, records: &RecordsXattr) -> Result<(), ClientRecordError> {
        let value = serde_json::to_value(records).map_err(|_| ClientRecordError::Malformed)?;
        let spec = SubdocSpec::new(SubdocOpcode::DictUpsert, "records", Some(value), path_flags::XATTR);
        self.kv
            .mutate_in(&self.id, &[spec], StoreSemantics::Upsert, Cas::EMPTY, false)
            .await?;
        Ok(())
    }

    /// Upsert this client's entry, evict up to
    /// [`MAX_EXPIRED_REMOVED_PER_ROUND`] expired peers, and return this
    /// client's shard index among the surviving active clients.
    pub async fn heartbeat_and_shard(
        &self,
        client_uuid: &str,
        now_ms: u64,
        num_atrs: u32,
    ) -> Result<(ClientRecordDetails, Vec<String>), ClientRecordError> {
        let (_cas, mut records) = self.read().await?;

        let client_is_new = !records.clients.contains_key(client_uuid);
        let expires_ms = self.cleanup_window.as_millis() as u64 / 2 + 2_000;
        records.clients.insert(
            client_uuid.to_string(),
            ClientEntry { heartbeat_ms: now_ms, expires_ms, num_atrs },
        );

        let num_existing_clients = records.clients.len() as u32;
        let mut expired: Vec<String> = records
            .clients
            .iter()
            .filter(|(uuid, entry)| {
                *uuid != client_uuid && now_ms.saturating_sub(entry.heartbeat_ms) >= entry.expires_ms
            })
            .map(|(uuid, _)| uuid.clone())
            .collect();
        expired.sort();
        expired.truncate(MAX_EXPIRED_REMOVED_PER_ROUND);
        for uuid in &expired {
            records.clients.remove(uuid);
        }

        self.write(&records).await?;

        let mut active: Vec<String> = records.clients.keys().cloned().collect();
        active.sort();
        let index_of_this_client = active
            .iter()
            .position(|uuid| uuid == client_uuid)
            .unwrap_or(0) as u32;

        let details = ClientRecordDetails {
            client_uuid: client_uuid.to_string(),
            num_active_clients: active.len() as u32,
            index_of_this_client,
            num_existing_clients,
            num_expired_clients: expired.len() as u32,
            client_is_new,
            expired_client_ids: expired,
            override_enabled: records.override_.enabled,
            override_active: records.override_.enabled && now_ms < records.override_.expires_ms,
            override_expires: records.override_.expires_ms,
            cas_now_nanos: now_ms.saturating_mul(1_000_000),
        };
        tracing::debug!(?details, "client record heartbeat");

        Ok((details, active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_store::InMemoryKvStore;

    #[tokio::test]
    async fn first_heartbeat_is_new_and_alone() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let record = ClientRecord::new(kv, "bucket", Duration::from_secs(60));
        let (details, active) = record.heartbeat_and_shard("client-a", 1_000, 3).await.unwrap();
        assert!(details.client_is_new);
        assert_eq!(details.num_active_clients, 1);
        assert_eq!(details.index_of_this_client, 0);
        assert_eq!(active, vec!["client-a".to_string()]);
    }

    #[tokio::test]
    async fn second_client_gets_sorted_index() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let record = ClientRecord::new(kv, "bucket", Duration::from_secs(60));
        record.heartbeat_and_shard("client-b", 1_000, 0).await.unwrap();
        let (details, active) = record.heartbeat_and_shard("client-a", 1_000, 0).await.unwrap();
        assert_eq!(active, vec!["client-a".to_string(), "client-b".to_string()]);
        assert_eq!(details.index_of_this_client, 0);
        assert_eq!(details.num_active_clients, 2);
    }

    #[tokio::test]
    async fn expired_peer_is_evicted() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let record = ClientRecord::new(kv, "bucket", Duration::from_secs(10));
        record.heartbeat_and_shard("client-old", 0, 0).await.unwrap();
        let (details, active) = record
            .heartbeat_and_shard("client-new", 1_000_000, 0)
            .await
            .unwrap();
        assert_eq!(details.expired_client_ids, vec!["client-old".to_string()]);
        assert_eq!(active, vec!["client-new".to_string()]);
    }
}
