//! Trait boundaries standing in for the memcached binary protocol codec
//! (`KvStore`) and the N1QL query transport (`QueryEngine`). Only the
//! operations the transaction core drives are named here; connection
//! management, TLS, and wire encoding are the concern of a real
//! implementation, not this crate.

use crate::error::KvErrorKind;
use crate::id::{Cas, DocumentId, MutationToken};
use crate::subdoc::{SubdocResult, SubdocSpec, StoreSemantics};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// Requested durability for a single mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DurabilityRequirement {
    pub persist_to: PersistTo,
    pub replicate_to: ReplicateTo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistTo {
    #[default]
    None,
    Active,
    One,
    Two,
    Three,
    Four,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicateTo {
    #[default]
    None,
    One,
    Two,
    Three,
}

/// A plain document read: body plus any XATTRs requested.
#[derive(Debug, Clone)]
pub struct GetSpecResult {
    pub cas: Cas,
    pub body: Option<Value>,
    pub xattrs: BTreeMap<String, Value>,
    pub is_deleted: bool,
}

/// Current cluster topology fact needed by the observe-seqno pre-check
/// for the observe-seqno pre-check.
#[derive(Debug, Clone)]
pub struct BucketTopology {
    pub node_locator_is_vbucket: bool,
    pub num_replicas: Option<u32>,
}

/// The KV operations the transaction core requires.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Plain document get, optionally pulling soft-deleted ("tombstone")
    /// documents when `access_deleted` is set.
    async fn get(&self, id: &DocumentId, access_deleted: bool) -> Result<GetSpecResult, KvErrorKind>;

    /// Subdocument lookup_in (read-only) batch.
    async fn lookup_in(
        &self,
        id: &DocumentId,
        specs: &[SubdocSpec],
        access_deleted: bool,
    ) -> Result<(Cas, Vec<SubdocResult>), KvErrorKind>;

    /// Subdocument mutate_in batch with whole-document store semantics.
    async fn mutate_in(
        &self,
        id: &DocumentId,
        specs: &[SubdocSpec],
        store_semantics: StoreSemantics,
        cas: Cas,
        create_as_deleted: bool,
    ) -> Result<(Cas, MutationToken, Vec<SubdocResult>), KvErrorKind>;

    /// Whole-document remove.
    async fn remove(&self, id: &DocumentId, cas: Cas) -> Result<MutationToken, KvErrorKind>;

    /// Durability poll for a single node: persisted/current seqno for the
    /// given partition.
    async fn observe_seqno(
        &self,
        bucket: &str,
        partition_id: u16,
        partition_uuid: u64,
        node_is_active: bool,
    ) -> Result<ObserveSeqnoResponse, KvErrorKind>;

    /// Cluster topology fact needed by the observe-seqno pre-check.
    async fn topology(&self, bucket: &str) -> Result<BucketTopology, KvErrorKind>;
}

/// One node's durability poll response.
#[derive(Debug, Clone, Copy)]
pub struct ObserveSeqnoResponse {
    pub current_seqno: u64,
    pub last_persisted_seqno: u64,
    /// Set when a failover occurred since the mutation token was issued.
    pub old_partition_uuid: Option<u64>,
}

/// First-error classification a query response may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorCode {
    Parsing,
    DocumentNotFound,
    DocumentExists,
    CasMismatch,
    AttemptExpired,
    Other,
}

/// A submitted N1QL statement's result.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub rows: Vec<Value>,
    pub first_error: Option<QueryErrorCode>,
}

/// Transaction-tagged query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub query_context: Option<String>,
    pub scan_consistency: Option<String>,
    pub raw: BTreeMap<String, Value>,
}

/// The N1QL query transport surface the transaction core requires.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(&self, statement: &str, options: &QueryOptions) -> Result<QueryResponse, KvErrorKind>;
}
