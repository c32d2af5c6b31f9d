//! The attempt context: mediates every document and query operation within
//! one attempt of a transaction.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use txn_concurrency::{classify, BackoffCalculator, ErrorContext, ModeArbiter};
use txn_types::{
    path_flags, AtrEntry, AtrRef, AttemptState, Cas, DocumentId, DurabilityRequirement, ErrorCause,
    ErrorClass, ErrorPolicy, GetSpecResult, KvErrorKind, KvStore, QueryEngine, QueryOptions,
    QueryResponse, RestoreInfo, StagedContent, StoreSemantics, SubdocOpcode, SubdocSpec,
    TransactionGetResult, TransactionLinks,
};

use crate::atr_store::{select_atr, AtrStore};
use crate::expiry::ExpiryClock;
use crate::hooks::{HookAction, TransactionHooks};

/// Wall-clock reading in epoch nanoseconds, matching the clock the cleaner
/// compares `AtrEntry::now_ns` against.
fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Failure surfaced by an attempt-context operation, already resolved past
/// retry: either the attempt should be aborted with this class, or it has
/// expired, or the caller asked for something the state machine forbids.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("operation failed: {0}")]
    Failed(ErrorClass),
    #[error("attempt expired")]
    Expired,
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("{0}")]
    Cause(ErrorCause),
    #[error("operation attempted after commit or rollback")]
    AsyncOperationConflict,
}

impl From<txn_concurrency::AsyncOperationConflict> for AttemptError {
    fn from(_: txn_concurrency::AsyncOperationConflict) -> Self {
        AttemptError::AsyncOperationConflict
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StagedKind {
    Insert,
    Replace,
    Remove,
}

/// Everything the attempt context needs from its owning transaction
/// context, gathered so `AttemptContext::new` stays small.
pub struct AttemptConfig {
    pub transaction_id: String,
    pub kv: Arc<dyn KvStore>,
    pub query: Option<Arc<dyn QueryEngine>>,
    pub hooks: Arc<dyn TransactionHooks>,
    pub expiry: ExpiryClock,
    pub durability: DurabilityRequirement,
    pub metadata_collection: Option<(String, String, String)>,
}

/// One attempt at executing the user's lambda. Not `Clone`; owned by a
/// single `TransactionContext::run` iteration and driven to commit or
/// rollback before being dropped.
pub struct AttemptContext {
    pub transaction_id: String,
    pub attempt_id: String,
    kv: Arc<dyn KvStore>,
    query: Option<Arc<dyn QueryEngine>>,
    hooks: Arc<dyn TransactionHooks>,
    atr_store: AtrStore,
    mode: ModeArbiter,
    atr: Mutex<Option<AtrRef>>,
    staged: Mutex<HashMap<DocumentId, StagedKind>>,
    expiry: ExpiryClock,
    durability: DurabilityRequirement,
    metadata_collection: Option<(String, String, String)>,
    backoff: BackoffCalculator,
}

impl AttemptContext {
    pub fn new(config: AttemptConfig) -> Self {
        Self {
            transaction_id: config.transaction_id,
            attempt_id: Uuid::new_v4().to_string(),
            kv: Arc::clone(&config.kv),
            query: config.query,
            hooks: config.hooks,
            atr_store: AtrStore::new(config.kv),
            mode: ModeArbiter::new(),
            atr: Mutex::new(None),
            staged: Mutex::new(HashMap::new()),
            expiry: config.expiry,
            durability: config.durability,
            metadata_collection: config.metadata_collection,
            backoff: BackoffCalculator::default(),
        }
    }

    fn check_expiry(&self) -> Result<(), AttemptError> {
        if self.expiry.has_expired() {
            return Err(AttemptError::Expired);
        }
        Ok(())
    }

    /// Durability this attempt's mutations were configured with; read by the
    /// owning transaction context when it polls for durability after commit.
    pub fn durability(&self) -> DurabilityRequirement {
        self.durability
    }

    /// Resolve a `KvErrorKind` into a terminal `AttemptError`, retrying
    /// in-process per the classifier's policy until the policy says to
    /// stop or the attempt expires.
    async fn classify_and_retry<T, F, Fut>(&self, in_atr: bool, mut call: F) -> Result<T, AttemptError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, KvErrorKind>>,
    {
        let mut attempt_count = 0u32;
        loop {
            self.check_expiry()?;
            match call().await {
                Ok(value) => return Ok(value),
                Err(kind) => {
                    let class = classify(&kind, ErrorContext { in_atr });
                    match class.policy() {
                        ErrorPolicy::RetryOp => {
                            tokio::time::sleep(self.backoff.delay_for(attempt_count)).await;
                            attempt_count += 1;
                            continue;
                        }
                        ErrorPolicy::RetryUnlessExpired => {
                            if self.expiry.has_expired() {
                                return Err(AttemptError::Expired);
                            }
                            tokio::time::sleep(self.backoff.delay_for(attempt_count)).await;
                            attempt_count += 1;
                            continue;
                        }
                        ErrorPolicy::AbortExpired => return Err(AttemptError::Expired),
                        ErrorPolicy::AbortFailed | ErrorPolicy::AbortHard | ErrorPolicy::None => {
                            return Err(AttemptError::Failed(class))
                        }
                    }
                }
            }
        }
    }

    async fn ensure_atr(&self, first_id: &DocumentId) -> Result<AtrRef, AttemptError> {
        {
            if let Some(existing) = self.atr.lock().clone() {
                return Ok(existing);
            }
        }
        let (bucket, scope, collection) = self
            .metadata_collection
            .clone()
            .unwrap_or((first_id.bucket.clone(), first_id.scope.clone(), first_id.collection.clone()));
        let override_shard = self.hooks.random_atr_id_for_vbucket();
        let atr = select_atr(&bucket, &scope, &collection, &first_id.key, override_shard);

        let mut entry = AtrEntry::new(self.attempt_id.clone(), self.expiry.remaining().as_millis() as i64, now_nanos());
        entry.state = AttemptState::Pending;
        entry.timestamps.start = Some(self.expiry.elapsed().as_millis() as u64);

        self.atr_store
            .upsert_entry(&atr, &entry)
            .await
            .map_err(|e| AttemptError::Failed(classify(&e, ErrorContext { in_atr: true })))?;
        *self.atr.lock() = Some(atr.clone());
        Ok(atr)
    }

    fn record_staged_id(&self, atr_entry: &mut AtrEntry, id: &DocumentId, kind: StagedKind) {
        match kind {
            StagedKind::Insert => atr_entry.inserted_ids.push(id.clone()),
            StagedKind::Replace => atr_entry.replaced_ids.push(id.clone()),
            StagedKind::Remove => atr_entry.removed_ids.push(id.clone()),
        }
    }

    async fn update_atr_entry(&self, atr: &AtrRef, id: &DocumentId, kind: StagedKind) -> Result<(), AttemptError> {
        let mut entry = self
            .atr_store
            .get_entry(atr, &self.attempt_id)
            .await
            .map_err(|e| AttemptError::Failed(classify(&e, ErrorContext { in_atr: true })))?
            .ok_or_else(|| AttemptError::IllegalState("atr entry vanished".into()))?;
        self.record_staged_id(&mut entry, id, kind);
        self.atr_store
            .upsert_entry(atr, &entry)
            .await
            .map_err(|e| AttemptError::Failed(classify(&e, ErrorContext { in_atr: true })))?;
        Ok(())
    }

    fn links_spec(links: &TransactionLinks) -> SubdocSpec {
        let value = serde_json::to_value(links).expect("TransactionLinks always serializes");
        SubdocSpec::new(SubdocOpcode::DictUpsert, "txn", Some(value), path_flags::XATTR)
    }

    /// CRC32 of the staged content's canonical JSON encoding, stored
    /// alongside the link so a reader can detect the staged value was
    /// corrupted in transit without deserializing it.
    fn crc32_of(content: &serde_json::Value) -> u32 {
        crc32fast::hash(content.to_string().as_bytes())
    }

    fn read_links(xattrs: &std::collections::BTreeMap<String, serde_json::Value>) -> Option<TransactionLinks> {
        xattrs.get("txn").and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn check_forward_compat(&self, links: &TransactionLinks) -> Result<(), AttemptError> {
        if let Some(compat) = &links.forward_compat {
            for entries in compat.values() {
                for entry in entries {
                    if entry.behavior == "fail_transaction" {
                        return Err(AttemptError::Cause(ErrorCause::ForwardCompatibilityFailure));
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch a document's currently-visible content under this attempt's
    /// read-your-own-writes / read-committed-in-progress rules.
    pub async fn get(&self, id: &DocumentId) -> Result<Option<TransactionGetResult>, AttemptError> {
        self.mode.increment_ops()?;
        let result = self.get_inner(id).await;
        self.mode.decrement_ops()?;
        result
    }

    async fn get_inner(&self, id: &DocumentId) -> Result<Option<TransactionGetResult>, AttemptError> {
        let fetched = self
            .classify_and_retry(false, || self.kv.get(id, true))
            .await;
        let doc: GetSpecResult = match fetched {
            Ok(d) => d,
            Err(AttemptError::Failed(ErrorClass::FailDocNotFound)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let links = match Self::read_links(&doc.xattrs) {
            Some(l) => l,
            None => {
                if doc.is_deleted {
                    return Ok(None);
                }
                return Ok(Some(TransactionGetResult { id: id.clone(), cas: doc.cas, content: doc.body, links: None }));
            }
        };

        self.check_forward_compat(&links)?;

        if links.belongs_to(&self.attempt_id) {
            let content = match &links.staged_content {
                Some(StagedContent::Json(v)) => Some(v.clone()),
                Some(StagedContent::Binary(_)) | None => doc.body.clone(),
            };
            if links.is_deleted {
                return Ok(None);
            }
            return Ok(Some(TransactionGetResult { id: id.clone(), cas: doc.cas, content, links: Some(links) }));
        }

        let entry = self
            .atr_store
            .get_entry(&links.atr, &links.attempt_id)
            .await
            .map_err(|_| AttemptError::Failed(ErrorClass::FailOther))?;

        let staging_committed = matches!(entry.as_ref().map(|e| e.state), Some(AttemptState::Committed));
        if staging_committed {
            let content = match &links.staged_content {
                Some(StagedContent::Json(v)) => Some(v.clone()),
                _ => doc.body.clone(),
            };
            return Ok(Some(TransactionGetResult { id: id.clone(), cas: doc.cas, content, links: Some(links) }));
        }

        if let Some(restore) = &links.restore {
            let _ = restore; // pre-image CAS retained for diagnostics only here
        }
        if doc.is_deleted {
            return Ok(None);
        }
        Ok(Some(TransactionGetResult { id: id.clone(), cas: doc.cas, content: doc.body, links: None }))
    }

    /// Insert a brand-new document under this transaction.
    pub async fn insert(&self, id: &DocumentId, content: serde_json::Value) -> Result<TransactionGetResult, AttemptError> {
        self.mode.increment_ops()?;
        let result = self.insert_inner(id, content).await;
        self.mode.decrement_ops()?;
        result
    }

    async fn insert_inner(&self, id: &DocumentId, content: serde_json::Value) -> Result<TransactionGetResult, AttemptError> {
        self.check_expiry()?;
        {
            let staged = self.staged.lock();
            if staged.contains_key(id) {
                return Err(AttemptError::Cause(ErrorCause::DocumentAlreadyInTransaction));
            }
        }

        if let HookAction::Err(class) = self.hooks.before_staged_insert(&id.key) {
            return Err(AttemptError::Failed(class));
        }

        let atr = self.ensure_atr(id).await?;
        let mut links = TransactionLinks::new(atr.clone(), self.transaction_id.clone(), self.attempt_id.clone(), Uuid::new_v4().to_string());
        links.crc32 = Some(Self::crc32_of(&content));

        let body_spec = SubdocSpec::new(SubdocOpcode::DictUpsert, "", Some(content.clone()), 0);
        let links_spec = Self::links_spec(&links);

        let (cas, _token, _results) = self
            .classify_and_retry(false, || {
                self.kv.mutate_in(id, &[body_spec.clone(), links_spec.clone()], StoreSemantics::Insert, Cas::EMPTY, true)
            })
            .await?;

        self.update_atr_entry(&atr, id, StagedKind::Insert).await?;
        self.staged.lock().insert(id.clone(), StagedKind::Insert);

        Ok(TransactionGetResult { id: id.clone(), cas, content: Some(content), links: Some(links) })
    }

    /// Stage a replacement for a document previously read via [`get`].
    pub async fn replace(&self, doc: &TransactionGetResult, content: serde_json::Value) -> Result<TransactionGetResult, AttemptError> {
        self.mode.increment_ops()?;
        let result = self.replace_inner(doc, content).await;
        self.mode.decrement_ops()?;
        result
    }

    async fn replace_inner(&self, doc: &TransactionGetResult, content: serde_json::Value) -> Result<TransactionGetResult, AttemptError> {
        self.check_expiry()?;
        if let HookAction::Err(class) = self.hooks.before_staged_replace(&doc.id.key) {
            return Err(AttemptError::Failed(class));
        }

        let atr = self.ensure_atr(&doc.id).await?;
        let mut links = TransactionLinks::new(atr.clone(), self.transaction_id.clone(), self.attempt_id.clone(), Uuid::new_v4().to_string());
        links.staged_content = Some(StagedContent::Json(content.clone()));
        links.restore = Some(RestoreInfo { cas: doc.cas });
        links.crc32 = Some(Self::crc32_of(&content));

        let links_spec = Self::links_spec(&links);
        let (cas, _token, _results) = self
            .classify_and_retry(false, || self.kv.mutate_in(&doc.id, &[links_spec.clone()], StoreSemantics::Replace, doc.cas, false))
            .await?;

        self.update_atr_entry(&atr, &doc.id, StagedKind::Replace).await?;
        self.staged.lock().insert(doc.id.clone(), StagedKind::Replace);

        Ok(TransactionGetResult { id: doc.id.clone(), cas, content: Some(content), links: Some(links) })
    }

    /// Stage a removal for a document previously read via [`get`].
    pub async fn remove(&self, doc: &TransactionGetResult) -> Result<(), AttemptError> {
        self.mode.increment_ops()?;
        let result = self.remove_inner(doc).await;
        self.mode.decrement_ops()?;
        result
    }

    async fn remove_inner(&self, doc: &TransactionGetResult) -> Result<(), AttemptError> {
        self.check_expiry()?;
        if let HookAction::Err(class) = self.hooks.before_staged_remove(&doc.id.key) {
            return Err(AttemptError::Failed(class));
        }

        let atr = self.ensure_atr(&doc.id).await?;
        let mut links = TransactionLinks::new(atr.clone(), self.transaction_id.clone(), self.attempt_id.clone(), Uuid::new_v4().to_string());
        links.is_deleted = true;
        links.restore = Some(RestoreInfo { cas: doc.cas });

        let links_spec = Self::links_spec(&links);
        self.classify_and_retry(false, || self.kv.mutate_in(&doc.id, &[links_spec.clone()], StoreSemantics::Replace, doc.cas, false))
            .await?;

        self.update_atr_entry(&atr, &doc.id, StagedKind::Remove).await?;
        self.staged.lock().insert(doc.id.clone(), StagedKind::Remove);
        Ok(())
    }

    /// Run a N1QL statement, switching the attempt into query mode on the
    /// first call.
    pub async fn query(&self, statement: &str, options: &QueryOptions) -> Result<QueryResponse, AttemptError> {
        self.mode.increment_ops()?;
        let result = self.query_inner(statement, options).await;
        self.mode.decrement_ops()?;
        result
    }

    async fn query_inner(&self, statement: &str, options: &QueryOptions) -> Result<QueryResponse, AttemptError> {
        self.check_expiry()?;
        if let HookAction::Err(class) = self.hooks.before_query(statement) {
            return Err(AttemptError::Failed(class));
        }
        let query = self.query.clone().ok_or(AttemptError::Failed(ErrorClass::FailOther))?;

        // The winner of the race picks and records the query node; any
        // concurrent caller just waits for it to be known.
        self.mode.set_query_mode(
            || self.mode.set_query_node("local-query-node"),
            || (),
        );

        let response = query
            .execute(statement, options)
            .await
            .map_err(|e| AttemptError::Failed(classify(&e, ErrorContext::default())))?;

        if let Some(code) = response.first_error {
            use txn_types::QueryErrorCode::*;
            let class = match code {
                Parsing => ErrorClass::FailOther,
                DocumentNotFound => ErrorClass::FailDocNotFound,
                DocumentExists => ErrorClass::FailDocAlreadyExists,
                CasMismatch => ErrorClass::FailCasMismatch,
                AttemptExpired => return Err(AttemptError::Expired),
                Other => ErrorClass::FailOther,
            };
            return Err(AttemptError::Failed(class));
        }
        Ok(response)
    }

    /// Commit every staged document and remove the ATR entry.
    pub async fn commit(&self) -> Result<(), AttemptError> {
        self.mode.wait_and_block_ops();
        let atr = match self.atr.lock().clone() {
            Some(atr) => atr,
            None => return Ok(()), // read-only attempt: nothing to commit
        };

        let mut entry = self
            .atr_store
            .get_entry(&atr, &self.attempt_id)
            .await
            .map_err(|e| AttemptError::Failed(classify(&e, ErrorContext { in_atr: true })))?
            .ok_or_else(|| AttemptError::IllegalState("atr entry missing at commit".into()))?;

        if let HookAction::Err(class) = self.hooks.before_atr_commit() {
            return Err(AttemptError::Failed(class));
        }

        entry.state = entry
            .state
            .transition_to(AttemptState::Committed)
            .map_err(|e| AttemptError::IllegalState(e.to_string()))?;
        self.atr_store
            .upsert_entry(&atr, &entry)
            .await
            .map_err(|e| AttemptError::Failed(classify(&e, ErrorContext { in_atr: true })))?;

        let staged: Vec<(DocumentId, StagedKind)> =
            self.staged.lock().iter().map(|(k, v)| (k.clone(), *v)).collect();
        for (id, kind) in staged {
            if let HookAction::Err(class) = self.hooks.before_doc_committed(&id.key) {
                return Err(AttemptError::Failed(class));
            }
            self.unstage_one(&id, kind, true).await?;
            let _ = self.hooks.after_doc_committed(&id.key);
        }

        entry.state = entry
            .state
            .transition_to(AttemptState::Completed)
            .map_err(|e| AttemptError::IllegalState(e.to_string()))?;
        self.atr_store.remove_entry(&atr, &self.attempt_id).await.ok();
        Ok(())
    }

    /// Roll back every staged document and remove the ATR entry.
    pub async fn rollback(&self) -> Result<(), AttemptError> {
        self.mode.wait_and_block_ops();
        let atr = match self.atr.lock().clone() {
            Some(atr) => atr,
            None => return Ok(()),
        };

        let mut entry = match self.atr_store.get_entry(&atr, &self.attempt_id).await {
            Ok(Some(e)) => e,
            Ok(None) => return Ok(()),
            Err(e) => return Err(AttemptError::Failed(classify(&e, ErrorContext { in_atr: true }))),
        };

        entry.state = entry
            .state
            .transition_to(AttemptState::Aborted)
            .map_err(|e| AttemptError::IllegalState(e.to_string()))?;
        self.atr_store.upsert_entry(&atr, &entry).await.ok();

        let staged: Vec<(DocumentId, StagedKind)> =
            self.staged.lock().iter().map(|(k, v)| (k.clone(), *v)).collect();
        for (id, kind) in staged {
            self.unstage_one(&id, kind, false).await?;
        }

        if let HookAction::Err(class) = self.hooks.before_atr_rolled_back() {
            return Err(AttemptError::Failed(class));
        }
        entry.state = entry
            .state
            .transition_to(AttemptState::RolledBack)
            .map_err(|e| AttemptError::IllegalState(e.to_string()))?;
        self.atr_store.remove_entry(&atr, &self.attempt_id).await.ok();
        Ok(())
    }

    async fn unstage_one(&self, id: &DocumentId, kind: StagedKind, committing: bool) -> Result<(), AttemptError> {
        match (kind, committing) {
            (StagedKind::Insert, true) => {
                // Body already holds the final content; just clear the link
                // and the create-as-deleted flag.
                self.finalize_links(id, false).await
            }
            (StagedKind::Insert, false) => {
                if let HookAction::Err(class) = self.hooks.before_rollback_delete_inserted(&id.key) {
                    return Err(AttemptError::Failed(class));
                }
                self.classify_and_retry(false, || self.kv.remove(id, Cas::EMPTY)).await?;
                Ok(())
            }
            (StagedKind::Replace, true) => {
                let doc = self.kv.get(id, true).await.map_err(AttemptError::from_kv)?;
                let links = Self::read_links(&doc.xattrs).ok_or_else(|| AttemptError::IllegalState("link missing at unstage".into()))?;
                let content = match links.staged_content {
                    Some(StagedContent::Json(v)) => v,
                    _ => doc.body.unwrap_or(serde_json::Value::Null),
                };
                let body_spec = SubdocSpec::new(SubdocOpcode::DictUpsert, "", Some(content), 0);
                self.classify_and_retry(false, || self.kv.mutate_in(id, &[body_spec.clone()], StoreSemantics::Upsert, Cas::EMPTY, false))
                    .await?;
                self.finalize_links(id, false).await
            }
            (StagedKind::Replace, false) | (StagedKind::Remove, false) => self.finalize_links(id, false).await,
            (StagedKind::Remove, true) => {
                self.classify_and_retry(false, || self.kv.remove(id, Cas::EMPTY)).await?;
                Ok(())
            }
        }
    }

    async fn finalize_links(&self, id: &DocumentId, _is_deleted: bool) -> Result<(), AttemptError> {
        let remove_spec = SubdocSpec::new(SubdocOpcode::Remove, "txn", None, path_flags::XATTR);
        match self.kv.mutate_in(id, &[remove_spec], StoreSemantics::Upsert, Cas::EMPTY, false).await {
            Ok(_) => Ok(()),
            Err(KvErrorKind::DocumentNotFound) => Ok(()),
            Err(e) => Err(AttemptError::from_kv(e)),
        }
    }
}

impl AttemptError {
    fn from_kv(kind: KvErrorKind) -> Self {
        let class = classify(&kind, ErrorContext::default());
        AttemptError::Failed(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txn_durability::InMemoryKvStore;

    fn config(kv: Arc<dyn KvStore>) -> AttemptConfig {
        AttemptConfig {
            transaction_id: Uuid::new_v4().to_string(),
            kv,
            query: None,
            hooks: Arc::new(crate::hooks::NoopHooks),
            expiry: ExpiryClock::start_now(std::time::Duration::from_secs(15)),
            durability: DurabilityRequirement::default(),
            metadata_collection: None,
        }
    }

    #[tokio::test]
    async fn insert_then_get_sees_staged_value() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let attempt = AttemptContext::new(config(Arc::clone(&kv)));
        let id = DocumentId::new("b", "doc-1");
        attempt.insert(&id, serde_json::json!({"a": 1})).await.unwrap();
        let got = attempt.get(&id).await.unwrap().unwrap();
        assert_eq!(got.content.unwrap()["a"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn commit_makes_content_visible_outside_transaction() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let attempt = AttemptContext::new(config(Arc::clone(&kv)));
        let id = DocumentId::new("b", "doc-1");
        attempt.insert(&id, serde_json::json!({"a": 1})).await.unwrap();
        attempt.commit().await.unwrap();

        let raw = kv.get(&id, false).await.unwrap();
        assert_eq!(raw.body.unwrap()["a"], serde_json::json!(1));
        assert!(!raw.xattrs.contains_key("txn"));
    }

    #[tokio::test]
    async fn rollback_removes_inserted_document() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let attempt = AttemptContext::new(config(Arc::clone(&kv)));
        let id = DocumentId::new("b", "doc-1");
        attempt.insert(&id, serde_json::json!({"a": 1})).await.unwrap();
        attempt.rollback().await.unwrap();

        assert!(kv.get(&id, false).await.is_err());
    }

    #[tokio::test]
    async fn double_insert_same_key_conflicts_in_attempt() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let attempt = AttemptContext::new(config(Arc::clone(&kv)));
        let id = DocumentId::new("b", "doc-1");
        attempt.insert(&id, serde_json::json!({"a": 1})).await.unwrap();
        let err = attempt.insert(&id, serde_json::json!({"a": 2})).await.unwrap_err();
        assert!(matches!(err, AttemptError::Cause(ErrorCause::DocumentAlreadyInTransaction)));
    }

    #[tokio::test]
    async fn replace_then_commit_updates_body() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let attempt = AttemptContext::new(config(Arc::clone(&kv)));
        let id = DocumentId::new("b", "doc-1");
        attempt.insert(&id, serde_json::json!({"a": 1})).await.unwrap();
        attempt.commit().await.unwrap();

        let attempt2 = AttemptContext::new(config(Arc::clone(&kv)));
        let doc = attempt2.get(&id).await.unwrap().unwrap();
        attempt2.replace(&doc, serde_json::json!({"a": 2})).await.unwrap();
        attempt2.commit().await.unwrap();

        let raw = kv.get(&id, false).await.unwrap();
        assert_eq!(raw.body.unwrap()["a"], serde_json::json!(2));
    }
}
