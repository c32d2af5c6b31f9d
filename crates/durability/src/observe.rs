//! Polls active and replica partitions until a mutation's durability
//! requirement is met, or the deadline fires.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::timeout;

use txn_types::{
    BucketTopology, DocumentId, KvErrorKind, KvStore, MutationToken, PersistTo, ReplicateTo,
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const OVERALL_DEADLINE: Duration = Duration::from_secs(5);

/// Why the poller gave up before the durability requirement was satisfied.
#[derive(Debug, Error)]
pub enum ObserveError {
    #[error("node_locator is not vbucket-based")]
    FeatureNotAvailable,
    #[error("cluster topology cannot satisfy the requested durability level")]
    DurabilityImpossible,
    #[error("durability requirement not satisfied within the deadline")]
    AmbiguousTimeout,
    #[error("underlying kv error: {0}")]
    Kv(#[from] KvErrorKind),
}

fn required_persist_replicas(persist_to: PersistTo) -> u32 {
    match persist_to {
        PersistTo::None | PersistTo::Active => 0,
        PersistTo::One => 1,
        PersistTo::Two => 2,
        PersistTo::Three | PersistTo::Four => 3,
    }
}

fn required_replicate_replicas(replicate_to: ReplicateTo) -> u32 {
    match replicate_to {
        ReplicateTo::None => 0,
        ReplicateTo::One => 1,
        ReplicateTo::Two => 2,
        ReplicateTo::Three => 3,
    }
}

fn max_required_replicas(persist_to: PersistTo, replicate_to: ReplicateTo) -> u32 {
    required_persist_replicas(persist_to).max(required_replicate_replicas(replicate_to))
}

/// Counters for a single polling round, reset every round.
#[derive(Debug, Default)]
struct ObserveCounters {
    replicated: u32,
    persisted: u32,
    persisted_on_active: bool,
}

/// Verifies a mutation's durability requirement by polling observe-seqno
/// across the active node and its replicas.
pub struct ObserveSeqnoPoller {
    kv: Arc<dyn KvStore>,
}

impl ObserveSeqnoPoller {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Block until `persist_to`/`replicate_to` are satisfied for `token`, or
    /// return an error explaining why they can't or didn't become satisfied.
    pub async fn wait_for(
        &self,
        id: &DocumentId,
        token: &MutationToken,
        persist_to: PersistTo,
        replicate_to: ReplicateTo,
    ) -> Result<(), ObserveError> {
        if persist_to == PersistTo::None && replicate_to == ReplicateTo::None {
            return Ok(());
        }

        let topology = self.kv.topology(&id.bucket).await?;
        self.precheck(&topology, persist_to, replicate_to)?;

        let required_persist = required_persist_replicas(persist_to);
        let required_replicate = required_replicate_replicas(replicate_to);
        let num_replicas = topology.num_replicas.unwrap_or(0);

        let poll = self.poll_until_satisfied(
            id,
            token,
            persist_to,
            required_persist,
            required_replicate,
            num_replicas,
        );

        match timeout(OVERALL_DEADLINE, poll).await {
            Ok(result) => result,
            Err(_) => Err(ObserveError::AmbiguousTimeout),
        }
    }

    fn precheck(
        &self,
        topology: &BucketTopology,
        persist_to: PersistTo,
        replicate_to: ReplicateTo,
    ) -> Result<(), ObserveError> {
        if !topology.node_locator_is_vbucket {
            return Err(ObserveError::FeatureNotAvailable);
        }
        let required = max_required_replicas(persist_to, replicate_to);
        match topology.num_replicas {
            Some(n) if n >= required => Ok(()),
            _ => Err(ObserveError::DurabilityImpossible),
        }
    }

    async fn poll_until_satisfied(
        &self,
        id: &DocumentId,
        token: &MutationToken,
        persist_to: PersistTo,
        required_persist: u32,
        required_replicate: u32,
        num_replicas: u32,
    ) -> Result<(), ObserveError> {
        loop {
            let counters = Arc::new(Mutex::new(ObserveCounters::default()));
            let mut set: JoinSet<Result<(), KvErrorKind>> = JoinSet::new();

            let nodes: Vec<bool> = std::iter::once(true)
                .chain(std::iter::repeat(false).take(
                    if required_replicate > 0 || required_persist > 0 {
                        num_replicas as usize
                    } else {
                        0
                    },
                ))
                .collect();

            for node_is_active in nodes {
                let counters = Arc::clone(&counters);
                let bucket = id.bucket.clone();
                let partition_id = token.partition_id;
                let partition_uuid = token.partition_uuid;
                let target_seqno = token.sequence_number;
                let kv = Arc::clone(&self.kv);

                set.spawn(async move {
                    let response = kv
                        .observe_seqno(&bucket, partition_id, partition_uuid, node_is_active)
                        .await?;
                    let mut c = counters.lock();
                    if node_is_active {
                        if response.last_persisted_seqno >= target_seqno {
                            c.persisted_on_active = true;
                        }
                    } else {
                        if response.current_seqno >= target_seqno {
                            c.replicated += 1;
                        }
                        if response.last_persisted_seqno >= target_seqno {
                            c.persisted += 1;
                        }
                    }
                    Ok(())
                });
            }

            while let Some(joined) = set.join_next().await {
                joined.map_err(|e| KvErrorKind::Other(e.to_string()))??;
            }

            let c = counters.lock();
            let persistence_ok = (persist_to == PersistTo::Active && c.persisted_on_active)
                || c.persisted >= required_persist;
            let replication_ok = c.replicated >= required_replicate;
            drop(c);

            if persistence_ok && replication_ok {
                return Ok(());
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_store::InMemoryKvStore;
    use txn_types::SubdocOpcode;
    use txn_types::{StoreSemantics, SubdocSpec};

    fn doc_id() -> DocumentId {
        DocumentId::new("bucket", "doc-1")
    }

    #[tokio::test]
    async fn no_durability_requested_returns_immediately() {
        let kv = InMemoryKvStore::new();
        kv.set_topology(BucketTopology { node_locator_is_vbucket: false, num_replicas: None });
        let poller = ObserveSeqnoPoller::new(Arc::new(kv));
        let token = MutationToken {
            partition_uuid: 1,
            sequence_number: 1,
            partition_id: 0,
            bucket: "bucket".into(),
        };
        let result = poller
            .wait_for(&doc_id(), &token, PersistTo::None, ReplicateTo::None)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn non_vbucket_topology_fails_feature_not_available() {
        let kv = InMemoryKvStore::new();
        kv.set_topology(BucketTopology { node_locator_is_vbucket: false, num_replicas: Some(2) });
        let spec = SubdocSpec::new(SubdocOpcode::DictUpsert, "a", Some(serde_json::json!(1)), 0);
        let (_, token, _) = kv
            .mutate_in(&doc_id(), &[spec], StoreSemantics::Insert, txn_types::Cas::EMPTY, false)
            .await
            .unwrap();
        let poller = ObserveSeqnoPoller::new(Arc::new(kv));
        let result = poller
            .wait_for(&doc_id(), &token, PersistTo::One, ReplicateTo::None)
            .await;
        assert!(matches!(result, Err(ObserveError::FeatureNotAvailable)));
    }

    #[tokio::test]
    async fn insufficient_replicas_fails_durability_impossible() {
        let kv = InMemoryKvStore::new();
        kv.set_topology(BucketTopology { node_locator_is_vbucket: true, num_replicas: Some(0) });
        let spec = SubdocSpec::new(SubdocOpcode::DictUpsert, "a", Some(serde_json::json!(1)), 0);
        let (_, token, _) = kv
            .mutate_in(&doc_id(), &[spec], StoreSemantics::Insert, txn_types::Cas::EMPTY, false)
            .await
            .unwrap();
        let poller = ObserveSeqnoPoller::new(Arc::new(kv));
        let result = poller
            .wait_for(&doc_id(), &token, PersistTo::Two, ReplicateTo::None)
            .await;
        assert!(matches!(result, Err(ObserveError::DurabilityImpossible)));
    }

    #[tokio::test]
    async fn satisfiable_requirement_succeeds() {
        let kv = InMemoryKvStore::new();
        kv.set_topology(BucketTopology { node_locator_is_vbucket: true, num_replicas: Some(2) });
        let spec = SubdocSpec::new(SubdocOpcode::DictUpsert, "a", Some(serde_json::json!(1)), 0);
        let (_, token, _) = kv
            .mutate_in(&doc_id(), &[spec], StoreSemantics::Insert, txn_types::Cas::EMPTY, false)
            .await
            .unwrap();
        let poller = ObserveSeqnoPoller::new(Arc::new(kv));
        let result = poller
            .wait_for(&doc_id(), &token, PersistTo::Active, ReplicateTo::None)
            .await;
        assert!(result.is_ok());
    }
}
