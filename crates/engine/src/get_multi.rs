//! Concurrency-capped multi-document fetch, with optional detection and
//! resolution of read skew against a concurrently running transaction that
//! has staged more than one of the requested documents.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use txn_types::{DocumentId, TransactionGetResult};

use crate::attempt::{AttemptContext, AttemptError};

/// How the orchestrator trades off latency against read-skew detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMultiMode {
    /// Detect skew, but don't let resolving it add more than a bounded extra
    /// round trip.
    PrioritiseLatency,
    /// Skip read-skew detection entirely.
    DisableReadSkewDetection,
    /// Detect skew and re-fetch every document it touches before returning,
    /// with no bound on how many rounds that takes.
    PrioritiseReadSkewDetection,
}

/// Documents in flight at once, absent an explicit override.
pub const DEFAULT_CONCURRENCY: usize = 100;

/// Extra time `PrioritiseLatency` allows itself, beyond the initial fetch,
/// to resolve read skew before giving up and returning what it has.
const LATENCY_BUDGET: Duration = Duration::from_millis(100);

/// Safety backstop on retry rounds when resolving skew against more than one
/// other transaction; `PrioritiseReadSkewDetection` has no latency deadline,
/// so this keeps a pathological case (every round turning up a different
/// second transaction) from looping forever.
const MAX_RETRY_ROUNDS: usize = 8;

/// What one round of fetches found about documents staged by other,
/// still-unstaged transactions.
enum SkewOutcome {
    /// No document in the batch is staged by another transaction.
    None,
    /// Exactly one other transaction touched part of the batch; its
    /// documents can be re-fetched to pick up its final state.
    SingleOther(HashSet<DocumentId>),
    /// More than one other transaction is involved; too ambiguous to
    /// resolve piecemeal, the whole batch must be re-fetched from scratch.
    Ambiguous,
}

/// Fetches many documents under one attempt, in parallel, bounded by a
/// concurrency cap.
pub struct GetMultiOrchestrator {
    attempt: Arc<AttemptContext>,
    mode: GetMultiMode,
    concurrency: usize,
}

impl GetMultiOrchestrator {
    pub fn new(attempt: Arc<AttemptContext>, mode: GetMultiMode) -> Self {
        Self { attempt, mode, concurrency: DEFAULT_CONCURRENCY }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Fetch every id. The result vector is index-aligned with `ids`.
    pub async fn fetch_all(&self, ids: &[DocumentId]) -> Result<Vec<Option<TransactionGetResult>>, AttemptError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = self.fetch_round(ids).await?;

        if self.mode == GetMultiMode::DisableReadSkewDetection {
            return Ok(results);
        }

        let deadline = match self.mode {
            GetMultiMode::PrioritiseLatency => Some(Instant::now() + LATENCY_BUDGET),
            _ => None,
        };

        for _ in 0..MAX_RETRY_ROUNDS {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            match self.detect_skew(&results) {
                SkewOutcome::None => break,
                SkewOutcome::SingleOther(t1_doc_ids) => {
                    self.resolve_read_skew(&mut results, &t1_doc_ids).await?;
                    break;
                }
                SkewOutcome::Ambiguous => {
                    results = self.fetch_round(ids).await?;
                }
            }
        }

        Ok(results)
    }

    /// One concurrency-capped fan-out over `ids`, index-aligned with it.
    async fn fetch_round(&self, ids: &[DocumentId]) -> Result<Vec<Option<TransactionGetResult>>, AttemptError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();
        for (index, id) in ids.iter().cloned().enumerate() {
            let attempt = Arc::clone(&self.attempt);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                (index, attempt.get(&id).await)
            });
        }

        let mut results: Vec<Option<TransactionGetResult>> = Vec::new();
        results.resize_with(ids.len(), || None);
        while let Some(joined) = join_set.join_next().await {
            let (index, outcome) = joined.expect("get task never panics");
            results[index] = outcome?;
        }
        Ok(results)
    }

    /// Groups fetched documents by the transaction id staging them, to tell
    /// a clean single-other-transaction case from an ambiguous multi-way one.
    fn detect_skew(&self, results: &[Option<TransactionGetResult>]) -> SkewOutcome {
        let mut by_txn: HashMap<String, HashSet<DocumentId>> = HashMap::new();
        for doc in results.iter().flatten() {
            if let Some(links) = &doc.links {
                by_txn.entry(links.transaction_id.clone()).or_default().insert(doc.id.clone());
            }
        }
        match by_txn.len() {
            0 => SkewOutcome::None,
            1 => SkewOutcome::SingleOther(by_txn.into_values().next().expect("len checked above")),
            _ => SkewOutcome::Ambiguous,
        }
    }

    /// A document staged by the same in-progress transaction as another
    /// document in this batch may have committed or rolled back between the
    /// two fetches; re-read it so the caller sees a consistent view.
    async fn resolve_read_skew(
        &self,
        results: &mut [Option<TransactionGetResult>],
        t1_doc_ids: &HashSet<DocumentId>,
    ) -> Result<(), AttemptError> {
        for slot in results.iter_mut() {
            if let Some(doc) = slot {
                if t1_doc_ids.contains(&doc.id) {
                    *slot = self.attempt.get(&doc.id).await?;
                }
            }
        }
        Ok(())
    }
}
