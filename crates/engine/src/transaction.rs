//! The transaction-level retry loop: creates a new attempt for each try of
//! the caller's lambda, commits on success, rolls back and retries on a
//! retryable failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use txn_concurrency::BackoffCalculator;
use txn_types::{DurabilityRequirement, ErrorCause, ErrorClass, ErrorPolicy, KvStore, QueryEngine, TransactionResult};

use crate::attempt::{AttemptConfig, AttemptContext, AttemptError};
use crate::expiry::{ExpiryClock, DEFAULT_TIMEOUT};
use crate::hooks::{NoopHooks, TransactionHooks};

/// Per-transaction configuration; distinct from per-attempt config since it
/// spans every attempt the transaction makes.
#[derive(Clone)]
pub struct TransactionConfig {
    pub timeout: Duration,
    pub durability: DurabilityRequirement,
    pub metadata_collection: Option<(String, String, String)>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            durability: DurabilityRequirement::default(),
            metadata_collection: None,
        }
    }
}

/// One run of the caller's lambda against a sequence of attempts.
pub struct TransactionContext {
    transaction_id: String,
    kv: Arc<dyn KvStore>,
    query: Option<Arc<dyn QueryEngine>>,
    hooks: Arc<dyn TransactionHooks>,
    config: TransactionConfig,
    expiry: ExpiryClock,
    backoff: BackoffCalculator,
}

impl TransactionContext {
    pub fn new(
        kv: Arc<dyn KvStore>,
        query: Option<Arc<dyn QueryEngine>>,
        hooks: Arc<dyn TransactionHooks>,
        config: TransactionConfig,
    ) -> Self {
        Self {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            kv,
            query,
            hooks,
            expiry: ExpiryClock::start_now(config.timeout),
            config,
            backoff: BackoffCalculator::default(),
        }
    }

    fn new_attempt(&self) -> AttemptContext {
        AttemptContext::new(AttemptConfig {
            transaction_id: self.transaction_id.clone(),
            kv: Arc::clone(&self.kv),
            query: self.query.clone(),
            hooks: Arc::clone(&self.hooks),
            expiry: self.expiry.clone(),
            durability: self.config.durability,
            metadata_collection: self.config.metadata_collection.clone(),
        })
    }

    /// Drive the lambda to completion, retrying a fresh attempt whenever the
    /// previous one fails in a way that does not terminate the whole
    /// transaction.
    pub async fn run<F, Fut>(&self, lambda: F) -> TransactionResult
    where
        F: Fn(Arc<AttemptContext>) -> Fut,
        Fut: Future<Output = Result<(), AttemptError>>,
    {
        let mut retry_count = 0u32;
        loop {
            if self.expiry.has_expired() {
                return TransactionResult::Expired;
            }

            let attempt = Arc::new(self.new_attempt());
            let lambda_result = lambda(Arc::clone(&attempt)).await;

            match lambda_result {
                Ok(()) => match attempt.commit().await {
                    Ok(()) => return TransactionResult::Success { unstaging_complete: true },
                    Err(AttemptError::Expired) => return TransactionResult::Expired,
                    Err(AttemptError::Failed(class)) if class.policy() == ErrorPolicy::AbortHard => {
                        return TransactionResult::CommitAmbiguous { unstaging_complete: false }
                    }
                    Err(e) => {
                        if self.expiry.has_expired() {
                            return TransactionResult::Expired;
                        }
                        tracing::warn!(error = %e, "commit failed, retrying transaction");
                        tokio::time::sleep(self.backoff.delay_for(retry_count)).await;
                        retry_count += 1;
                        continue;
                    }
                },
                Err(AttemptError::Expired) => {
                    let _ = attempt.rollback().await;
                    return TransactionResult::Expired;
                }
                Err(e @ AttemptError::Failed(class)) if class.policy() == ErrorPolicy::AbortHard => {
                    return TransactionResult::Failed { cause: attempt_error_cause(&e) };
                }
                Err(e) => {
                    let _ = attempt.rollback().await;
                    if self.expiry.has_expired() {
                        return TransactionResult::Expired;
                    }
                    tracing::debug!(error = %e, retry_count, "attempt failed, retrying");
                    tokio::time::sleep(self.backoff.delay_for(retry_count)).await;
                    retry_count += 1;
                    continue;
                }
            }
        }
    }
}

fn attempt_error_cause(err: &AttemptError) -> Option<ErrorCause> {
    match err {
        AttemptError::Cause(cause) => Some(cause.clone()),
        AttemptError::Failed(ErrorClass::FailAtrFull) => Some(ErrorCause::ActiveTransactionRecordFull),
        _ => None,
    }
}

/// Entry point: configure once, then `run` a lambda per logical transaction.
pub struct Transactions {
    kv: Arc<dyn KvStore>,
    query: Option<Arc<dyn QueryEngine>>,
    hooks: Arc<dyn TransactionHooks>,
}

impl Transactions {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv, query: None, hooks: Arc::new(NoopHooks) }
    }

    pub fn with_query_engine(mut self, query: Arc<dyn QueryEngine>) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn TransactionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Run `lambda` to completion under the given per-transaction config.
    pub async fn run<F, Fut>(&self, config: TransactionConfig, lambda: F) -> TransactionResult
    where
        F: Fn(Arc<AttemptContext>) -> Fut,
        Fut: Future<Output = Result<(), AttemptError>>,
    {
        let ctx = TransactionContext::new(
            Arc::clone(&self.kv),
            self.query.clone(),
            Arc::clone(&self.hooks),
            config,
        );
        let result = ctx.run(lambda).await;
        if let TransactionResult::Failed { .. } = &result {
            tracing::info!(transaction_id = %ctx.transaction_id, "transaction failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use txn_durability::InMemoryKvStore;
    use txn_types::DocumentId;

    fn transactions() -> Transactions {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        Transactions::new(kv)
    }

    #[tokio::test]
    async fn successful_lambda_commits() {
        let txns = transactions();
        let id = DocumentId::new("b", "doc-1");
        let result = txns
            .run(TransactionConfig::default(), move |ctx| {
                let id = id.clone();
                async move {
                    ctx.insert(&id, serde_json::json!({"a": 1})).await?;
                    Ok(())
                }
            })
            .await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn retryable_failure_retries_until_expired() {
        let txns = transactions();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        // SAFETY_MARGIN is 2s, so a timeout just above it leaves a short
        // window in which at least one retry can happen before expiry.
        let config = TransactionConfig { timeout: Duration::from_millis(2200), ..Default::default() };
        let result = txns
            .run(config, move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(AttemptError::Cause(ErrorCause::DocumentAlreadyInTransaction)) }
            })
            .await;
        assert!(matches!(result, TransactionResult::Expired));
        assert!(attempts.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn hard_failure_aborts_without_retry() {
        let txns = transactions();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result = txns
            .run(TransactionConfig::default(), move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(AttemptError::Failed(ErrorClass::FailHard)) }
            })
            .await;
        assert!(matches!(result, TransactionResult::Failed { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
