//! # txn-core
//!
//! Distributed ACID transaction orchestration for a document-database
//! client SDK: attempt-scoped staging of inserts/replaces/removes via
//! document XATTRs, an Active Transaction Record per transaction for
//! crash recovery, and a background cleaner for attempts whose client
//! never finished them.
//!
//! ```no_run
//! use std::sync::Arc;
//! use txn_core::{Transactions, TransactionConfig};
//! use txn_types::DocumentId;
//!
//! # async fn run(kv: Arc<dyn txn_types::KvStore>) -> txn_types::TransactionResult {
//! let txns = Transactions::new(kv);
//! txns.run(TransactionConfig::default(), |ctx| async move {
//!     let id = DocumentId::new("travel-sample", "doc-1");
//!     ctx.insert(&id, serde_json::json!({"hello": "world"})).await?;
//!     Ok(())
//! }).await
//! # }
//! ```
//!
//! Internal crates (`txn-types`, `txn-concurrency`, `txn-durability`,
//! `txn-engine`) are implementation detail; only this crate's re-exported
//! surface is stable.

pub use txn_engine::{
    select_atr, AtrStore, AttemptConfig, AttemptContext, AttemptError, CleanerConfig,
    GetMultiMode, GetMultiOrchestrator, HookAction, LostAttemptsCleaner, NoopHooks,
    TransactionConfig, TransactionContext, TransactionHooks, Transactions, DEFAULT_TIMEOUT,
    NUM_ATR_SHARDS, SAFETY_MARGIN,
};

pub use txn_types::{
    AtrEntry, AtrRef, AttemptState, Cas, DocumentId, DurabilityRequirement, ErrorCause,
    ErrorClass, ErrorPolicy, KvErrorKind, KvStore, MutationToken, PersistTo, QueryEngine,
    QueryOptions, QueryResponse, ReplicateTo, TransactionGetResult, TransactionLinks,
    TransactionResult,
};
