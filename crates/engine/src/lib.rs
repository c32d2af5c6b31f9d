//! Drives the distributed ACID transaction protocol on top of `txn-durability`'s
//! KV/query transport and `txn-concurrency`'s retry/mode-arbitration
//! primitives: attempt-level staging and commit/rollback, the transaction
//! retry loop, multi-document read-skew detection, and the lost-attempts
//! background cleaner.

#![warn(missing_docs)]

pub mod atr_store;
pub mod attempt;
pub mod cleaner;
pub mod expiry;
pub mod get_multi;
pub mod hooks;
pub mod transaction;

pub use atr_store::{select_atr, AtrStore, NUM_ATR_SHARDS};
pub use attempt::{AttemptConfig, AttemptContext, AttemptError};
pub use cleaner::{CleanerConfig, LostAttemptsCleaner};
pub use expiry::{ExpiryClock, DEFAULT_TIMEOUT, SAFETY_MARGIN};
pub use get_multi::{GetMultiMode, GetMultiOrchestrator};
pub use hooks::{HookAction, NoopHooks, TransactionHooks};
pub use transaction::{TransactionConfig, TransactionContext, Transactions};
