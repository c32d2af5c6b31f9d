//! Core types and trait boundaries for the distributed ACID transaction
//! core.
//!
//! This crate defines the foundational data model used throughout the
//! workspace:
//! - `DocumentId` / `Cas` / `MutationToken`: document addressing and opaque
//!   revision tokens.
//! - `AttemptState` / `AtrEntry`: the Active Transaction Record state
//!   machine and its persisted shape.
//! - `TransactionLinks` / `TransactionGetResult`: per-document staged
//!   metadata and the immutable snapshot an attempt reads back.
//! - `subdoc`: the tagged subdocument command model (XATTR-first sort,
//!   `original_index` restoration).
//! - `error`: the public error taxonomy and the underlying error-kind input
//!   to classification.
//! - `traits`: the `KvStore` / `QueryEngine` boundaries standing in for the
//!   out-of-scope memcached codec and N1QL transport.

#![warn(missing_docs)]

pub mod atr;
pub mod error;
pub mod id;
pub mod links;
pub mod subdoc;
pub mod traits;

pub use atr::{AtrEntry, AtrTimestamps, AttemptState, DurabilityLevel, ForwardCompat, ForwardCompatEntry, IllegalStateTransition};
pub use error::{ErrorCause, ErrorClass, ErrorPolicy, KvErrorKind, TransactionResult};
pub use id::{Cas, DocumentId, MutationToken, DEFAULT_COLLECTION, DEFAULT_SCOPE};
pub use links::{AtrRef, RestoreInfo, StagedContent, TransactionGetResult, TransactionLinks};
pub use subdoc::{
    first_error, path_flags, prepare_batch, restore_order, validate_counter_delta, PathStatus,
    PreparedBatch, StoreSemantics, SubdocOpcode, SubdocResult, SubdocSpec,
};
pub use traits::{
    BucketTopology, DurabilityRequirement, GetSpecResult, KvStore, ObserveSeqnoResponse,
    PersistTo, QueryEngine, QueryErrorCode, QueryOptions, QueryResponse, ReplicateTo,
};
