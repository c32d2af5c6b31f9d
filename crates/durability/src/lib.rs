//! Durability-facing collaborators: an in-process KV store standing in for
//! the memcached connection, the observe-seqno durability poller, and the
//! client-record document the lost-attempts cleaner shards work across.

pub mod client_record;
pub mod kv_store;
pub mod observe;

pub use client_record::{ClientRecord, ClientRecordDetails, ClientRecordError, CLIENT_RECORD_KEY};
pub use kv_store::{InMemoryKvStore, StoredDocument};
pub use observe::{ObserveError, ObserveSeqnoPoller};
