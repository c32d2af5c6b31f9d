//! Document addressing and the opaque tokens attached to a document revision.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default scope/collection name when the caller does not specify one.
pub const DEFAULT_SCOPE: &str = "_default";
/// Default scope/collection name when the caller does not specify one.
pub const DEFAULT_COLLECTION: &str = "_default";

/// Fully-qualified document address: `(bucket, scope, collection, key)`.
///
/// Two ids are equal iff all four components match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
    pub key: String,
}

impl DocumentId {
    /// Build an id in the default scope/collection.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            scope: DEFAULT_SCOPE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            key: key.into(),
        }
    }

    /// Build an id with an explicit scope and collection.
    pub fn with_collection(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}::{}",
            self.bucket, self.scope, self.collection, self.key
        )
    }
}

/// Opaque 64-bit compare-and-swap token. Equality only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Cas(pub u64);

impl Cas {
    /// The empty-cas sentinel, meaning "no CAS check requested".
    pub const EMPTY: Cas = Cas(0);

    /// Whether this is the empty-cas sentinel.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Produced by a successful write; consumed by the observe-seqno poller and
/// by query scan_consistency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationToken {
    pub partition_uuid: u64,
    pub sequence_number: u64,
    pub partition_id: u16,
    pub bucket: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scope_and_collection() {
        let id = DocumentId::new("travel-sample", "doc1");
        assert_eq!(id.scope, DEFAULT_SCOPE);
        assert_eq!(id.collection, DEFAULT_COLLECTION);
    }

    #[test]
    fn equality_is_componentwise() {
        let a = DocumentId::new("b", "k");
        let b = DocumentId::with_collection("b", "_default", "_default", "k");
        assert_eq!(a, b);

        let c = DocumentId::with_collection("b", "other", "_default", "k");
        assert_ne!(a, c);
    }

    #[test]
    fn empty_cas_sentinel() {
        assert!(Cas::EMPTY.is_empty());
        assert!(!Cas(1).is_empty());
    }
}
