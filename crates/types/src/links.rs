//! Per-document transaction metadata stored as XATTRs on the touched
//! document ("transaction links"), and the immutable snapshot an attempt
//! hands back from `get`.

use crate::id::{Cas, DocumentId};
use crate::atr::ForwardCompat;
use serde::{Deserialize, Serialize};

/// Pointer back to the ATR document holding this attempt's entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtrRef {
    pub atr_bucket: String,
    pub atr_scope: String,
    pub atr_collection: String,
    pub atr_id: String,
}

/// The pending new body of a document during an attempt. Stored as an
/// XATTR until commit, then copied into the document body (or used to
/// delete, for removes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum StagedContent {
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

/// Pre-image CAS/revision captured at staging time, used to detect a
/// concurrent external mutation of a document this attempt has staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreInfo {
    pub cas: Cas,
}

/// The `txn` virtual-XATTR namespace written on every document this attempt
/// touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLinks {
    pub atr: AtrRef,
    pub transaction_id: String,
    pub attempt_id: String,
    pub operation_id: String,
    pub staged_content: Option<StagedContent>,
    pub crc32: Option<u32>,
    pub restore: Option<RestoreInfo>,
    pub forward_compat: Option<ForwardCompat>,
    /// True once this link marks the document for removal on commit.
    pub is_deleted: bool,
}

impl TransactionLinks {
    pub fn new(atr: AtrRef, transaction_id: impl Into<String>, attempt_id: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self {
            atr,
            transaction_id: transaction_id.into(),
            attempt_id: attempt_id.into(),
            operation_id: operation_id.into(),
            staged_content: None,
            crc32: None,
            restore: None,
            forward_compat: None,
            is_deleted: false,
        }
    }

    /// Whether `attempt_id` is the attempt that staged this link.
    pub fn belongs_to(&self, attempt_id: &str) -> bool {
        self.attempt_id == attempt_id
    }
}

/// Immutable snapshot returned by `AttemptContext::get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionGetResult {
    pub id: DocumentId,
    pub cas: Cas,
    pub content: Option<serde_json::Value>,
    pub links: Option<TransactionLinks>,
}
