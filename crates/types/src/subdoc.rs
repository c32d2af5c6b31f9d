//! The subdocument command model: a tagged operation list with path-flag
//! bits, ordered the way the caller specified but executed XATTR-first.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Path flag bits.
pub mod path_flags {
    pub const CREATE_PARENTS: u8 = 0x01;
    pub const XATTR: u8 = 0x04;
    pub const EXPAND_MACROS: u8 = 0x10;
}

/// Lookup and mutation subdocument opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubdocOpcode {
    // Lookups
    Get,
    GetCount,
    Exists,
    // Mutations
    DictAdd,
    DictUpsert,
    Replace,
    Remove,
    Counter,
    ArrayPushFirst,
    ArrayPushLast,
    ArrayInsert,
    ArrayAddUnique,
}

impl SubdocOpcode {
    pub fn is_lookup(self) -> bool {
        matches!(self, SubdocOpcode::Get | SubdocOpcode::GetCount | SubdocOpcode::Exists)
    }

    pub fn is_mutation(self) -> bool {
        !self.is_lookup()
    }
}

/// Whole-document intent for a mutate_in batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreSemantics {
    Insert,
    Upsert,
    Replace,
}

/// One command in a lookup_in / mutate_in batch, as supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubdocSpec {
    pub opcode: SubdocOpcode,
    pub path: String,
    pub value: Option<Value>,
    pub flags: u8,
    /// Position in the caller-supplied order. Assigned before dispatch and
    /// used to restore result order after the XATTR-first sort.
    pub original_index: usize,
}

impl SubdocSpec {
    pub fn new(opcode: SubdocOpcode, path: impl Into<String>, value: Option<Value>, flags: u8) -> Self {
        Self { opcode, path, value, flags, original_index: 0 }
    }

    pub fn is_xattr(&self) -> bool {
        self.flags & path_flags::XATTR != 0
    }
}

/// Per-path failure statuses a mutate_in/lookup_in response may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathStatus {
    PathNotFound,
    PathExists,
    PathMismatch,
    PathInvalid,
    DocNotJson,
    ValueCannotInsert,
    NumRangeError,
    DeltaInvalid,
}

/// Outcome of one spec within a batch, tagged with its caller-visible index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubdocResult {
    pub original_index: usize,
    pub outcome: Result<Option<Value>, PathStatus>,
}

/// A command bundle prepared for dispatch: XATTR-first, stably sorted.
#[derive(Debug, Clone, Default)]
pub struct PreparedBatch {
    pub specs: Vec<SubdocSpec>,
}

/// Assign `original_index` and stable-sort so all XATTR specs precede all
/// non-XATTR specs, preserving caller order within each partition
/// (XATTR paths must precede document-body paths on the wire).
pub fn prepare_batch(mut specs: Vec<SubdocSpec>) -> PreparedBatch {
    for (i, spec) in specs.iter_mut().enumerate() {
        spec.original_index = i;
    }
    specs.sort_by_key(|s| !s.is_xattr());
    PreparedBatch { specs }
}

/// Re-sort results back into the caller's input order.
pub fn restore_order(mut results: Vec<SubdocResult>) -> Vec<SubdocResult> {
    results.sort_by_key(|r| r.original_index);
    results
}

/// First failing spec in a multi-mutation response, if any.
pub fn first_error<'a>(
    specs: &'a [SubdocSpec],
    results: &[SubdocResult],
) -> Option<(usize, &'a str, PathStatus)> {
    results
        .iter()
        .filter_map(|r| r.outcome.as_ref().err().map(|e| (r.original_index, *e)))
        .min_by_key(|(idx, _)| *idx)
        .map(|(idx, status)| (idx, specs[idx].path.as_str(), status))
}

/// Validate a `counter` delta: zero or an overflow-inducing value maps to
/// `DELTA_INVALID`.
pub fn validate_counter_delta(delta: i64, current: i64) -> Result<i64, PathStatus> {
    if delta == 0 {
        return Err(PathStatus::DeltaInvalid);
    }
    current
        .checked_add(delta)
        .ok_or(PathStatus::DeltaInvalid)
}
