//! An in-process `KvStore`: stands in for the memcached binary protocol
//! connection a real client would hold, over a concurrent document map.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use txn_types::{
    BucketTopology, Cas, DocumentId, GetSpecResult, KvErrorKind, KvStore, MutationToken,
    ObserveSeqnoResponse, PathStatus, StoreSemantics, SubdocOpcode, SubdocResult, SubdocSpec,
};

/// A document plus its XATTR namespace, as actually stored.
#[derive(Debug, Clone, Default)]
pub struct StoredDocument {
    pub cas: Cas,
    pub body: Option<Value>,
    pub xattrs: BTreeMap<String, Value>,
    pub is_deleted: bool,
    pub last_mutation: Option<MutationToken>,
}

/// Number of virtual partitions documents are hashed into, standing in for
/// vbucket mapping.
const NUM_PARTITIONS: u16 = 1024;

/// An in-memory, CAS-checked document store with subdocument support.
pub struct InMemoryKvStore {
    docs: DashMap<DocumentId, StoredDocument>,
    cas_counter: AtomicU64,
    seqno_counter: AtomicU64,
    topology: Mutex<BucketTopology>,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
            cas_counter: AtomicU64::new(1),
            seqno_counter: AtomicU64::new(1),
            topology: Mutex::new(BucketTopology {
                node_locator_is_vbucket: true,
                num_replicas: Some(2),
            }),
        }
    }

    /// Override the topology fact the observe-seqno pre-check consults.
    pub fn set_topology(&self, topology: BucketTopology) {
        *self.topology.lock() = topology;
    }

    fn next_cas(&self) -> Cas {
        Cas(self.cas_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn partition_for(id: &DocumentId) -> u16 {
        let mut hash: u64 = 1469598103934665603;
        for byte in id.key.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        (hash % NUM_PARTITIONS as u64) as u16
    }

    fn next_token(&self, id: &DocumentId) -> MutationToken {
        let seqno = self.seqno_counter.fetch_add(1, Ordering::SeqCst);
        MutationToken {
            partition_id: Self::partition_for(id),
            partition_uuid: 1,
            sequence_number: seqno,
            bucket: id.bucket.clone(),
        }
    }

    fn apply_lookup(doc: &StoredDocument, spec: &SubdocSpec) -> Result<Option<Value>, PathStatus> {
        let root: &Value = if spec.is_xattr() {
            return xattr_get(&doc.xattrs, &spec.path, spec.opcode);
        } else {
            doc.body.as_ref().ok_or(PathStatus::DocNotJson)?
        };
        body_get(root, &spec.path, spec.opcode)
    }

    fn apply_mutation(
        doc: &mut StoredDocument,
        spec: &SubdocSpec,
    ) -> Result<Option<Value>, PathStatus> {
        if spec.is_xattr() {
            xattr_mutate(&mut doc.xattrs, spec)
        } else if spec.path.is_empty() {
            // Empty path is our stand-in for a whole-document body set,
            // used by the caller to install a document's initial content
            // in the same mutate_in call that writes its transaction link.
            doc.body = Some(spec.value.clone().ok_or(PathStatus::PathInvalid)?);
            Ok(None)
        } else {
            let body = doc.body.get_or_insert(Value::Object(Default::default()));
            body_mutate(body, spec)
        }
    }
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

fn xattr_get(
    xattrs: &BTreeMap<String, Value>,
    path: &str,
    opcode: SubdocOpcode,
) -> Result<Option<Value>, PathStatus> {
    let segments = path_segments(path);
    let (ns, rest) = segments.split_first().ok_or(PathStatus::PathInvalid)?;
    let root = xattrs.get(*ns).ok_or(PathStatus::PathNotFound)?;
    let value = navigate(root, rest)?;
    finish_lookup(value, opcode)
}

fn body_get(root: &Value, path: &str, opcode: SubdocOpcode) -> Result<Option<Value>, PathStatus> {
    let segments = path_segments(path);
    let value = navigate(root, &segments)?;
    finish_lookup(value, opcode)
}

fn finish_lookup(value: Option<&Value>, opcode: SubdocOpcode) -> Result<Option<Value>, PathStatus> {
    match opcode {
        SubdocOpcode::Exists => Ok(Some(Value::Bool(value.is_some()))),
        SubdocOpcode::GetCount => {
            let v = value.ok_or(PathStatus::PathNotFound)?;
            let count = match v {
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                _ => return Err(PathStatus::PathMismatch),
            };
            Ok(Some(Value::from(count)))
        }
        SubdocOpcode::Get => value.cloned().map(Some).ok_or(PathStatus::PathNotFound),
        _ => unreachable!("non-lookup opcode routed to lookup handler"),
    }
}

fn navigate<'a>(root: &'a Value, segments: &[&str]) -> Result<Option<&'a Value>, PathStatus> {
    let mut current = root;
    for seg in segments {
        match current {
            Value::Object(map) => match map.get(*seg) {
                Some(v) => current = v,
                None => return Ok(None),
            },
            Value::Array(arr) => {
                let idx: usize = seg.parse().map_err(|_| PathStatus::PathInvalid)?;
                match arr.get(idx) {
                    Some(v) => current = v,
                    None => return Ok(None),
                }
            }
            _ => return Err(PathStatus::PathMismatch),
        }
    }
    Ok(Some(current))
}

fn xattr_mutate(
    xattrs: &mut BTreeMap<String, Value>,
    spec: &SubdocSpec,
) -> Result<Option<Value>, PathStatus> {
    let segments = path_segments(&spec.path);
    let (ns, rest) = segments.split_first().ok_or(PathStatus::PathInvalid)?;
    let root = xattrs.entry((*ns).to_string()).or_insert_with(|| Value::Object(Default::default()));
    mutate_at(root, rest, spec)
}

fn body_mutate(root: &mut Value, spec: &SubdocSpec) -> Result<Option<Value>, PathStatus> {
    let segments = path_segments(&spec.path);
    mutate_at(root, &segments, spec)
}

fn mutate_at(root: &mut Value, segments: &[&str], spec: &SubdocSpec) -> Result<Option<Value>, PathStatus> {
    let (last, parents) = match segments.split_last() {
        Some(x) => x,
        None => return Err(PathStatus::PathInvalid),
    };
    let mut current = root;
    for seg in parents {
        let obj = current.as_object_mut().ok_or(PathStatus::PathMismatch)?;
        current = obj
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    let obj = current.as_object_mut().ok_or(PathStatus::PathMismatch)?;

    match spec.opcode {
        SubdocOpcode::DictAdd => {
            if obj.contains_key(*last) {
                return Err(PathStatus::PathExists);
            }
            obj.insert(
                last.to_string(),
                spec.value.clone().ok_or(PathStatus::PathInvalid)?,
            );
            Ok(None)
        }
        SubdocOpcode::DictUpsert => {
            obj.insert(
                last.to_string(),
                spec.value.clone().ok_or(PathStatus::PathInvalid)?,
            );
            Ok(None)
        }
        SubdocOpcode::Replace => {
            if !obj.contains_key(*last) {
                return Err(PathStatus::PathNotFound);
            }
            obj.insert(
                last.to_string(),
                spec.value.clone().ok_or(PathStatus::PathInvalid)?,
            );
            Ok(None)
        }
        SubdocOpcode::Remove => {
            obj.remove(*last).ok_or(PathStatus::PathNotFound)?;
            Ok(None)
        }
        SubdocOpcode::Counter => {
            let delta = spec
                .value
                .as_ref()
                .and_then(Value::as_i64)
                .ok_or(PathStatus::PathInvalid)?;
            let current_val = obj.get(*last).and_then(Value::as_i64).unwrap_or(0);
            let new_val = txn_types::validate_counter_delta(delta, current_val)?;
            obj.insert(last.to_string(), Value::from(new_val));
            Ok(Some(Value::from(new_val)))
        }
        SubdocOpcode::ArrayPushFirst | SubdocOpcode::ArrayPushLast | SubdocOpcode::ArrayInsert
        | SubdocOpcode::ArrayAddUnique => {
            let arr_val = obj
                .entry(last.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            let arr = arr_val.as_array_mut().ok_or(PathStatus::PathMismatch)?;
            let value = spec.value.clone().ok_or(PathStatus::PathInvalid)?;
            match spec.opcode {
                SubdocOpcode::ArrayPushFirst => arr.insert(0, value),
                SubdocOpcode::ArrayPushLast => arr.push(value),
                SubdocOpcode::ArrayInsert => arr.push(value),
                SubdocOpcode::ArrayAddUnique => {
                    if value.is_object() || value.is_array() {
                        return Err(PathStatus::ValueCannotInsert);
                    }
                    if arr.contains(&value) {
                        return Err(PathStatus::PathExists);
                    }
                    arr.push(value);
                }
                _ => unreachable!(),
            }
            Ok(None)
        }
        SubdocOpcode::Get | SubdocOpcode::GetCount | SubdocOpcode::Exists => {
            unreachable!("lookup opcode routed to mutate handler")
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, id: &DocumentId, access_deleted: bool) -> Result<GetSpecResult, KvErrorKind> {
        let doc = self.docs.get(id).ok_or(KvErrorKind::DocumentNotFound)?;
        if doc.is_deleted && !access_deleted {
            return Err(KvErrorKind::DocumentNotFound);
        }
        Ok(GetSpecResult {
            cas: doc.cas,
            body: doc.body.clone(),
            xattrs: doc.xattrs.clone(),
            is_deleted: doc.is_deleted,
        })
    }

    async fn lookup_in(
        &self,
        id: &DocumentId,
        specs: &[SubdocSpec],
        access_deleted: bool,
    ) -> Result<(Cas, Vec<SubdocResult>), KvErrorKind> {
        let doc = self.docs.get(id).ok_or(KvErrorKind::DocumentNotFound)?;
        if doc.is_deleted && !access_deleted {
            return Err(KvErrorKind::DocumentNotFound);
        }
        let results = specs
            .iter()
            .map(|spec| SubdocResult {
                original_index: spec.original_index,
                outcome: Self::apply_lookup(&doc, spec),
            })
            .collect();
        Ok((doc.cas, results))
    }

    async fn mutate_in(
        &self,
        id: &DocumentId,
        specs: &[SubdocSpec],
        store_semantics: StoreSemantics,
        cas: Cas,
        create_as_deleted: bool,
    ) -> Result<(Cas, MutationToken, Vec<SubdocResult>), KvErrorKind> {
        let mut entry = self.docs.entry(id.clone()).or_insert_with(StoredDocument::default);

        match store_semantics {
            StoreSemantics::Insert => {
                if entry.body.is_some() && !entry.is_deleted {
                    return Err(KvErrorKind::DocumentExists);
                }
            }
            StoreSemantics::Upsert => {
                if !cas.is_empty() {
                    return Err(KvErrorKind::Other("upsert with nonzero cas".into()));
                }
            }
            StoreSemantics::Replace => {
                if !cas.is_empty() && entry.cas != cas {
                    return Err(KvErrorKind::CasMismatch);
                }
            }
        }

        let results: Vec<SubdocResult> = specs
            .iter()
            .map(|spec| SubdocResult {
                original_index: spec.original_index,
                outcome: Self::apply_mutation(&mut entry, spec),
            })
            .collect();

        entry.cas = self.next_cas();
        entry.is_deleted = create_as_deleted;
        let token = self.next_token(id);
        entry.last_mutation = Some(token.clone());
        Ok((entry.cas, token, results))
    }

    async fn remove(&self, id: &DocumentId, cas: Cas) -> Result<MutationToken, KvErrorKind> {
        let mut entry = self.docs.get_mut(id).ok_or(KvErrorKind::DocumentNotFound)?;
        if !cas.is_empty() && entry.cas != cas {
            return Err(KvErrorKind::CasMismatch);
        }
        entry.body = None;
        entry.is_deleted = true;
        entry.cas = self.next_cas();
        let token = self.next_token(id);
        entry.last_mutation = Some(token.clone());
        Ok(token)
    }

    async fn observe_seqno(
        &self,
        _bucket: &str,
        _partition_id: u16,
        _partition_uuid: u64,
        _node_is_active: bool,
    ) -> Result<ObserveSeqnoResponse, KvErrorKind> {
        let seqno = self.seqno_counter.load(Ordering::SeqCst);
        Ok(ObserveSeqnoResponse {
            current_seqno: seqno,
            last_persisted_seqno: seqno,
            old_partition_uuid: None,
        })
    }

    async fn topology(&self, _bucket: &str) -> Result<BucketTopology, KvErrorKind> {
        Ok(self.topology.lock().clone())
    }
}
