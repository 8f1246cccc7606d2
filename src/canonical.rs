//! Canonical serialization and the content-hash index ("smart copy").
//!
//! Two subgraphs are content-equivalent iff their canonical byte forms are
//! equal. The form is built recursively with a fixed depth budget:
//!
//! | Node      | Contribution                                          |
//! |-----------|-------------------------------------------------------|
//! | null      | `$Lnull`                                              |
//! | string    | `$S` + text                                           |
//! | name      | `$N` + text                                           |
//! | scalar    | `$L` + textual form                                   |
//! | array     | `$A` + elements in order                              |
//! | dict      | `$D` + entries in sorted key order                    |
//! | stream    | `$B` + dict form + SHA-256 digest of the payload      |
//!
//! Dictionary entries whose key is a known back-link toward an ancestor are
//! skipped — that is the cycle-breaking rule. References are resolved
//! through the xref table; an exhausted depth budget truncates the form
//! after the current tag (risking only under-deduplication, never a wrong
//! merge). Indirect nodes go through a per-writer memo keyed by
//! (document id, object number): once a node's form has been computed, later
//! visits emit its polynomial hash instead of re-serializing, which bounds
//! the cost on shared substructure.
//!
//! The 31-multiplier polynomial hash is a fast pre-filter only; equality of
//! the exact bytes is always the tiebreaker, so hash collisions cannot
//! cause a false merge.

use crate::document::{DocId, Document};
use crate::object::{NodeId, Value};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

/// Recursion budget for canonical serialization.
pub const DEPTH_BUDGET: u32 = 100;

const TAG_NULL: &[u8] = b"$Lnull";
const TAG_STRING: &[u8] = b"$S";
const TAG_NAME: &[u8] = b"$N";
const TAG_SCALAR: &[u8] = b"$L";
const TAG_ARRAY: &[u8] = b"$A";
const TAG_DICT: &[u8] = b"$D";
const TAG_STREAM: &[u8] = b"$B";

/// Memo of already-serialized indirect nodes: (owning document, object
/// number) -> polynomial hash of the node's canonical form.
pub type SerializerMemo = FxHashMap<(DocId, u32), u64>;

// ============================================================================
// Back-link exclusion
// ============================================================================

/// Dictionary keys excluded from canonical serialization because they point
/// back toward an ancestor.
///
/// `always` keys are skipped unconditionally; `structural` keys are skipped
/// only when their value is a reference or a dictionary (a scalar under the
/// same key is ordinary data and stays in the form).
#[derive(Clone, Debug)]
pub struct BackLinkKeys {
    always: Vec<String>,
    structural: Vec<String>,
}

impl Default for BackLinkKeys {
    fn default() -> Self {
        Self {
            always: vec!["Parent".to_string()],
            structural: vec!["P".to_string()],
        }
    }
}

impl BackLinkKeys {
    pub fn new(always: Vec<String>, structural: Vec<String>) -> Self {
        Self { always, structural }
    }

    fn skips(&self, key: &str, structural_value: bool) -> bool {
        self.always.iter().any(|k| k == key)
            || (structural_value && self.structural.iter().any(|k| k == key))
    }
}

// ============================================================================
// Canonical form
// ============================================================================

/// A computed canonical form: the exact bytes plus their polynomial hash.
///
/// `Hash` uses the stored hash; `Eq` compares the bytes, so a colliding
/// hash degrades to a bucket scan rather than a false merge.
#[derive(Clone, Debug)]
pub struct CanonicalKey {
    bytes: Vec<u8>,
    hash: u64,
}

impl CanonicalKey {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for CanonicalKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bytes == other.bytes
    }
}

impl Eq for CanonicalKey {}

impl std::hash::Hash for CanonicalKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// 31-multiplier polynomial hash over the canonical bytes.
pub fn poly_hash(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |h, &b| h.wrapping_mul(31).wrapping_add(u64::from(b)))
}

/// Compute the canonical form of a node subgraph.
pub fn canonical_form(
    doc: &Document,
    id: NodeId,
    memo: &mut SerializerMemo,
    links: &BackLinkKeys,
) -> CanonicalKey {
    let mut bytes = Vec::new();
    ser_node(doc, Some(id), DEPTH_BUDGET, &mut bytes, memo, links);
    let hash = poly_hash(&bytes);
    CanonicalKey { bytes, hash }
}

fn ser_node(
    doc: &Document,
    id: Option<NodeId>,
    level: u32,
    buf: &mut Vec<u8>,
    memo: &mut SerializerMemo,
    links: &BackLinkKeys,
) {
    if level == 0 {
        return;
    }
    let Some(id) = id else {
        buf.extend_from_slice(TAG_NULL);
        return;
    };

    // References are transparent: serialize what they point at. The level
    // decrement bounds pathological ref-to-ref cycles.
    if let Value::Ref(num) = doc.node(id) {
        ser_node(doc, doc.resolve(*num), level - 1, buf, memo, links);
        return;
    }

    if let Some(num) = doc.obj_num(id) {
        let key = (doc.id(), num);
        if let Some(hash) = memo.get(&key) {
            buf.extend_from_slice(&hash.to_le_bytes());
            return;
        }
        let mut inner = Vec::new();
        ser_value(doc, id, level, &mut inner, memo, links);
        let hash = poly_hash(&inner);
        memo.entry(key).or_insert(hash);
        buf.extend_from_slice(&inner);
        return;
    }

    ser_value(doc, id, level, buf, memo, links);
}

fn ser_value(
    doc: &Document,
    id: NodeId,
    level: u32,
    buf: &mut Vec<u8>,
    memo: &mut SerializerMemo,
    links: &BackLinkKeys,
) {
    match doc.node(id) {
        Value::Stream { dict, data } => {
            buf.extend_from_slice(TAG_STREAM);
            ser_dict_entries(doc, dict, level - 1, buf, memo, links);
            // Digest instead of raw bytes keeps the form bounded regardless
            // of payload size.
            buf.extend_from_slice(&Sha256::digest(data));
        }
        Value::Dict(map) => ser_dict_entries(doc, map, level - 1, buf, memo, links),
        Value::Array(items) => {
            buf.extend_from_slice(TAG_ARRAY);
            if level - 1 == 0 {
                return;
            }
            for item in items {
                ser_node(doc, Some(*item), level - 1, buf, memo, links);
            }
        }
        Value::Str(s) => {
            buf.extend_from_slice(TAG_STRING);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Name(n) => {
            buf.extend_from_slice(TAG_NAME);
            buf.extend_from_slice(n.as_bytes());
        }
        Value::Bool(b) => {
            buf.extend_from_slice(TAG_SCALAR);
            buf.extend_from_slice(if *b { b"true" } else { b"false" });
        }
        Value::Number(v) => {
            buf.extend_from_slice(TAG_SCALAR);
            buf.extend_from_slice(format!("{}", v).as_bytes());
        }
        Value::Null | Value::Released => buf.extend_from_slice(TAG_NULL),
        // Refs were dereferenced in ser_node.
        Value::Ref(num) => ser_node(doc, doc.resolve(*num), level - 1, buf, memo, links),
    }
}

fn ser_dict_entries(
    doc: &Document,
    entries: &std::collections::BTreeMap<String, NodeId>,
    level: u32,
    buf: &mut Vec<u8>,
    memo: &mut SerializerMemo,
    links: &BackLinkKeys,
) {
    buf.extend_from_slice(TAG_DICT);
    if level == 0 {
        return;
    }
    // BTreeMap iterates in sorted key order, which is the deterministic
    // order the form requires.
    for (key, value) in entries {
        let structural = matches!(doc.node(*value), Value::Ref(_) | Value::Dict(_));
        if links.skips(key, structural) {
            continue;
        }
        buf.extend_from_slice(TAG_NAME);
        buf.extend_from_slice(key.as_bytes());
        ser_node(doc, Some(*value), level, buf, memo, links);
    }
}

// ============================================================================
// Content-hash index
// ============================================================================

/// Maps canonical forms to the destination node first produced for that
/// content. Populated lazily, smart-copy mode only, dictionaries and
/// streams only.
#[derive(Default)]
pub struct ContentIndex {
    map: FxHashMap<CanonicalKey, NodeId>,
}

impl ContentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The node previously registered under an equal canonical form.
    pub fn hit(&self, key: &CanonicalKey) -> Option<NodeId> {
        self.map.get(key).copied()
    }

    /// Register the destination node produced for this form. First
    /// registration wins; later identical forms resolve to it.
    pub fn register(&mut self, key: CanonicalKey, node: NodeId) {
        self.map.entry(key).or_insert(node);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn form(doc: &Document, id: NodeId) -> CanonicalKey {
        let mut memo = SerializerMemo::default();
        canonical_form(doc, id, &mut memo, &BackLinkKeys::default())
    }

    #[test]
    fn test_poly_hash_known_value() {
        assert_eq!(poly_hash(b""), 0);
        assert_eq!(poly_hash(b"ab"), 31 * 97 + 98);
    }

    #[test]
    fn test_null_and_scalar_tags() {
        let mut doc = Document::new();
        let n = doc.null();
        let s = doc.string("hi");
        let nm = doc.name("Kids");
        let b = doc.boolean(true);
        assert_eq!(form(&doc, n).bytes(), b"$Lnull");
        assert_eq!(form(&doc, s).bytes(), b"$Shi");
        assert_eq!(form(&doc, nm).bytes(), b"$NKids");
        assert_eq!(form(&doc, b).bytes(), b"$Ltrue");
    }

    #[test]
    fn test_equal_content_equal_form() {
        let mut doc = Document::new();
        let s1 = doc.string("v");
        let s2 = doc.string("v");
        let d1 = doc.dict([("K", s1)]);
        let d2 = doc.dict([("K", s2)]);
        assert_eq!(form(&doc, d1), form(&doc, d2));

        let s3 = doc.string("other");
        let d3 = doc.dict([("K", s3)]);
        assert_ne!(form(&doc, d1), form(&doc, d3));
    }

    #[test]
    fn test_parent_key_excluded() {
        let mut doc = Document::new();
        let pa = doc.string("first parent");
        let p1 = doc.dict([("Tag", pa)]);
        let n1 = doc.make_indirect(p1);
        let pb = doc.string("second parent");
        let p2 = doc.dict([("Tag", pb)]);
        let n2 = doc.make_indirect(p2);

        let v1 = doc.string("same");
        let r1 = doc.reference(n1);
        let x = doc.dict([("Parent", r1), ("Value", v1)]);
        let v2 = doc.string("same");
        let r2 = doc.reference(n2);
        let y = doc.dict([("Parent", r2), ("Value", v2)]);

        // Differ only in the parent link's identity: forms must be equal.
        assert_eq!(form(&doc, x), form(&doc, y));
    }

    #[test]
    fn test_owner_key_skipped_only_for_structural_values() {
        let mut doc = Document::new();
        let s1 = doc.string("a");
        let d1 = doc.dict([("P", s1)]);
        let s2 = doc.string("b");
        let d2 = doc.dict([("P", s2)]);
        // Scalar under "P" is data, so the forms differ.
        assert_ne!(form(&doc, d1), form(&doc, d2));

        let r1 = doc.reference(11);
        let d3 = doc.dict([("P", r1)]);
        let r2 = doc.reference(22);
        let d4 = doc.dict([("P", r2)]);
        // Reference under "P" is a back-link and is skipped.
        assert_eq!(form(&doc, d3), form(&doc, d4));
    }

    #[test]
    fn test_self_parent_cycle_terminates() {
        let mut doc = Document::new();
        let d = doc.dict(std::iter::empty::<(&str, NodeId)>());
        let num = doc.make_indirect(d);
        let r = doc.reference(num);
        doc.dict_set(d, "Parent", r);
        let key = form(&doc, d);
        assert_eq!(key.bytes(), b"$D");
    }

    #[test]
    fn test_mutual_reference_cycle_terminates() {
        let mut doc = Document::new();
        let a = doc.dict(std::iter::empty::<(&str, NodeId)>());
        let b = doc.dict(std::iter::empty::<(&str, NodeId)>());
        let na = doc.make_indirect(a);
        let nb = doc.make_indirect(b);
        let ra = doc.reference(na);
        let rb = doc.reference(nb);
        doc.dict_set(a, "Next", rb);
        doc.dict_set(b, "Next", ra);
        // Bounded by the depth budget; must not hang or blow the stack.
        let key = form(&doc, a);
        assert!(!key.bytes().is_empty());
    }

    #[test]
    fn test_depth_budget_truncates_deep_nesting() {
        let mut doc = Document::new();
        let mut inner = doc.number(1.0);
        for _ in 0..150 {
            inner = doc.array([inner]);
        }
        let key = form(&doc, inner);
        // 100 levels of "$A" then truncation.
        assert_eq!(key.bytes().len(), 2 * DEPTH_BUDGET as usize);
    }

    #[test]
    fn test_memo_replaces_reserialization() {
        let mut doc = Document::new();
        let v = doc.string("shared");
        let shared = doc.dict([("K", v)]);
        let num = doc.make_indirect(shared);
        let r1 = doc.reference(num);
        let r2 = doc.reference(num);
        let outer = doc.array([r1, r2]);

        let mut memo = SerializerMemo::default();
        let links = BackLinkKeys::default();
        let key = canonical_form(&doc, outer, &mut memo, &links);
        assert_eq!(memo.len(), 1);

        // First occurrence inlines the full form, second emits the hash.
        let inner = canonical_form(&doc, shared, &mut SerializerMemo::default(), &links);
        let mut expected = Vec::new();
        expected.extend_from_slice(b"$A");
        expected.extend_from_slice(inner.bytes());
        expected.extend_from_slice(&inner.hash_value().to_le_bytes());
        assert_eq!(key.bytes(), expected.as_slice());
    }

    #[test]
    fn test_stream_digest_distinguishes_payloads() {
        let mut doc = Document::new();
        let s1 = doc.stream(std::iter::empty::<(&str, NodeId)>(), b"payload one".to_vec());
        let s2 = doc.stream(std::iter::empty::<(&str, NodeId)>(), b"payload two".to_vec());
        let s3 = doc.stream(std::iter::empty::<(&str, NodeId)>(), b"payload one".to_vec());
        assert_ne!(form(&doc, s1), form(&doc, s2));
        assert_eq!(form(&doc, s1), form(&doc, s3));
        // Digest, not raw bytes: form stays small for big payloads.
        let big = doc.stream(std::iter::empty::<(&str, NodeId)>(), vec![0u8; 1 << 20]);
        assert!(form(&doc, big).bytes().len() < 64);
    }

    #[test]
    fn test_stream_form_embeds_payload_digest() {
        let mut doc = Document::new();
        let s = doc.stream(std::iter::empty::<(&str, NodeId)>(), b"digest me".to_vec());
        let key = form(&doc, s);
        let digest = Sha256::digest(b"digest me");
        let mut expected = Vec::new();
        expected.extend_from_slice(b"$B$D");
        expected.extend_from_slice(&digest);
        assert_eq!(key.bytes(), expected.as_slice());
        assert_eq!(hex::encode(&key.bytes()[4..]), hex::encode(digest));
    }

    #[test]
    fn test_unresolved_reference_serializes_as_null() {
        let mut doc = Document::new();
        let r = doc.reference(42);
        assert_eq!(form(&doc, r).bytes(), b"$Lnull");
    }

    #[test]
    fn test_content_index_first_registration_wins() {
        let mut doc = Document::new();
        let a = doc.string("x");
        let b = doc.string("x");
        let d1 = doc.dict([("K", a)]);
        let d2 = doc.dict([("K", b)]);
        let k1 = form(&doc, d1);
        let k2 = form(&doc, d2);

        let mut index = ContentIndex::new();
        assert!(index.hit(&k1).is_none());
        index.register(k1, d1);
        assert_eq!(index.hit(&k2), Some(d1));
        index.register(k2, d2);
        assert_eq!(index.len(), 1);
        let k1_again = form(&doc, d1);
        assert_eq!(index.hit(&k1_again), Some(d1));
    }
}
