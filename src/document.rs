//! Document arena and cross-reference table.
//!
//! A [`Document`] owns every node in one object graph: an arena of
//! [`Value`]s addressed by [`NodeId`], plus an [`XrefTable`] mapping object
//! numbers to indirect slots. Slot 0 is reserved and never handed out.
//!
//! Each document gets a process-unique [`DocId`], which keys the writer's
//! copy map and serializer memo so nodes from different documents never
//! collide on identity.

use crate::object::{NodeId, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_DOC_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique document identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DocId(u64);

// Xref slot state flags.
/// The object's final bytes have been written; offset (if inline) is valid.
pub const FLUSHED: u8 = 1 << 0;
/// The object was referenced by a flushed object and must be written.
pub const MUST_FLUSH: u8 = 1 << 1;
/// The object changed since the document was loaded (incremental updates).
pub const MODIFIED: u8 = 1 << 2;

/// One entry of the cross-reference table.
#[derive(Debug)]
pub struct XrefSlot {
    /// Generation number, written in the object framing.
    pub gen: u16,
    /// Target node, if the slot is populated.
    pub node: Option<NodeId>,
    /// Byte offset in the output body. Valid only once FLUSHED is set and
    /// only for inline writes; packed objects live inside a container.
    pub offset: Option<u64>,
    flags: u8,
}

impl XrefSlot {
    fn new() -> Self {
        Self {
            gen: 0,
            node: None,
            offset: None,
            flags: 0,
        }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn clear(&mut self, flag: u8) {
        self.flags &= !flag;
    }
}

/// Object-number-indexed table of indirect slots. Slot 0 is reserved.
#[derive(Debug)]
pub struct XrefTable {
    slots: Vec<XrefSlot>,
}

impl XrefTable {
    fn new() -> Self {
        Self {
            slots: vec![XrefSlot::new()],
        }
    }

    /// Table size including the reserved slot 0; valid object numbers are
    /// `1..len()`.
    pub fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    /// True when no object number has been allocated yet.
    pub fn is_empty(&self) -> bool {
        self.slots.len() <= 1
    }

    pub fn get(&self, num: u32) -> Option<&XrefSlot> {
        if num == 0 {
            return None;
        }
        self.slots.get(num as usize)
    }

    pub fn get_mut(&mut self, num: u32) -> Option<&mut XrefSlot> {
        if num == 0 {
            return None;
        }
        self.slots.get_mut(num as usize)
    }

    fn push(&mut self) -> u32 {
        self.slots.push(XrefSlot::new());
        (self.slots.len() - 1) as u32
    }
}

struct Node {
    value: Value,
    obj_num: Option<u32>,
}

/// Arena of nodes plus the cross-reference table.
pub struct Document {
    id: DocId,
    nodes: Vec<Node>,
    pub xref: XrefTable,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            id: DocId(NEXT_DOC_ID.fetch_add(1, Ordering::Relaxed)),
            nodes: Vec::new(),
            xref: XrefTable::new(),
        }
    }

    pub fn id(&self) -> DocId {
        self.id
    }

    /// Number of nodes in the arena (indirect and direct alike).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Insert a node and return its arena index.
    pub fn insert(&mut self, value: Value) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            value,
            obj_num: None,
        });
        id
    }

    // ------------------------------------------------------------------
    // Builder helpers
    // ------------------------------------------------------------------

    pub fn boolean(&mut self, v: bool) -> NodeId {
        self.insert(Value::Bool(v))
    }

    pub fn null(&mut self) -> NodeId {
        self.insert(Value::Null)
    }

    pub fn number(&mut self, v: f64) -> NodeId {
        self.insert(Value::Number(v))
    }

    pub fn name(&mut self, v: impl Into<String>) -> NodeId {
        self.insert(Value::Name(v.into()))
    }

    pub fn string(&mut self, v: impl Into<String>) -> NodeId {
        self.insert(Value::Str(v.into()))
    }

    pub fn array(&mut self, items: impl IntoIterator<Item = NodeId>) -> NodeId {
        let items = items.into_iter().collect();
        self.insert(Value::Array(items))
    }

    pub fn dict<K: Into<String>>(
        &mut self,
        entries: impl IntoIterator<Item = (K, NodeId)>,
    ) -> NodeId {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<BTreeMap<_, _>>();
        self.insert(Value::Dict(map))
    }

    pub fn stream<K: Into<String>>(
        &mut self,
        entries: impl IntoIterator<Item = (K, NodeId)>,
        data: impl Into<Vec<u8>>,
    ) -> NodeId {
        let dict = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<BTreeMap<_, _>>();
        self.insert(Value::Stream {
            dict,
            data: data.into(),
        })
    }

    pub fn reference(&mut self, num: u32) -> NodeId {
        self.insert(Value::Ref(num))
    }

    /// Insert or replace one entry of a dictionary or stream node.
    ///
    /// Returns false (and does nothing) when the target is not a
    /// dictionary or stream. Useful for wiring up cyclic graphs after the
    /// participating nodes have been allocated.
    pub fn dict_set(&mut self, id: NodeId, key: impl Into<String>, value: NodeId) -> bool {
        match &mut self.nodes[id.0 as usize].value {
            Value::Dict(map) | Value::Stream { dict: map, .. } => {
                map.insert(key.into(), value);
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Node and handle accessors
    // ------------------------------------------------------------------

    /// Borrow a node's value.
    ///
    /// Panics when `id` did not come from this document's arena.
    pub fn node(&self, id: NodeId) -> &Value {
        &self.nodes[id.0 as usize].value
    }

    /// The object number of an indirect node, if it has one.
    pub fn obj_num(&self, id: NodeId) -> Option<u32> {
        self.nodes[id.0 as usize].obj_num
    }

    /// Register a node as an indirect object, allocating the next object
    /// number. Returns the existing number when already registered.
    pub fn make_indirect(&mut self, id: NodeId) -> u32 {
        if let Some(num) = self.nodes[id.0 as usize].obj_num {
            return num;
        }
        let num = self.xref.push();
        self.nodes[id.0 as usize].obj_num = Some(num);
        if let Some(slot) = self.xref.get_mut(num) {
            slot.node = Some(id);
        }
        tracing::trace!(num, "indirect object allocated");
        num
    }

    /// Allocate an object number with no arena node behind it. Used for
    /// object containers, which are emitted directly by the writer.
    pub fn reserve_number(&mut self) -> u32 {
        self.xref.push()
    }

    /// Resolve an object number to its arena node.
    pub fn resolve(&self, num: u32) -> Option<NodeId> {
        self.xref.get(num).and_then(|slot| slot.node)
    }

    /// True when the slot has a target whose content is still in memory.
    pub fn is_resident(&self, num: u32) -> bool {
        match self.resolve(num) {
            Some(id) => !self.node(id).is_released(),
            None => false,
        }
    }

    /// Flag an object as changed for the incremental-update path.
    pub fn mark_modified(&mut self, num: u32) {
        if let Some(slot) = self.xref.get_mut(num) {
            slot.set(MODIFIED);
        }
    }

    /// Take a node's value out of the arena, leaving the `Released`
    /// sentinel. The arena entry keeps its shape and object number.
    pub(crate) fn take_value(&mut self, id: NodeId) -> Value {
        std::mem::replace(&mut self.nodes[id.0 as usize].value, Value::Released)
    }

    pub(crate) fn set_value(&mut self, id: NodeId, value: Value) {
        self.nodes[id.0 as usize].value = value;
    }
}
