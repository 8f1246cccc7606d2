//! Node variants for the Vellum object graph.
//!
//! Every node in a document is one `Value`. Composite variants (`Array`,
//! `Dict`, `Stream`) hold [`NodeId`] indices into the owning document's
//! arena rather than owned children, so shared and cyclic subgraphs are
//! plain index relationships. `Ref` points at another node through the
//! xref table by object number.

use std::collections::BTreeMap;

/// Index of a node in its owning [`Document`](crate::Document)'s arena.
///
/// Only meaningful for the document that produced it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub(crate) u32);

/// A typed document node.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Null,
    Number(f64),
    /// A name token (`/Name` on the wire).
    Name(String),
    /// A literal string (`(text)` on the wire).
    Str(String),
    /// Ordered sequence of child nodes.
    Array(Vec<NodeId>),
    /// Name-keyed mapping; insertion order is irrelevant, keys sort.
    Dict(BTreeMap<String, NodeId>),
    /// Dictionary plus a raw byte payload.
    Stream {
        dict: BTreeMap<String, NodeId>,
        data: Vec<u8>,
    },
    /// Indirect reference to the object registered under this number.
    Ref(u32),
    /// Post-flush sentinel: the content has been written and dropped.
    Released,
}

impl Value {
    pub fn is_dict(&self) -> bool {
        matches!(self, Value::Dict(_))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Value::Stream { .. })
    }

    pub fn is_released(&self) -> bool {
        matches!(self, Value::Released)
    }

    /// Variant name for trace output.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::Number(_) => "number",
            Value::Name(_) => "name",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
            Value::Stream { .. } => "stream",
            Value::Ref(_) => "ref",
            Value::Released => "released",
        }
    }
}
