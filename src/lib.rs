//! # Vellum body writer
//!
//! Object-graph writer and deduplicator for the Vellum structured-document
//! format. Serializes a graph of typed nodes (dictionaries, arrays,
//! streams, primitives, references) into a binary body, packs small
//! objects into zstd-compressed containers, and — when copying nodes
//! across documents — recognizes structurally identical subgraphs so only
//! one physical copy is ever written.
//!
//! The graph may be arbitrarily shared and cyclic. Three mechanisms keep
//! that correct:
//!
//! 1. The flush sweep ([`DocWriter::flush_all`]) repeats until a full pass
//!    over the xref table flushes nothing, so objects discovered through
//!    back-edges are still emitted exactly once.
//! 2. The copy map pre-registers a destination node *before* copying its
//!    content, so cyclic source graphs map onto cyclic destination graphs
//!    instead of recursing forever.
//! 3. Canonical serialization ([`canonical`]) skips configured ancestor
//!    back-links and carries a depth budget, so content hashing terminates
//!    on any graph.
//!
//! ## Example
//!
//! ```
//! use vellum_writer::{DocWriter, Document};
//!
//! let mut doc = Document::new();
//! let five = doc.number(5.0);
//! doc.make_indirect(five);
//! let arr = doc.array([five]);
//! doc.make_indirect(arr);
//!
//! let mut writer = DocWriter::new(Vec::new());
//! writer.write_header()?;
//! writer.flush_all(&mut doc)?;
//! let bytes = writer.finish()?;
//! assert!(bytes.starts_with(b"%VLM-1.0\n"));
//! # Ok::<(), vellum_writer::Error>(())
//! ```

pub mod body;
pub mod canonical;
pub mod container;
pub mod document;
pub mod error;
pub mod object;
pub mod writer;

pub use body::{BodyWriter, BINARY_MARKER, FORMAT_VERSION};
pub use canonical::{
    canonical_form, poly_hash, BackLinkKeys, CanonicalKey, ContentIndex, SerializerMemo,
    DEPTH_BUDGET,
};
pub use container::{ObjectContainer, MAX_CONTAINER_ENTRIES};
pub use document::{DocId, Document, XrefSlot, XrefTable, FLUSHED, MODIFIED, MUST_FLUSH};
pub use error::{Error, Result};
pub use object::{NodeId, Value};
pub use writer::{DocWriter, DEFAULT_COMPRESSION};
