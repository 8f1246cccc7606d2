//! The document writer: flush engine and cross-document copy engine.
//!
//! One `DocWriter` is bound to one output sink and one write/copy session.
//! Its copy map, content-hash index, serializer memo, and open container
//! are private state; the engine assumes exclusive ownership of the
//! destination document for the duration of the session.
//!
//! ## Flushing
//!
//! Flushing an object writes its final bytes (inline, or into the open
//! container when packing applies), marks its slot FLUSHED, cascades
//! MUST_FLUSH to everything it references, and releases its in-memory
//! content. [`DocWriter::flush_all`] drives the sweep to a fixed point:
//! because flushing one object can mark objects earlier in the table, the
//! scan repeats until a full pass flushes nothing. The sweep terminates
//! since every flush moves one slot from pending to FLUSHED and flushed
//! slots are never re-marked.
//!
//! ## Copying
//!
//! [`DocWriter::copy_object`] copies a node between documents while
//! preserving sharing: the copy map guarantees at most one destination copy
//! per distinct source node, and pre-registration before recursing is what
//! makes cycles terminate. In smart-copy mode, structurally identical
//! subgraphs additionally collapse through the content-hash index.

use crate::body::{encode_value, BodyWriter};
use crate::canonical::{canonical_form, BackLinkKeys, ContentIndex, SerializerMemo};
use crate::container::ObjectContainer;
use crate::document::{DocId, Document, FLUSHED, MODIFIED, MUST_FLUSH};
use crate::error::{Error, Result};
use crate::object::{NodeId, Value};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Default zstd level for stream payloads and containers.
pub const DEFAULT_COMPRESSION: i32 = 3;

/// Longest chain of reference nodes followed before degrading to null.
const MAX_REF_HOPS: u32 = 64;

/// Writer for one output body and one copy session.
pub struct DocWriter<W: Write> {
    body: BodyWriter<W>,
    full_compression: bool,
    compression_level: i32,
    smart_copy: bool,
    back_links: BackLinkKeys,
    container: Option<ObjectContainer>,
    copied: FxHashMap<(DocId, u32), NodeId>,
    content_index: ContentIndex,
    memo: SerializerMemo,
}

impl DocWriter<BufWriter<File>> {
    /// Open a buffered file sink at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> DocWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            body: BodyWriter::new(sink),
            full_compression: false,
            compression_level: DEFAULT_COMPRESSION,
            smart_copy: false,
            back_links: BackLinkKeys::default(),
            container: None,
            copied: FxHashMap::default(),
            content_index: ContentIndex::new(),
            memo: SerializerMemo::default(),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Enable packing of small objects into compressed containers.
    pub fn with_full_compression(mut self, on: bool) -> Self {
        self.full_compression = on;
        self
    }

    /// Zstd level for stream payloads and containers; 0 stores raw.
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Enable content-based deduplication during copying.
    pub fn with_smart_copy(mut self, on: bool) -> Self {
        self.smart_copy = on;
        self
    }

    /// Override the dictionary keys excluded as ancestor back-links.
    pub fn with_back_link_keys(mut self, keys: BackLinkKeys) -> Self {
        self.back_links = keys;
        self
    }

    pub fn full_compression(&self) -> bool {
        self.full_compression
    }

    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }

    pub fn smart_copy(&self) -> bool {
        self.smart_copy
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Write the file marker line. Once per output, before any object.
    pub fn write_header(&mut self) -> Result<()> {
        self.body.write_header()
    }

    /// Bytes written to the sink so far.
    pub fn position(&self) -> u64 {
        self.body.position()
    }

    /// Flush the sink and return it.
    pub fn finish(mut self) -> Result<W> {
        self.body.flush()?;
        Ok(self.body.into_inner())
    }

    // ------------------------------------------------------------------
    // Flush engine
    // ------------------------------------------------------------------

    /// Write one indirect object.
    ///
    /// With `may_pack`, full compression on, and the object eligible
    /// (generation 0, not a stream), the body goes into the open container;
    /// otherwise it is written inline and the slot offset recorded. Either
    /// way the slot becomes FLUSHED, every node the object references is
    /// marked MUST_FLUSH unless already flushed, and the object's content
    /// is released. Flushing an already-flushed object is a no-op.
    pub fn flush_object(&mut self, doc: &mut Document, num: u32, may_pack: bool) -> Result<()> {
        let slot = doc.xref.get(num).ok_or(Error::EmptySlot(num))?;
        if slot.has(FLUSHED) {
            return Ok(());
        }
        let node_id = slot.node.ok_or(Error::EmptySlot(num))?;
        let gen = slot.gen;

        let mut encoded = Vec::new();
        encode_value(doc, node_id, self.compression_level, &mut encoded)?;

        let eligible = may_pack && gen == 0 && !doc.node(node_id).is_stream();
        let mut inline_body = Some(encoded);
        if eligible {
            if let Some(container) = self.current_container(doc)? {
                container.push(num, inline_body.take().unwrap_or_default());
            }
        }
        if let Some(body) = inline_body {
            let offset = self.body.write_indirect(num, gen, &body)?;
            if let Some(slot) = doc.xref.get_mut(num) {
                slot.offset = Some(offset);
            }
        }

        if let Some(slot) = doc.xref.get_mut(num) {
            slot.set(FLUSHED);
            slot.clear(MUST_FLUSH | MODIFIED);
        }

        // Cascade before the content is gone: a referenced object may not
        // look reachable from the table scan alone.
        let value = doc.take_value(node_id);
        mark_children(doc, &value);
        tracing::trace!(num, kind = value.type_name(), "object flushed");
        Ok(())
    }

    /// Flush everything still resident, sweeping to a fixed point, then
    /// retire the open container.
    pub fn flush_all(&mut self, doc: &mut Document) -> Result<()> {
        for num in 1..doc.xref.len() {
            if doc.is_resident(num) {
                if let Some(slot) = doc.xref.get_mut(num) {
                    if !slot.has(FLUSHED) {
                        slot.set(MUST_FLUSH);
                    }
                }
            }
        }

        let mut passes = 0u32;
        let mut total = 0u64;
        loop {
            let mut flushed_this_pass = 0u64;
            let mut num = 1;
            while num < doc.xref.len() {
                let pending = doc
                    .xref
                    .get(num)
                    .is_some_and(|slot| slot.has(MUST_FLUSH) && !slot.has(FLUSHED));
                if pending && doc.is_resident(num) {
                    self.flush_object(doc, num, true)?;
                    flushed_this_pass += 1;
                }
                num += 1;
            }
            passes += 1;
            total += flushed_this_pass;
            if flushed_this_pass == 0 {
                break;
            }
        }
        self.retire_container(doc)?;
        tracing::debug!(objects = total, passes, "flush sweep complete");
        Ok(())
    }

    /// Incremental-update variant: flush every resident object flagged
    /// MODIFIED in a single pass, ignoring the MUST_FLUSH cascade, then
    /// retire the open container.
    pub fn flush_modified(&mut self, doc: &mut Document) -> Result<()> {
        let mut total = 0u64;
        let mut num = 1;
        while num < doc.xref.len() {
            let modified = doc
                .xref
                .get(num)
                .is_some_and(|slot| slot.has(MODIFIED) && !slot.has(FLUSHED));
            if modified && doc.is_resident(num) {
                self.flush_object(doc, num, true)?;
                total += 1;
            }
            num += 1;
        }
        self.retire_container(doc)?;
        tracing::debug!(objects = total, "modified flush complete");
        Ok(())
    }

    /// The open container, if packing applies: opens one on demand and
    /// rotates a full one (flushing it and chaining the replacement).
    fn current_container(&mut self, doc: &mut Document) -> Result<Option<&mut ObjectContainer>> {
        if !self.full_compression {
            return Ok(None);
        }
        if self.container.as_ref().is_some_and(|c| c.is_full()) {
            if let Some(full) = self.container.take() {
                let prev = full.obj_num();
                self.write_container(doc, full)?;
                self.container = Some(ObjectContainer::new(doc.reserve_number(), Some(prev)));
            }
        }
        if self.container.is_none() {
            self.container = Some(ObjectContainer::new(doc.reserve_number(), None));
        }
        Ok(self.container.as_mut())
    }

    /// Flush the open container if it holds anything.
    fn retire_container(&mut self, doc: &mut Document) -> Result<()> {
        if let Some(container) = self.container.take() {
            if !container.is_empty() {
                self.write_container(doc, container)?;
            }
        }
        Ok(())
    }

    fn write_container(&mut self, doc: &mut Document, container: ObjectContainer) -> Result<()> {
        let num = container.obj_num();
        let entries = container.len();
        let body = container.encode(self.compression_level)?;
        let offset = self.body.write_indirect(num, 0, &body)?;
        if let Some(slot) = doc.xref.get_mut(num) {
            slot.offset = Some(offset);
            slot.set(FLUSHED);
            slot.clear(MUST_FLUSH);
        }
        tracing::debug!(container = num, entries, bytes = body.len(), "container retired");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Copy engine
    // ------------------------------------------------------------------

    /// Copy a node from `src` into `dest`, returning the destination node.
    ///
    /// Unless `allow_duplicates` is set, a source node with an object
    /// number is copied at most once per session; later calls return the
    /// same destination node, which is what maps shared and cyclic source
    /// subgraphs onto shared and cyclic destination subgraphs. In
    /// smart-copy mode, dictionaries and streams whose canonical forms are
    /// equal collapse to one destination node even when their identities
    /// differ. A reference whose target is absent copies as null.
    pub fn copy_object(
        &mut self,
        dest: &mut Document,
        src: &Document,
        node: NodeId,
        allow_duplicates: bool,
    ) -> Result<NodeId> {
        // Dereference through the xref table.
        let mut node = node;
        let mut hops = 0;
        while let Value::Ref(num) = src.node(node) {
            hops += 1;
            if hops > MAX_REF_HOPS {
                return Ok(dest.null());
            }
            match src.resolve(*num) {
                Some(target) => node = target,
                None => return Ok(dest.null()),
            }
        }
        if src.node(node).is_released() {
            tracing::trace!("copy source already released, substituting null");
            return Ok(dest.null());
        }

        // Deduplication by identity.
        let src_num = src.obj_num(node);
        if !allow_duplicates {
            if let Some(num) = src_num {
                if let Some(&existing) = self.copied.get(&(src.id(), num)) {
                    return Ok(existing);
                }
            }
        }

        // Deduplication by content.
        let canonical = if self.smart_copy
            && matches!(src.node(node), Value::Dict(_) | Value::Stream { .. })
        {
            let key = canonical_form(src, node, &mut self.memo, &self.back_links);
            if let Some(existing) = self.content_index.hit(&key) {
                tracing::trace!(hash = key.hash_value(), "smart copy content match");
                if let Some(num) = src_num {
                    self.copied.insert((src.id(), num), existing);
                }
                return Ok(existing);
            }
            Some(key)
        } else {
            None
        };

        // Allocate the destination node and pre-register it, so a recursive
        // visit through a cycle finds the map entry instead of recursing.
        let dest_id = dest.insert(Value::Null);
        if let Some(num) = src_num {
            dest.make_indirect(dest_id);
            self.copied.insert((src.id(), num), dest_id);
        }
        if let Some(key) = canonical {
            self.content_index.register(key, dest_id);
        }

        let value = match src.node(node) {
            Value::Bool(b) => Value::Bool(*b),
            Value::Number(v) => Value::Number(*v),
            Value::Name(n) => Value::Name(n.clone()),
            Value::Str(s) => Value::Str(s.clone()),
            Value::Null | Value::Released | Value::Ref(_) => Value::Null,
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items.clone() {
                    out.push(self.copy_object(dest, src, item, allow_duplicates)?);
                }
                Value::Array(out)
            }
            Value::Dict(map) => {
                let mut out = BTreeMap::new();
                for (key, child) in map.clone() {
                    out.insert(key, self.copy_object(dest, src, child, allow_duplicates)?);
                }
                Value::Dict(out)
            }
            Value::Stream { dict, data } => {
                let data = data.clone();
                let mut out = BTreeMap::new();
                for (key, child) in dict.clone() {
                    out.insert(key, self.copy_object(dest, src, child, allow_duplicates)?);
                }
                Value::Stream { dict: out, data }
            }
        };
        dest.set_value(dest_id, value);
        Ok(dest_id)
    }
}

// ----------------------------------------------------------------------
// MUST_FLUSH cascade
// ----------------------------------------------------------------------

fn mark_children(doc: &mut Document, value: &Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                mark_node(doc, *item);
            }
        }
        Value::Dict(map) | Value::Stream { dict: map, .. } => {
            let children: Vec<NodeId> = map.values().copied().collect();
            for child in children {
                mark_node(doc, child);
            }
        }
        Value::Ref(num) => mark_slot(doc, *num),
        _ => {}
    }
}

fn mark_node(doc: &mut Document, id: NodeId) {
    if let Some(num) = doc.obj_num(id) {
        mark_slot(doc, num);
        return;
    }
    let referenced = if let Value::Ref(num) = doc.node(id) {
        Some(*num)
    } else {
        None
    };
    if let Some(num) = referenced {
        mark_slot(doc, num);
        return;
    }
    // Direct composites are written inline with their parent, but may hold
    // indirect descendants that still need their own flush.
    let children: Vec<NodeId> = match doc.node(id) {
        Value::Array(items) => items.clone(),
        Value::Dict(map) | Value::Stream { dict: map, .. } => map.values().copied().collect(),
        _ => return,
    };
    for child in children {
        mark_node(doc, child);
    }
}

fn mark_slot(doc: &mut Document, num: u32) {
    if let Some(slot) = doc.xref.get_mut(num) {
        if !slot.has(FLUSHED) {
            slot.set(MUST_FLUSH);
        }
    }
}
