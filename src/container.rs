//! Object containers: zstd-compressed bundles of small indirect objects.
//!
//! When full compression is on, non-stream generation-0 objects are packed
//! into the open container instead of being written inline. A container
//! holds at most [`MAX_CONTAINER_ENTRIES`] objects; a full one is flushed
//! and a fresh one opened with a `/Prev` link back to it, so readers can
//! walk the chain at decode time.
//!
//! ## Payload layout (before compression)
//!
//! ```text
//! [num offset ]*            pair header, ASCII decimal, space separated
//! [body\n]*                 packed object bodies, offsets relative here
//! ```
//!
//! The whole payload is compressed as one zstd unit. The container object
//! itself is always written inline:
//!
//! ```text
//! <</Type /Container /N <count> /First <pair-header len>
//!   /Filter /Zstd /Length <compressed len> [/Prev <num> 0 R]>>
//! stream
//! <compressed payload>
//! endstream
//! ```

use crate::body::push_name;
use crate::error::{Error, Result};
use std::io::Write;

/// Maximum number of objects packed into one container.
pub const MAX_CONTAINER_ENTRIES: usize = 200;

/// An open container accumulating packed objects.
pub struct ObjectContainer {
    obj_num: u32,
    prev: Option<u32>,
    entries: Vec<(u32, usize)>,
    bodies: Vec<u8>,
}

impl ObjectContainer {
    /// Open a container under `obj_num`, chained to the previously retired
    /// container when there is one.
    pub fn new(obj_num: u32, prev: Option<u32>) -> Self {
        tracing::trace!(container = obj_num, prev, "container opened");
        Self {
            obj_num,
            prev,
            entries: Vec::new(),
            bodies: Vec::new(),
        }
    }

    pub fn obj_num(&self) -> u32 {
        self.obj_num
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_CONTAINER_ENTRIES
    }

    /// Pack one object body. The caller checks `is_full` first.
    pub fn push(&mut self, num: u32, body: Vec<u8>) {
        self.entries.push((num, self.bodies.len()));
        self.bodies.extend_from_slice(&body);
        self.bodies.push(b'\n');
    }

    /// Encode the finished container as an inline object body.
    pub fn encode(&self, compression_level: i32) -> Result<Vec<u8>> {
        let mut pairs = Vec::new();
        for (num, offset) in &self.entries {
            write!(pairs, "{} {} ", num, offset)?;
        }
        let first = pairs.len();

        let mut payload = pairs;
        payload.extend_from_slice(&self.bodies);
        let compressed =
            zstd::encode_all(payload.as_slice(), compression_level).map_err(Error::Compression)?;

        let mut out = Vec::with_capacity(compressed.len() + 96);
        out.extend_from_slice(b"<<");
        push_name(&mut out, "Type");
        out.push(b' ');
        push_name(&mut out, "Container");
        write!(out, " /N {} /First {} /Filter /Zstd /Length {}", self.entries.len(), first, compressed.len())?;
        if let Some(prev) = self.prev {
            write!(out, " /Prev {} 0 R", prev)?;
        }
        out.extend_from_slice(b">>\nstream\n");
        out.extend_from_slice(&compressed);
        out.extend_from_slice(b"\nendstream");
        Ok(out)
    }
}
