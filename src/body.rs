//! Output body: byte-position-counting sink and node encoding.
//!
//! ## Framing
//!
//! ```text
//! %VLM-1.0\n
//! %<E2 E3 CF D3>\n            high-bit marker, binary-transport canary
//! <num> <gen> obj\n<body>\nendobj\n     per inline indirect object
//! ```
//!
//! ## Body syntax
//!
//! | Variant | Encoding                                             |
//! |---------|------------------------------------------------------|
//! | Bool    | `true` / `false`                                     |
//! | Null    | `null`                                               |
//! | Number  | shortest decimal form, no fraction for integral      |
//! | Name    | `/Name`, irregular bytes escaped as `#XX`            |
//! | Str     | `(text)`, backslash escapes                          |
//! | Array   | `[a b c]`                                            |
//! | Dict    | `<</K v /K2 v2 >>`                                   |
//! | Stream  | dict + `\nstream\n<data>\nendstream`, `/Length`      |
//! |         | injected, `/Filter /Zstd` when compressed            |
//! | Ref     | `<num> <gen> R`                                      |
//!
//! Children that carry their own object number are emitted as `N G R`
//! references; their content is written separately by the flush engine.

use crate::document::Document;
use crate::error::{Error, Result};
use crate::object::{NodeId, Value};
use std::collections::BTreeMap;
use std::io::Write;

/// Format version written in the file marker line.
pub const FORMAT_VERSION: &str = "VLM-1.0";

/// Four high-bit bytes after the marker line, so transports that mangle
/// binary data are detected by readers.
pub const BINARY_MARKER: [u8; 4] = [0xE2, 0xE3, 0xCF, 0xD3];

/// Byte sink with a running position counter.
pub struct BodyWriter<W: Write> {
    sink: W,
    pos: u64,
}

impl<W: Write> BodyWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink, pos: 0 }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.sink.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    /// Write the file marker: `%` + version + newline, then a `%`-prefixed
    /// high-bit marker line. Written once per output.
    pub fn write_header(&mut self) -> Result<()> {
        self.write_all(b"%")?;
        self.write_all(FORMAT_VERSION.as_bytes())?;
        self.write_all(b"\n%")?;
        self.write_all(&BINARY_MARKER)?;
        self.write_all(b"\n")
    }

    /// Write one inline indirect object and return its byte offset.
    pub fn write_indirect(&mut self, num: u32, gen: u16, body: &[u8]) -> Result<u64> {
        let offset = self.pos;
        let mut framing = Vec::with_capacity(16);
        writeln!(framing, "{} {} obj", num, gen)?;
        self.write_all(&framing)?;
        self.write_all(body)?;
        self.write_all(b"\nendobj\n")?;
        Ok(offset)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

// ============================================================================
// Node encoding
// ============================================================================

/// Encode a node's own body (never as a reference, even when indirect).
///
/// `compression_level` applies to stream payloads; 0 stores them raw.
pub(crate) fn encode_value(
    doc: &Document,
    id: NodeId,
    compression_level: i32,
    out: &mut Vec<u8>,
) -> Result<()> {
    match doc.node(id) {
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Null => out.extend_from_slice(b"null"),
        Value::Number(v) => push_number(out, *v)?,
        Value::Name(n) => push_name(out, n),
        Value::Str(s) => push_string(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b' ');
                }
                encode_child(doc, *item, compression_level, out)?;
            }
            out.push(b']');
        }
        Value::Dict(map) => encode_dict(doc, map, &[], compression_level, out)?,
        Value::Stream { dict, data } => {
            let compressed: Option<Vec<u8>> = if compression_level > 0 && !data.is_empty() {
                let c = zstd::encode_all(data.as_slice(), compression_level)
                    .map_err(Error::Compression)?;
                // Only keep the compressed form when it is actually smaller.
                if c.len() < data.len() {
                    Some(c)
                } else {
                    None
                }
            } else {
                None
            };
            let payload: &[u8] = compressed.as_deref().unwrap_or(data);
            let mut extra: Vec<(&str, String)> = Vec::new();
            if compressed.is_some() {
                extra.push(("Filter", "/Zstd".to_string()));
            }
            extra.push(("Length", payload.len().to_string()));
            encode_dict(doc, dict, &extra, compression_level, out)?;
            out.extend_from_slice(b"\nstream\n");
            out.extend_from_slice(payload);
            out.extend_from_slice(b"\nendstream");
        }
        Value::Ref(num) => push_reference(doc, *num, out)?,
        Value::Released => return Err(Error::ContentReleased),
    }
    Ok(())
}

/// Encode a child position: indirect children become `N G R` references,
/// direct children are encoded inline.
fn encode_child(doc: &Document, id: NodeId, compression_level: i32, out: &mut Vec<u8>) -> Result<()> {
    if let Some(num) = doc.obj_num(id) {
        return push_reference(doc, num, out);
    }
    encode_value(doc, id, compression_level, out)
}

fn push_reference(doc: &Document, num: u32, out: &mut Vec<u8>) -> Result<()> {
    let gen = doc.xref.get(num).map(|slot| slot.gen).unwrap_or(0);
    write!(out, "{} {} R", num, gen)?;
    Ok(())
}

fn encode_dict(
    doc: &Document,
    entries: &BTreeMap<String, NodeId>,
    extra: &[(&str, String)],
    compression_level: i32,
    out: &mut Vec<u8>,
) -> Result<()> {
    out.extend_from_slice(b"<<");
    for (key, value) in entries {
        push_name(out, key);
        out.push(b' ');
        encode_child(doc, *value, compression_level, out)?;
        out.push(b' ');
    }
    for (key, token) in extra {
        push_name(out, key);
        out.push(b' ');
        out.extend_from_slice(token.as_bytes());
        out.push(b' ');
    }
    out.extend_from_slice(b">>");
    Ok(())
}

fn push_number(out: &mut Vec<u8>, v: f64) -> Result<()> {
    if !v.is_finite() {
        // Non-finite numbers have no wire form.
        out.push(b'0');
        return Ok(());
    }
    write!(out, "{}", v)?;
    Ok(())
}

/// Bytes allowed unescaped inside a name token.
fn regular_name_byte(b: u8) -> bool {
    b.is_ascii_graphic()
        && !matches!(
            b,
            b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%' | b'#'
        )
}

pub(crate) fn push_name(out: &mut Vec<u8>, name: &str) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    out.push(b'/');
    for &b in name.as_bytes() {
        if regular_name_byte(b) {
            out.push(b);
        } else {
            out.push(b'#');
            out.push(HEX[(b >> 4) as usize]);
            out.push(HEX[(b & 0x0F) as usize]);
        }
    }
}

fn push_string(out: &mut Vec<u8>, s: &str) {
    out.push(b'(');
    for &b in s.as_bytes() {
        match b {
            b'\\' | b'(' | b')' => {
                out.push(b'\\');
                out.push(b);
            }
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            _ => out.push(b),
        }
    }
    out.push(b')');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;

    fn encode(doc: &Document, id: NodeId) -> Vec<u8> {
        let mut out = Vec::new();
        encode_value(doc, id, 0, &mut out).unwrap();
        out
    }

    #[test]
    fn test_header_bytes_exact() {
        let mut w = BodyWriter::new(Vec::new());
        w.write_header().unwrap();
        assert_eq!(w.into_inner(), b"%VLM-1.0\n%\xE2\xE3\xCF\xD3\n");
    }

    #[test]
    fn test_indirect_framing() {
        let mut w = BodyWriter::new(Vec::new());
        let offset = w.write_indirect(4, 0, b"null").unwrap();
        assert_eq!(offset, 0);
        assert_eq!(w.position(), 20);
        assert_eq!(w.into_inner(), b"4 0 obj\nnull\nendobj\n");
    }

    #[test]
    fn test_primitive_tokens() {
        let mut doc = Document::new();
        let t = doc.boolean(true);
        let f = doc.boolean(false);
        let n = doc.null();
        assert_eq!(encode(&doc, t), b"true");
        assert_eq!(encode(&doc, f), b"false");
        assert_eq!(encode(&doc, n), b"null");
    }

    #[test]
    fn test_number_formats() {
        let mut doc = Document::new();
        let integral = doc.number(5.0);
        let negative = doc.number(-12.0);
        let fractional = doc.number(0.5);
        let nan = doc.number(f64::NAN);
        assert_eq!(encode(&doc, integral), b"5");
        assert_eq!(encode(&doc, negative), b"-12");
        assert_eq!(encode(&doc, fractional), b"0.5");
        assert_eq!(encode(&doc, nan), b"0");
    }

    #[test]
    fn test_name_escaping() {
        let mut doc = Document::new();
        let plain = doc.name("Type");
        let spaced = doc.name("has space");
        let hash = doc.name("a#b");
        assert_eq!(encode(&doc, plain), b"/Type");
        assert_eq!(encode(&doc, spaced), b"/has#20space");
        assert_eq!(encode(&doc, hash), b"/a#23b");
    }

    #[test]
    fn test_string_escaping() {
        let mut doc = Document::new();
        let s = doc.string("a(b)\\c\nd");
        assert_eq!(encode(&doc, s), b"(a\\(b\\)\\\\c\\nd)");
    }

    #[test]
    fn test_array_and_dict_with_indirect_child() {
        let mut doc = Document::new();
        let five = doc.number(5.0);
        let num = doc.make_indirect(five);
        assert_eq!(num, 1);
        let inline = doc.string("x");
        let arr = doc.array([five, inline]);
        assert_eq!(encode(&doc, arr), b"[1 0 R (x)]");

        let d = doc.dict([("A", five), ("B", inline)]);
        assert_eq!(encode(&doc, d), b"<</A 1 0 R /B (x) >>");
    }

    #[test]
    fn test_dict_keys_sorted() {
        let mut doc = Document::new();
        let one = doc.number(1.0);
        let two = doc.number(2.0);
        let d = doc.dict([("Zebra", two), ("Alpha", one)]);
        assert_eq!(encode(&doc, d), b"<</Alpha 1 /Zebra 2 >>");
    }

    #[test]
    fn test_ref_node_token() {
        let mut doc = Document::new();
        let r = doc.reference(9);
        assert_eq!(encode(&doc, r), b"9 0 R");
    }

    #[test]
    fn test_stream_raw_when_uncompressed() {
        let mut doc = Document::new();
        let s = doc.stream(std::iter::empty::<(&str, NodeId)>(), b"hello".to_vec());
        let out = encode(&doc, s);
        assert_eq!(out, b"<</Length 5 >>\nstream\nhello\nendstream");
    }

    #[test]
    fn test_stream_compressed_payload_round_trips() {
        let mut doc = Document::new();
        let data = vec![b'a'; 4096];
        let s = doc.stream(std::iter::empty::<(&str, NodeId)>(), data.clone());
        let mut out = Vec::new();
        encode_value(&doc, s, 3, &mut out).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("<</Filter /Zstd /Length "));

        let start = out.windows(8).position(|w| w == b"\nstream\n").unwrap() + 8;
        let end = out.len() - b"\nendstream".len();
        let decoded = zstd::decode_all(&out[start..end]).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_released_content_is_an_error() {
        let mut doc = Document::new();
        let s = doc.string("gone");
        doc.take_value(s);
        let mut out = Vec::new();
        let err = encode_value(&doc, s, 0, &mut out).unwrap_err();
        assert!(matches!(err, Error::ContentReleased));
    }
}
