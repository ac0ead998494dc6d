//! TLV/BER codec over a node arena
//!
//! Parses the ISO 8825 BER subset used by card data objects and CV
//! certificates into a flat arena: nodes are addressed by [`NodeId`] and
//! linked through parent/child/sibling indices, so navigating and
//! re-serializing never copies subtrees.
//!
//! Values are stored as ranges into the parsed input; [`TlvArena::serialize`]
//! therefore reproduces the original bytes exactly (stripped trailing 0x00
//! padding excepted). Indefinite lengths are rejected. A 0x00 tag byte ends a
//! sibling run, matching the padding convention of card files.

use core::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Tag class per X.690
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    /// Universal class (00)
    Universal,
    /// Application class (01)
    Application,
    /// Context-specific class (10)
    Context,
    /// Private class (11)
    Private,
}

/// A BER tag, stored in its encoded form (up to four bytes, e.g. `0x7F21`)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u32);

impl Tag {
    /// Dynamic authentication data template (General Authenticate)
    pub const DYNAMIC_AUTHENTICATION_DATA: Self = Self(0x7C);
    /// CV certificate outer tag
    pub const CV_CERTIFICATE: Self = Self(0x7F21);
    /// CV certificate body
    pub const CERTIFICATE_BODY: Self = Self(0x7F4E);
    /// Public key template
    pub const PUBLIC_KEY: Self = Self(0x7F49);
    /// Certificate holder authorization template
    pub const CHAT: Self = Self(0x7F4C);

    /// Wrap an encoded tag value (e.g. `0x7C`, `0x7F21`)
    pub const fn new(encoded: u32) -> Self {
        Self(encoded)
    }

    /// The encoded tag value
    pub const fn encoded(self) -> u32 {
        self.0
    }

    /// Leading (class/constructed) byte of the encoding
    const fn first_byte(self) -> u8 {
        let bytes = self.0.to_be_bytes();
        let mut i = 0;
        while i < 3 && bytes[i] == 0 {
            i += 1;
        }
        bytes[i]
    }

    /// Tag class from the two top bits
    pub const fn class(self) -> TagClass {
        match self.first_byte() >> 6 {
            0b00 => TagClass::Universal,
            0b01 => TagClass::Application,
            0b10 => TagClass::Context,
            _ => TagClass::Private,
        }
    }

    /// Whether the constructed bit is set
    pub const fn is_constructed(self) -> bool {
        self.first_byte() & 0x20 != 0
    }

    /// Tag number, folding multi-byte encodings
    pub const fn number(self) -> u32 {
        let bytes = self.0.to_be_bytes();
        let mut i = 0;
        while i < 3 && bytes[i] == 0 {
            i += 1;
        }
        let first = bytes[i] & 0x1F;
        if first != 0x1F {
            return first as u32;
        }
        let mut number: u32 = 0;
        let mut j = i + 1;
        while j < 4 {
            number = (number << 7) | (bytes[j] & 0x7F) as u32;
            j += 1;
        }
        number
    }

    /// Append the encoded tag bytes to a buffer
    fn write_to(self, out: &mut BytesMut) {
        let bytes = self.0.to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(3);
        out.put_slice(&bytes[start..]);
    }

    /// Parse a tag starting at `input[0]`, returning the tag and the number
    /// of bytes consumed
    fn parse(input: &[u8]) -> Result<(Self, usize)> {
        let first = *input
            .first()
            .ok_or(Error::MalformedEncoding("tag truncated"))?;
        if first & 0x1F != 0x1F {
            return Ok((Self(first as u32), 1));
        }
        let mut encoded = first as u32;
        let mut consumed = 1;
        loop {
            let byte = *input
                .get(consumed)
                .ok_or(Error::MalformedEncoding("tag number truncated"))?;
            if consumed >= 4 {
                return Err(Error::MalformedEncoding("tag number too large"));
            }
            encoded = (encoded << 8) | byte as u32;
            consumed += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }
        Ok((Self(encoded), consumed))
    }
}

// Debug and Display both render the encoded form, which is how card
// specifications name these tags.
impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

impl From<u32> for Tag {
    fn from(encoded: u32) -> Self {
        Self(encoded)
    }
}

/// Index of a node within a [`TlvArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy)]
struct Node {
    tag: Tag,
    /// Value range into the arena's buffer
    value: (usize, usize),
    parent: Option<NodeId>,
    first_child: Option<NodeId>,
    next_sibling: Option<NodeId>,
}

/// A parsed TLV structure: flat node storage over the original input bytes
#[derive(Debug, Clone)]
pub struct TlvArena {
    buf: Bytes,
    nodes: Vec<Node>,
    first_root: Option<NodeId>,
}

impl TlvArena {
    /// Parse a complete TLV sibling list from `input`
    pub fn parse(input: impl Into<Bytes>) -> Result<Self> {
        let buf = input.into();
        let mut arena = Self {
            buf,
            nodes: Vec::new(),
            first_root: None,
        };
        let (first, _) = {
            let range = (0, arena.buf.len());
            arena.parse_run(range, None)?
        };
        arena.first_root = first;
        Ok(arena)
    }

    /// Parse a sibling run within `range`, linking children to `parent`.
    /// Returns the first node of the run and the number of bytes consumed.
    fn parse_run(
        &mut self,
        range: (usize, usize),
        parent: Option<NodeId>,
    ) -> Result<(Option<NodeId>, usize)> {
        let (start, end) = range;
        let mut cursor = start;
        let mut first: Option<NodeId> = None;
        let mut previous: Option<NodeId> = None;

        while cursor < end {
            // 0x00 terminates the run (padding convention of card files).
            if self.buf[cursor] == 0x00 {
                break;
            }

            let (tag, tag_len) = Tag::parse(&self.buf[cursor..end])?;
            let (value_len, len_len) = parse_length(&self.buf[cursor + tag_len..end])?;
            let value_start = cursor + tag_len + len_len;
            if value_start + value_len > end {
                return Err(Error::MalformedEncoding("length overruns buffer"));
            }

            let id = NodeId(self.nodes.len());
            self.nodes.push(Node {
                tag,
                value: (value_start, value_len),
                parent,
                first_child: None,
                next_sibling: None,
            });

            if tag.is_constructed() && value_len > 0 {
                // Tolerate opaque constructed bodies: keep the node without
                // children when the inner bytes do not parse as TLV.
                let saved = self.nodes.len();
                match self.parse_run((value_start, value_start + value_len), Some(id)) {
                    Ok((child, _)) => self.nodes[id.0].first_child = child,
                    Err(_) => self.nodes.truncate(saved),
                }
            }

            match previous {
                Some(prev) => self.nodes[prev.0].next_sibling = Some(id),
                None => first = Some(id),
            }
            previous = Some(id);
            cursor = value_start + value_len;
        }

        Ok((first, cursor - start))
    }

    /// First top-level node, if the input held any
    pub const fn first_root(&self) -> Option<NodeId> {
        self.first_root
    }

    /// Iterator over the top-level sibling run
    pub fn roots(&self) -> SiblingIter<'_> {
        SiblingIter {
            arena: self,
            current: self.first_root,
        }
    }

    /// Tag of a node
    pub fn tag(&self, id: NodeId) -> Tag {
        self.nodes[id.0].tag
    }

    /// Value bytes of a node
    pub fn value(&self, id: NodeId) -> &[u8] {
        let (start, len) = self.nodes[id.0].value;
        &self.buf[start..start + len]
    }

    /// Parent, if this is not a top-level node
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    /// First child of a constructed node
    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].first_child
    }

    /// Next sibling in the run
    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].next_sibling
    }

    /// Iterator over the children of a node
    pub fn children(&self, id: NodeId) -> SiblingIter<'_> {
        SiblingIter {
            arena: self,
            current: self.first_child(id),
        }
    }

    /// First child with the given tag
    pub fn child_tagged(&self, id: NodeId, tag: impl Into<Tag>) -> Option<NodeId> {
        let tag = tag.into();
        self.children(id).find(|&c| self.tag(c) == tag)
    }

    /// First top-level node with the given tag
    pub fn root_tagged(&self, tag: impl Into<Tag>) -> Option<NodeId> {
        let tag = tag.into();
        self.roots().find(|&c| self.tag(c) == tag)
    }

    /// Serialize one node (tag, length, value)
    pub fn serialize(&self, id: NodeId) -> Bytes {
        let mut out = BytesMut::new();
        self.write_node(id, &mut out);
        out.freeze()
    }

    /// Serialize a node and all its following siblings
    pub fn serialize_with_successors(&self, id: NodeId) -> Bytes {
        let mut out = BytesMut::new();
        let mut current = Some(id);
        while let Some(node) = current {
            self.write_node(node, &mut out);
            current = self.next_sibling(node);
        }
        out.freeze()
    }

    fn write_node(&self, id: NodeId, out: &mut BytesMut) {
        let node = &self.nodes[id.0];
        node.tag.write_to(out);
        write_length(out, node.value.1);
        let (start, len) = node.value;
        out.put_slice(&self.buf[start..start + len]);
    }

    /// Cursor over the children of `id` with non-consuming lookahead
    pub fn reader(&self, id: NodeId) -> TlvReader<'_> {
        TlvReader {
            arena: self,
            current: self.first_child(id),
        }
    }

    /// Cursor over the top-level sibling run
    pub fn root_reader(&self) -> TlvReader<'_> {
        TlvReader {
            arena: self,
            current: self.first_root,
        }
    }
}

/// Iterator over a sibling run
#[derive(Debug)]
pub struct SiblingIter<'a> {
    arena: &'a TlvArena,
    current: Option<NodeId>,
}

impl Iterator for SiblingIter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.current?;
        self.current = self.arena.next_sibling(id);
        Some(id)
    }
}

/// Cursor over a sibling run with non-consuming lookahead
#[derive(Debug)]
pub struct TlvReader<'a> {
    arena: &'a TlvArena,
    current: Option<NodeId>,
}

impl TlvReader<'_> {
    /// Node `offset` positions ahead of the cursor, without advancing
    pub fn peek(&self, offset: usize) -> Option<NodeId> {
        let mut node = self.current;
        for _ in 0..offset {
            node = self.arena.next_sibling(node?);
        }
        node
    }

    /// Whether the node at the cursor has the given tag
    pub fn matches(&self, tag: impl Into<Tag>) -> bool {
        self.matches_ahead(tag, 0)
    }

    /// Whether the node `offset` positions ahead has the given tag
    pub fn matches_ahead(&self, tag: impl Into<Tag>, offset: usize) -> bool {
        let tag = tag.into();
        self.peek(offset)
            .is_some_and(|id| self.arena.tag(id) == tag)
    }

    /// Advance the cursor, returning the node it pointed at
    pub fn advance(&mut self) -> Option<NodeId> {
        let id = self.current?;
        self.current = self.arena.next_sibling(id);
        Some(id)
    }

    /// Advance past a node that must carry `tag`
    pub fn expect(&mut self, tag: impl Into<Tag>, what: &'static str) -> Result<NodeId> {
        let tag = tag.into();
        match self.current {
            Some(id) if self.arena.tag(id) == tag => {
                self.current = self.arena.next_sibling(id);
                Ok(id)
            }
            _ => Err(Error::MalformedEncoding(what)),
        }
    }

    /// Advance past an optional node with `tag`
    pub fn accept(&mut self, tag: impl Into<Tag>) -> Option<NodeId> {
        if self.matches(tag) { self.advance() } else { None }
    }
}

fn parse_length(input: &[u8]) -> Result<(usize, usize)> {
    let first = *input
        .first()
        .ok_or(Error::MalformedEncoding("length truncated"))?;
    if first < 0x80 {
        return Ok((first as usize, 1));
    }
    if first == 0x80 {
        return Err(Error::MalformedEncoding("indefinite length not supported"));
    }
    let num_bytes = (first & 0x7F) as usize;
    if num_bytes > 4 {
        return Err(Error::MalformedEncoding("length field too large"));
    }
    if input.len() < 1 + num_bytes {
        return Err(Error::MalformedEncoding("length field truncated"));
    }
    let mut len = 0usize;
    for &byte in &input[1..1 + num_bytes] {
        len = (len << 8) | byte as usize;
    }
    Ok((len, 1 + num_bytes))
}

fn write_length(out: &mut BytesMut, len: usize) {
    if len < 0x80 {
        out.put_u8(len as u8);
    } else {
        let bytes = (len as u32).to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(3);
        out.put_u8(0x80 | (4 - start) as u8);
        out.put_slice(&bytes[start..]);
    }
}

/// Builder for nested TLV structures (APDU data fields, key templates)
#[derive(Debug, Default)]
pub struct TlvWriter {
    out: BytesMut,
}

impl TlvWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a primitive data object
    pub fn primitive(&mut self, tag: impl Into<Tag>, value: &[u8]) -> &mut Self {
        tag.into().write_to(&mut self.out);
        write_length(&mut self.out, value.len());
        self.out.put_slice(value);
        self
    }

    /// Append a constructed data object whose children are built by `build`
    pub fn constructed(
        &mut self,
        tag: impl Into<Tag>,
        build: impl FnOnce(&mut Self),
    ) -> &mut Self {
        let mut inner = Self::new();
        build(&mut inner);
        let value = inner.out.freeze();
        tag.into().write_to(&mut self.out);
        write_length(&mut self.out, value.len());
        self.out.put_slice(&value);
        self
    }

    /// Append pre-encoded bytes verbatim
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.out.put_slice(bytes);
        self
    }

    /// Finish, returning the encoded bytes
    pub fn into_bytes(self) -> Bytes {
        self.out.freeze()
    }
}

/// Encode a single data object
pub fn encode(tag: impl Into<Tag>, value: &[u8]) -> Bytes {
    let mut writer = TlvWriter::new();
    writer.primitive(tag, value);
    writer.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_parse_flat_siblings() {
        // Trailing garbage that is not valid TLV must fail, not be ignored.
        let err = TlvArena::parse(&hex!("800141 81020203 04")[..]).unwrap_err();
        assert!(matches!(err, Error::MalformedEncoding(_)));

        let arena = TlvArena::parse(&hex!("800141 81020203")[..]).unwrap();
        let roots: Vec<_> = arena.roots().collect();
        assert_eq!(roots.len(), 2);
        assert_eq!(arena.tag(roots[0]), Tag::new(0x80));
        assert_eq!(arena.value(roots[0]), &hex!("41"));
        assert_eq!(arena.tag(roots[1]), Tag::new(0x81));
        assert_eq!(arena.value(roots[1]), &hex!("0203"));
    }

    #[test]
    fn test_parse_nested() {
        let arena = TlvArena::parse(&hex!("7C09 800141 810142 820143")[..]).unwrap();
        let root = arena.first_root().unwrap();
        assert_eq!(arena.tag(root), Tag::DYNAMIC_AUTHENTICATION_DATA);
        assert!(arena.tag(root).is_constructed());

        let children: Vec<_> = arena.children(root).collect();
        assert_eq!(children.len(), 3);
        assert_eq!(arena.value(children[1]), &hex!("42"));
        assert_eq!(arena.parent(children[2]), Some(root));
        assert_eq!(
            arena.child_tagged(root, 0x82).map(|id| arena.value(id)),
            Some(&hex!("43")[..])
        );
    }

    #[test]
    fn test_multi_byte_tag() {
        let arena = TlvArena::parse(&hex!("7F2103800102")[..]).unwrap();
        let root = arena.first_root().unwrap();
        let tag = arena.tag(root);
        assert_eq!(tag, Tag::CV_CERTIFICATE);
        assert_eq!(tag.class(), TagClass::Application);
        assert!(tag.is_constructed());
        assert_eq!(tag.number(), 0x21);

        let five_f = TlvArena::parse(&hex!("5F290100")[..]).unwrap();
        let root = five_f.first_root().unwrap();
        assert_eq!(five_f.tag(root).number(), 41);
        assert!(!five_f.tag(root).is_constructed());
    }

    #[test]
    fn test_long_form_length() {
        let mut input = hex!("5F3781C8").to_vec();
        input.extend_from_slice(&[0xAB; 0xC8]);
        let arena = TlvArena::parse(input.clone()).unwrap();
        let root = arena.first_root().unwrap();
        assert_eq!(arena.value(root).len(), 0xC8);
        assert_eq!(arena.serialize(root).as_ref(), &input[..]);
    }

    #[test]
    fn test_length_overrun_fails() {
        assert!(matches!(
            TlvArena::parse(&hex!("80 05 0102")[..]),
            Err(Error::MalformedEncoding("length overruns buffer"))
        ));
    }

    #[test]
    fn test_indefinite_length_rejected() {
        assert!(matches!(
            TlvArena::parse(&hex!("30 80 0000")[..]),
            Err(Error::MalformedEncoding("indefinite length not supported"))
        ));
    }

    #[test]
    fn test_zero_terminator_stops_run() {
        let arena = TlvArena::parse(&hex!("800141 00 00 00 00")[..]).unwrap();
        assert_eq!(arena.roots().count(), 1);
    }

    #[test]
    fn test_roundtrip_with_successors() {
        let input = hex!("7C098001418101428201430203AABBCC");
        let arena = TlvArena::parse(input.to_vec()).unwrap();
        let first = arena.first_root().unwrap();
        assert_eq!(
            arena.serialize_with_successors(first).as_ref(),
            &input[..]
        );
    }

    #[test]
    fn test_reader_lookahead() {
        let arena = TlvArena::parse(&hex!("7C09 800141 810142 8E0143")[..]).unwrap();
        let root = arena.first_root().unwrap();
        let mut reader = arena.reader(root);

        assert!(reader.matches(0x80));
        assert!(reader.matches_ahead(0x81, 1));
        assert!(reader.matches_ahead(0x8E, 2));
        assert!(!reader.matches_ahead(0x99, 2));

        // Lookahead must not have consumed anything.
        let first = reader.expect(0x80, "expected 0x80").unwrap();
        assert_eq!(arena.value(first), &hex!("41"));
        assert!(reader.accept(0x99).is_none());
        assert!(reader.accept(0x81).is_some());
        assert!(reader.matches(0x8E));
    }

    #[test]
    fn test_writer_builds_nested() {
        let mut writer = TlvWriter::new();
        writer.constructed(0x7C, |w| {
            w.primitive(0x80, &hex!("41"));
            w.primitive(0x81, &hex!("4243"));
        });
        assert_eq!(writer.into_bytes().as_ref(), &hex!("7C07800141 81024243"));
    }

    #[test]
    fn test_writer_long_length() {
        let value = vec![0x55u8; 200];
        let encoded = encode(0x5F37, &value);
        assert_eq!(&encoded[..4], &hex!("5F3781C8"));
        assert_eq!(encoded.len(), 4 + 200);
    }

    #[test]
    fn test_opaque_constructed_value_kept() {
        // Constructed tag whose body is not valid TLV: node survives with
        // no children and serializes byte-exact.
        let input = hex!("7F4E03 01FFFF");
        let arena = TlvArena::parse(input.to_vec()).unwrap();
        let root = arena.first_root().unwrap();
        assert!(arena.first_child(root).is_none());
        assert_eq!(arena.serialize(root).as_ref(), &input[..]);
    }
}
