//! The wire envelope carried by every request/reply exchange.
//!
//! Frame layout, sent as one logical write:
//!
//! ```md
//! signature (S bytes) | tag (1) | payload-length (4, BE) | field-count (1) | payload
//! ```
//!
//! The payload is the field-codec serialization of
//! `[source NodeReference, field_1 .. field_n]`, always deflate-compressed.
//! The signature is an opaque equality-checked filter discarding traffic
//! from a different overlay instance sharing a transport; it is not
//! cryptographic.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::algorithm::RoutingContext;
use crate::common::{Id, NodeReference};
use crate::{Error, Result};

/// Maximum number of fields expressible by the 1-byte field count.
pub const MAX_FIELDS: usize = 255;

/// The fixed message-tag namespace, shared across all message kinds.
///
/// Generated once as an enumeration; there is no runtime tag registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Ping = 1,
    Ack = 2,
    ReqConnect = 3,
    RepConnect = 4,
    ReqSuccessor = 5,
    RepSuccessor = 6,
    UpdateFingerTable = 7,
    AckFingerTable = 8,
    RouteIterative = 9,
    ReplyIterative = 10,
    AdjustLastHopIterative = 11,
    TerminateIterative = 12,
    RouteRecursive = 13,
    AckRecursive = 14,
    TerminateRecursive = 15,
    ResultRecursive = 16,
}

impl TryFrom<u8> for Tag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Tag> {
        Ok(match value {
            1 => Tag::Ping,
            2 => Tag::Ack,
            3 => Tag::ReqConnect,
            4 => Tag::RepConnect,
            5 => Tag::ReqSuccessor,
            6 => Tag::RepSuccessor,
            7 => Tag::UpdateFingerTable,
            8 => Tag::AckFingerTable,
            9 => Tag::RouteIterative,
            10 => Tag::ReplyIterative,
            11 => Tag::AdjustLastHopIterative,
            12 => Tag::TerminateIterative,
            13 => Tag::RouteRecursive,
            14 => Tag::AckRecursive,
            15 => Tag::TerminateRecursive,
            16 => Tag::ResultRecursive,
            other => return Err(Error::UnknownTag(other)),
        })
    }
}

/// One typed element of an envelope's ordered field list.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Bytes(Bytes),
    U8(u8),
    U32(u32),
    U64(u64),
    Bool(bool),
    Id(Id),
    Node(NodeReference),
    NodeList(Vec<NodeReference>),
    IdList(Vec<Id>),
    BytesList(Vec<Bytes>),
    Context(RoutingContext),
}

const FT_BYTES: u8 = 0x01;
const FT_U8: u8 = 0x02;
const FT_U32: u8 = 0x03;
const FT_U64: u8 = 0x04;
const FT_BOOL: u8 = 0x05;
const FT_ID: u8 = 0x06;
const FT_NODE: u8 = 0x07;
const FT_NODE_LIST: u8 = 0x08;
const FT_ID_LIST: u8 = 0x09;
const FT_BYTES_LIST: u8 = 0x0a;
const FT_CONTEXT: u8 = 0x0b;

/// A tagged, multi-field request/reply unit. Created per send, decoded per
/// receive, not retained afterward.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub tag: Tag,
    pub source: NodeReference,
    pub fields: Vec<Field>,
}

impl Envelope {
    pub fn new(tag: Tag, source: NodeReference, fields: Vec<Field>) -> Envelope {
        Envelope {
            tag,
            source,
            fields,
        }
    }

    // === Public Methods ===

    /// Encode this envelope into a single wire frame.
    pub fn to_bytes(&self, signature: &[u8]) -> Result<Bytes> {
        if self.fields.len() > MAX_FIELDS {
            return Err(Error::TooManyFields(self.fields.len()));
        }

        let mut payload = BytesMut::new();
        encode_node(&mut payload, &self.source);
        for field in &self.fields {
            encode_field(&mut payload, field);
        }

        // The payload is never sent raw.
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        let compressed = encoder.finish()?;

        let mut out = BytesMut::with_capacity(signature.len() + 6 + compressed.len());
        out.put_slice(signature);
        out.put_u8(self.tag as u8);
        out.put_u32(compressed.len() as u32);
        out.put_u8(self.fields.len() as u8);
        out.put_slice(&compressed);

        Ok(out.freeze())
    }

    /// Decode a wire frame, checking the overlay signature first.
    pub fn from_bytes(bytes: &[u8], signature: &[u8]) -> Result<Envelope> {
        let header = signature.len() + 6;
        if bytes.len() < header {
            return Err(Error::TruncatedFrame {
                expected: header,
                got: bytes.len(),
            });
        }

        if &bytes[..signature.len()] != signature {
            return Err(Error::SignatureMismatch);
        }

        let mut cursor = Cursor::new(&bytes[signature.len()..]);
        let tag = Tag::try_from(cursor.u8()?)?;
        let payload_len = cursor.u32()? as usize;
        let field_count = cursor.u8()? as usize;

        let rest = cursor.rest();
        if rest.len() < payload_len {
            return Err(Error::TruncatedFrame {
                expected: header + payload_len,
                got: bytes.len(),
            });
        }
        if rest.len() > payload_len {
            return Err(Error::MalformedFrame("trailing bytes after payload"));
        }

        let mut payload = Vec::new();
        DeflateDecoder::new(rest)
            .read_to_end(&mut payload)
            .map_err(|_| Error::MalformedFrame("payload decompression failed"))?;

        let mut cursor = Cursor::new(&payload);
        let source = decode_node(&mut cursor)?;

        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(decode_field(&mut cursor)?);
        }

        if cursor.remaining() != 0 {
            return Err(Error::MalformedFrame("trailing bytes after fields"));
        }

        Ok(Envelope {
            tag,
            source,
            fields,
        })
    }
}

// === Field codec ===

fn encode_field(out: &mut BytesMut, field: &Field) {
    match field {
        Field::Bytes(b) => {
            out.put_u8(FT_BYTES);
            out.put_u32(b.len() as u32);
            out.put_slice(b);
        }
        Field::U8(v) => {
            out.put_u8(FT_U8);
            out.put_u8(*v);
        }
        Field::U32(v) => {
            out.put_u8(FT_U32);
            out.put_u32(*v);
        }
        Field::U64(v) => {
            out.put_u8(FT_U64);
            out.put_u64(*v);
        }
        Field::Bool(v) => {
            out.put_u8(FT_BOOL);
            out.put_u8(*v as u8);
        }
        Field::Id(id) => {
            out.put_u8(FT_ID);
            encode_id(out, id);
        }
        Field::Node(node) => {
            out.put_u8(FT_NODE);
            encode_node(out, node);
        }
        Field::NodeList(nodes) => {
            out.put_u8(FT_NODE_LIST);
            out.put_u16(nodes.len() as u16);
            for node in nodes {
                encode_node(out, node);
            }
        }
        Field::IdList(ids) => {
            out.put_u8(FT_ID_LIST);
            out.put_u16(ids.len() as u16);
            for id in ids {
                encode_id(out, id);
            }
        }
        Field::BytesList(list) => {
            out.put_u8(FT_BYTES_LIST);
            out.put_u16(list.len() as u16);
            for b in list {
                out.put_u32(b.len() as u32);
                out.put_slice(b);
            }
        }
        Field::Context(ctx) => {
            out.put_u8(FT_CONTEXT);
            match ctx {
                RoutingContext::None => out.put_u8(0),
                RoutingContext::VirtualPointer(id) => {
                    out.put_u8(1);
                    encode_id(out, id);
                }
            }
        }
    }
}

fn decode_field(cursor: &mut Cursor<'_>) -> Result<Field> {
    let field_type = cursor.u8()?;

    Ok(match field_type {
        FT_BYTES => {
            let len = cursor.u32()? as usize;
            Field::Bytes(Bytes::copy_from_slice(cursor.take(len)?))
        }
        FT_U8 => Field::U8(cursor.u8()?),
        FT_U32 => Field::U32(cursor.u32()?),
        FT_U64 => Field::U64(cursor.u64()?),
        FT_BOOL => Field::Bool(cursor.u8()? != 0),
        FT_ID => Field::Id(decode_id(cursor)?),
        FT_NODE => Field::Node(decode_node(cursor)?),
        FT_NODE_LIST => {
            let count = cursor.u16()? as usize;
            let mut nodes = Vec::with_capacity(count);
            for _ in 0..count {
                nodes.push(decode_node(cursor)?);
            }
            Field::NodeList(nodes)
        }
        FT_ID_LIST => {
            let count = cursor.u16()? as usize;
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                ids.push(decode_id(cursor)?);
            }
            Field::IdList(ids)
        }
        FT_BYTES_LIST => {
            let count = cursor.u16()? as usize;
            let mut list = Vec::with_capacity(count);
            for _ in 0..count {
                let len = cursor.u32()? as usize;
                list.push(Bytes::copy_from_slice(cursor.take(len)?));
            }
            Field::BytesList(list)
        }
        FT_CONTEXT => match cursor.u8()? {
            0 => Field::Context(RoutingContext::None),
            1 => Field::Context(RoutingContext::VirtualPointer(decode_id(cursor)?)),
            _ => return Err(Error::FieldDecode("unknown routing context variant")),
        },
        other => return Err(Error::UnknownFieldType(other)),
    })
}

fn encode_id(out: &mut BytesMut, id: &Id) {
    out.put_u8(id.size() as u8);
    out.put_slice(id.as_bytes());
}

fn decode_id(cursor: &mut Cursor<'_>) -> Result<Id> {
    let size = cursor.u8()? as usize;
    Ok(Id::from_bytes(cursor.take(size)?))
}

const NODE_HAS_ID: u8 = 0b001;
const NODE_HAS_ADDR: u8 = 0b010;
const NODE_ADDR_V6: u8 = 0b100;

fn encode_node(out: &mut BytesMut, node: &NodeReference) {
    let mut flags = 0u8;
    if node.id().is_some() {
        flags |= NODE_HAS_ID;
    }
    if let Some(addr) = node.addr() {
        flags |= NODE_HAS_ADDR;
        if addr.is_ipv6() {
            flags |= NODE_ADDR_V6;
        }
    }
    out.put_u8(flags);

    if let Some(id) = node.id() {
        encode_id(out, id);
    }
    if let Some(addr) = node.addr() {
        match addr.ip() {
            IpAddr::V4(ip) => out.put_slice(&ip.octets()),
            IpAddr::V6(ip) => out.put_slice(&ip.octets()),
        }
        out.put_u16(addr.port());
    }
}

fn decode_node(cursor: &mut Cursor<'_>) -> Result<NodeReference> {
    let flags = cursor.u8()?;

    let id = if flags & NODE_HAS_ID != 0 {
        Some(decode_id(cursor)?)
    } else {
        None
    };

    let addr = if flags & NODE_HAS_ADDR != 0 {
        let ip: IpAddr = if flags & NODE_ADDR_V6 != 0 {
            let octets: [u8; 16] = cursor
                .take(16)?
                .try_into()
                .map_err(|_| Error::FieldDecode("bad ipv6 address"))?;
            octets.into()
        } else {
            let octets: [u8; 4] = cursor
                .take(4)?
                .try_into()
                .map_err(|_| Error::FieldDecode("bad ipv4 address"))?;
            octets.into()
        };
        Some(SocketAddr::new(ip, cursor.u16()?))
    } else {
        None
    };

    Ok(match (id, addr) {
        (Some(id), Some(addr)) => NodeReference::new(id, addr),
        (Some(id), None) => NodeReference::from_id(id),
        (None, Some(addr)) => NodeReference::from_addr(addr),
        (None, None) => NodeReference::empty(),
    })
}

/// Bounds-checked reader over a byte slice; every short read surfaces as a
/// decode error rather than a panic.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Cursor<'a> {
        Cursor { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::FieldDecode("field runs past end of payload"));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }
}
