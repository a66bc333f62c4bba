//! Typed request/reply messages and their envelope encodings.
//!
//! Every message kind is a plain struct with `to_envelope`/`from_envelope`
//! conversions; the field order inside the envelope is part of the wire
//! contract. A mismatch between a message's declared tag and its field
//! shape surfaces as a decode error, never as silently dropped data.

use bytes::Bytes;

use crate::algorithm::RoutingContext;
use crate::common::{Envelope, Field, Id, NodeReference, Tag};
use crate::{Error, Result};

/// Piggybacked application callback: invoked at every hop a lookup passes
/// through, carrying an application tag and arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackSpec {
    pub tag: u8,
    pub args: Vec<Bytes>,
}

// === PING / ACK ===

#[derive(Debug, Clone, PartialEq)]
pub struct PingRequest;

impl PingRequest {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        Envelope::new(Tag::Ping, source, vec![])
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<PingRequest> {
        expect_tag(envelope, Tag::Ping)?;
        Ok(PingRequest)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack;

impl Ack {
    pub fn to_envelope(&self, source: NodeReference, tag: Tag) -> Envelope {
        Envelope::new(tag, source, vec![])
    }
}

// === REQ_CONNECT / REP_CONNECT ===

/// First contact of a joining node: announces the joiner and asks who is
/// responsible for its identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub joining: NodeReference,
}

impl ConnectRequest {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        Envelope::new(
            Tag::ReqConnect,
            source,
            vec![Field::Node(self.joining.clone())],
        )
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<ConnectRequest> {
        expect_tag(envelope, Tag::ReqConnect)?;
        let mut reader = FieldReader::new(envelope);
        Ok(ConnectRequest {
            joining: reader.node()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectReply {
    pub roots: Vec<NodeReference>,
}

impl ConnectReply {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        Envelope::new(
            Tag::RepConnect,
            source,
            vec![Field::NodeList(self.roots.clone())],
        )
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<ConnectReply> {
        expect_tag(envelope, Tag::RepConnect)?;
        let mut reader = FieldReader::new(envelope);
        Ok(ConnectReply {
            roots: reader.node_list()?,
        })
    }
}

// === REQ_SUCCESSOR / REP_SUCCESSOR ===

#[derive(Debug, Clone, PartialEq)]
pub struct SuccessorRequest;

impl SuccessorRequest {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        Envelope::new(Tag::ReqSuccessor, source, vec![])
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<SuccessorRequest> {
        expect_tag(envelope, Tag::ReqSuccessor)?;
        Ok(SuccessorRequest)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuccessorReply {
    pub successors: Vec<NodeReference>,
    pub predecessor: NodeReference,
}

impl SuccessorReply {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        Envelope::new(
            Tag::RepSuccessor,
            source,
            vec![
                Field::NodeList(self.successors.clone()),
                Field::Node(self.predecessor.clone()),
            ],
        )
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<SuccessorReply> {
        expect_tag(envelope, Tag::RepSuccessor)?;
        let mut reader = FieldReader::new(envelope);
        Ok(SuccessorReply {
            successors: reader.node_list()?,
            predecessor: reader.node()?,
        })
    }
}

// === UPDATE_FINGER_TABLE / ACK_FINGER_TABLE ===

/// Aggressive-join push: `node` may belong in the receiver's finger slot
/// `index`; receivers that update propagate to their predecessor.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerUpdate {
    pub node: NodeReference,
    pub index: u32,
}

impl FingerUpdate {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        Envelope::new(
            Tag::UpdateFingerTable,
            source,
            vec![Field::Node(self.node.clone()), Field::U32(self.index)],
        )
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<FingerUpdate> {
        expect_tag(envelope, Tag::UpdateFingerTable)?;
        let mut reader = FieldReader::new(envelope);
        Ok(FingerUpdate {
            node: reader.node()?,
            index: reader.u32()?,
        })
    }
}

// === Iterative lookup ===

/// One iterative-lookup step: "give me your closest nodes toward each of
/// these targets".
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub targets: Vec<Id>,
    pub contexts: Vec<RoutingContext>,
    pub fan_out: u32,
    pub callback: Option<CallbackSpec>,
}

impl RouteRequest {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        let mut fields = vec![
            Field::U32(self.fan_out),
            Field::IdList(self.targets.clone()),
        ];
        push_callback(&mut fields, &self.callback);
        for ctx in &self.contexts {
            fields.push(Field::Context(ctx.clone()));
        }
        Envelope::new(Tag::RouteIterative, source, fields)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<RouteRequest> {
        expect_tag(envelope, Tag::RouteIterative)?;
        let mut reader = FieldReader::new(envelope);

        let fan_out = reader.u32()?;
        let targets = reader.id_list()?;
        let callback = reader.callback()?;
        let contexts = reader.contexts(targets.len())?;

        Ok(RouteRequest {
            targets,
            contexts,
            fan_out,
            callback,
        })
    }
}

/// Reply to [RouteRequest]: per target, the responder's closer candidates
/// and the advanced routing context.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteReply {
    pub targets: Vec<Id>,
    pub closer: Vec<Vec<NodeReference>>,
    pub contexts: Vec<RoutingContext>,
    pub callback_outputs: Vec<Bytes>,
}

impl RouteReply {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        let mut fields = vec![
            Field::IdList(self.targets.clone()),
            Field::BytesList(self.callback_outputs.clone()),
        ];
        for nodes in &self.closer {
            fields.push(Field::NodeList(nodes.clone()));
        }
        for ctx in &self.contexts {
            fields.push(Field::Context(ctx.clone()));
        }
        Envelope::new(Tag::ReplyIterative, source, fields)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<RouteReply> {
        expect_tag(envelope, Tag::ReplyIterative)?;
        let mut reader = FieldReader::new(envelope);

        let targets = reader.id_list()?;
        let callback_outputs = reader.bytes_list()?;
        let mut closer = Vec::with_capacity(targets.len());
        for _ in 0..targets.len() {
            closer.push(reader.node_list()?);
        }
        let contexts = reader.contexts(targets.len())?;

        Ok(RouteReply {
            targets,
            closer,
            contexts,
            callback_outputs,
        })
    }
}

/// Ask the converged node whether it really owns each target.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustRequest {
    pub targets: Vec<Id>,
    pub num_roots: u32,
}

impl AdjustRequest {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        Envelope::new(
            Tag::AdjustLastHopIterative,
            source,
            vec![
                Field::U32(self.num_roots),
                Field::IdList(self.targets.clone()),
            ],
        )
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<AdjustRequest> {
        expect_tag(envelope, Tag::AdjustLastHopIterative)?;
        let mut reader = FieldReader::new(envelope);
        Ok(AdjustRequest {
            num_roots: reader.u32()?,
            targets: reader.id_list()?,
        })
    }
}

/// Per-target verdict of the adjust-last-hop phase.
#[derive(Debug, Clone, PartialEq)]
pub enum AdjustVerdict {
    /// The asked node is the owner; these are its root candidates.
    Owner(Vec<NodeReference>),
    /// The true owner is someone else; re-target the terminating message.
    Redirect(Vec<NodeReference>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdjustReply {
    pub targets: Vec<Id>,
    pub verdicts: Vec<AdjustVerdict>,
}

impl AdjustReply {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        let mut fields = vec![Field::IdList(self.targets.clone())];
        for verdict in &self.verdicts {
            match verdict {
                AdjustVerdict::Owner(roots) => {
                    fields.push(Field::Bool(true));
                    fields.push(Field::NodeList(roots.clone()));
                }
                AdjustVerdict::Redirect(corrected) => {
                    fields.push(Field::Bool(false));
                    fields.push(Field::NodeList(corrected.clone()));
                }
            }
        }
        Envelope::new(Tag::ReplyIterative, source, fields)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<AdjustReply> {
        expect_tag(envelope, Tag::ReplyIterative)?;
        let mut reader = FieldReader::new(envelope);

        let targets = reader.id_list()?;
        let mut verdicts = Vec::with_capacity(targets.len());
        for _ in 0..targets.len() {
            let is_owner = reader.bool()?;
            let nodes = reader.node_list()?;
            verdicts.push(if is_owner {
                AdjustVerdict::Owner(nodes)
            } else {
                AdjustVerdict::Redirect(nodes)
            });
        }

        Ok(AdjustReply { targets, verdicts })
    }
}

/// Terminating message sent to the (corrected) owner of the targets.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminateRequest {
    pub targets: Vec<Id>,
    pub num_roots: u32,
    pub callback: Option<CallbackSpec>,
}

impl TerminateRequest {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        let mut fields = vec![
            Field::U32(self.num_roots),
            Field::IdList(self.targets.clone()),
        ];
        push_callback(&mut fields, &self.callback);
        Envelope::new(Tag::TerminateIterative, source, fields)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<TerminateRequest> {
        expect_tag(envelope, Tag::TerminateIterative)?;
        let mut reader = FieldReader::new(envelope);
        Ok(TerminateRequest {
            num_roots: reader.u32()?,
            targets: reader.id_list()?,
            callback: reader.callback()?,
        })
    }
}

/// Final owner answer: per-target root candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct RootsReply {
    pub targets: Vec<Id>,
    pub roots: Vec<Vec<NodeReference>>,
    pub callback_outputs: Vec<Bytes>,
}

impl RootsReply {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        let mut fields = vec![
            Field::IdList(self.targets.clone()),
            Field::BytesList(self.callback_outputs.clone()),
        ];
        for roots in &self.roots {
            fields.push(Field::NodeList(roots.clone()));
        }
        Envelope::new(Tag::ReplyIterative, source, fields)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<RootsReply> {
        expect_tag(envelope, Tag::ReplyIterative)?;
        let mut reader = FieldReader::new(envelope);

        let targets = reader.id_list()?;
        let callback_outputs = reader.bytes_list()?;
        let mut roots = Vec::with_capacity(targets.len());
        for _ in 0..targets.len() {
            roots.push(reader.node_list()?);
        }

        Ok(RootsReply {
            targets,
            roots,
            callback_outputs,
        })
    }
}

// === Recursive lookup ===

/// A recursive lookup in flight: each hop advances it and forwards this
/// message (or answers the initiator directly once it owns the targets).
#[derive(Debug, Clone, PartialEq)]
pub struct RecursiveRoute {
    pub op_id: u64,
    pub initiator: NodeReference,
    pub targets: Vec<Id>,
    pub contexts: Vec<RoutingContext>,
    /// Accumulated hop path, appended to by every forwarding node.
    pub hops: Vec<NodeReference>,
    /// Peers that already failed within this operation.
    pub blacklist: Vec<NodeReference>,
    pub ttl: u8,
    pub num_roots: u32,
    /// Correct the final hop to the true owner; `false` answers from the
    /// convergence point itself.
    pub adjust: bool,
    pub callback: Option<CallbackSpec>,
    /// Accumulated callback outputs, in hop order.
    pub callback_outputs: Vec<Bytes>,
}

impl RecursiveRoute {
    pub fn to_envelope(&self, source: NodeReference, tag: Tag) -> Envelope {
        let mut fields = vec![
            Field::U64(self.op_id),
            Field::Node(self.initiator.clone()),
            Field::U8(self.ttl),
            Field::U32(self.num_roots),
            Field::Bool(self.adjust),
            Field::IdList(self.targets.clone()),
            Field::NodeList(self.hops.clone()),
            Field::NodeList(self.blacklist.clone()),
            Field::BytesList(self.callback_outputs.clone()),
        ];
        push_callback(&mut fields, &self.callback);
        for ctx in &self.contexts {
            fields.push(Field::Context(ctx.clone()));
        }
        Envelope::new(tag, source, fields)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<RecursiveRoute> {
        if envelope.tag != Tag::RouteRecursive && envelope.tag != Tag::TerminateRecursive {
            return Err(Error::UnexpectedReply {
                expected: Tag::RouteRecursive,
                got: envelope.tag,
            });
        }
        let mut reader = FieldReader::new(envelope);

        let op_id = reader.u64()?;
        let initiator = reader.node()?;
        let ttl = reader.u8()?;
        let num_roots = reader.u32()?;
        let adjust = reader.bool()?;
        let targets = reader.id_list()?;
        let hops = reader.node_list()?;
        let blacklist = reader.node_list()?;
        let callback_outputs = reader.bytes_list()?;
        let callback = reader.callback()?;
        let contexts = reader.contexts(targets.len())?;

        Ok(RecursiveRoute {
            op_id,
            initiator,
            targets,
            contexts,
            hops,
            blacklist,
            ttl,
            num_roots,
            adjust,
            callback,
            callback_outputs,
        })
    }
}

/// Owner-to-initiator result, sent directly rather than hop-by-hop.
#[derive(Debug, Clone, PartialEq)]
pub struct RecursiveResult {
    pub op_id: u64,
    pub targets: Vec<Id>,
    pub roots: Vec<Vec<NodeReference>>,
    pub hops: Vec<NodeReference>,
    pub callback_outputs: Vec<Bytes>,
}

impl RecursiveResult {
    pub fn to_envelope(&self, source: NodeReference) -> Envelope {
        let mut fields = vec![
            Field::U64(self.op_id),
            Field::IdList(self.targets.clone()),
            Field::NodeList(self.hops.clone()),
            Field::BytesList(self.callback_outputs.clone()),
        ];
        for roots in &self.roots {
            fields.push(Field::NodeList(roots.clone()));
        }
        Envelope::new(Tag::ResultRecursive, source, fields)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<RecursiveResult> {
        expect_tag(envelope, Tag::ResultRecursive)?;
        let mut reader = FieldReader::new(envelope);

        let op_id = reader.u64()?;
        let targets = reader.id_list()?;
        let hops = reader.node_list()?;
        let callback_outputs = reader.bytes_list()?;
        let mut roots = Vec::with_capacity(targets.len());
        for _ in 0..targets.len() {
            roots.push(reader.node_list()?);
        }

        Ok(RecursiveResult {
            op_id,
            targets,
            roots,
            hops,
            callback_outputs,
        })
    }
}

// === Helpers ===

/// Wire-supplied targets must live in the receiver's identifier space;
/// request handlers reject the message otherwise.
pub(crate) fn check_target_sizes(targets: &[Id], expected: usize) -> Result<()> {
    match targets.iter().find(|target| target.size() != expected) {
        Some(bad) => Err(Error::InvalidIdSize {
            expected,
            got: bad.size(),
        }),
        None => Ok(()),
    }
}

fn expect_tag(envelope: &Envelope, expected: Tag) -> Result<()> {
    if envelope.tag != expected {
        return Err(Error::UnexpectedReply {
            expected,
            got: envelope.tag,
        });
    }
    Ok(())
}

fn push_callback(fields: &mut Vec<Field>, callback: &Option<CallbackSpec>) {
    match callback {
        Some(spec) => {
            fields.push(Field::Bool(true));
            fields.push(Field::U8(spec.tag));
            fields.push(Field::BytesList(spec.args.clone()));
        }
        None => fields.push(Field::Bool(false)),
    }
}

/// Ordered reader over an envelope's field list; a type mismatch is a
/// decode error.
struct FieldReader<'a> {
    fields: std::slice::Iter<'a, Field>,
}

impl<'a> FieldReader<'a> {
    fn new(envelope: &'a Envelope) -> FieldReader<'a> {
        FieldReader {
            fields: envelope.fields.iter(),
        }
    }

    fn next(&mut self) -> Result<&'a Field> {
        self.fields
            .next()
            .ok_or(Error::FieldDecode("missing field"))
    }

    fn u8(&mut self) -> Result<u8> {
        match self.next()? {
            Field::U8(v) => Ok(*v),
            _ => Err(Error::FieldDecode("expected u8 field")),
        }
    }

    fn u32(&mut self) -> Result<u32> {
        match self.next()? {
            Field::U32(v) => Ok(*v),
            _ => Err(Error::FieldDecode("expected u32 field")),
        }
    }

    fn u64(&mut self) -> Result<u64> {
        match self.next()? {
            Field::U64(v) => Ok(*v),
            _ => Err(Error::FieldDecode("expected u64 field")),
        }
    }

    fn bool(&mut self) -> Result<bool> {
        match self.next()? {
            Field::Bool(v) => Ok(*v),
            _ => Err(Error::FieldDecode("expected bool field")),
        }
    }

    fn node(&mut self) -> Result<NodeReference> {
        match self.next()? {
            Field::Node(n) => Ok(n.clone()),
            _ => Err(Error::FieldDecode("expected node field")),
        }
    }

    fn node_list(&mut self) -> Result<Vec<NodeReference>> {
        match self.next()? {
            Field::NodeList(nodes) => Ok(nodes.clone()),
            _ => Err(Error::FieldDecode("expected node list field")),
        }
    }

    fn id_list(&mut self) -> Result<Vec<Id>> {
        match self.next()? {
            Field::IdList(ids) => Ok(ids.clone()),
            _ => Err(Error::FieldDecode("expected id list field")),
        }
    }

    fn bytes_list(&mut self) -> Result<Vec<Bytes>> {
        match self.next()? {
            Field::BytesList(list) => Ok(list.clone()),
            _ => Err(Error::FieldDecode("expected bytes list field")),
        }
    }

    fn context(&mut self) -> Result<RoutingContext> {
        match self.next()? {
            Field::Context(ctx) => Ok(ctx.clone()),
            _ => Err(Error::FieldDecode("expected context field")),
        }
    }

    fn contexts(&mut self, count: usize) -> Result<Vec<RoutingContext>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.context()?);
        }
        Ok(out)
    }

    fn callback(&mut self) -> Result<Option<CallbackSpec>> {
        if !self.bool()? {
            return Ok(None);
        }
        Ok(Some(CallbackSpec {
            tag: self.u8()?,
            args: self.bytes_list()?,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;

    fn node(port: u16) -> NodeReference {
        NodeReference::new(Id::random(2), SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn route_request_round_trip() {
        let request = RouteRequest {
            targets: vec![Id::random(2), Id::random(2)],
            contexts: vec![
                RoutingContext::None,
                RoutingContext::VirtualPointer(Id::random(2)),
            ],
            fan_out: 3,
            callback: Some(CallbackSpec {
                tag: 42,
                args: vec![Bytes::from_static(b"arg")],
            }),
        };

        let envelope = request.to_envelope(node(1));
        assert_eq!(RouteRequest::from_envelope(&envelope).unwrap(), request);
    }

    #[test]
    fn recursive_route_round_trip() {
        let route = RecursiveRoute {
            op_id: 7,
            initiator: node(1),
            targets: vec![Id::random(2)],
            contexts: vec![RoutingContext::None],
            hops: vec![node(2), node(3)],
            blacklist: vec![node(4)],
            ttl: 9,
            num_roots: 2,
            adjust: true,
            callback: None,
            callback_outputs: vec![Bytes::from_static(b"out")],
        };

        for tag in [Tag::RouteRecursive, Tag::TerminateRecursive] {
            let envelope = route.to_envelope(node(2), tag);
            assert_eq!(RecursiveRoute::from_envelope(&envelope).unwrap(), route);
        }
    }

    #[test]
    fn adjust_reply_round_trip() {
        let reply = AdjustReply {
            targets: vec![Id::random(2), Id::random(2)],
            verdicts: vec![
                AdjustVerdict::Owner(vec![node(1)]),
                AdjustVerdict::Redirect(vec![node(2), node(3)]),
            ],
        };

        let envelope = reply.to_envelope(node(9));
        assert_eq!(AdjustReply::from_envelope(&envelope).unwrap(), reply);
    }

    #[test]
    fn wrong_tag_is_a_protocol_error() {
        let envelope = PingRequest.to_envelope(node(1));

        assert!(matches!(
            SuccessorReply::from_envelope(&envelope),
            Err(Error::UnexpectedReply { .. })
        ));
    }

    #[test]
    fn mismatched_target_sizes_are_rejected() {
        assert!(check_target_sizes(&[Id::random(2), Id::random(2)], 2).is_ok());
        assert!(matches!(
            check_target_sizes(&[Id::random(2), Id::random(4)], 2),
            Err(Error::InvalidIdSize {
                expected: 2,
                got: 4
            })
        ));
    }

    #[test]
    fn missing_fields_are_a_decode_error() {
        let envelope = Envelope::new(Tag::RepSuccessor, node(1), vec![]);

        assert!(matches!(
            SuccessorReply::from_envelope(&envelope),
            Err(Error::FieldDecode(_))
        ));
    }
}
