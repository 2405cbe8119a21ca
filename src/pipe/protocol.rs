//! Frames exchanged on a pipe's connections. Every accepted connection starts with a [Hello]
//!  that tells the listener what it is for; after that, the primary connection carries
//!  [Packet]s.

use std::collections::BTreeMap;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::pipe::message::Domain;
use crate::pipe::registry::BackendRegistry;
use crate::util::buf::{put_bool, put_bytes, put_string, try_get_bool, try_get_bytes, try_get_string};

pub(crate) const PROTOCOL_VERSION_1: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum HelloKind {
    Primary = 1,
    ConnectionRequest = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Hello {
    /// a client opens a new pipe
    Primary,
    /// auxiliary connection for a pending connection request
    ConnectionRequest(u64),
}

impl Hello {
    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        buf.put_u8(PROTOCOL_VERSION_1);
        match self {
            Hello::Primary => buf.put_u8(HelloKind::Primary.into()),
            Hello::ConnectionRequest(id) => {
                buf.put_u8(HelloKind::ConnectionRequest.into());
                buf.put_u64(*id);
            }
        }
        buf.freeze()
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<Hello> {
        let version = buf.try_get_u8()?;
        if version != PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", version);
        }
        let result = match HelloKind::try_from(buf.try_get_u8()?)? {
            HelloKind::Primary => Hello::Primary,
            HelloKind::ConnectionRequest => Hello::ConnectionRequest(buf.try_get_u64()?),
        };
        ensure_consumed(buf)?;
        Ok(result)
    }
}

/// A backend as offered to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Offer {
    pub name: String,
    pub domain_descriptor: String,
}

impl Offer {
    pub fn new(name: impl Into<String>, domain_descriptor: impl Into<String>) -> Offer {
        Offer {
            name: name.into(),
            domain_descriptor: domain_descriptor.into(),
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.name);
        put_string(buf, &self.domain_descriptor);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<Offer> {
        let name = try_get_string(buf)?;
        let domain_descriptor = try_get_string(buf)?;
        Ok(Offer { name, domain_descriptor })
    }
}

fn ser_offers(buf: &mut BytesMut, offers: &[Offer]) {
    buf.put_usize_varint(offers.len());
    for offer in offers {
        offer.ser(buf);
    }
}

fn deser_offers(buf: &mut impl Buf) -> anyhow::Result<Vec<Offer>> {
    let len = buf.try_get_usize_varint()?;
    let mut result = Vec::new();
    for _ in 0..len {
        result.push(Offer::deser(buf)?);
    }
    Ok(result)
}

/// The client's capabilities, each list ordered by the client's preference
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Brochure {
    pub context_name: String,
    pub transports: Vec<Offer>,
    pub channels: BTreeMap<Domain, Vec<Offer>>,
}

impl Brochure {
    /// Lists everything in `registry` in priority order, but only those transports that
    ///  `include_transport` accepts
    pub fn from_registry(context_name: &str, registry: &BackendRegistry, include_transport: impl Fn(&str) -> bool) -> Brochure {
        let transports = registry.transports()
            .filter(|(descriptor, _)| include_transport(&descriptor.name))
            .map(|(descriptor, transport)| Offer::new(&descriptor.name, transport.domain_descriptor()))
            .collect();

        let mut channels: BTreeMap<Domain, Vec<Offer>> = BTreeMap::new();
        for (descriptor, channel) in registry.channels() {
            for domain in &descriptor.domains {
                channels.entry(domain.clone())
                    .or_default()
                    .push(Offer::new(&descriptor.name, channel.domain_descriptor()));
            }
        }

        Brochure {
            context_name: context_name.to_string(),
            transports,
            channels,
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.context_name);
        ser_offers(buf, &self.transports);
        buf.put_usize_varint(self.channels.len());
        for (domain, offers) in &self.channels {
            put_string(buf, domain.name());
            ser_offers(buf, offers);
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<Brochure> {
        let context_name = try_get_string(buf)?;
        let transports = deser_offers(buf)?;

        let num_domains = buf.try_get_usize_varint()?;
        let mut channels = BTreeMap::new();
        for _ in 0..num_domains {
            let domain = Domain::new(try_get_string(buf)?);
            let offers = deser_offers(buf)?;
            if channels.insert(domain.clone(), offers).is_some() {
                bail!("domain {} is listed twice", domain);
            }
        }

        Ok(Brochure {
            context_name,
            transports,
            channels,
        })
    }
}

/// An auxiliary connection the server waits for: the client connects to `address` (using the
///  negotiated transport) and sends `id` in its hello frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectionRequest {
    pub address: String,
    pub id: u64,
}

impl ConnectionRequest {
    fn ser_opt(request: &Option<ConnectionRequest>, buf: &mut BytesMut) {
        put_bool(buf, request.is_some());
        if let Some(request) = request {
            put_string(buf, &request.address);
            buf.put_u64(request.id);
        }
    }

    fn deser_opt(buf: &mut impl Buf) -> anyhow::Result<Option<ConnectionRequest>> {
        if !try_get_bool(buf)? {
            return Ok(None);
        }
        let address = try_get_string(buf)?;
        let id = buf.try_get_u64()?;
        Ok(Some(ConnectionRequest { address, id }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChannelSelection {
    pub channel: String,
    pub connection: Option<ConnectionRequest>,
}

/// The server's decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Allowance {
    pub context_name: String,
    pub transport: String,
    /// present if the pipe has to move its primary connection to a different transport
    pub transport_switch: Option<ConnectionRequest>,
    pub channels: BTreeMap<Domain, ChannelSelection>,
}

impl Allowance {
    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.context_name);
        put_string(buf, &self.transport);
        ConnectionRequest::ser_opt(&self.transport_switch, buf);
        buf.put_usize_varint(self.channels.len());
        for (domain, selection) in &self.channels {
            put_string(buf, domain.name());
            put_string(buf, &selection.channel);
            ConnectionRequest::ser_opt(&selection.connection, buf);
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<Allowance> {
        let context_name = try_get_string(buf)?;
        let transport = try_get_string(buf)?;
        let transport_switch = ConnectionRequest::deser_opt(buf)?;

        let num_channels = buf.try_get_usize_varint()?;
        let mut channels = BTreeMap::new();
        for _ in 0..num_channels {
            let domain = Domain::new(try_get_string(buf)?);
            let channel = try_get_string(buf)?;
            let connection = ConnectionRequest::deser_opt(buf)?;
            if channels.insert(domain.clone(), ChannelSelection { channel, connection }).is_some() {
                bail!("domain {} is listed twice", domain);
            }
        }

        Ok(Allowance {
            context_name,
            transport,
            transport_switch,
            channels,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TensorDescriptor {
    pub domain: Domain,
    pub length: u64,
    pub channel_descriptor: Bytes,
}

/// Header of a message, sent on the primary connection; the tensors' data follows through
///  their channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MessageDescriptor {
    pub metadata: Bytes,
    pub tensors: Vec<TensorDescriptor>,
}

impl MessageDescriptor {
    fn ser(&self, buf: &mut BytesMut) {
        put_bytes(buf, &self.metadata);
        buf.put_usize_varint(self.tensors.len());
        for tensor in &self.tensors {
            put_string(buf, tensor.domain.name());
            buf.put_u64(tensor.length);
            put_bytes(buf, &tensor.channel_descriptor);
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageDescriptor> {
        let metadata = try_get_bytes(buf)?;
        let num_tensors = buf.try_get_usize_varint()?;
        let mut tensors = Vec::new();
        for _ in 0..num_tensors {
            let domain = Domain::new(try_get_string(buf)?);
            let length = buf.try_get_u64()?;
            let channel_descriptor = try_get_bytes(buf)?;
            tensors.push(TensorDescriptor { domain, length, channel_descriptor });
        }
        Ok(MessageDescriptor { metadata, tensors })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum PacketKind {
    Brochure = 1,
    Allowance = 2,
    HandshakeFailure = 3,
    Message = 4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Packet {
    Brochure(Brochure),
    Allowance(Allowance),
    /// The server could not agree to the client's brochure, with a human-readable reason
    HandshakeFailure(String),
    Message(MessageDescriptor),
}

impl Packet {
    fn kind(&self) -> PacketKind {
        match self {
            Packet::Brochure(_) => PacketKind::Brochure,
            Packet::Allowance(_) => PacketKind::Allowance,
            Packet::HandshakeFailure(_) => PacketKind::HandshakeFailure,
            Packet::Message(_) => PacketKind::Message,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::Brochure(_) => "brochure",
            Packet::Allowance(_) => "allowance",
            Packet::HandshakeFailure(_) => "handshake failure",
            Packet::Message(_) => "message",
        }
    }

    pub fn ser(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.kind().into());
        match self {
            Packet::Brochure(brochure) => brochure.ser(&mut buf),
            Packet::Allowance(allowance) => allowance.ser(&mut buf),
            Packet::HandshakeFailure(reason) => put_string(&mut buf, reason),
            Packet::Message(descriptor) => descriptor.ser(&mut buf),
        }
        buf.freeze()
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<Packet> {
        let result = match PacketKind::try_from(buf.try_get_u8()?)? {
            PacketKind::Brochure => Packet::Brochure(Brochure::deser(&mut buf)?),
            PacketKind::Allowance => Packet::Allowance(Allowance::deser(&mut buf)?),
            PacketKind::HandshakeFailure => Packet::HandshakeFailure(try_get_string(&mut buf)?),
            PacketKind::Message => Packet::Message(MessageDescriptor::deser(&mut buf)?),
        };
        ensure_consumed(buf)?;
        Ok(result)
    }
}

fn ensure_consumed(buf: &[u8]) -> anyhow::Result<()> {
    if !buf.is_empty() {
        bail!("{} unexpected trailing bytes", buf.len());
    }
    Ok(())
}
