//! Wire-format message envelope routed between brokers, modules, and clients.
//!
//! Serialized with MessagePack, matching every other socket in the overlay
//! (parent, child, module inbox/outbox, local connector) so the framing is
//! identical regardless of which hop produced the bytes.

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Sentinel `nodeid` meaning "dispatch locally if possible, else forward
/// toward root".
pub const NODEID_ANY: u32 = u32::MAX;

/// Per-message flag bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Flags(pub u8);

impl Flags {
    pub const UPSTREAM: Flags = Flags(0b0001);
    pub const NORESPONSE: Flags = Flags(0b0010);
    pub const STREAMING: Flags = Flags(0b0100);
    /// Set on a RESPONSE whose payload is an [`ErrorPayload`] rather than
    /// the service's ordinary reply shape.
    pub const ERROR: Flags = Flags(0b1000);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }
}

/// The four message types the router dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    Response,
    Event,
    Keepalive,
}

/// A hop identifier accumulated on a route stack: either a broker rank
/// (decimal string bytes) or a module id (raw bytes). Opaque to everything
/// except the component that pushed it.
pub type RouteId = Vec<u8>;

/// The broker's wire message envelope (§3 DATA MODEL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,

    /// Hop-by-hop return path. REQUEST/RESPONSE only; always empty for
    /// EVENT/KEEPALIVE.
    #[serde(default)]
    pub route: Vec<RouteId>,

    /// Dotted `service[.verb]` topic string.
    pub topic: String,

    pub nodeid: u32,

    #[serde(default)]
    pub flags: Flags,

    pub matchtag: u32,

    pub userid: u32,
    pub rolemask: u32,

    /// Monotonic sequence number; EVENT only, otherwise 0.
    #[serde(default)]
    pub sequence: u32,

    /// Which locally-resident module's outbox this REQUEST came from, if
    /// any. Stamped by the router's module-outbox pump, never by a module
    /// itself; absent for anything arriving from the overlay or a local
    /// client. Built-ins that act "on behalf of the sending module"
    /// (`cmb.sub`/`cmb.unsub`) read this instead of trusting a
    /// caller-supplied id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_module: Option<u64>,

    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Role bit granted to broker-injected local traffic (§4.9.5).
pub const ROLE_OWNER: u32 = 0b1;

impl Message {
    /// Build a REQUEST with an empty route stack and a freshly encoded
    /// MessagePack payload.
    pub fn request<T: Serialize>(
        topic: impl Into<String>,
        nodeid: u32,
        matchtag: u32,
        payload: &T,
    ) -> Result<Self, BrokerError> {
        Ok(Self {
            msg_type: MessageType::Request,
            route: Vec::new(),
            topic: topic.into(),
            nodeid,
            flags: Flags::default(),
            matchtag,
            userid: 0,
            rolemask: 0,
            sequence: 0,
            origin_module: None,
            payload: rmp_serde::to_vec(payload)?,
        })
    }

    /// Build a RESPONSE to `request`, taking its route stack and matchtag.
    pub fn response_to<T: Serialize>(request: &Message, payload: &T) -> Result<Self, BrokerError> {
        Ok(Self {
            msg_type: MessageType::Response,
            route: request.route.clone(),
            topic: request.topic.clone(),
            nodeid: request.nodeid,
            flags: Flags::default(),
            matchtag: request.matchtag,
            userid: request.userid,
            rolemask: request.rolemask,
            sequence: 0,
            origin_module: None,
            payload: rmp_serde::to_vec(payload)?,
        })
    }

    /// Build an error RESPONSE carrying a `BrokerError`'s kind and message
    /// text as the payload (§7 error propagation, ERROR_MODE = RESPOND).
    pub fn error_response_to(request: &Message, err: &BrokerError) -> Result<Self, BrokerError> {
        let body = ErrorPayload {
            kind: err.kind().to_string(),
            reason: err.to_string(),
        };
        let mut resp = Self::response_to(request, &body)?;
        resp.flags.set(Flags::ERROR);
        Ok(resp)
    }

    pub fn event<T: Serialize>(topic: impl Into<String>, sequence: u32, payload: &T) -> Result<Self, BrokerError> {
        Ok(Self {
            msg_type: MessageType::Event,
            route: Vec::new(),
            topic: topic.into(),
            nodeid: NODEID_ANY,
            flags: Flags::default(),
            matchtag: 0,
            userid: 0,
            rolemask: 0,
            sequence,
            origin_module: None,
            payload: rmp_serde::to_vec(payload)?,
        })
    }

    /// Push a new hop onto the top of the route stack (push-on-turnaround,
    /// §9). Used exclusively by the router's REQUEST down-tree branch.
    pub fn push_route(&mut self, hop: RouteId) {
        self.route.push(hop);
    }

    /// Pop the most recently pushed hop (pop-on-arrival, §9). `None` means
    /// the message has unwound fully and is destined for a broker-resident
    /// service or the original requester.
    pub fn pop_route(&mut self) -> Option<RouteId> {
        self.route.pop()
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, BrokerError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BrokerError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BrokerError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// The topic's first dot-delimited component, used by the service
    /// switch (§4.2) for exact-match lookup.
    pub fn service_name(&self) -> &str {
        self.topic.split('.').next().unwrap_or(&self.topic)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub reason: String,
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

/// Decimal-string rank encoding used for broker-hop route identifiers,
/// e.g. rank 3 becomes `b"3"`.
pub fn rank_hop(rank: u32) -> RouteId {
    rank.to_string().into_bytes()
}

/// Parse a route hop previously built with [`rank_hop`] back into a rank,
/// if it looks like one (all ASCII digits).
pub fn hop_as_rank(hop: &[u8]) -> Option<u32> {
    std::str::from_utf8(hop).ok()?.parse().ok()
}

/// Raw-byte module-id encoding for a route hop that addresses a
/// locally-resident module directly rather than a broker rank. Never
/// confused with [`rank_hop`]: a rank hop is always valid ASCII digits,
/// this is a fixed 9-byte tag prefix that can't parse as one.
pub fn module_hop(id: u64) -> RouteId {
    let mut bytes = vec![0xffu8];
    bytes.extend_from_slice(&id.to_le_bytes());
    bytes
}

pub fn hop_as_module(hop: &[u8]) -> Option<u64> {
    if hop.len() == 9 && hop[0] == 0xff {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&hop[1..]);
        Some(u64::from_le_bytes(buf))
    } else {
        None
    }
}
