//! JSTP packet model and its wire representation.
//!
//! A packet travels as an ordered JSON array `[kind, index, ...payload]`
//! where the payload fields depend on the kind. Encoding and decoding
//! are pure; a malformed input never panics, it yields
//! [`JstpError::MalformedPacket`] and the caller drops the packet.

use serde_json::{json, Value};

use crate::types::{JstpError, RemoteError, SessionId};

/// Kind tag of a packet, the first element of the wire tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Handshake,
    HandshakeAck,
    Call,
    Callback,
    Event,
    Inspect,
    Ping,
    Pong,
}

impl PacketKind {
    pub fn tag(&self) -> &'static str {
        match self {
            PacketKind::Handshake => "handshake",
            PacketKind::HandshakeAck => "ack",
            PacketKind::Call => "call",
            PacketKind::Callback => "callback",
            PacketKind::Event => "event",
            PacketKind::Inspect => "inspect",
            PacketKind::Ping => "ping",
            PacketKind::Pong => "pong",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "handshake" => PacketKind::Handshake,
            "ack" => PacketKind::HandshakeAck,
            "call" => PacketKind::Call,
            "callback" => PacketKind::Callback,
            "event" => PacketKind::Event,
            "inspect" => PacketKind::Inspect,
            "ping" => PacketKind::Ping,
            "pong" => PacketKind::Pong,
            _ => return None,
        })
    }
}

/// One protocol packet.
///
/// `index` correlates a CALL with its eventual CALLBACK; indices are
/// scoped to a single connection instance and reset on rebind.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Client opening: start a fresh session or resume an existing one.
    Handshake {
        app: String,
        session: Option<SessionId>,
        username: Option<String>,
        password: Option<String>,
    },
    /// Server reply to a handshake, carrying the session id or the
    /// rejection error.
    HandshakeAck {
        index: u64,
        error: Option<RemoteError>,
        session_id: Option<SessionId>,
    },
    /// Remote method call; `method` is `"interface.method"`.
    Call {
        index: u64,
        method: String,
        args: Vec<Value>,
    },
    /// Reply to a CALL with the same index.
    Callback {
        index: u64,
        error: Option<RemoteError>,
        result: Option<Value>,
    },
    /// Fire-and-forget notification; no reply is expected.
    Event {
        index: u64,
        name: String,
        args: Vec<Value>,
    },
    /// Request the method list of an interface; answered by a CALLBACK.
    Inspect { index: u64, interface: String },
    Ping { index: u64 },
    Pong { index: u64 },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Handshake { .. } => PacketKind::Handshake,
            Packet::HandshakeAck { .. } => PacketKind::HandshakeAck,
            Packet::Call { .. } => PacketKind::Call,
            Packet::Callback { .. } => PacketKind::Callback,
            Packet::Event { .. } => PacketKind::Event,
            Packet::Inspect { .. } => PacketKind::Inspect,
            Packet::Ping { .. } => PacketKind::Ping,
            Packet::Pong { .. } => PacketKind::Pong,
        }
    }

    pub fn index(&self) -> u64 {
        match self {
            Packet::Handshake { .. } => crate::types::HANDSHAKE_INDEX,
            Packet::HandshakeAck { index, .. }
            | Packet::Call { index, .. }
            | Packet::Callback { index, .. }
            | Packet::Event { index, .. }
            | Packet::Inspect { index, .. }
            | Packet::Ping { index }
            | Packet::Pong { index } => *index,
        }
    }

    fn to_value(&self) -> Value {
        let tag = self.kind().tag();
        match self {
            Packet::Handshake {
                app,
                session,
                username,
                password,
            } => json!([
                tag,
                crate::types::HANDSHAKE_INDEX,
                app,
                session.as_ref().map(|s| &s.0),
                username,
                password
            ]),
            Packet::HandshakeAck {
                index,
                error,
                session_id,
            } => json!([
                tag,
                index,
                error.as_ref().map(RemoteError::to_value),
                session_id.as_ref().map(|s| &s.0)
            ]),
            Packet::Call {
                index,
                method,
                args,
            } => json!([tag, index, method, args]),
            Packet::Callback {
                index,
                error,
                result,
            } => json!([tag, index, error.as_ref().map(RemoteError::to_value), result]),
            Packet::Event { index, name, args } => json!([tag, index, name, args]),
            Packet::Inspect { index, interface } => json!([tag, index, interface]),
            Packet::Ping { index } => json!([tag, index]),
            Packet::Pong { index } => json!([tag, index]),
        }
    }
}

/// Serialize a packet to its wire bytes (JSON array, no trailing newline;
/// the codec adds the frame delimiter).
pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    packet.to_value().to_string().into_bytes()
}

/// Parse wire bytes into a packet.
///
/// Fails with [`JstpError::MalformedPacket`] on anything that is not the
/// expected tuple shape: non-array JSON, unknown kind tag, non-integer
/// index, missing payload fields.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, JstpError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| JstpError::MalformedPacket(format!("invalid json: {e}")))?;

    let fields = value
        .as_array()
        .ok_or_else(|| malformed("packet is not an array"))?;

    let tag = fields
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing kind tag"))?;
    let kind = PacketKind::from_tag(tag)
        .ok_or_else(|| malformed(&format!("unknown packet kind: {tag}")))?;

    let index = fields
        .get(1)
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("missing or non-integer index"))?;

    match kind {
        PacketKind::Handshake => Ok(Packet::Handshake {
            app: required_str(fields, 2, "application name")?,
            session: optional_str(fields, 3).map(SessionId),
            username: optional_str(fields, 4),
            password: optional_str(fields, 5),
        }),
        PacketKind::HandshakeAck => Ok(Packet::HandshakeAck {
            index,
            error: decode_error_field(fields, 2)?,
            session_id: optional_str(fields, 3).map(SessionId),
        }),
        PacketKind::Call => Ok(Packet::Call {
            index,
            method: required_str(fields, 2, "method path")?,
            args: required_args(fields, 3)?,
        }),
        PacketKind::Callback => Ok(Packet::Callback {
            index,
            error: decode_error_field(fields, 2)?,
            result: fields.get(3).filter(|v| !v.is_null()).cloned(),
        }),
        PacketKind::Event => Ok(Packet::Event {
            index,
            name: required_str(fields, 2, "event name")?,
            args: required_args(fields, 3)?,
        }),
        PacketKind::Inspect => Ok(Packet::Inspect {
            index,
            interface: required_str(fields, 2, "interface name")?,
        }),
        PacketKind::Ping => Ok(Packet::Ping { index }),
        PacketKind::Pong => Ok(Packet::Pong { index }),
    }
}

fn malformed(what: &str) -> JstpError {
    JstpError::MalformedPacket(what.to_owned())
}

fn required_str(fields: &[Value], at: usize, what: &str) -> Result<String, JstpError> {
    fields
        .get(at)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| malformed(&format!("missing {what}")))
}

fn optional_str(fields: &[Value], at: usize) -> Option<String> {
    fields.get(at).and_then(Value::as_str).map(str::to_owned)
}

fn required_args(fields: &[Value], at: usize) -> Result<Vec<Value>, JstpError> {
    match fields.get(at) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(args)) => Ok(args.clone()),
        Some(_) => Err(malformed("arguments are not an array")),
    }
}

fn decode_error_field(fields: &[Value], at: usize) -> Result<Option<RemoteError>, JstpError> {
    match fields.get(at) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => RemoteError::from_value(value)
            .map(Some)
            .ok_or_else(|| malformed("error field is not [code, message]")),
    }
}
