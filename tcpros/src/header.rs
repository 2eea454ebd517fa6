//! The key=value connection header exchanged once in each direction when a
//! peer connection is opened, and the validation rules both sides apply to
//! it before any payload flows.
//!
//! On the wire a header is a frame (see [crate::framing]) whose payload is a
//! sequence of u32-little-endian length-prefixed `key=value` ASCII strings.
//! Unknown keys are preserved and never rejected.

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::wire;

pub const KEY_CALLER_ID: &str = "callerid";
pub const KEY_MD5_SUM: &str = "md5sum";
pub const KEY_TOPIC: &str = "topic";
pub const KEY_SERVICE: &str = "service";
pub const KEY_TYPE: &str = "type";
pub const KEY_LATCHING: &str = "latching";
pub const KEY_PERSISTENT: &str = "persistent";
pub const KEY_TCP_NODELAY: &str = "tcp_nodelay";
pub const KEY_MESSAGE_DEFINITION: &str = "message_definition";
pub const KEY_ERROR: &str = "error";

/// Either side may send `*` for `type` or `md5sum` to opt out of the
///  compatibility check (generic probes do this).
pub const WILDCARD: &str = "*";

/// An ordered collection of header fields. Order is preserved so a header
///  round-trips byte-identically; lookups are linear, headers have a handful
///  of fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionHeader {
    fields: Vec<(String, String)>,
}

impl ConnectionHeader {
    pub fn new() -> ConnectionHeader {
        ConnectionHeader::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> ConnectionHeader {
        self.fields.push((key.to_string(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn caller_id(&self) -> Option<&str> { self.get(KEY_CALLER_ID) }
    pub fn md5sum(&self) -> Option<&str> { self.get(KEY_MD5_SUM) }
    pub fn topic(&self) -> Option<&str> { self.get(KEY_TOPIC) }
    pub fn service(&self) -> Option<&str> { self.get(KEY_SERVICE) }
    pub fn datatype(&self) -> Option<&str> { self.get(KEY_TYPE) }
    pub fn error(&self) -> Option<&str> { self.get(KEY_ERROR) }

    pub fn latching(&self) -> bool { self.flag(KEY_LATCHING) }
    pub fn persistent(&self) -> bool { self.flag(KEY_PERSISTENT) }
    pub fn tcp_nodelay(&self) -> bool { self.flag(KEY_TCP_NODELAY) }

    fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("1")
    }

    /// Serialize the field sequence. The outer length prefix is the frame
    ///  envelope and is added by [crate::framing::write_frame].
    pub fn ser_fields(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        for (key, value) in &self.fields {
            buf.put_u32_le((key.len() + 1 + value.len()) as u32);
            buf.put_slice(key.as_bytes());
            buf.put_u8(b'=');
            buf.put_slice(value.as_bytes());
        }
        buf
    }

    /// Parse a header from a frame payload. A field without `=` is malformed;
    ///  a value may itself contain `=`, the split is on the first occurrence.
    pub fn try_parse(payload: &[u8]) -> anyhow::Result<ConnectionHeader> {
        let buf = &mut &payload[..];
        let mut fields = Vec::new();
        while buf.has_remaining() {
            let field = wire::try_get_string(buf)?;
            match field.split_once('=') {
                Some((key, value)) => fields.push((key.to_string(), value.to_string())),
                None => bail!("malformed connection header field without '=': {:?}", field),
            }
        }
        Ok(ConnectionHeader { fields })
    }

    // -- the four handshake directions ---------------------------------------------------------

    pub fn for_subscription(caller_id: &str, topic: &str, datatype: &str, md5sum: &str, message_definition: &str, tcp_nodelay: bool) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(KEY_CALLER_ID, caller_id)
            .with(KEY_TOPIC, topic)
            .with(KEY_TYPE, datatype)
            .with(KEY_MD5_SUM, md5sum)
            .with(KEY_MESSAGE_DEFINITION, message_definition)
            .with(KEY_TCP_NODELAY, if tcp_nodelay { "1" } else { "0" })
    }

    pub fn for_publisher_reply(caller_id: &str, datatype: &str, md5sum: &str, message_definition: &str, latching: bool) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(KEY_CALLER_ID, caller_id)
            .with(KEY_TYPE, datatype)
            .with(KEY_MD5_SUM, md5sum)
            .with(KEY_MESSAGE_DEFINITION, message_definition)
            .with(KEY_LATCHING, if latching { "1" } else { "0" })
    }

    pub fn for_service_call(caller_id: &str, service: &str, md5sum: &str, persistent: bool) -> ConnectionHeader {
        let header = ConnectionHeader::new()
            .with(KEY_CALLER_ID, caller_id)
            .with(KEY_SERVICE, service)
            .with(KEY_MD5_SUM, md5sum);
        if persistent {
            header.with(KEY_PERSISTENT, "1")
        } else {
            header
        }
    }

    pub fn for_service_reply(caller_id: &str, datatype: &str, md5sum: &str) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(KEY_CALLER_ID, caller_id)
            .with(KEY_TYPE, datatype)
            .with(KEY_MD5_SUM, md5sum)
    }

    /// The header a peer sends instead of its regular reply when it rejects
    ///  the connection; the connection is closed right after.
    pub fn for_error(text: &str) -> ConnectionHeader {
        ConnectionHeader::new().with(KEY_ERROR, text)
    }
}

fn md5_matches(theirs: &str, ours: &str) -> bool {
    theirs == ours || theirs == WILDCARD || ours == WILDCARD
}

/// Publisher-side check of an inbound subscriber header. `Err` carries the
///  text to send back as an `error=` header before closing.
pub fn validate_subscriber_header(header: &ConnectionHeader, topic: &str, md5sum: &str) -> Result<(), String> {
    let their_topic = match header.topic() {
        Some(t) => t,
        None => return Err("connection header is missing required key 'topic'".to_string()),
    };
    if header.datatype().is_none() {
        return Err("connection header is missing required key 'type'".to_string());
    }
    let their_md5 = match header.md5sum() {
        Some(m) => m,
        None => return Err("connection header is missing required key 'md5sum'".to_string()),
    };

    if their_topic != topic {
        return Err(format!("topic mismatch: connection requested {:?}, this endpoint publishes {:?}", their_topic, topic));
    }
    if !md5_matches(their_md5, md5sum) {
        return Err(format!("md5sum mismatch for topic {:?}: {} vs {}", topic, their_md5, md5sum));
    }
    Ok(())
}

/// Subscriber-side check of the publisher's reply header, the symmetric rule.
pub fn validate_publisher_reply(header: &ConnectionHeader, md5sum: &str) -> Result<(), String> {
    if let Some(error) = header.error() {
        return Err(format!("publisher rejected the connection: {}", error));
    }
    if header.datatype().is_none() {
        return Err("publisher reply is missing required key 'type'".to_string());
    }
    let their_md5 = match header.md5sum() {
        Some(m) => m,
        None => return Err("publisher reply is missing required key 'md5sum'".to_string()),
    };
    if !md5_matches(their_md5, md5sum) {
        return Err(format!("md5sum mismatch: publisher sent {}, subscriber expects {}", their_md5, md5sum));
    }
    Ok(())
}

/// Service-server-side check of an inbound client header.
pub fn validate_service_header(header: &ConnectionHeader, service: &str, md5sum: &str) -> Result<(), String> {
    let their_service = match header.service() {
        Some(s) => s,
        None => return Err("connection header is missing required key 'service'".to_string()),
    };
    let their_md5 = match header.md5sum() {
        Some(m) => m,
        None => return Err("connection header is missing required key 'md5sum'".to_string()),
    };
    if their_service != service {
        return Err(format!("service mismatch: connection requested {:?}, this endpoint serves {:?}", their_service, service));
    }
    if !md5_matches(their_md5, md5sum) {
        return Err(format!("md5sum mismatch for service {:?}: {} vs {}", service, their_md5, md5sum));
    }
    Ok(())
}

/// Service-client-side check of the server's reply header.
pub fn validate_service_reply(header: &ConnectionHeader, md5sum: &str) -> Result<(), String> {
    if let Some(error) = header.error() {
        return Err(format!("service server rejected the connection: {}", error));
    }
    let their_md5 = match header.md5sum() {
        Some(m) => m,
        None => return Err("service reply is missing required key 'md5sum'".to_string()),
    };
    if !md5_matches(their_md5, md5sum) {
        return Err(format!("md5sum mismatch: server sent {}, client expects {}", their_md5, md5sum));
    }
    Ok(())
}
