//! The contract between the core and generated message types. The code
//! generator that turns `.msg` / `.srv` schemas into implementations of these
//! traits is a separate concern; the core only ever works through them.

use bytes::{Buf, Bytes, BytesMut};
use std::fmt::Debug;

/// A typed message as emitted by the schema generator.
///
/// `md5sum` and `datatype` are stable for a given schema and are exchanged in
///  connection headers as a compatibility check before any payload is
///  deserialized.
pub trait RosMessage: Clone + Debug + Send + Sync + 'static {
    /// `"pkg/Name"`
    fn datatype() -> &'static str;

    /// hex fingerprint of the schema
    fn md5sum() -> &'static str;

    /// the full schema text, transmitted in the handshake so tools can
    ///  decode recorded traffic without the schema installed
    fn message_definition() -> &'static str;

    /// Exact serialized byte count of this value. For an all-fixed-size
    ///  schema this is a constant independent of the value.
    fn serialized_len(&self) -> usize;

    /// Serialization fails only on schema violations the generator cannot
    ///  rule out statically (fixed-size array length mismatches).
    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()>;

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self>;
}

/// A typed service: a request/response message pair with a joint fingerprint
///  (computed by the generator over the concatenated request and response
///  schema texts, no separator).
pub trait RosService: Send + Sync + 'static {
    type Request: RosMessage;
    type Response: RosMessage;

    fn datatype() -> &'static str;

    fn md5sum() -> &'static str;
}

/// Serialize a message into a payload ready for framing.
pub fn to_payload<M: RosMessage>(msg: &M) -> anyhow::Result<Bytes> {
    let mut buf = BytesMut::with_capacity(msg.serialized_len());
    msg.ser(&mut buf)?;
    Ok(buf.freeze())
}
