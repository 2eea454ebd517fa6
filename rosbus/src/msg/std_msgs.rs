use bytes::{Buf, BufMut, BytesMut};
use tcpros::message::RosMessage;
use tcpros::wire;

/// `std_msgs/String`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct String {
    pub data: std::string::String,
}

impl RosMessage for String {
    fn datatype() -> &'static str {
        "std_msgs/String"
    }

    fn md5sum() -> &'static str {
        "992ce8a1687cec8c8bd883ec73ca41d1"
    }

    fn message_definition() -> &'static str {
        "string data\n"
    }

    fn serialized_len(&self) -> usize {
        wire::string_len(&self.data)
    }

    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        wire::put_string(buf, &self.data);
        Ok(())
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(String {
            data: wire::try_get_string(buf)?,
        })
    }
}

/// `std_msgs/Int32`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Int32 {
    pub data: i32,
}

impl RosMessage for Int32 {
    fn datatype() -> &'static str {
        "std_msgs/Int32"
    }

    fn md5sum() -> &'static str {
        "da5909fbe378aeaf85e547e830cc1bb7"
    }

    fn message_definition() -> &'static str {
        "int32 data\n"
    }

    fn serialized_len(&self) -> usize {
        4
    }

    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_i32_le(self.data);
        Ok(())
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(Int32 {
            data: buf.try_get_i32_le()?,
        })
    }
}
