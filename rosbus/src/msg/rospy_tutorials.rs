use bytes::{Buf, BufMut, BytesMut};
use tcpros::message::{RosMessage, RosService};

/// `rospy_tutorials/AddTwoInts`
pub enum AddTwoInts {}

const ADD_TWO_INTS_MD5: &str = "6a2e34150c00229791cc89ff309fff21";

impl RosService for AddTwoInts {
    type Request = AddTwoIntsRequest;
    type Response = AddTwoIntsResponse;

    fn datatype() -> &'static str {
        "rospy_tutorials/AddTwoInts"
    }

    fn md5sum() -> &'static str {
        ADD_TWO_INTS_MD5
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddTwoIntsRequest {
    pub a: i64,
    pub b: i64,
}

impl RosMessage for AddTwoIntsRequest {
    fn datatype() -> &'static str {
        "rospy_tutorials/AddTwoIntsRequest"
    }

    fn md5sum() -> &'static str {
        "36d09b846be0b371c5f190354dd3153e"
    }

    fn message_definition() -> &'static str {
        "int64 a\nint64 b\n"
    }

    fn serialized_len(&self) -> usize {
        16
    }

    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_i64_le(self.a);
        buf.put_i64_le(self.b);
        Ok(())
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(AddTwoIntsRequest {
            a: buf.try_get_i64_le()?,
            b: buf.try_get_i64_le()?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddTwoIntsResponse {
    pub sum: i64,
}

impl RosMessage for AddTwoIntsResponse {
    fn datatype() -> &'static str {
        "rospy_tutorials/AddTwoIntsResponse"
    }

    fn md5sum() -> &'static str {
        "b88405221c77b1878a3cbbfff53428d7"
    }

    fn message_definition() -> &'static str {
        "int64 sum\n"
    }

    fn serialized_len(&self) -> usize {
        8
    }

    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_i64_le(self.sum);
        Ok(())
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(AddTwoIntsResponse {
            sum: buf.try_get_i64_le()?,
        })
    }
}
