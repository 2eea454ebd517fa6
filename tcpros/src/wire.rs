//! Primitive codec for message fields. All numeric values are little-endian
//! fixed width; strings and variable-length arrays carry a u32 length prefix,
//! fixed-length arrays are laid out element by element with no prefix.
//!
//! Deserialization works on a caller-owned [Buf] cursor so that nested
//! message reads accumulate naturally.

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

/// A point in time as transmitted on the wire: two u32 words, seconds and
///  nanoseconds since the epoch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RosTime {
    pub secs: u32,
    pub nsecs: u32,
}
impl RosTime {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.secs);
        buf.put_u32_le(self.nsecs);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RosTime> {
        Ok(RosTime {
            secs: buf.try_get_u32_le()?,
            nsecs: buf.try_get_u32_le()?,
        })
    }
}

/// A signed span of time, same layout as [RosTime] but with signed words.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RosDuration {
    pub secs: i32,
    pub nsecs: i32,
}
impl RosDuration {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.secs);
        buf.put_i32_le(self.nsecs);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RosDuration> {
        Ok(RosDuration {
            secs: buf.try_get_i32_le()?,
            nsecs: buf.try_get_i32_le()?,
        })
    }
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

/// Any nonzero byte reads as `true` - some generators emit 0xFF.
pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    Ok(buf.try_get_u8()? != 0)
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_u32_le()? as usize;
    if buf.remaining() < len {
        bail!("string length {} exceeds remaining buffer ({})", len, buf.remaining());
    }
    let raw = buf.copy_to_bytes(len);
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

/// The serialized size of a string field, for `serialized_len` implementations.
pub fn string_len(s: &str) -> usize {
    4 + s.len()
}

/// Length prefix of a variable-length array.
pub fn put_array_len(buf: &mut BytesMut, len: usize) -> anyhow::Result<()> {
    if len > u32::MAX as usize {
        bail!("array of {} elements does not fit a u32 length prefix", len);
    }
    buf.put_u32_le(len as u32);
    Ok(())
}

pub fn try_get_array_len(buf: &mut impl Buf) -> anyhow::Result<usize> {
    Ok(buf.try_get_u32_le()? as usize)
}

/// Fixed-length arrays carry no length prefix, so a mismatch between the
///  value and the schema cannot be detected by the receiving side. Callers
///  must check before serializing any elements.
pub fn check_fixed_len(actual: usize, declared: usize) -> anyhow::Result<()> {
    if actual != declared {
        bail!("fixed-size array mismatch: value has {} elements, schema declares {}", actual, declared);
    }
    Ok(())
}

/// `uint8[]`: length prefix plus a bulk copy instead of per-element writes.
pub fn put_byte_array(buf: &mut BytesMut, bytes: &[u8]) -> anyhow::Result<()> {
    put_array_len(buf, bytes.len())?;
    buf.put_slice(bytes);
    Ok(())
}

pub fn try_get_byte_array(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
    let len = try_get_array_len(buf)?;
    try_get_raw(buf, len)
}

/// `uint8[N]`: bulk copy, no prefix.
pub fn put_fixed_byte_array(buf: &mut BytesMut, bytes: &[u8], declared: usize) -> anyhow::Result<()> {
    check_fixed_len(bytes.len(), declared)?;
    buf.put_slice(bytes);
    Ok(())
}

pub fn try_get_fixed_byte_array(buf: &mut impl Buf, declared: usize) -> anyhow::Result<Vec<u8>> {
    try_get_raw(buf, declared)
}

fn try_get_raw(buf: &mut impl Buf, len: usize) -> anyhow::Result<Vec<u8>> {
    if buf.remaining() < len {
        bail!("byte array length {} exceeds remaining buffer ({})", len, buf.remaining());
    }
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(RosTime { secs: 0, nsecs: 0 }, vec![0,0,0,0, 0,0,0,0])]
    #[case::simple(RosTime { secs: 1, nsecs: 2 }, vec![1,0,0,0, 2,0,0,0])]
    #[case::big(RosTime { secs: 0x0403_0201, nsecs: 0x0807_0605 }, vec![1,2,3,4, 5,6,7,8])]
    fn test_time_ser(#[case] time: RosTime, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        time.ser(&mut buf);
        assert_eq!(&buf, &expected);

        let mut b: &[u8] = &buf;
        let deser = RosTime::try_deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, time);
    }

    #[rstest]
    #[case::negative(RosDuration { secs: -1, nsecs: -500 })]
    #[case::positive(RosDuration { secs: 30, nsecs: 12345 })]
    fn test_duration_round_trip(#[case] duration: RosDuration) {
        let mut buf = BytesMut::new();
        duration.ser(&mut buf);
        assert_eq!(buf.len(), RosDuration::SERIALIZED_LEN);
        let mut b: &[u8] = &buf;
        assert_eq!(RosDuration::try_deser(&mut b).unwrap(), duration);
    }

    #[rstest]
    #[case::empty("", vec![0,0,0,0])]
    #[case::a("a", vec![1,0,0,0, 97])]
    #[case::abc("abc", vec![3,0,0,0, 97,98,99])]
    #[case::umlaut("ä", vec![2,0,0,0, 0xc3,0xa4])]
    fn test_put_string(#[case] s: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        assert_eq!(&buf, &expected);
        assert_eq!(buf.len(), string_len(s));

        let mut deser_buf: &[u8] = &buf;
        let deser = try_get_string(&mut deser_buf).unwrap();
        assert!(deser_buf.is_empty());
        assert_eq!(&deser, s);
    }

    #[test]
    fn test_try_get_string_remaining() {
        let mut buf: &[u8] = b"\x01\0\0\0abc";
        let actual = try_get_string(&mut buf).unwrap();
        assert_eq!(&actual, "a");
        assert_eq!(buf, b"bc");
    }

    #[test]
    fn test_try_get_string_too_short() {
        let mut buf: &[u8] = b"\x05\0\0\0ab";
        assert!(try_get_string(&mut buf).is_err());
    }

    #[test]
    fn test_try_get_string_not_unicode() {
        let mut buf: &[u8] = b"\x02\0\0\0\xc0\xaf";
        assert!(try_get_string(&mut buf).is_err());
    }

    #[rstest]
    #[case::true_byte(1, true)]
    #[case::false_byte(0, false)]
    #[case::nonzero(0xff, true)]
    fn test_try_get_bool(#[case] byte: u8, #[case] expected: bool) {
        let mut buf: &[u8] = &[byte];
        assert_eq!(try_get_bool(&mut buf).unwrap(), expected);
    }

    #[rstest]
    #[case::matching(3, 3, true)]
    #[case::too_few(2, 3, false)]
    #[case::too_many(4, 3, false)]
    fn test_check_fixed_len(#[case] actual: usize, #[case] declared: usize, #[case] ok: bool) {
        assert_eq!(check_fixed_len(actual, declared).is_ok(), ok);
    }

    #[test]
    fn test_byte_array_round_trip() {
        let mut buf = BytesMut::new();
        put_byte_array(&mut buf, &[9, 8, 7]).unwrap();
        assert_eq!(&buf[..], &[3, 0, 0, 0, 9, 8, 7]);

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_byte_array(&mut b).unwrap(), vec![9, 8, 7]);
        assert!(b.is_empty());
    }

    #[test]
    fn test_fixed_byte_array_mismatch_rejected() {
        let mut buf = BytesMut::new();
        assert!(put_fixed_byte_array(&mut buf, &[1, 2], 3).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fixed_byte_array_round_trip() {
        let mut buf = BytesMut::new();
        put_fixed_byte_array(&mut buf, &[1, 2, 3], 3).unwrap();
        assert_eq!(&buf[..], &[1, 2, 3]);

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_fixed_byte_array(&mut b, 3).unwrap(), vec![1, 2, 3]);
    }
}
