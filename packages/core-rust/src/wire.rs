//! Wire framing: the 12-byte message header, payload field codecs, and
//! the canonical command code table (spec §6).

use crate::error::CoreError;

/// Size in bytes of the fixed message header.
pub const HEADER_LEN: usize = 12;

/// Canonical numeric command/response codes, preserved for wire
/// compatibility with the original protocol.
pub mod command {
    pub const ACK: u16 = 1;
    pub const UNKNOWN: u16 = 9;
    pub const HELLO: u16 = 10;
    pub const SHUTTINGDOWN: u16 = 15;
    pub const PING: u16 = 30;
    pub const SERVERHELLO: u16 = 50;
    pub const HASHMASK: u16 = 120;
    pub const LOADLEVELS: u16 = 200;
    pub const REPLY_LOADLEVELS: u16 = 210;
    pub const ACCEPT_BUCKET: u16 = 300;
    pub const REPLY_CANT_ACCEPT_BUCKET: u16 = 305;
    pub const REPLY_ACCEPTING_BUCKET: u16 = 310;
    pub const CONTROL_BUCKET: u16 = 320;
    pub const REPLY_CONTROL_BUCKET_COMPLETE: u16 = 330;
    pub const REPLY_CONTROL_BUCKET_FAILED: u16 = 335;
    pub const FINALISE_MIGRATION: u16 = 400;
    pub const SET_INT: u16 = 2000;
    pub const SET_STR: u16 = 2020;
    pub const GET_INT: u16 = 2100;
    pub const REPLY_DATA_INT: u16 = 2105;
    /// Not present in the archived protocol, which resolves routing
    /// misses by inference from the connection rather than a dedicated
    /// reply. Added to carry the known owner's conninfo back to a client
    /// that addressed a bucket this node doesn't hold at `level=0`
    /// (spec's redirect requirement); placed in the unused gap between
    /// `REPLY_DATA_INT` and `GET_STR`.
    pub const REPLY_REDIRECT: u16 = 2110;
    pub const GET_STR: u16 = 2120;
    pub const REPLY_DATA_STR: u16 = 2125;
    /// Not present under a distinct code in the archived protocol
    /// headers; spec §6 groups `SYNC_INT`/`SYNC_STRING` under a shared
    /// `3000`. Split here the same way `SET_INT`/`SET_STR` and
    /// `GET_INT`/`GET_STR` are split, by a fixed offset, so each has an
    /// unambiguous code: `SYNC_INT = 3000`, `SYNC_STRING = 3010`,
    /// `SYNC_KEYVALUE = 3020` (matching spec's own `3020`).
    pub const SYNC_INT: u16 = 3000;
    pub const SYNC_STRING: u16 = 3010;
    pub const SYNC_KEYVALUE: u16 = 3020;
}

/// The fixed 12-byte message header: `{command, response_code, userid,
/// length}`, all big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    pub response_code: u16,
    pub userid: u32,
    pub length: u32,
}

impl Header {
    #[must_use]
    pub const fn request(command: u16, userid: u32, length: u32) -> Self {
        Self { command, response_code: 0, userid, length }
    }

    #[must_use]
    pub const fn reply(command: u16, response_code: u16, userid: u32, length: u32) -> Self {
        Self { command, response_code, userid, length }
    }

    /// A message is a request when `response_code == 0`.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        self.response_code == 0
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.command.to_be_bytes());
        buf[2..4].copy_from_slice(&self.response_code.to_be_bytes());
        buf[4..8].copy_from_slice(&self.userid.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CoreError> {
        if buf.len() < HEADER_LEN {
            return Err(CoreError::MalformedFrame("header shorter than 12 bytes"));
        }
        Ok(Self {
            command: u16::from_be_bytes([buf[0], buf[1]]),
            response_code: u16::from_be_bytes([buf[2], buf[3]]),
            userid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

/// Reads fixed-width payload fields (`int`/`long`/`string`) out of a
/// payload buffer in the order the protocol defines them, per spec §6:
/// `int` = big-endian 32-bit, `long` = big-endian 64-bit, `string/blob`
/// = 32-bit length prefix followed by bytes.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_int(&mut self) -> Result<i32, CoreError> {
        self.take(4).map(|b| i32::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_long(&mut self) -> Result<i64, CoreError> {
        self.take(8).map(|b| i64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_string(&mut self) -> Result<Vec<u8>, CoreError> {
        let len = self.read_int()?;
        let len = u32::try_from(len).map_err(|_| CoreError::MalformedFrame("negative string length"))?;
        let bytes = self.take(len as usize)?;
        Ok(bytes.to_vec())
    }

    /// Remaining unread bytes.
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        let end = self.pos.checked_add(n).ok_or(CoreError::MalformedFrame("payload field overflow"))?;
        if end > self.buf.len() {
            return Err(CoreError::MalformedFrame("payload field exceeds buffer length"));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

/// Writes fixed-width payload fields, growing the buffer as it goes.
#[derive(Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_int(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_long(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn write_string(&mut self, value: &[u8]) -> &mut Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        self.write_int(value.len() as i32);
        self.buf.extend_from_slice(value);
        self
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = Header::reply(command::REPLY_DATA_INT, 1, 42, 8);
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(Header::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn request_has_zero_response_code() {
        let header = Header::request(command::PING, 1, 0);
        assert!(header.is_request());
        let reply = Header::reply(command::PING, command::ACK, 1, 0);
        assert!(!reply.is_request());
    }

    #[test]
    fn payload_round_trips_mixed_fields() {
        let mut writer = PayloadWriter::new();
        writer.write_long(0x1122_3344_5566_7788).write_int(-7).write_string(b"hello");
        let bytes = writer.into_bytes();

        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(reader.read_long().unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(reader.read_int().unwrap(), -7);
        assert_eq!(reader.read_string().unwrap(), b"hello");
        assert!(reader.remaining().is_empty());
    }

    #[test]
    fn read_past_end_is_an_error() {
        let mut reader = PayloadReader::new(&[0u8; 2]);
        assert!(reader.read_int().is_err());
    }

    #[test]
    fn string_length_prefix_exceeding_buffer_is_an_error() {
        let mut writer = PayloadWriter::new();
        writer.write_int(100);
        let bytes = writer.into_bytes();
        let mut reader = PayloadReader::new(&bytes);
        assert!(reader.read_string().is_err());
    }
}
