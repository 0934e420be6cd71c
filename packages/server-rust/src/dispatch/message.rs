//! Typed command/response payloads (spec §6), decoded from and encoded
//! to a [`crate::dispatch::codec::Frame`].

use opencluster_core::{command, Header, PayloadReader, PayloadWriter};

use crate::dispatch::codec::Frame;
use crate::error::DispatchError;

/// Every message the protocol defines, decoded from its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello,
    ShuttingDown,
    Ping,
    ServerHello { conninfo: String, secret: Vec<u8> },
    Hashmask { mask: u64, index: u64, level: i32 },
    Loadlevels,
    LoadlevelsReply { primary: i32, secondary: i32, transferring: i32 },
    AcceptBucket { mask: u64, index: u64 },
    CantAcceptBucket,
    AcceptingBucket,
    ControlBucket { mask: u64, index: u64, level: i32, peer_conninfo: String },
    ControlBucketComplete { mask: u64, index: u64 },
    ControlBucketFailed { mask: u64, index: u64 },
    FinaliseMigration { mask: u64, index: u64, level: i32, conninfo: String },
    SetInt { map: u64, key: u64, expires: i32, fullwait: i32, label: Vec<u8>, value: i32 },
    SetStr { map: u64, key: u64, expires: i32, fullwait: i32, label: Vec<u8>, value: Vec<u8> },
    GetInt { map: u64, key: u64 },
    GetStr { map: u64, key: u64 },
    DataInt { map: u64, key: u64, value: i32 },
    DataStr { map: u64, key: u64, value: Vec<u8> },
    SyncInt { map: u64, key: u64, expires: i32, value: i32 },
    SyncString { map: u64, key: u64, expires: i32, value: Vec<u8> },
    SyncKeyValue { key: u64, expires: i32, label: Vec<u8> },
    Ack,
    /// A generic failure reply with no specific payload (spec §7
    /// "routing error... if the owner is unknown, reply with a generic
    /// failure").
    Fail,
    /// Reply to a `GET`/`SET` addressed to a bucket this node does not
    /// hold at `level=0`: the known owner's conninfo, read out of the
    /// local hashmask table (spec §7 "routing error").
    Redirect { map: u64, key: u64, conninfo: String },
    Unknown { code: u16 },
}

#[allow(clippy::cast_sign_loss)]
fn as_u64(v: i64) -> u64 {
    v as u64
}

#[allow(clippy::cast_possible_wrap)]
fn as_i64(v: u64) -> i64 {
    v as i64
}

impl Message {
    /// Decodes a frame's payload according to its header's command
    /// code. Unrecognized codes decode to [`Message::Unknown`] rather
    /// than erroring -- spec §7 treats an unknown *command* as a
    /// forward-compatibility signal, not malformed input. Only a
    /// payload that is shorter than the fields a *known* command
    /// requires is [`DispatchError::MalformedFrame`].
    pub fn decode(header: &Header, payload: &[u8]) -> Result<Self, DispatchError> {
        let mut r = PayloadReader::new(payload);
        let err = |e: opencluster_core::CoreError| DispatchError::MalformedFrame(e.to_string());
        Ok(match header.command {
            command::HELLO => Self::Hello,
            command::SHUTTINGDOWN => Self::ShuttingDown,
            command::PING if header.is_request() => Self::Ping,
            command::PING => Self::Ack,
            command::ACK => Self::Ack,
            command::UNKNOWN => Self::Unknown { code: header.command },
            command::SERVERHELLO => {
                let conninfo = String::from_utf8_lossy(&r.read_string().map_err(err)?).into_owned();
                let secret = r.read_string().map_err(err)?;
                Self::ServerHello { conninfo, secret }
            }
            command::HASHMASK => Self::Hashmask {
                mask: as_u64(r.read_long().map_err(err)?),
                index: as_u64(r.read_long().map_err(err)?),
                level: r.read_int().map_err(err)?,
            },
            command::LOADLEVELS if header.is_request() => Self::Loadlevels,
            command::REPLY_LOADLEVELS => Self::LoadlevelsReply {
                primary: r.read_int().map_err(err)?,
                secondary: r.read_int().map_err(err)?,
                transferring: r.read_int().map_err(err)?,
            },
            command::ACCEPT_BUCKET => Self::AcceptBucket {
                mask: as_u64(r.read_long().map_err(err)?),
                index: as_u64(r.read_long().map_err(err)?),
            },
            command::REPLY_CANT_ACCEPT_BUCKET => Self::CantAcceptBucket,
            command::REPLY_ACCEPTING_BUCKET => Self::AcceptingBucket,
            command::CONTROL_BUCKET => Self::ControlBucket {
                mask: as_u64(r.read_long().map_err(err)?),
                index: as_u64(r.read_long().map_err(err)?),
                level: r.read_int().map_err(err)?,
                peer_conninfo: String::from_utf8_lossy(&r.read_string().map_err(err)?).into_owned(),
            },
            command::REPLY_CONTROL_BUCKET_COMPLETE => Self::ControlBucketComplete {
                mask: as_u64(r.read_long().map_err(err)?),
                index: as_u64(r.read_long().map_err(err)?),
            },
            command::REPLY_CONTROL_BUCKET_FAILED => Self::ControlBucketFailed {
                mask: as_u64(r.read_long().map_err(err)?),
                index: as_u64(r.read_long().map_err(err)?),
            },
            command::FINALISE_MIGRATION => Self::FinaliseMigration {
                mask: as_u64(r.read_long().map_err(err)?),
                index: as_u64(r.read_long().map_err(err)?),
                level: r.read_int().map_err(err)?,
                conninfo: String::from_utf8_lossy(&r.read_string().map_err(err)?).into_owned(),
            },
            command::SET_INT => Self::SetInt {
                map: as_u64(r.read_long().map_err(err)?),
                key: as_u64(r.read_long().map_err(err)?),
                expires: r.read_int().map_err(err)?,
                fullwait: r.read_int().map_err(err)?,
                label: r.read_string().map_err(err)?,
                value: r.read_int().map_err(err)?,
            },
            command::SET_STR => Self::SetStr {
                map: as_u64(r.read_long().map_err(err)?),
                key: as_u64(r.read_long().map_err(err)?),
                expires: r.read_int().map_err(err)?,
                fullwait: r.read_int().map_err(err)?,
                label: r.read_string().map_err(err)?,
                value: r.read_string().map_err(err)?,
            },
            command::GET_INT if header.is_request() => Self::GetInt {
                map: as_u64(r.read_long().map_err(err)?),
                key: as_u64(r.read_long().map_err(err)?),
            },
            command::REPLY_DATA_INT => Self::DataInt {
                map: as_u64(r.read_long().map_err(err)?),
                key: as_u64(r.read_long().map_err(err)?),
                value: r.read_int().map_err(err)?,
            },
            command::GET_STR if header.is_request() => Self::GetStr {
                map: as_u64(r.read_long().map_err(err)?),
                key: as_u64(r.read_long().map_err(err)?),
            },
            command::REPLY_DATA_STR => Self::DataStr {
                map: as_u64(r.read_long().map_err(err)?),
                key: as_u64(r.read_long().map_err(err)?),
                value: r.read_string().map_err(err)?,
            },
            command::SYNC_INT => Self::SyncInt {
                map: as_u64(r.read_long().map_err(err)?),
                key: as_u64(r.read_long().map_err(err)?),
                expires: r.read_int().map_err(err)?,
                value: r.read_int().map_err(err)?,
            },
            command::SYNC_STRING => Self::SyncString {
                map: as_u64(r.read_long().map_err(err)?),
                key: as_u64(r.read_long().map_err(err)?),
                expires: r.read_int().map_err(err)?,
                value: r.read_string().map_err(err)?,
            },
            command::SYNC_KEYVALUE => Self::SyncKeyValue {
                key: as_u64(r.read_long().map_err(err)?),
                expires: r.read_int().map_err(err)?,
                label: r.read_string().map_err(err)?,
            },
            command::REPLY_REDIRECT => Self::Redirect {
                map: as_u64(r.read_long().map_err(err)?),
                key: as_u64(r.read_long().map_err(err)?),
                conninfo: String::from_utf8_lossy(&r.read_string().map_err(err)?).into_owned(),
            },
            other => Self::Unknown { code: other },
        })
    }

    /// The wire command code this variant is carried under (request
    /// side; reply variants share the request's code per spec §6).
    #[must_use]
    pub const fn command_code(&self) -> u16 {
        match self {
            Self::Hello => command::HELLO,
            Self::ShuttingDown => command::SHUTTINGDOWN,
            Self::Ping => command::PING,
            Self::ServerHello { .. } => command::SERVERHELLO,
            Self::Hashmask { .. } => command::HASHMASK,
            Self::Loadlevels | Self::LoadlevelsReply { .. } => command::LOADLEVELS,
            Self::AcceptBucket { .. } => command::ACCEPT_BUCKET,
            Self::CantAcceptBucket => command::REPLY_CANT_ACCEPT_BUCKET,
            Self::AcceptingBucket => command::REPLY_ACCEPTING_BUCKET,
            Self::ControlBucket { .. } => command::CONTROL_BUCKET,
            Self::ControlBucketComplete { .. } => command::REPLY_CONTROL_BUCKET_COMPLETE,
            Self::ControlBucketFailed { .. } => command::REPLY_CONTROL_BUCKET_FAILED,
            Self::FinaliseMigration { .. } => command::FINALISE_MIGRATION,
            Self::SetInt { .. } => command::SET_INT,
            Self::SetStr { .. } => command::SET_STR,
            Self::GetInt { .. } => command::GET_INT,
            Self::GetStr { .. } => command::GET_STR,
            Self::DataInt { .. } => command::REPLY_DATA_INT,
            Self::DataStr { .. } => command::REPLY_DATA_STR,
            Self::SyncInt { .. } => command::SYNC_INT,
            Self::SyncString { .. } => command::SYNC_STRING,
            Self::SyncKeyValue { .. } => command::SYNC_KEYVALUE,
            Self::Redirect { .. } => command::REPLY_REDIRECT,
            Self::Ack | Self::Fail => command::ACK,
            Self::Unknown { code } => *code,
        }
    }

    /// `true` for a reply variant (`response_code != 0` on the wire).
    #[must_use]
    pub const fn is_reply(&self) -> bool {
        matches!(
            self,
            Self::LoadlevelsReply { .. }
                | Self::CantAcceptBucket
                | Self::AcceptingBucket
                | Self::ControlBucketComplete { .. }
                | Self::ControlBucketFailed { .. }
                | Self::DataInt { .. }
                | Self::DataStr { .. }
                | Self::Redirect { .. }
                | Self::Ack
                | Self::Fail
                | Self::Unknown { .. }
        )
    }

    fn payload(&self) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        match self {
            Self::Hello
            | Self::ShuttingDown
            | Self::Ping
            | Self::Loadlevels
            | Self::CantAcceptBucket
            | Self::AcceptingBucket
            | Self::Ack
            | Self::Fail
            | Self::Unknown { .. } => {}
            Self::ServerHello { conninfo, secret } => {
                w.write_string(conninfo.as_bytes()).write_string(secret);
            }
            Self::Hashmask { mask, index, level } => {
                w.write_long(as_i64(*mask)).write_long(as_i64(*index)).write_int(*level);
            }
            Self::LoadlevelsReply { primary, secondary, transferring } => {
                w.write_int(*primary).write_int(*secondary).write_int(*transferring);
            }
            Self::AcceptBucket { mask, index } => {
                w.write_long(as_i64(*mask)).write_long(as_i64(*index));
            }
            Self::ControlBucket { mask, index, level, peer_conninfo } => {
                w.write_long(as_i64(*mask)).write_long(as_i64(*index)).write_int(*level).write_string(peer_conninfo.as_bytes());
            }
            Self::ControlBucketComplete { mask, index } | Self::ControlBucketFailed { mask, index } => {
                w.write_long(as_i64(*mask)).write_long(as_i64(*index));
            }
            Self::FinaliseMigration { mask, index, level, conninfo } => {
                w.write_long(as_i64(*mask)).write_long(as_i64(*index)).write_int(*level).write_string(conninfo.as_bytes());
            }
            Self::SetInt { map, key, expires, fullwait, label, value } => {
                w.write_long(as_i64(*map)).write_long(as_i64(*key)).write_int(*expires).write_int(*fullwait).write_string(label).write_int(*value);
            }
            Self::SetStr { map, key, expires, fullwait, label, value } => {
                w.write_long(as_i64(*map)).write_long(as_i64(*key)).write_int(*expires).write_int(*fullwait).write_string(label).write_string(value);
            }
            Self::GetInt { map, key } | Self::GetStr { map, key } => {
                w.write_long(as_i64(*map)).write_long(as_i64(*key));
            }
            Self::DataInt { map, key, value } => {
                w.write_long(as_i64(*map)).write_long(as_i64(*key)).write_int(*value);
            }
            Self::DataStr { map, key, value } => {
                w.write_long(as_i64(*map)).write_long(as_i64(*key)).write_string(value);
            }
            Self::SyncInt { map, key, expires, value } => {
                w.write_long(as_i64(*map)).write_long(as_i64(*key)).write_int(*expires).write_int(*value);
            }
            Self::SyncString { map, key, expires, value } => {
                w.write_long(as_i64(*map)).write_long(as_i64(*key)).write_int(*expires).write_string(value);
            }
            Self::SyncKeyValue { key, expires, label } => {
                w.write_long(as_i64(*key)).write_int(*expires).write_string(label);
            }
            Self::Redirect { map, key, conninfo } => {
                w.write_long(as_i64(*map)).write_long(as_i64(*key)).write_string(conninfo.as_bytes());
            }
        }
        w.into_bytes()
    }

    /// Encodes this message as a request frame under the given `userid`.
    #[must_use]
    pub fn into_request_frame(self, userid: u32) -> Frame {
        let payload = self.payload();
        #[allow(clippy::cast_possible_truncation)]
        let len = payload.len() as u32;
        Frame::new(Header::request(self.command_code(), userid, len), payload)
    }

    /// Encodes this message as a reply frame, echoing the request's
    /// `userid` (spec §6).
    #[must_use]
    pub fn into_reply_frame(self, userid: u32) -> Frame {
        let command = self.command_code();
        let response_code = match &self {
            Self::Fail => command::UNKNOWN,
            Self::Unknown { .. } => command::UNKNOWN,
            _ => command::ACK,
        };
        let payload = self.payload();
        #[allow(clippy::cast_possible_truncation)]
        let len = payload.len() as u32;
        Frame::new(Header::reply(command, response_code, userid, len), payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashmask_round_trips() {
        let msg = Message::Hashmask { mask: 0x1F, index: 3, level: 0 };
        let frame = msg.clone().into_request_frame(5);
        let decoded = Message::decode(&frame.header, &frame.payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn loadlevels_request_vs_reply_disambiguated_by_response_code() {
        let request = Message::Loadlevels.into_request_frame(1);
        assert_eq!(Message::decode(&request.header, &request.payload).unwrap(), Message::Loadlevels);

        let reply = Message::LoadlevelsReply { primary: 8, secondary: 8, transferring: 0 }.into_reply_frame(1);
        assert_eq!(
            Message::decode(&reply.header, &reply.payload).unwrap(),
            Message::LoadlevelsReply { primary: 8, secondary: 8, transferring: 0 }
        );
    }

    #[test]
    fn set_str_round_trips_with_label() {
        let msg = Message::SetStr {
            map: 1,
            key: 2,
            expires: 0,
            fullwait: 0,
            label: b"client".to_vec(),
            value: b"hello".to_vec(),
        };
        let frame = msg.clone().into_request_frame(9);
        assert_eq!(Message::decode(&frame.header, &frame.payload).unwrap(), msg);
    }

    #[test]
    fn redirect_round_trips() {
        let msg = Message::Redirect { map: 1, key: 2, conninfo: "nodeB:127.0.0.1:13600".to_string() };
        let frame = msg.clone().into_reply_frame(7);
        assert_eq!(frame.header.response_code, command::ACK);
        assert_eq!(Message::decode(&frame.header, &frame.payload).unwrap(), msg);
    }

    #[test]
    fn unrecognized_command_decodes_as_unknown_rather_than_erroring() {
        let header = Header::request(9999, 1, 0);
        assert_eq!(Message::decode(&header, &[]).unwrap(), Message::Unknown { code: 9999 });
    }

    #[test]
    fn truncated_known_payload_is_malformed() {
        let header = Header::request(opencluster_core::command::HASHMASK, 1, 0);
        assert!(Message::decode(&header, &[]).is_err());
    }
}
