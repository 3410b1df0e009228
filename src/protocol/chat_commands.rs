use std::fmt::{Display, Formatter};

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::FramingError;
use crate::protocol::command::ProtocolCommand;
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::id::Id;

const ID_KEEPALIVE: u8 = 0;
const ID_JOIN: u8 = 1;
const ID_OLDMSG: u8 = 2;
const ID_NEWMSG: u8 = 3;
const ID_SEEN: u8 = 5;
const ID_RECEIVED: u8 = 6;
const ID_RETENTION: u8 = 7;
const ID_HIST: u8 = 8;
const ID_RANGE: u8 = 9;
const ID_MSGID: u8 = 10;
const ID_REJECT: u8 = 11;
const ID_BROADCAST: u8 = 12;
const ID_HISTDONE: u8 = 13;

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i8)]
pub enum Privilege {
    NoChange = -2,
    NotPresent = -1,
    ReadOnly = 0,
    ReadWrite = 1,
    Full = 2,
    Operator = 3,
}

/// Commands of the chat room protocol. Every room related command carries the chat id, so
///  one connection can serve all rooms of a shard.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChatCommand {
    Keepalive,
    Join(JoinData),
    OldMsg(MsgData),
    NewMsg(MsgData),
    Seen(MsgRefData),
    Received(MsgRefData),
    Retention(RetentionData),
    Hist(HistData),
    Range(RangeData),
    MsgId(MsgIdData),
    Reject(RejectData),
    Broadcast(BroadcastData),
    HistDone(Id),
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct JoinData {
    pub chat_id: Id,
    pub user_id: Id,
    pub privilege: Privilege,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct MsgData {
    pub chat_id: Id,
    pub msg_id: Id,
    pub user_id: Id,
    /// seconds since the epoch, as assigned by the server
    pub ts: u32,
    pub payload: Bytes,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct MsgRefData {
    pub chat_id: Id,
    pub msg_id: Id,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct RetentionData {
    pub chat_id: Id,
    pub user_id: Id,
    pub period: u32,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct HistData {
    pub chat_id: Id,
    /// negative for history older than what the client has
    pub count: i32,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct RangeData {
    pub chat_id: Id,
    pub oldest: Id,
    pub newest: Id,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct MsgIdData {
    pub xid: Id,
    pub msg_id: Id,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct RejectData {
    pub xid: Id,
    pub reason: u8,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct BroadcastData {
    pub chat_id: Id,
    pub user_id: Id,
    pub kind: u8,
}

impl ChatCommand {
    pub fn name(&self) -> &'static str {
        opcode_name(self.opcode())
    }

    fn ser_msg(data: &MsgData, buf: &mut BytesMut) {
        buf.put_id(data.chat_id);
        buf.put_id(data.msg_id);
        buf.put_id(data.user_id);
        buf.put_u32_le(data.ts);
        buf.put_blob(&data.payload);
    }

    fn deser_msg(opcode: &'static str, buf: &mut &[u8]) -> Result<MsgData, FramingError> {
        let chat_id = buf.read_id(opcode)?;
        let msg_id = buf.read_id(opcode)?;
        let user_id = buf.read_id(opcode)?;
        let ts = buf.read_u32_le(opcode)?;
        let payload = buf.read_blob(opcode)?;
        Ok(MsgData { chat_id, msg_id, user_id, ts, payload })
    }

    fn deser_msg_ref(opcode: &'static str, buf: &mut &[u8]) -> Result<MsgRefData, FramingError> {
        let chat_id = buf.read_id(opcode)?;
        let msg_id = buf.read_id(opcode)?;
        Ok(MsgRefData { chat_id, msg_id })
    }
}

pub fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        ID_KEEPALIVE => "KEEPALIVE",
        ID_JOIN => "JOIN",
        ID_OLDMSG => "OLDMSG",
        ID_NEWMSG => "NEWMSG",
        ID_SEEN => "SEEN",
        ID_RECEIVED => "RECEIVED",
        ID_RETENTION => "RETENTION",
        ID_HIST => "HIST",
        ID_RANGE => "RANGE",
        ID_MSGID => "MSGID",
        ID_REJECT => "REJECT",
        ID_BROADCAST => "BROADCAST",
        ID_HISTDONE => "HISTDONE",
        _ => "(invalid opcode)",
    }
}

impl ProtocolCommand for ChatCommand {
    fn opcode(&self) -> u8 {
        match self {
            ChatCommand::Keepalive => ID_KEEPALIVE,
            ChatCommand::Join(_) => ID_JOIN,
            ChatCommand::OldMsg(_) => ID_OLDMSG,
            ChatCommand::NewMsg(_) => ID_NEWMSG,
            ChatCommand::Seen(_) => ID_SEEN,
            ChatCommand::Received(_) => ID_RECEIVED,
            ChatCommand::Retention(_) => ID_RETENTION,
            ChatCommand::Hist(_) => ID_HIST,
            ChatCommand::Range(_) => ID_RANGE,
            ChatCommand::MsgId(_) => ID_MSGID,
            ChatCommand::Reject(_) => ID_REJECT,
            ChatCommand::Broadcast(_) => ID_BROADCAST,
            ChatCommand::HistDone(_) => ID_HISTDONE,
        }
    }

    fn ser_payload(&self, buf: &mut BytesMut) {
        match self {
            ChatCommand::Keepalive => {}
            ChatCommand::Join(data) => {
                buf.put_id(data.chat_id);
                buf.put_id(data.user_id);
                buf.put_i8(data.privilege.into());
            }
            ChatCommand::OldMsg(data) | ChatCommand::NewMsg(data) => Self::ser_msg(data, buf),
            ChatCommand::Seen(data) | ChatCommand::Received(data) => {
                buf.put_id(data.chat_id);
                buf.put_id(data.msg_id);
            }
            ChatCommand::Retention(data) => {
                buf.put_id(data.chat_id);
                buf.put_id(data.user_id);
                buf.put_u32_le(data.period);
            }
            ChatCommand::Hist(data) => {
                buf.put_id(data.chat_id);
                buf.put_i32_le(data.count);
            }
            ChatCommand::Range(data) => {
                buf.put_id(data.chat_id);
                buf.put_id(data.oldest);
                buf.put_id(data.newest);
            }
            ChatCommand::MsgId(data) => {
                buf.put_id(data.xid);
                buf.put_id(data.msg_id);
            }
            ChatCommand::Reject(data) => {
                buf.put_id(data.xid);
                buf.put_u8(data.reason);
            }
            ChatCommand::Broadcast(data) => {
                buf.put_id(data.chat_id);
                buf.put_id(data.user_id);
                buf.put_u8(data.kind);
            }
            ChatCommand::HistDone(chat_id) => buf.put_id(*chat_id),
        }
    }

    fn deser(opcode: u8, buf: &mut &[u8]) -> Result<ChatCommand, FramingError> {
        let name = opcode_name(opcode);
        let cmd = match opcode {
            ID_KEEPALIVE => ChatCommand::Keepalive,
            ID_JOIN => {
                let chat_id = buf.read_id(name)?;
                let user_id = buf.read_id(name)?;
                let privilege = Privilege::try_from(buf.read_i8(name)?)
                    .map_err(|_| FramingError::InvalidValue { opcode: name, what: "privilege" })?;
                ChatCommand::Join(JoinData { chat_id, user_id, privilege })
            }
            ID_OLDMSG => ChatCommand::OldMsg(Self::deser_msg(name, buf)?),
            ID_NEWMSG => ChatCommand::NewMsg(Self::deser_msg(name, buf)?),
            ID_SEEN => ChatCommand::Seen(Self::deser_msg_ref(name, buf)?),
            ID_RECEIVED => ChatCommand::Received(Self::deser_msg_ref(name, buf)?),
            ID_RETENTION => {
                let chat_id = buf.read_id(name)?;
                let user_id = buf.read_id(name)?;
                let period = buf.read_u32_le(name)?;
                ChatCommand::Retention(RetentionData { chat_id, user_id, period })
            }
            ID_HIST => {
                let chat_id = buf.read_id(name)?;
                let count = buf.read_i32_le(name)?;
                ChatCommand::Hist(HistData { chat_id, count })
            }
            ID_RANGE => {
                let chat_id = buf.read_id(name)?;
                let oldest = buf.read_id(name)?;
                let newest = buf.read_id(name)?;
                ChatCommand::Range(RangeData { chat_id, oldest, newest })
            }
            ID_MSGID => {
                let xid = buf.read_id(name)?;
                let msg_id = buf.read_id(name)?;
                ChatCommand::MsgId(MsgIdData { xid, msg_id })
            }
            ID_REJECT => {
                let xid = buf.read_id(name)?;
                let reason = buf.read_u8(name)?;
                ChatCommand::Reject(RejectData { xid, reason })
            }
            ID_BROADCAST => {
                let chat_id = buf.read_id(name)?;
                let user_id = buf.read_id(name)?;
                let kind = buf.read_u8(name)?;
                ChatCommand::Broadcast(BroadcastData { chat_id, user_id, kind })
            }
            ID_HISTDONE => ChatCommand::HistDone(buf.read_id(name)?),
            other => return Err(FramingError::UnknownOpcode(other)),
        };
        Ok(cmd)
    }
}

impl Display for ChatCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatCommand::Keepalive => write!(f, "KEEPALIVE"),
            ChatCommand::Join(d) => write!(f, "JOIN - chat {}, user {}, priv {:?}", d.chat_id, d.user_id, d.privilege),
            ChatCommand::OldMsg(d) | ChatCommand::NewMsg(d) => write!(f, "{} - chat {}, msgid {}, from {}, ts {}, {} bytes", self.name(), d.chat_id, d.msg_id, d.user_id, d.ts, d.payload.len()),
            ChatCommand::Seen(d) | ChatCommand::Received(d) => write!(f, "{} - chat {}, msgid {}", self.name(), d.chat_id, d.msg_id),
            ChatCommand::Retention(d) => write!(f, "RETENTION - chat {}, user {}, period {}", d.chat_id, d.user_id, d.period),
            ChatCommand::Hist(d) => write!(f, "HIST - chat {}, count {}", d.chat_id, d.count),
            ChatCommand::Range(d) => write!(f, "RANGE - chat {}, {} - {}", d.chat_id, d.oldest, d.newest),
            ChatCommand::MsgId(d) => write!(f, "MSGID - {} -> {}", d.xid, d.msg_id),
            ChatCommand::Reject(d) => write!(f, "REJECT - {}, reason {}", d.xid, d.reason),
            ChatCommand::Broadcast(d) => write!(f, "BROADCAST - chat {}, user {}, kind {}", d.chat_id, d.user_id, d.kind),
            ChatCommand::HistDone(chat_id) => write!(f, "HISTDONE - chat {}", chat_id),
        }
    }
}
