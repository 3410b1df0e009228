use std::fmt::{Display, Formatter};

use bitflags::bitflags;
use bytes::Bytes;

use crate::protocol::chat_commands::MsgData;
use crate::util::id::Id;

/// Position of a message in a room's history. Indexes are contiguous and may be negative,
///  since history grows towards lower indexes.
pub type Idx = i32;

/// Statuses up to and including `Delivered` apply only to messages sent by the local user,
///  the others only to messages of other users.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageStatus {
    Sending,
    ServerReceived,
    ServerRejected,
    Delivered,
    NotSeen,
    Seen,
}

impl MessageStatus {
    pub fn is_own(&self) -> bool {
        *self <= MessageStatus::Delivered
    }
}

bitflags! {
    #[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
    pub struct MessageFlags: u8 {
        /// the message's id is a client generated transaction id, not yet confirmed by the server
        const ID_IS_XID = 0b0001;
        /// the message edits a message that is itself not yet confirmed
        const EDITS_IS_XID = 0b0010;
    }
}

pub const MSG_TYPE_REGULAR: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Id,
    /// the message this one replaces, or [`Id::NULL`]
    pub edits: Id,
    pub user_id: Id,
    pub ts: u32,
    pub msg_type: u8,
    pub payload: Bytes,
    pub flags: MessageFlags,
    pub status: MessageStatus,
}

impl Message {
    /// A message received from the server, with a provisional status that the buffer
    ///  overwrites when it is stored
    pub fn from_server(data: MsgData) -> Message {
        Message {
            id: data.msg_id,
            edits: Id::NULL,
            user_id: data.user_id,
            ts: data.ts,
            msg_type: MSG_TYPE_REGULAR,
            payload: data.payload,
            flags: MessageFlags::empty(),
            status: MessageStatus::NotSeen,
        }
    }

    /// A locally created message that awaits confirmation under transaction id `xid`
    pub fn new_sending(xid: Id, user_id: Id, ts: u32, payload: Bytes) -> Message {
        Message {
            id: xid,
            edits: Id::NULL,
            user_id,
            ts,
            msg_type: MSG_TYPE_REGULAR,
            payload,
            flags: MessageFlags::ID_IS_XID,
            status: MessageStatus::Sending,
        }
    }

    pub fn is_sending(&self) -> bool {
        self.flags.contains(MessageFlags::ID_IS_XID)
    }

    pub fn edits_is_xid(&self) -> bool {
        self.flags.contains(MessageFlags::EDITS_IS_XID)
    }

    pub fn is_edit(&self) -> bool {
        !self.edits.is_null()
    }

    pub fn set_id(&mut self, id: Id, is_xid: bool) {
        self.id = id;
        self.flags.set(MessageFlags::ID_IS_XID, is_xid);
    }

    pub fn set_edits(&mut self, edits: Id, is_xid: bool) {
        self.edits = edits;
        self.flags.set(MessageFlags::EDITS_IS_XID, is_xid);
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{} from {} ({:?}, {} bytes)",
            if self.is_sending() { "xid " } else { "" },
            self.id,
            self.user_id,
            self.status,
            self.payload.len(),
        )
    }
}

/// Online state of a room, derived from the state of its shard connection
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChatState {
    Offline,
    Connecting,
    Joining,
    Online,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_flags() {
        let mut msg = Message::new_sending(Id::new(1), Id::new(9), 0, Bytes::from_static(b"hi"));
        assert!(msg.is_sending());
        assert!(!msg.is_edit());

        msg.set_edits(Id::new(2), true);
        assert!(msg.is_edit());
        assert!(msg.edits_is_xid());

        msg.set_id(Id::new(500), false);
        assert!(!msg.is_sending());
        assert!(msg.edits_is_xid());
    }

    #[test]
    fn test_own_statuses() {
        assert!(MessageStatus::Sending.is_own());
        assert!(MessageStatus::Delivered.is_own());
        assert!(!MessageStatus::NotSeen.is_own());
        assert!(!MessageStatus::Seen.is_own());
    }
}
