use crate::chat::message::{Idx, Message};
use crate::util::id::Id;

/// What the local store holds of a room's history
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HistoryBounds {
    pub oldest: Id,
    pub newest: Id,
    pub newest_idx: Idx,
}

/// The local history database of one room. Calls are synchronous and happen on the loop
///  thread only.
pub trait Storage {
    /// `None` if there is no local history for the room
    fn history_bounds(&self) -> anyhow::Result<Option<HistoryBounds>>;

    /// Up to `count` messages starting at `start_idx` towards older messages, newest first.
    ///  Fewer than `count` messages means the store has nothing older.
    fn fetch_range(&mut self, start_idx: Idx, count: u32) -> anyhow::Result<Vec<Message>>;

    fn persist_sending(&mut self, msg: &Message) -> anyhow::Result<()>;
    fn remove_sending(&mut self, xid: Id) -> anyhow::Result<()>;
    /// the message with transaction id `xid` edits a message that was just confirmed as `msg_id`
    fn update_sending_edit_id(&mut self, xid: Id, msg_id: Id) -> anyhow::Result<()>;
    /// the unconfirmed messages of a previous session, in sending order
    fn load_sending_queue(&mut self) -> anyhow::Result<Vec<Message>>;

    fn append_to_history(&mut self, idx: Idx, msg: &Message) -> anyhow::Result<()>;
    fn index_of_id(&self, id: Id) -> anyhow::Result<Option<Idx>>;

    /// number of stored messages of other users with an index in `(after_idx, below_idx)`
    fn peer_msg_count_after_idx(&self, after_idx: Idx, below_idx: Idx) -> anyhow::Result<u32>;
}
