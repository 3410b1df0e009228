use crate::chat::message::{ChatState, Idx, Message, MessageStatus};
use crate::protocol::chat_commands::Privilege;
use crate::util::id::Id;

/// Notifications of a chat room. All methods are called on the loop thread while the room's
///  buffer is being updated, so implementations must not call back into the client
///  synchronously; they can use [`crate::runtime::LoopCtx::post`] for that. Panics are caught
///  and logged.
pub trait Listener {
    /// a message arrived at the live edge
    fn on_recv_new_message(&self, _idx: Idx, _msg: &Message, _status: MessageStatus) {}

    fn on_recv_history_message(&self, _idx: Idx, _msg: &Message, _status: MessageStatus, _is_from_db: bool) {}

    /// the batch requested through `get_history` is complete
    fn on_history_done(&self, _is_from_db: bool) {}

    /// a message that was not confirmed in a previous session was restored from storage
    fn on_unsent_msg_loaded(&self, _msg: &Message) {}

    fn on_message_confirmed(&self, _xid: Id, _msg_id: Id, _idx: Idx) {}

    /// There is no index or message id for a rejected message, only the transaction id
    fn on_message_rejected(&self, _xid: Id, _reason: u8) {}

    fn on_message_status_change(&self, _idx: Idx, _status: MessageStatus, _msg: &Message) {}

    /// the message at `new_idx` replaces the one at `old_idx`
    fn on_message_edited(&self, _old_idx: Idx, _new_idx: Idx, _msg: &Message) {}

    fn on_online_state_change(&self, _state: ChatState) {}

    /// a user joined the room or their privilege changed
    fn on_user_joined(&self, _user: Id, _privilege: Privilege) {}

    fn on_user_left(&self, _user: Id) {}

    fn on_broadcast(&self, _user: Id, _kind: u8) {}
}
