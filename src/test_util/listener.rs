use std::cell::{Cell, RefCell};

use crate::chat::listener::Listener;
use crate::chat::message::{ChatState, Idx, Message, MessageStatus};
use crate::presence::client::PresenceListener;
use crate::presence::config::{Presence, PresenceConfig};
use crate::protocol::chat_commands::Privilege;
use crate::transport::connection::ConnectionState;
use crate::util::id::Id;

/// A [`Listener`] notification, reduced to what tests compare
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    NewMessage { idx: Idx, id: Id, status: MessageStatus },
    HistoryMessage { idx: Idx, id: Id, status: MessageStatus, from_db: bool },
    HistoryDone { from_db: bool },
    UnsentLoaded(Id),
    Confirmed { xid: Id, msg_id: Id, idx: Idx },
    Rejected { xid: Id, reason: u8 },
    StatusChange { idx: Idx, status: MessageStatus },
    Edited { old_idx: Idx, new_idx: Idx },
    OnlineState(ChatState),
    UserJoined(Id, Privilege),
    UserLeft(Id),
    Broadcast(Id, u8),
}

#[derive(Default)]
pub struct RecordingListener {
    events: RefCell<Vec<ChatEvent>>,
    panic_next: Cell<bool>,
}

impl RecordingListener {
    /// removes and returns the events recorded so far
    pub fn take(&self) -> Vec<ChatEvent> {
        self.events.borrow_mut().drain(..).collect()
    }

    /// the next notification panics instead of being recorded
    pub fn panic_on_next_event(&self) {
        self.panic_next.set(true);
    }

    fn record(&self, event: ChatEvent) {
        if self.panic_next.replace(false) {
            panic!("listener failure on {:?}", event);
        }
        self.events.borrow_mut().push(event);
    }
}

impl Listener for RecordingListener {
    fn on_recv_new_message(&self, idx: Idx, msg: &Message, status: MessageStatus) {
        self.record(ChatEvent::NewMessage { idx, id: msg.id, status });
    }

    fn on_recv_history_message(&self, idx: Idx, msg: &Message, status: MessageStatus, is_from_db: bool) {
        self.record(ChatEvent::HistoryMessage { idx, id: msg.id, status, from_db: is_from_db });
    }

    fn on_history_done(&self, is_from_db: bool) {
        self.record(ChatEvent::HistoryDone { from_db: is_from_db });
    }

    fn on_unsent_msg_loaded(&self, msg: &Message) {
        self.record(ChatEvent::UnsentLoaded(msg.id));
    }

    fn on_message_confirmed(&self, xid: Id, msg_id: Id, idx: Idx) {
        self.record(ChatEvent::Confirmed { xid, msg_id, idx });
    }

    fn on_message_rejected(&self, xid: Id, reason: u8) {
        self.record(ChatEvent::Rejected { xid, reason });
    }

    fn on_message_status_change(&self, idx: Idx, status: MessageStatus, _msg: &Message) {
        self.record(ChatEvent::StatusChange { idx, status });
    }

    fn on_message_edited(&self, old_idx: Idx, new_idx: Idx, _msg: &Message) {
        self.record(ChatEvent::Edited { old_idx, new_idx });
    }

    fn on_online_state_change(&self, state: ChatState) {
        self.record(ChatEvent::OnlineState(state));
    }

    fn on_user_joined(&self, user: Id, privilege: Privilege) {
        self.record(ChatEvent::UserJoined(user, privilege));
    }

    fn on_user_left(&self, user: Id) {
        self.record(ChatEvent::UserLeft(user));
    }

    fn on_broadcast(&self, user: Id, kind: u8) {
        self.record(ChatEvent::Broadcast(user, kind));
    }
}

#[derive(Default)]
pub struct RecordingPresenceListener {
    presence_changes: RefCell<Vec<(Id, Presence)>>,
    configs: RefCell<Vec<(PresenceConfig, bool)>>,
    states: RefCell<Vec<ConnectionState>>,
}

impl RecordingPresenceListener {
    pub fn presence_changes(&self) -> Vec<(Id, Presence)> {
        self.presence_changes.borrow().clone()
    }

    pub fn configs(&self) -> Vec<(PresenceConfig, bool)> {
        self.configs.borrow().clone()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.states.borrow().clone()
    }
}

impl PresenceListener for RecordingPresenceListener {
    fn on_presence_change(&self, user: Id, presence: Presence) {
        self.presence_changes.borrow_mut().push((user, presence));
    }

    fn on_presence_config_changed(&self, config: &PresenceConfig, pending: bool) {
        self.configs.borrow_mut().push((*config, pending));
    }

    fn on_connection_state_change(&self, state: ConnectionState) {
        self.states.borrow_mut().push(state);
    }
}
