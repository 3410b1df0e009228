use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, warn};

use bytes::Bytes;

use crate::chat::filter::MessageFilter;
use crate::chat::listener::Listener;
use crate::chat::message::{ChatState, Idx, Message, MessageStatus};
use crate::chat::storage::Storage;
use crate::error::{ChatError, ChatResult};
use crate::protocol::chat_commands::{ChatCommand, HistData, JoinData, MsgData, MsgRefData, Privilege};
use crate::util::id::Id;
use crate::util::isolate::isolated;

/// Where a room's buffer sends its commands: the room's shard connection
#[cfg_attr(test, automock)]
pub trait CommandSink {
    /// `false` if the command could not be sent, e.g. because the connection is offline
    fn send_command(&self, cmd: ChatCommand) -> bool;
    fn is_online(&self) -> bool;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HistFetchState {
    /// there is probably more history, and it is not being fetched
    NotFetching,
    /// neither the local store nor the server have older messages
    NoMoreHistory,
    FetchingFromServer,
    FetchingFromDb,
}

impl HistFetchState {
    pub fn is_fetching(&self) -> bool {
        matches!(self, HistFetchState::FetchingFromServer | HistFetchState::FetchingFromDb)
    }
}

/// A message awaiting confirmation. The message itself lives in the buffer at the item's key.
#[derive(Debug)]
struct SendingItem {
    xid: Id,
    /// at most one edit can wait for the message to be confirmed
    edit: Option<Message>,
}

/// The seen or received pointer. The id can be known before its message is, in which case
///  `idx` is resolved when the message arrives.
#[derive(Debug, Default, Copy, Clone)]
struct Pointer {
    id: Id,
    idx: Option<Idx>,
}

impl Pointer {
    fn covers(&self, idx: Idx) -> bool {
        self.idx.is_some_and(|p| p >= idx)
    }
}

fn log_storage_error(what: &str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        error!("local storage: error on {}: {:#}", what, e);
    }
}

/// The messages of one chat room.
///
/// The buffer holds a contiguous range of indexes `[lownum, highnum]` with a message at every
///  index. It grows in two directions: new messages are appended to `forward` at the live edge,
///  history is appended to `backward` (which is stored newest first). Messages sent by the local
///  user are inserted at the live edge right away under their transaction id, and keep their
///  index when the server confirms them.
pub struct MessageBuffer {
    chat_id: Id,
    user_id: Id,
    listener: Rc<dyn Listener>,
    storage: Box<dyn Storage>,
    filter: Box<dyn MessageFilter>,
    sink: Weak<dyn CommandSink>,

    forward_start: Idx,
    forward: Vec<Message>,
    backward: Vec<Message>,
    id_to_index: FxHashMap<Id, Idx>,
    /// keyed by buffer index, i.e. in sending order
    sending: BTreeMap<Idx, SendingItem>,
    sending_xids: FxHashMap<Id, Idx>,

    last_seen: Pointer,
    last_received: Pointer,

    hist_fetch_state: HistFetchState,
    /// Oldest message in the local store. History is fetched from the store until this message
    ///  is in the buffer, and from the server after that. `NULL` when the store is exhausted.
    oldest_db_id: Id,
    hist_fetch_requested: u32,
    hist_fetch_received: u32,

    online_state: ChatState,
}

impl MessageBuffer {
    pub fn new(
        chat_id: Id,
        user_id: Id,
        listener: Rc<dyn Listener>,
        storage: Box<dyn Storage>,
        filter: Box<dyn MessageFilter>,
        sink: Weak<dyn CommandSink>,
    ) -> MessageBuffer {
        let bounds = storage.history_bounds()
            .unwrap_or_else(|e| {
                error!("chat {}: could not read history bounds from local storage, starting empty: {:#}", chat_id, e);
                None
            });

        let mut result = MessageBuffer {
            chat_id,
            user_id,
            listener,
            storage,
            filter,
            sink,
            forward_start: bounds.map(|b| b.newest_idx + 1).unwrap_or(0),
            forward: Vec::new(),
            backward: Vec::new(),
            id_to_index: Default::default(),
            sending: Default::default(),
            sending_xids: Default::default(),
            last_seen: Default::default(),
            last_received: Default::default(),
            hist_fetch_state: HistFetchState::NotFetching,
            oldest_db_id: bounds.map(|b| b.oldest).unwrap_or(Id::NULL),
            hist_fetch_requested: 0,
            hist_fetch_received: 0,
            online_state: ChatState::Offline,
        };
        if let Some(bounds) = bounds {
            debug!("chat {}: local history from {} to {} (#{})", chat_id, bounds.oldest, bounds.newest, bounds.newest_idx);
        }
        result.restore_sending_queue();
        result
    }

    fn restore_sending_queue(&mut self) {
        let messages = match self.storage.load_sending_queue() {
            Ok(messages) => messages,
            Err(e) => {
                error!("chat {}: could not load unsent messages: {:#}", self.chat_id, e);
                return;
            }
        };

        let listener = self.listener.clone();
        for msg in messages {
            if msg.edits_is_xid() {
                if let Some(item) = self.sending_xids.get(&msg.edits).and_then(|idx| self.sending.get_mut(idx)) {
                    item.edit = Some(msg);
                }
                else {
                    warn!("chat {}: discarding unsent edit {} of unknown message {}", self.chat_id, msg.id, msg.edits);
                    log_storage_error("remove orphaned edit", self.storage.remove_sending(msg.id));
                }
                continue;
            }

            debug!("chat {}: restored unsent message {}", self.chat_id, msg);
            isolated("on_unsent_msg_loaded", || listener.on_unsent_msg_loaded(&msg));
            self.append_sending(msg, false);
        }
    }

    pub fn chat_id(&self) -> Id {
        self.chat_id
    }

    pub fn lownum(&self) -> Idx {
        self.forward_start - self.backward.len() as Idx
    }

    pub fn highnum(&self) -> Idx {
        self.forward_start + self.forward.len() as Idx - 1
    }

    pub fn len(&self) -> usize {
        self.forward.len() + self.backward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.backward.is_empty()
    }

    pub fn has_num(&self, idx: Idx) -> bool {
        idx >= self.lownum() && idx <= self.highnum()
    }

    pub fn find(&self, idx: Idx) -> Option<&Message> {
        if idx < self.forward_start {
            self.backward.get((self.forward_start - idx - 1) as usize)
        }
        else {
            self.forward.get((idx - self.forward_start) as usize)
        }
    }

    fn find_mut(&mut self, idx: Idx) -> Option<&mut Message> {
        if idx < self.forward_start {
            self.backward.get_mut((self.forward_start - idx - 1) as usize)
        }
        else {
            self.forward.get_mut((idx - self.forward_start) as usize)
        }
    }

    pub fn at(&self, idx: Idx) -> ChatResult<&Message> {
        self.find(idx)
            .ok_or(ChatError::BufferRange { idx, low: self.lownum(), high: self.highnum() })
    }

    /// Looks up confirmed messages by message id, and unconfirmed ones by transaction id
    pub fn index_of(&self, id: Id) -> Option<Idx> {
        self.id_to_index.get(&id).copied()
    }

    pub fn is_sending(&self, xid: Id) -> bool {
        self.sending_xids.contains_key(&xid)
    }

    pub fn sending_count(&self) -> usize {
        self.sending.len()
    }

    /// the edit waiting for the unconfirmed message `xid`
    pub fn pending_edit(&self, xid: Id) -> Option<&Message> {
        let idx = self.sending_xids.get(&xid)?;
        self.sending.get(idx)?.edit.as_ref()
    }

    fn take_sending(&mut self, xid: Id) -> Option<(Idx, SendingItem)> {
        let idx = self.sending_xids.remove(&xid)?;
        self.sending.remove(&idx).map(|item| (idx, item))
    }

    pub fn hist_fetch_state(&self) -> HistFetchState {
        self.hist_fetch_state
    }

    pub fn online_state(&self) -> ChatState {
        self.online_state
    }

    pub fn last_seen_idx(&self) -> Option<Idx> {
        self.last_seen.idx
    }

    pub fn last_received_idx(&self) -> Option<Idx> {
        self.last_received.idx
    }

    fn send(&self, cmd: ChatCommand) -> bool {
        match self.sink.upgrade() {
            Some(sink) => sink.send_command(cmd),
            None => false,
        }
    }

    fn is_online(&self) -> bool {
        self.sink.upgrade().is_some_and(|s| s.is_online())
    }

    fn status_for(&self, idx: Idx, msg: &Message) -> MessageStatus {
        if msg.user_id == self.user_id {
            if msg.is_sending() {
                MessageStatus::Sending
            }
            else if self.last_received.covers(idx) {
                MessageStatus::Delivered
            }
            else {
                MessageStatus::ServerReceived
            }
        }
        else if self.last_seen.covers(idx) {
            MessageStatus::Seen
        }
        else {
            MessageStatus::NotSeen
        }
    }

    fn push_forward(&mut self, msg: Message) -> Idx {
        self.forward.push(msg);
        self.highnum()
    }

    fn push_backward(&mut self, msg: Message) -> Idx {
        self.backward.push(msg);
        self.lownum()
    }

    //--------------------------- sending

    /// Queues a new message, returning its transaction id `xid`
    pub fn submit(&mut self, xid: Id, ts: u32, payload: Bytes) -> Id {
        let msg = Message::new_sending(xid, self.user_id, ts, payload);
        log_storage_error("persist sending message", self.storage.persist_sending(&msg));
        self.append_sending(msg, true);
        xid
    }

    /// Queues an edit of `target`, returning the edit's transaction id `xid`. If `target` is
    ///  itself unconfirmed, the edit waits for its confirmation, replacing an edit that was
    ///  waiting before.
    pub fn modify(&mut self, xid: Id, target: Id, target_is_xid: bool, ts: u32, payload: Bytes) -> ChatResult<Id> {
        let mut edit = Message::new_sending(xid, self.user_id, ts, payload);

        if target_is_xid {
            let Some(item) = self.sending_xids.get(&target).and_then(|idx| self.sending.get_mut(idx)) else {
                return Err(ChatError::UnknownMessage(target));
            };
            edit.set_edits(target, true);
            if let Some(previous) = item.edit.replace(edit.clone()) {
                debug!("chat {}: edit {} replaces pending edit {} of {}", self.chat_id, xid, previous.id, target);
                log_storage_error("remove replaced edit", self.storage.remove_sending(previous.id));
            }
            log_storage_error("persist pending edit", self.storage.persist_sending(&edit));
            return Ok(xid);
        }

        if self.index_of(target).is_none() {
            match self.storage.index_of_id(target) {
                Ok(Some(_)) => {}
                Ok(None) => return Err(ChatError::UnknownMessage(target)),
                Err(e) => return Err(ChatError::storage(e)),
            }
        }
        edit.set_edits(target, false);
        log_storage_error("persist edit", self.storage.persist_sending(&edit));
        self.append_sending(edit, true);
        Ok(xid)
    }

    fn append_sending(&mut self, msg: Message, send_now: bool) {
        let xid = msg.id;
        let idx = self.push_forward(msg);
        self.id_to_index.insert(xid, idx);
        self.sending.insert(idx, SendingItem { xid, edit: None });
        self.sending_xids.insert(xid, idx);
        if send_now && self.is_online() {
            self.send_msg(idx, xid);
        }
    }

    fn send_msg(&self, idx: Idx, xid: Id) -> bool {
        let Some(msg) = self.find(idx) else {
            return false;
        };
        let payload = match self.filter.encrypt(msg) {
            Ok(payload) => payload,
            Err(e) => {
                error!("chat {}: could not encrypt message {}, not sending it: {:#}", self.chat_id, xid, e);
                return false;
            }
        };
        self.send(ChatCommand::NewMsg(MsgData {
            chat_id: self.chat_id,
            msg_id: xid,
            user_id: msg.user_id,
            ts: msg.ts,
            payload,
        }))
    }

    /// (Re)sends all unconfirmed messages in buffer order
    pub fn resend_pending(&self) {
        for (&idx, item) in &self.sending {
            trace!("chat {}: resending {} at #{}", self.chat_id, item.xid, idx);
            if !self.send_msg(idx, item.xid) {
                break;
            }
        }
    }

    /// The server assigned `msg_id` to the message sent as `xid`. A null `msg_id` means the
    ///  message was rejected.
    pub fn confirm(&mut self, xid: Id, msg_id: Id) {
        if msg_id.is_null() {
            self.reject(xid, 0);
            return;
        }
        let Some((idx, item)) = self.take_sending(xid) else {
            warn!("chat {}: confirmation for unknown transaction id {} - ignoring", self.chat_id, xid);
            return;
        };
        log_storage_error("remove confirmed message from sending", self.storage.remove_sending(xid));
        self.id_to_index.remove(&xid);

        let mut msg = match self.find(idx) {
            Some(msg) => msg.clone(),
            None => {
                error!("chat {}: sending message {} is missing from the buffer at #{}", self.chat_id, xid, idx);
                return;
            }
        };
        msg.set_id(msg_id, false);
        msg.status = self.status_for(idx, &msg);
        log_storage_error("append confirmed message to history", self.storage.append_to_history(idx, &msg));
        if let Some(slot) = self.find_mut(idx) {
            *slot = msg;
        }
        self.id_to_index.insert(msg_id, idx);
        debug!("chat {}: message {} confirmed as {} at #{}", self.chat_id, xid, msg_id, idx);

        let listener = self.listener.clone();
        isolated("on_message_confirmed", || listener.on_message_confirmed(xid, msg_id, idx));

        if let Some(mut edit) = item.edit {
            debug!("chat {}: sending edit {} of {} now that the original is confirmed", self.chat_id, edit.id, msg_id);
            edit.set_edits(msg_id, false);
            log_storage_error("update edit reference", self.storage.update_sending_edit_id(edit.id, msg_id));
            self.append_sending(edit, true);
        }

        self.resolve_pointers(msg_id, idx);
    }

    pub fn reject(&mut self, xid: Id, reason: u8) {
        let Some((idx, item)) = self.take_sending(xid) else {
            warn!("chat {}: rejection of unknown transaction id {} - ignoring", self.chat_id, xid);
            return;
        };
        warn!("chat {}: message {} was rejected by the server (reason {})", self.chat_id, xid, reason);
        log_storage_error("remove rejected message from sending", self.storage.remove_sending(xid));
        if let Some(edit) = &item.edit {
            log_storage_error("remove edit of rejected message", self.storage.remove_sending(edit.id));
        }
        self.id_to_index.remove(&xid);

        if idx == self.highnum() && idx >= self.forward_start {
            self.forward.pop();
            self.clamp_pointers();
        }
        else if let Some(msg) = self.find_mut(idx) {
            // newer messages follow, the index range has to stay contiguous
            msg.status = MessageStatus::ServerRejected;
        }

        let listener = self.listener.clone();
        isolated("on_message_rejected", || listener.on_message_rejected(xid, reason));
    }

    /// Moves the seen and received pointers back after the live edge shrank, so the index of
    ///  the removed message is not covered when it is reused
    fn clamp_pointers(&mut self) {
        let highnum = self.highnum();
        let id = self.find(highnum).map(|msg| msg.id).unwrap_or(Id::NULL);
        for pointer in [&mut self.last_seen, &mut self.last_received] {
            if pointer.idx.is_some_and(|p| p > highnum) {
                *pointer = Pointer { id, idx: Some(highnum) };
            }
        }
    }

    //--------------------------- receiving

    /// Stores a message received from the server, either at the live edge (`is_new`) or as
    ///  history. Returns the message's index, or `None` if it was not stored.
    pub fn incoming(&mut self, is_new: bool, mut msg: Message) -> Option<Idx> {
        if let Err(e) = self.filter.decrypt(&mut msg) {
            warn!("chat {}: could not decrypt message {}, keeping raw payload: {:#}", self.chat_id, msg.id, e);
        }

        if let Some(idx) = self.index_of(msg.id) {
            if self.is_sending(msg.id) {
                self.confirm(msg.id, msg.id);
            }
            else {
                debug!("chat {}: message {} is already at #{} - ignoring", self.chat_id, msg.id, idx);
            }
            return Some(idx);
        }

        if is_new && msg.user_id == self.user_id {
            if let Some(xid) = self.find_echoed_xid(&msg) {
                debug!("chat {}: own message {} arrived as {} before its confirmation", self.chat_id, xid, msg.id);
                self.confirm(xid, msg.id);
                return self.index_of(msg.id);
            }
        }

        let idx = if is_new { self.highnum() + 1 } else { self.lownum() - 1 };
        msg.flags = Default::default();
        msg.status = self.status_for(idx, &msg);
        log_storage_error("append message to history", self.storage.append_to_history(idx, &msg));
        self.id_to_index.insert(msg.id, idx);

        let msg_id = msg.id;
        let status = msg.status;
        let edits = if msg.is_edit() { self.index_of(msg.edits) } else { None };
        let listener = self.listener.clone();
        if is_new {
            self.push_forward(msg);
            let msg = &self.forward[self.forward.len() - 1];
            isolated("on_recv_new_message", || listener.on_recv_new_message(idx, msg, status));
        }
        else {
            self.push_backward(msg);
            self.hist_fetch_received += 1;
            let msg = &self.backward[self.backward.len() - 1];
            isolated("on_recv_history_message", || listener.on_recv_history_message(idx, msg, status, false));
        }

        if let (Some(old_idx), Some(msg)) = (edits, self.find(idx)) {
            isolated("on_message_edited", || listener.on_message_edited(old_idx, idx, msg));
        }

        self.resolve_pointers(msg_id, idx);
        Some(idx)
    }

    /// The oldest unconfirmed message with the same content, if any
    fn find_echoed_xid(&self, msg: &Message) -> Option<Id> {
        self.sending.iter()
            .filter_map(|(idx, item)| self.find(*idx).map(|m| (item.xid, m)))
            .find(|(_, m)| m.payload == msg.payload && m.edits == msg.edits)
            .map(|(xid, _)| xid)
    }

    //--------------------------- history

    /// Starts fetching `count` older messages. Returns `true` if they come from the server,
    ///  `false` if they come from the local store. A local store fetch is completed by
    ///  [`MessageBuffer::fetch_db_history`] on the next loop iteration.
    pub fn get_history(&mut self, count: u32) -> ChatResult<bool> {
        match self.hist_fetch_state {
            HistFetchState::FetchingFromServer | HistFetchState::FetchingFromDb => return Err(ChatError::AlreadyFetching),
            HistFetchState::NoMoreHistory => return Err(ChatError::NoMoreHistory),
            HistFetchState::NotFetching => {}
        }

        if !self.oldest_db_id.is_null() {
            debug!("chat {}: fetching {} messages from local store", self.chat_id, count);
            self.hist_fetch_requested = count;
            self.hist_fetch_received = 0;
            self.hist_fetch_state = HistFetchState::FetchingFromDb;
            return Ok(false);
        }

        debug!("chat {}: requesting {} messages of history from the server", self.chat_id, count);
        let count_signed = i32::try_from(count).unwrap_or(i32::MAX);
        if !self.send(ChatCommand::Hist(HistData { chat_id: self.chat_id, count: -count_signed })) {
            return Err(ChatError::NotConnected);
        }
        self.hist_fetch_requested = count;
        self.hist_fetch_received = 0;
        self.hist_fetch_state = HistFetchState::FetchingFromServer;
        Ok(true)
    }

    pub fn fetch_db_history(&mut self) {
        if self.hist_fetch_state != HistFetchState::FetchingFromDb {
            debug!("chat {}: local store fetch is no longer pending - ignoring", self.chat_id);
            return;
        }

        let requested = self.hist_fetch_requested;
        let messages = self.storage.fetch_range(self.lownum() - 1, requested)
            .unwrap_or_else(|e| {
                error!("chat {}: error reading history from local store: {:#}", self.chat_id, e);
                Vec::new()
            });
        let fetched = messages.len();

        let listener = self.listener.clone();
        for mut msg in messages {
            let idx = self.lownum() - 1;
            msg.status = self.status_for(idx, &msg);
            let msg_id = msg.id;
            let status = msg.status;
            let reached_oldest = msg_id == self.oldest_db_id;

            self.id_to_index.insert(msg_id, idx);
            self.push_backward(msg);
            self.hist_fetch_received += 1;
            let msg = &self.backward[self.backward.len() - 1];
            isolated("on_recv_history_message", || listener.on_recv_history_message(idx, msg, status, true));
            self.resolve_pointers(msg_id, idx);

            if reached_oldest {
                debug!("chat {}: reached the oldest message in the local store", self.chat_id);
                self.oldest_db_id = Id::NULL;
            }
        }

        if (fetched as u32) < requested && !self.oldest_db_id.is_null() {
            warn!("chat {}: local store returned {} of {} messages without reaching its oldest message - fetching the rest from the server",
                self.chat_id, fetched, requested);
            self.oldest_db_id = Id::NULL;
        }

        self.hist_fetch_state = HistFetchState::NotFetching;
        isolated("on_history_done", || listener.on_history_done(true));
    }

    /// HISTDONE from the server
    pub fn on_history_done(&mut self) {
        if self.hist_fetch_state != HistFetchState::FetchingFromServer {
            debug!("chat {}: HISTDONE without a pending server fetch - ignoring", self.chat_id);
            return;
        }

        self.hist_fetch_state = if self.hist_fetch_received < self.hist_fetch_requested {
            info!("chat {}: server has no more history ({} of {} messages)", self.chat_id, self.hist_fetch_received, self.hist_fetch_requested);
            HistFetchState::NoMoreHistory
        }
        else {
            HistFetchState::NotFetching
        };

        let listener = self.listener.clone();
        isolated("on_history_done", || listener.on_history_done(false));
    }

    //--------------------------- seen / received

    /// Marks everything up to `idx` as seen by the local user and tells the server. Returns
    ///  `false` if it was seen already.
    pub fn set_seen(&mut self, idx: Idx) -> ChatResult<bool> {
        let msg = self.at(idx)?;
        if self.last_seen.covers(idx) {
            return Ok(false);
        }
        let msg_id = msg.id;
        let is_sending = msg.is_sending();

        self.advance_seen(idx, msg_id);
        if !is_sending {
            self.send(ChatCommand::Seen(MsgRefData { chat_id: self.chat_id, msg_id }));
        }
        Ok(true)
    }

    /// SEEN from the server, i.e. from another session of the local user
    pub fn on_last_seen(&mut self, msg_id: Id) {
        match self.resolve_index(msg_id) {
            Some(idx) => {
                if !self.last_seen.covers(idx) {
                    self.advance_seen(idx, msg_id);
                }
            }
            None => {
                debug!("chat {}: seen pointer {} is not known yet", self.chat_id, msg_id);
                self.last_seen = Pointer { id: msg_id, idx: None };
            }
        }
    }

    /// RECEIVED from the server: other users received our messages up to `msg_id`
    pub fn on_last_received(&mut self, msg_id: Id) {
        match self.resolve_index(msg_id) {
            Some(idx) => {
                if !self.last_received.covers(idx) {
                    self.advance_received(idx, msg_id);
                }
            }
            None => {
                debug!("chat {}: received pointer {} is not known yet", self.chat_id, msg_id);
                self.last_received = Pointer { id: msg_id, idx: None };
            }
        }
    }

    fn resolve_index(&self, msg_id: Id) -> Option<Idx> {
        self.index_of(msg_id).or_else(|| {
            self.storage.index_of_id(msg_id)
                .unwrap_or_else(|e| {
                    error!("chat {}: error looking up {} in local store: {:#}", self.chat_id, msg_id, e);
                    None
                })
        })
    }

    /// a message arrived; it may be what an unresolved pointer refers to
    fn resolve_pointers(&mut self, msg_id: Id, idx: Idx) {
        if self.last_seen.idx.is_none() && self.last_seen.id == msg_id {
            self.advance_seen(idx, msg_id);
        }
        if self.last_received.idx.is_none() && self.last_received.id == msg_id {
            self.advance_received(idx, msg_id);
        }
    }

    fn advance_seen(&mut self, new_idx: Idx, msg_id: Id) {
        let from = self.last_seen.idx.map(|i| i + 1).unwrap_or(self.lownum()).max(self.lownum());
        self.last_seen = Pointer { id: msg_id, idx: Some(new_idx) };

        let user_id = self.user_id;
        let listener = self.listener.clone();
        for idx in from..=new_idx.min(self.highnum()) {
            let Some(msg) = self.find_mut(idx) else {
                continue;
            };
            if msg.user_id == user_id || msg.status == MessageStatus::Seen {
                continue;
            }
            msg.status = MessageStatus::Seen;
            let msg = &*msg;
            isolated("on_message_status_change", || listener.on_message_status_change(idx, MessageStatus::Seen, msg));
        }
    }

    fn advance_received(&mut self, new_idx: Idx, msg_id: Id) {
        let from = self.last_received.idx.map(|i| i + 1).unwrap_or(self.lownum()).max(self.lownum());
        self.last_received = Pointer { id: msg_id, idx: Some(new_idx) };

        let user_id = self.user_id;
        let listener = self.listener.clone();
        for idx in from..=new_idx.min(self.highnum()) {
            let Some(msg) = self.find_mut(idx) else {
                continue;
            };
            if msg.user_id != user_id || msg.status != MessageStatus::ServerReceived {
                continue;
            }
            msg.status = MessageStatus::Delivered;
            let msg = &*msg;
            isolated("on_message_status_change", || listener.on_message_status_change(idx, MessageStatus::Delivered, msg));
        }
    }

    /// Number of messages of other users newer than the seen pointer, including those that
    ///  are only in the local store
    pub fn unread_count(&self) -> u32 {
        let lownum = self.lownum();
        let first_unread = match self.last_seen.idx {
            Some(seen) => (seen + 1).max(lownum),
            None => lownum,
        };

        let mut count = (first_unread..=self.highnum())
            .filter_map(|idx| self.find(idx))
            .filter(|msg| msg.user_id != self.user_id)
            .count() as u32;

        if let Some(seen) = self.last_seen.idx {
            if seen + 1 < lownum {
                count += self.storage.peer_msg_count_after_idx(seen, lownum)
                    .unwrap_or_else(|e| {
                        error!("chat {}: error counting unread messages in local store: {:#}", self.chat_id, e);
                        0
                    });
            }
        }
        count
    }

    //--------------------------- room membership and online state

    /// The shard connection is up: join the room, resend what is pending, and get some
    ///  history if there is none at all
    pub fn rejoin(&mut self, initial_history_fetch_count: u32) {
        self.send(ChatCommand::Join(JoinData { chat_id: self.chat_id, user_id: self.user_id, privilege: Privilege::NoChange }));
        self.resend_pending();

        if self.is_empty() && self.oldest_db_id.is_null() && self.hist_fetch_state == HistFetchState::NotFetching {
            if let Err(e) = self.get_history(initial_history_fetch_count) {
                warn!("chat {}: could not request initial history: {}", self.chat_id, e);
            }
        }
    }

    pub fn leave(&self) {
        self.send(ChatCommand::Join(JoinData { chat_id: self.chat_id, user_id: self.user_id, privilege: Privilege::NotPresent }));
    }

    /// JOIN from the server: a user's membership changed
    pub fn on_join(&self, user: Id, privilege: Privilege) {
        let listener = self.listener.clone();
        if privilege == Privilege::NotPresent {
            debug!("chat {}: user {} left", self.chat_id, user);
            isolated("on_user_left", || listener.on_user_left(user));
        }
        else {
            debug!("chat {}: user {} joined with privilege {:?}", self.chat_id, user, privilege);
            isolated("on_user_joined", || listener.on_user_joined(user, privilege));
        }
    }

    pub fn on_broadcast(&self, user: Id, kind: u8) {
        let listener = self.listener.clone();
        isolated("on_broadcast", || listener.on_broadcast(user, kind));
    }

    pub fn set_online_state(&mut self, state: ChatState) {
        if self.online_state == state {
            return;
        }
        debug!("chat {}: online state {:?} -> {:?}", self.chat_id, self.online_state, state);
        self.online_state = state;

        if state == ChatState::Offline && self.hist_fetch_state == HistFetchState::FetchingFromServer {
            debug!("chat {}: connection lost during history fetch", self.chat_id);
            self.hist_fetch_state = HistFetchState::NotFetching;
        }

        let listener = self.listener.clone();
        isolated("on_online_state_change", || listener.on_online_state_change(state));
    }
}
