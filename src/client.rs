use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::chat::buffer::{CommandSink, MessageBuffer};
use crate::chat::filter::{MessageFilter, PlainFilter};
use crate::chat::listener::Listener;
use crate::chat::message::{ChatState, Idx, Message};
use crate::chat::shard::{chat_state_for, ShardConnection};
use crate::chat::storage::Storage;
use crate::config::ClientConfig;
use crate::error::{ChatError, ChatResult};
use crate::promise::{when, Promise};
use crate::protocol::chat_commands::{BroadcastData, ChatCommand, JoinData, MsgIdData, MsgRefData, RangeData, RejectData, RetentionData};
use crate::runtime::{LoopCtx, LoopMessage};
use crate::transport::connection::ConnectionState;
use crate::transport::{DnsResolverHook, Transport};
use crate::util::id::Id;

struct Room {
    shard: u32,
    buffer: MessageBuffer,
}

/// State shared by the client and its shard connections. Room buffers are only borrowed
///  while no connection state change can happen, since state changes are reported back into
///  the rooms.
pub struct ClientCore {
    ctx: Rc<LoopCtx>,
    config: Rc<ClientConfig>,
    user_id: Id,
    dns_hook: RefCell<Option<Rc<dyn DnsResolverHook>>>,
    next_xid: Cell<u64>,
    shards: RefCell<FxHashMap<u32, Rc<ShardConnection>>>,
    rooms: RefCell<FxHashMap<Id, Room>>,
    myself: Weak<ClientCore>,
}

impl ClientCore {
    fn next_xid(&self) -> Id {
        let mut xid = self.next_xid.get().wrapping_add(1);
        if xid == 0 {
            xid = 1;
        }
        self.next_xid.set(xid);
        Id::new(xid)
    }

    fn with_room<R>(&self, chat_id: Id, f: impl FnOnce(&mut MessageBuffer) -> R) -> ChatResult<R> {
        let mut rooms = self.rooms.borrow_mut();
        let room = rooms.get_mut(&chat_id)
            .ok_or(ChatError::UnknownRoom(chat_id))?;
        Ok(f(&mut room.buffer))
    }

    /// for commands from the server, which may refer to rooms that were left in the meantime
    fn with_room_on_shard(&self, shard: u32, chat_id: Id, f: impl FnOnce(&mut MessageBuffer)) {
        let mut rooms = self.rooms.borrow_mut();
        match rooms.get_mut(&chat_id) {
            Some(room) if room.shard == shard => f(&mut room.buffer),
            Some(room) => warn!("shard {}: command for chat {} which is on shard {} - ignoring", shard, chat_id, room.shard),
            None => debug!("shard {}: command for unknown chat {} - ignoring", shard, chat_id),
        }
    }

    /// MSGID and REJECT carry no chat id: the room is the one that sent the transaction
    fn with_sending_room(&self, shard: u32, xid: Id, f: impl FnOnce(&mut MessageBuffer)) {
        let mut rooms = self.rooms.borrow_mut();
        match rooms.values_mut().find(|r| r.shard == shard && r.buffer.is_sending(xid)) {
            Some(room) => f(&mut room.buffer),
            None => warn!("shard {}: no room is sending transaction {} - ignoring", shard, xid),
        }
    }

    fn shard(&self, shard: u32, transport: Box<dyn Transport>) -> Rc<ShardConnection> {
        if let Some(existing) = self.shards.borrow().get(&shard) {
            trace!("shard {}: reusing existing connection", shard);
            return existing.clone();
        }

        debug!("shard {}: creating connection", shard);
        let dns_hook = self.dns_hook.borrow().clone();
        let result = ShardConnection::new(&self.ctx, self.config.clone(), shard, transport, self.myself.clone(), dns_hook);
        self.shards.borrow_mut().insert(shard, result.clone());
        result
    }

    pub(crate) fn on_shard_connected(&self, shard: u32, chat_ids: &[Id]) {
        info!("shard {}: connected, joining {} rooms", shard, chat_ids.len());
        let initial_fetch = self.config.initial_history_fetch_count;
        for chat_id in chat_ids {
            self.with_room_on_shard(shard, *chat_id, |buffer| buffer.rejoin(initial_fetch));
        }
    }

    pub(crate) fn set_rooms_state(&self, chat_ids: &[Id], state: ChatState) {
        let mut rooms = self.rooms.borrow_mut();
        for chat_id in chat_ids {
            if let Some(room) = rooms.get_mut(chat_id) {
                room.buffer.set_online_state(state);
            }
        }
    }

    pub(crate) fn handle_command(&self, shard: u32, cmd: ChatCommand) {
        match cmd {
            ChatCommand::Keepalive => trace!("shard {}: recv KEEPALIVE", shard),
            ChatCommand::Join(JoinData { chat_id, user_id, privilege }) => {
                self.with_room_on_shard(shard, chat_id, |b| b.on_join(user_id, privilege));
            }
            ChatCommand::NewMsg(data) => {
                let chat_id = data.chat_id;
                self.with_room_on_shard(shard, chat_id, |b| { b.incoming(true, Message::from_server(data)); });
            }
            ChatCommand::OldMsg(data) => {
                let chat_id = data.chat_id;
                self.with_room_on_shard(shard, chat_id, |b| { b.incoming(false, Message::from_server(data)); });
            }
            ChatCommand::Seen(MsgRefData { chat_id, msg_id }) => {
                self.with_room_on_shard(shard, chat_id, |b| b.on_last_seen(msg_id));
            }
            ChatCommand::Received(MsgRefData { chat_id, msg_id }) => {
                self.with_room_on_shard(shard, chat_id, |b| b.on_last_received(msg_id));
            }
            ChatCommand::MsgId(MsgIdData { xid, msg_id }) => {
                self.with_sending_room(shard, xid, |b| b.confirm(xid, msg_id));
            }
            ChatCommand::Reject(RejectData { xid, reason }) => {
                self.with_sending_room(shard, xid, |b| b.reject(xid, reason));
            }
            ChatCommand::HistDone(chat_id) => {
                self.with_room_on_shard(shard, chat_id, |b| b.on_history_done());
            }
            ChatCommand::Broadcast(BroadcastData { chat_id, user_id, kind }) => {
                self.with_room_on_shard(shard, chat_id, |b| b.on_broadcast(user_id, kind));
            }
            ChatCommand::Retention(RetentionData { chat_id, user_id, period }) => {
                info!("chat {}: retention period set to {}s by {}", chat_id, period, user_id);
            }
            ChatCommand::Range(RangeData { chat_id, oldest, newest }) => {
                debug!("chat {}: server has messages {} to {}", chat_id, oldest, newest);
            }
            ChatCommand::Hist(data) => {
                warn!("shard {}: unexpected inbound HIST for chat {} - ignoring", shard, data.chat_id);
            }
        }
    }
}

fn unix_time_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// The chat client of one user: the rooms they joined, grouped by the shard that serves them.
///
/// All calls must happen on the loop thread that drives `ctx`.
pub struct ChatClient {
    core: Rc<ClientCore>,
}

impl ChatClient {
    pub fn new(ctx: &Rc<LoopCtx>, config: ClientConfig, user_id: Id) -> anyhow::Result<ChatClient> {
        config.validate()?;

        let first_xid = (rand::random::<u32>() as u64) << 32;
        let core = Rc::new_cyclic(|myself| ClientCore {
            ctx: ctx.clone(),
            config: Rc::new(config),
            user_id,
            dns_hook: RefCell::new(None),
            next_xid: Cell::new(first_xid),
            shards: Default::default(),
            rooms: Default::default(),
            myself: myself.clone(),
        });
        debug!("chat client for user {} created", user_id);
        Ok(ChatClient { core })
    }

    /// Applies to shard connections created after this call
    pub fn set_dns_hook(&self, hook: Rc<dyn DnsResolverHook>) {
        *self.core.dns_hook.borrow_mut() = Some(hook);
    }

    pub fn user_id(&self) -> Id {
        self.core.user_id
    }

    pub fn ctx(&self) -> &Rc<LoopCtx> {
        &self.core.ctx
    }

    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }

    pub fn join(
        &self,
        chat_id: Id,
        shard: u32,
        url: &str,
        transport: Box<dyn Transport>,
        listener: Rc<dyn Listener>,
        storage: Box<dyn Storage>,
    ) -> ChatResult<()> {
        self.join_with_filter(chat_id, shard, url, transport, listener, storage, Box::new(PlainFilter))
    }

    /// Joins a room served by `shard`, connecting to the shard at `url` unless it is connected
    ///  already. `transport` is used only if there is no connection to the shard yet.
    #[allow(clippy::too_many_arguments)]
    pub fn join_with_filter(
        &self,
        chat_id: Id,
        shard: u32,
        url: &str,
        transport: Box<dyn Transport>,
        listener: Rc<dyn Listener>,
        storage: Box<dyn Storage>,
        filter: Box<dyn MessageFilter>,
    ) -> ChatResult<()> {
        if self.core.rooms.borrow().contains_key(&chat_id) {
            debug!("chat {}: already joined", chat_id);
            return Ok(());
        }

        let shard_conn = self.core.shard(shard, transport);
        let sink: Weak<dyn CommandSink> = Rc::downgrade(&shard_conn) as Weak<dyn CommandSink>;
        let mut buffer = MessageBuffer::new(chat_id, self.core.user_id, listener, storage, filter, sink);
        buffer.set_online_state(chat_state_for(shard_conn.state()));
        if shard_conn.state() == ConnectionState::LoggedIn {
            buffer.rejoin(self.core.config.initial_history_fetch_count);
        }
        shard_conn.add_chat(chat_id);
        self.core.rooms.borrow_mut().insert(chat_id, Room { shard, buffer });
        info!("chat {}: joined on shard {}", chat_id, shard);

        shard_conn.connect(url)
            .on_settled(move |result| {
                if let Err(e) = result {
                    if e != ChatError::AlreadyConnecting {
                        warn!("shard {}: connect for chat {} failed: {}", shard, chat_id, e);
                    }
                }
            });
        Ok(())
    }

    /// Leaves a room, disconnecting its shard if no other room uses it
    pub fn leave(&self, chat_id: Id) -> ChatResult<()> {
        let room = self.core.rooms.borrow_mut().remove(&chat_id)
            .ok_or(ChatError::UnknownRoom(chat_id))?;
        room.buffer.leave();
        info!("chat {}: left", chat_id);

        let shard_conn = self.core.shards.borrow().get(&room.shard).cloned();
        if let Some(shard_conn) = shard_conn {
            if shard_conn.remove_chat(chat_id) {
                debug!("shard {}: no rooms left, disconnecting", room.shard);
                shard_conn.disconnect();
            }
        }
        Ok(())
    }

    pub fn submit(&self, chat_id: Id, payload: impl Into<Bytes>) -> ChatResult<Id> {
        let xid = self.core.next_xid();
        let payload = payload.into();
        self.core.with_room(chat_id, |b| b.submit(xid, unix_time_secs(), payload))
    }

    /// Edits the message `target`, which is a transaction id if `target_is_xid`
    pub fn modify(&self, chat_id: Id, target: Id, target_is_xid: bool, payload: impl Into<Bytes>) -> ChatResult<Id> {
        let xid = self.core.next_xid();
        let payload = payload.into();
        self.core.with_room(chat_id, |b| b.modify(xid, target, target_is_xid, unix_time_secs(), payload))?
    }

    /// Returns `true` if the history comes from the server, `false` if it comes from the local
    ///  store; either way it is delivered through the room's listener.
    pub fn get_history(&self, chat_id: Id, count: u32) -> ChatResult<bool> {
        let from_network = self.core.with_room(chat_id, |b| b.get_history(count))??;
        if !from_network {
            let weak = self.core.myself.clone();
            self.core.ctx.post(move || {
                if let Some(core) = weak.upgrade() {
                    let _ = core.with_room(chat_id, |b| b.fetch_db_history());
                }
            });
        }
        Ok(from_network)
    }

    pub fn set_seen(&self, chat_id: Id, idx: Idx) -> ChatResult<bool> {
        self.core.with_room(chat_id, |b| b.set_seen(idx))?
    }

    pub fn unread_count(&self, chat_id: Id) -> ChatResult<u32> {
        self.core.with_room(chat_id, |b| b.unread_count())
    }

    pub fn room_state(&self, chat_id: Id) -> ChatResult<ChatState> {
        self.core.with_room(chat_id, |b| b.online_state())
    }

    /// Read access to a room's messages. `f` must not call back into the client.
    pub fn with_buffer<R>(&self, chat_id: Id, f: impl FnOnce(&MessageBuffer) -> R) -> ChatResult<R> {
        self.core.with_room(chat_id, |b| f(b))
    }

    pub fn joined_rooms(&self) -> Vec<Id> {
        let mut result: Vec<Id> = self.core.rooms.borrow().keys().copied().collect();
        result.sort();
        result
    }

    pub fn shard_state(&self, shard: u32) -> Option<ConnectionState> {
        self.core.shards.borrow().get(&shard).map(|s| s.state())
    }

    /// Reconnects shards that gave up retrying, e.g. after the network came back
    pub fn retry_pending_connections(&self) {
        let shards: Vec<_> = self.core.shards.borrow().values().cloned().collect();
        for shard in shards {
            let connection = shard.connection();
            if connection.state() == ConnectionState::Disconnected && !shard.chat_ids().is_empty() {
                debug!("shard {}: retrying connection", shard.shard());
                connection.reconnect(None);
            }
        }
    }

    /// Handles one event that was marshalled to the loop thread
    pub fn dispatch(&self, msg: LoopMessage) {
        self.core.ctx.dispatch(msg);
    }

    /// Drives the loop thread until [`LoopCtx::stop`] is called
    pub async fn run(&self) -> anyhow::Result<()> {
        self.core.ctx.run().await
    }

    /// Gracefully disconnects all shards
    pub fn disconnect(&self) -> Promise<()> {
        let shards: Vec<_> = self.core.shards.borrow().values().cloned().collect();
        info!("disconnecting {} shards", shards.len());
        when(shards.iter().map(|s| s.disconnect()).collect()).discard()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::{BufMut, BytesMut};
    use tokio::time;

    use super::*;
    use crate::chat::message::MessageStatus;
    use crate::chat::storage::HistoryBounds;
    use crate::error::TransportFailureKind;
    use crate::protocol::chat_commands::{HistData, MsgData, Privilege};
    use crate::protocol::command::ProtocolCommand;
    use crate::test_util::listener::{ChatEvent, RecordingListener};
    use crate::test_util::storage::MemoryStorage;
    use crate::test_util::transport::TransportLog;
    use crate::transport::MockDnsResolverHook;

    const ME: Id = Id::new(1);
    const PEER: Id = Id::new(2);
    const CHAT: Id = Id::new(100);
    const OTHER_CHAT: Id = Id::new(101);

    struct Fixture {
        ctx: Rc<LoopCtx>,
        client: ChatClient,
        log: TransportLog,
        listener: Rc<RecordingListener>,
        storage: MemoryStorage,
    }

    fn fixture() -> Fixture {
        fixture_with(ClientConfig::new())
    }

    fn fixture_with(config: ClientConfig) -> Fixture {
        let ctx = LoopCtx::new();
        let client = ChatClient::new(&ctx, config, ME).unwrap();
        let log = TransportLog::new();
        let listener = Rc::new(RecordingListener::default());
        let storage = MemoryStorage::new(ME);
        Fixture { ctx, client, log, listener, storage }
    }

    impl Fixture {
        fn join(&self, chat_id: Id) {
            self.client.join(chat_id, 0, "wss://shard0", Box::new(self.log.mock()), self.listener.clone(), Box::new(self.storage.clone())).unwrap();
        }

        fn server(&self, cmd: ChatCommand) {
            self.log.sink().data(cmd.to_command().to_frame());
            self.ctx.process_pending();
        }

        fn commands(&self) -> Vec<ChatCommand> {
            self.log.take_commands::<ChatCommand>()
        }
    }

    fn msg_data(chat_id: Id, msg_id: u64, user_id: Id, payload: &'static str) -> MsgData {
        MsgData { chat_id, msg_id: Id::new(msg_id), user_id, ts: 1000, payload: Bytes::from_static(payload.as_bytes()) }
    }

    /// joined and online, with the initial history request answered as empty
    fn online() -> Fixture {
        let f = fixture();
        f.join(CHAT);
        f.log.sink().opened();
        f.ctx.process_pending();
        f.server(ChatCommand::HistDone(CHAT));
        f.commands();
        f.listener.take();
        f
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_connects_and_joins() {
        let f = fixture();
        f.join(CHAT);

        assert_eq!(f.log.urls(), vec!["wss://shard0".to_string()]);
        assert_eq!(f.client.room_state(CHAT), Ok(ChatState::Connecting));

        f.log.sink().opened();
        f.ctx.process_pending();

        assert_eq!(f.commands(), vec![
            ChatCommand::Join(JoinData { chat_id: CHAT, user_id: ME, privilege: Privilege::NoChange }),
            ChatCommand::Hist(HistData { chat_id: CHAT, count: -32 }),
        ]);
        assert_eq!(f.client.room_state(CHAT), Ok(ChatState::Online));
        assert_eq!(f.client.shard_state(0), Some(ConnectionState::LoggedIn));
        assert_eq!(f.listener.take(), vec![
            ChatEvent::OnlineState(ChatState::Connecting),
            ChatEvent::OnlineState(ChatState::Joining),
            ChatEvent::OnlineState(ChatState::Online),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rooms_share_a_shard_connection() {
        let f = online();
        f.join(OTHER_CHAT);

        assert_eq!(f.log.num_opened(), 1);
        assert_eq!(f.client.room_state(OTHER_CHAT), Ok(ChatState::Online));
        assert_eq!(f.commands(), vec![
            ChatCommand::Join(JoinData { chat_id: OTHER_CHAT, user_id: ME, privilege: Privilege::NoChange }),
            ChatCommand::Hist(HistData { chat_id: OTHER_CHAT, count: -32 }),
        ]);
        assert_eq!(f.client.joined_rooms(), vec![CHAT, OTHER_CHAT]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_and_confirm_through_server() {
        let f = online();
        let xid = f.client.submit(CHAT, "hi").unwrap();

        let sent = f.commands();
        assert!(matches!(sent.as_slice(), [ChatCommand::NewMsg(d)] if d.msg_id == xid && d.payload == Bytes::from_static(b"hi")));

        f.server(ChatCommand::MsgId(MsgIdData { xid, msg_id: Id::new(500) }));

        assert_eq!(f.listener.take(), vec![ChatEvent::Confirmed { xid, msg_id: Id::new(500), idx: 0 }]);
        let (id, status) = f.client.with_buffer(CHAT, |b| {
            let msg = b.at(0).unwrap();
            (msg.id, msg.status)
        }).unwrap();
        assert_eq!(id, Id::new(500));
        assert_eq!(status, MessageStatus::ServerReceived);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_is_routed_to_sending_room() {
        let f = online();
        f.join(OTHER_CHAT);
        f.commands();

        let xid_1 = f.client.submit(CHAT, "one").unwrap();
        let xid_2 = f.client.submit(OTHER_CHAT, "two").unwrap();
        assert_ne!(xid_1, xid_2);
        f.listener.take();

        f.server(ChatCommand::Reject(RejectData { xid: xid_2, reason: 4 }));
        f.server(ChatCommand::MsgId(MsgIdData { xid: xid_1, msg_id: Id::new(500) }));

        assert_eq!(f.listener.take(), vec![
            ChatEvent::Rejected { xid: xid_2, reason: 4 },
            ChatEvent::Confirmed { xid: xid_1, msg_id: Id::new(500), idx: 0 },
        ]);
        assert_eq!(f.client.with_buffer(OTHER_CHAT, |b| b.len()), Ok(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_messages_and_seen() {
        let f = online();
        f.server(ChatCommand::NewMsg(msg_data(CHAT, 10, PEER, "a")));
        f.server(ChatCommand::NewMsg(msg_data(CHAT, 11, PEER, "b")));
        f.server(ChatCommand::Join(JoinData { chat_id: CHAT, user_id: PEER, privilege: Privilege::ReadWrite }));

        assert_eq!(f.client.unread_count(CHAT), Ok(2));
        assert_eq!(f.client.set_seen(CHAT, 0), Ok(true));
        assert_eq!(f.client.unread_count(CHAT), Ok(1));
        assert_eq!(f.commands(), vec![ChatCommand::Seen(MsgRefData { chat_id: CHAT, msg_id: Id::new(10) })]);

        assert_eq!(f.listener.take(), vec![
            ChatEvent::NewMessage { idx: 0, id: Id::new(10), status: MessageStatus::NotSeen },
            ChatEvent::NewMessage { idx: 1, id: Id::new(11), status: MessageStatus::NotSeen },
            ChatEvent::UserJoined(PEER, Privilege::ReadWrite),
            ChatEvent::StatusChange { idx: 0, status: MessageStatus::Seen },
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_from_local_store_is_delivered_by_loop() {
        let f = fixture();
        for i in 0..5u64 {
            f.storage.add_history(i as Idx, Message::from_server(msg_data(CHAT, i + 1, PEER, "old")));
        }
        f.storage.set_bounds(HistoryBounds { oldest: Id::new(1), newest: Id::new(5), newest_idx: 4 });
        f.join(CHAT);

        assert_eq!(f.client.get_history(CHAT, 3), Ok(false));
        assert_eq!(f.client.get_history(CHAT, 3), Err(ChatError::AlreadyFetching));
        assert_eq!(f.client.with_buffer(CHAT, |b| b.len()), Ok(0));

        f.ctx.process_pending();

        assert_eq!(f.client.with_buffer(CHAT, |b| (b.lownum(), b.highnum())), Ok((2, 4)));
        assert_eq!(f.listener.take().last(), Some(&ChatEvent::HistoryDone { from_db: true }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_messages_are_resent_after_reconnect() {
        let f = online();
        let xid = f.client.submit(CHAT, "hi").unwrap();
        f.commands();

        f.log.sink().closed(1006, crate::error::TransportFailureKind::Closed, "gone");
        f.ctx.process_pending();
        assert_eq!(f.client.room_state(CHAT), Ok(ChatState::Connecting));

        // first retry is immediate
        assert_eq!(f.log.num_opened(), 2);
        f.log.sink().opened();
        f.ctx.process_pending();

        let sent = f.commands();
        assert_eq!(sent[0], ChatCommand::Join(JoinData { chat_id: CHAT, user_id: ME, privilege: Privilege::NoChange }));
        assert!(matches!(&sent[1], ChatCommand::NewMsg(d) if d.msg_id == xid));
        assert_eq!(sent.len(), 2);
        assert_eq!(f.client.room_state(CHAT), Ok(ChatState::Online));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_disconnects_unused_shard() {
        let f = online();
        f.client.leave(CHAT).unwrap();

        assert_eq!(f.commands(), vec![ChatCommand::Join(JoinData { chat_id: CHAT, user_id: ME, privilege: Privilege::NotPresent })]);
        assert_eq!(f.log.closed(), vec![true]);
        assert_eq!(f.client.shard_state(0), Some(ConnectionState::Disconnecting));
        assert_eq!(f.client.submit(CHAT, "hi"), Err(ChatError::UnknownRoom(CHAT)));
        assert_eq!(f.client.leave(CHAT), Err(ChatError::UnknownRoom(CHAT)));

        time::advance(Duration::from_secs(5)).await;
        f.ctx.process_pending();
        assert_eq!(f.client.shard_state(0), Some(ConnectionState::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_for_unknown_rooms_are_ignored() {
        let f = online();
        f.server(ChatCommand::NewMsg(msg_data(OTHER_CHAT, 10, PEER, "a")));
        f.server(ChatCommand::MsgId(MsgIdData { xid: Id::new(77), msg_id: Id::new(500) }));
        f.server(ChatCommand::Keepalive);

        assert!(f.listener.take().is_empty());
        assert_eq!(f.client.room_state(CHAT), Ok(ChatState::Online));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect() {
        let f = online();
        let disconnected = f.client.disconnect();
        assert!(!disconnected.is_settled());

        f.log.sink().closed(1000, crate::error::TransportFailureKind::Closed, "bye");
        f.ctx.process_pending();

        assert_eq!(disconnected.peek(), Some(Ok(())));
        assert_eq!(f.client.room_state(CHAT), Ok(ChatState::Offline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_framing_error_discards_rest_of_frame_and_keeps_shard_up() {
        let f = online();
        let mut frame = BytesMut::new();
        ChatCommand::NewMsg(msg_data(CHAT, 600, PEER, "first")).ser(&mut frame);
        frame.put_u8(200);
        ChatCommand::NewMsg(msg_data(CHAT, 601, PEER, "second")).ser(&mut frame);
        f.log.sink().data(frame.freeze());
        f.ctx.process_pending();

        assert_eq!(f.client.with_buffer(CHAT, |b| b.index_of(Id::new(600))), Ok(Some(0)));
        assert_eq!(f.client.with_buffer(CHAT, |b| b.index_of(Id::new(601))), Ok(None));
        assert_eq!(f.client.shard_state(0), Some(ConnectionState::LoggedIn));
        assert!(f.log.closed().is_empty());

        f.server(ChatCommand::NewMsg(msg_data(CHAT, 602, PEER, "third")));
        assert_eq!(f.client.with_buffer(CHAT, |b| b.index_of(Id::new(602))), Ok(Some(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_pending_connections_reconnects_shards_with_rooms() {
        let mut config = ClientConfig::new();
        config.backoff.max_attempts = Some(1);
        let f = fixture_with(config);
        f.join(CHAT);

        f.log.sink().closed(0, TransportFailureKind::Connect, "connection refused");
        f.ctx.process_pending();
        time::advance(Duration::from_secs(60)).await;
        f.ctx.process_pending();
        assert_eq!(f.log.num_opened(), 1);
        assert_eq!(f.client.shard_state(0), Some(ConnectionState::Disconnected));
        assert_eq!(f.client.room_state(CHAT), Ok(ChatState::Offline));

        f.client.retry_pending_connections();
        assert_eq!(f.log.num_opened(), 2);
        assert_eq!(f.client.room_state(CHAT), Ok(ChatState::Connecting));

        f.log.sink().opened();
        f.ctx.process_pending();
        assert_eq!(f.client.shard_state(0), Some(ConnectionState::LoggedIn));

        // nothing to do while connected
        f.client.retry_pending_connections();
        assert_eq!(f.log.num_opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dns_failure_on_shard_invalidates_resolver_cache() {
        let f = fixture();
        let invalidations = Arc::new(AtomicUsize::new(0));
        let mut hook = MockDnsResolverHook::new();
        let counter = invalidations.clone();
        hook.expect_invalidate_resolver_cache()
            .returning(move || { counter.fetch_add(1, Ordering::SeqCst); });
        f.client.set_dns_hook(Rc::new(hook));
        f.join(CHAT);

        f.log.sink().closed(0, TransportFailureKind::Dns, "no such host");
        f.ctx.process_pending();
        assert_eq!(invalidations.load(Ordering::SeqCst), 1);

        time::advance(Duration::from_secs(1)).await;
        f.ctx.process_pending();
        assert_eq!(f.log.num_opened(), 2);
        f.log.sink().closed(0, TransportFailureKind::Connect, "connection refused");
        f.ctx.process_pending();
        assert_eq!(invalidations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let ctx = LoopCtx::new();
        let mut config = ClientConfig::new();
        config.keepalive_timeout = Duration::from_secs(60);
        assert!(ChatClient::new(&ctx, config, ME).is_err());
    }
}
