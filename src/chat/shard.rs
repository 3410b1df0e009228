use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use tracing::{debug, error, trace};

use crate::chat::buffer::CommandSink;
use crate::chat::message::ChatState;
use crate::client::ClientCore;
use crate::config::ClientConfig;
use crate::error::ChatError;
use crate::promise::Promise;
use crate::protocol::chat_commands::ChatCommand;
use crate::protocol::command::{CommandDecoder, ProtocolCommand};
use crate::runtime::{ConnectionKey, LoopCtx};
use crate::transport::connection::{Connection, ConnectionHandler, ConnectionState};
use crate::transport::{DnsResolverHook, Transport};
use crate::util::id::Id;

/// The connection to one chat shard, shared by all joined rooms that live on the shard
pub struct ShardConnection {
    shard: u32,
    connection: Rc<Connection>,
    core: Weak<ClientCore>,
    chat_ids: RefCell<BTreeSet<Id>>,
}

impl ShardConnection {
    pub fn new(
        ctx: &Rc<LoopCtx>,
        config: Rc<ClientConfig>,
        shard: u32,
        transport: Box<dyn Transport>,
        core: Weak<ClientCore>,
        dns_hook: Option<Rc<dyn DnsResolverHook>>,
    ) -> Rc<ShardConnection> {
        Rc::new_cyclic(|myself: &Weak<ShardConnection>| {
            let handler: Weak<dyn ConnectionHandler> = myself.clone();
            ShardConnection {
                shard,
                connection: Connection::new(ctx, config, ConnectionKey::Shard(shard), transport, handler, dns_hook),
                core,
                chat_ids: Default::default(),
            }
        })
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    pub fn connection(&self) -> &Rc<Connection> {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn chat_ids(&self) -> Vec<Id> {
        self.chat_ids.borrow().iter().copied().collect()
    }

    pub fn add_chat(&self, chat_id: Id) {
        self.chat_ids.borrow_mut().insert(chat_id);
    }

    /// returns `true` if no rooms are left on the shard
    pub fn remove_chat(&self, chat_id: Id) -> bool {
        let mut chat_ids = self.chat_ids.borrow_mut();
        chat_ids.remove(&chat_id);
        chat_ids.is_empty()
    }

    /// Connects unless a connect is in progress or the connection is up. A changed `url`
    ///  takes effect with the next connect.
    pub fn connect(&self, url: &str) -> Promise<()> {
        match self.connection.state() {
            ConnectionState::Disconnected => self.connection.reconnect(Some(url)),
            ConnectionState::Disconnecting => {
                debug!("shard {}: waiting for disconnect to complete before reconnecting", self.shard);
                let result = Promise::new();
                let forward_to = result.clone();
                let weak = Rc::downgrade(&self.connection);
                let url = url.to_string();
                self.connection.disconnect()
                    .on_settled(move |_| {
                        match weak.upgrade() {
                            Some(connection) => connection.reconnect(Some(&url)).forward_to(forward_to),
                            None => { let _ = forward_to.reject(ChatError::Cancelled); }
                        }
                    });
                result
            }
            state => {
                if self.connection.url().as_deref() != Some(url) {
                    debug!("shard {}: URL changed to {} while {:?}, keeping the current connection", self.shard, url, state);
                }
                Promise::resolved(())
            }
        }
    }

    pub fn disconnect(&self) -> Promise<()> {
        self.connection.disconnect()
    }
}

/// Room state as seen through the state of its shard connection
pub fn chat_state_for(state: ConnectionState) -> ChatState {
    match state {
        ConnectionState::Disconnected | ConnectionState::Disconnecting => ChatState::Offline,
        ConnectionState::Connecting => ChatState::Connecting,
        ConnectionState::Connected => ChatState::Joining,
        ConnectionState::LoggedIn => ChatState::Online,
    }
}

impl CommandSink for ShardConnection {
    fn send_command(&self, cmd: ChatCommand) -> bool {
        if !self.connection.is_online() {
            trace!("shard {}: offline, not sending {}", self.shard, cmd);
            return false;
        }
        let command = cmd.to_command();
        debug!("shard {}: send {}", self.shard, command.describe::<ChatCommand>());
        self.connection.send_frame(&command.to_frame())
    }

    fn is_online(&self) -> bool {
        self.connection.is_online()
    }
}

impl ConnectionHandler for ShardConnection {
    /// The chat protocol has no handshake: joining the rooms is all there is to it
    fn on_connected(&self) -> Promise<()> {
        if let Some(core) = self.core.upgrade() {
            core.on_shard_connected(self.shard, &self.chat_ids());
        }
        Promise::resolved(())
    }

    fn on_frame(&self, frame: &[u8]) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        for cmd in CommandDecoder::<ChatCommand>::new(frame) {
            match cmd {
                Ok(cmd) => {
                    debug!("shard {}: recv {}", self.shard, cmd);
                    core.handle_command(self.shard, cmd);
                }
                Err(e) => {
                    error!("shard {}: {} - discarding the rest of the frame", self.shard, e);
                    return;
                }
            }
        }
    }

    fn on_disconnected(&self) {
        debug!("shard {}: disconnected", self.shard);
    }

    fn on_state_change(&self, _old: ConnectionState, new: ConnectionState) {
        if let Some(core) = self.core.upgrade() {
            core.set_rooms_state(&self.chat_ids(), chat_state_for(new));
        }
    }
}
