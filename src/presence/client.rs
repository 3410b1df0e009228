use std::cell::RefCell;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::presence::config::{Presence, PresenceConfig};
use crate::promise::Promise;
use crate::protocol::command::{CommandDecoder, ProtocolCommand};
use crate::protocol::presence_commands::{HelloData, PeerStatusData, PresenceCommand, PRESENCE_PROTOCOL_VERSION};
use crate::runtime::{ConnectionKey, LoopCtx};
use crate::transport::connection::{Connection, ConnectionHandler, ConnectionState};
use crate::transport::{DnsResolverHook, Transport};
use crate::util::id::Id;
use crate::util::isolate::isolated;

/// Notifications of the presence client. All methods are called on the loop thread, and
///  panics are caught and logged.
pub trait PresenceListener {
    fn on_presence_change(&self, _user: Id, _presence: Presence) {}

    /// `pending` is true while a locally changed config was not acknowledged by the server
    fn on_presence_config_changed(&self, _config: &PresenceConfig, _pending: bool) {}

    fn on_connection_state_change(&self, _state: ConnectionState) {}
}

struct PresenceInner {
    config: PresenceConfig,
    awaiting_ack: bool,
    /// resolved by the first PREFS after connecting
    login: Option<Promise<()>>,
    ts_last_user_activity: Instant,
    last_sent_user_active: Option<bool>,
    /// reference counted
    peers: FxHashMap<Id, u32>,
}

pub struct PresenceClient {
    ctx: Rc<LoopCtx>,
    config: Rc<ClientConfig>,
    connection: Rc<Connection>,
    listener: Rc<dyn PresenceListener>,
    inner: RefCell<PresenceInner>,
}

impl PresenceClient {
    pub fn new(
        ctx: &Rc<LoopCtx>,
        config: Rc<ClientConfig>,
        transport: Box<dyn Transport>,
        listener: Rc<dyn PresenceListener>,
        dns_hook: Option<Rc<dyn DnsResolverHook>>,
    ) -> Rc<PresenceClient> {
        Rc::new_cyclic(|myself: &Weak<PresenceClient>| {
            let handler: Weak<dyn ConnectionHandler> = myself.clone();
            PresenceClient {
                ctx: ctx.clone(),
                connection: Connection::new(ctx, config.clone(), ConnectionKey::Presence, transport, handler, dns_hook),
                config,
                listener,
                inner: RefCell::new(PresenceInner {
                    config: PresenceConfig::default(),
                    awaiting_ack: false,
                    login: None,
                    ts_last_user_activity: ctx.now(),
                    last_sent_user_active: None,
                    peers: Default::default(),
                }),
            }
        })
    }

    /// Resolves once the server sent the user's presence config
    pub fn connect(&self, url: &str) -> Promise<()> {
        self.connection.reconnect(Some(url))
    }

    pub fn disconnect(&self) -> Promise<()> {
        self.connection.disconnect()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn config(&self) -> PresenceConfig {
        self.inner.borrow().config
    }

    pub fn is_config_acknowledged(&self) -> bool {
        !self.inner.borrow().awaiting_ack
    }

    pub fn set_presence(&self, presence: Presence) -> bool {
        if self.inner.borrow().config.presence == presence {
            return true;
        }
        self.inner.borrow_mut().config.presence = presence;
        let result = self.send_prefs();
        self.signal_activity(true);
        debug!("presence: set presence to {:?}", presence);
        result
    }

    pub fn set_persist(&self, persist: bool) -> bool {
        if self.inner.borrow().config.persist == persist {
            return true;
        }
        self.inner.borrow_mut().config.persist = persist;
        self.signal_activity(true);
        self.send_prefs()
    }

    /// Enabling auto-away turns off persistence, since a persisted presence is never
    ///  changed automatically
    pub fn set_autoaway(&self, enable: bool, timeout_secs: u32) -> bool {
        {
            let config = &mut self.inner.borrow_mut().config;
            if enable {
                config.persist = false;
            }
            config.autoaway_timeout_secs = timeout_secs;
            config.autoaway_active = enable;
        }
        self.signal_activity(true);
        self.send_prefs()
    }

    /// Called by the application on user interaction, resets the auto-away idle time
    pub fn signal_activity(&self, force: bool) {
        let presence = {
            let mut inner = self.inner.borrow_mut();
            inner.ts_last_user_activity = self.ctx.now();
            inner.config.presence
        };
        match presence {
            Presence::Away => { self.send_user_active(false, false); }
            Presence::Offline => {}
            _ => { self.send_user_active(true, force); }
        }
    }

    pub fn add_peer(&self, peer: Id) {
        let is_new = {
            let mut inner = self.inner.borrow_mut();
            let count = inner.peers.entry(peer).or_default();
            *count += 1;
            *count == 1
        };
        if is_new {
            self.send_command(PresenceCommand::AddPeers(vec![peer]));
        }
    }

    /// Removes one reference to a peer, or the peer itself if `force` is set. The server is
    ///  told when the peer is gone.
    pub fn remove_peer(&self, peer: Id, force: bool) {
        {
            let mut inner = self.inner.borrow_mut();
            let Some(count) = inner.peers.get_mut(&peer) else {
                debug!("presence: remove_peer for unknown peer {}", peer);
                return;
            };
            *count -= 1;
            if *count > 0 {
                if !force {
                    return;
                }
                debug!("presence: forcing removal of peer {} with refcount {}", peer, count);
            }
            inner.peers.remove(&peer);
        }
        self.send_command(PresenceCommand::DelPeers(vec![peer]));
    }

    pub fn peers(&self) -> Vec<Id> {
        let mut result: Vec<Id> = self.inner.borrow().peers.keys().copied().collect();
        result.sort();
        result
    }

    fn send_prefs(&self) -> bool {
        let (config, code) = {
            let mut inner = self.inner.borrow_mut();
            inner.awaiting_ack = true;
            (inner.config, inner.config.to_code())
        };
        self.notify_config_changed(&config, true);
        self.send_command(PresenceCommand::Prefs(code))
    }

    fn send_user_active(&self, active: bool, force: bool) -> bool {
        if self.inner.borrow().last_sent_user_active == Some(active) && !force {
            return true;
        }
        if !self.send_command(PresenceCommand::UserActive(active)) {
            return false;
        }
        self.inner.borrow_mut().last_sent_user_active = Some(active);
        true
    }

    fn send_command(&self, cmd: PresenceCommand) -> bool {
        if !self.connection.is_online() {
            trace!("presence: offline, not sending {}", cmd);
            return false;
        }
        let command = cmd.to_command();
        debug!("presence: send {}", command.describe::<PresenceCommand>());
        self.connection.send_frame(&command.to_frame())
    }

    fn notify_config_changed(&self, config: &PresenceConfig, pending: bool) {
        isolated("presence config listener", || self.listener.on_presence_config_changed(config, pending));
    }

    fn on_prefs(&self, code: u16) {
        let (config, login) = {
            let mut inner = self.inner.borrow_mut();
            if inner.awaiting_ack && code == inner.config.to_code() {
                debug!("presence: server acknowledged our prefs (0x{:x})", code);
            }
            else {
                inner.config = PresenceConfig::from_code(code);
                if inner.awaiting_ack {
                    debug!("presence: received other prefs while waiting for our ack, dropping ours: {}", inner.config);
                }
                else {
                    debug!("presence: received prefs from another client: {}", inner.config);
                }
            }
            inner.awaiting_ack = false;
            (inner.config, inner.login.take())
        };

        if let Some(login) = login {
            info!("presence: logged in");
            let _ = login.resolve(());
        }
        self.notify_config_changed(&config, false);
    }

    fn handle_command(&self, cmd: PresenceCommand) {
        match cmd {
            PresenceCommand::Keepalive => trace!("presence: recv KEEPALIVE"),
            PresenceCommand::PeerStatus(PeerStatusData { presence, user_id }) => {
                debug!("presence: recv PEERSTATUS - user {} with presence {:?}", user_id, presence);
                isolated("presence change listener", || self.listener.on_presence_change(user_id, presence));
            }
            PresenceCommand::Prefs(code) => self.on_prefs(code),
            other => warn!("presence: unexpected inbound command {} - ignoring", other),
        }
    }

    fn push_peers(&self) {
        let peers = self.peers();
        if !peers.is_empty() {
            self.send_command(PresenceCommand::AddPeers(peers));
        }
    }

    fn is_user_active(&self, now: Instant) -> bool {
        let inner = self.inner.borrow();
        now - inner.ts_last_user_activity < inner.config.autoaway_timeout()
    }
}

impl ConnectionHandler for PresenceClient {
    fn on_connected(&self) -> Promise<()> {
        let login = Promise::new();
        let awaiting_ack = {
            let mut inner = self.inner.borrow_mut();
            inner.login = Some(login.clone());
            inner.awaiting_ack
        };

        self.send_command(PresenceCommand::Hello(HelloData {
            version: PRESENCE_PROTOCOL_VERSION,
            capabilities: self.config.presence_capabilities,
        }));
        if awaiting_ack {
            self.send_prefs();
        }
        self.send_user_active(self.is_user_active(self.ctx.now()), true);
        self.push_peers();
        login
    }

    fn on_frame(&self, frame: &[u8]) {
        for cmd in CommandDecoder::<PresenceCommand>::new(frame) {
            match cmd {
                Ok(cmd) => self.handle_command(cmd),
                Err(e) => {
                    error!("presence: {} - discarding the rest of the frame", e);
                    return;
                }
            }
        }
    }

    fn on_disconnected(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.login = None;
        inner.last_sent_user_active = None;
    }

    fn on_state_change(&self, _old: ConnectionState, new: ConnectionState) {
        isolated("presence connection state listener", || self.listener.on_connection_state_change(new));
    }

    fn on_heartbeat(&self, now: Instant) {
        let idle = {
            let inner = self.inner.borrow();
            inner.config.autoaway_in_effect() && now - inner.ts_last_user_activity > inner.config.autoaway_timeout()
        };
        if idle {
            self.send_user_active(false, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::{Bytes, BytesMut};
    use tokio::time;

    use super::*;
    use crate::protocol::presence_commands::Capabilities;
    use crate::test_util::listener::RecordingPresenceListener;
    use crate::test_util::transport::TransportLog;

    struct Fixture {
        ctx: Rc<LoopCtx>,
        client: Rc<PresenceClient>,
        listener: Rc<RecordingPresenceListener>,
        log: TransportLog,
    }

    fn fixture() -> Fixture {
        let ctx = LoopCtx::new();
        let mut config = ClientConfig::new();
        config.presence_capabilities = Capabilities::WEBRTC;
        let listener = Rc::new(RecordingPresenceListener::default());
        let log = TransportLog::new();
        let client = PresenceClient::new(&ctx, Rc::new(config), Box::new(log.mock()), listener.clone(), None);
        Fixture { ctx, client, listener, log }
    }

    fn frame(cmd: PresenceCommand) -> Bytes {
        cmd.to_command().to_frame()
    }

    /// connects and completes the login with a PREFS from the server
    fn logged_in(prefs: u16) -> Fixture {
        let f = fixture();
        f.client.connect("wss://presence");
        let sink = f.log.sink();
        sink.opened();
        sink.data(frame(PresenceCommand::Prefs(prefs)));
        f.ctx.process_pending();
        assert_eq!(f.client.connection_state(), ConnectionState::LoggedIn);
        f.log.take_commands::<PresenceCommand>();
        f
    }

    /// one heartbeat period, with the server answering keepalives
    async fn tick(f: &Fixture) {
        f.log.sink().data(frame(PresenceCommand::Keepalive));
        time::advance(Duration::from_secs(10)).await;
        f.ctx.process_pending();
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_handshake() {
        let f = fixture();
        f.client.add_peer(Id::new(5));
        let connected = f.client.connect("wss://presence");
        f.log.sink().opened();
        f.ctx.process_pending();

        assert_eq!(f.log.take_commands::<PresenceCommand>(), vec![
            PresenceCommand::Hello(HelloData { version: PRESENCE_PROTOCOL_VERSION, capabilities: Capabilities::WEBRTC }),
            PresenceCommand::UserActive(true),
            PresenceCommand::AddPeers(vec![Id::new(5)]),
        ]);
        assert_eq!(f.client.connection_state(), ConnectionState::Connected);
        assert!(!connected.is_settled());

        let server_config = PresenceConfig { presence: Presence::Busy, ..Default::default() };
        f.log.sink().data(frame(PresenceCommand::Prefs(server_config.to_code())));
        f.ctx.process_pending();

        assert_eq!(connected.peek(), Some(Ok(())));
        assert_eq!(f.client.connection_state(), ConnectionState::LoggedIn);
        assert_eq!(f.client.config(), server_config);
        assert_eq!(f.listener.configs(), vec![(server_config, false)]);
        assert_eq!(f.listener.states().last(), Some(&ConnectionState::LoggedIn));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_presence_and_ack() {
        let f = logged_in(PresenceConfig::default().to_code());

        assert!(f.client.set_presence(Presence::Busy));
        assert!(!f.client.is_config_acknowledged());
        let expected = PresenceConfig { presence: Presence::Busy, ..Default::default() };
        assert_eq!(f.log.take_commands::<PresenceCommand>(), vec![
            PresenceCommand::Prefs(expected.to_code()),
            PresenceCommand::UserActive(true),
        ]);

        f.log.sink().data(frame(PresenceCommand::Prefs(expected.to_code())));
        f.ctx.process_pending();
        assert!(f.client.is_config_acknowledged());
        assert_eq!(f.client.config(), expected);
        assert_eq!(f.listener.configs()[1..], [(expected, true), (expected, false)]);

        // unchanged: nothing sent
        assert!(f.client.set_presence(Presence::Busy));
        f.log.assert_no_remaining_commands();
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_prefs_from_other_session_win() {
        let f = logged_in(PresenceConfig::default().to_code());

        f.client.set_presence(Presence::Busy);
        let other = PresenceConfig { presence: Presence::Away, persist: true, ..Default::default() };
        f.log.sink().data(frame(PresenceCommand::Prefs(other.to_code())));
        f.ctx.process_pending();

        assert_eq!(f.client.config(), other);
        assert!(f.client.is_config_acknowledged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_prefs_are_resent_on_reconnect() {
        let f = logged_in(PresenceConfig::default().to_code());
        f.client.set_persist(true);
        f.log.take_commands::<PresenceCommand>();

        f.log.sink().closed(1006, crate::error::TransportFailureKind::Closed, "reset");
        f.ctx.process_pending();
        f.log.sink().opened();
        f.ctx.process_pending();

        let expected = PresenceConfig { persist: true, ..Default::default() };
        assert_eq!(f.log.take_commands::<PresenceCommand>(), vec![
            PresenceCommand::Hello(HelloData { version: PRESENCE_PROTOCOL_VERSION, capabilities: Capabilities::WEBRTC }),
            PresenceCommand::Prefs(expected.to_code()),
            PresenceCommand::UserActive(true),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_autoaway_clears_persist() {
        let persisted = PresenceConfig { persist: true, autoaway_active: false, ..Default::default() };
        let f = logged_in(persisted.to_code());

        f.client.set_autoaway(true, 30);
        assert_eq!(f.client.config(), PresenceConfig { autoaway_timeout_secs: 30, ..Default::default() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoaway_on_idle() {
        let config = PresenceConfig { autoaway_timeout_secs: 30, ..Default::default() };
        let f = logged_in(config.to_code());

        for _ in 0..3 {
            tick(&f).await;
        }
        assert!(!f.log.take_commands::<PresenceCommand>().contains(&PresenceCommand::UserActive(false)));

        tick(&f).await;
        assert!(f.log.take_commands::<PresenceCommand>().contains(&PresenceCommand::UserActive(false)));

        // sent only once
        tick(&f).await;
        assert!(!f.log.take_commands::<PresenceCommand>().contains(&PresenceCommand::UserActive(false)));

        f.client.signal_activity(false);
        assert_eq!(f.log.take_commands::<PresenceCommand>(), vec![PresenceCommand::UserActive(true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_autoaway_when_persisted() {
        let config = PresenceConfig { autoaway_timeout_secs: 30, persist: true, ..Default::default() };
        let f = logged_in(config.to_code());

        for _ in 0..10 {
            tick(&f).await;
        }
        assert!(!f.log.take_commands::<PresenceCommand>().contains(&PresenceCommand::UserActive(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_refcount() {
        let f = logged_in(PresenceConfig::default().to_code());
        let peer = Id::new(42);

        f.client.add_peer(peer);
        f.client.add_peer(peer);
        assert_eq!(f.log.take_commands::<PresenceCommand>(), vec![PresenceCommand::AddPeers(vec![peer])]);

        f.client.remove_peer(peer, false);
        f.log.assert_no_remaining_commands();
        f.client.remove_peer(peer, false);
        assert_eq!(f.log.take_commands::<PresenceCommand>(), vec![PresenceCommand::DelPeers(vec![peer])]);
        assert!(f.client.peers().is_empty());

        f.client.remove_peer(peer, false);
        f.log.assert_no_remaining_commands();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_peer_removal() {
        let f = logged_in(PresenceConfig::default().to_code());
        let peer = Id::new(42);
        f.client.add_peer(peer);
        f.client.add_peer(peer);
        f.client.add_peer(peer);
        f.log.take_commands::<PresenceCommand>();

        f.client.remove_peer(peer, true);
        assert_eq!(f.log.take_commands::<PresenceCommand>(), vec![PresenceCommand::DelPeers(vec![peer])]);
        assert!(f.client.peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_status_is_reported() {
        let f = logged_in(PresenceConfig::default().to_code());
        let mut buf = BytesMut::new();
        PresenceCommand::PeerStatus(PeerStatusData { presence: Presence::Online, user_id: Id::new(7) }).ser(&mut buf);
        PresenceCommand::Keepalive.ser(&mut buf);
        PresenceCommand::PeerStatus(PeerStatusData { presence: Presence::Away, user_id: Id::new(8) }).ser(&mut buf);
        f.log.sink().data(buf.freeze());
        f.ctx.process_pending();

        assert_eq!(f.listener.presence_changes(), vec![(Id::new(7), Presence::Online), (Id::new(8), Presence::Away)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_framing_error_drops_rest_of_frame() {
        let f = logged_in(PresenceConfig::default().to_code());
        let mut buf = BytesMut::new();
        PresenceCommand::PeerStatus(PeerStatusData { presence: Presence::Online, user_id: Id::new(7) }).ser(&mut buf);
        buf.extend_from_slice(&[99]);
        PresenceCommand::PeerStatus(PeerStatusData { presence: Presence::Away, user_id: Id::new(8) }).ser(&mut buf);
        f.log.sink().data(buf.freeze());
        f.ctx.process_pending();

        assert_eq!(f.listener.presence_changes(), vec![(Id::new(7), Presence::Online)]);
        assert_eq!(f.client.connection_state(), ConnectionState::LoggedIn);
    }
}
