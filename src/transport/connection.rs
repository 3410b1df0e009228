use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tokio::time::Instant;
use tracing::{debug, debug_span, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::{ChatError, TransportFailureKind};
use crate::promise::retry::{retry, RetryHandle};
use crate::promise::Promise;
use crate::runtime::{ConnectionKey, LoopCtx, TimerHandle, TransportEvent, TransportEventHandler};
use crate::transport::{DnsResolverHook, Transport};
use crate::util::isolate::isolated;

/// KEEPALIVE has opcode 0 in every protocol that runs on a [`Connection`]
const KEEPALIVE_FRAME: [u8; 1] = [0];

/// Ordered: a successful connect walks through the states in ascending order
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Disconnecting,
    Connected,
    LoggedIn,
}

/// The protocol running on a connection
pub trait ConnectionHandler {
    /// The socket is open. The handler performs its protocol handshake; the connection is
    ///  `LoggedIn` when the returned promise resolves. A rejection fails the connect attempt.
    fn on_connected(&self) -> Promise<()>;

    fn on_frame(&self, frame: &[u8]);

    /// The socket is gone, whatever the reason
    fn on_disconnected(&self);

    fn on_state_change(&self, _old: ConnectionState, _new: ConnectionState) {}

    /// Called on every liveness tick while the socket is open
    fn on_heartbeat(&self, _now: Instant) {}
}

struct ConnectionInner {
    state: ConnectionState,
    url: Option<String>,
    transport: Box<dyn Transport>,
    /// identifies the current socket; events from older sockets are stale
    socket_generation: u64,
    socket_open: bool,

    retry: Option<RetryHandle<()>>,
    /// settles the current connect attempt: resolved on login, rejected on failure
    attempt: Option<Promise<()>>,
    disconnect: Option<Promise<()>>,

    heartbeat_timer: Option<TimerHandle>,
    connect_timer: Option<TimerHandle>,
    disconnect_timer: Option<TimerHandle>,

    ts_last_send: Instant,
    ts_last_recv: Instant,
    ts_ping_sent: Option<Instant>,
}

enum HeartbeatAction {
    None,
    SendKeepalive,
    Reconnect,
}

/// One physical connection (to a shard, or to the presence server) with its connection
///  state machine, retries, and keepalive based liveness detection.
pub struct Connection {
    ctx: Rc<LoopCtx>,
    config: Rc<ClientConfig>,
    key: ConnectionKey,
    name: String,
    handler: Weak<dyn ConnectionHandler>,
    dns_hook: Option<Rc<dyn DnsResolverHook>>,
    myself: Weak<Connection>,
    inner: RefCell<ConnectionInner>,
}

impl Connection {
    pub fn new(
        ctx: &Rc<LoopCtx>,
        config: Rc<ClientConfig>,
        key: ConnectionKey,
        transport: Box<dyn Transport>,
        handler: Weak<dyn ConnectionHandler>,
        dns_hook: Option<Rc<dyn DnsResolverHook>>,
    ) -> Rc<Connection> {
        let now = ctx.now();
        let result = Rc::new_cyclic(|myself| Connection {
            ctx: ctx.clone(),
            config,
            key,
            name: match key {
                ConnectionKey::Shard(shard) => format!("shard {}", shard),
                ConnectionKey::Presence => "presence".to_string(),
            },
            handler,
            dns_hook,
            myself: myself.clone(),
            inner: RefCell::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                url: None,
                transport,
                socket_generation: 0,
                socket_open: false,
                retry: None,
                attempt: None,
                disconnect: None,
                heartbeat_timer: None,
                connect_timer: None,
                disconnect_timer: None,
                ts_last_send: now,
                ts_last_recv: now,
                ts_ping_sent: None,
            }),
        });

        let as_event_handler: Weak<dyn TransportEventHandler> = result.myself.clone();
        ctx.register_handler(key, as_event_handler);
        result
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.borrow().state
    }

    pub fn url(&self) -> Option<String> {
        self.inner.borrow().url.clone()
    }

    /// Sending is possible once the socket is open, i.e. during the handshake already
    pub fn is_online(&self) -> bool {
        self.state() >= ConnectionState::Connected
    }

    pub fn is_logged_in(&self) -> bool {
        self.state() == ConnectionState::LoggedIn
    }

    fn handler(&self) -> Option<Rc<dyn ConnectionHandler>> {
        self.handler.upgrade()
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut self.inner.borrow_mut().state, new_state);
        if old_state == new_state {
            return;
        }
        debug!("{}: connection state {:?} -> {:?}", self.name, old_state, new_state);
        if let Some(handler) = self.handler() {
            handler.on_state_change(old_state, new_state);
        }
    }

    /// Connects with retries until logged in. Rejects immediately with `AlreadyConnecting` if a
    ///  connect is in progress or the connection is up; `url` replaces the previous URL if given.
    pub fn reconnect(&self, url: Option<&str>) -> Promise<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state >= ConnectionState::Connecting || inner.retry.as_ref().is_some_and(|r| r.is_active()) {
                debug!("{}: already connecting or connected", self.name);
                return Promise::rejected(ChatError::AlreadyConnecting);
            }
            if let Some(url) = url {
                inner.url = Some(url.to_string());
            }
            if inner.url.is_none() {
                return Promise::rejected(ChatError::transport(TransportFailureKind::Connect, 0, "no URL to connect to"));
            }
        }

        self.set_state(ConnectionState::Connecting);

        let weak = self.myself.clone();
        let handle = retry(&self.ctx, format!("connect {}", self.name), &self.config.backoff, move |attempt| {
            match weak.upgrade() {
                Some(conn) => conn.start_attempt(attempt),
                None => Promise::rejected(ChatError::Cancelled),
            }
        });

        let weak = self.myself.clone();
        let result = handle.promise();
        result.on_settled(move |outcome| {
            if let (Err(e), Some(conn)) = (outcome, weak.upgrade()) {
                if e == ChatError::Cancelled {
                    return;
                }
                warn!("{}: connecting failed for good: {}", conn.name, e);
                if conn.state() == ConnectionState::Connecting {
                    conn.set_state(ConnectionState::Disconnected);
                }
            }
        });

        self.inner.borrow_mut().retry = Some(handle);
        result
    }

    fn start_attempt(&self, attempt: u32) -> Promise<()> {
        self.abandon_socket();

        let promise = Promise::new();
        let (generation, url) = {
            let mut inner = self.inner.borrow_mut();
            inner.socket_generation += 1;
            inner.attempt = Some(promise.clone());
            inner.ts_ping_sent = None;
            (inner.socket_generation, inner.url.clone().unwrap_or_default())
        };
        self.set_state(ConnectionState::Connecting);

        info!("{}: connecting to {} (attempt #{})", self.name, url, attempt);
        let sink = self.ctx.marshaller().event_sink(self.key, generation);
        let opened = self.inner.borrow_mut().transport.open(&url, sink);
        if let Err(e) = opened {
            warn!("{}: could not open socket: {:#}", self.name, e);
            self.inner.borrow_mut().attempt = None;
            self.set_state(ConnectionState::Disconnected);
            return Promise::rejected(ChatError::transport(TransportFailureKind::Connect, 0, format!("{:#}", e)));
        }

        let weak = self.myself.clone();
        let timer = self.ctx.set_timeout(self.config.connect_timeout, move || {
            if let Some(conn) = weak.upgrade() {
                conn.on_connect_timeout(generation);
            }
        });
        {
            let mut inner = self.inner.borrow_mut();
            inner.socket_open = true;
            inner.connect_timer = Some(timer);
        }
        promise
    }

    /// Drops the current socket without waiting for confirmation, and invalidates its events
    fn abandon_socket(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.socket_generation += 1;
        if inner.socket_open {
            inner.socket_open = false;
            inner.transport.close(false);
        }
    }

    fn cancel_timers(&self) {
        let timers = {
            let mut inner = self.inner.borrow_mut();
            [inner.heartbeat_timer.take(), inner.connect_timer.take(), inner.disconnect_timer.take()]
        };
        for timer in timers.into_iter().flatten() {
            self.ctx.cancel_timer(timer);
        }
    }

    fn on_opened(&self, generation: u64) {
        if self.state() != ConnectionState::Connecting {
            warn!("{}: socket opened in state {:?} - ignoring", self.name, self.state());
            return;
        }
        self.inner.borrow_mut().ts_last_recv = self.ctx.now();
        self.set_state(ConnectionState::Connected);
        self.start_heartbeat();

        let Some(handler) = self.handler() else {
            return;
        };
        let weak = self.myself.clone();
        handler.on_connected().on_settled(move |result| {
            let Some(conn) = weak.upgrade() else {
                return;
            };
            if conn.inner.borrow().socket_generation != generation || conn.state() != ConnectionState::Connected {
                debug!("{}: handshake completed for a socket that is gone - ignoring", conn.name);
                return;
            }
            match result {
                Ok(()) => conn.on_logged_in(),
                Err(e) => {
                    warn!("{}: handshake failed: {}", conn.name, e);
                    conn.abandon_socket();
                    conn.on_socket_closed(0, TransportFailureKind::Connect, &format!("handshake failed: {}", e));
                }
            }
        });
    }

    fn on_logged_in(&self) {
        let (connect_timer, attempt) = {
            let mut inner = self.inner.borrow_mut();
            (inner.connect_timer.take(), inner.attempt.take())
        };
        if let Some(timer) = connect_timer {
            self.ctx.cancel_timer(timer);
        }
        self.set_state(ConnectionState::LoggedIn);
        info!("{}: logged in", self.name);
        if let Some(attempt) = attempt {
            let _ = attempt.resolve(());
        }
    }

    fn on_connect_timeout(&self, generation: u64) {
        let state = {
            let mut inner = self.inner.borrow_mut();
            if inner.socket_generation != generation {
                return;
            }
            inner.connect_timer = None;
            inner.state
        };
        if state == ConnectionState::Connecting || state == ConnectionState::Connected {
            warn!("{}: connect attempt timed out in state {:?}", self.name, state);
            self.abandon_socket();
            self.on_socket_closed(0, TransportFailureKind::Timeout, "connect timeout");
        }
    }

    fn on_data(&self, frame: &[u8]) {
        if self.state() < ConnectionState::Connected {
            warn!("{}: received data in state {:?} - ignoring", self.name, self.state());
            return;
        }
        {
            let mut inner = self.inner.borrow_mut();
            inner.ts_last_recv = self.ctx.now();
            inner.ts_ping_sent = None;
        }

        let _span = debug_span!("frame_received", connection = %self.name, len = frame.len()).entered();
        if let Some(handler) = self.handler() {
            handler.on_frame(frame);
        }
    }

    fn on_socket_closed(&self, code: i32, kind: TransportFailureKind, reason: &str) {
        warn!("{}: socket closed ({:?}, code {}): {}", self.name, kind, code, reason);
        if kind == TransportFailureKind::Dns {
            if let Some(hook) = &self.dns_hook {
                debug!("{}: DNS failure - invalidating resolver cache", self.name);
                hook.invalidate_resolver_cache();
            }
        }

        let old_state = self.state();
        if old_state == ConnectionState::Disconnected {
            // forced to disconnected already, e.g. by a timeout
            return;
        }

        self.cancel_timers();
        let (attempt, disconnect) = {
            let mut inner = self.inner.borrow_mut();
            inner.socket_open = false;
            inner.socket_generation += 1;
            inner.ts_ping_sent = None;
            (inner.attempt.take(), inner.disconnect.take())
        };
        self.set_state(ConnectionState::Disconnected);

        if let Some(handler) = self.handler() {
            handler.on_disconnected();
        }

        if old_state == ConnectionState::Disconnecting {
            if let Some(disconnect) = disconnect {
                let _ = disconnect.resolve(());
            }
            return;
        }

        if old_state < ConnectionState::LoggedIn {
            // the retry loop takes it from here
            if let Some(attempt) = attempt {
                let _ = attempt.reject(ChatError::transport(kind, code, reason));
            }
        }
        else {
            debug!("{}: connection lost while logged in - reconnecting", self.name);
            self.reconnect(None);
        }
    }

    fn start_heartbeat(&self) {
        let weak = self.myself.clone();
        let timer = self.ctx.set_interval(self.config.heartbeat_tick, move || {
            if let Some(conn) = weak.upgrade() {
                conn.heartbeat();
            }
        });
        if let Some(old) = self.inner.borrow_mut().heartbeat_timer.replace(timer) {
            self.ctx.cancel_timer(old);
        }
    }

    fn heartbeat(&self) {
        let now = self.ctx.now();
        if !self.is_online() {
            return;
        }
        if let Some(handler) = self.handler() {
            handler.on_heartbeat(now);
        }

        let action = {
            let inner = self.inner.borrow();
            if inner.state != ConnectionState::LoggedIn {
                HeartbeatAction::None
            }
            else if now - inner.ts_last_send > self.config.keepalive_interval {
                HeartbeatAction::SendKeepalive
            }
            else if let Some(ping_sent) = inner.ts_ping_sent {
                if now - ping_sent > self.config.keepalive_timeout {
                    HeartbeatAction::Reconnect
                }
                else {
                    HeartbeatAction::None
                }
            }
            else if now - inner.ts_last_recv >= self.config.keepalive_interval {
                HeartbeatAction::SendKeepalive
            }
            else {
                HeartbeatAction::None
            }
        };

        match action {
            HeartbeatAction::None => {}
            HeartbeatAction::SendKeepalive => {
                trace!("{}: sending keepalive", self.name);
                if self.send_frame(&KEEPALIVE_FRAME) {
                    self.inner.borrow_mut().ts_ping_sent = Some(now);
                }
                else {
                    warn!("{}: failed to send keepalive - reconnecting", self.name);
                    self.force_reconnect("keepalive send failed");
                }
            }
            HeartbeatAction::Reconnect => {
                warn!("{}: timed out waiting for keepalive response - reconnecting", self.name);
                self.force_reconnect("keepalive timeout");
            }
        }
    }

    fn force_reconnect(&self, reason: &str) {
        self.abandon_socket();
        self.on_socket_closed(0, TransportFailureKind::Timeout, reason);
    }

    /// Returns `false` if the frame could not be handed to the transport, e.g. because the
    ///  connection is offline
    pub fn send_frame(&self, frame: &[u8]) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.state < ConnectionState::Connected {
            trace!("{}: can't send, offline", self.name);
            return false;
        }
        match inner.transport.send(frame) {
            Ok(()) => {
                inner.ts_last_send = self.ctx.now();
                true
            }
            Err(e) => {
                warn!("{}: error sending frame: {:#}", self.name, e);
                false
            }
        }
    }

    /// Graceful disconnect: asks the transport to close and waits for confirmation, but no
    ///  longer than the configured disconnect timeout. Stops reconnecting.
    pub fn disconnect(&self) -> Promise<()> {
        let retry = self.inner.borrow_mut().retry.take();
        if let Some(retry) = retry {
            retry.cancel();
        }

        match self.state() {
            ConnectionState::Disconnected => return Promise::resolved(()),
            ConnectionState::Disconnecting => {
                if let Some(p) = &self.inner.borrow().disconnect {
                    return p.clone();
                }
                return Promise::resolved(());
            }
            _ => {}
        }

        let promise = Promise::new();
        let (socket_open, generation) = {
            let mut inner = self.inner.borrow_mut();
            inner.disconnect = Some(promise.clone());
            inner.attempt = None;
            (inner.socket_open, inner.socket_generation)
        };
        self.set_state(ConnectionState::Disconnecting);

        if !socket_open {
            self.on_socket_closed(0, TransportFailureKind::Closed, "user disconnect");
            return promise;
        }

        let weak = self.myself.clone();
        let timer = self.ctx.set_timeout(self.config.disconnect_timeout, move || {
            let Some(conn) = weak.upgrade() else {
                return;
            };
            conn.inner.borrow_mut().disconnect_timer = None;
            if conn.inner.borrow().socket_generation == generation && conn.state() == ConnectionState::Disconnecting {
                warn!("{}: no close confirmation from transport - forcing disconnect", conn.name);
                conn.abandon_socket();
                conn.on_socket_closed(0, TransportFailureKind::Timeout, "disconnect timeout");
            }
        });
        {
            let mut inner = self.inner.borrow_mut();
            inner.disconnect_timer = Some(timer);
            inner.transport.close(true);
        }
        promise
    }
}

impl TransportEventHandler for Connection {
    fn on_transport_event(&self, socket_generation: u64, event: TransportEvent) {
        let current = self.inner.borrow().socket_generation;
        if socket_generation != current {
            debug!("{}: ignoring stale event from socket #{} (current #{}): {:?}", self.name, socket_generation, current, event);
            return;
        }

        match event {
            TransportEvent::Opened => self.on_opened(socket_generation),
            TransportEvent::Data(frame) => self.on_data(&frame),
            TransportEvent::Closed { code, kind, reason } => {
                isolated("socket close handling", || self.on_socket_closed(code, kind, &reason));
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for timer in [inner.heartbeat_timer.take(), inner.connect_timer.take(), inner.disconnect_timer.take()].into_iter().flatten() {
            self.ctx.cancel_timer(timer);
        }
        if inner.socket_open {
            inner.transport.close(false);
        }
        if let Some(retry) = inner.retry.take() {
            retry.cancel();
        }
        self.ctx.unregister_handler(self.key);
    }
}
