use std::time::Duration;

use anyhow::bail;

use crate::protocol::presence_commands::Capabilities;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// While logged in, a KEEPALIVE is sent if nothing else was sent for this long.
    pub keepalive_interval: Duration,
    /// If no inbound frame arrives this long after a KEEPALIVE was sent, the connection is
    ///  considered dead: it is forced to `Disconnected` and a reconnect is started. This
    ///  is the only liveness check, there is no lower-level ping.
    pub keepalive_timeout: Duration,
    /// period of the liveness timer that evaluates keepalive and auto-away
    pub heartbeat_tick: Duration,

    /// A single connect attempt that did not reach `LoggedIn` within this time fails and
    ///  is retried with backoff.
    pub connect_timeout: Duration,
    /// Upper bound for a graceful disconnect. If the transport does not report 'closed' within
    ///  this time, the connection forces itself to `Disconnected`.
    pub disconnect_timeout: Duration,

    pub backoff: BackoffConfig,

    /// number of messages requested from the server when a room is joined without any local
    ///  history
    pub initial_history_fetch_count: u32,

    pub presence_capabilities: Capabilities,
}

impl ClientConfig {
    pub fn new() -> ClientConfig {
        ClientConfig {
            keepalive_interval: Duration::from_secs(25),
            keepalive_timeout: Duration::from_secs(15),
            heartbeat_tick: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::new(),
            initial_history_fetch_count: 32,
            presence_capabilities: Capabilities::empty(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, d) in [
            ("keepalive_interval", self.keepalive_interval),
            ("keepalive_timeout", self.keepalive_timeout),
            ("heartbeat_tick", self.heartbeat_tick),
            ("connect_timeout", self.connect_timeout),
            ("disconnect_timeout", self.disconnect_timeout),
        ] {
            if d.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }

        if self.keepalive_timeout >= self.keepalive_interval {
            bail!("keepalive timeout ({:?}) must be shorter than the keepalive interval ({:?})", self.keepalive_timeout, self.keepalive_interval);
        }

        self.backoff.validate()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// growth factor per attempt in eighths, i.e. 16 doubles the delay per attempt
    pub factor_eighths: u32,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl BackoffConfig {
    pub fn new() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor_eighths: 16,
            max_attempts: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_delay.is_zero() {
            bail!("initial backoff delay must be greater than zero");
        }
        if self.initial_delay > self.max_delay {
            bail!("initial backoff delay ({:?}) exceeds the maximum delay ({:?})", self.initial_delay, self.max_delay);
        }
        if self.factor_eighths < 8 {
            bail!("backoff factor must be at least 8/8, was {}/8", self.factor_eighths);
        }
        if self.max_attempts == Some(0) {
            bail!("max_attempts must be at least 1");
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new()
    }
}
