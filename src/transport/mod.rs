#[cfg(test)] use mockall::automock;

use crate::runtime::EventSink;

pub mod connection;

/// The raw socket / TLS / WebSocket I/O. Implementations do their I/O wherever they like, but
///  must report everything that happens to a socket through the [`EventSink`] passed to
///  [`Transport::open`], never by calling back into the protocol directly.
#[cfg_attr(test, automock)]
pub trait Transport {
    /// Starts opening a socket. Success is reported asynchronously through `sink.opened()`,
    ///  failure either as `Err` here or through `sink.closed(..)`.
    fn open(&mut self, url: &str, sink: EventSink) -> anyhow::Result<()>;

    fn send(&mut self, frame: &[u8]) -> anyhow::Result<()>;

    /// A graceful close is eventually confirmed through `sink.closed(..)`; a non-graceful
    ///  close abandons the socket and is not confirmed.
    fn close(&mut self, graceful: bool);
}

/// Platform specific side effect on DNS failures, e.g. re-reading the system's resolver
///  configuration after the network interface came up
#[cfg_attr(test, automock)]
pub trait DnsResolverHook {
    fn invalidate_resolver_cache(&self);
}
