use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::TransportFailureKind;

/// Identifies a transport connection on the loop thread, so that events marshalled from I/O
///  threads can be routed to it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionKey {
    Shard(u32),
    Presence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Data(Bytes),
    Closed {
        code: i32,
        kind: TransportFailureKind,
        reason: String,
    },
}

pub enum LoopMessage {
    Transport {
        key: ConnectionKey,
        /// Every (re)connect attempt opens a new socket with a new generation. Events for
        ///  an outdated generation come from a socket that was already abandoned and are
        ///  discarded.
        socket_generation: u64,
        event: TransportEvent,
    },
    Call(Box<dyn FnOnce() + Send>),
}

impl Debug for LoopMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopMessage::Transport { key, socket_generation, event } => f.debug_struct("Transport")
                .field("key", key)
                .field("socket_generation", socket_generation)
                .field("event", event)
                .finish(),
            LoopMessage::Call(_) => write!(f, "Call(..)"),
        }
    }
}

/// The only way for code running outside the loop thread to get something done on it. All
///  messages go through a single FIFO channel, so ordering per sending thread is preserved.
#[derive(Clone, Debug)]
pub struct Marshaller {
    sender: mpsc::UnboundedSender<LoopMessage>,
}

impl Marshaller {
    pub fn new(sender: mpsc::UnboundedSender<LoopMessage>) -> Marshaller {
        Marshaller { sender }
    }

    pub fn post(&self, msg: LoopMessage) {
        if self.sender.send(msg).is_err() {
            trace!("loop is shut down - dropping marshalled message");
        }
    }

    pub fn call(&self, f: impl FnOnce() + Send + 'static) {
        self.post(LoopMessage::Call(Box::new(f)));
    }

    pub fn event_sink(&self, key: ConnectionKey, socket_generation: u64) -> EventSink {
        EventSink {
            marshaller: self.clone(),
            key,
            socket_generation,
        }
    }
}

/// Handed to a transport when a socket is opened. The transport's I/O context reports
///  everything that happens to the socket through this sink, from any thread.
#[derive(Clone, Debug)]
pub struct EventSink {
    marshaller: Marshaller,
    key: ConnectionKey,
    socket_generation: u64,
}

impl EventSink {
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn socket_generation(&self) -> u64 {
        self.socket_generation
    }

    fn post(&self, event: TransportEvent) {
        self.marshaller.post(LoopMessage::Transport {
            key: self.key,
            socket_generation: self.socket_generation,
            event,
        });
    }

    pub fn opened(&self) {
        self.post(TransportEvent::Opened);
    }

    pub fn data(&self, frame: Bytes) {
        self.post(TransportEvent::Data(frame));
    }

    pub fn closed(&self, code: i32, kind: TransportFailureKind, reason: impl Into<String>) {
        self.post(TransportEvent::Closed {
            code,
            kind,
            reason: reason.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_sink_preserves_order() {
        let (send, mut recv) = mpsc::unbounded_channel();
        let sink = Marshaller::new(send).event_sink(ConnectionKey::Shard(3), 7);

        sink.opened();
        sink.data(Bytes::from_static(b"\x00"));
        sink.closed(1006, TransportFailureKind::Closed, "gone");

        let mut events = Vec::new();
        while let Ok(msg) = recv.try_recv() {
            match msg {
                LoopMessage::Transport { key, socket_generation, event } => {
                    assert_eq!(key, ConnectionKey::Shard(3));
                    assert_eq!(socket_generation, 7);
                    events.push(event);
                }
                LoopMessage::Call(_) => panic!("unexpected call"),
            }
        }
        assert_eq!(events, vec![
            TransportEvent::Opened,
            TransportEvent::Data(Bytes::from_static(b"\x00")),
            TransportEvent::Closed { code: 1006, kind: TransportFailureKind::Closed, reason: "gone".to_string() },
        ]);
    }

    #[test]
    fn test_post_after_shutdown_is_dropped() {
        let (send, recv) = mpsc::unbounded_channel();
        drop(recv);
        Marshaller::new(send).call(|| panic!("must not run"));
    }

    #[test]
    fn test_marshaller_is_send() {
        fn assert_send<T: Send + Clone>() {}
        assert_send::<Marshaller>();
        assert_send::<EventSink>();
    }
}
