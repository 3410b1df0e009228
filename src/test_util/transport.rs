use std::sync::{Arc, Mutex};

use crate::protocol::command::{CommandDecoder, ProtocolCommand};
use crate::runtime::EventSink;
use crate::transport::MockTransport;

/// Everything a [`MockTransport`] created by [`TransportLog::mock`] was asked to do
#[derive(Default, Clone)]
pub struct TransportLog {
    sinks: Arc<Mutex<Vec<EventSink>>>,
    urls: Arc<Mutex<Vec<String>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<Mutex<Vec<bool>>>,
}

impl TransportLog {
    pub fn new() -> TransportLog {
        Default::default()
    }

    /// A transport that accepts everything and records it in this log
    pub fn mock(&self) -> MockTransport {
        let mut transport = MockTransport::new();

        let sinks = self.sinks.clone();
        let urls = self.urls.clone();
        transport.expect_open()
            .returning(move |url, sink| {
                urls.lock().unwrap().push(url.to_string());
                sinks.lock().unwrap().push(sink);
                Ok(())
            });

        let sent = self.sent.clone();
        transport.expect_send()
            .returning(move |frame| {
                sent.lock().unwrap().push(frame.to_vec());
                Ok(())
            });

        let closed = self.closed.clone();
        transport.expect_close()
            .returning(move |graceful| closed.lock().unwrap().push(graceful));

        transport
    }

    /// the sink of the most recently opened socket
    pub fn sink(&self) -> EventSink {
        self.sinks.lock().unwrap().last()
            .expect("no socket was opened")
            .clone()
    }

    pub fn num_opened(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<bool> {
        self.closed.lock().unwrap().clone()
    }

    /// decodes and removes all frames sent so far
    pub fn take_commands<C: ProtocolCommand>(&self) -> Vec<C> {
        let frames: Vec<_> = self.sent.lock().unwrap().drain(..).collect();
        frames.iter()
            .flat_map(|frame| CommandDecoder::<C>::new(frame).collect::<Vec<_>>())
            .map(|cmd| cmd.expect("client sent a malformed command"))
            .collect()
    }

    pub fn assert_no_remaining_commands(&self) {
        let sent = self.sent();
        assert!(sent.is_empty(), "unexpected frames sent: {:?}", sent);
    }
}
