use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::chat::buffer::MockCommandSink;
use crate::protocol::chat_commands::ChatCommand;

/// Records the commands a [`MockCommandSink`] created by [`CommandLog::mock`] accepts. Commands
///  are only accepted while the log is online.
#[derive(Clone)]
pub struct CommandLog {
    sent: Arc<Mutex<Vec<ChatCommand>>>,
    online: Arc<AtomicBool>,
}

impl CommandLog {
    pub fn new(online: bool) -> CommandLog {
        CommandLog {
            sent: Default::default(),
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn mock(&self) -> MockCommandSink {
        let mut sink = MockCommandSink::new();

        let sent = self.sent.clone();
        let online = self.online.clone();
        sink.expect_send_command()
            .returning(move |cmd| {
                if !online.load(Ordering::SeqCst) {
                    return false;
                }
                sent.lock().unwrap().push(cmd);
                true
            });

        let online = self.online.clone();
        sink.expect_is_online()
            .returning(move || online.load(Ordering::SeqCst));

        sink
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// removes and returns everything sent so far
    pub fn take(&self) -> Vec<ChatCommand> {
        self.sent.lock().unwrap().drain(..).collect()
    }
}
