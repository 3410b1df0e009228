//! The loop thread: all protocol state lives here and is touched only from here. Background
//!  I/O gets its work onto the loop through the [`Marshaller`]; timers and deferred calls
//!  are owned by the [`LoopCtx`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

pub use marshal::{ConnectionKey, EventSink, LoopMessage, Marshaller, TransportEvent};
pub use timers::{CancelResult, TimerHandle};

use timers::Timers;

pub mod marshal;
pub mod timers;

/// Receives the transport events that are marshalled to the loop thread for one connection key
pub trait TransportEventHandler {
    fn on_transport_event(&self, socket_generation: u64, event: TransportEvent);
}

/// Explicitly constructed context shared by all connections, rooms and timers of a client.
///  It is `!Send` on purpose: it lives on the loop thread.
pub struct LoopCtx {
    timers: RefCell<Timers>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    handlers: RefCell<FxHashMap<ConnectionKey, Weak<dyn TransportEventHandler>>>,
    marshaller: Marshaller,
    receiver: RefCell<Option<mpsc::UnboundedReceiver<LoopMessage>>>,
    stopped: Cell<bool>,
}

impl LoopCtx {
    pub fn new() -> Rc<LoopCtx> {
        let (send, recv) = mpsc::unbounded_channel();
        Rc::new(LoopCtx {
            timers: Default::default(),
            deferred: Default::default(),
            handlers: Default::default(),
            marshaller: Marshaller::new(send),
            receiver: RefCell::new(Some(recv)),
            stopped: Cell::new(false),
        })
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn marshaller(&self) -> Marshaller {
        self.marshaller.clone()
    }

    pub fn set_timeout(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerHandle {
        self.timers.borrow_mut()
            .set_timeout(self.now(), delay, callback)
    }

    pub fn set_interval(&self, period: Duration, callback: impl FnMut() + 'static) -> TimerHandle {
        self.timers.borrow_mut()
            .set_interval(self.now(), period, callback)
    }

    /// Safe to call from inside the timer's own callback, and for timers that fired already
    pub fn cancel_timer(&self, handle: TimerHandle) -> CancelResult {
        self.timers.borrow_mut()
            .cancel(handle)
    }

    pub fn is_timer_active(&self, handle: TimerHandle) -> bool {
        self.timers.borrow()
            .is_active(handle)
    }

    /// Schedules a call on the loop thread after the current callback returned. This is how
    ///  code breaks re-entrancy, e.g. to continue work after the caller released its borrows.
    pub fn post(&self, f: impl FnOnce() + 'static) {
        self.deferred.borrow_mut()
            .push_back(Box::new(f));
    }

    pub fn register_handler(&self, key: ConnectionKey, handler: Weak<dyn TransportEventHandler>) {
        if self.handlers.borrow_mut().insert(key, handler).is_some() {
            debug!("replacing transport event handler for {:?}", key);
        }
    }

    pub fn unregister_handler(&self, key: ConnectionKey) {
        self.handlers.borrow_mut()
            .remove(&key);
    }

    pub fn dispatch(&self, msg: LoopMessage) {
        match msg {
            LoopMessage::Call(f) => f(),
            LoopMessage::Transport { key, socket_generation, event } => {
                let handler = self.handlers.borrow()
                    .get(&key)
                    .and_then(|h| h.upgrade());
                match handler {
                    Some(handler) => handler.on_transport_event(socket_generation, event),
                    None => warn!("transport event for unregistered connection {:?} - ignoring", key),
                }
            }
        }
    }

    /// The point in time when the loop needs to wake up next, or `None` if nothing is scheduled.
    ///  Pending deferred calls make this 'now'.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.deferred.borrow().is_empty() {
            return Some(self.now());
        }
        self.timers.borrow()
            .next_deadline()
    }

    /// Runs deferred calls and all timers that are due, including those that become due as
    ///  a consequence. Returns the number of callbacks that were run.
    pub fn run_due(&self) -> usize {
        let mut count = 0;
        loop {
            let deferred = self.deferred.borrow_mut().pop_front();
            if let Some(f) = deferred {
                f();
                count += 1;
                continue;
            }

            let due = self.timers.borrow_mut().pop_due(self.now());
            let Some(mut due) = due else {
                return count;
            };
            (due.callback)();
            count += 1;
            if due.periodic {
                self.timers.borrow_mut()
                    .rearm(due.handle, due.callback);
            }
        }
    }

    /// Processes everything that is ready right now without waiting: marshalled messages that
    ///  were posted so far, deferred calls and due timers.
    pub fn process_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let msg = self.receiver.borrow_mut()
                .as_mut()
                .and_then(|r| r.try_recv().ok());
            match msg {
                Some(msg) => {
                    self.dispatch(msg);
                    count += 1;
                }
                None => {
                    let n = self.run_due();
                    if n == 0 {
                        return count;
                    }
                    count += n;
                }
            }
        }
    }

    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<LoopMessage>> {
        self.receiver.borrow_mut().take()
    }

    pub fn stop(&self) {
        self.stopped.set(true);
    }

    /// Drives the loop thread until [`LoopCtx::stop`] is called. The future is `!Send`, so it
    ///  must be awaited on a current-thread runtime or inside a `LocalSet`.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut receiver = self.take_receiver()
            .ok_or_else(|| anyhow::anyhow!("loop is already running"))?;
        self.stopped.set(false);

        debug!("starting loop");
        loop {
            self.run_due();
            if self.stopped.get() {
                break;
            }

            let deadline = self.next_deadline();
            select! {
                msg = receiver.recv() => {
                    match msg {
                        Some(msg) => self.dispatch(msg),
                        None => break,
                    }
                }
                _ = sleep_until(deadline) => {
                    trace!("loop woke up for timers");
                }
            }
        }
        debug!("loop stopped");

        *self.receiver.borrow_mut() = Some(receiver);
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
