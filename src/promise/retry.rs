use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::config::BackoffConfig;
use crate::error::ChatError;
use crate::promise::backoff::ExponentialBackoff;
use crate::promise::Promise;
use crate::runtime::{CancelResult, LoopCtx, TimerHandle};
use crate::util::isolate::catch_panic;

type Producer<T> = Box<dyn FnMut(u32) -> Promise<T>>;

struct RetryState<T: Clone + 'static> {
    ctx: Rc<LoopCtx>,
    name: String,
    backoff: ExponentialBackoff,
    max_attempts: Option<u32>,
    producer: RefCell<Option<Producer<T>>>,
    output: Promise<T>,
    timer: Cell<Option<TimerHandle>>,
    done: Cell<bool>,
}

/// Handle to a running retry loop. The loop keeps itself alive until it succeeds, gives up
///  or is cancelled; dropping the handle does not stop it.
pub struct RetryHandle<T: Clone + 'static> {
    state: Rc<RetryState<T>>,
}

impl<T: Clone + 'static> Clone for RetryHandle<T> {
    fn clone(&self) -> Self {
        RetryHandle { state: self.state.clone() }
    }
}

/// Invokes `producer` with the attempt number (starting at 0) until a produced promise
///  resolves. After a rejection the next attempt is scheduled with exponential backoff.
///
/// The first attempt is started synchronously.
pub fn retry<T, F>(ctx: &Rc<LoopCtx>, name: impl Into<String>, config: &BackoffConfig, producer: F) -> RetryHandle<T>
where
    T: Clone + 'static,
    F: FnMut(u32) -> Promise<T> + 'static,
{
    let state = Rc::new(RetryState {
        ctx: ctx.clone(),
        name: name.into(),
        backoff: ExponentialBackoff::new(config),
        max_attempts: config.max_attempts,
        producer: RefCell::new(Some(Box::new(producer))),
        output: Promise::new(),
        timer: Cell::new(None),
        done: Cell::new(false),
    });

    RetryState::start_attempt(&state, 0);
    RetryHandle { state }
}

impl<T: Clone + 'static> RetryHandle<T> {
    /// Settles with the first successful result, `Cancelled`, or `RetriesExhausted`
    pub fn promise(&self) -> Promise<T> {
        self.state.output.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.state.done.get()
    }

    /// Revokes a pending backoff timer; the producer is never called again. An attempt that is
    ///  in flight is not aborted, but its outcome is ignored. Safe to call from inside the
    ///  producer.
    pub fn cancel(&self) -> CancelResult {
        let state = &self.state;
        if state.done.replace(true) {
            return CancelResult::AlreadyFired;
        }
        debug!("{}: cancelling retries", state.name);

        if let Some(timer) = state.timer.take() {
            state.ctx.cancel_timer(timer);
        }
        let producer = state.producer.borrow_mut().take();
        drop(producer);
        let _ = state.output.reject(ChatError::Cancelled);
        CancelResult::Cancelled
    }
}

impl<T: Clone + 'static> RetryState<T> {
    fn start_attempt(this: &Rc<Self>, attempt: u32) {
        this.timer.set(None);
        if this.done.get() {
            return;
        }

        let producer = this.producer.borrow_mut().take();
        let Some(mut producer) = producer else {
            return;
        };
        debug!("{}: attempt #{}", this.name, attempt);
        let produced = catch_panic(|| producer(attempt))
            .unwrap_or_else(|msg| Promise::rejected(ChatError::Internal(format!("retry producer panicked: {}", msg))));
        if !this.done.get() {
            *this.producer.borrow_mut() = Some(producer);
        }

        let this = this.clone();
        produced.on_settled(move |result| this.on_attempt_settled(attempt, result));
    }

    fn on_attempt_settled(self: Rc<Self>, attempt: u32, result: Result<T, ChatError>) {
        if self.done.get() {
            debug!("{}: ignoring outcome of attempt #{} after retries were stopped", self.name, attempt);
            return;
        }

        match result {
            Ok(value) => {
                debug!("{}: attempt #{} succeeded", self.name, attempt);
                self.finish(Ok(value));
            }
            Err(e) => {
                let attempts = attempt + 1;
                if self.max_attempts.is_some_and(|max| attempts >= max) {
                    warn!("{}: giving up after {} attempts: {}", self.name, attempts, e);
                    self.finish(Err(ChatError::RetriesExhausted {
                        attempts,
                        last_error: e.to_string(),
                    }));
                    return;
                }

                let delay = self.backoff.delay_for_attempt(attempt);
                debug!("{}: attempt #{} failed: {} - retrying in {:?}", self.name, attempt, e, delay);

                let this = self.clone();
                let timer = self.ctx.set_timeout(delay, move || RetryState::start_attempt(&this, attempts));
                self.timer.set(Some(timer));
            }
        }
    }

    fn finish(&self, result: Result<T, ChatError>) {
        self.done.set(true);
        let producer = self.producer.borrow_mut().take();
        drop(producer);
        let _ = self.output.settle(result);
    }
}
