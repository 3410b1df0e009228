//! Single-assignment async combinator for sequencing network operations on the loop thread.
//!
//! A [`Promise`] is settled at most once. Continuations registered with [`Promise::then`] and
//!  [`Promise::fail`] run exactly once, on the loop thread, when the promise they depend on
//!  settles (immediately if it is settled already). There is no scheduling in here: whoever
//!  settles a promise runs its continuations.

use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use tracing::error;

use crate::error::{ChatError, ChatResult};
use crate::util::isolate::catch_panic;

pub mod backoff;
pub mod retry;

type Continuation<T> = Box<dyn FnOnce(ChatResult<T>)>;

struct PromiseState<T> {
    result: Option<ChatResult<T>>,
    continuations: Vec<Continuation<T>>,
}

pub struct Promise<T: Clone + 'static> {
    state: Rc<RefCell<PromiseState<T>>>,
}

impl<T: Clone + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise { state: self.state.clone() }
    }
}

impl<T: Clone + 'static> Debug for Promise<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state.borrow().result {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "rejected",
        };
        write!(f, "Promise({})", state)
    }
}

impl<T: Clone + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Promise<T> {
    pub fn new() -> Promise<T> {
        Promise {
            state: Rc::new(RefCell::new(PromiseState {
                result: None,
                continuations: Vec::new(),
            })),
        }
    }

    pub fn resolved(value: T) -> Promise<T> {
        Self::settled(Ok(value))
    }

    pub fn rejected(error: ChatError) -> Promise<T> {
        Self::settled(Err(error))
    }

    pub fn settled(result: ChatResult<T>) -> Promise<T> {
        Promise {
            state: Rc::new(RefCell::new(PromiseState {
                result: Some(result),
                continuations: Vec::new(),
            })),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state.borrow().result.is_some()
    }

    /// A copy of the result if the promise is settled
    pub fn peek(&self) -> Option<ChatResult<T>> {
        self.state.borrow().result.clone()
    }

    pub fn resolve(&self, value: T) -> ChatResult<()> {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: ChatError) -> ChatResult<()> {
        self.settle(Err(error))
    }

    /// Settling a promise a second time is a bug in the caller. The first result stays in
    ///  place, continuations are not run again, and the caller gets `AlreadySettled`.
    pub fn settle(&self, result: ChatResult<T>) -> ChatResult<()> {
        let continuations = {
            let mut state = self.state.borrow_mut();
            if state.result.is_some() {
                error!("attempt to settle a promise that is already settled");
                return Err(ChatError::AlreadySettled);
            }
            state.result = Some(result.clone());
            std::mem::take(&mut state.continuations)
        };

        for continuation in continuations {
            continuation(result.clone());
        }
        Ok(())
    }

    /// Registers a raw continuation that sees both outcomes
    pub fn on_settled(&self, continuation: impl FnOnce(ChatResult<T>) + 'static) {
        let result = {
            let mut state = self.state.borrow_mut();
            match &state.result {
                Some(result) => result.clone(),
                None => {
                    state.continuations.push(Box::new(continuation));
                    return;
                }
            }
        };
        continuation(result);
    }

    /// Settles `target` with whatever this promise settles with
    pub fn forward_to(&self, target: Promise<T>) {
        self.on_settled(move |result| {
            let _ = target.settle(result);
        });
    }

    pub fn then<R, F>(&self, f: F) -> Promise<R::Output>
    where
        R: IntoPromise,
        F: FnOnce(T) -> R + 'static,
    {
        let next = Promise::new();
        let downstream = next.clone();
        self.on_settled(move |result| match result {
            Ok(value) => adopt(catch_panic(|| f(value)), downstream),
            Err(e) => {
                let _ = downstream.reject(e);
            }
        });
        next
    }

    /// Error continuation. A successful result passes through untouched to the next `then`.
    pub fn fail<R, F>(&self, f: F) -> Promise<T>
    where
        R: IntoPromise<Output = T>,
        F: FnOnce(ChatError) -> R + 'static,
    {
        let next = Promise::new();
        let downstream = next.clone();
        self.on_settled(move |result| match result {
            Ok(value) => {
                let _ = downstream.resolve(value);
            }
            Err(e) => adopt(catch_panic(|| f(e)), downstream),
        });
        next
    }

    /// Drops the value, keeping only success or failure
    pub fn discard(&self) -> Promise<()> {
        self.then(|_| Ok(()))
    }
}

fn adopt<R: IntoPromise>(outcome: Result<R, String>, downstream: Promise<R::Output>) {
    match outcome {
        Ok(r) => r.into_promise().forward_to(downstream),
        Err(msg) => {
            let _ = downstream.reject(ChatError::Internal(format!("continuation panicked: {}", msg)));
        }
    }
}

/// What a continuation may return: a plain result, or another promise whose eventual
///  result the downstream promise adopts.
pub trait IntoPromise {
    type Output: Clone + 'static;

    fn into_promise(self) -> Promise<Self::Output>;
}

impl<U: Clone + 'static> IntoPromise for Promise<U> {
    type Output = U;

    fn into_promise(self) -> Promise<U> {
        self
    }
}

impl<U: Clone + 'static> IntoPromise for ChatResult<U> {
    type Output = U;

    fn into_promise(self) -> Promise<U> {
        Promise::settled(self)
    }
}

/// Resolves when all inputs have resolved, with their values in input order. Rejects with the
///  first rejection among the inputs without waiting for the others; inputs settling later are
///  ignored.
pub fn when<T: Clone + 'static>(inputs: Vec<Promise<T>>) -> Promise<Vec<T>> {
    let output: Promise<Vec<T>> = Promise::new();
    if inputs.is_empty() {
        let _ = output.resolve(Vec::new());
        return output;
    }

    let values: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new(vec![None; inputs.len()]));
    let remaining = Rc::new(Cell::new(inputs.len()));

    for (i, input) in inputs.iter().enumerate() {
        let output = output.clone();
        let values = values.clone();
        let remaining = remaining.clone();
        input.on_settled(move |result| {
            if output.is_settled() {
                return;
            }
            match result {
                Ok(value) => {
                    values.borrow_mut()[i] = Some(value);
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let values: Vec<T> = values.borrow_mut()
                            .drain(..)
                            .flatten()
                            .collect();
                        let _ = output.resolve(values);
                    }
                }
                Err(e) => {
                    let _ = output.reject(e);
                }
            }
        });
    }
    output
}

/// [`when`] for two inputs of different types
pub fn when2<A: Clone + 'static, B: Clone + 'static>(a: &Promise<A>, b: &Promise<B>) -> Promise<(A, B)> {
    let output: Promise<(A, B)> = Promise::new();
    let values: Rc<RefCell<(Option<A>, Option<B>)>> = Default::default();

    fn complete<A: Clone + 'static, B: Clone + 'static>(values: &RefCell<(Option<A>, Option<B>)>, output: &Promise<(A, B)>) {
        let pair = {
            let mut values = values.borrow_mut();
            if values.0.is_none() || values.1.is_none() {
                return;
            }
            (values.0.take(), values.1.take())
        };
        if let (Some(a), Some(b)) = pair {
            let _ = output.resolve((a, b));
        }
    }

    {
        let output = output.clone();
        let values = values.clone();
        a.on_settled(move |result| {
            if output.is_settled() {
                return;
            }
            match result {
                Ok(v) => {
                    values.borrow_mut().0 = Some(v);
                    complete(&values, &output);
                }
                Err(e) => { let _ = output.reject(e); }
            }
        });
    }
    {
        let output = output.clone();
        b.on_settled(move |result| {
            if output.is_settled() {
                return;
            }
            match result {
                Ok(v) => {
                    values.borrow_mut().1 = Some(v);
                    complete(&values, &output);
                }
                Err(e) => { let _ = output.reject(e); }
            }
        });
    }
    output
}
