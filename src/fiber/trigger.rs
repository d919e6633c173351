//! Completion trigger: a counting latch fibers wait on.
//!
//! Each pending sub-operation arms the trigger with `wait_for_one_more` and
//! later reports through `complete`. The trigger fires when the outstanding
//! count reaches zero; the first error reported by any sub-operation is what
//! the waiter observes. Waiting twice after a firing without `reset` is a
//! protocol violation and panics.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::Result;

struct TriggerState {
    outstanding: usize,
    fired: bool,
    waited: bool,
    error: Option<crate::error::Error>,
    wakers: Vec<Waker>,
}

struct TriggerInner {
    state: Mutex<TriggerState>,
    cond: Condvar,
}

/// Counting completion latch shared between a waiter and its sub-operations.
#[derive(Clone)]
pub struct CompletionTrigger {
    inner: Arc<TriggerInner>,
}

impl CompletionTrigger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                state: Mutex::new(TriggerState {
                    outstanding: 0,
                    fired: false,
                    waited: false,
                    error: None,
                    wakers: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Arm the trigger for one more pending sub-operation.
    pub fn wait_for_one_more(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.outstanding += 1;
        // Re-arming after a firing starts a fresh round.
        if state.fired {
            state.fired = false;
            state.waited = false;
        }
    }

    /// Report one sub-operation's completion. Fires the trigger when the
    /// outstanding count reaches zero.
    pub fn complete(&self, result: Result<()>) {
        let mut state = self.inner.state.lock().unwrap();
        assert!(
            state.outstanding > 0,
            "completion trigger completed more times than it was armed"
        );
        if let Err(err) = result {
            if state.error.is_none() {
                state.error = Some(err);
            }
        }
        state.outstanding -= 1;
        if state.outstanding == 0 {
            state.fired = true;
            for waker in state.wakers.drain(..) {
                waker.wake();
            }
            self.inner.cond.notify_all();
        }
    }

    /// Suspend the current fiber until every armed sub-operation completes.
    pub fn wait(&self) -> TriggerWait<'_> {
        TriggerWait { trigger: self }
    }

    /// Block the calling OS thread until the trigger fires. For external
    /// threads that are not running on the fiber pool.
    pub fn wait_sync(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        while state.outstanding > 0 {
            state = self.inner.cond.wait(state).unwrap();
        }
        Self::consume(&mut state)
    }

    /// Make a fired trigger reusable.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock().unwrap();
        assert!(
            state.outstanding == 0,
            "completion trigger reset while operations are outstanding"
        );
        state.fired = false;
        state.waited = false;
        state.error = None;
    }

    fn consume(state: &mut TriggerState) -> Result<()> {
        if state.fired && state.waited {
            panic!("completion trigger waited on twice without reset");
        }
        state.waited = true;
        match state.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for CompletionTrigger {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TriggerWait<'a> {
    trigger: &'a CompletionTrigger,
}

impl Future for TriggerWait<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.trigger.inner.state.lock().unwrap();
        if state.outstanding == 0 {
            Poll::Ready(CompletionTrigger::consume(&mut state))
        } else {
            if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                state.wakers.push(cx.waker().clone());
            }
            Poll::Pending
        }
    }
}
