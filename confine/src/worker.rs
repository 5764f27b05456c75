//! The dedicated worker: state construction, dispatch loop, teardown order.

use crate::{
    message::{self, Message},
    reentry,
};
use std::{
    any::Any,
    cell::UnsafeCell,
    panic::{self, AssertUnwindSafe},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Middleware offered every message before it runs. `Fn` rather than `FnMut`:
/// a nested message re-enters the interceptor while an outer interception is
/// still on the stack.
pub(crate) type InterceptorFn<S> = Box<dyn Fn(&mut S, Message<S>) + Send + 'static>;

/// Disposal hook run on the shutting-down thread after the worker has exited.
pub(crate) type TeardownFn<S> = Box<dyn FnOnce(S) + Send + Sync + 'static>;

/// Readiness signal: `Ok` once the state factory has run, `Err` with the
/// captured payload when it panicked.
pub(crate) type Ready = Result<(), Box<dyn Any + Send + 'static>>;

/// The worker's execution cell: the confined state plus the interceptor
/// every message is offered to. Lives on the worker thread for the whole
/// dispatch loop; nested submissions reach it through [`reentry`].
pub(crate) struct Active<S> {
    state: UnsafeCell<S>,
    interceptor: Option<InterceptorFn<S>>,
}

impl<S> Active<S> {
    pub(crate) fn new(state: S, interceptor: Option<InterceptorFn<S>>) -> Self {
        Self {
            state: UnsafeCell::new(state),
            interceptor,
        }
    }

    /// Run one message to completion against the confined state.
    pub(crate) fn execute(&self, message: Message<S>) {
        // SAFETY: the cell is only reachable from the worker thread, and
        // execution forms a stack: a nested message suspends the body that
        // submitted it for the nested call's entire duration, so exactly one
        // frame of execution touches the state at any instant.
        let state = unsafe { &mut *self.state.get() };
        match &self.interceptor {
            Some(interceptor) => interceptor(state, message),
            None => message.invoke(state),
        }
    }

    fn into_state(self) -> S {
        self.state.into_inner()
    }
}

/// Queue consumer half, bounded or unbounded.
pub(crate) enum QueueRx<S> {
    Bounded(mpsc::Receiver<Message<S>>),
    Unbounded(mpsc::UnboundedReceiver<Message<S>>),
}

impl<S> QueueRx<S> {
    /// Take the next message, blocking while the queue is empty. Returns
    /// `None` once every sender is gone and the buffer is drained.
    fn blocking_recv(&mut self) -> Option<Message<S>> {
        match self {
            Self::Bounded(rx) => rx.blocking_recv(),
            Self::Unbounded(rx) => rx.blocking_recv(),
        }
    }
}

/// Worker thread entry point.
///
/// Constructs the state (capturing a factory panic for the constructing
/// thread instead of unwinding here), signals readiness, then drains the
/// queue until it closes. Returns the state for disposal on the
/// shutting-down thread, or `None` when construction failed and the loop
/// never started.
pub(crate) fn run<S>(
    owner: u64,
    factory: impl FnOnce() -> S,
    interceptor: Option<InterceptorFn<S>>,
    ready: oneshot::Sender<Ready>,
    mut queue: QueueRx<S>,
) -> Option<S> {
    let state = match panic::catch_unwind(AssertUnwindSafe(factory)) {
        Ok(state) => state,
        Err(payload) => {
            debug!("state factory panicked, worker exiting");
            let _ = ready.send(Err(payload));
            return None;
        }
    };
    let _ = ready.send(Ok(()));
    debug!("worker ready");

    let active = Active::new(state, interceptor);
    {
        let _frame = reentry::enter(owner, &active);
        while let Some(msg) = queue.blocking_recv() {
            // A body panic is delivered through the message's own handle; a
            // panic escaping the message (a misbehaving interceptor) must not
            // take the loop down with it.
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| active.execute(msg))) {
                error!(
                    panic = message::describe_panic(payload.as_ref()),
                    "message dispatch panicked"
                );
            }
        }
    }
    debug!("queue closed and drained, worker exiting");
    Some(active.into_state())
}
