//! Units of work and their completion bridging.

use crate::park;
use futures::future::BoxFuture;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};
use tokio::sync::oneshot;
use tracing::error;

/// Where a message originated relative to the worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Submitted from a thread other than the worker; delivered through the
    /// queue in FIFO order.
    External,
    /// Submitted from the worker's own call stack while another message was
    /// executing; runs inline, ahead of anything still queued.
    Nested,
}

impl Origin {
    /// Whether the message was submitted from inside the worker itself.
    pub const fn is_nested(&self) -> bool {
        matches!(self, Self::Nested)
    }
}

/// The outcome delivered through a completion handle: the body's value, or
/// the panic payload it raised.
pub(crate) type Completion<R> = std::thread::Result<R>;

type Body<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// A unit of work awaiting execution against the confined state.
///
/// The body is type-erased and owns its completion handle: invoking it runs
/// the caller's closure and resolves the handle with the value or the
/// captured panic. Dropping a [`Message`] without invoking it resolves the
/// awaiting caller with [`Error::Discarded`](crate::Error::Discarded).
pub struct Message<S> {
    body: Body<S>,
    origin: Origin,
}

impl<S> Message<S> {
    fn new(body: Body<S>, origin: Origin) -> Self {
        Self { body, origin }
    }

    /// Where this message was submitted from.
    pub const fn origin(&self) -> Origin {
        self.origin
    }

    /// Run the body against the confined state, resolving the completion
    /// handle exactly once.
    pub fn invoke(self, state: &mut S) {
        (self.body)(state);
    }
}

impl<S> std::fmt::Debug for Message<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Build a request message and the handle its result will arrive on.
pub(crate) fn asking<S, R, F>(f: F, origin: Origin) -> (Message<S>, oneshot::Receiver<Completion<R>>)
where
    F: FnOnce(&mut S) -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let body: Body<S> = Box::new(move |state: &mut S| {
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(state)));
        // The caller may have abandoned the handle; the body still ran.
        let _ = tx.send(result);
    });
    (Message::new(body, origin), rx)
}

/// Build a request message whose body suspends internally. The worker drives
/// the returned future to completion before dequeuing anything else.
pub(crate) fn asking_future<S, R, F>(
    f: F,
    origin: Origin,
) -> (Message<S>, oneshot::Receiver<Completion<R>>)
where
    F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, R> + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let body: Body<S> = Box::new(move |state: &mut S| {
        let result = panic::catch_unwind(AssertUnwindSafe(|| park::block_on(f(state))));
        let _ = tx.send(result);
    });
    (Message::new(body, origin), rx)
}

/// Build a fire-and-run message. There is no handle; a panic raised by the
/// body is logged instead of delivered.
pub(crate) fn telling<S, F>(f: F, origin: Origin) -> Message<S>
where
    F: FnOnce(&mut S) + Send + 'static,
{
    Message::new(
        Box::new(move |state: &mut S| {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f(state))) {
                error!(
                    panic = describe_panic(payload.as_ref()),
                    "fire-and-run message panicked"
                );
            }
        }),
        origin,
    )
}

/// Best-effort rendering of a panic payload for log records.
pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_resolves_handle() {
        let (message, handle) = asking(|n: &mut u32| *n * 2, Origin::External);
        assert_eq!(message.origin(), Origin::External);
        message.invoke(&mut 21);
        let completion = handle.blocking_recv().expect("handle resolved");
        let value = completion.unwrap_or_else(|_| panic!("body panicked"));
        assert_eq!(value, 42);
    }

    #[test]
    fn test_drop_without_invoke_closes_handle() {
        let (message, handle) = asking(|_: &mut u32| (), Origin::External);
        drop(message);
        assert!(handle.blocking_recv().is_err());
    }

    #[test]
    fn test_body_panic_rides_handle() {
        let (message, handle) = asking(|_: &mut u32| -> u32 { panic!("boom") }, Origin::Nested);
        message.invoke(&mut 0);
        let completion = handle.blocking_recv().expect("handle resolved");
        let payload = completion.expect_err("body panicked");
        assert_eq!(describe_panic(payload.as_ref()), "boom");
    }

    #[test]
    fn test_telling_swallows_nothing_into_handle() {
        // A fire-and-run body panic must not take the invoker down.
        let message = telling(|_: &mut u32| panic!("ignored"), Origin::External);
        message.invoke(&mut 0);
    }

    #[test]
    fn test_asking_future_drives_body() {
        fn body(n: &mut u32) -> BoxFuture<'_, u32> {
            Box::pin(async move {
                *n += 1;
                *n
            })
        }
        let (message, handle) = asking_future(body, Origin::External);
        let mut state = 6;
        message.invoke(&mut state);
        let completion = handle.blocking_recv().expect("handle resolved");
        assert_eq!(completion.unwrap_or_else(|_| panic!("body panicked")), 7);
        assert_eq!(state, 7);
    }
}
