//! Construction of [`Confined`] executors.

use crate::{
    confined::{Confined, QueueTx},
    message::Message,
    reentry,
    worker::{self, InterceptorFn, QueueRx, TeardownFn},
    Error,
};
use std::{num::NonZeroUsize, panic, thread};
use tokio::sync::{mpsc, oneshot};

/// Default worker thread name.
const DEFAULT_NAME: &str = "confine";

/// Configures and spawns a [`Confined`] executor.
///
/// ```
/// use confine::Builder;
/// use std::num::NonZeroUsize;
///
/// let executor = Builder::new()
///     .capacity(NonZeroUsize::new(64).unwrap())
///     .name("journal")
///     .build(|| Vec::<String>::new())
///     .expect("spawn worker");
/// executor.ask_blocking(|log| log.push("started".into())).unwrap();
/// ```
pub struct Builder<S> {
    capacity: Option<NonZeroUsize>,
    interceptor: Option<InterceptorFn<S>>,
    teardown: Option<TeardownFn<S>>,
    name: String,
}

impl<S: Send + 'static> Builder<S> {
    /// Create a builder with an unbounded queue, no interceptor, no teardown
    /// hook, and the default thread name.
    pub fn new() -> Self {
        Self {
            capacity: None,
            interceptor: None,
            teardown: None,
            name: DEFAULT_NAME.into(),
        }
    }

    /// Bound the queue to `capacity` external messages. Submissions beyond
    /// the bound wait for a slot (or fail, for the try variants).
    pub fn capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Install middleware that is offered every message, nested and external
    /// alike, and decides whether to invoke it. A message it drops resolves
    /// the awaiting caller with [`Error::Discarded`].
    pub fn interceptor(mut self, interceptor: impl Fn(&mut S, Message<S>) + Send + 'static) -> Self {
        self.interceptor = Some(Box::new(interceptor));
        self
    }

    /// Install a disposal hook for the state. It runs exactly once, on the
    /// shutting-down thread, after the worker has exited. Without a hook the
    /// state is simply dropped there.
    pub fn teardown(mut self, teardown: impl FnOnce(S) + Send + Sync + 'static) -> Self {
        self.teardown = Some(Box::new(teardown));
        self
    }

    /// Name the worker thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Spawn the worker, construct the state on it, and block until it is
    /// ready.
    ///
    /// A panic raised by `factory` is re-raised here, on the constructing
    /// thread, and the worker never enters its dispatch loop. Blocks the
    /// calling thread; construct from outside an async runtime.
    pub fn build(self, factory: impl FnOnce() -> S + Send + 'static) -> Result<Confined<S>, Error> {
        let owner = reentry::next_owner();
        let (queue_tx, queue_rx) = match self.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.get());
                (QueueTx::Bounded(tx), QueueRx::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
            }
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let interceptor = self.interceptor;
        let worker = thread::Builder::new()
            .name(self.name)
            .spawn(move || worker::run(owner, factory, interceptor, ready_tx, queue_rx))
            .map_err(Error::Spawn)?;
        let worker_thread = worker.thread().id();
        match ready_rx.blocking_recv() {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => {
                // The worker has already exited without looping; surface the
                // factory's panic to the constructing caller.
                let _ = worker.join();
                panic::resume_unwind(payload);
            }
            Err(_) => match worker.join() {
                Err(payload) => panic::resume_unwind(payload),
                Ok(_) => unreachable!("worker exited without signaling readiness"),
            },
        }
        Ok(Confined::assemble(
            owner,
            queue_tx,
            worker,
            worker_thread,
            self.teardown,
        ))
    }
}

impl<S: Send + 'static> Default for Builder<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_build_usable_executor() {
        let executor = Builder::new().build(|| 3u64).expect("spawn worker");
        assert_eq!(executor.ask_blocking(|n| *n).unwrap(), 3);
    }

    #[test]
    fn test_worker_thread_named() {
        let executor = Builder::new()
            .name("keeper")
            .build(|| ())
            .expect("spawn worker");
        let name = executor
            .ask_blocking(|_| thread::current().name().map(String::from))
            .unwrap();
        assert_eq!(name.as_deref(), Some("keeper"));
    }
}
