//! The executor handle: submission API and ordered shutdown.

use crate::{
    builder::Builder,
    message::{self, Completion, Message, Origin},
    reentry,
    worker::TeardownFn,
    Error,
};
use futures::future::BoxFuture;
use std::{
    panic,
    thread::{self, JoinHandle, ThreadId},
};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Queue producer half, bounded or unbounded.
pub(crate) enum QueueTx<S> {
    Bounded(mpsc::Sender<Message<S>>),
    Unbounded(mpsc::UnboundedSender<Message<S>>),
}

impl<S> QueueTx<S> {
    async fn send(&self, message: Message<S>) -> Result<(), Error> {
        match self {
            Self::Bounded(tx) => tx.send(message).await.map_err(|_| Error::Closed),
            Self::Unbounded(tx) => tx.send(message).map_err(|_| Error::Closed),
        }
    }

    fn blocking_send(&self, message: Message<S>) -> Result<(), Error> {
        match self {
            Self::Bounded(tx) => tx.blocking_send(message).map_err(|_| Error::Closed),
            Self::Unbounded(tx) => tx.send(message).map_err(|_| Error::Closed),
        }
    }

    fn try_send(&self, message: Message<S>) -> Result<(), Error> {
        match self {
            Self::Bounded(tx) => tx.try_send(message).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => Error::Full,
                mpsc::error::TrySendError::Closed(_) => Error::Closed,
            }),
            Self::Unbounded(tx) => tx.send(message).map_err(|_| Error::Closed),
        }
    }
}

/// A serialized-access executor: one worker thread exclusively owns a piece
/// of state, and every submission runs against it in turn.
///
/// The handle is `Send + Sync`; submit through `&self` from any thread.
/// External submissions are processed in FIFO order. A submission made from
/// inside a running message body is executed inline, depth-first, ahead of
/// anything still queued (see [`Origin`]).
pub struct Confined<S> {
    owner: u64,
    queue: Option<QueueTx<S>>,
    worker: Option<JoinHandle<Option<S>>>,
    worker_thread: ThreadId,
    teardown: Option<TeardownFn<S>>,
}

impl<S: Send + 'static> Confined<S> {
    /// Spawn an executor with an unbounded queue and no interceptor; `factory`
    /// runs on the worker thread. See [`Builder`] for the remaining knobs.
    pub fn new(factory: impl FnOnce() -> S + Send + 'static) -> Result<Self, Error> {
        Builder::new().build(factory)
    }
}

impl<S> Confined<S> {
    pub(crate) fn assemble(
        owner: u64,
        queue: QueueTx<S>,
        worker: JoinHandle<Option<S>>,
        worker_thread: ThreadId,
        teardown: Option<TeardownFn<S>>,
    ) -> Self {
        Self {
            owner,
            queue: Some(queue),
            worker: Some(worker),
            worker_thread,
            teardown,
        }
    }

    /// Decide how a submission from the current thread must travel.
    fn origin(&self) -> Origin {
        if thread::current().id() == self.worker_thread {
            Origin::Nested
        } else {
            Origin::External
        }
    }

    fn queue(&self) -> Result<&QueueTx<S>, Error> {
        self.queue.as_ref().ok_or(Error::Closed)
    }

    /// Run `f` against the state and return its result.
    ///
    /// Returns:
    /// - [`Error::Closed`] if the executor has shut down
    /// - [`Error::Discarded`] if an interceptor dropped the message
    ///
    /// A panic raised by `f` is re-raised here, at the await, with its
    /// original payload.
    pub async fn ask<R, F>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let origin = self.origin();
        let (message, handle) = message::asking(f, origin);
        match origin {
            Origin::Nested => reentry::execute(self.owner, message),
            Origin::External => self.queue()?.send(message).await?,
        }
        resolve(handle.await)
    }

    /// Like [`Confined::ask`], for a body that suspends internally. The
    /// worker drives the returned future to completion before dequeuing the
    /// next message; that is the serialization guarantee, not a liveness
    /// hazard.
    pub async fn ask_future<R, F>(&self, f: F) -> Result<R, Error>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, R> + Send + 'static,
        R: Send + 'static,
    {
        let origin = self.origin();
        let (message, handle) = message::asking_future(f, origin);
        match origin {
            Origin::Nested => reentry::execute(self.owner, message),
            Origin::External => self.queue()?.send(message).await?,
        }
        resolve(handle.await)
    }

    /// Blocking counterpart of [`Confined::ask`] for callers on ordinary
    /// synchronous code paths. Safe to call from inside a message body: the
    /// nested execution resolves the handle before the blocking read.
    pub fn ask_blocking<R, F>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let origin = self.origin();
        let (message, handle) = message::asking(f, origin);
        match origin {
            Origin::Nested => reentry::execute(self.owner, message),
            Origin::External => self.queue()?.blocking_send(message)?,
        }
        resolve(handle.blocking_recv())
    }

    /// Fire-and-run: enqueue `f` (waiting for a slot on a bounded queue) and
    /// return without awaiting its completion. A panic raised by `f` is
    /// logged, never delivered.
    pub async fn tell<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let origin = self.origin();
        let message = message::telling(f, origin);
        match origin {
            Origin::Nested => {
                reentry::execute(self.owner, message);
                Ok(())
            }
            Origin::External => self.queue()?.send(message).await,
        }
    }

    /// Fire-and-run without waiting: [`Error::Full`] when a bounded queue is
    /// at capacity.
    pub fn try_tell<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let origin = self.origin();
        let message = message::telling(f, origin);
        match origin {
            Origin::Nested => {
                reentry::execute(self.owner, message);
                Ok(())
            }
            Origin::External => self.queue()?.try_send(message),
        }
    }

    /// Shut down in order: stop accepting submissions, wait for the worker
    /// to finish the in-flight message and drain the queue, then run the
    /// teardown hook (or drop the state) on this thread.
    ///
    /// Idempotent. Must not be called from inside a message body. When the
    /// handle is shared through an `Arc` with a bounded queue, stop
    /// submitting before the last reference drops: a thread blocked on a
    /// full queue holds its slot forever once the worker is gone.
    pub fn shutdown(&mut self) {
        drop(self.queue.take());
        let Some(worker) = self.worker.take() else {
            return;
        };
        debug!("waiting for worker to drain");
        match worker.join() {
            Ok(Some(state)) => match self.teardown.take() {
                Some(teardown) => teardown(state),
                None => drop(state),
            },
            // Construction failure never produces a handle; nothing to tear
            // down.
            Ok(None) => {}
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Shut down and hand the state back instead of disposing it. The
    /// teardown hook does not run. Returns `None` if the executor was
    /// already shut down.
    pub fn into_state(mut self) -> Option<S> {
        drop(self.queue.take());
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(state) => state,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl<S> Drop for Confined<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S> std::fmt::Debug for Confined<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Confined")
            .field("owner", &self.owner)
            .field("closed", &self.queue.is_none())
            .finish_non_exhaustive()
    }
}

fn resolve<R>(received: Result<Completion<R>, oneshot::error::RecvError>) -> Result<R, Error> {
    match received {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(payload)) => panic::resume_unwind(payload),
        Err(_) => Err(Error::Discarded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_ask_and_tell_roundtrip() {
        let executor = Confined::new(|| Vec::new()).expect("spawn worker");
        block_on(async {
            executor.tell(|log: &mut Vec<u32>| log.push(1)).await.unwrap();
            executor.tell(|log| log.push(2)).await.unwrap();
            assert_eq!(executor.ask(|log| log.clone()).await.unwrap(), vec![1, 2]);
        });
    }

    #[test]
    fn test_submissions_after_shutdown_rejected() {
        let mut executor = Confined::new(|| 0u32).expect("spawn worker");
        executor.shutdown();
        assert!(matches!(
            block_on(executor.ask(|n| *n)),
            Err(Error::Closed)
        ));
        assert!(matches!(executor.try_tell(|_| ()), Err(Error::Closed)));
        assert!(matches!(
            executor.ask_blocking(|n| *n),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_shutdown_idempotent() {
        let mut executor = Confined::new(|| 0u32).expect("spawn worker");
        executor.shutdown();
        executor.shutdown();
    }

    #[test]
    fn test_into_state_returns_final_state() {
        let executor = Confined::new(|| 10u32).expect("spawn worker");
        executor.ask_blocking(|n| *n += 5).unwrap();
        assert_eq!(executor.into_state(), Some(15));
    }

    #[test]
    fn test_debug_reports_closed() {
        let mut executor = Confined::new(|| 0u32).expect("spawn worker");
        assert!(format!("{executor:?}").contains("closed: false"));
        executor.shutdown();
        assert!(format!("{executor:?}").contains("closed: true"));
    }
}
