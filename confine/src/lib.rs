//! Confine mutable state to a dedicated worker thread.
//!
//! # Overview
//!
//! [`Confined`] owns an arbitrary, possibly non-`Sync` piece of state and a
//! single worker thread that is the only code ever allowed to touch it.
//! Callers on any thread submit closures over the state and await the result;
//! the worker constructs the state, then drains the submission queue one
//! message at a time, running each body to completion (asynchronous
//! suspension included) before starting the next. No locks are taken on the
//! state itself: exclusivity comes from confinement.
//!
//! Submissions from inside a message body are detected by comparing the
//! calling thread against the worker thread and are executed inline,
//! depth-first, instead of passing through the queue. Routing them through
//! the queue would deadlock: the worker is the queue's only consumer and is
//! blocked inside the submitting body.
//!
//! An optional interceptor installed at construction is offered every
//! message (external and nested alike) before it runs and decides whether to
//! invoke it, which makes cross-cutting concerns like timing, logging, and
//! filtering possible without touching call sites.
//!
//! # Example
//!
//! ```
//! use confine::Confined;
//!
//! let counter = Confined::new(|| 0u64).expect("spawn worker");
//! futures::executor::block_on(async {
//!     counter.tell(|n| *n += 5).await.unwrap();
//!     assert_eq!(counter.ask(|n| *n).await.unwrap(), 5);
//! });
//! ```

use std::io;
use thiserror::Error;

mod builder;
mod confined;
mod message;
mod park;
mod reentry;
mod worker;

pub use builder::Builder;
pub use confined::Confined;
pub use message::{Message, Origin};

/// An error that can occur when constructing an executor or submitting a
/// message to it.
#[derive(Debug, Error)]
pub enum Error {
    /// The executor has shut down (or is shutting down) and no longer
    /// accepts submissions.
    #[error("closed")]
    Closed,
    /// The bounded queue is at capacity.
    #[error("full")]
    Full,
    /// The message was dropped without being invoked.
    #[error("discarded")]
    Discarded,
    /// The worker thread could not be spawned.
    #[error("worker spawn failed: {0}")]
    Spawn(io::Error),
}
