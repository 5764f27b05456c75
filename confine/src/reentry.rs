//! Same-thread reentry frames.
//!
//! # Overview
//!
//! A message body may submit further messages to its own executor. Those
//! submissions cannot pass through the queue: the worker is the queue's only
//! consumer and is blocked inside the submitting body, so the queued message
//! would never be drained. Instead, the worker publishes a *frame* in a
//! thread-local slot for the duration of its dispatch loop, and a submission
//! that finds itself on the worker thread executes inline through it.
//!
//! The frame is type-erased because a thread-local slot cannot be generic
//! over the state type. Recovering the type is sound because the frame
//! carries the id of the executor that installed it, executor ids are
//! allotted from a global counter and never reused, and a submission only
//! consults the frame after matching that id against its own executor.
//!
//! # Invariants
//!
//! - A frame is installed by the worker after the state factory has run and
//!   cleared (by [`EnterGuard`]) before the worker's execution cell is torn
//!   down; the pointer it carries is live whenever the frame is visible.
//! - At most one frame per thread: a worker thread runs exactly one
//!   dispatch loop for its entire life.
//! - Access to the confined state forms a stack. A nested message suspends
//!   the body that submitted it for the nested call's whole duration, so one
//!   frame of execution touches the state at any instant.

use crate::{message::Message, worker::Active};
use std::{
    cell::Cell,
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(0);

/// Allot a process-unique id for a new executor instance.
pub(crate) fn next_owner() -> u64 {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy)]
struct Frame {
    owner: u64,
    active: *const (),
}

thread_local! {
    static FRAME: Cell<Option<Frame>> = const { Cell::new(None) };
}

/// Clears the thread's frame when the dispatch loop exits.
pub(crate) struct EnterGuard<'a> {
    _active: PhantomData<&'a ()>,
}

impl Drop for EnterGuard<'_> {
    fn drop(&mut self) {
        FRAME.with(|slot| slot.set(None));
    }
}

/// Install the frame for `owner`'s dispatch loop on the current thread.
pub(crate) fn enter<S>(owner: u64, active: &Active<S>) -> EnterGuard<'_> {
    FRAME.with(|slot| {
        assert!(
            slot.get().is_none(),
            "dispatch loop already active on this thread"
        );
        slot.set(Some(Frame {
            owner,
            active: (active as *const Active<S>).cast(),
        }));
    });
    EnterGuard {
        _active: PhantomData,
    }
}

/// Execute `message` inline against the state confined by `owner`, which the
/// current thread is the worker of.
pub(crate) fn execute<S>(owner: u64, message: Message<S>) {
    let frame = FRAME
        .with(|slot| slot.get())
        .expect("nested submission outside the dispatch loop");
    assert_eq!(
        frame.owner, owner,
        "nested submission crossed executor instances"
    );
    // SAFETY: the owner ids match, and only `owner`'s worker installs a frame
    // carrying `owner`, so `frame.active` points at that worker's
    // `Active<S>`. The frame is cleared before the cell is torn down and this
    // function runs on the installing thread, so the pointer is live for the
    // whole call.
    let active = unsafe { &*frame.active.cast::<Active<S>>() };
    active.execute(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{self, Origin};
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_owner_ids_unique() {
        assert_ne!(next_owner(), next_owner());
    }

    #[test]
    fn test_enter_installs_and_guard_clears() {
        let active = Active::new(0u32, None);
        let owner = next_owner();
        {
            let _guard = enter(owner, &active);
            let (msg, handle) = message::asking(|n: &mut u32| *n + 1, Origin::Nested);
            execute(owner, msg);
            let value = handle
                .blocking_recv()
                .expect("handle resolved")
                .unwrap_or_else(|_| panic!("body panicked"));
            assert_eq!(value, 1);
        }
        // Frame gone: a second loop may claim the thread.
        let _guard = enter(next_owner(), &active);
    }

    #[test]
    fn test_double_enter_rejected() {
        let active = Active::new(0u32, None);
        let _guard = enter(next_owner(), &active);
        let result = catch_unwind(AssertUnwindSafe(|| enter(next_owner(), &active)));
        assert!(result.is_err());
    }
}
