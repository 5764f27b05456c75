//! Park-based future driver for the worker thread.

use futures::task::{waker, ArcWake};
use std::{
    future::Future,
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    thread::{self, Thread},
};

struct Parker {
    thread: Thread,
    woken: AtomicBool,
}

impl ArcWake for Parker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::Release);
        arc_self.thread.unpark();
    }
}

/// Drive `future` to completion on the current thread.
///
/// Every call owns its own wake flag, so invocations may nest: when a nested
/// call consumes an unpark aimed at an outer one, the outer flag stays set
/// and the outer loop re-polls without parking once the nested call returns.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    let parker = Arc::new(Parker {
        thread: thread::current(),
        woken: AtomicBool::new(false),
    });
    let waker = waker(parker.clone());
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
        while !parker.woken.swap(false, Ordering::Acquire) {
            thread::park();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_ready_future() {
        assert_eq!(block_on(async { 9 }), 9);
    }

    #[test]
    fn test_cross_thread_wake() {
        let (tx, rx) = oneshot::channel();
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            tx.send(7).unwrap();
        });
        assert_eq!(block_on(async { rx.await.unwrap() }), 7);
        sender.join().unwrap();
    }

    #[test]
    fn test_nested_calls() {
        let value = block_on(async {
            let inner = block_on(async { 3 });
            inner + 4
        });
        assert_eq!(value, 7);
    }

    #[test]
    fn test_nested_call_does_not_lose_outer_wake() {
        let (outer_tx, outer_rx) = oneshot::channel();
        let (inner_tx, inner_rx) = oneshot::channel();
        // Resolve the outer handle first so its wake lands while the nested
        // call below is the one parked.
        let sender = thread::spawn(move || {
            outer_tx.send(1).unwrap();
            thread::sleep(Duration::from_millis(10));
            inner_tx.send(2).unwrap();
        });
        let value = block_on(async {
            let inner = block_on(async { inner_rx.await.unwrap() });
            inner + outer_rx.await.unwrap()
        });
        assert_eq!(value, 3);
        sender.join().unwrap();
    }
}
