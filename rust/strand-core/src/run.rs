//! Blocking entry point into the runtime.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Wake, Waker};
use std::thread::{self, Thread};

/// Drive `future` to completion on the current thread, parking between
/// polls. This is the bridge from synchronous code (main, tests) into the
/// runtime; tasks launched inside still run on their own dispatchers.
pub fn run_blocking<F: Future>(future: F) -> F::Output {
    struct ThreadWaker {
        thread: Thread,
        notified: AtomicBool,
    }

    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.wake_by_ref();
        }

        fn wake_by_ref(self: &Arc<Self>) {
            if !self.notified.swap(true, Ordering::SeqCst) {
                self.thread.unpark();
            }
        }
    }

    let parker = Arc::new(ThreadWaker {
        thread: thread::current(),
        notified: AtomicBool::new(false),
    });
    let waker = Waker::from(parker.clone());
    let mut cx = Context::from_waker(&waker);
    let mut future = Box::pin(future);

    loop {
        if let std::task::Poll::Ready(value) = future.as_mut().poll(&mut cx) {
            return value;
        }
        while !parker.notified.swap(false, Ordering::SeqCst) {
            thread::park();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
