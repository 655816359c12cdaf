//! Suspending synchronization primitives.
//!
//! [`Semaphore`] is a FIFO-fair permit counter whose `acquire` suspends
//! instead of blocking; [`Mutex`] is its one-permit specialization with
//! owner-token tracking and RAII guards.

mod mutex;
mod semaphore;

pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{Semaphore, SemaphoreGuard};
