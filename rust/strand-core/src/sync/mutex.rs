//! Suspending mutual exclusion.
//!
//! A one-permit [`Semaphore`](super::Semaphore) with owner tracking. The
//! lock is not reentrant: locking again with the same owner token is a
//! programmer error and panics, as does unlocking with a token that does
//! not hold the lock. [`MutexGuard`] releases on every exit path.

use std::fmt;
use std::sync::Mutex as StdMutex;

use super::Semaphore;
use crate::error::Outcome;

/// A suspending, FIFO-fair mutex.
pub struct Mutex {
    semaphore: Semaphore,
    owner: StdMutex<Option<u64>>,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
            owner: StdMutex::new(None),
        }
    }

    /// `true` while some task holds the lock.
    pub fn is_locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// `true` when `owner` currently holds the lock.
    pub fn holds_lock(&self, owner: u64) -> bool {
        *self.owner.lock().unwrap() == Some(owner)
    }

    /// Lock anonymously; suspends while held elsewhere.
    pub async fn lock(&self) -> Outcome<()> {
        self.semaphore.acquire().await
    }

    /// Lock on behalf of `owner`. Panics if `owner` already holds the
    /// lock (the lock is not reentrant).
    pub async fn lock_owned(&self, owner: u64) -> Outcome<()> {
        assert!(
            !self.holds_lock(owner),
            "mutex is not reentrant: owner {owner} already holds the lock"
        );
        self.semaphore.acquire().await?;
        *self.owner.lock().unwrap() = Some(owner);
        Ok(())
    }

    /// Non-suspending lock attempt.
    pub fn try_lock(&self) -> bool {
        self.semaphore.try_acquire()
    }

    /// Non-suspending lock attempt on behalf of `owner`.
    pub fn try_lock_owned(&self, owner: u64) -> bool {
        assert!(
            !self.holds_lock(owner),
            "mutex is not reentrant: owner {owner} already holds the lock"
        );
        if self.semaphore.try_acquire() {
            *self.owner.lock().unwrap() = Some(owner);
            true
        } else {
            false
        }
    }

    /// Unlock an anonymous lock. Panics when the lock was taken with an
    /// owner token.
    pub fn unlock(&self) {
        let owner = self.owner.lock().unwrap();
        assert!(
            owner.is_none(),
            "mutex is owned; unlock with the owner token"
        );
        drop(owner);
        self.semaphore.release();
    }

    /// Unlock on behalf of `owner`. Panics when `owner` does not hold the
    /// lock.
    pub fn unlock_owned(&self, owner: u64) {
        let mut slot = self.owner.lock().unwrap();
        assert!(
            *slot == Some(owner),
            "mutex is not held by owner {owner}"
        );
        *slot = None;
        drop(slot);
        self.semaphore.release();
    }

    /// Lock, returning an RAII guard that unlocks on drop.
    pub async fn lock_guard(&self) -> Outcome<MutexGuard<'_>> {
        self.semaphore.acquire().await?;
        Ok(MutexGuard { mutex: self })
    }

    /// Run `f` under the lock; the lock is released on every exit path.
    pub async fn with_lock<T>(&self, f: impl FnOnce() -> T) -> Outcome<T> {
        let guard = self.lock_guard().await?;
        let value = f();
        drop(guard);
        Ok(value)
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .field("owner", &*self.owner.lock().unwrap())
            .finish()
    }
}

/// RAII lock guard; unlocks on drop.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.semaphore.release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::run_blocking;
    use crate::scope::coroutine_scope;
    use crate::time::delay;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn with_lock_is_clean_before_and_after() {
        let mutex = Mutex::new();
        assert!(!mutex.is_locked());
        let value = run_blocking(mutex.with_lock(|| 5)).unwrap();
        assert_eq!(value, 5);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn lock_excludes_concurrent_critical_sections() {
        let mutex = Arc::new(Mutex::new());
        let in_section = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let result = run_blocking(coroutine_scope(move |scope| async move {
            for _ in 0..8 {
                let mutex = Arc::clone(&mutex);
                let in_section = Arc::clone(&in_section);
                let overlap = Arc::clone(&overlap);
                scope.launch(async move {
                    let guard = mutex.lock_guard().await?;
                    let entered = in_section.fetch_add(1, Ordering::SeqCst);
                    if entered > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    delay(Duration::from_millis(2)).await?;
                    in_section.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                    Ok(())
                });
            }
            Ok(overlap)
        }));
        assert_eq!(result.unwrap().load(Ordering::SeqCst), 0);
    }

    #[test]
    fn owner_tokens_are_checked() {
        let mutex = Mutex::new();
        run_blocking(async {
            mutex.lock_owned(7).await.unwrap();
            assert!(mutex.holds_lock(7));
            assert!(!mutex.holds_lock(8));
            mutex.unlock_owned(7);
            assert!(!mutex.is_locked());
        });
    }

    #[test]
    #[should_panic(expected = "not reentrant")]
    fn relock_by_same_owner_panics() {
        let mutex = Mutex::new();
        run_blocking(async {
            mutex.lock_owned(1).await.unwrap();
            let _ = mutex.lock_owned(1).await;
        });
    }

    #[test]
    #[should_panic(expected = "not held by owner")]
    fn unlock_with_foreign_owner_panics() {
        let mutex = Mutex::new();
        run_blocking(async {
            mutex.lock_owned(1).await.unwrap();
            mutex.unlock_owned(2);
        });
    }

    #[test]
    fn guard_releases_on_early_exit() {
        let mutex = Mutex::new();
        let result: Outcome<()> = run_blocking(async {
            let _guard = mutex.lock_guard().await?;
            Err(crate::error::StrandError::msg("bail out"))
        });
        assert!(result.is_err());
        assert!(!mutex.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = Mutex::new();
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(mutex.try_lock());
    }
}
