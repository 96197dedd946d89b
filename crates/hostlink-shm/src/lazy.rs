//! One-shot lazy initialization guarded by an atomic state machine.
//!
//! Used for the per-connection shared-region setup: the region is created
//! on first use, exactly once, and concurrent first users either win the
//! init race or wait for the winner. A failed init rolls back to uninit so
//! a later attempt can retry.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const BUSY: u8 = 1;
const READY: u8 = 2;

pub struct LazyInit<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: the value is written once (by the BUSY owner) before READY is
// published with Release; readers only touch it after observing READY with
// Acquire.
unsafe impl<T: Send + Sync> Sync for LazyInit<T> {}
unsafe impl<T: Send> Send for LazyInit<T> {}

impl<T> LazyInit<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(None),
        }
    }

    /// Get the value, running `init` if nobody has yet.
    ///
    /// Exactly one caller runs `init` per attempt; losers wait. If `init`
    /// fails, the state rolls back to uninit and the error is returned to
    /// the caller that ran it (a waiter then retries with its own `init`).
    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        loop {
            match self.state.compare_exchange(
                UNINIT,
                BUSY,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    match init() {
                        Ok(value) => {
                            // SAFETY: we hold BUSY, no other writer exists.
                            unsafe { *self.value.get() = Some(value) };
                            self.state.store(READY, Ordering::Release);
                            return Ok(self.get_ready());
                        }
                        Err(e) => {
                            self.state.store(UNINIT, Ordering::Release);
                            return Err(e);
                        }
                    }
                }
                Err(READY) => return Ok(self.get_ready()),
                Err(_) => {
                    // Another thread is initializing; wait for it to settle.
                    while self.state.load(Ordering::Acquire) == BUSY {
                        std::hint::spin_loop();
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    /// The value, if initialization has completed.
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            Some(self.get_ready())
        } else {
            None
        }
    }

    fn get_ready(&self) -> &T {
        // SAFETY: READY was observed with Acquire; the value was stored
        // before the Release and is never mutated again.
        unsafe { (*self.value.get()).as_ref().expect("READY implies value") }
    }
}

impl<T> Default for LazyInit<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn init_runs_once() {
        let lazy: LazyInit<u32> = LazyInit::new();
        let runs = AtomicUsize::new(0);
        let init = || -> Result<u32, ()> {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        };
        assert_eq!(*lazy.get_or_try_init(init).unwrap(), 7);
        assert_eq!(*lazy.get_or_try_init(|| Err(())).unwrap(), 7);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_init_can_be_retried() {
        let lazy: LazyInit<u32> = LazyInit::new();
        assert!(lazy.get_or_try_init(|| Err("boom")).is_err());
        assert!(lazy.get().is_none());
        assert_eq!(*lazy.get_or_try_init(|| Ok::<_, ()>(9)).unwrap(), 9);
    }

    #[test]
    fn concurrent_first_users_agree() {
        let lazy: Arc<LazyInit<usize>> = Arc::new(LazyInit::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lazy = lazy.clone();
                let runs = runs.clone();
                std::thread::spawn(move || {
                    *lazy
                        .get_or_try_init(|| {
                            Ok::<_, ()>(runs.fetch_add(1, Ordering::SeqCst) + 100)
                        })
                        .unwrap()
                })
            })
            .collect();

        let values: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| *v == values[0]));
    }
}
