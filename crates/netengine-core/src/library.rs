//! Reference-counted process-wide library state.
//!
//! TLS and DNS both carry state that lives above any single engine context:
//! it is set up by the first context on any thread and torn down by the last.
//! [`SharedLibrary`] serializes concurrent first use behind a mutex and keeps
//! a user count so an early release on one thread cannot pull the state out
//! from under a context still running on another.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

#[derive(Debug)]
struct LibraryState<T> {
    users: usize,
    value: Option<T>,
}

/// Process-wide state shared by every engine context in the process.
#[derive(Debug)]
pub struct SharedLibrary<T> {
    name: &'static str,
    state: Mutex<LibraryState<T>>,
}

impl<T: Clone> SharedLibrary<T> {
    /// Create an uninitialized library slot. Usable in a `static`.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(LibraryState {
                users: 0,
                value: None,
            }),
        }
    }

    /// Take a reference on the library, running `init` if this is the
    /// first user in the process.
    ///
    /// A failing `init` leaves the library uninitialized and the user count
    /// unchanged.
    pub fn acquire<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let mut state = self.lock();
        if let Some(value) = &state.value {
            let value = value.clone();
            state.users += 1;
            return Ok(value);
        }

        let value = init()?;
        debug!(library = self.name, "process-wide library state initialized");
        state.value = Some(value.clone());
        state.users = 1;
        Ok(value)
    }

    /// Drop one reference. Returns the library value when this was the last
    /// user, so the caller can run the real cleanup.
    pub fn release(&self) -> Option<T> {
        let mut state = self.lock();
        if state.users == 0 {
            warn!(library = self.name, "release without a matching acquire");
            return None;
        }
        state.users -= 1;
        if state.users > 0 {
            return None;
        }
        debug!(library = self.name, "process-wide library state released");
        state.value.take()
    }

    /// The current library value, if initialized.
    pub fn current(&self) -> Option<T> {
        self.lock().value.clone()
    }

    /// Number of outstanding references.
    pub fn users(&self) -> usize {
        self.lock().users
    }

    /// Library name used in log output.
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, LibraryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_first_acquire_runs_init_once() {
        let lib: SharedLibrary<u32> = SharedLibrary::new("test");
        let inits = AtomicUsize::new(0);

        for _ in 0..3 {
            let v = lib
                .acquire(|| {
                    inits.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(7)
                })
                .unwrap();
            assert_eq!(v, 7);
        }

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(lib.users(), 3);
    }

    #[test]
    fn test_last_release_returns_value() {
        let lib: SharedLibrary<&'static str> = SharedLibrary::new("test");
        lib.acquire(|| Ok::<_, ()>("state")).unwrap();
        lib.acquire(|| Ok::<_, ()>("unused")).unwrap();

        assert_eq!(lib.release(), None);
        assert_eq!(lib.current(), Some("state"));
        assert_eq!(lib.release(), Some("state"));
        assert_eq!(lib.current(), None);
        assert_eq!(lib.users(), 0);
    }

    #[test]
    fn test_failed_init_leaves_library_empty() {
        let lib: SharedLibrary<u8> = SharedLibrary::new("test");
        let result = lib.acquire(|| Err::<u8, _>("boom"));
        assert_eq!(result, Err("boom"));
        assert_eq!(lib.users(), 0);
        assert!(lib.current().is_none());
    }

    #[test]
    fn test_unbalanced_release_is_ignored() {
        let lib: SharedLibrary<u8> = SharedLibrary::new("test");
        assert_eq!(lib.release(), None);
        assert_eq!(lib.users(), 0);
    }

    #[test]
    fn test_reinitializes_after_full_release() {
        let lib: SharedLibrary<u8> = SharedLibrary::new("test");
        lib.acquire(|| Ok::<_, ()>(1)).unwrap();
        lib.release();
        let v = lib.acquire(|| Ok::<_, ()>(2)).unwrap();
        assert_eq!(v, 2);
    }

    #[test]
    fn test_concurrent_first_use() {
        let lib: Arc<SharedLibrary<u64>> = Arc::new(SharedLibrary::new("test"));
        let inits = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lib = Arc::clone(&lib);
                let inits = Arc::clone(&inits);
                std::thread::spawn(move || {
                    lib.acquire(|| {
                        inits.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ()>(42)
                    })
                    .unwrap()
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(lib.users(), 8);
    }
}
