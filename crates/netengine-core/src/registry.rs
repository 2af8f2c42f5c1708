//! Per-thread engine context slot.
//!
//! Each OS thread has one slot holding zero or one [`EngineContext`]. The
//! process-wide [`ThreadRegistry`] wrapping those slots is created exactly
//! once, by whichever thread first calls `EngineContext::init`, and only
//! carries counters. Slots are never touched from another thread, so they
//! need no locking.
//!
//! Slot access uses `LocalKey::try_with`. During thread teardown the slot
//! may already be gone, and lookups then report an empty slot instead of
//! panicking.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::debug;

use crate::engine::EngineContext;

thread_local! {
    static SLOT: RefCell<Option<Rc<EngineContext>>> = const { RefCell::new(None) };
}

static REGISTRY: OnceLock<ThreadRegistry> = OnceLock::new();
static REGISTRY_INITS: AtomicUsize = AtomicUsize::new(0);

/// Errors from slot registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("thread already holds a registered engine context")]
    AlreadyRegistered,

    #[error("thread-local storage is being torn down")]
    ThreadExiting,
}

/// Process-wide view over the per-thread slots.
#[derive(Debug)]
pub struct ThreadRegistry {
    live: AtomicUsize,
    registrations: AtomicU64,
}

impl ThreadRegistry {
    /// The registry, creating it on first use.
    pub fn global() -> &'static ThreadRegistry {
        REGISTRY.get_or_init(|| {
            REGISTRY_INITS.fetch_add(1, Ordering::SeqCst);
            debug!("thread registry initialized");
            ThreadRegistry {
                live: AtomicUsize::new(0),
                registrations: AtomicU64::new(0),
            }
        })
    }

    /// The registry, if any thread has created it.
    pub fn get() -> Option<&'static ThreadRegistry> {
        REGISTRY.get()
    }

    /// How many times the registry has been created. Always 0 or 1.
    pub fn initializations() -> usize {
        REGISTRY_INITS.load(Ordering::SeqCst)
    }

    /// Place `ctx` in the calling thread's slot.
    pub fn register(&self, ctx: Rc<EngineContext>) -> Result<(), RegistryError> {
        SLOT.try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(RegistryError::AlreadyRegistered);
            }
            *slot = Some(ctx);
            Ok(())
        })
        .map_err(|_| RegistryError::ThreadExiting)??;

        self.live.fetch_add(1, Ordering::SeqCst);
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// The calling thread's context, if any.
    pub fn lookup(&self) -> Option<Rc<EngineContext>> {
        SLOT.try_with(|slot| slot.borrow().clone()).ok().flatten()
    }

    /// Whether the calling thread's slot holds a context.
    pub fn is_occupied(&self) -> bool {
        SLOT.try_with(|slot| slot.borrow().is_some())
            .unwrap_or(false)
    }

    /// Empty the calling thread's slot, returning what it held.
    pub fn clear(&self) -> Option<Rc<EngineContext>> {
        SLOT.try_with(|slot| slot.borrow_mut().take()).ok().flatten()
    }

    /// Registered contexts, across all threads, not yet destroyed.
    pub fn live_contexts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Successful registrations since process start.
    pub fn total_registrations(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    pub(crate) fn context_released(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_is_created_once() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| ThreadRegistry::global() as *const _ as usize))
            .collect();
        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(ThreadRegistry::initializations(), 1);
        assert!(ThreadRegistry::get().is_some());
    }

    #[test]
    fn test_empty_slot() {
        let registry = ThreadRegistry::global();
        assert!(!registry.is_occupied());
        assert!(registry.lookup().is_none());
        assert!(registry.clear().is_none());
    }
}
