//! Cooperative global stop used for bias revocation.
//!
//! Mutators run the lock fast paths inside a [`ManagedScope`], a shared
//! critical section over a global reader-writer lock. [`synchronize`] takes
//! the same lock exclusively, so while its closure runs no other thread is
//! inside lock code and mark words may be rewritten with plain stores.
//! Threads must leave their scope before they block.

use std::{
    cell::Cell,
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use parking_lot::{lock_api::RawRwLock as _, RawRwLock};

static SAFEPOINT_LOCK: RawRwLock = RawRwLock::INIT;
static AT_SAFEPOINT: AtomicBool = AtomicBool::new(false);

thread_local! {
    static SCOPE_DEPTH: Cell<usize> = const { Cell::new(0) };
    static IS_SYNCHRONIZING: Cell<bool> = const { Cell::new(false) };
}

/// Proof that all other threads are stopped outside of lock code.
pub struct AtSafepoint {
    _private: (),
}

/// Whether some thread is currently inside [`synchronize`].
pub fn is_at_safepoint() -> bool {
    AT_SAFEPOINT.load(Ordering::Acquire)
}

pub fn in_managed_scope() -> bool {
    SCOPE_DEPTH.with(|depth| depth.get() != 0)
}

/// Shared critical section in which mutators may run lock fast paths.
/// Scopes nest.
pub struct ManagedScope {
    marker: PhantomData<*mut u8>,
}

impl ManagedScope {
    pub fn enter() -> Self {
        SCOPE_DEPTH.with(|depth| {
            if depth.get() == 0 {
                debug_assert!(
                    !IS_SYNCHRONIZING.with(|s| s.get()),
                    "managed scope entered by the thread running a safepoint"
                );
                SAFEPOINT_LOCK.lock_shared();
            }
            depth.set(depth.get() + 1);
        });
        Self {
            marker: PhantomData,
        }
    }
}

impl Drop for ManagedScope {
    fn drop(&mut self) {
        SCOPE_DEPTH.with(|depth| {
            let d = depth.get() - 1;
            depth.set(d);
            if d == 0 {
                unsafe { SAFEPOINT_LOCK.unlock_shared() };
            }
        });
    }
}

struct SafepointGuard {
    start: Instant,
}

impl Drop for SafepointGuard {
    fn drop(&mut self) {
        AT_SAFEPOINT.store(false, Ordering::Release);
        IS_SYNCHRONIZING.with(|s| s.set(false));
        unsafe { SAFEPOINT_LOCK.unlock_exclusive() };
        log::debug!(target: "safepoint", "safepoint finished in {:?}", self.start.elapsed());
    }
}

/// Stops every thread outside of its managed scope and runs `f`.
///
/// Panics when called from inside a managed scope or from another
/// `synchronize` closure.
pub fn synchronize<R>(f: impl FnOnce(&AtSafepoint) -> R) -> R {
    assert!(
        !in_managed_scope(),
        "safepoint requested from inside a managed scope"
    );
    assert!(
        !IS_SYNCHRONIZING.with(|s| s.get()),
        "nested safepoint request"
    );

    let start = Instant::now();
    SAFEPOINT_LOCK.lock_exclusive();
    IS_SYNCHRONIZING.with(|s| s.set(true));
    AT_SAFEPOINT.store(true, Ordering::Release);
    let _guard = SafepointGuard { start };
    log::trace!(target: "safepoint", "all threads stopped after {:?}", start.elapsed());

    let at = AtSafepoint { _private: () };
    f(&at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Barrier,
    };

    #[test]
    fn scopes_nest() {
        assert!(!in_managed_scope());
        {
            let _a = ManagedScope::enter();
            let _b = ManagedScope::enter();
            assert!(in_managed_scope());
        }
        assert!(!in_managed_scope());
        assert_eq!(synchronize(|_| 7), 7);
    }

    #[test]
    #[should_panic(expected = "inside a managed scope")]
    fn synchronize_inside_scope_panics() {
        let _scope = ManagedScope::enter();
        synchronize(|_| ());
    }

    #[test]
    fn synchronize_excludes_managed_scopes() {
        let inside = AtomicUsize::new(0);
        let barrier = Barrier::new(5);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..200 {
                        let _scope = ManagedScope::enter();
                        inside.fetch_add(1, Ordering::SeqCst);
                        std::hint::spin_loop();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
            barrier.wait();
            for _ in 0..20 {
                synchronize(|_| {
                    assert!(is_at_safepoint());
                    assert_eq!(inside.load(Ordering::SeqCst), 0);
                });
            }
        });
    }
}
