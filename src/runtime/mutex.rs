//! Ranked blocking locks for runtime-internal synchronization.
//!
//! Every lock declares a [`LockRank`]. In debug builds each thread keeps the
//! list of ranked locks it holds and a lock may only be acquired when its rank
//! is strictly lower than the rank of every lock already held. This turns a
//! potential lock-order deadlock into a deterministic panic on the first
//! offending acquisition.
//!
//! Locks also declare whether they may be acquired while the thread is inside a
//! [`ManagedScope`](crate::runtime::safepoint::ManagedScope). A lock that may
//! block for a long time must not be taken there, because a pending safepoint
//! would wait on the blocked thread.

use std::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::safepoint::in_managed_scope;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
#[repr(u16)]
pub enum LockRank {
    Event = 0,
    Access = 1,
    Tty = 3,
    Special = 4,
    SuspendResume = 5,
    OopStorage = 7,
    Leaf = 9,
    Safepoint = 19,
    Barrier = 20,
    Nonleaf = 21,
    MaxNonleaf = 921,
    Native = 922,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SafepointCheck {
    /// Always acquired with [`Monitor::lock_without_safepoint_check`].
    Never,
    /// Either acquisition flavour is allowed.
    Sometimes,
    /// Always acquired with [`Monitor::lock`].
    Always,
}

fn current_token() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    // No destructor, so the token stays readable while thread locals are torn down.
    thread_local! {
        static TOKEN: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
    }
    TOKEN.with(|t| {
        if t.get() == 0 {
            t.set(NEXT.fetch_add(1, Ordering::Relaxed));
        }
        t.get()
    })
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD: std::cell::RefCell<Vec<(LockRank, &'static str, usize)>> =
        std::cell::RefCell::new(Vec::new());
}

pub struct Monitor<T> {
    name: &'static str,
    rank: LockRank,
    safepoint_check: SafepointCheck,
    owner: AtomicUsize,
    mutex: Mutex<T>,
    cv: Condvar,
}

impl<T> Monitor<T> {
    pub const fn new(
        name: &'static str,
        rank: LockRank,
        safepoint_check: SafepointCheck,
        value: T,
    ) -> Self {
        Self {
            name,
            rank,
            safepoint_check,
            owner: AtomicUsize::new(0),
            mutex: Mutex::new(value),
            cv: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    #[cfg(debug_assertions)]
    fn check_rank(&self) {
        if self.rank == LockRank::Native {
            return;
        }
        let _ = HELD.try_with(|held| {
            for &(rank, name, _) in held.borrow().iter() {
                if self.rank >= rank {
                    panic!(
                        "acquiring lock {}/{:?} out of order with lock {}/{:?} -- possible deadlock",
                        self.name, self.rank, name, rank
                    );
                }
            }
        });
    }

    #[cfg(debug_assertions)]
    fn add_to_held(&self) {
        let _ = HELD.try_with(|held| held.borrow_mut().push((self.rank, self.name, self.addr())));
    }

    #[cfg(debug_assertions)]
    fn remove_from_held(&self) {
        let addr = self.addr();
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(ix) = held.iter().rposition(|&(_, _, a)| a == addr) {
                held.remove(ix);
            }
        });
    }

    fn pre_lock(&self, with_safepoint_check: bool) {
        debug_assert!(
            !self.owned_by_self(),
            "lock {} is not reentrant",
            self.name
        );
        if with_safepoint_check {
            debug_assert!(
                self.safepoint_check != SafepointCheck::Never,
                "lock {} must never be acquired with a safepoint check",
                self.name
            );
            debug_assert!(
                !in_managed_scope(),
                "lock {} may block and cannot be acquired inside a managed scope",
                self.name
            );
        } else {
            debug_assert!(
                self.safepoint_check != SafepointCheck::Always,
                "lock {} must always be acquired with a safepoint check",
                self.name
            );
        }
        #[cfg(debug_assertions)]
        self.check_rank();
    }

    fn locked<'a>(&'a self, guard: MutexGuard<'a, T>) -> MonitorGuard<'a, T> {
        self.owner.store(current_token(), Ordering::Relaxed);
        #[cfg(debug_assertions)]
        self.add_to_held();
        MonitorGuard {
            monitor: self,
            guard,
        }
    }

    /// Acquires the lock, blocking if needed. Must not be called inside a
    /// managed scope.
    pub fn lock(&self) -> MonitorGuard<'_, T> {
        self.pre_lock(true);
        self.locked(self.mutex.lock())
    }

    /// Acquires the lock for a short, non-blocking critical section.
    pub fn lock_without_safepoint_check(&self) -> MonitorGuard<'_, T> {
        self.pre_lock(false);
        self.locked(self.mutex.lock())
    }

    /// Never blocks, so it is exempt from the rank check.
    pub fn try_lock(&self) -> Option<MonitorGuard<'_, T>> {
        self.mutex.try_lock().map(|guard| self.locked(guard))
    }

    pub fn owned_by_self(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_token()
    }

    pub fn notify(&self) -> bool {
        self.cv.notify_one()
    }

    pub fn notify_all(&self) -> usize {
        self.cv.notify_all()
    }
}

pub struct MonitorGuard<'a, T> {
    monitor: &'a Monitor<T>,
    guard: MutexGuard<'a, T>,
}

impl<'a, T> MonitorGuard<'a, T> {
    pub fn wait(&mut self) {
        self.monitor.owner.store(0, Ordering::Relaxed);
        self.monitor.cv.wait(&mut self.guard);
        self.monitor.owner.store(current_token(), Ordering::Relaxed);
    }

    /// Returns `true` when the wait timed out.
    pub fn wait_for(&mut self, timeout: Duration) -> bool {
        self.monitor.owner.store(0, Ordering::Relaxed);
        let result = self.monitor.cv.wait_for(&mut self.guard, timeout);
        self.monitor.owner.store(current_token(), Ordering::Relaxed);
        result.timed_out()
    }

    pub fn notify(&self) -> bool {
        self.monitor.notify()
    }

    pub fn notify_all(&self) -> usize {
        self.monitor.notify_all()
    }
}

impl<'a, T> Deref for MonitorGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for MonitorGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for MonitorGuard<'a, T> {
    fn drop(&mut self) {
        self.monitor.owner.store(0, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        self.monitor.remove_from_held();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_and_owned_by_self() {
        let m = Monitor::new("test", LockRank::Leaf, SafepointCheck::Always, 0usize);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.owned_by_self());
        }
        assert!(!m.owned_by_self());
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn try_lock_fails_when_held_elsewhere() {
        let m = Arc::new(Monitor::new("held", LockRank::Leaf, SafepointCheck::Never, ()));
        let g = m.lock_without_safepoint_check();
        let other = Arc::clone(&m);
        let acquired = std::thread::spawn(move || other.try_lock().is_some())
            .join()
            .unwrap();
        assert!(!acquired);
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn decreasing_ranks_nest() {
        let outer = Monitor::new("outer", LockRank::Nonleaf, SafepointCheck::Always, ());
        let inner = Monitor::new("inner", LockRank::Leaf, SafepointCheck::Always, ());
        let innermost = Monitor::new("innermost", LockRank::Tty, SafepointCheck::Never, ());
        let _a = outer.lock();
        let _b = inner.lock();
        let _c = innermost.lock_without_safepoint_check();
        assert!(inner.owned_by_self());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "out of order")]
    fn increasing_rank_panics() {
        let low = Monitor::new("low", LockRank::Leaf, SafepointCheck::Always, ());
        let high = Monitor::new("high", LockRank::Nonleaf, SafepointCheck::Always, ());
        let _a = low.lock();
        let _b = high.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "out of order")]
    fn equal_rank_panics() {
        let a = Monitor::new("a", LockRank::Leaf, SafepointCheck::Always, ());
        let b = Monitor::new("b", LockRank::Leaf, SafepointCheck::Always, ());
        let _a = a.lock();
        let _b = b.lock();
    }

    #[test]
    fn native_rank_is_exempt() {
        let low = Monitor::new("low", LockRank::Event, SafepointCheck::Always, ());
        let native = Monitor::new("native", LockRank::Native, SafepointCheck::Always, ());
        let _a = low.lock();
        let _b = native.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "never be acquired with a safepoint check")]
    fn safepoint_check_misuse_panics() {
        let m = Monitor::new("nocheck", LockRank::Leaf, SafepointCheck::Never, ());
        let _g = m.lock();
    }

    #[test]
    fn wait_for_times_out_and_notify_wakes() {
        let m = Arc::new(Monitor::new("cv", LockRank::Leaf, SafepointCheck::Always, false));
        {
            let mut g = m.lock();
            assert!(g.wait_for(Duration::from_millis(5)));
            assert!(m.owned_by_self());
        }

        let other = Arc::clone(&m);
        let handle = std::thread::spawn(move || {
            let mut g = other.lock();
            while !*g {
                g.wait();
            }
        });
        {
            let mut g = m.lock();
            *g = true;
            g.notify_all();
        }
        handle.join().unwrap();
    }
}
