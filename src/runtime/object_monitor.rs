//! Heavyweight lock records and inflation.
//!
//! A monitor takes over an object's header once the lock is contended or
//! needs a stable place for the identity hash. Monitors are allocated by
//! [`inflate`] and are never deflated or freed, so a monitor pointer read
//! from any header stays valid.

use std::{
    fmt,
    ptr::null_mut,
    sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering},
    time::Duration,
};

use crate::{
    oops::{mark_word::AtomicMarkWord, MarkWord, ObjectRef},
    utils::lock_free_stack::{LockFreeItem, LockFreeStack},
};

use super::{
    mutex::{LockRank, Monitor, SafepointCheck},
    thread::Thread,
};

/// Upper bound on how long a queued thread sleeps before polling the owner
/// field again. Covers the window in which an exiting thread saw a successor
/// that gave up before acquiring.
const PARK_INTERVAL: Duration = Duration::from_millis(1);

#[repr(C, align(8))]
pub struct ObjectMonitor {
    header: AtomicMarkWord,
    object: ObjectRef,
    owner: AtomicUsize,
    recursions: AtomicUsize,
    cxq: AtomicUsize,
    entry_list: AtomicUsize,
    succ: AtomicUsize,
    park: Monitor<()>,
    next_in_use: AtomicPtr<ObjectMonitor>,
}

impl LockFreeItem for ObjectMonitor {
    fn next_ptr(&self) -> &AtomicPtr<Self> {
        &self.next_in_use
    }
}

static IN_USE: LockFreeStack<ObjectMonitor> = LockFreeStack::new();

impl ObjectMonitor {
    fn new(object: ObjectRef, header: MarkWord, owner: usize) -> Self {
        Self {
            header: AtomicMarkWord::new(header),
            object,
            owner: AtomicUsize::new(owner),
            recursions: AtomicUsize::new(0),
            cxq: AtomicUsize::new(0),
            entry_list: AtomicUsize::new(0),
            succ: AtomicUsize::new(0),
            park: Monitor::new("ObjectMonitor", LockRank::Leaf, SafepointCheck::Always, ()),
            next_in_use: AtomicPtr::new(null_mut()),
        }
    }

    /// The header the object had before inflation.
    pub fn header(&self) -> MarkWord {
        self.header.load(Ordering::Acquire)
    }

    pub fn cas_set_header(&self, expected: MarkWord, new: MarkWord) -> MarkWord {
        self.header.compare_and_set(expected, new)
    }

    pub fn object(&self) -> ObjectRef {
        self.object
    }

    /// Raw thread id of the owner, 0 when unowned.
    #[inline(always)]
    pub fn owner(&self) -> usize {
        self.owner.load(Ordering::Acquire)
    }

    pub fn is_owned_by(&self, thread: &Thread) -> bool {
        self.owner() == thread.id().raw()
    }

    #[inline(always)]
    pub fn recursions(&self) -> usize {
        self.recursions.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn succ(&self) -> usize {
        self.succ.load(Ordering::Acquire)
    }

    /// Whether any thread is queued on this monitor.
    #[inline(always)]
    pub fn has_queued_threads(&self) -> bool {
        self.cxq.load(Ordering::Acquire) != 0 || self.entry_list.load(Ordering::Acquire) != 0
    }

    /// Single owner CAS. Returns `true` when `to` was installed.
    #[inline(always)]
    pub fn try_set_owner(&self, from: usize, to: usize) -> bool {
        self.owner
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    #[inline(always)]
    pub(crate) fn release_owner(&self) {
        self.owner.store(0, Ordering::Release)
    }

    #[inline]
    fn try_lock(&self, me: usize) -> bool {
        self.owner() == 0 && self.try_set_owner(0, me)
    }

    /// Blocking acquire. Must be called outside of a managed scope.
    pub fn enter(&self, thread: &Thread) {
        let me = thread.id().raw();
        if self.try_lock(me) {
            return;
        }
        if self.owner() == me {
            self.recursions.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.cxq.fetch_add(1, Ordering::SeqCst);
        let mut park = self.park.lock();
        self.entry_list.fetch_add(1, Ordering::SeqCst);
        self.cxq.fetch_sub(1, Ordering::SeqCst);
        log::trace!(target: "sync", "thread {} queued on monitor {:p}", me, self);

        loop {
            if self.try_lock(me) {
                break;
            }
            if self.succ() == me {
                self.succ.store(0, Ordering::Release);
            }
            fence(Ordering::SeqCst);
            if self.try_lock(me) {
                break;
            }
            park.wait_for(PARK_INTERVAL);
            self.succ.store(me, Ordering::Release);
        }

        if self.succ() == me {
            self.succ.store(0, Ordering::Release);
        }
        self.entry_list.fetch_sub(1, Ordering::SeqCst);
        drop(park);
        debug_assert_eq!(self.owner(), me);
        debug_assert_eq!(self.recursions(), 0);
    }

    /// Full release. The caller must own the monitor.
    pub fn exit(&self, thread: &Thread) {
        debug_assert!(self.is_owned_by(thread), "monitor exited by non-owner");
        if self.recursions() > 0 {
            self.recursions.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        let park = self.park.lock();
        self.release_owner();
        park.notify();
    }
}

impl fmt::Debug for ObjectMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("header", &self.header())
            .field("owner", &self.owner())
            .field("recursions", &self.recursions())
            .field("cxq", &self.cxq.load(Ordering::Relaxed))
            .field("entry_list", &self.entry_list.load(Ordering::Relaxed))
            .field("succ", &self.succ())
            .finish()
    }
}

/// Outcome of [`inflate`].
#[derive(Debug, Clone, Copy)]
pub enum InflateResult {
    Inflated(&'static ObjectMonitor),
    /// The header is biased; the bias must be revoked before inflating.
    Biased,
}

/// Number of monitors ever published.
pub fn in_use_count() -> usize {
    unsafe { IN_USE.length() }
}

fn publish(monitor: Box<ObjectMonitor>) -> &'static ObjectMonitor {
    let monitor: &'static ObjectMonitor = Box::leak(monitor);
    unsafe { IN_USE.push(monitor as *const ObjectMonitor as *mut ObjectMonitor) };
    monitor
}

/// Makes `obj` monitor-locked, converting a stack lock if needed, and returns
/// its monitor. Yields while another thread is inflating the same object.
pub fn inflate(obj: ObjectRef, thread: &Thread) -> InflateResult {
    loop {
        let mark = obj.mark();

        if mark.has_monitor() {
            return InflateResult::Inflated(unsafe { &*mark.monitor() });
        }

        if mark.is_being_inflated() {
            std::thread::yield_now();
            continue;
        }

        if mark.has_bias_pattern() {
            return InflateResult::Biased;
        }

        if mark.has_locker() {
            if obj.cas_set_mark(mark, MarkWord::zero()) != mark {
                continue;
            }
            let record = unsafe { &*mark.locker() };
            let displaced = record.displaced_header();
            debug_assert!(displaced.is_neutral(), "bad displaced header {:?}", displaced);
            let monitor = Box::new(ObjectMonitor::new(obj, displaced, record.owner().raw()));
            let monitor = publish(monitor);
            obj.set_mark(MarkWord::encode_monitor(monitor));
            log::debug!(
                target: "sync",
                "inflated stack lock of {:?} owned by {:?} (requested by {:?})",
                obj.as_ptr(),
                record.owner(),
                thread.id()
            );
            return InflateResult::Inflated(monitor);
        }

        debug_assert!(mark.is_neutral(), "cannot inflate {:?}", mark);
        let monitor = Box::new(ObjectMonitor::new(obj, mark, 0));
        let encoded = MarkWord::encode_monitor(&monitor);
        if obj.cas_set_mark(mark, encoded) != mark {
            continue;
        }
        let monitor = publish(monitor);
        log::debug!(
            target: "sync",
            "inflated neutral {:?} (requested by {:?})",
            obj.as_ptr(),
            thread.id()
        );
        return InflateResult::Inflated(monitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oops::{Klass, ObjectHeader};
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize},
        Barrier,
    };

    static PLAIN: Klass = Klass::new("Plain");

    fn monitor_of(obj: ObjectRef, thread: &Thread) -> &'static ObjectMonitor {
        match inflate(obj, thread) {
            InflateResult::Inflated(m) => m,
            InflateResult::Biased => panic!("unexpected bias"),
        }
    }

    #[test]
    fn inflating_neutral_keeps_header() {
        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let before = obj.mark();
        let before_count = in_use_count();
        let m = monitor_of(obj, t);
        assert!(obj.mark().has_monitor());
        assert_eq!(m.header(), before);
        assert_eq!(m.owner(), 0);
        assert!(in_use_count() > before_count);
        assert!(std::ptr::eq(monitor_of(obj, t), m));
        assert_eq!(m.object(), obj);
    }

    #[test]
    fn inflating_stack_lock_transfers_ownership() {
        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let hashed = MarkWord::prototype().copy_set_hash(99);
        obj.set_mark(hashed);

        let record = t.push_lock_record();
        record.set_obj(Some(obj));
        record.set_displaced_header(hashed);
        obj.set_mark(MarkWord::encode_lock_record(record));

        let other = Thread::new();
        let m = monitor_of(obj, other);
        assert_eq!(m.header(), hashed);
        assert!(m.is_owned_by(t));
        assert_eq!(m.recursions(), 0);
        t.pop_lock_record(record);
    }

    #[test]
    fn enter_is_reentrant() {
        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let m = monitor_of(obj, t);
        m.enter(t);
        m.enter(t);
        assert_eq!(m.recursions(), 1);
        m.exit(t);
        assert!(m.is_owned_by(t));
        m.exit(t);
        assert_eq!(m.owner(), 0);
    }

    #[test]
    fn contended_enter_is_mutually_exclusive() {
        let obj = ObjectHeader::allocate(&PLAIN);
        let m = monitor_of(obj, Thread::current());
        let inside = AtomicBool::new(false);
        let total = AtomicUsize::new(0);
        let barrier = Barrier::new(4);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let t = Thread::current();
                    barrier.wait();
                    for _ in 0..250 {
                        m.enter(t);
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        total.fetch_add(1, Ordering::Relaxed);
                        inside.store(false, Ordering::SeqCst);
                        m.exit(t);
                    }
                });
            }
        });
        assert_eq!(total.load(Ordering::Relaxed), 1000);
        assert_eq!(m.owner(), 0);
        assert!(!m.has_queued_threads());
    }
}
