//! Lightweight locking.
//!
//! An uncontended lock swaps the object header for a pointer to a lock record
//! that keeps the displaced header. The swap goes through the busy value `0`:
//! the header is first claimed with a CAS, then the displaced header is written
//! to the record, and only then is the record pointer published. A thread that
//! sees `0` therefore never sees a header without an owner.
//!
//! Once a monitor owns the header the same entry points run the monitor fast
//! paths, including the "1-0" exit that releases an uncontended monitor with a
//! single store and only falls back to the blocking exit when a queued thread
//! may have been missed.

use std::sync::atomic::{fence, Ordering};

use crate::oops::{MarkWord, ObjectRef};

use super::{lock_record::LockRecord, object_monitor::ObjectMonitor, thread::Thread};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StackLockResult {
    Acquired,
    Recursive,
    /// Acquired the object's monitor.
    Inflated,
    /// Contended; use the blocking path.
    Failed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StackUnlockResult {
    Released,
    RecursiveNoop,
    /// The caller still owns the monitor and must run its blocking exit.
    MustUseInflated,
}

#[inline]
fn enter_inflated(monitor: &ObjectMonitor, record: &LockRecord, thread: &Thread) -> StackLockResult {
    if monitor.try_set_owner(0, thread.id().raw()) {
        record.set_displaced_header(MarkWord::unused_mark());
        StackLockResult::Inflated
    } else {
        StackLockResult::Failed
    }
}

pub fn lock(obj: ObjectRef, record: &LockRecord, thread: &Thread) -> StackLockResult {
    debug_assert_eq!(record.owner(), thread.id());
    record.set_obj(Some(obj));

    let mark = obj.mark();
    if mark.has_monitor() {
        return enter_inflated(unsafe { &*mark.monitor() }, record, thread);
    }

    let candidate = mark.set_unlocked();
    let observed = obj.cas_set_mark(candidate, MarkWord::zero());
    if observed == candidate {
        record.set_displaced_header(candidate);
        obj.set_mark(MarkWord::encode_lock_record(record));
        return StackLockResult::Acquired;
    }

    if observed.has_locker() {
        let holder = unsafe { &*observed.locker() };
        if holder.owner() == thread.id() {
            record.set_displaced_header(MarkWord::zero());
            return StackLockResult::Recursive;
        }
    }

    if observed.has_monitor() {
        return enter_inflated(unsafe { &*observed.monitor() }, record, thread);
    }

    StackLockResult::Failed
}

pub fn unlock(obj: ObjectRef, record: &LockRecord, thread: &Thread) -> StackUnlockResult {
    let displaced = record.displaced_header();
    if displaced == MarkWord::zero() {
        return StackUnlockResult::RecursiveNoop;
    }

    let mut mark = obj.mark();
    if displaced != MarkWord::unused_mark() {
        let own = MarkWord::encode_lock_record(record);
        if mark == own {
            let observed = obj.cas_set_mark(own, displaced);
            if observed == own {
                return StackUnlockResult::Released;
            }
            mark = observed;
        }
    }

    if mark.is_being_inflated() {
        return StackUnlockResult::MustUseInflated;
    }

    debug_assert!(mark.has_monitor(), "unlocking {:?} which is not locked by us", mark);
    unlock_inflated(unsafe { &*mark.monitor() }, thread)
}

/// The "1-0" monitor exit.
pub fn unlock_inflated(monitor: &ObjectMonitor, thread: &Thread) -> StackUnlockResult {
    let me = thread.id().raw();
    debug_assert_eq!(monitor.owner(), me, "monitor released by non-owner");

    if monitor.recursions() != 0 {
        return StackUnlockResult::MustUseInflated;
    }

    if !monitor.has_queued_threads() {
        if monitor.try_set_owner(me, 0) {
            return StackUnlockResult::Released;
        }
        return StackUnlockResult::MustUseInflated;
    }

    monitor.release_owner();
    fence(Ordering::SeqCst);
    if monitor.succ() != 0 {
        return StackUnlockResult::Released;
    }
    if !monitor.try_set_owner(0, me) {
        // Somebody else already took the lock and becomes responsible for the
        // queued threads.
        return StackUnlockResult::Released;
    }
    StackUnlockResult::MustUseInflated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oops::{Klass, ObjectHeader};
    use crate::runtime::object_monitor::{inflate, InflateResult};

    static PLAIN: Klass = Klass::new("Plain");

    #[test]
    fn lock_unlock_restores_exact_mark() {
        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let before = MarkWord::prototype().copy_set_hash(0x77).set_age(5);
        obj.set_mark(before);

        let r = t.push_lock_record();
        assert_eq!(lock(obj, r, t), StackLockResult::Acquired);
        assert!(obj.mark().has_locker());
        assert_eq!(r.displaced_header(), before);
        assert_eq!(unlock(obj, r, t), StackUnlockResult::Released);
        assert_eq!(obj.mark(), before);
        t.pop_lock_record(r);
    }

    #[test]
    fn nested_locks_restore_exact_mark() {
        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let before = obj.mark();
        let records: Vec<_> = (0..5).map(|_| t.push_lock_record()).collect();

        assert_eq!(lock(obj, records[0], t), StackLockResult::Acquired);
        for r in &records[1..] {
            assert_eq!(lock(obj, r, t), StackLockResult::Recursive);
        }
        for r in records[1..].iter().rev() {
            assert_eq!(unlock(obj, r, t), StackUnlockResult::RecursiveNoop);
        }
        assert_eq!(unlock(obj, records[0], t), StackUnlockResult::Released);
        assert_eq!(obj.mark(), before);
        for r in records.iter().rev() {
            t.pop_lock_record(r);
        }
    }

    #[test]
    fn lock_held_by_other_thread_fails() {
        let a = Thread::new();
        let b = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let ra = a.push_lock_record();
        let rb = b.push_lock_record();
        assert_eq!(lock(obj, ra, a), StackLockResult::Acquired);
        assert_eq!(lock(obj, rb, b), StackLockResult::Failed);
        assert_eq!(unlock(obj, ra, a), StackUnlockResult::Released);
        assert_eq!(lock(obj, rb, b), StackLockResult::Acquired);
        assert_eq!(unlock(obj, rb, b), StackUnlockResult::Released);
        b.pop_lock_record(rb);
        a.pop_lock_record(ra);
    }

    #[test]
    fn busy_header_fails() {
        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        obj.set_mark(MarkWord::zero());
        let r = t.push_lock_record();
        assert_eq!(lock(obj, r, t), StackLockResult::Failed);
        t.pop_lock_record(r);
    }

    #[test]
    fn unowned_monitor_is_entered_directly() {
        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let monitor = match inflate(obj, t) {
            InflateResult::Inflated(m) => m,
            InflateResult::Biased => unreachable!(),
        };
        let r = t.push_lock_record();
        assert_eq!(lock(obj, r, t), StackLockResult::Inflated);
        assert_eq!(r.displaced_header(), MarkWord::unused_mark());
        assert!(monitor.is_owned_by(t));
        assert_eq!(unlock(obj, r, t), StackUnlockResult::Released);
        assert_eq!(monitor.owner(), 0);
        t.pop_lock_record(r);
    }

    #[test]
    fn unlock_after_concurrent_inflation_uses_monitor() {
        let t = Thread::new();
        let other = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let before = obj.mark();
        let r = t.push_lock_record();
        assert_eq!(lock(obj, r, t), StackLockResult::Acquired);

        let monitor = match inflate(obj, other) {
            InflateResult::Inflated(m) => m,
            InflateResult::Biased => unreachable!(),
        };
        assert!(monitor.is_owned_by(t));
        assert_eq!(monitor.header(), before);

        assert_eq!(unlock(obj, r, t), StackUnlockResult::Released);
        assert_eq!(monitor.owner(), 0);
        t.pop_lock_record(r);
    }

    #[test]
    fn busy_header_during_unlock_defers_to_monitor() {
        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let r = t.push_lock_record();
        assert_eq!(lock(obj, r, t), StackLockResult::Acquired);
        let own = obj.mark();
        obj.set_mark(MarkWord::zero());
        assert_eq!(unlock(obj, r, t), StackUnlockResult::MustUseInflated);
        obj.set_mark(own);
        assert_eq!(unlock(obj, r, t), StackUnlockResult::Released);
        t.pop_lock_record(r);
    }

    #[test]
    fn one_zero_exit_without_waiters() {
        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let monitor = match inflate(obj, t) {
            InflateResult::Inflated(m) => m,
            InflateResult::Biased => unreachable!(),
        };
        monitor.enter(t);
        monitor.enter(t);
        assert_eq!(unlock_inflated(monitor, t), StackUnlockResult::MustUseInflated);
        monitor.exit(t);
        assert_eq!(unlock_inflated(monitor, t), StackUnlockResult::Released);
        assert_eq!(monitor.owner(), 0);
    }

    #[test]
    fn one_zero_exit_with_waiter() {
        use std::time::Duration;

        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let monitor = match inflate(obj, t) {
            InflateResult::Inflated(m) => m,
            InflateResult::Biased => unreachable!(),
        };
        monitor.enter(t);

        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let w = Thread::current();
                monitor.enter(w);
                let owned = monitor.is_owned_by(w);
                monitor.exit(w);
                owned
            });
            while !monitor.has_queued_threads() {
                std::thread::sleep(Duration::from_millis(1));
            }

            match unlock_inflated(monitor, t) {
                StackUnlockResult::Released => {}
                StackUnlockResult::MustUseInflated => monitor.exit(t),
                StackUnlockResult::RecursiveNoop => unreachable!(),
            }
            assert!(waiter.join().unwrap());
        });
        assert_eq!(monitor.owner(), 0);
    }
}
