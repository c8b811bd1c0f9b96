//! Entry points used by interpreters, compiled code and runtime services.
//!
//! [`ObjectSynchronizer::lock_fast`] and [`ObjectSynchronizer::unlock_fast`]
//! only run the non-blocking protocols and report what is left to do.
//! [`ObjectSynchronizer::enter`] adds the blocking slow paths on top and
//! returns a guard that unlocks on drop.

use once_cell::sync::Lazy;

use crate::{
    config::SyncConfig,
    oops::{MarkWord, ObjectRef},
};

use super::{
    biased_locking::{self, BiasResult, RevocationResult},
    counters::{bump, BiasedLockingCounters},
    lock_record::LockRecord,
    object_monitor::{inflate, InflateResult, ObjectMonitor},
    safepoint::{self, ManagedScope},
    stack_lock::{self, StackLockResult, StackUnlockResult},
    thread::Thread,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockResult {
    Acquired,
    Recursive,
    Inflated,
    Failed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnlockResult {
    Released,
    RecursiveNoop,
    MustUseInflated,
}

pub struct ObjectSynchronizer {
    config: SyncConfig,
    counters: BiasedLockingCounters,
}

impl ObjectSynchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            counters: BiasedLockingCounters::new(),
        }
    }

    /// Synchronizer configured from the environment.
    pub fn global() -> &'static ObjectSynchronizer {
        static GLOBAL: Lazy<ObjectSynchronizer> =
            Lazy::new(|| ObjectSynchronizer::new(SyncConfig::global().clone()));
        &GLOBAL
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn counters(&self) -> &BiasedLockingCounters {
        &self.counters
    }

    fn statistics(&self) -> Option<&BiasedLockingCounters> {
        if self.config.biased_locking_statistics {
            Some(&self.counters)
        } else {
            None
        }
    }

    /// Non-blocking lock attempt. Must run inside a managed scope when other
    /// threads may request safepoints.
    pub fn lock_fast(&self, obj: ObjectRef, record: &LockRecord, thread: &Thread) -> LockResult {
        let stats = self.statistics();
        if let Some(c) = stats {
            bump(&c.total_entry_count);
        }

        if self.config.use_biased_locking {
            match biased_locking::enter(obj, record, thread, stats) {
                BiasResult::Acquired(_) => return LockResult::Acquired,
                BiasResult::RevokeAndRetry => return LockResult::Failed,
                BiasResult::NotBiased => {}
            }
        }

        match stack_lock::lock(obj, record, thread) {
            StackLockResult::Acquired => {
                if let Some(c) = stats {
                    bump(&c.fast_path_entry_count);
                }
                LockResult::Acquired
            }
            StackLockResult::Recursive => LockResult::Recursive,
            StackLockResult::Inflated => LockResult::Inflated,
            StackLockResult::Failed => LockResult::Failed,
        }
    }

    /// Non-blocking unlock. On `MustUseInflated` the caller still owns the
    /// object's monitor.
    pub fn unlock_fast(&self, obj: ObjectRef, record: &LockRecord, thread: &Thread) -> UnlockResult {
        if self.config.use_biased_locking && biased_locking::exit(obj) {
            return UnlockResult::Released;
        }

        match stack_lock::unlock(obj, record, thread) {
            StackUnlockResult::Released => UnlockResult::Released,
            StackUnlockResult::RecursiveNoop => UnlockResult::RecursiveNoop,
            StackUnlockResult::MustUseInflated => UnlockResult::MustUseInflated,
        }
    }

    /// Locks `obj`, blocking while another thread holds it.
    pub fn enter<'a>(&'a self, obj: ObjectRef, thread: &'a Thread) -> ObjectLocker<'a> {
        let record = thread.push_lock_record();
        loop {
            let result = {
                let _scope = ManagedScope::enter();
                let result = self.lock_fast(obj, record, thread);
                if result == LockResult::Failed {
                    record.set_obj(None);
                }
                result
            };
            if result != LockResult::Failed || self.enter_slow(obj, record, thread) {
                break;
            }
        }
        ObjectLocker {
            sync: self,
            obj,
            record,
            thread,
        }
    }

    /// Returns `true` once the lock is held, `false` when the fast path should
    /// be retried.
    #[cold]
    fn enter_slow(&self, obj: ObjectRef, record: &LockRecord, thread: &Thread) -> bool {
        if let Some(c) = self.statistics() {
            bump(&c.slow_path_entry_count);
        }

        let inflated = {
            let _scope = ManagedScope::enter();
            inflate(obj, thread)
        };
        match inflated {
            InflateResult::Biased => {
                self.revoke_bias(obj);
                false
            }
            InflateResult::Inflated(monitor) => {
                record.set_obj(Some(obj));
                record.set_displaced_header(MarkWord::unused_mark());
                monitor.enter(thread);
                true
            }
        }
    }

    #[cold]
    fn exit_slow(&self, obj: ObjectRef, thread: &Thread) {
        let monitor = wait_for_monitor(obj);
        monitor.exit(thread);
    }

    /// Revokes the bias of `obj` at a safepoint.
    pub fn revoke_bias(&self, obj: ObjectRef) -> RevocationResult {
        let result = safepoint::synchronize(|at| biased_locking::revoke_at_safepoint(obj, at));
        log::debug!(target: "sync", "revoke bias of {:?}: {:?}", obj.as_ptr(), result);
        result
    }

    /// Identity hash of `obj`, installing one if it has none yet. Never 0.
    pub fn identity_hash(&self, obj: ObjectRef, thread: &Thread) -> usize {
        loop {
            let scope = ManagedScope::enter();
            let mark = obj.mark();

            if mark.has_bias_pattern() {
                drop(scope);
                self.revoke_bias(obj);
                continue;
            }

            if mark.is_neutral() {
                if !mark.has_no_hash() {
                    return mark.hash();
                }
                let hash = thread.next_hash();
                if obj.cas_set_mark(mark, mark.copy_set_hash(hash)) == mark {
                    return hash;
                }
                continue;
            }

            if mark.is_being_inflated() {
                drop(scope);
                std::thread::yield_now();
                continue;
            }

            if mark.has_locker() {
                let record = unsafe { &*mark.locker() };
                if record.owner() == thread.id() {
                    let displaced = record.displaced_header();
                    if !displaced.has_no_hash() {
                        return displaced.hash();
                    }
                }
            }

            let monitor = match inflate(obj, thread) {
                InflateResult::Inflated(monitor) => monitor,
                InflateResult::Biased => continue,
            };
            let header = monitor.header();
            if !header.has_no_hash() {
                return header.hash();
            }
            let hash = thread.next_hash();
            let observed = monitor.cas_set_header(header, header.copy_set_hash(hash));
            if observed == header {
                return hash;
            }
            if !observed.has_no_hash() {
                return observed.hash();
            }
        }
    }
}

fn wait_for_monitor(obj: ObjectRef) -> &'static ObjectMonitor {
    loop {
        let mark = obj.mark();
        if mark.has_monitor() {
            return unsafe { &*mark.monitor() };
        }
        debug_assert!(mark.is_being_inflated(), "expected a monitor, found {:?}", mark);
        std::thread::yield_now();
    }
}

/// Holds the lock of an object until dropped.
pub struct ObjectLocker<'a> {
    sync: &'a ObjectSynchronizer,
    obj: ObjectRef,
    record: &'static LockRecord,
    thread: &'a Thread,
}

impl<'a> ObjectLocker<'a> {
    pub fn obj(&self) -> ObjectRef {
        self.obj
    }

    pub fn record(&self) -> &LockRecord {
        self.record
    }
}

impl<'a> Drop for ObjectLocker<'a> {
    fn drop(&mut self) {
        let result = {
            let _scope = ManagedScope::enter();
            let result = self.sync.unlock_fast(self.obj, self.record, self.thread);
            self.record.set_obj(None);
            result
        };
        if result == UnlockResult::MustUseInflated {
            self.sync.exit_slow(self.obj, self.thread);
        }
        self.thread.pop_lock_record(self.record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oops::{Klass, ObjectHeader};
    use std::sync::atomic::Ordering;

    static PLAIN: Klass = Klass::new("Plain");

    fn plain_sync() -> ObjectSynchronizer {
        ObjectSynchronizer::new(SyncConfig {
            use_biased_locking: false,
            biased_locking_statistics: true,
            ..SyncConfig::default()
        })
    }

    #[test]
    fn guard_locks_and_unlocks() {
        let sync = plain_sync();
        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let before = obj.mark();
        {
            let locker = sync.enter(obj, t);
            assert_eq!(locker.obj(), obj);
            assert!(obj.mark().has_locker());
            let _inner = sync.enter(obj, t);
            assert_eq!(locker.record().displaced_header(), before);
        }
        assert_eq!(obj.mark(), before);
        assert!(t.lock_records().is_empty());
        assert_eq!(sync.counters().fast_path_entry_count.load(Ordering::Relaxed), 1);
        assert_eq!(sync.counters().total_entry_count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn biased_exit_is_noop() {
        let k: &'static Klass = Box::leak(Box::new(Klass::new_biasable("Noop")));
        let sync = ObjectSynchronizer::new(SyncConfig::default());
        let t = Thread::new();
        let obj = ObjectHeader::allocate(k);
        let r = t.push_lock_record();
        assert_eq!(sync.lock_fast(obj, r, t), LockResult::Acquired);
        let biased = obj.mark();
        assert_eq!(sync.unlock_fast(obj, r, t), UnlockResult::Released);
        assert_eq!(obj.mark(), biased);
        t.pop_lock_record(r);
    }

    #[test]
    fn hash_of_neutral_object_is_installed_once() {
        let sync = plain_sync();
        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let h = sync.identity_hash(obj, t);
        assert_ne!(h, 0);
        assert_eq!(obj.mark().hash(), h);
        assert_eq!(sync.identity_hash(obj, Thread::new()), h);
    }

    #[test]
    fn hash_while_stack_locked_inflates() {
        let sync = plain_sync();
        let t = Thread::new();
        let obj = ObjectHeader::allocate(&PLAIN);
        let h = {
            let _locker = sync.enter(obj, t);
            let h = sync.identity_hash(obj, t);
            assert!(obj.mark().has_monitor());
            h
        };
        assert!(obj.mark().has_monitor());
        assert_eq!(sync.identity_hash(obj, t), h);
    }

    #[test]
    fn hash_of_biased_object_revokes() {
        let k: &'static Klass = Box::leak(Box::new(Klass::new_biasable("Hashed")));
        let sync = ObjectSynchronizer::new(SyncConfig::default());
        let t = Thread::new();
        let obj = ObjectHeader::allocate(k);
        drop(sync.enter(obj, t));
        assert!(obj.mark().has_bias_pattern());
        let h = sync.identity_hash(obj, t);
        assert!(obj.mark().is_neutral());
        assert_eq!(obj.mark().hash(), h);
    }
}
