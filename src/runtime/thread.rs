use std::{
    fmt,
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{
    config::SyncConfig,
    oops::mark_word::{HashField, ThreadField, NO_HASH},
    utils::weak_random::WeakRandom,
};

use super::{
    lock_record::LockRecord,
    mutex::{LockRank, Monitor, SafepointCheck},
};

/// Identity of a thread as stored in biased mark words, lock records and
/// monitor owner fields. Never zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ThreadId(NonZeroUsize);

impl ThreadId {
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    #[inline(always)]
    pub fn raw(self) -> usize {
        self.0.get()
    }

    fn next() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        let raw = NEXT.fetch_add(1, Ordering::Relaxed);
        assert!(
            ThreadField::is_valid(raw),
            "thread id {} does not fit into a biased mark word",
            raw
        );
        match Self::from_raw(raw) {
            Some(id) => id,
            None => unreachable!(),
        }
    }
}

static THREADS: Lazy<Monitor<Vec<&'static Thread>>> =
    Lazy::new(|| Monitor::new("Threads_lock", LockRank::Nonleaf, SafepointCheck::Never, Vec::new()));

/// Attachment of an OS thread. Dropped when the OS thread exits.
struct CurrentThread(&'static Thread);

impl Drop for CurrentThread {
    fn drop(&mut self) {
        // A thread that still holds records may be named by a stack-locked
        // header and has to stay findable.
        if self.0.lock_records().is_empty() {
            Thread::unregister(self.0);
        }
    }
}

thread_local! {
    static CURRENT: CurrentThread = CurrentThread(Thread::new());
}

/// A thread known to the synchronization layer.
///
/// Each thread owns a fixed arena of lock records. Arenas are never freed, so
/// a record address found in any header can always be dereferenced to read
/// its owner. The thread attached by [`Thread::current`] leaves the registry
/// when its OS thread exits without holding records.
pub struct Thread {
    id: ThreadId,
    records: &'static [LockRecord],
    top: AtomicUsize,
    hash_state: Mutex<WeakRandom>,
}

impl Thread {
    /// Registers a new thread with the configured lock record capacity.
    pub fn new() -> &'static Thread {
        Self::with_capacity(SyncConfig::global().lock_stack_capacity)
    }

    pub fn with_capacity(capacity: usize) -> &'static Thread {
        let id = ThreadId::next();
        let records: Vec<LockRecord> = (0..capacity).map(|_| LockRecord::new(id)).collect();
        let thread: &'static Thread = Box::leak(Box::new(Thread {
            id,
            records: Box::leak(records.into_boxed_slice()),
            top: AtomicUsize::new(0),
            hash_state: Mutex::new(WeakRandom::new(None)),
        }));
        THREADS.lock_without_safepoint_check().push(thread);
        log::trace!(target: "sync", "registered thread {:?}", id);
        thread
    }

    /// The thread object attached to the calling OS thread.
    pub fn current() -> &'static Thread {
        CURRENT.with(|t| t.0)
    }

    fn unregister(thread: &'static Thread) {
        THREADS
            .lock_without_safepoint_check()
            .retain(|t| !std::ptr::eq(*t, thread));
        log::trace!(target: "sync", "unregistered thread {:?}", thread.id);
    }

    #[inline(always)]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn lock_stack_capacity(&self) -> usize {
        self.records.len()
    }

    /// Claims the next free lock record.
    pub fn push_lock_record(&self) -> &'static LockRecord {
        let top = self.top.load(Ordering::Relaxed);
        if top == self.records.len() {
            panic!("lock record stack overflow");
        }
        let record = &self.records[top];
        record.reset();
        self.top.store(top + 1, Ordering::Release);
        record
    }

    /// Releases the most recently claimed lock record.
    pub fn pop_lock_record(&self, record: &LockRecord) {
        let top = self.top.load(Ordering::Relaxed);
        debug_assert!(top > 0, "lock record stack underflow");
        debug_assert!(
            std::ptr::eq(&self.records[top - 1], record),
            "lock records released out of order"
        );
        record.reset();
        self.top.store(top - 1, Ordering::Release);
    }

    /// Records currently in use, oldest first.
    pub fn lock_records(&self) -> &'static [LockRecord] {
        let top = self.top.load(Ordering::Acquire);
        &self.records[..top]
    }

    /// Non-zero value that fits the hash field of a mark word.
    pub fn next_hash(&self) -> usize {
        let mut rng = self.hash_state.lock();
        loop {
            let hash = (rng.get_u64() as usize) & HashField::mask();
            if hash != NO_HASH {
                return hash;
            }
        }
    }

    pub fn find(id: ThreadId) -> Option<&'static Thread> {
        THREADS
            .lock_without_safepoint_check()
            .iter()
            .copied()
            .find(|t| t.id == id)
    }

    /// Calls `f` for every registered thread.
    pub fn threads_do(mut f: impl FnMut(&'static Thread)) {
        let threads = THREADS.lock_without_safepoint_check();
        for &thread in threads.iter() {
            f(thread);
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("lock_records", &self.top.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_registered() {
        let a = Thread::new();
        let b = Thread::new();
        assert_ne!(a.id(), b.id());
        assert!(std::ptr::eq(Thread::find(a.id()).unwrap(), a));
        let mut seen = 0;
        Thread::threads_do(|t| {
            if t.id() == a.id() || t.id() == b.id() {
                seen += 1;
            }
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn current_is_stable_per_os_thread() {
        let here = Thread::current();
        assert!(std::ptr::eq(here, Thread::current()));
        let there = std::thread::spawn(|| Thread::current().id()).join().unwrap();
        assert_ne!(here.id(), there);
    }

    #[test]
    fn exited_threads_leave_the_registry() {
        let idle = std::thread::spawn(|| Thread::current().id()).join().unwrap();
        assert!(Thread::find(idle).is_none());

        let holding = std::thread::spawn(|| {
            let t = Thread::current();
            t.push_lock_record();
            t.id()
        })
        .join()
        .unwrap();
        assert!(Thread::find(holding).is_some());

        let mut registered = 0;
        Thread::threads_do(|t| {
            if t.id() == idle {
                registered += 1;
            }
        });
        assert_eq!(registered, 0);
    }

    #[test]
    fn records_are_lifo() {
        let t = Thread::with_capacity(4);
        let r1 = t.push_lock_record();
        let r2 = t.push_lock_record();
        assert_eq!(r1.owner(), t.id());
        assert_eq!(t.lock_records().len(), 2);
        t.pop_lock_record(r2);
        t.pop_lock_record(r1);
        assert!(t.lock_records().is_empty());
    }

    #[test]
    #[should_panic(expected = "lock record stack overflow")]
    fn record_overflow_panics() {
        let t = Thread::with_capacity(2);
        t.push_lock_record();
        t.push_lock_record();
        t.push_lock_record();
    }

    #[test]
    fn hashes_are_non_zero_and_fit() {
        let t = Thread::new();
        for _ in 0..1000 {
            let h = t.next_hash();
            assert_ne!(h, 0);
            assert_eq!(h & !HashField::mask(), 0);
        }
    }
}
