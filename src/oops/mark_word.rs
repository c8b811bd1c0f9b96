//! The mark word: one machine word per object that encodes lock state,
//! identity hash, GC age and, while a collection runs, a forwarding pointer.
//!
//! Bit layout (64 bit):
//!
//! ```text
//!  hash:31 ------------>| unused_gap:1 age:4 biased_lock:1 lock:2 (normal object)
//!  thread:54 epoch:2       unused_gap:1 age:4 biased_lock:1 lock:2 (biased object)
//! ```
//!
//! Bit layout (32 bit):
//!
//! ```text
//!  hash:25 ------------>| age:4 biased_lock:1 lock:2 (normal object)
//!  thread:23 epoch:2       age:4 biased_lock:1 lock:2 (biased object)
//! ```
//!
//! The low two bits select the interpretation:
//!
//! ```text
//!  [ptr             | 00]  stack-locked   ptr points to a LockRecord
//!  [header      | 0 | 01]  unlocked       regular object header
//!  [ptr             | 10]  monitor        ptr points to an ObjectMonitor
//!  [ptr             | 11]  marked         forwarding pointer during GC
//!  [thread | epoch | age | 1 | 01]  biased toward the given thread
//!  [0           | epoch | age | 1 | 01]  anonymously biased
//! ```
//!
//! The all-zero word is reserved as the transient "busy" value installed
//! while a stack-lock is being set up or inflated.

use std::{fmt, sync::atomic::Ordering};

use atomic::Atomic;

use crate::{
    runtime::{lock_record::LockRecord, object_monitor::ObjectMonitor, thread::ThreadId},
    utils::bitfield::BitField,
};

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        pub const HASH_BITS: usize = 31;
        pub const UNUSED_GAP_BITS: usize = 1;
    } else {
        pub const HASH_BITS: usize = 25;
        pub const UNUSED_GAP_BITS: usize = 0;
    }
}

pub const BITS_PER_WORD: usize = usize::BITS as usize;

pub const LOCK_BITS: usize = 2;
pub const BIASED_LOCK_BITS: usize = 1;
pub const AGE_BITS: usize = 4;
pub const EPOCH_BITS: usize = 2;

pub const LOCK_SHIFT: usize = 0;
pub const BIASED_LOCK_SHIFT: usize = LOCK_BITS;
pub const AGE_SHIFT: usize = LOCK_BITS + BIASED_LOCK_BITS;
pub const UNUSED_GAP_SHIFT: usize = AGE_SHIFT + AGE_BITS;
pub const HASH_SHIFT: usize = UNUSED_GAP_SHIFT + UNUSED_GAP_BITS;
pub const EPOCH_SHIFT: usize = HASH_SHIFT;
pub const THREAD_SHIFT: usize = EPOCH_SHIFT + EPOCH_BITS;
pub const THREAD_BITS: usize = BITS_PER_WORD - THREAD_SHIFT;

pub type LockField = BitField<LOCK_BITS, LOCK_SHIFT>;
pub type BiasedLockField = BitField<{ LOCK_BITS + BIASED_LOCK_BITS }, LOCK_SHIFT>;
pub type AgeField = BitField<AGE_BITS, AGE_SHIFT>;
pub type HashField = BitField<HASH_BITS, HASH_SHIFT>;
pub type EpochField = BitField<EPOCH_BITS, EPOCH_SHIFT>;
pub type ThreadField = BitField<THREAD_BITS, THREAD_SHIFT>;

pub const LOCKED_VALUE: usize = 0;
pub const UNLOCKED_VALUE: usize = 1;
pub const MONITOR_VALUE: usize = 2;
pub const MARKED_VALUE: usize = 3;
pub const BIASED_LOCK_PATTERN: usize = 5;

pub const NO_HASH: usize = 0;
pub const MAX_AGE: usize = AgeField::mask();
pub const MAX_BIAS_EPOCH: usize = EpochField::mask();

/// Lock records and monitors are encoded directly into the word, so their
/// addresses must leave the lock bits free.
pub const MIN_ENCODED_ALIGNMENT: usize = 1 << LOCK_BITS;

/// Decoded interpretation of a [`MarkWord`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MarkKind {
    Neutral,
    Biased,
    StackLocked,
    /// The transient all-zero word.
    Busy,
    Monitor,
    Marked,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MarkWord(usize);

impl MarkWord {
    #[inline(always)]
    pub const fn from_raw(value: usize) -> Self {
        Self(value)
    }

    #[inline(always)]
    pub const fn value(self) -> usize {
        self.0
    }

    /// The busy / inflating value.
    #[inline(always)]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Unlocked, no hash, age 0.
    #[inline(always)]
    pub const fn prototype() -> Self {
        Self(NO_HASH << HASH_SHIFT | UNLOCKED_VALUE)
    }

    /// Anonymously biased, epoch 0, age 0.
    #[inline(always)]
    pub const fn biased_locking_prototype() -> Self {
        Self(BIASED_LOCK_PATTERN)
    }

    /// Non-zero sentinel stored into a lock record whose lock went through a
    /// monitor. It never appears in a header outside of GC.
    #[inline(always)]
    pub const fn unused_mark() -> Self {
        Self(MARKED_VALUE)
    }

    pub const fn kind(self) -> MarkKind {
        match self.0 & LockField::mask_in_place() {
            MARKED_VALUE => MarkKind::Marked,
            MONITOR_VALUE => MarkKind::Monitor,
            LOCKED_VALUE => {
                if self.0 == 0 {
                    MarkKind::Busy
                } else {
                    MarkKind::StackLocked
                }
            }
            _ => {
                if self.has_bias_pattern() {
                    MarkKind::Biased
                } else {
                    MarkKind::Neutral
                }
            }
        }
    }

    #[inline(always)]
    pub const fn is_locked(self) -> bool {
        self.0 & LockField::mask_in_place() != UNLOCKED_VALUE
    }

    #[inline(always)]
    pub const fn is_unlocked(self) -> bool {
        self.0 & BiasedLockField::mask_in_place() == UNLOCKED_VALUE
    }

    #[inline(always)]
    pub const fn is_neutral(self) -> bool {
        self.is_unlocked()
    }

    #[inline(always)]
    pub const fn is_marked(self) -> bool {
        self.0 & LockField::mask_in_place() == MARKED_VALUE
    }

    #[inline(always)]
    pub const fn has_monitor(self) -> bool {
        self.0 & LockField::mask_in_place() == MONITOR_VALUE
    }

    #[inline(always)]
    pub const fn has_locker(self) -> bool {
        self.0 & LockField::mask_in_place() == LOCKED_VALUE && self.0 != 0
    }

    #[inline(always)]
    pub const fn is_being_inflated(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn has_bias_pattern(self) -> bool {
        self.0 & BiasedLockField::mask_in_place() == BIASED_LOCK_PATTERN
    }

    /// Owner of the bias, `None` when anonymously biased.
    pub fn biased_locker(self) -> Option<ThreadId> {
        debug_assert!(self.has_bias_pattern());
        ThreadId::from_raw(ThreadField::decode(self.0))
    }

    #[inline(always)]
    pub const fn bias_epoch(self) -> usize {
        EpochField::decode(self.0)
    }

    #[inline(always)]
    pub const fn epoch(self) -> usize {
        self.bias_epoch()
    }

    pub fn set_bias_epoch(self, epoch: usize) -> Self {
        debug_assert!(self.has_bias_pattern());
        debug_assert!(epoch <= MAX_BIAS_EPOCH);
        Self(EpochField::update(epoch, self.0))
    }

    pub fn incr_bias_epoch(self) -> Self {
        self.set_bias_epoch((self.bias_epoch() + 1) & MAX_BIAS_EPOCH)
    }

    #[inline(always)]
    pub const fn age(self) -> usize {
        AgeField::decode(self.0)
    }

    pub const fn set_age(self, age: usize) -> Self {
        Self(AgeField::update(age, self.0))
    }

    /// Saturates at [`MAX_AGE`].
    pub const fn incr_age(self) -> Self {
        if self.age() == MAX_AGE {
            self
        } else {
            self.set_age(self.age() + 1)
        }
    }

    #[inline(always)]
    pub const fn hash(self) -> usize {
        HashField::decode(self.0)
    }

    #[inline(always)]
    pub const fn has_no_hash(self) -> bool {
        self.hash() == NO_HASH
    }

    pub fn copy_set_hash(self, hash: usize) -> Self {
        debug_assert!(self.is_neutral());
        Self(HashField::update(hash, self.0))
    }

    /// The word with its low three bits replaced by the unlocked tag `001`.
    #[inline(always)]
    pub const fn set_unlocked(self) -> Self {
        Self((self.0 & !BiasedLockField::mask_in_place()) | UNLOCKED_VALUE)
    }

    /// Strips the lock bits, leaving the raw pointer of a stack-locked,
    /// inflated or forwarded word.
    #[inline(always)]
    pub const fn clear_lock_bits(self) -> Self {
        Self(self.0 & !LockField::mask_in_place())
    }

    #[inline(always)]
    pub const fn to_pointer(self) -> *mut u8 {
        self.0 as *mut u8
    }

    pub fn locker(self) -> *const LockRecord {
        debug_assert!(self.has_locker());
        self.0 as *const LockRecord
    }

    pub fn monitor(self) -> *const ObjectMonitor {
        debug_assert!(self.has_monitor());
        (self.0 ^ MONITOR_VALUE) as *const ObjectMonitor
    }

    pub fn encode_pointer_as_mark<T>(ptr: *const T) -> Self {
        debug_assert_eq!(ptr as usize & LockField::mask_in_place(), 0);
        Self(ptr as usize | MARKED_VALUE)
    }

    pub fn encode_lock_record(record: &LockRecord) -> Self {
        let addr = record as *const LockRecord as usize;
        debug_assert_eq!(addr & LockField::mask_in_place(), 0);
        Self(addr | LOCKED_VALUE)
    }

    pub fn encode_monitor(monitor: &ObjectMonitor) -> Self {
        let addr = monitor as *const ObjectMonitor as usize;
        debug_assert_eq!(addr & LockField::mask_in_place(), 0);
        Self(addr | MONITOR_VALUE)
    }

    pub fn encode_biased(thread: Option<ThreadId>, epoch: usize, age: usize) -> Self {
        let thread = thread.map(ThreadId::raw).unwrap_or(0);
        debug_assert!(ThreadField::is_valid(thread));
        Self(
            ThreadField::encode(thread)
                | EpochField::encode(epoch)
                | AgeField::encode(age)
                | BIASED_LOCK_PATTERN,
        )
    }

    /// Whether a collector that overwrites this word with a forwarding pointer
    /// must save it first. `prototype` is the header prototype of the object's
    /// class.
    ///
    /// Biased words, and words of classes that are still biasable, are always
    /// saved; this over-preserves a little but keeps the predicate local.
    pub fn must_be_preserved(self, prototype: MarkWord) -> bool {
        if self.has_bias_pattern() || prototype.has_bias_pattern() {
            return true;
        }
        !self.is_unlocked() || !self.has_no_hash()
    }
}

impl fmt::Display for MarkWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            MarkKind::Marked => write!(f, "marked({:#x})", self.0),
            MarkKind::Monitor => {
                write!(f, "monitor({:#x})=", self.0)?;
                let monitor = self.monitor();
                if monitor.is_null() {
                    write!(f, "NULL")
                } else {
                    // Monitors are never freed.
                    write!(f, "{:?}", unsafe { &*monitor })
                }
            }
            MarkKind::StackLocked | MarkKind::Busy => write!(f, "locked({:#x})", self.0),
            MarkKind::Neutral => {
                write!(f, "mark(is_neutral")?;
                if self.has_no_hash() {
                    write!(f, " no_hash")?;
                } else {
                    write!(f, " hash={:#x}", self.hash())?;
                }
                write!(f, " age={})", self.age())
            }
            MarkKind::Biased => {
                let locker = ThreadField::decode(self.0);
                write!(
                    f,
                    "mark(is_biased biased_locker={:#x} epoch={} age={})",
                    locker,
                    self.bias_epoch(),
                    self.age()
                )
            }
        }
    }
}

impl fmt::Debug for MarkWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MarkWord({:#x}: {})", self.0, self)
    }
}

#[cfg(test)]
thread_local! {
    static CAS_COUNT: std::cell::Cell<usize> = std::cell::Cell::new(0);
}

/// Number of compare-and-swap operations the calling thread has issued on
/// any [`AtomicMarkWord`].
#[cfg(test)]
pub(crate) fn cas_count() -> usize {
    CAS_COUNT.with(|c| c.get())
}

/// A mark word stored in memory. Every protocol mutates it only through
/// [`compare_and_set`](Self::compare_and_set) or plain stores made while no
/// other thread may race.
#[repr(transparent)]
pub struct AtomicMarkWord {
    word: Atomic<MarkWord>,
}

impl AtomicMarkWord {
    pub const fn new(mark: MarkWord) -> Self {
        Self {
            word: Atomic::new(mark),
        }
    }

    #[inline(always)]
    pub fn load(&self, ordering: Ordering) -> MarkWord {
        self.word.load(ordering)
    }

    #[inline(always)]
    pub fn store(&self, mark: MarkWord, ordering: Ordering) {
        self.word.store(mark, ordering)
    }

    /// Installs `new` if the word still holds `expected`. Returns the value
    /// observed before the operation; it equals `expected` on success.
    #[inline]
    pub fn compare_and_set(&self, expected: MarkWord, new: MarkWord) -> MarkWord {
        #[cfg(test)]
        CAS_COUNT.with(|c| c.set(c.get() + 1));
        match self
            .word
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(prev) => prev,
            Err(prev) => prev,
        }
    }
}

impl fmt::Debug for AtomicMarkWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}
