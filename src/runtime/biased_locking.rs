//! Biased locking.
//!
//! A biasable object is owned by the first thread that locks it. Further
//! acquisitions by that thread compare the header against the expected biased
//! value and succeed without any atomic instruction. Any other thread has to
//! get the bias revoked at a safepoint.
//!
//! The class prototype carries the bias epoch. Incrementing it in
//! [`bulk_rebias`] turns every outstanding, unheld bias toward instances of the
//! class into a bias that the next locking thread may simply take over.

use std::ptr;

use crate::oops::{
    mark_word::{AgeField, BiasedLockField, EpochField, ThreadField},
    Klass, MarkWord, ObjectRef,
};

use super::{
    counters::{bump, BiasedLockingCounters},
    lock_record::LockRecord,
    safepoint::AtSafepoint,
    thread::Thread,
};

/// How a bias was obtained.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BiasAcquire {
    /// The header was already biased toward the caller.
    AlreadyBiased,
    /// The bias epoch had expired and the caller took it over.
    Rebiased,
    /// The object was anonymously biased and the caller claimed it.
    AnonymouslyBiased,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BiasResult {
    Acquired(BiasAcquire),
    /// Continue with stack locking.
    NotBiased,
    /// The bias belongs to another thread; it has to be revoked first.
    RevokeAndRetry,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RevocationResult {
    NotBiased,
    Revoked,
    /// The bias owner held the lock; it now holds an equivalent stack lock.
    RevokedAndLocked,
}

/// Tries to lock `obj` through its bias.
///
/// `record.obj` is set before the header is read so that a revocation can find
/// the lock once it is held.
pub fn enter(
    obj: ObjectRef,
    record: &LockRecord,
    thread: &Thread,
    counters: Option<&BiasedLockingCounters>,
) -> BiasResult {
    record.set_obj(Some(obj));

    let mark = obj.mark();
    if !mark.has_bias_pattern() {
        return BiasResult::NotBiased;
    }

    let prototype = obj.klass().prototype_header();
    let biased_to_me = prototype.value() | ThreadField::encode(thread.id().raw());
    let diff = (biased_to_me ^ mark.value()) & !AgeField::mask_in_place();

    if diff == 0 {
        if let Some(c) = counters {
            bump(&c.biased_lock_entry_count);
        }
        return BiasResult::Acquired(BiasAcquire::AlreadyBiased);
    }

    if diff & BiasedLockField::mask_in_place() != 0 {
        // Biasing is off for the class. Whoever wins clears the bias; in any
        // case the header is no longer biased toward anyone useful.
        let unbiased = prototype.set_age(mark.age());
        if obj.cas_set_mark(mark, unbiased) == mark {
            if let Some(c) = counters {
                bump(&c.revoked_lock_entry_count);
            }
        }
        return BiasResult::NotBiased;
    }

    if diff & EpochField::mask_in_place() != 0 {
        let rebiased = MarkWord::encode_biased(Some(thread.id()), prototype.bias_epoch(), mark.age());
        if obj.cas_set_mark(mark, rebiased) == mark {
            if let Some(c) = counters {
                bump(&c.rebiased_lock_entry_count);
            }
            return BiasResult::Acquired(BiasAcquire::Rebiased);
        }
        return BiasResult::RevokeAndRetry;
    }

    let anonymous = MarkWord::from_raw(
        mark.value()
            & (BiasedLockField::mask_in_place()
                | AgeField::mask_in_place()
                | EpochField::mask_in_place()),
    );
    let claimed = MarkWord::from_raw(anonymous.value() | ThreadField::encode(thread.id().raw()));
    if obj.cas_set_mark(anonymous, claimed) == anonymous {
        if let Some(c) = counters {
            bump(&c.anonymously_biased_lock_entry_count);
        }
        return BiasResult::Acquired(BiasAcquire::AnonymouslyBiased);
    }
    BiasResult::RevokeAndRetry
}

/// Biased unlock. Returns `true` when the header still carries the bias
/// pattern, in which case there is nothing to do.
#[inline]
pub fn exit(obj: ObjectRef) -> bool {
    obj.mark().has_bias_pattern()
}

/// Removes the bias from `obj`.
///
/// If the bias owner currently holds the object, its lock records for the
/// object are rewritten so that it holds an ordinary stack lock instead: the
/// oldest record receives the unbiased header and newer ones become recursive.
pub fn revoke_at_safepoint(obj: ObjectRef, _at: &AtSafepoint) -> RevocationResult {
    let mark = obj.mark();
    if !mark.has_bias_pattern() {
        return RevocationResult::NotBiased;
    }

    let unbiased = MarkWord::prototype().set_age(mark.age());
    let owner = match mark.biased_locker().and_then(Thread::find) {
        Some(owner) => owner,
        None => {
            obj.set_mark(unbiased);
            log::trace!(target: "sync", "revoked unowned bias of {:?}", obj.as_ptr());
            return RevocationResult::Revoked;
        }
    };

    let mut held = owner
        .lock_records()
        .iter()
        .filter(|record| record.obj() == Some(obj));

    let oldest = match held.next() {
        Some(record) => record,
        None => {
            obj.set_mark(unbiased);
            log::trace!(
                target: "sync",
                "revoked bias of {:?} toward {:?} (not held)",
                obj.as_ptr(),
                owner.id()
            );
            return RevocationResult::Revoked;
        }
    };

    oldest.set_displaced_header(unbiased);
    for younger in held {
        younger.set_displaced_header(MarkWord::zero());
    }
    obj.set_mark(MarkWord::encode_lock_record(oldest));
    log::trace!(
        target: "sync",
        "revoked bias of {:?} toward {:?} (held)",
        obj.as_ptr(),
        owner.id()
    );
    RevocationResult::RevokedAndLocked
}

fn held_biased_locks_do(klass: &Klass, mut f: impl FnMut(&'static Thread, ObjectRef)) {
    Thread::threads_do(|thread| {
        for record in thread.lock_records() {
            let obj = match record.obj() {
                Some(obj) => obj,
                None => continue,
            };
            if !ptr::eq(obj.klass(), klass) {
                continue;
            }
            let mark = obj.mark();
            if mark.has_bias_pattern() && mark.biased_locker() == Some(thread.id()) {
                f(thread, obj);
            }
        }
    });
}

/// Advances the bias epoch of `klass`. Biases that are currently held are
/// moved to the new epoch so they stay valid.
pub fn bulk_rebias(klass: &Klass, at: &AtSafepoint) {
    let prototype = klass.prototype_header();
    if !prototype.has_bias_pattern() {
        return;
    }
    let updated = prototype.incr_bias_epoch();
    klass.set_prototype_header(updated, at);

    let mut kept = 0usize;
    held_biased_locks_do(klass, |_, obj| {
        let mark = obj.mark();
        if mark.bias_epoch() != updated.bias_epoch() {
            obj.set_mark(mark.set_bias_epoch(updated.bias_epoch()));
            kept += 1;
        }
    });
    log::debug!(
        target: "sync",
        "bulk rebias of {} to epoch {} ({} held biases kept)",
        klass.name(),
        updated.bias_epoch(),
        kept
    );
}

/// Disables biasing for `klass` and revokes every held bias toward its
/// instances. Unheld biases are cleared lazily by the next lock attempt.
pub fn bulk_revoke(klass: &Klass, at: &AtSafepoint) {
    klass.set_prototype_header(MarkWord::prototype(), at);

    let mut held = Vec::new();
    held_biased_locks_do(klass, |_, obj| {
        if !held.contains(&obj) {
            held.push(obj);
        }
    });
    for &obj in &held {
        revoke_at_safepoint(obj, at);
    }
    log::debug!(
        target: "sync",
        "bulk revoke of {} ({} held biases revoked)",
        klass.name(),
        held.len()
    );
}
