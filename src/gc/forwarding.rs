//! Forwarding pointers.
//!
//! While objects are evacuated or compacted their mark word is replaced by a
//! pointer to the new copy, tagged as marked. Racing copiers agree on a single
//! copy: the first successful CAS wins and every other racer adopts its result.

use crate::oops::{MarkWord, ObjectRef};

use super::preserved_marks::PreservedMarks;

#[inline]
fn decode(mark: MarkWord) -> ObjectRef {
    debug_assert!(mark.is_marked());
    unsafe { ObjectRef::from_raw(mark.clear_lock_bits().to_pointer().cast()) }
}

#[inline]
pub fn is_forwarded(obj: ObjectRef) -> bool {
    obj.mark().is_marked()
}

/// The copy of `obj`, or `obj` itself when it has not been forwarded.
#[inline]
pub fn get_forwardee(obj: ObjectRef) -> ObjectRef {
    let mark = obj.mark();
    if mark.is_marked() {
        decode(mark)
    } else {
        obj
    }
}

/// Unconditionally forwards `obj`. Only for collectors that do not race on
/// the object.
pub fn forward_to(obj: ObjectRef, dest: ObjectRef) {
    obj.set_mark(MarkWord::encode_pointer_as_mark(dest.as_ptr()));
}

/// Forwards `obj` to `candidate` unless another thread forwarded it first.
/// Returns the winning forwardee.
pub fn try_update_forwardee(obj: ObjectRef, candidate: ObjectRef) -> ObjectRef {
    match install(obj, candidate) {
        Ok(_) => candidate,
        Err(winner) => winner,
    }
}

/// Like [`try_update_forwardee`], and the winner records the header it
/// replaced in `preserved` if the header cannot be rebuilt from the class.
pub fn try_forward_preserving(
    obj: ObjectRef,
    candidate: ObjectRef,
    preserved: &mut PreservedMarks,
) -> ObjectRef {
    match install(obj, candidate) {
        Ok(replaced) => {
            preserved.push_if_necessary(obj, replaced);
            candidate
        }
        Err(winner) => winner,
    }
}

/// `Ok(replaced header)` when this call installed the forwarding pointer,
/// `Err(forwardee)` when somebody else did.
fn install(obj: ObjectRef, candidate: ObjectRef) -> Result<MarkWord, ObjectRef> {
    let forwarded = MarkWord::encode_pointer_as_mark(candidate.as_ptr());
    let mut old = obj.mark();
    loop {
        if old.is_marked() {
            let winner = decode(old);
            if winner != candidate {
                log::trace!(
                    target: "gc",
                    "lost forwarding race for {:?}: {:?} beat {:?}",
                    obj.as_ptr(),
                    winner.as_ptr(),
                    candidate.as_ptr()
                );
            }
            return Err(winner);
        }
        let observed = obj.cas_set_mark(old, forwarded);
        if observed == old {
            return Ok(old);
        }
        old = observed;
    }
}
