use std::{
    fmt,
    ptr::null_mut,
    sync::atomic::{AtomicPtr, Ordering},
};

use crate::oops::{mark_word::AtomicMarkWord, MarkWord, ObjectHeader, ObjectRef};

use super::thread::ThreadId;

/// Per-acquisition slot owned by the locking thread.
///
/// While an object is stack-locked its header points at the record, and the
/// record keeps the header value the lock displaced. A displaced value of `0`
/// marks a recursive acquisition and [`MarkWord::unused_mark`] marks one that
/// went through a monitor.
#[repr(C, align(8))]
pub struct LockRecord {
    displaced: AtomicMarkWord,
    obj: AtomicPtr<ObjectHeader>,
    owner: ThreadId,
}

impl LockRecord {
    pub(crate) fn new(owner: ThreadId) -> Self {
        Self {
            displaced: AtomicMarkWord::new(MarkWord::zero()),
            obj: AtomicPtr::new(null_mut()),
            owner,
        }
    }

    #[inline(always)]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    #[inline(always)]
    pub fn displaced_header(&self) -> MarkWord {
        self.displaced.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set_displaced_header(&self, mark: MarkWord) {
        self.displaced.store(mark, Ordering::Release)
    }

    pub fn obj(&self) -> Option<ObjectRef> {
        let ptr = self.obj.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { ObjectRef::from_raw(ptr) })
        }
    }

    pub fn set_obj(&self, obj: Option<ObjectRef>) {
        let ptr = obj.map(ObjectRef::as_ptr).unwrap_or(null_mut());
        self.obj.store(ptr, Ordering::Release)
    }

    pub(crate) fn reset(&self) {
        self.set_obj(None);
        self.set_displaced_header(MarkWord::zero());
    }
}

impl fmt::Debug for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRecord")
            .field("owner", &self.owner)
            .field("displaced", &self.displaced_header())
            .field("obj", &self.obj.load(Ordering::Relaxed))
            .finish()
    }
}
