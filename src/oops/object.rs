use std::{fmt, ptr::NonNull, sync::atomic::Ordering};

use super::{
    klass::Klass,
    mark_word::{AtomicMarkWord, MarkWord},
};

/// Header that precedes every managed object.
#[repr(C, align(8))]
pub struct ObjectHeader {
    mark: AtomicMarkWord,
    klass: &'static Klass,
}

impl ObjectHeader {
    /// A header initialized from the class prototype.
    pub fn new(klass: &'static Klass) -> Self {
        Self {
            mark: AtomicMarkWord::new(klass.prototype_header()),
            klass,
        }
    }

    /// Allocates a header that lives for the rest of the process.
    ///
    /// Object memory management is owned by the embedding heap; this is the
    /// allocator used when no heap is attached.
    pub fn allocate(klass: &'static Klass) -> ObjectRef {
        ObjectRef::from_static(Box::leak(Box::new(Self::new(klass))))
    }

    #[inline(always)]
    pub fn mark(&self) -> MarkWord {
        self.mark.load(Ordering::Acquire)
    }

    /// Plain store. Only valid when no other thread may CAS the word, or when
    /// the store publishes a value after the word was claimed with the busy
    /// value.
    #[inline(always)]
    pub fn set_mark(&self, mark: MarkWord) {
        self.mark.store(mark, Ordering::Release)
    }

    #[inline(always)]
    pub fn cas_set_mark(&self, expected: MarkWord, new: MarkWord) -> MarkWord {
        self.mark.compare_and_set(expected, new)
    }

    #[inline(always)]
    pub fn klass(&self) -> &'static Klass {
        self.klass
    }

    /// Resets the mark to the class prototype.
    pub fn init_mark(&self) {
        self.set_mark(self.klass.prototype_header())
    }
}

/// Reference to a live object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjectRef(NonNull<ObjectHeader>);

unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    pub fn from_static(header: &'static ObjectHeader) -> Self {
        Self(NonNull::from(header))
    }

    /// # Safety
    ///
    /// `ptr` must point to an object header that stays valid while the
    /// returned reference is in use.
    pub unsafe fn from_raw(ptr: *mut ObjectHeader) -> Self {
        debug_assert!(!ptr.is_null());
        Self(NonNull::new_unchecked(ptr))
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut ObjectHeader {
        self.0.as_ptr()
    }

    #[inline(always)]
    pub fn header(&self) -> &ObjectHeader {
        unsafe { self.0.as_ref() }
    }
}

impl std::ops::Deref for ObjectRef {
    type Target = ObjectHeader;

    fn deref(&self) -> &ObjectHeader {
        self.header()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:p} {}", self.klass().name(), self.as_ptr(), self.mark())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PLAIN: Klass = Klass::new("Plain");
    static BIASABLE: Klass = Klass::new_biasable("Biasable");

    #[test]
    fn fresh_object_is_neutral() {
        let obj = ObjectHeader::allocate(&PLAIN);
        let mark = obj.mark();
        assert!(mark.is_neutral());
        assert!(!mark.is_locked());
        assert!(!mark.has_monitor());
        assert!(mark.has_no_hash());
    }

    #[test]
    fn fresh_object_of_biasable_class_is_anonymously_biased() {
        let obj = ObjectHeader::allocate(&BIASABLE);
        let mark = obj.mark();
        assert!(mark.has_bias_pattern());
        assert_eq!(mark.biased_locker(), None);
        assert!(!mark.is_locked());
    }

    #[test]
    fn init_mark_restores_prototype() {
        let obj = ObjectHeader::allocate(&PLAIN);
        obj.set_mark(MarkWord::prototype().copy_set_hash(11).set_age(4));
        obj.init_mark();
        assert_eq!(obj.mark(), PLAIN.prototype_header());
    }
}
