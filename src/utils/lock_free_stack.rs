use std::sync::atomic::{AtomicPtr, Ordering};

/// Intrusive element of a [`LockFreeStack`].
pub trait LockFreeItem: Sized {
    fn next_ptr(&self) -> &AtomicPtr<Self>;
}

/// Treiber stack of intrusively linked items.
///
/// Items are only ever pushed, never removed, so there is no ABA problem and
/// no reclamation scheme.
pub struct LockFreeStack<T: LockFreeItem> {
    top: AtomicPtr<T>,
}

unsafe impl<T: LockFreeItem + Sync> Sync for LockFreeStack<T> {}
unsafe impl<T: LockFreeItem + Send> Send for LockFreeStack<T> {}

impl<T: LockFreeItem> LockFreeStack<T> {
    pub const fn new() -> Self {
        Self {
            top: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn top(&self) -> *mut T {
        self.top.load(Ordering::Acquire)
    }

    unsafe fn prepend_impl(&self, first: *mut T, last: *mut T) {
        let mut cur = self.top.load(Ordering::Relaxed);
        loop {
            Self::set_next(&*last, cur);

            match self
                .top
                .compare_exchange_weak(cur, first, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn next(value: &T) -> *mut T {
        value.next_ptr().load(Ordering::Relaxed)
    }

    pub fn set_next(value: &T, next: *mut T) {
        value.next_ptr().store(next, Ordering::Relaxed);
    }

    /// # Safety
    ///
    /// `value` must be valid for as long as it is reachable from this stack
    /// and must not already be linked into any stack.
    pub unsafe fn push(&self, value: *mut T) {
        self.prepend_impl(value, value);
    }

    /// Walks the stack from the most recently pushed item.
    ///
    /// # Safety
    ///
    /// Every item pushed must still be alive.
    pub unsafe fn for_each(&self, mut f: impl FnMut(&T)) {
        let mut cur = self.top();
        while !cur.is_null() {
            f(&*cur);
            cur = Self::next(&*cur);
        }
    }

    /// # Safety
    ///
    /// Every item pushed must still be alive.
    pub unsafe fn length(&self) -> usize {
        let mut len = 0;
        self.for_each(|_| len += 1);
        len
    }
}

impl<T: LockFreeItem> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}
