//! Undo log for mark words overwritten by forwarding pointers.
//!
//! Headers that can be rebuilt from the class prototype are simply dropped
//! when an object is forwarded. Everything else (locked, biased or hashed
//! headers) is saved here, one stack per GC worker, and written back after the
//! collection either committed or gave up.

use std::{
    cell::{RefCell, RefMut},
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use scoped_thread_pool::Pool;
use thread_local::ThreadLocal;

use crate::{
    config::SyncConfig,
    oops::{MarkWord, ObjectRef},
    utils::stack::Stack,
};

#[derive(Clone, Copy)]
pub struct PreservedMark {
    obj: ObjectRef,
    mark: MarkWord,
}

impl PreservedMark {
    pub fn new(obj: ObjectRef, mark: MarkWord) -> Self {
        Self { obj, mark }
    }

    pub fn obj(&self) -> ObjectRef {
        self.obj
    }

    pub fn mark(&self) -> MarkWord {
        self.mark
    }

    pub fn set_mark(&self) {
        self.obj.set_mark(self.mark);
    }
}

impl fmt::Debug for PreservedMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p} -> {:?}", self.obj.as_ptr(), self.mark)
    }
}

pub struct PreservedMarks {
    stack: Stack<PreservedMark>,
}

impl PreservedMarks {
    pub fn new() -> Self {
        Self::with_segment_size(SyncConfig::global().preserved_marks_segment_size)
    }

    pub fn with_segment_size(segment_size: usize) -> Self {
        Self {
            stack: Stack::new(segment_size),
        }
    }

    pub fn size(&self) -> usize {
        self.stack.size()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn push(&mut self, obj: ObjectRef, mark: MarkWord) {
        debug_assert!(
            mark.must_be_preserved(obj.klass().prototype_header()),
            "{} does not need to be preserved",
            mark
        );
        self.stack.push(PreservedMark::new(obj, mark));
    }

    /// Saves `mark` if it is about to be lost. `mark` is the header value `obj`
    /// had before it was overwritten.
    #[inline]
    pub fn push_if_necessary(&mut self, obj: ObjectRef, mark: MarkWord) {
        if mark.must_be_preserved(obj.klass().prototype_header()) {
            self.push(obj, mark);
        }
    }

    /// Writes every saved header back, newest first.
    pub fn restore(&mut self) {
        while let Some(elem) = self.stack.pop() {
            elem.set_mark();
        }
        debug_assert!(self.is_empty());
    }

    pub fn restore_and_increment(&mut self, total_size: &AtomicUsize) {
        let size = self.size();
        self.restore();
        total_size.fetch_add(size, Ordering::Relaxed);
    }

    /// Gives a forwarded object back a header rebuilt from its class.
    pub fn init_forwarded_mark(obj: ObjectRef) {
        obj.init_mark();
    }

    pub fn assert_empty(&self) {
        assert!(
            self.is_empty(),
            "stack expected to be empty, size = {}",
            self.size()
        );
    }
}

impl Default for PreservedMarks {
    fn default() -> Self {
        Self::new()
    }
}

/// One [`PreservedMarks`] stack per worker thread.
pub struct PreservedMarksSet {
    stacks: ThreadLocal<RefCell<PreservedMarks>>,
    segment_size: usize,
}

impl PreservedMarksSet {
    pub fn new() -> Self {
        Self::with_segment_size(SyncConfig::global().preserved_marks_segment_size)
    }

    pub fn with_segment_size(segment_size: usize) -> Self {
        Self {
            stacks: ThreadLocal::new(),
            segment_size,
        }
    }

    /// The calling worker's stack.
    pub fn get(&self) -> RefMut<'_, PreservedMarks> {
        self.stacks
            .get_or(|| RefCell::new(PreservedMarks::with_segment_size(self.segment_size)))
            .borrow_mut()
    }

    pub fn size(&mut self) -> usize {
        self.stacks.iter_mut().map(|s| s.get_mut().size()).sum()
    }

    /// Restores every worker stack on the calling thread.
    pub fn restore(&mut self) {
        let expected = self.size();
        let total = AtomicUsize::new(0);
        for stack in self.stacks.iter_mut() {
            stack.get_mut().restore_and_increment(&total);
        }
        self.finish_restore(expected, total.into_inner());
    }

    /// Restores the worker stacks in parallel, one task per non-empty stack.
    pub fn restore_parallel(&mut self, pool: &Pool) {
        let expected = self.size();
        let total = AtomicUsize::new(0);
        {
            let total = &total;
            let stacks = &mut self.stacks;
            pool.scoped(|scope| {
                for stack in stacks.iter_mut() {
                    let stack = stack.get_mut();
                    if stack.is_empty() {
                        continue;
                    }
                    scope.execute(move || stack.restore_and_increment(total));
                }
            });
        }
        self.finish_restore(expected, total.into_inner());
    }

    fn finish_restore(&mut self, expected: usize, restored: usize) {
        debug_assert_eq!(
            expected, restored,
            "total_size = {} before restoration, total_size = {} after restoration",
            expected, restored
        );
        log::trace!(target: "gc", "Restored {} marks", restored);
        #[cfg(debug_assertions)]
        self.assert_empty();
    }

    pub fn assert_empty(&mut self) {
        for stack in self.stacks.iter_mut() {
            stack.get_mut().assert_empty();
        }
    }
}

impl Default for PreservedMarksSet {
    fn default() -> Self {
        Self::new()
    }
}
