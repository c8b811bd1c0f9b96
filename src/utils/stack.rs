use std::{
    alloc::{self, Layout},
    marker::PhantomData,
    mem::size_of,
    ptr::null_mut,
};

/// Link stored in front of the elements of every segment.
#[repr(C)]
struct Segment<E> {
    prev: *mut Segment<E>,
    _marker: PhantomData<E>,
}

/// Unbounded LIFO stack made of fixed-size segments.
///
/// Growing allocates a new segment instead of copying, so a stack can reach
/// millions of entries during an evacuation without a single large
/// reallocation. A segment is freed as soon as its last entry is popped.
pub struct Stack<E: Copy> {
    segment_size: usize,
    layout: Layout,
    items_offset: usize,
    top: *mut Segment<E>,
    /// Entries in `top`. Never zero while `top` is non-null.
    top_len: usize,
    /// Entries in the full segments below `top`.
    below: usize,
}

unsafe impl<E: Copy + Send> Send for Stack<E> {}

impl<E: Copy> Stack<E> {
    pub fn new(segment_size: usize) -> Self {
        assert!(segment_size > 0, "segment size must be positive");
        let layout = Layout::array::<E>(segment_size)
            .and_then(|items| Layout::new::<Segment<E>>().extend(items));
        let (layout, items_offset) = match layout {
            Ok((layout, offset)) => (layout.pad_to_align(), offset),
            Err(_) => panic!("segment of {} elements is too large", segment_size),
        };
        Self {
            segment_size,
            layout,
            items_offset,
            top: null_mut(),
            top_len: 0,
            below: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.top.is_null()
    }

    pub fn size(&self) -> usize {
        self.below + self.top_len
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    fn items(&self, seg: *mut Segment<E>) -> *mut E {
        unsafe { seg.cast::<u8>().add(self.items_offset).cast() }
    }

    #[inline(never)]
    #[cold]
    fn grow(&mut self) {
        let seg = unsafe { alloc::alloc(self.layout) }.cast::<Segment<E>>();
        if seg.is_null() {
            alloc::handle_alloc_error(self.layout);
        }
        unsafe {
            seg.write(Segment {
                prev: self.top,
                _marker: PhantomData,
            });
        }
        if !self.top.is_null() {
            self.below += self.top_len;
        }
        self.top = seg;
        self.top_len = 0;
    }

    #[inline(never)]
    #[cold]
    fn shrink(&mut self) {
        let prev = unsafe { (*self.top).prev };
        unsafe { alloc::dealloc(self.top.cast(), self.layout) };
        self.top = prev;
        if !prev.is_null() {
            self.below -= self.segment_size;
            self.top_len = self.segment_size;
        }
    }

    pub fn push(&mut self, item: E) {
        if self.top.is_null() || self.top_len == self.segment_size {
            self.grow();
        }
        unsafe { self.items(self.top).add(self.top_len).write(item) };
        self.top_len += 1;
    }

    pub fn pop(&mut self) -> Option<E> {
        if self.is_empty() {
            return None;
        }
        self.top_len -= 1;
        let item = unsafe { self.items(self.top).add(self.top_len).read() };
        if self.top_len == 0 {
            self.shrink();
        }
        Some(item)
    }
}

impl<E: Copy> Drop for Stack<E> {
    fn drop(&mut self) {
        while !self.top.is_null() {
            self.top_len = 1;
            self.shrink();
        }
    }
}

/// Number of elements that fit into a 4 KiB segment next to its link word.
pub const fn default_segment_size<E>() -> usize {
    let elem = if size_of::<E>() == 0 { 1 } else { size_of::<E>() };
    let n = (4096 - size_of::<usize>()) / elem;
    if n == 0 {
        1
    } else {
        n
    }
}

#[cfg(test)]
mod tests {
    use super::{default_segment_size, Stack};

    #[test]
    fn push_pop_across_segments() {
        let mut stack = Stack::<usize>::new(4);
        assert!(stack.is_empty());
        for i in 0..10 {
            stack.push(i);
        }
        assert_eq!(stack.size(), 10);
        for i in (0..10).rev() {
            assert_eq!(stack.pop(), Some(i));
            assert_eq!(stack.size(), i);
        }
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn exact_segment_boundary() {
        let mut stack = Stack::<u64>::new(3);
        for i in 0..3 {
            stack.push(i);
        }
        assert_eq!(stack.size(), 3);
        assert_eq!(stack.pop(), Some(2));
        stack.push(7);
        stack.push(8);
        assert_eq!(stack.size(), 4);
        assert_eq!(stack.pop(), Some(8));
        assert_eq!(stack.pop(), Some(7));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), Some(0));
        assert!(stack.is_empty());
    }

    #[test]
    fn unaligned_elements_and_drop_with_entries() {
        let mut stack = Stack::<(u8, u16)>::new(5);
        for i in 0..23u8 {
            stack.push((i, i as u16 * 3));
        }
        assert_eq!(stack.pop(), Some((22, 66)));
        assert_eq!(stack.size(), 22);
    }

    #[test]
    fn default_segment_fits_a_page() {
        assert_eq!(default_segment_size::<u8>(), 4096 - std::mem::size_of::<usize>());
        assert!(default_segment_size::<[u8; 8192]>() == 1);
    }
}
