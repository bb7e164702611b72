//! The allocator seam.
//!
//! Every heap object (strings, tables, closures, classes, table pair arrays)
//! is allocated through a [`Heap`], which wraps a user-replaceable
//! [`Allocator`] and counts live allocations. The count is what lets tests
//! assert that closing a state releases everything it ever allocated.
//!
//! Growable Rust-side buffers (instruction vectors, constant pools, the
//! frame and value stacks) are ordinary `Vec`s and do not go through the
//! heap; the heap only serves fixed-layout object blocks.

use std::alloc::Layout;
use std::cell::Cell;
use std::rc::Rc;

/// A pluggable allocator for object memory.
///
/// # Safety
///
/// Implementations must return either a null pointer or a block valid for
/// `layout`; `dealloc` must only be called with a pointer previously
/// returned by `alloc` on the same allocator with the same layout.
pub unsafe trait Allocator {
    /// Allocates a block for `layout`, or returns null on exhaustion.
    fn alloc(&self, layout: Layout) -> *mut u8;

    /// Releases a block previously returned by [`Allocator::alloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this allocator with `layout`.
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout);
}

/// The default allocator over `std::alloc`.
pub struct SystemAllocator;

unsafe impl Allocator for SystemAllocator {
    fn alloc(&self, layout: Layout) -> *mut u8 {
        debug_assert!(layout.size() > 0);
        unsafe { std::alloc::alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr, layout) }
    }
}

struct HeapInner {
    allocator: Box<dyn Allocator>,
    live: Cell<usize>,
}

/// Shared handle to the object heap.
///
/// Cloning is cheap; all clones share the same allocator and live-block
/// counter.
#[derive(Clone)]
pub struct Heap {
    inner: Rc<HeapInner>,
}

impl Heap {
    /// A heap over the system allocator.
    pub fn new() -> Heap {
        Heap::with_allocator(Box::new(SystemAllocator))
    }

    /// A heap over a caller-provided allocator.
    pub fn with_allocator(allocator: Box<dyn Allocator>) -> Heap {
        Heap {
            inner: Rc::new(HeapInner {
                allocator,
                live: Cell::new(0),
            }),
        }
    }

    /// Allocates a block, or returns null when the allocator is exhausted.
    pub fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.allocator.alloc(layout);
        if !ptr.is_null() {
            self.inner.live.set(self.inner.live.get() + 1);
        }
        ptr
    }

    /// Releases a block previously returned by [`Heap::alloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this heap with `layout` and must
    /// not be used afterwards.
    pub unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        debug_assert!(!ptr.is_null());
        debug_assert!(self.inner.live.get() > 0);
        self.inner.live.set(self.inner.live.get() - 1);
        unsafe { self.inner.allocator.dealloc(ptr, layout) }
    }

    /// Number of blocks currently allocated and not yet released.
    pub fn live_allocations(&self) -> usize {
        self.inner.live.get()
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_counts_live_blocks() {
        let heap = Heap::new();
        let layout = Layout::from_size_align(64, 8).unwrap();
        let a = heap.alloc(layout);
        let b = heap.alloc(layout);
        assert_eq!(heap.live_allocations(), 2);
        unsafe {
            heap.dealloc(a, layout);
            heap.dealloc(b, layout);
        }
        assert_eq!(heap.live_allocations(), 0);
    }

    #[test]
    fn clones_share_the_counter() {
        let heap = Heap::new();
        let clone = heap.clone();
        let layout = Layout::from_size_align(16, 8).unwrap();
        let p = clone.alloc(layout);
        assert_eq!(heap.live_allocations(), 1);
        unsafe { heap.dealloc(p, layout) };
        assert_eq!(clone.live_allocations(), 0);
    }
}
