//! Per-thread heap accounting for the script sandbox.
//!
//! [`CountingAllocator`] wraps the system allocator and keeps a running
//! balance of bytes allocated minus bytes freed on each thread. Scripts run
//! on their own thread, so the interpreter can read that balance to bound
//! the memory a script holds.
//!
//! The balance only moves when `CountingAllocator` is the global allocator:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOCATOR: toolloop::tools::javascript::CountingAllocator =
//!     toolloop::tools::javascript::CountingAllocator;
//! ```
//!
//! Without it, only the size checks made before large allocations apply.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

thread_local! {
    static BALANCE: Cell<isize> = const { Cell::new(0) };
}

/// System allocator that tracks a per-thread allocation balance.
pub struct CountingAllocator;

fn adjust(delta: isize) {
    // The slot is gone while the thread is being torn down.
    let _ = BALANCE.try_with(|balance| balance.set(balance.get().wrapping_add(delta)));
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            adjust(layout.size() as isize);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            adjust(layout.size() as isize);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        adjust(-(layout.size() as isize));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            adjust(new_size as isize - layout.size() as isize);
        }
        new_ptr
    }
}

/// Bytes allocated by the current thread and not yet freed by it.
///
/// Memory freed by another thread is not subtracted, so only differences
/// taken on one thread are meaningful.
pub fn thread_balance() -> isize {
    BALANCE.try_with(Cell::get).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_follows_allocations() {
        let before = thread_balance();
        let buffer = std::hint::black_box(vec![0u8; 1 << 20]);
        assert!(thread_balance() - before >= 1 << 20);
        drop(buffer);
        assert!(thread_balance() - before < 1 << 20);
    }
}
