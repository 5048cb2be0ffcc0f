//! Arena allocator backing decoded messages. Everything decoded in one call
//! lives here and is freed all at once. The arena is a non-generic type so
//! the decoder stays monomorphic; callers keep full control over the
//! backing allocator through a `dyn Allocator` reference, which is cheap
//! because small allocations are batched into sporadic large blocks.
//!
//! Beyond plain allocation the fast decoder relies on two raw contracts:
//! direct access to the bump cursor (`head_ptr`/`bump`) for the fixed-width
//! string copies and the ceiling path of sub-message creation, and
//! `realloc` for doubling repeated arrays. The cursor is always 8-aligned;
//! every allocation size is rounded up to 8 to keep it that way.

use std::alloc::{Allocator, Layout};
use std::ptr;
use std::ptr::NonNull;

pub struct Arena<'a> {
    current: *mut MemBlock,
    head: *mut u8,
    end: *mut u8,
    allocations: usize,
    allocator: &'a dyn Allocator,
}

// A block of contiguous memory obtained from the allocator.
struct MemBlock {
    prev: *mut MemBlock,
    layout: Layout, // layout of the entire block including this header
}

const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;
const MAX_BLOCK_SIZE: usize = 1024 * 1024;

const fn round_up(n: usize) -> usize {
    (n + 7) & !7
}

impl<'a> Arena<'a> {
    pub fn new(allocator: &'a dyn Allocator) -> Self {
        Self {
            current: ptr::null_mut(),
            head: ptr::null_mut(),
            end: ptr::null_mut(),
            allocations: 0,
            allocator,
        }
    }

    /// Allocates `n` bytes, 8-aligned. Returns `None` when the backing
    /// allocator declines.
    #[inline]
    pub fn try_alloc_bytes(&mut self, n: usize) -> Option<*mut u8> {
        // Zero-sized requests still get a unique non-null pointer.
        let n = round_up(n.max(1));
        self.allocations += 1;
        let head = self.head;
        if std::hint::likely(self.end as usize - head as usize >= n) {
            self.head = unsafe { head.add(n) };
            return Some(head);
        }
        self.alloc_outlined(n)
    }

    /// Grows an allocation. Extends in place when `ptr..ptr+old` is the most
    /// recent allocation and the block has room; otherwise allocates fresh
    /// and copies.
    pub fn try_realloc(&mut self, p: *mut u8, old: usize, new: usize) -> Option<*mut u8> {
        debug_assert!(new >= old);
        let old_rounded = round_up(old);
        let new_rounded = round_up(new);
        self.allocations += 1;
        unsafe {
            if p.add(old_rounded) == self.head
                && self.end as usize - p as usize >= new_rounded
            {
                self.head = p.add(new_rounded);
                return Some(p);
            }
        }
        self.allocations -= 1; // alloc_outlined path counts once via try_alloc_bytes
        let fresh = self.try_alloc_bytes(new)?;
        unsafe {
            ptr::copy_nonoverlapping(p, fresh, old);
        }
        Some(fresh)
    }

    /// Bytes left in the current block.
    #[inline(always)]
    pub(crate) fn remaining(&self) -> usize {
        self.end as usize - self.head as usize
    }

    #[inline(always)]
    pub(crate) fn has(&self, n: usize) -> bool {
        self.remaining() >= n
    }

    #[inline(always)]
    pub(crate) fn head_ptr(&self) -> *mut u8 {
        self.head
    }

    /// Advances the bump cursor without bookkeeping. The caller must have
    /// checked `has(n)` and keep `n` a multiple of 8.
    #[inline(always)]
    pub(crate) unsafe fn bump(&mut self, n: usize) {
        debug_assert!(self.has(n));
        debug_assert_eq!(n % 8, 0);
        self.head = self.head.add(n);
    }

    /// Arena-level allocation count (block-internal bumps excluded). Used to
    /// observe repeated-array growth behaviour.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Total bytes obtained from the backing allocator.
    pub fn bytes_allocated(&self) -> usize {
        let mut total = 0;
        let mut current = self.current;
        unsafe {
            while !current.is_null() {
                total += (*current).layout.size();
                current = (*current).prev;
            }
        }
        total
    }

    /// Slow path: the current block is full. Never inlined to keep the bump
    /// path small.
    #[inline(never)]
    fn alloc_outlined(&mut self, n: usize) -> Option<*mut u8> {
        const SIGNIFICANT_SPACE_THRESHOLD: usize = 512;

        if self.remaining() >= SIGNIFICANT_SPACE_THRESHOLD {
            // Plenty of free space left, so this is a large allocation. Give
            // it a dedicated block and keep the current one for future small
            // allocations.
            self.alloc_dedicated(n)
        } else {
            self.allocate_new_block(n)
        }
    }

    fn allocate_new_block(&mut self, n: usize) -> Option<*mut u8> {
        let header = round_up(std::mem::size_of::<MemBlock>());
        let grow = if self.current.is_null() {
            DEFAULT_BLOCK_SIZE
        } else {
            let current_block_size = unsafe { (*self.current).layout.size() };
            (current_block_size * 2).min(MAX_BLOCK_SIZE)
        };
        let total = header + n + grow;
        let layout = Layout::from_size_align(total, 8).ok()?;

        let block = self.allocator.allocate(layout).ok()?.as_ptr() as *mut MemBlock;
        unsafe {
            (*block).prev = self.current;
            (*block).layout = layout;

            let base = (block as *mut u8).add(header);
            self.current = block;
            self.head = base.add(n);
            self.end = (block as *mut u8).add(layout.size());
            Some(base)
        }
    }

    /// Large allocation that bypasses the bump region entirely.
    fn alloc_dedicated(&mut self, n: usize) -> Option<*mut u8> {
        let header = round_up(std::mem::size_of::<MemBlock>());
        let layout = Layout::from_size_align(header + n, 8).ok()?;

        let block = self.allocator.allocate(layout).ok()?.as_ptr() as *mut MemBlock;
        unsafe {
            (*block).layout = layout;
            if !self.current.is_null() {
                // Insert behind the active block so bump state is untouched.
                (*block).prev = (*self.current).prev;
                (*self.current).prev = block;
            } else {
                (*block).prev = ptr::null_mut();
                self.current = block;
            }
            Some((block as *mut u8).add(header))
        }
    }
}

impl<'a> Drop for Arena<'a> {
    fn drop(&mut self) {
        unsafe {
            let mut current = self.current;
            while !current.is_null() {
                let prev = (*current).prev;
                let layout = (*current).layout;
                let p = NonNull::new_unchecked(current as *mut u8);
                self.allocator.deallocate(p, layout);
                current = prev;
            }
        }
    }
}

// Safety: Arena can be sent between threads if the allocator supports it.
unsafe impl<'a> Send for Arena<'a> where &'a dyn Allocator: Send {}

/// Marks `len` bytes at `p` as unreadable for external memory checkers.
/// A no-op without such a collaborator; the call sites document which
/// bump-carved bytes are headroom rather than live data.
#[inline(always)]
pub(crate) fn poison(p: *mut u8, len: usize) {
    let _ = (p, len);
}

#[inline(always)]
pub(crate) fn unpoison(p: *mut u8, len: usize) {
    let _ = (p, len);
}
