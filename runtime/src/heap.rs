//! Budgeted region heap backing every dynamic runtime object.
//!
//! One page-aligned region per logical worker, carved out by a bump
//! watermark with a head-inserted free list for reuse. Signals,
//! payload buffers, mailbox rings, and table backbones all draw their
//! charge from this region and return it on drop, so heap statistics
//! account for the whole runtime.
//!
//! The allocator is first-fit and never splits blocks: a reused block
//! is charged at its full size, which keeps `used` exact across an
//! allocate/free round trip. Allocation fails with
//! [`RuntimeError::AllocFailed`] when the watermark would cross the
//! region end and no freed block fits.

use crate::{Result, RuntimeError};
use std::cell::RefCell;

/// Default region budget when the heap is touched before an explicit
/// [`init`].
pub const DEFAULT_HEAP_BYTES: usize = 16 * 1024 * 1024;

const PAGE_SIZE: usize = 4096;
const ALIGNMENT: usize = 8;
/// Freed blocks must be able to carry a free-list header.
const MIN_BLOCK: usize = 16;

/// A charge against the heap region: an aligned offset and size.
///
/// Blocks are handed back with [`free`]; dropping a block without
/// freeing it leaks its charge for the lifetime of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    offset: usize,
    size: usize,
}

impl Block {
    /// Charged size in bytes (aligned, never smaller than requested).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of the block within the region.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Point-in-time heap accounting. `used <= peak <= total` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub used: usize,
    pub peak: usize,
    pub total: usize,
}

struct Heap {
    total: usize,
    watermark: usize,
    used: usize,
    peak: usize,
    /// Head-inserted free list; the head lives at the end of the vec.
    free_list: Vec<Block>,
}

impl Heap {
    fn new(budget: usize) -> Self {
        let budget = if budget == 0 {
            DEFAULT_HEAP_BYTES
        } else {
            budget
        };
        // Page-align the region the way the backing reservation would.
        let total = (budget + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        Self {
            total,
            watermark: 0,
            used: 0,
            peak: 0,
            free_list: Vec::new(),
        }
    }

    fn allocate(&mut self, bytes: usize) -> Result<Block> {
        if bytes == 0 {
            return Err(RuntimeError::AllocFailed {
                requested: 0,
                free: self.total - self.watermark,
            });
        }

        let bytes = ((bytes + ALIGNMENT - 1) & !(ALIGNMENT - 1)).max(MIN_BLOCK);

        // First fit, searching from the free-list head.
        if let Some(i) = self.free_list.iter().rposition(|b| b.size >= bytes) {
            let block = self.free_list.remove(i);
            self.used += block.size;
            self.peak = self.peak.max(self.used);
            return Ok(block);
        }

        // Bump allocate within the region.
        if self.watermark + bytes > self.total {
            return Err(RuntimeError::AllocFailed {
                requested: bytes,
                free: self.total - self.watermark,
            });
        }
        let block = Block {
            offset: self.watermark,
            size: bytes,
        };
        self.watermark += bytes;
        self.used += bytes;
        self.peak = self.peak.max(self.used);
        Ok(block)
    }

    fn free(&mut self, block: Block) {
        debug_assert!(self.used >= block.size);
        self.used -= block.size;
        self.free_list.push(block);
    }
}

thread_local! {
    static HEAP: RefCell<Option<Heap>> = const { RefCell::new(None) };
}

/// Initialize the heap with an explicit region budget.
///
/// Returns `false` if the heap was already initialized (the existing
/// region is kept, matching lazy auto-init semantics).
pub fn init(budget: usize) -> bool {
    HEAP.with(|h| {
        let mut heap = h.borrow_mut();
        if heap.is_some() {
            return false;
        }
        *heap = Some(Heap::new(budget));
        tracing::debug!(
            total = heap.as_ref().map(|h| h.total).unwrap_or(0),
            "heap region reserved"
        );
        true
    })
}

fn with_heap<T>(f: impl FnOnce(&mut Heap) -> T) -> T {
    HEAP.with(|h| {
        let mut heap = h.borrow_mut();
        let heap = heap.get_or_insert_with(|| Heap::new(0));
        f(heap)
    })
}

/// Allocate `bytes` from the region, rounded up to eight-byte
/// alignment. Lazily initializes the heap with the default budget.
pub fn allocate(bytes: usize) -> Result<Block> {
    with_heap(|h| h.allocate(bytes))
}

/// Return a block's charge to the region free list.
pub fn free(block: Block) {
    with_heap(|h| h.free(block));
}

/// Bytes currently charged.
pub fn used() -> usize {
    with_heap(|h| h.used)
}

/// High-water mark of charged bytes.
pub fn peak() -> usize {
    with_heap(|h| h.peak)
}

/// Region budget in bytes.
pub fn total() -> usize {
    with_heap(|h| h.total)
}

/// Snapshot of the heap accounting.
pub fn stats() -> HeapStats {
    with_heap(|h| HeapStats {
        used: h.used,
        peak: h.peak,
        total: h.total,
    })
}
