//! Power-of-two ("buddy") heap over the backing store.
//!
//! Blocks are carved from a single address range whose committed size grows
//! on demand through the pluggable [`MemorySource`]. Free blocks are kept on
//! one intrusive list per order; freeing coalesces with the buddy block
//! when both halves are free. Every block base is naturally aligned to its
//! own size, which the pool relies on for pointer-ownership recovery.
//!
//! The heap has no internal locking: the pool serializes all access through
//! its cross-process semaphore.

use std::ptr::null_mut;

use crate::error::AllocError;

/// Committed-size callback pair the heap grows its backing range through.
pub trait MemorySource {
  /// Base address of the managed range. Must stay fixed and be aligned to
  /// the heap's minimum block size.
  fn base(&self) -> *mut u8;

  /// Bytes currently backed by real memory.
  fn committed(&self) -> usize;

  /// Grows (or shrinks) the backed prefix of the range.
  fn set_committed(&mut self, bytes: usize) -> Result<(), AllocError>;
}

#[derive(Clone, Copy, Debug)]
pub struct BuddyConfig {
  /// log2 of the full address range the heap may use.
  pub range_exponent: u32,
  /// log2 of the smallest block the heap will hand out.
  pub min_block_exponent: u32,
}

/// Intrusive free-list node, stored inside the free block itself.
#[repr(C)]
struct FreeBlock {
  next: *mut FreeBlock,
}

/// Marks a minimum-block index that is not the base of a live allocation.
const ORDER_NONE: u8 = 0xFF;

pub struct BuddyHeap<S> {
  source: S,
  min_block_exponent: u32,
  /// Number of orders; order `o` blocks span `1 << (min_block_exponent + o)`
  /// bytes.
  order_count: u32,
  /// Head of the free list per order.
  free_lists: Vec<*mut FreeBlock>,
  /// Per minimum-block index: the order of the live allocation based there,
  /// or [`ORDER_NONE`].
  orders: Box<[u8]>,
  /// Minimum-block units carved from the range so far. Everything at or
  /// beyond the frontier is untouched address space.
  frontier: usize,
  /// Total range size in minimum-block units.
  range_units: usize,
  alloc_count: u64,
}

unsafe impl<S: Send> Send for BuddyHeap<S> {}

impl<S: MemorySource> BuddyHeap<S> {
  pub fn new(source: S, config: BuddyConfig) -> Result<Self, AllocError> {
    let BuddyConfig {
      range_exponent,
      min_block_exponent,
    } = config;

    if range_exponent <= min_block_exponent || range_exponent >= usize::BITS {
      return Err(AllocError::InvalidArgument);
    }
    let order_count = range_exponent - min_block_exponent + 1;
    if order_count as usize >= ORDER_NONE as usize {
      return Err(AllocError::InvalidArgument);
    }
    if source.base().is_null() || source.base() as usize % (1usize << min_block_exponent) != 0 {
      return Err(AllocError::InvalidArgument);
    }

    let range_units = 1usize << (range_exponent - min_block_exponent);
    Ok(Self {
      source,
      min_block_exponent,
      order_count,
      free_lists: vec![null_mut(); order_count as usize],
      orders: vec![ORDER_NONE; range_units].into_boxed_slice(),
      frontier: 0,
      range_units,
      alloc_count: 0,
    })
  }

  /// Tears the heap down and hands the backing source back to the caller.
  pub fn close(self) -> S {
    self.source
  }

  pub fn base(&self) -> *mut u8 {
    self.source.base()
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  /// Successful allocations so far.
  pub fn alloc_count(&self) -> u64 {
    self.alloc_count
  }

  /// Bytes carved from the range so far. Everything below this offset is
  /// committed backing memory; every block ever handed out lives below it.
  pub fn carved_bytes(&self) -> usize {
    self.frontier << self.min_block_exponent
  }

  #[inline]
  fn block_bytes(&self, order: u32) -> usize {
    1usize << (self.min_block_exponent + order)
  }

  #[inline]
  fn idx_to_ptr(&self, idx: usize) -> *mut u8 {
    unsafe { self.source.base().add(idx << self.min_block_exponent) }
  }

  /// Smallest order whose block fits `size`.
  fn order_for(&self, size: usize) -> Result<u32, AllocError> {
    // Checked early: next_power_of_two overflows for sizes past 2^63.
    if size > self.range_units << self.min_block_exponent {
      return Err(AllocError::OutOfMemory);
    }
    let min_block = self.block_bytes(0);
    let needed = size.max(min_block).next_power_of_two();
    let order = needed.trailing_zeros() - self.min_block_exponent;
    if order >= self.order_count {
      return Err(AllocError::OutOfMemory);
    }
    Ok(order)
  }

  fn push_free(&mut self, idx: usize, order: u32) {
    let node = self.idx_to_ptr(idx) as *mut FreeBlock;
    unsafe { (*node).next = self.free_lists[order as usize] };
    self.free_lists[order as usize] = node;
  }

  fn pop_free(&mut self, order: u32) -> Option<usize> {
    let node = self.free_lists[order as usize];
    if node.is_null() {
      return None;
    }
    self.free_lists[order as usize] = unsafe { (*node).next };
    Some((node as usize - self.source.base() as usize) >> self.min_block_exponent)
  }

  /// Unlinks the block at `idx` from the free list of `order`, if present.
  fn try_remove_free(&mut self, idx: usize, order: u32) -> bool {
    let target = self.idx_to_ptr(idx) as *mut FreeBlock;
    let head = self.free_lists[order as usize];

    if head == target {
      self.free_lists[order as usize] = unsafe { (*target).next };
      return true;
    }

    let mut prev = head;
    while !prev.is_null() {
      let next = unsafe { (*prev).next };
      if next == target {
        unsafe { (*prev).next = (*target).next };
        return true;
      }
      prev = next;
    }
    false
  }

  /// Allocates a block of at least `size` bytes. Blocks are aligned to
  /// their (power-of-two) size relative to the range base.
  pub fn alloc(&mut self, size: usize) -> Result<*mut u8, AllocError> {
    if size == 0 {
      return Err(AllocError::InvalidArgument);
    }
    let order = self.order_for(size)?;
    let idx = self.take_block(order)?;

    self.orders[idx] = order as u8;
    self.alloc_count += 1;
    Ok(self.idx_to_ptr(idx))
  }

  fn take_block(&mut self, order: u32) -> Result<usize, AllocError> {
    if let Some(idx) = self.pop_free(order) {
      return Ok(idx);
    }

    // Split the nearest larger free block, pushing the upper halves back.
    for o in order + 1..self.order_count {
      if let Some(idx) = self.pop_free(o) {
        for split in (order..o).rev() {
          self.push_free(idx + (1usize << split), split);
        }
        return Ok(idx);
      }
    }

    self.extend(order)
  }

  /// Carves a fresh block of `order` from beyond the frontier, growing the
  /// committed size of the backing range to cover it.
  fn extend(&mut self, order: u32) -> Result<usize, AllocError> {
    let need_units = 1usize << order;
    let aligned = self.frontier.next_multiple_of(need_units);
    let end = aligned + need_units;
    if end > self.range_units {
      return Err(AllocError::OutOfMemory);
    }

    // Commit before touching the gap blocks: their free-list nodes live in
    // the new memory.
    let end_bytes = end << self.min_block_exponent;
    if end_bytes > self.source.committed() {
      self.source.set_committed(end_bytes)?;
    }

    // The alignment gap is returned as a run of maximal power-of-two blocks.
    let mut f = self.frontier;
    while f < aligned {
      let align_order = f.trailing_zeros().min(usize::BITS - 1);
      let fit_order = (usize::BITS - 1) - (aligned - f).leading_zeros();
      self.push_free(f, align_order.min(fit_order));
      f += 1usize << align_order.min(fit_order);
    }

    self.frontier = end;
    Ok(aligned)
  }

  /// Frees a block previously returned by [`alloc`], coalescing with its
  /// buddy where possible.
  ///
  /// [`alloc`]: BuddyHeap::alloc
  pub fn free(&mut self, ptr: *mut u8) -> Result<(), AllocError> {
    let mut idx = self.index_of(ptr)?;
    let recorded = self.orders[idx];
    if recorded == ORDER_NONE {
      // Inside the carved range but not a live block base: either the
      // middle of a block or a block that is already free.
      return if idx < self.frontier {
        Err(AllocError::DoubleFree)
      } else {
        Err(AllocError::InvalidArgument)
      };
    }
    let mut order = recorded as u32;
    if order >= self.order_count {
      return Err(AllocError::Corrupted);
    }
    self.orders[idx] = ORDER_NONE;

    // Climb orders while the buddy half is free too.
    while order + 1 < self.order_count {
      let buddy = idx ^ (1usize << order);
      if buddy + (1usize << order) > self.frontier {
        break;
      }
      if !self.try_remove_free(buddy, order) {
        break;
      }
      idx = idx.min(buddy);
      order += 1;
    }

    self.push_free(idx, order);
    Ok(())
  }

  /// Size in bytes of the live block based at `ptr`.
  pub fn block_size(&self, ptr: *mut u8) -> Result<usize, AllocError> {
    let idx = self.index_of(ptr)?;
    let order = self.orders[idx];
    if order == ORDER_NONE {
      return Err(AllocError::InvalidArgument);
    }
    Ok(self.block_bytes(order as u32))
  }

  fn index_of(&self, ptr: *mut u8) -> Result<usize, AllocError> {
    let base = self.source.base() as usize;
    let addr = ptr as usize;
    if ptr.is_null() || addr < base {
      return Err(AllocError::InvalidArgument);
    }
    let offset = addr - base;
    if offset >= self.range_units << self.min_block_exponent {
      return Err(AllocError::InvalidArgument);
    }
    if offset & (self.block_bytes(0) - 1) != 0 {
      return Err(AllocError::InvalidArgument);
    }
    Ok(offset >> self.min_block_exponent)
  }
}
