//! Fixed-cell slab chains with bitmap free lists.
//!
//! A slab is one `SLAB_SIZE` block: a small header, then a bitmap with one
//! bit per cell (1 = occupied), then the cells themselves. A chain links
//! slabs of one cell size; allocation scans the chain for the first zero
//! bit. A bit is claimed with an atomic or on its byte and released with an
//! atomic and, so two threads can never own the same cell no matter how
//! they interleave; the restartable-sequence runner above this layer adds
//! CPU locality (each core works its own chain), not exclusivity. Chain
//! growth uses the same discipline: [`SlabChain::append`] pushes onto the
//! head with a compare-and-swap loop so concurrent growers on different
//! cores never lose a slab.
//!
//! Slabs are always placed on `SLAB_SIZE` boundaries. Masking the low bits
//! of any cell pointer therefore recovers the owning slab, which is how
//! `free`/`realloc` decide ownership without extra bookkeeping.

use std::ptr::{self, null_mut};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};

use crate::allocator::{AllocFlags, Allocator};
use crate::error::AllocError;
use crate::{SLAB_ALIGN_MASK, SLAB_MAGIC, SLAB_SIZE};

#[repr(C)]
pub struct SlabHeader {
  magic: u64,
  next: AtomicPtr<Slab>,
  cell_size: usize,
  /// Hint only: a racing free may clear a bit right after this is set, at
  /// worst costing one extra slab append.
  full: AtomicBool,
}

pub const SLAB_HEADER_SIZE: usize = size_of::<SlabHeader>();
pub const SLAB_CACHE_SIZE: usize = SLAB_SIZE - SLAB_HEADER_SIZE;

/// One fixed-cell block. Lives inside the shared region, never constructed
/// by value: raw buddy blocks are initialized in place and cast.
#[repr(C)]
pub struct Slab {
  header: SlabHeader,
  cache: [u8; SLAB_CACHE_SIZE],
}

const _: () = assert!(size_of::<Slab>() == SLAB_SIZE);
const _: () = assert!(SLAB_HEADER_SIZE == 32);

// =============================================================================
// Bitmap geometry
// =============================================================================

/// Bytes of bitmap needed to track the cells of one slab.
#[inline]
pub(crate) const fn bitmap_len(cell_size: usize) -> usize {
  (SLAB_CACHE_SIZE / cell_size).div_ceil(8)
}

/// Offset of cell `index` inside the cache region.
#[inline]
const fn cell_offset(cell_size: usize, index: usize) -> usize {
  bitmap_len(cell_size) + index * cell_size
}

/// Whether cell `index` lies fully inside the cache region. The bitmap can
/// have trailing bits past the last usable cell, so this is checked before
/// any bit is trusted.
#[inline]
const fn cell_in_slab(cell_size: usize, index: usize) -> bool {
  cell_offset(cell_size, index) + cell_size <= SLAB_CACHE_SIZE
}

/// Atomic view of bitmap byte `i` of `cache`.
#[inline]
unsafe fn bitmap_byte<'a>(cache: *mut u8, i: usize) -> &'a AtomicU8 {
  unsafe { &*(cache.add(i) as *const AtomicU8) }
}

/// Writes a fresh header and an all-zero bitmap into `block`.
unsafe fn init_slab(block: *mut u8, cell_size: usize) -> *mut Slab {
  let slab = block as *mut Slab;
  unsafe {
    let header = &mut (*slab).header;
    header.magic = SLAB_MAGIC;
    header.next = AtomicPtr::new(null_mut());
    header.cell_size = cell_size;
    header.full = AtomicBool::new(false);
    ptr::write_bytes(cache_base(slab), 0, bitmap_len(cell_size));
  }
  slab
}

#[inline]
fn cache_base(slab: *mut Slab) -> *mut u8 {
  unsafe { (slab as *mut u8).add(SLAB_HEADER_SIZE) }
}

impl Slab {
  pub fn cell_size(&self) -> usize {
    self.header.cell_size
  }
}

/// Recovers the slab that would own `ptr`, by masking the address down to
/// the slab alignment boundary. The caller must verify the magic tag before
/// trusting the result.
#[inline]
pub fn slab_of(ptr: *mut u8) -> *mut Slab {
  (ptr as usize & SLAB_ALIGN_MASK) as *mut Slab
}

/// Whether the block at `slab` carries a valid slab header. A mismatch
/// means the memory belongs to the buddy heap.
#[inline]
pub unsafe fn has_magic(slab: *const Slab) -> bool {
  unsafe { ptr::read_volatile(&(*slab).header.magic) == SLAB_MAGIC }
}

// =============================================================================
// Slab Chain
// =============================================================================

/// A chain of equal-cell-size slabs. The handle is the head pointer; the
/// rest of the chain is reached through the slabs' `next` links, which are
/// only ever extended.
pub struct SlabChain {
  head: AtomicPtr<Slab>,
  cell_size: usize,
}

unsafe impl Send for SlabChain {}
unsafe impl Sync for SlabChain {}

impl SlabChain {
  /// Builds a chain over `first_block`, which must be `SLAB_SIZE` bytes at
  /// a `SLAB_SIZE`-aligned address.
  pub unsafe fn create(first_block: *mut u8, cell_size: usize) -> Result<Self, AllocError> {
    if first_block.is_null() || first_block as usize % SLAB_SIZE != 0 {
      return Err(AllocError::InvalidArgument);
    }
    if cell_size == 0 || !cell_in_slab(cell_size, 0) {
      return Err(AllocError::InvalidArgument);
    }
    let slab = unsafe { init_slab(first_block, cell_size) };
    Ok(Self {
      head: AtomicPtr::new(slab),
      cell_size,
    })
  }

  pub fn cell_size(&self) -> usize {
    self.cell_size
  }

  pub fn head(&self) -> *mut Slab {
    self.head.load(Ordering::Acquire)
  }

  /// Set bits across the whole chain, which is the number of live cells.
  #[cfg(test)]
  pub(crate) fn live_cells(&self) -> usize {
    let mut total = 0;
    let mut slab = self.head();
    while !slab.is_null() {
      let cache = cache_base(slab);
      for i in 0..bitmap_len(self.cell_size) {
        total += unsafe { bitmap_byte(cache, i) }.load(Ordering::Acquire).count_ones() as usize;
      }
      slab = unsafe { (*slab).header.next.load(Ordering::Acquire) };
    }
    total
  }

  /// Number of slabs currently linked.
  pub fn slab_count(&self) -> usize {
    let mut n = 0;
    let mut slab = self.head();
    while !slab.is_null() {
      n += 1;
      slab = unsafe { (*slab).header.next.load(Ordering::Acquire) };
    }
    n
  }

  pub(crate) fn contains_slab(&self, target: *mut Slab) -> bool {
    let mut slab = self.head();
    while !slab.is_null() {
      if slab == target {
        return true;
      }
      slab = unsafe { (*slab).header.next.load(Ordering::Acquire) };
    }
    false
  }

  /// Takes the first free cell in the chain. `slot` must hold null and
  /// receives the cell address; the chain's cell size must fit
  /// `count * size`.
  pub fn alloc_cell(
    &self,
    slot: &mut *mut u8,
    count: usize,
    size: usize,
  ) -> Result<(), AllocError> {
    if count == 0 || size == 0 || !slot.is_null() {
      return Err(AllocError::InvalidArgument);
    }
    let total = count.checked_mul(size).ok_or(AllocError::InvalidArgument)?;
    if total > self.cell_size {
      return Err(AllocError::InvalidArgument);
    }

    let bm_len = bitmap_len(self.cell_size);
    let mut slab = self.head();
    while !slab.is_null() {
      unsafe {
        if (*slab).header.magic != SLAB_MAGIC {
          return Err(AllocError::Corrupted);
        }
        if !(*slab).header.full.load(Ordering::Relaxed) {
          let cache = cache_base(slab);
          'bytes: for i in 0..bm_len {
            let byte = bitmap_byte(cache, i);
            loop {
              let b = byte.load(Ordering::Acquire);
              if b == 0xFF {
                continue 'bytes;
              }
              let bit = (!b).trailing_zeros() as usize;
              let index = i * 8 + bit;
              if !cell_in_slab(self.cell_size, index) {
                // Trailing bitmap bits past the last usable cell.
                break 'bytes;
              }
              let mask = 1u8 << bit;
              // The or is the claim: losing the race means another thread
              // owns this cell, so re-read the byte and rescan.
              if byte.fetch_or(mask, Ordering::AcqRel) & mask != 0 {
                continue;
              }

              let cell = cache.add(cell_offset(self.cell_size, index));
              // Re-check the computed address against the slab bounds;
              // a corrupt bitmap must not leak an out-of-slab pointer.
              let end = slab as usize + SLAB_SIZE;
              if cell as usize + self.cell_size > end || (cell as usize) < cache as usize + bm_len
              {
                return Err(AllocError::Corrupted);
              }
              *slot = cell;
              return Ok(());
            }
          }
          (*slab).header.full.store(true, Ordering::Relaxed);
        }
        slab = (*slab).header.next.load(Ordering::Acquire);
      }
    }
    Err(AllocError::OutOfMemory)
  }

  /// In-place resize: succeeds only when the chain's fixed cell size
  /// already covers `count * size`. The caller handles the
  /// alloc-elsewhere/copy/free dance on [`AllocError::TooLarge`].
  pub fn realloc_cell(
    &self,
    slot: &mut *mut u8,
    count: usize,
    size: usize,
  ) -> Result<(), AllocError> {
    if slot.is_null() || count == 0 || size == 0 {
      return Err(AllocError::InvalidArgument);
    }
    let head = self.head();
    if head.is_null() || unsafe { (*head).header.magic } != SLAB_MAGIC {
      return Err(AllocError::Corrupted);
    }
    let total = count.checked_mul(size).ok_or(AllocError::InvalidArgument)?;
    if total > self.cell_size {
      return Err(AllocError::TooLarge);
    }
    Ok(())
  }

  /// Returns `slot`'s cell to `slab` and nulls the slot. `slab` is the
  /// owner recovered via [`slab_of`].
  pub unsafe fn free_in(slab: *mut Slab, slot: &mut *mut u8) -> Result<(), AllocError> {
    if slab.is_null() || slot.is_null() {
      return Err(AllocError::InvalidArgument);
    }
    unsafe {
      if (*slab).header.magic != SLAB_MAGIC {
        return Err(AllocError::Corrupted);
      }
      let cell_size = (*slab).header.cell_size;
      if cell_size == 0 || cell_size > SLAB_CACHE_SIZE {
        return Err(AllocError::Corrupted);
      }

      let bm_len = bitmap_len(cell_size);
      let cache = cache_base(slab);
      let cells_start = cache as usize + bm_len;
      let addr = *slot as usize;
      if addr < cells_start || addr + cell_size > slab as usize + SLAB_SIZE {
        return Err(AllocError::InvalidArgument);
      }
      let offset = addr - cells_start;
      if offset % cell_size != 0 {
        return Err(AllocError::InvalidArgument);
      }
      let index = offset / cell_size;

      let byte = bitmap_byte(cache, index / 8);
      let mask = 1u8 << (index % 8);
      if byte.fetch_and(!mask, Ordering::AcqRel) & mask == 0 {
        return Err(AllocError::DoubleFree);
      }
      (*slab).header.full.store(false, Ordering::Relaxed);
    }
    *slot = null_mut();
    Ok(())
  }

  /// Links `new_block` in as the chain's new head slab. Lock-free: racing
  /// appends from different cores retry the compare-and-swap, and readers
  /// walking the chain concurrently only ever see fully linked slabs.
  pub unsafe fn append(&self, new_block: *mut u8) -> Result<*mut Slab, AllocError> {
    if new_block.is_null() || new_block as usize % SLAB_SIZE != 0 {
      return Err(AllocError::InvalidArgument);
    }
    let new_slab = new_block as *mut Slab;
    if self.contains_slab(new_slab) {
      return Err(AllocError::InvalidArgument);
    }

    unsafe { init_slab(new_block, self.cell_size) };

    loop {
      let head = self.head.load(Ordering::Acquire);
      unsafe { (*new_slab).header.next.store(head, Ordering::Relaxed) };
      if self
        .head
        .compare_exchange_weak(head, new_slab, Ordering::Release, Ordering::Acquire)
        .is_ok()
      {
        return Ok(new_slab);
      }
    }
  }
}

impl Allocator for SlabChain {
  fn alloc(
    &self,
    slot: &mut *mut u8,
    count: usize,
    size: usize,
    _flags: AllocFlags,
  ) -> Result<(), AllocError> {
    self.alloc_cell(slot, count, size)
  }

  fn realloc(
    &self,
    slot: &mut *mut u8,
    count: usize,
    size: usize,
    _flags: AllocFlags,
  ) -> Result<(), AllocError> {
    self.realloc_cell(slot, count, size)
  }

  fn free(&self, slot: &mut *mut u8) -> Result<(), AllocError> {
    unsafe { Self::free_in(slab_of(*slot), slot) }
  }
}
