#![allow(clippy::missing_safety_doc)]

//! Multi-tier shared-memory allocator.
//!
//! Small and medium allocations are served lock-free from per-core slab
//! chains under a restartable-sequence critical section; large allocations
//! and slab-chain growth go through a semaphore-guarded buddy heap. The
//! whole pool lives in one growable memfd-backed region so cooperating
//! processes can map it and exchange pointers.
//!
//! Entry point is [`SharedPool::init`]; everything else hangs off the
//! returned handle.

#[cfg(not(target_os = "linux"))]
compile_error!("shmalloc requires Linux (rseq, memfd_create, SysV semaphores)");

#[cfg(not(target_pointer_width = "64"))]
compile_error!("shmalloc supports only 64-bit targets");

pub mod allocator;
pub mod buddy;
pub mod error;
pub mod pool;
pub mod rseq;
pub mod shm;
pub mod slab;

pub use allocator::{ALLOC_CLEAR_MEMORY, AllocFlags, Allocator, DummyAllocator};
pub use error::AllocError;
pub use pool::SharedPool;

// =============================================================================
// Constants
// =============================================================================

/// Upper bound on the pool's address range: 2^34 bytes (16GiB). Most systems
/// will hit out-of-memory long before the range is exhausted.
pub const MAX_RANGE_EXPONENT: u32 = 34;

/// Smallest buddy block is one slab. The buddy heap only hands out slabs and
/// large blocks, so finer granularity would just inflate its metadata.
pub const MIN_BLOCK_EXPONENT: u32 = 15;

/// Size of one slab, which is also the alignment every slab is allocated at.
/// Masking the low bits of any interior pointer yields the slab base.
pub const SLAB_SIZE: usize = 1 << MIN_BLOCK_EXPONENT;

pub const SLAB_ALIGN_MASK: usize = !(SLAB_SIZE - 1);

/// Identifies a valid slab header when recovering ownership from a raw
/// pointer. Memory handed out by the buddy heap carries no header, so a
/// mismatch here means "buddy-owned".
pub const SLAB_MAGIC: u64 = 0xABAB_ABAB_ABAB_ABAB;

/// Ascending cell sizes, one slab chain per (core, class) pair.
pub const SIZE_CLASSES: [usize; 9] = [32, 64, 128, 255, 510, 1020, 2040, 4080, 8180];

pub const SIZE_CLASS_COUNT: usize = SIZE_CLASSES.len();

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const fn classes_ascending() -> bool {
  let mut i = 1;
  while i < SIZE_CLASS_COUNT {
    if SIZE_CLASSES[i] <= SIZE_CLASSES[i - 1] {
      return false;
    }
    i += 1;
  }
  true
}

const _: () = assert!(SLAB_SIZE.is_power_of_two());
const _: () = assert!(MAX_RANGE_EXPONENT > MIN_BLOCK_EXPONENT);
const _: () = assert!(classes_ascending());
const _: () = assert!(SIZE_CLASSES[0] > 0);
const _: () = assert!(SIZE_CLASSES[SIZE_CLASS_COUNT - 1] < SLAB_SIZE / 2);

// =============================================================================
// Size Classes
// =============================================================================

/// Returns the index of the smallest class whose cell size fits `size`, or
/// `None` when the request exceeds the largest class and must go straight to
/// the buddy heap.
#[inline]
pub fn size_class(size: usize) -> Option<usize> {
  SIZE_CLASSES.iter().position(|&cell| size <= cell)
}
