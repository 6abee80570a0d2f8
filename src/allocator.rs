//! The allocator seam shared by every tier.
//!
//! The dummy bootstrap allocator, individual slab chains, and the top-level
//! shared pool all expose the same three operations, so a consumer (say a
//! growable array) can be parameterized over "which allocator backs me"
//! without knowing which tier it is.

use crate::error::AllocError;

/// Allocation flag bitmask.
pub type AllocFlags = u32;

/// Zero-fill the returned region.
pub const ALLOC_CLEAR_MEMORY: AllocFlags = 0x1;

/// Common allocator surface.
///
/// All three operations work on a pointer *slot*: `alloc` requires the slot
/// to hold null and fills it on success, `free` nulls it on success. On any
/// failure the slot is left unmodified so the caller can diagnose before
/// retrying.
pub trait Allocator {
  /// Allocates `count * size` bytes into `slot`.
  fn alloc(
    &self,
    slot: &mut *mut u8,
    count: usize,
    size: usize,
    flags: AllocFlags,
  ) -> Result<(), AllocError>;

  /// Resizes the allocation in `slot` to `count * size` bytes. The slot may
  /// point at a different address afterwards.
  fn realloc(
    &self,
    slot: &mut *mut u8,
    count: usize,
    size: usize,
    flags: AllocFlags,
  ) -> Result<(), AllocError>;

  /// Releases the allocation in `slot` and nulls it.
  fn free(&self, slot: &mut *mut u8) -> Result<(), AllocError>;
}

// =============================================================================
// Dummy Allocator
// =============================================================================

/// Bootstrap allocator that manages no memory at all: it only validates that
/// the slot already points at storage allocated elsewhere. Used to stand up
/// allocator-parameterized data structures before the real pool exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyAllocator;

impl Allocator for DummyAllocator {
  fn alloc(
    &self,
    slot: &mut *mut u8,
    count: usize,
    size: usize,
    _flags: AllocFlags,
  ) -> Result<(), AllocError> {
    if count == 0 || size == 0 {
      return Err(AllocError::InvalidArgument);
    }
    // The real storage must already be there.
    if slot.is_null() {
      return Err(AllocError::InvalidArgument);
    }
    Ok(())
  }

  fn realloc(
    &self,
    slot: &mut *mut u8,
    count: usize,
    size: usize,
    _flags: AllocFlags,
  ) -> Result<(), AllocError> {
    if slot.is_null() || count == 0 || size == 0 {
      return Err(AllocError::InvalidArgument);
    }
    // Nothing is managed here, so nothing can be resized.
    Err(AllocError::InvalidArgument)
  }

  fn free(&self, slot: &mut *mut u8) -> Result<(), AllocError> {
    if slot.is_null() {
      return Err(AllocError::InvalidArgument);
    }
    *slot = std::ptr::null_mut();
    Ok(())
  }
}
