//! Growable shared-memory backing store.
//!
//! An anonymous memfd is mapped once over a fixed, slab-aligned virtual
//! range of `max_size` bytes; only the first `committed()` bytes are backed
//! by the file at any time. Growing is a single `ftruncate`, so the mapping
//! never moves and pointers into the region stay valid for the lifetime of
//! the pool. The file descriptor can be handed to a cooperating process so
//! it can map the same pool.

use std::ptr::null_mut;

use crate::SLAB_SIZE;
use crate::buddy::MemorySource;
use crate::error::AllocError;

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must
/// be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

pub struct SharedMemoryFile {
  fd: libc::c_int,
  /// Slab-aligned base of the file mapping.
  base: *mut u8,
  /// Raw reservation handed back by mmap; `base` lives inside it.
  reserve: *mut u8,
  reserve_len: usize,
  max_size: usize,
  committed: usize,
  closed: bool,
}

unsafe impl Send for SharedMemoryFile {}

impl SharedMemoryFile {
  /// Creates the backing file and maps `max_size` virtual bytes of it at a
  /// slab-aligned address. Nothing is physically backed until
  /// [`set_committed`] grows the file.
  ///
  /// [`set_committed`]: MemorySource::set_committed
  pub fn create(max_size: usize) -> Result<Self, AllocError> {
    if max_size == 0 || max_size % SLAB_SIZE != 0 {
      return Err(AllocError::InvalidArgument);
    }

    let fd = unsafe { libc::memfd_create(c"shared memory pool".as_ptr(), 0) };
    if fd < 0 {
      return Err(AllocError::last_os_error());
    }

    // Over-reserve so the file view can start on a slab boundary, then map
    // the file MAP_FIXED inside the reservation. Pointer-to-slab recovery
    // masks low bits, so the alignment is load-bearing.
    let reserve_len = max_size + SLAB_SIZE;
    let reserve = unsafe {
      libc::mmap(
        null_mut(),
        reserve_len,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
      )
    };
    if reserve == libc::MAP_FAILED {
      let err = AllocError::last_os_error();
      unsafe { libc::close(fd) };
      return Err(err);
    }

    let base = align_up(reserve as usize, SLAB_SIZE) as *mut u8;
    let mapped = unsafe {
      libc::mmap(
        base.cast(),
        max_size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_FIXED | libc::MAP_NORESERVE,
        fd,
        0,
      )
    };
    if mapped == libc::MAP_FAILED || mapped != base.cast() {
      let err = AllocError::last_os_error();
      unsafe {
        libc::munmap(reserve, reserve_len);
        libc::close(fd);
      }
      return Err(err);
    }

    Ok(Self {
      fd,
      base,
      reserve: reserve.cast(),
      reserve_len,
      max_size,
      committed: 0,
      closed: false,
    })
  }

  /// The file descriptor of the backing memfd, for handing the region to a
  /// cooperating process.
  pub fn fd(&self) -> libc::c_int {
    self.fd
  }

  pub fn max_size(&self) -> usize {
    self.max_size
  }

  /// Unmaps the region and closes the backing file. Pointers into the
  /// region are invalid afterwards.
  pub fn close(mut self) -> Result<(), AllocError> {
    self.teardown()
  }

  fn teardown(&mut self) -> Result<(), AllocError> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;

    let mut failed = false;
    unsafe {
      failed |= libc::munmap(self.reserve.cast(), self.reserve_len) != 0;
      failed |= libc::close(self.fd) != 0;
    }
    if failed {
      return Err(AllocError::last_os_error());
    }
    Ok(())
  }
}

impl Drop for SharedMemoryFile {
  fn drop(&mut self) {
    if let Err(e) = self.teardown() {
      log::warn!("shared memory teardown failed: {e}");
    }
  }
}

impl MemorySource for SharedMemoryFile {
  fn base(&self) -> *mut u8 {
    self.base
  }

  fn committed(&self) -> usize {
    self.committed
  }

  fn set_committed(&mut self, bytes: usize) -> Result<(), AllocError> {
    if bytes > self.max_size {
      return Err(AllocError::OutOfMemory);
    }
    if unsafe { libc::ftruncate(self.fd, bytes as libc::off_t) } != 0 {
      return Err(AllocError::last_os_error());
    }
    self.committed = bytes;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn create_yields_aligned_uncommitted_region() {
    let shm = SharedMemoryFile::create(64 * SLAB_SIZE).unwrap();
    assert_eq!(shm.base() as usize % SLAB_SIZE, 0);
    assert_eq!(shm.committed(), 0);
    assert_eq!(shm.max_size(), 64 * SLAB_SIZE);
    assert!(shm.fd() >= 0);
    shm.close().unwrap();
  }

  #[test]
  fn committed_bytes_are_readable_and_writable() {
    let mut shm = SharedMemoryFile::create(64 * SLAB_SIZE).unwrap();
    shm.set_committed(2 * SLAB_SIZE).unwrap();

    unsafe {
      let base = shm.base();
      base.write(0xAA);
      base.add(2 * SLAB_SIZE - 1).write(0xBB);
      assert_eq!(base.read(), 0xAA);
      assert_eq!(base.add(2 * SLAB_SIZE - 1).read(), 0xBB);
    }
    shm.close().unwrap();
  }

  #[test]
  fn grow_and_shrink_track_committed() {
    let mut shm = SharedMemoryFile::create(64 * SLAB_SIZE).unwrap();
    shm.set_committed(SLAB_SIZE).unwrap();
    assert_eq!(shm.committed(), SLAB_SIZE);
    shm.set_committed(8 * SLAB_SIZE).unwrap();
    assert_eq!(shm.committed(), 8 * SLAB_SIZE);
    shm.set_committed(SLAB_SIZE).unwrap();
    assert_eq!(shm.committed(), SLAB_SIZE);
    shm.close().unwrap();
  }

  #[test]
  fn committed_never_exceeds_max() {
    let mut shm = SharedMemoryFile::create(4 * SLAB_SIZE).unwrap();
    assert!(matches!(
      shm.set_committed(5 * SLAB_SIZE),
      Err(AllocError::OutOfMemory)
    ));
    shm.close().unwrap();
  }

  #[test]
  fn rejects_zero_or_unaligned_max() {
    assert!(SharedMemoryFile::create(0).is_err());
    assert!(SharedMemoryFile::create(SLAB_SIZE + 1).is_err());
  }
}
