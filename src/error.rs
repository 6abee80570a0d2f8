use std::fmt;
use std::io;

/// Error taxonomy for the whole crate. Structural-invariant violations
/// (magic tag, bitmap bounds, cell alignment) surface as [`Corrupted`]
/// rather than being silently repaired.
///
/// [`Corrupted`]: AllocError::Corrupted
#[derive(Debug)]
pub enum AllocError {
  /// Null pointer, zero size/count, out-of-range index, or a pointer that
  /// does not recover to a valid allocation.
  InvalidArgument,
  /// Slab chain or buddy heap exhausted.
  OutOfMemory,
  /// In-place realloc request exceeds the owning slab's fixed cell size.
  TooLarge,
  /// The restartable-sequence retry budget hit zero without committing.
  RetriesExhausted,
  /// The CPU-affinity primitive could not be registered for this thread.
  RegistrationFailed(io::Error),
  /// The restartable-sequence facility was used before registration.
  NotRegistered,
  /// Freeing a cell whose free-list bit is already clear.
  DoubleFree,
  /// A structural invariant did not hold where a valid slab was expected.
  Corrupted,
  /// An OS call backing the pool failed (mmap, ftruncate, semop, ...).
  System(io::Error),
}

impl fmt::Display for AllocError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AllocError::InvalidArgument => write!(f, "invalid argument"),
      AllocError::OutOfMemory => write!(f, "out of memory"),
      AllocError::TooLarge => write!(f, "request exceeds the slab's fixed cell size"),
      AllocError::RetriesExhausted => write!(f, "restartable sequence retries exhausted"),
      AllocError::RegistrationFailed(e) => write!(f, "rseq registration failed: {e}"),
      AllocError::NotRegistered => write!(f, "rseq used before registration"),
      AllocError::DoubleFree => write!(f, "double free detected"),
      AllocError::Corrupted => write!(f, "allocator metadata corrupted"),
      AllocError::System(e) => write!(f, "system call failed: {e}"),
    }
  }
}

impl std::error::Error for AllocError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      AllocError::RegistrationFailed(e) | AllocError::System(e) => Some(e),
      _ => None,
    }
  }
}

impl AllocError {
  /// Wraps the current `errno` value, for syscall error paths.
  pub(crate) fn last_os_error() -> Self {
    AllocError::System(io::Error::last_os_error())
  }
}
