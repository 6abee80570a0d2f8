//! Restartable-sequence runner.
//!
//! Executes a critical-section closure that is guaranteed to start and
//! commit on one CPU. The thread registers a `struct rseq` area with the
//! kernel so the current CPU id is a single TLS load; the runner snapshots
//! the id on entry and re-reads it before commit, and any migration in
//! between aborts the attempt, runs the caller's rollback closure, and
//! retries up to the budget. Kernels or libcs where registration is taken
//! (EBUSY) or absent (ENOSYS) fall back to `sched_getcpu` for the id reads.
//!
//! Critical-section closures must not block, take locks, or enter the
//! kernel: anything they touch between entry and commit can be re-run from
//! scratch. The abort handler runs outside the pinned window and is free to
//! do slow work.

use std::cell::{Cell, UnsafeCell};
use std::io;
use std::ptr;

use crate::error::AllocError;

const RSEQ_AREA_SIZE: u32 = 32;
const RSEQ_FLAG_UNREGISTER: libc::c_int = 1;
const RSEQ_SIG: u32 = 0x5305_3053;

const CPU_ID_UNINITIALIZED: u32 = u32::MAX; // -1
const CPU_ID_REGISTRATION_FAILED: u32 = u32::MAX - 1; // -2

/// Kernel rseq ABI area (linux/rseq.h).
#[repr(C, align(32))]
struct RseqArea {
  cpu_id_start: u32,
  cpu_id: u32,
  rseq_cs: u64,
  flags: u32,
  node_id: u32,
  mm_cid: u32,
  _pad: u32,
}

const _: () = assert!(size_of::<RseqArea>() == RSEQ_AREA_SIZE as usize);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Registration {
  None,
  /// Kernel writes CPU ids into our TLS area.
  Kernel,
  /// Registration unavailable; ids come from `sched_getcpu`.
  Fallback,
}

struct ThreadRseq {
  area: UnsafeCell<RseqArea>,
  reg: Cell<Registration>,
}

thread_local! {
  static THREAD_RSEQ: ThreadRseq = ThreadRseq {
    area: UnsafeCell::new(RseqArea {
      cpu_id_start: 0,
      cpu_id: CPU_ID_UNINITIALIZED,
      rseq_cs: 0,
      flags: 0,
      node_id: 0,
      mm_cid: 0,
      _pad: 0,
    }),
    reg: Cell::new(Registration::None),
  };
}

#[cfg(all(target_arch = "x86_64", feature = "rdpid"))]
fn fallback_cpu_id() -> libc::c_int {
  let cpu: u64;
  unsafe {
    std::arch::asm!("rdpid {}", out(reg) cpu, options(nomem, nostack, preserves_flags));
  }
  (cpu & 0xFFF) as libc::c_int
}

#[cfg(not(all(target_arch = "x86_64", feature = "rdpid")))]
fn fallback_cpu_id() -> libc::c_int {
  unsafe { libc::sched_getcpu() }
}

impl ThreadRseq {
  fn register(&self) -> Result<(), AllocError> {
    if self.reg.get() != Registration::None {
      return Ok(());
    }

    let ret = unsafe {
      libc::syscall(
        libc::SYS_rseq,
        self.area.get(),
        RSEQ_AREA_SIZE,
        0 as libc::c_int,
        RSEQ_SIG,
      )
    };
    if ret == 0 {
      self.reg.set(Registration::Kernel);
      return Ok(());
    }

    // glibc may already own the thread's registration (EBUSY), or the
    // kernel may predate the syscall (ENOSYS).
    let err = io::Error::last_os_error();
    if unsafe { libc::sched_getcpu() } >= 0 {
      log::debug!("kernel rseq unavailable ({err}), using sched_getcpu fallback");
      self.reg.set(Registration::Fallback);
      return Ok(());
    }

    unsafe { (*self.area.get()).cpu_id = CPU_ID_REGISTRATION_FAILED };
    Err(AllocError::RegistrationFailed(err))
  }

  fn cpu(&self) -> Result<u32, AllocError> {
    match self.reg.get() {
      Registration::None => Err(AllocError::NotRegistered),
      Registration::Kernel => {
        // Volatile: the kernel rewrites this on every preemption.
        let cpu = unsafe { ptr::read_volatile(&(*self.area.get()).cpu_id) };
        if cpu == CPU_ID_UNINITIALIZED || cpu == CPU_ID_REGISTRATION_FAILED {
          return Err(AllocError::NotRegistered);
        }
        Ok(cpu)
      }
      Registration::Fallback => {
        let cpu = fallback_cpu_id();
        if cpu < 0 {
          return Err(AllocError::NotRegistered);
        }
        Ok(cpu as u32)
      }
    }
  }
}

impl Drop for ThreadRseq {
  fn drop(&mut self) {
    if self.reg.get() == Registration::Kernel {
      // The kernel must stop writing into the area before TLS is reclaimed.
      unsafe {
        libc::syscall(
          libc::SYS_rseq,
          self.area.get(),
          RSEQ_AREA_SIZE,
          RSEQ_FLAG_UNREGISTER,
          RSEQ_SIG,
        );
      }
    }
  }
}

/// Binds the calling thread to the CPU-affinity primitive. Idempotent.
pub fn register() -> Result<(), AllocError> {
  THREAD_RSEQ.with(|t| t.register())
}

/// The CPU the calling thread last observed itself on. Fails with
/// [`AllocError::NotRegistered`] before [`register`].
pub fn cpu_id() -> Result<u32, AllocError> {
  THREAD_RSEQ.with(|t| t.cpu())
}

/// Runs `critical` with entry and commit pinned to one CPU.
///
/// The closure receives the CPU id it entered on. If the thread migrates
/// before commit the attempt is aborted: `abort` (if any) is invoked to
/// undo partial side effects and decide whether to retry, and the retry
/// budget is decremented. A committed attempt returns whatever the closure
/// returned, error or not. Registers the calling thread on first use.
pub fn run<T>(
  max_retries: usize,
  mut critical: impl FnMut(u32, &mut T) -> Result<(), AllocError>,
  mut abort: Option<&mut dyn FnMut(&mut T) -> Result<bool, AllocError>>,
  payload: &mut T,
) -> Result<(), AllocError> {
  if max_retries == 0 {
    return Err(AllocError::InvalidArgument);
  }
  register()?;

  let mut budget = max_retries;
  while budget > 0 {
    let cpu_start = cpu_id()?;
    let result = critical(cpu_start, payload);

    let aborted = cpu_id()? != cpu_start || take_forced_abort();
    if !aborted {
      return result;
    }

    budget -= 1;
    if let Some(handler) = abort.as_mut() {
      if !handler(payload)? {
        return Ok(());
      }
    }
  }

  Err(AllocError::RetriesExhausted)
}

#[cfg(test)]
thread_local! {
  static FORCE_ABORTS: Cell<u32> = const { Cell::new(0) };
}

/// Makes the next `n` attempts on this thread abort after their body runs,
/// as if the thread had been migrated before commit.
#[cfg(test)]
pub(crate) fn force_aborts(n: u32) {
  FORCE_ABORTS.with(|c| c.set(n));
}

#[cfg(test)]
fn take_forced_abort() -> bool {
  FORCE_ABORTS.with(|c| {
    let n = c.get();
    if n > 0 {
      c.set(n - 1);
      true
    } else {
      false
    }
  })
}

#[cfg(not(test))]
fn take_forced_abort() -> bool {
  false
}
