//! The shared-memory pool allocator facade.
//!
//! `alloc` classifies the request: sizes covered by the class table go to
//! the per-core slab chain for that (core, class) pair, driven through the
//! restartable-sequence runner so each core works its own chain. Cell
//! claims are atomic bit operations, so an attempt that migrates mid-way
//! is rolled back, never duplicated. Everything else, plus chain growth
//! when a class runs dry, goes through the buddy heap under a
//! cross-process semaphore.
//!
//! `free` and `realloc` recover ownership from the pointer alone: mask down
//! to the slab boundary and check the magic tag; no tag means the pointer
//! is a buddy block base.

use std::cell::UnsafeCell;
use std::ptr::{self, null_mut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::allocator::{ALLOC_CLEAR_MEMORY, AllocFlags, Allocator};
use crate::buddy::{BuddyConfig, BuddyHeap, MemorySource};
use crate::error::AllocError;
use crate::rseq;
use crate::shm::SharedMemoryFile;
use crate::slab::{SlabChain, has_magic, slab_of};
use crate::{
  MAX_RANGE_EXPONENT, MIN_BLOCK_EXPONENT, SIZE_CLASS_COUNT, SIZE_CLASSES, SLAB_SIZE, size_class,
};

/// Fast-path retry budget. Aborts happen on preemption/migration, so in
/// practice one or two attempts suffice; the budget only bounds pathological
/// scheduling.
const ALLOC_MAX_RETRIES: usize = 10_000;

// =============================================================================
// Cross-process semaphore
// =============================================================================

/// SysV semaphore with binary-mutex semantics. Acquire/release run with
/// `SEM_UNDO` so a process that dies while holding it does not wedge the
/// pool for everyone else.
struct PoolSemaphore {
  id: libc::c_int,
}

impl PoolSemaphore {
  fn new() -> Result<Self, AllocError> {
    let id = unsafe { libc::semget(libc::IPC_PRIVATE, 1, libc::IPC_CREAT | 0o600) };
    if id < 0 {
      return Err(AllocError::last_os_error());
    }

    // Bring the semaphore to 1 (unlocked). Plain op: the initial release
    // must not accumulate an undo adjustment.
    let mut op = libc::sembuf {
      sem_num: 0,
      sem_op: 1,
      sem_flg: 0,
    };
    if unsafe { libc::semop(id, &mut op, 1) } != 0 {
      let err = AllocError::last_os_error();
      unsafe { libc::semctl(id, 0, libc::IPC_RMID) };
      return Err(err);
    }
    Ok(Self { id })
  }

  fn acquire(&self) -> Result<SemGuard<'_>, AllocError> {
    let mut op = libc::sembuf {
      sem_num: 0,
      sem_op: -1,
      sem_flg: libc::SEM_UNDO as libc::c_short,
    };
    if unsafe { libc::semop(self.id, &mut op, 1) } != 0 {
      return Err(AllocError::last_os_error());
    }
    Ok(SemGuard { sem: self })
  }
}

impl Drop for PoolSemaphore {
  fn drop(&mut self) {
    unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
  }
}

struct SemGuard<'a> {
  sem: &'a PoolSemaphore,
}

impl Drop for SemGuard<'_> {
  fn drop(&mut self) {
    let mut op = libc::sembuf {
      sem_num: 0,
      sem_op: 1,
      sem_flg: libc::SEM_UNDO as libc::c_short,
    };
    if unsafe { libc::semop(self.sem.id, &mut op, 1) } != 0 {
      log::warn!(
        "semaphore release failed: {}",
        std::io::Error::last_os_error()
      );
    }
  }
}

// =============================================================================
// Shared Pool
// =============================================================================

/// Payload threaded through the restartable-sequence fast path.
struct FastAlloc {
  ptr: *mut u8,
  core: u32,
}

pub struct SharedPool {
  /// Touched only while holding the semaphore.
  buddy: UnsafeCell<BuddyHeap<SharedMemoryFile>>,
  /// One chain per (core, size class), read-only after bootstrap except for
  /// slab `next` links, which are only ever extended.
  chains: Box<[SlabChain]>,
  core_count: usize,
  base: *mut u8,
  /// Mirror of the buddy heap's carved frontier, refreshed under the
  /// semaphore after every carve. Pointer recovery must not read past it:
  /// pages beyond are not committed and touching them faults.
  carved: AtomicUsize,
  sem: PoolSemaphore,
}

unsafe impl Send for SharedPool {}
unsafe impl Sync for SharedPool {}

impl SharedPool {
  /// Creates the backing store, bootstraps the buddy heap over it, and
  /// populates one slab chain per (core, size class) pair.
  pub fn init() -> Result<Self, AllocError> {
    let file = SharedMemoryFile::create(1usize << MAX_RANGE_EXPONENT)?;
    let mut buddy = BuddyHeap::new(
      file,
      BuddyConfig {
        range_exponent: MAX_RANGE_EXPONENT,
        min_block_exponent: MIN_BLOCK_EXPONENT,
      },
    )?;
    let base = buddy.base();

    let cores = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    let core_count = cores.max(1) as usize;

    let mut chains = Vec::with_capacity(core_count * SIZE_CLASS_COUNT);
    for _core in 0..core_count {
      for &cell_size in &SIZE_CLASSES {
        let block = buddy.alloc(SLAB_SIZE)?;
        chains.push(unsafe { SlabChain::create(block, cell_size) }?);
      }
    }

    let sem = PoolSemaphore::new()?;
    log::debug!("shared pool initialized: {core_count} cores x {SIZE_CLASS_COUNT} size classes");

    let carved = AtomicUsize::new(buddy.carved_bytes());
    Ok(Self {
      buddy: UnsafeCell::new(buddy),
      chains: chains.into_boxed_slice(),
      core_count,
      base,
      carved,
      sem,
    })
  }

  /// Tears the pool down. Consuming `self` is the caller's assertion that
  /// no other thread still holds in-flight allocations; pointers into the
  /// region are invalid afterwards.
  pub fn close(self) -> Result<(), AllocError> {
    let file = self.buddy.into_inner().close();
    file.close()?;
    log::debug!("shared pool closed");
    Ok(())
  }

  /// File descriptor of the backing region, for handing the pool to a
  /// cooperating process.
  pub fn backing_fd(&self) -> libc::c_int {
    // The fd never changes after init, so this read needs no semaphore.
    unsafe { (*self.buddy.get()).source().fd() }
  }

  /// Identifier of the semaphore guarding the slow path. A cooperating
  /// process needs it together with [`backing_fd`] to share the pool's
  /// mutual exclusion.
  ///
  /// [`backing_fd`]: SharedPool::backing_fd
  pub fn semaphore_id(&self) -> libc::c_int {
    self.sem.id
  }

  pub fn core_count(&self) -> usize {
    self.core_count
  }

  /// Whether `ptr` can belong to the pool. Bounded by the carved frontier,
  /// not the full virtual range: addresses beyond it were never handed out
  /// and their pages have no backing to read a magic tag from.
  #[inline]
  fn contains(&self, ptr: *mut u8) -> bool {
    let addr = ptr as usize;
    let base = self.base as usize;
    !ptr.is_null() && addr >= base && addr < base + self.carved.load(Ordering::Acquire)
  }

  /// CPU ids can exceed the bootstrapped core count under hotplug; fold
  /// them back onto a valid row.
  #[inline]
  fn fold_core(&self, cpu: u32) -> usize {
    cpu as usize % self.core_count
  }

  fn chain_for(&self, core: usize, class: usize) -> Result<&SlabChain, AllocError> {
    if core >= self.core_count || class >= SIZE_CLASS_COUNT {
      return Err(AllocError::InvalidArgument);
    }
    Ok(&self.chains[core * SIZE_CLASS_COUNT + class])
  }

  fn alloc_small(&self, class: usize) -> Result<*mut u8, AllocError> {
    let cell_size = SIZE_CLASSES[class];
    let mut call = FastAlloc {
      ptr: null_mut(),
      core: 0,
    };

    let result = rseq::run(
      ALLOC_MAX_RETRIES,
      |cpu, call: &mut FastAlloc| {
        call.core = cpu;
        let chain = self.chain_for(self.fold_core(cpu), class)?;
        chain.alloc_cell(&mut call.ptr, 1, cell_size)
      },
      Some(&mut |call: &mut FastAlloc| {
        // The attempt was aborted after the bitmap update: release the
        // half-allocated cell before retrying.
        if !call.ptr.is_null() {
          self.free(&mut call.ptr)?;
        }
        Ok(true)
      }),
      &mut call,
    );

    match result {
      Ok(()) => Ok(call.ptr),
      // Committed but the chain is full: grow it outside the pinned
      // section, exactly once per call.
      Err(AllocError::OutOfMemory) => self.grow_and_alloc(self.fold_core(call.core), class),
      Err(e) => Err(e),
    }
  }

  fn grow_and_alloc(&self, core: usize, class: usize) -> Result<*mut u8, AllocError> {
    let _guard = self.sem.acquire()?;
    let chain = self.chain_for(core, class)?;
    log::trace!("slab chain exhausted, growing: core={core} class={class}");

    let buddy = unsafe { &mut *self.buddy.get() };
    let block = buddy.alloc(SLAB_SIZE)?;
    self.carved.store(buddy.carved_bytes(), Ordering::Release);
    unsafe { chain.append(block) }?;

    // Already serialized by the semaphore; allocate straight from the
    // grown chain instead of re-entering the restartable sequence.
    let mut ptr = null_mut();
    chain.alloc_cell(&mut ptr, 1, SIZE_CLASSES[class])?;
    Ok(ptr)
  }
}

impl Allocator for SharedPool {
  /// Allocates `count * size` bytes. On success `slot` (which must hold
  /// null) receives the pointer; on failure it is left unmodified.
  fn alloc(
    &self,
    slot: &mut *mut u8,
    count: usize,
    size: usize,
    flags: AllocFlags,
  ) -> Result<(), AllocError> {
    if count == 0 || size == 0 || !slot.is_null() {
      return Err(AllocError::InvalidArgument);
    }
    let total = count.checked_mul(size).ok_or(AllocError::InvalidArgument)?;

    let ptr = match size_class(total) {
      Some(class) => self.alloc_small(class)?,
      None => {
        // Beyond the largest class: straight to the buddy heap.
        let _guard = self.sem.acquire()?;
        let buddy = unsafe { &mut *self.buddy.get() };
        let ptr = buddy.alloc(total)?;
        self.carved.store(buddy.carved_bytes(), Ordering::Release);
        ptr
      }
    };

    if flags & ALLOC_CLEAR_MEMORY != 0 {
      unsafe { ptr::write_bytes(ptr, 0, total) };
    }
    *slot = ptr;
    Ok(())
  }

  /// Resizes the allocation in `slot`. Slab-owned pointers resize in place
  /// when the cell still fits, otherwise move through `alloc`/copy/`free`.
  /// Buddy-owned pointers always move: the heap has no resize-in-place.
  fn realloc(
    &self,
    slot: &mut *mut u8,
    count: usize,
    size: usize,
    flags: AllocFlags,
  ) -> Result<(), AllocError> {
    if slot.is_null() || count == 0 || size == 0 {
      return Err(AllocError::InvalidArgument);
    }
    let total = count.checked_mul(size).ok_or(AllocError::InvalidArgument)?;
    let old = *slot;
    if !self.contains(old) {
      return Err(AllocError::InvalidArgument);
    }

    let slab = slab_of(old);
    if unsafe { has_magic(slab) } {
      let cell_size = unsafe { (*slab).cell_size() };
      if total <= cell_size {
        // Still fits the fixed cell; the pointer does not move.
        return Ok(());
      }

      let mut fresh = null_mut();
      self.alloc(&mut fresh, count, size, flags)?;
      unsafe { ptr::copy_nonoverlapping(old, fresh, cell_size.min(total)) };

      let mut stale = old;
      if let Err(e) = unsafe { SlabChain::free_in(slab, &mut stale) } {
        let _ = self.free(&mut fresh);
        return Err(e);
      }
      *slot = fresh;
      Ok(())
    } else {
      // Buddy blocks are identified (and freed) by their exact base.
      if slab as *mut u8 != old {
        return Err(AllocError::InvalidArgument);
      }
      let _guard = self.sem.acquire()?;
      let buddy = unsafe { &mut *self.buddy.get() };

      let old_size = buddy.block_size(old)?;
      let fresh = buddy.alloc(total)?;
      self.carved.store(buddy.carved_bytes(), Ordering::Release);
      if flags & ALLOC_CLEAR_MEMORY != 0 {
        unsafe { ptr::write_bytes(fresh, 0, total) };
      }
      unsafe { ptr::copy_nonoverlapping(old, fresh, old_size.min(total)) };
      buddy.free(old)?;
      *slot = fresh;
      Ok(())
    }
  }

  /// Releases the allocation in `slot` and nulls it. On failure the slot is
  /// left unchanged so the caller can diagnose before retrying.
  fn free(&self, slot: &mut *mut u8) -> Result<(), AllocError> {
    if slot.is_null() {
      return Err(AllocError::InvalidArgument);
    }
    let ptr = *slot;
    if !self.contains(ptr) {
      return Err(AllocError::InvalidArgument);
    }

    let slab = slab_of(ptr);
    if unsafe { has_magic(slab) } {
      unsafe { SlabChain::free_in(slab, slot) }
    } else {
      if slab as *mut u8 != ptr {
        return Err(AllocError::InvalidArgument);
      }
      let _guard = self.sem.acquire()?;
      unsafe { &mut *self.buddy.get() }.free(ptr)?;
      *slot = null_mut();
      Ok(())
    }
  }
}

#[cfg(test)]
impl SharedPool {
  fn buddy_alloc_count(&self) -> u64 {
    unsafe { (*self.buddy.get()).alloc_count() }
  }

  fn total_slabs(&self) -> usize {
    self.chains.iter().map(|c| c.slab_count()).sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  fn pin_to_cpu(cpu: usize) -> bool {
    unsafe {
      let mut set: libc::cpu_set_t = std::mem::zeroed();
      libc::CPU_SET(cpu, &mut set);
      libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) == 0
    }
  }

  #[test]
  fn init_and_close() {
    let pool = SharedPool::init().unwrap();
    assert!(pool.core_count() >= 1);
    assert!(pool.backing_fd() >= 0);
    assert!(pool.semaphore_id() >= 0);
    pool.close().unwrap();
  }

  #[test]
  fn small_alloc_roundtrip() {
    let pool = SharedPool::init().unwrap();

    let mut slot = null_mut();
    pool.alloc(&mut slot, 1, 100, 0).unwrap();
    assert!(!slot.is_null());

    unsafe {
      ptr::write_bytes(slot, 0x5A, 100);
      assert_eq!(slot.read(), 0x5A);
      assert_eq!(slot.add(99).read(), 0x5A);
    }

    pool.free(&mut slot).unwrap();
    assert!(slot.is_null());
    pool.close().unwrap();
  }

  #[test]
  fn invalid_arguments_leave_slot_untouched() {
    let pool = SharedPool::init().unwrap();

    let mut slot = null_mut();
    assert!(matches!(
      pool.alloc(&mut slot, 0, 8, 0),
      Err(AllocError::InvalidArgument)
    ));
    assert!(matches!(
      pool.alloc(&mut slot, 8, 0, 0),
      Err(AllocError::InvalidArgument)
    ));
    assert!(slot.is_null());

    // Occupied slot is rejected too.
    let mut backing = [0u8; 8];
    let mut occupied: *mut u8 = backing.as_mut_ptr();
    assert!(matches!(
      pool.alloc(&mut occupied, 1, 8, 0),
      Err(AllocError::InvalidArgument)
    ));
    assert_eq!(occupied, backing.as_mut_ptr());

    // Freeing a pointer from outside the pool is invalid.
    assert!(matches!(
      pool.free(&mut occupied),
      Err(AllocError::InvalidArgument)
    ));
    assert_eq!(occupied, backing.as_mut_ptr());

    pool.close().unwrap();
  }

  #[test]
  fn clear_flag_zero_fills_recycled_cell() {
    let pool = SharedPool::init().unwrap();
    pin_to_cpu(0);

    let mut slot = null_mut();
    pool.alloc(&mut slot, 1, 64, 0).unwrap();
    unsafe { ptr::write_bytes(slot, 0xFF, 64) };
    let dirty = slot;
    pool.free(&mut slot).unwrap();

    pool.alloc(&mut slot, 1, 64, ALLOC_CLEAR_MEMORY).unwrap();
    // Same core, same class: the dirty cell comes back, now zeroed.
    assert_eq!(slot, dirty);
    for i in 0..64 {
      assert_eq!(unsafe { slot.add(i).read() }, 0, "byte {i}");
    }

    pool.free(&mut slot).unwrap();
    pool.close().unwrap();
  }

  #[test]
  fn large_requests_bypass_the_slab_tier() {
    let pool = SharedPool::init().unwrap();

    let slabs_before = pool.total_slabs();
    let buddy_before = pool.buddy_alloc_count();

    let mut slot = null_mut();
    pool.alloc(&mut slot, 1, 100_000, 0).unwrap();

    // Served by the buddy heap: a block base on a slab-aligned boundary,
    // with no slab chain touched.
    assert_eq!(slot as usize % SLAB_SIZE, 0);
    assert_eq!(pool.buddy_alloc_count(), buddy_before + 1);
    assert_eq!(pool.total_slabs(), slabs_before);

    unsafe {
      ptr::write_bytes(slot, 0xA7, 100_000);
      assert_eq!(slot.add(99_999).read(), 0xA7);
    }

    pool.free(&mut slot).unwrap();
    assert!(slot.is_null());
    pool.close().unwrap();
  }

  #[test]
  fn beyond_range_allocation_fails_cleanly() {
    let pool = SharedPool::init().unwrap();
    let mut slot = null_mut();
    for size in [1usize << (MAX_RANGE_EXPONENT + 1), usize::MAX] {
      assert!(matches!(
        pool.alloc(&mut slot, 1, size, 0),
        Err(AllocError::OutOfMemory)
      ));
      assert!(slot.is_null());
    }
    pool.close().unwrap();
  }

  #[test]
  fn wild_pointer_inside_range_is_rejected() {
    let pool = SharedPool::init().unwrap();

    // Inside the virtual range but far beyond anything ever carved:
    // ownership recovery must reject it without touching the address.
    let mut wild = unsafe { pool.base.add((1usize << MAX_RANGE_EXPONENT) - SLAB_SIZE) };
    let before = wild;
    assert!(matches!(
      pool.free(&mut wild),
      Err(AllocError::InvalidArgument)
    ));
    assert_eq!(wild, before);
    assert!(matches!(
      pool.realloc(&mut wild, 1, 64, 0),
      Err(AllocError::InvalidArgument)
    ));
    assert_eq!(wild, before);

    pool.close().unwrap();
  }

  #[test]
  fn realloc_within_class_is_a_no_op() {
    let pool = SharedPool::init().unwrap();

    let mut slot = null_mut();
    pool.alloc(&mut slot, 1, 10, 0).unwrap();
    let before = slot;

    pool.realloc(&mut slot, 1, 20, 0).unwrap();
    assert_eq!(slot, before);

    pool.free(&mut slot).unwrap();
    pool.close().unwrap();
  }

  #[test]
  fn realloc_across_classes_moves_and_preserves_data() {
    let pool = SharedPool::init().unwrap();

    let mut slot = null_mut();
    pool.alloc(&mut slot, 1, 30, 0).unwrap();
    let old = slot;
    for i in 0..30u8 {
      unsafe { slot.add(i as usize).write(i) };
    }

    pool.realloc(&mut slot, 1, 100, 0).unwrap();
    assert_ne!(slot, old);
    for i in 0..30u8 {
      assert_eq!(unsafe { slot.add(i as usize).read() }, i);
    }

    // The old cell's bit was cleared by the move.
    let mut stale = old;
    assert!(matches!(
      pool.free(&mut stale),
      Err(AllocError::DoubleFree)
    ));

    pool.free(&mut slot).unwrap();
    pool.close().unwrap();
  }

  #[test]
  fn realloc_of_buddy_block_moves_and_preserves_data() {
    let pool = SharedPool::init().unwrap();

    let mut slot = null_mut();
    pool.alloc(&mut slot, 1, 3 * SLAB_SIZE, 0).unwrap();
    unsafe { ptr::write_bytes(slot, 0xC3, 3 * SLAB_SIZE) };

    pool.realloc(&mut slot, 1, 6 * SLAB_SIZE, 0).unwrap();
    unsafe {
      assert_eq!(slot.read(), 0xC3);
      assert_eq!(slot.add(3 * SLAB_SIZE - 1).read(), 0xC3);
    }

    pool.free(&mut slot).unwrap();
    pool.close().unwrap();
  }

  #[test]
  fn growth_on_exhaustion_appends_one_slab() {
    let pool = SharedPool::init().unwrap();
    pin_to_cpu(0);

    // 8180-byte cells: one slab holds exactly 4.
    let mut held = Vec::new();
    for _ in 0..4 {
      let mut slot = null_mut();
      pool.alloc(&mut slot, 1, 8180, 0).unwrap();
      held.push(slot);
    }
    let slabs_before = pool.total_slabs();

    let mut slot = null_mut();
    pool.alloc(&mut slot, 1, 8180, 0).unwrap();
    assert_eq!(pool.total_slabs(), slabs_before + 1);
    held.push(slot);

    for mut ptr in held {
      pool.free(&mut ptr).unwrap();
    }
    pool.close().unwrap();
  }

  #[test]
  fn forced_abort_never_leaks_the_aborted_cell() {
    let pool = SharedPool::init().unwrap();
    pin_to_cpu(0);

    rseq::force_aborts(1);
    let mut a = null_mut();
    pool.alloc(&mut a, 1, 64, 0).unwrap();
    assert!(!a.is_null());

    // The aborted attempt's cell was rolled back, so the two live
    // allocations are the first two cells of the chain.
    let mut b = null_mut();
    pool.alloc(&mut b, 1, 64, 0).unwrap();
    assert_ne!(a, b);

    pool.free(&mut a).unwrap();
    pool.free(&mut b).unwrap();
    pool.close().unwrap();
  }

  #[test]
  fn disjoint_cores_keep_their_chains_isolated() {
    let pool = Arc::new(SharedPool::init().unwrap());
    let class = 1; // 64-byte cells
    let cores = pool.core_count().min(4);

    let mut handles = Vec::new();
    for core in 0..cores {
      let pool = Arc::clone(&pool);
      handles.push(std::thread::spawn(move || {
        // Cores that cannot be pinned (offline, restricted mask) sit out.
        if !pin_to_cpu(core) {
          return (core, Vec::new());
        }
        let mut held = Vec::new();
        for _ in 0..16 {
          let mut slot = null_mut();
          pool.alloc(&mut slot, 1, 64, 0).unwrap();
          held.push(slot as usize);
        }
        (core, held)
      }));
    }

    let results: Vec<(usize, Vec<usize>)> =
      handles.into_iter().map(|h| h.join().unwrap()).collect();

    for (core, held) in &results {
      let chain = pool.chain_for(*core, class).unwrap();
      // Every cell a pinned core got lives in that core's own chain, and
      // the chain's bitmap reflects exactly its own live cells.
      for &cell in held {
        assert!(chain.contains_slab(slab_of(cell as *mut u8)));
      }
      assert_eq!(chain.live_cells(), held.len());
    }

    for (_, held) in results {
      for cell in held {
        let mut slot = cell as *mut u8;
        pool.free(&mut slot).unwrap();
      }
    }
    Arc::into_inner(pool).unwrap().close().unwrap();
  }

  #[test]
  fn concurrent_threads_allocate_independently() {
    let pool = Arc::new(SharedPool::init().unwrap());
    let mut handles = Vec::new();

    for t in 0..4u8 {
      let pool = Arc::clone(&pool);
      handles.push(std::thread::spawn(move || {
        for round in 0..200 {
          let size = SIZE_CLASSES[(t as usize + round) % SIZE_CLASS_COUNT];
          let mut slot = null_mut();
          pool.alloc(&mut slot, 1, size, 0).unwrap();

          unsafe {
            ptr::write_bytes(slot, t, size);
            assert_eq!(slot.read(), t);
            assert_eq!(slot.add(size - 1).read(), t);
          }

          pool.free(&mut slot).unwrap();
          assert!(slot.is_null());
        }
      }));
    }

    for handle in handles {
      handle.join().unwrap();
    }
    Arc::into_inner(pool).unwrap().close().unwrap();
  }
}
