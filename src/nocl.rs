// Port of NoCL to the host.
//
// Every NoCL thread of a launch is an OS thread.  Blocks are executed by a
// fixed number of resident block slots; each slot owns one block barrier and
// one region of shared local memory, and walks the grid in strides of the
// slot count, just as hardware threads walk the grid on the SIMT device.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem;
use std::any::Any;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::Platform;
use crate::error::{NoclError, Result};
use crate::prims::{self, GroupBarrier, LaunchGate};

// Element types
// =============

/// Plain data that can live in global and shared local memory.
pub trait Element : bytemuck::Pod + Send + Sync {}

impl<T : bytemuck::Pod + Send + Sync> Element for T {}

// Alignment (and padding granule) of shared local memory allocations
pub const SHARED_ALIGN : usize = mem::align_of::<u64>();

// Round `n` up to a multiple of `align`, which must be a power of two
fn round_up(n : usize, align : usize) -> usize {
  (n + align - 1) & !(align - 1)
}

#[inline(always)]
#[track_caller]
fn check_bounds(i : usize, len : usize) {
  if cfg!(not(feature = "disable_bounds_checks")) {
    prims::simt_assert(i < len, "NoCL: index out of bounds")
  }
}

// Data types
// ==========

// Structure for holding thread block and grid dimensions.
// Unlike CUDA, we don't (yet) support the Z dimension.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dim2 {
  pub x : usize,
  pub y : usize
}

impl Dim2 {
  /// Number of elements, saturating at `usize::MAX`.
  pub fn count(&self) -> usize { self.x.saturating_mul(self.y) }
}

// Block and grid dimensions
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dims {
  pub block_dim : Dim2,
  pub grid_dim : Dim2
}

// Backing store for the shared local memory of one resident block
struct Arena {
  words : Box<[UnsafeCell<u64>]>
}

// SAFETY: the arena is only reachable through `Shared` views, whose
// accessors are unsafe and require the caller to exclude data races.
unsafe impl Sync for Arena {}

impl Arena {
  fn new(bytes : usize) -> Self {
    let words = round_up(bytes, SHARED_ALIGN) / SHARED_ALIGN;
    Arena { words: (0 .. words).map(|_| UnsafeCell::new(0)).collect() }
  }

  // Fresh allocator over the whole arena
  fn mem(&self) -> Mem<'_> {
    Mem {
      space: self.words.len() * SHARED_ALIGN,
      next: UnsafeCell::raw_get(self.words.as_ptr()) as *mut u8,
      _arena: PhantomData
    }
  }
}

/// Bump allocator over the shared local memory of one block.
///
/// Each thread of a block receives its own `Mem` over the same storage.
/// Since every thread performs the same sequence of allocations, they all
/// see the same regions, as on the device.  There is no deallocation; a
/// new `Mem` is created for every block.
pub struct Mem<'a> {
  // Remaining space (in bytes) available to the allocator
  space : usize,
  // Byte pointer to next remaining space
  next : *mut u8,
  _arena : PhantomData<&'a Arena>
}

impl Mem<'_> {
  pub fn space(&self) -> usize { self.space }
}

/// Allocate `n` elements of type `T` in shared local memory.
///
/// # Panics
///
/// Panics (failing the kernel) if the block's shared local memory is
/// exhausted or `T` is more strictly aligned than [`SHARED_ALIGN`].
#[inline(always)]
#[track_caller]
pub fn alloc<'a, T : Element>(mem : &mut Mem<'a>, n : usize) -> Shared<'a, T> {
  prims::simt_assert(mem::align_of::<T>() <= SHARED_ALIGN,
    "NoCL: element alignment exceeds shared memory alignment");
  let num_bytes = n.checked_mul(mem::size_of::<T>()).unwrap_or(usize::MAX);
  prims::simt_assert(num_bytes <= mem.space,
    "NoCL: shared local memory exhausted");
  let num_bytes_with_padding = round_up(num_bytes, SHARED_ALIGN);
  let ptr = mem.next as *mut T;
  mem.space -= num_bytes_with_padding;
  mem.next = mem.next.wrapping_add(num_bytes_with_padding);
  Shared { ptr, len: n, _mem: PhantomData }
}

/// Array in shared local memory, visible to every thread of a block.
pub struct Shared<'a, T> {
  ptr : *mut T,
  len : usize,
  _mem : PhantomData<&'a UnsafeCell<T>>
}

impl<T> Clone for Shared<'_, T> {
  fn clone(&self) -> Self { *self }
}

impl<T> Copy for Shared<'_, T> {}

impl<T : Element> Shared<'_, T> {
  pub fn len(&self) -> usize { self.len }

  pub fn is_empty(&self) -> bool { self.len == 0 }

  /// Read element `i`.
  ///
  /// # Safety
  ///
  /// No other thread of the block may write element `i` unless a
  /// `syncthreads` separates that write from this read.
  #[inline(always)]
  #[track_caller]
  pub unsafe fn get(&self, i : usize) -> T {
    check_bounds(i, self.len);
    self.ptr.add(i).read()
  }

  /// Write element `i`.
  ///
  /// # Safety
  ///
  /// No other thread of the block may access element `i` unless a
  /// `syncthreads` separates that access from this write.
  #[inline(always)]
  #[track_caller]
  pub unsafe fn set(&self, i : usize, val : T) {
    check_bounds(i, self.len);
    self.ptr.add(i).write(val)
  }
}

/// Mutable array in global memory, shared by every thread of a launch.
pub struct Global<'a, T> {
  ptr : *mut T,
  len : usize,
  _slice : PhantomData<&'a mut [T]>
}

// SAFETY: element accesses are unsafe and the caller guarantees that no
// two threads race on the same element.
unsafe impl<T : Element> Send for Global<'_, T> {}
unsafe impl<T : Element> Sync for Global<'_, T> {}

impl<'a, T : Element> From<&'a mut [T]> for Global<'a, T> {
  fn from(slice : &'a mut [T]) -> Self {
    Global { ptr: slice.as_mut_ptr(), len: slice.len(), _slice: PhantomData }
  }
}

impl<T : Element> Global<'_, T> {
  pub fn len(&self) -> usize { self.len }

  pub fn is_empty(&self) -> bool { self.len == 0 }

  /// Read element `i`.
  ///
  /// # Safety
  ///
  /// No other thread may write element `i` during the launch.
  #[inline(always)]
  #[track_caller]
  pub unsafe fn get(&self, i : usize) -> T {
    check_bounds(i, self.len);
    self.ptr.add(i).read()
  }

  /// Write element `i`.
  ///
  /// # Safety
  ///
  /// No other thread may access element `i` during the launch.
  #[inline(always)]
  #[track_caller]
  pub unsafe fn set(&self, i : usize, val : T) {
    check_bounds(i, self.len);
    self.ptr.add(i).write(val)
  }
}

// Information given to thread so it can determine its identity.
pub struct My<'a> {
  // Grid and block dimensions
  pub grid_dim : Dim2,
  pub block_dim : Dim2,

  // Block and thread indices
  pub block_idx : Dim2,
  pub thread_idx : Dim2,

  // Barrier shared by the threads of this block
  barrier : &'a GroupBarrier,
}

/// Counters gathered for one kernel launch.
#[derive(Clone, Copy, Debug)]
pub struct LaunchStats {
  /// Blocks in the grid
  pub blocks : usize,
  /// Threads in each block
  pub threads_per_block : usize,
  /// Blocks executing concurrently
  pub resident_blocks : usize,
  /// Block-wide barriers completed, including the one ending each block
  pub barriers : u64,
  /// Wall-clock time from spawning workers to joining them
  pub elapsed : Duration,
}

impl LaunchStats {
  pub fn threads(&self) -> usize { self.resident_blocks * self.threads_per_block }
}

// Traits
// ======

/// The code for a kernel.
pub trait Code : Sync {
  /// Bytes of shared local memory each block allocates with [`alloc`].
  ///
  /// Checked against the platform budget before launch.
  fn shared_bytes(&self, _dims : &Dims) -> usize { 0 }

  /// Reject a launch geometry the kernel cannot run over safely.
  ///
  /// Called before any worker is spawned.
  fn check(&self, _dims : &Dims) -> Result<()> { Ok(()) }

  fn run(my : &My<'_>, shared : &mut Mem<'_>, params : &Self);
}

// Convergence and synchronisation
// ===============================

/// Barrier synchronisation over the threads of the calling block.
///
/// Every thread of the block must reach each call.
#[inline(always)]
pub fn syncthreads(my : &My<'_>) { my.barrier.wait() }

// Host-side worker
// ================

// Resources owned by one resident block
struct Slot {
  barrier : GroupBarrier,
  arena : Arena,
}

// Poison the block barrier if the owning thread unwinds
struct PoisonOnUnwind<'s>(&'s GroupBarrier);

impl Drop for PoisonOnUnwind<'_> {
  fn drop(&mut self) {
    if thread::panicking() { self.0.poison() }
  }
}

struct Worker<'s> {
  dims : Dims,
  // Index of this worker's slot, and number of slots
  slot_idx : usize,
  resident : usize,
  // Linear thread index within the block
  thread : usize,
  slot : &'s Slot,
  gate : &'s LaunchGate,
}

impl Worker<'_> {
  fn run<K : Code>(self, params : &K) {
    if !self.gate.wait() { return }
    let _guard = PoisonOnUnwind(&self.slot.barrier);

    let grid_dim = self.dims.grid_dim;
    let block_dim = self.dims.block_dim;
    let mut my =
      My {
        grid_dim,
        block_dim,
        block_idx: Dim2 { x: 0, y: 0 },
        thread_idx: Dim2 { x: self.thread % block_dim.x,
                           y: self.thread / block_dim.x },
        barrier: &self.slot.barrier,
      };

    let blocks = grid_dim.count();
    let mut b = self.slot_idx;
    while b < blocks {
      my.block_idx = Dim2 { x: b % grid_dim.x, y: b / grid_dim.x };
      let mut mem = self.slot.arena.mem();
      K::run(&my, &mut mem, params);
      // Shared local memory is reused by the slot's next block
      syncthreads(&my);
      b += self.resident;
    }
  }
}

fn panic_message(payload : Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

// Host-side kernel invocation
// ===========================

// Reject launches the platform cannot run
fn check_launch(platform : &Platform, dims : &Dims, shared_bytes : usize) -> Result<()> {
  let overflow = dims.grid_dim.x.checked_mul(dims.grid_dim.y).is_none();
  if overflow || dims.block_dim.count() == 0 || dims.grid_dim.count() == 0 {
    return Err(NoclError::InvalidGeometry(format!(
      "block {}x{}, grid {}x{}",
      dims.block_dim.x, dims.block_dim.y, dims.grid_dim.x, dims.grid_dim.y)));
  }
  let threads = dims.block_dim.count();
  if threads > platform.simt_threads() {
    return Err(NoclError::BlockTooLarge { threads, max: platform.simt_threads() });
  }
  if shared_bytes > platform.shared_bytes_per_block {
    return Err(NoclError::SharedMemoryExceeded {
      requested: shared_bytes,
      budget: platform.shared_bytes_per_block
    });
  }
  Ok(())
}

/// Run the given kernel over `dims`.
///
/// The launch is validated first; a rejected launch runs no thread.
/// Once all worker threads exist they are released together, and the
/// call returns after every block has finished.
pub fn nocl_run_kernel<K : Code>(platform : &Platform, dims : &Dims, params : &K)
  -> Result<LaunchStats>
{
  let checked = params.check(dims).and_then(|()| {
    let shared_bytes = params.shared_bytes(dims);
    check_launch(platform, dims, shared_bytes).map(|()| shared_bytes)
  });
  let shared_bytes = match checked {
    Ok(bytes) => bytes,
    Err(e) => {
      warn!("NoCL: launch rejected: {e}");
      return Err(e);
    }
  };

  let threads_per_block = dims.block_dim.count();
  let blocks = dims.grid_dim.count();
  let resident = (platform.simt_threads() / threads_per_block).min(blocks);
  debug!("NoCL: grid {}x{} of {}x{} blocks, {} resident, {} shared bytes",
         dims.grid_dim.x, dims.grid_dim.y, dims.block_dim.x, dims.block_dim.y,
         resident, shared_bytes);

  let slots : Vec<Slot> =
    (0 .. resident)
      .map(|_| Slot { barrier: GroupBarrier::new(threads_per_block),
                      arena: Arena::new(shared_bytes) })
      .collect();
  let gate = LaunchGate::new();
  let start = Instant::now();

  let (spawn_err, failures) = thread::scope(|s| {
    let mut handles = Vec::with_capacity(resident * threads_per_block);
    let mut spawn_err = None;
    'spawn: for (slot_idx, slot) in slots.iter().enumerate() {
      for tid in 0 .. threads_per_block {
        let worker = Worker { dims: *dims, slot_idx, resident, thread: tid, slot, gate: &gate };
        let spawned = thread::Builder::new()
          .name(format!("nocl-{slot_idx}-{tid}"))
          .stack_size(platform.worker_stack_bytes)
          .spawn_scoped(s, move || worker.run(params));
        match spawned {
          Ok(h) => handles.push(h),
          Err(e) => { spawn_err = Some(e); break 'spawn }
        }
      }
    }

    // Release the workers only if the whole geometry is in place
    if spawn_err.is_some() { gate.cancel() } else { gate.open() }

    let failures : Vec<String> =
      handles.into_iter()
             .filter_map(|h| h.join().err())
             .map(panic_message)
             .collect();
    (spawn_err, failures)
  });

  if let Some(e) = spawn_err {
    warn!("NoCL: launch cancelled: {e}");
    return Err(NoclError::WorkerSpawn(e));
  }

  // Report the root cause rather than a peer released by poisoning
  let cause = failures.iter()
                      .find(|m| m.as_str() != prims::BARRIER_POISONED)
                      .or_else(|| failures.first());
  if let Some(msg) = cause {
    return Err(NoclError::KernelFailed(msg.clone()));
  }

  Ok(LaunchStats {
    blocks,
    threads_per_block,
    resident_blocks: resident,
    barriers: slots.iter().map(|s| s.barrier.generation()).sum(),
    elapsed: start.elapsed(),
  })
}

/// Run the given kernel and log the launch statistics.
pub fn nocl_run_kernel_verbose<K : Code>(platform : &Platform, dims : &Dims, params : &K)
  -> Result<LaunchStats>
{
  let ret = nocl_run_kernel(platform, dims, params);
  match &ret {
    Ok(stats) => {
      info!("Blocks: {}", stats.blocks);
      info!("Threads: {}", stats.threads());
      info!("Barriers: {}", stats.barriers);
      info!("Elapsed: {:?}", stats.elapsed);
    }
    Err(e) => error!("Kernel failed: {e}"),
  }
  ret
}
