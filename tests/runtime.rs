use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use nocl_transpose::rand::Rand15;
use nocl_transpose::*;

// Kernels
// =======

// Per-block tree reduction in shared local memory
struct Reduce<'t> {
  input : &'t [i32],
  sums  : Global<'t, i64>
}

impl Code for Reduce<'_> {
  fn shared_bytes(&self, dims : &Dims) -> usize {
    dims.block_dim.x * mem::size_of::<i64>()
  }

  fn run(my : &My<'_>, shared : &mut Mem<'_>, params : &Self) {
    let block = alloc::<i64>(shared, my.block_dim.x);
    let tx = my.thread_idx.x;

    // Sum global memory
    let first = my.block_idx.x * my.block_dim.x + tx;
    let stride = my.block_dim.x * my.grid_dim.x;
    let mut acc : i64 = 0;
    for i in (first .. params.input.len()).step_by(stride) {
      acc += params.input[i] as i64
    }
    unsafe { block.set(tx, acc) }

    syncthreads(my);

    // Sum shared local memory
    let mut i = my.block_dim.x >> 1;
    while i > 0 {
      if tx < i {
        unsafe { block.set(tx, block.get(tx) + block.get(tx + i)) }
      }
      syncthreads(my);
      i >>= 1
    }

    // Write sum to global memory
    if tx == 0 { unsafe { params.sums.set(my.block_idx.x, block.get(0)) } }
  }
}

// Counts how many threads ran
struct Counter {
  shared : usize,
  ran    : AtomicUsize
}

impl Code for Counter {
  fn shared_bytes(&self, _dims : &Dims) -> usize { self.shared }

  fn run(_my : &My<'_>, _shared : &mut Mem<'_>, params : &Counter) {
    params.ran.fetch_add(1, Ordering::SeqCst);
  }
}

// One thread of every block fails before the barrier
struct Faulty;

impl Code for Faulty {
  fn run(my : &My<'_>, _shared : &mut Mem<'_>, _params : &Faulty) {
    if my.thread_idx.x == 3 { panic!("thread 3 faulted") }
    syncthreads(my);
  }
}

// Allocates more shared memory than it declares
struct Greedy;

impl Code for Greedy {
  fn shared_bytes(&self, _dims : &Dims) -> usize { 16 }

  fn run(_my : &My<'_>, shared : &mut Mem<'_>, _params : &Greedy) {
    let _ = alloc::<u32>(shared, 4);
    let _ = alloc::<u32>(shared, 1);
  }
}

fn dims(block_x : usize, block_y : usize, grid_x : usize, grid_y : usize) -> Dims {
  Dims { block_dim: Dim2 { x: block_x, y: block_y },
         grid_dim: Dim2 { x: grid_x, y: grid_y } }
}

// ============================================================
// Tests
// ============================================================

#[test]
fn reduce_uses_repeated_barriers() {
  const N : usize = 3000;
  let input : Vec<i32> = Rand15::new(1).take(N).map(|r| r as i32).collect();
  let mut sums = vec![0i64; 8];
  let params = Reduce { input: &input, sums: Global::from(&mut sums[..]) };

  let stats = nocl_run_kernel(&Platform::default(), &dims(64, 1, 8, 1), &params).unwrap();

  let expected : i64 = input.iter().map(|&x| x as i64).sum();
  assert_eq!(sums.iter().sum::<i64>(), expected);
  // Load, six tree levels and the end of each block
  assert_eq!(stats.barriers, 8 * 8);
  assert_eq!(stats.resident_blocks, 8);
}

#[test]
fn every_thread_runs_once_per_block() {
  let params = Counter { shared: 0, ran: AtomicUsize::new(0) };
  let stats = nocl_run_kernel(&Platform::default(), &dims(4, 2, 5, 3), &params).unwrap();
  assert_eq!(params.ran.load(Ordering::SeqCst), 8 * 15);
  assert_eq!(stats.blocks, 15);
  assert_eq!(stats.barriers, 15);
}

#[test]
fn verbose_launch_returns_stats() {
  let params = Counter { shared: 0, ran: AtomicUsize::new(0) };
  let stats = nocl_run_kernel_verbose(&Platform::default(), &dims(2, 2, 2, 2), &params).unwrap();
  assert_eq!(stats.threads(), stats.resident_blocks * 4);
  assert_eq!(params.ran.load(Ordering::SeqCst), 16);
}

#[test]
fn shared_memory_over_budget_runs_nothing() {
  let platform = Platform::default();
  let params = Counter { shared: platform.shared_bytes_per_block + 1, ran: AtomicUsize::new(0) };
  let err = nocl_run_kernel(&platform, &dims(32, 1, 4, 1), &params).unwrap_err();
  assert!(matches!(err, NoclError::SharedMemoryExceeded { .. }));
  assert_eq!(err.kind(), ErrorKind::Configuration);
  assert_eq!(params.ran.load(Ordering::SeqCst), 0);
}

#[test]
fn oversize_and_empty_geometry_run_nothing() {
  let params = Counter { shared: 0, ran: AtomicUsize::new(0) };
  let err = nocl_run_kernel(&Platform::default(), &dims(64, 32, 1, 1), &params).unwrap_err();
  assert!(matches!(err, NoclError::BlockTooLarge { threads: 2048, max: 512 }));

  let err = nocl_run_kernel(&Platform::default(), &dims(8, 0, 1, 1), &params).unwrap_err();
  assert!(matches!(err, NoclError::InvalidGeometry(_)));
  assert_eq!(params.ran.load(Ordering::SeqCst), 0);
}

#[test]
fn failed_thread_fails_launch_without_deadlock() {
  let err = nocl_run_kernel(&Platform::default(), &dims(8, 1, 4, 1), &Faulty).unwrap_err();
  match err {
    NoclError::KernelFailed(msg) => assert_eq!(msg, "thread 3 faulted"),
    other => panic!("unexpected error: {other}"),
  }
}

#[test]
fn shared_memory_exhaustion_fails_kernel() {
  let err = nocl_run_kernel(&Platform::default(), &dims(4, 1, 2, 1), &Greedy).unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Kernel);
  assert!(err.to_string().contains("shared local memory exhausted"));
}

#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
#[test]
fn spawn_failure_cancels_launch() {
  // No address space can hold a 1 EiB stack
  let platform = Platform::default().with_worker_stack_bytes(1 << 60);
  let params = Counter { shared: 0, ran: AtomicUsize::new(0) };
  let err = nocl_run_kernel(&platform, &dims(4, 1, 4, 1), &params).unwrap_err();
  assert!(matches!(err, NoclError::WorkerSpawn(_)));
  assert_eq!(params.ran.load(Ordering::SeqCst), 0);
}
