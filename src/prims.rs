// Host primitives for NoCL.
//
// On the SIMT device these are CSR accesses and hardware barriers.  On the
// host, a block of NoCL threads is a set of OS threads, so the barrier is a
// mutex/condvar rendezvous scoped to exactly one block.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

// Platform constants
// ==================

pub mod config {
  // Threads per warp
  pub const SIMT_LOG_LANES : usize = 5;
  pub const SIMT_LANES : usize = 1 << SIMT_LOG_LANES;

  // Warps available for resident blocks
  pub const SIMT_LOG_WARPS : usize = 4;
  pub const SIMT_WARPS : usize = 1 << SIMT_LOG_WARPS;

  // Shared local memory is split into 4-byte wide banks
  pub const SIMT_LOG_SRAM_BANKS : usize = 5;
  pub const SRAM_BANKS : usize = 1 << SIMT_LOG_SRAM_BANKS;

  // Shared local memory available to one block, in bytes
  pub const SHARED_LOCAL_BYTES : usize = 48 * 1024;

  // Stack given to each host worker thread
  pub const WORKER_STACK_BYTES : usize = 256 * 1024;
}

// Assertions
// ==========

// Message carried by threads that unwind because a peer failed
pub const BARRIER_POISONED : &str = "NoCL: block barrier poisoned by a failed thread";

// Abort the calling NoCL thread if `cond` does not hold
#[inline(always)]
#[track_caller]
pub fn simt_assert(cond : bool, msg : &str) {
  if !cond { panic!("{}", msg) }
}

fn lock<T>(m : &Mutex<T>) -> MutexGuard<'_, T> {
  // Barrier state is updated atomically under the lock, so a guard
  // recovered from a poisoned mutex is still consistent
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

// Block barrier
// =============

struct BarrierState {
  // Threads that have arrived in the current generation
  arrived : usize,
  // Number of completed barriers
  generation : u64,
  // Set when a thread of the block failed
  poisoned : bool,
}

/// Rendezvous for the threads of one block.
///
/// `wait` returns once all `threads` members have called it in the
/// current generation.  A failing member calls `poison`, which releases
/// all current and future waiters by unwinding them, so a block never
/// deadlocks on a dead peer.
pub struct GroupBarrier {
  threads : usize,
  state : Mutex<BarrierState>,
  cvar : Condvar,
}

impl GroupBarrier {
  pub fn new(threads : usize) -> Self {
    GroupBarrier {
      threads,
      state: Mutex::new(BarrierState { arrived: 0, generation: 0, poisoned: false }),
      cvar: Condvar::new(),
    }
  }

  /// Number of times the barrier has been passed by the whole block.
  pub fn generation(&self) -> u64 { lock(&self.state).generation }

  pub fn is_poisoned(&self) -> bool { lock(&self.state).poisoned }

  /// Block until every member of the group has arrived.
  ///
  /// # Panics
  ///
  /// Panics with [`BARRIER_POISONED`] if the barrier is or becomes
  /// poisoned before the generation completes.
  pub fn wait(&self) {
    let mut st = lock(&self.state);
    simt_assert(!st.poisoned, BARRIER_POISONED);
    let gen = st.generation;
    st.arrived += 1;
    if st.arrived == self.threads {
      st.arrived = 0;
      st.generation += 1;
      self.cvar.notify_all();
      return
    }
    while st.generation == gen && !st.poisoned {
      st = self.cvar.wait(st).unwrap_or_else(PoisonError::into_inner);
    }
    simt_assert(st.generation != gen, BARRIER_POISONED);
  }

  /// Release all waiters; they unwind instead of returning.
  pub fn poison(&self) {
    lock(&self.state).poisoned = true;
    self.cvar.notify_all();
  }
}

// Launch gate
// ===========

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum GateState { Closed, Open, Cancelled }

/// Holds spawned workers until the whole launch geometry is in place.
///
/// Workers call `wait` before touching any kernel state; it returns
/// `true` once the host opens the gate and `false` if it cancels the
/// launch instead.
pub struct LaunchGate {
  state : Mutex<GateState>,
  cvar : Condvar,
}

impl LaunchGate {
  pub fn new() -> Self {
    LaunchGate { state: Mutex::new(GateState::Closed), cvar: Condvar::new() }
  }

  pub fn open(&self) { self.set(GateState::Open) }

  pub fn cancel(&self) { self.set(GateState::Cancelled) }

  fn set(&self, s : GateState) {
    *lock(&self.state) = s;
    self.cvar.notify_all();
  }

  pub fn wait(&self) -> bool {
    let mut st = lock(&self.state);
    while *st == GateState::Closed {
      st = self.cvar.wait(st).unwrap_or_else(PoisonError::into_inner);
    }
    *st == GateState::Open
  }
}

impl Default for LaunchGate {
  fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::thread;

  #[test]
  fn barrier_orders_phases() {
    let threads = 8;
    let barrier = GroupBarrier::new(threads);
    let before = AtomicUsize::new(0);
    thread::scope(|s| {
      for _ in 0 .. threads {
        s.spawn(|| {
          before.fetch_add(1, Ordering::SeqCst);
          barrier.wait();
          assert_eq!(before.load(Ordering::SeqCst), threads);
          barrier.wait();
        });
      }
    });
    assert_eq!(barrier.generation(), 2);
  }

  #[test]
  fn single_thread_barrier_never_blocks() {
    let barrier = GroupBarrier::new(1);
    for _ in 0 .. 5 { barrier.wait() }
    assert_eq!(barrier.generation(), 5);
  }

  #[test]
  fn poison_releases_waiters() {
    let barrier = GroupBarrier::new(3);
    let results = thread::scope(|s| {
      let waiters : Vec<_> =
        (0 .. 2).map(|_| s.spawn(|| barrier.wait())).collect();
      // Let the waiters park before the third member fails
      while lock(&barrier.state).arrived < 2 { thread::yield_now() }
      barrier.poison();
      waiters.into_iter().map(|h| h.join().is_err()).collect::<Vec<_>>()
    });
    assert_eq!(results, vec![true, true]);
    assert!(barrier.is_poisoned());
    assert_eq!(barrier.generation(), 0);
  }

  #[test]
  fn gate_open_and_cancel() {
    let gate = LaunchGate::new();
    thread::scope(|s| {
      let h = s.spawn(|| gate.wait());
      gate.open();
      assert!(h.join().unwrap());
    });

    let gate = LaunchGate::new();
    gate.cancel();
    assert!(!gate.wait());
  }
}
