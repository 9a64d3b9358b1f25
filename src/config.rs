//! Description of the emulated SIMT device.

use crate::prims::config;

/// Resources a kernel launch may use.
///
/// Defaults come from [`prims::config`](crate::prims::config).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Platform {
  /// Threads per warp; also the lane count used for bank analysis.
  pub simt_lanes : usize,
  /// Warps available for resident blocks.
  pub simt_warps : usize,
  /// Number of 4-byte banks in shared local memory.
  pub sram_banks : usize,
  /// Shared local memory budget of one block, in bytes.
  pub shared_bytes_per_block : usize,
  /// Stack size of each host worker thread.
  pub worker_stack_bytes : usize,
}

impl Default for Platform {
  fn default() -> Self {
    Platform {
      simt_lanes: config::SIMT_LANES,
      simt_warps: config::SIMT_WARPS,
      sram_banks: config::SRAM_BANKS,
      shared_bytes_per_block: config::SHARED_LOCAL_BYTES,
      worker_stack_bytes: config::WORKER_STACK_BYTES,
    }
  }
}

impl Platform {
  /// Total number of SIMT threads; bounds the size of one block.
  pub fn simt_threads(&self) -> usize {
    self.simt_lanes.saturating_mul(self.simt_warps)
  }

  pub fn with_warps(mut self, warps : usize) -> Self {
    self.simt_warps = warps;
    self
  }

  pub fn with_lanes(mut self, lanes : usize) -> Self {
    self.simt_lanes = lanes;
    self
  }

  pub fn with_sram_banks(mut self, banks : usize) -> Self {
    self.sram_banks = banks;
    self
  }

  pub fn with_shared_bytes_per_block(mut self, bytes : usize) -> Self {
    self.shared_bytes_per_block = bytes;
    self
  }

  pub fn with_worker_stack_bytes(mut self, bytes : usize) -> Self {
    self.worker_stack_bytes = bytes;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_matches_constants() {
    let p = Platform::default();
    assert_eq!(p.simt_threads(), config::SIMT_LANES * config::SIMT_WARPS);
    assert_eq!(p.shared_bytes_per_block, 48 * 1024);
  }

  #[test]
  fn builders_override_fields() {
    let p = Platform::default()
              .with_warps(2)
              .with_lanes(4)
              .with_sram_banks(16)
              .with_shared_bytes_per_block(1024);
    assert_eq!(p.simt_threads(), 8);
    assert_eq!(p.sram_banks, 16);
    assert_eq!(p.shared_bytes_per_block, 1024);
  }
}
