//! Error types for kernel launches.

use thiserror::Error;

/// Result type for NoCL operations.
pub type Result<T> = std::result::Result<T, NoclError>;

/// Broad classification of a [`NoclError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
  /// Launch geometry or resource request the platform cannot satisfy.
  /// Raised before any worker runs.
  Configuration,
  /// Caller-supplied buffers do not match the stated shape.
  /// Raised before any worker runs.
  Precondition,
  /// A NoCL thread failed while the kernel was running.
  Kernel,
}

/// Errors that can occur when launching a kernel.
#[derive(Error, Debug)]
pub enum NoclError {
  /// Zero-sized grid or block, or a zero tile parameter.
  #[error("invalid launch geometry: {0}")]
  InvalidGeometry(String),

  /// Block rows do not evenly divide the tile.
  #[error("tile dim {tile_dim} is not a multiple of block rows {block_rows}")]
  BlockRowsMisaligned {
    /// Tile side length
    tile_dim : usize,
    /// Rows of threads per block
    block_rows : usize,
  },

  /// Matrix is not a whole number of tiles.
  #[error("{rows}x{cols} matrix is not a whole number of {tile_dim}x{tile_dim} tiles")]
  TileMisaligned {
    /// Source rows
    rows : usize,
    /// Source columns
    cols : usize,
    /// Tile side length
    tile_dim : usize,
  },

  /// Block has more threads than the platform provides.
  #[error("block of {threads} threads exceeds the {max} SIMT threads available")]
  BlockTooLarge {
    /// Threads requested per block
    threads : usize,
    /// SIMT threads on the platform
    max : usize,
  },

  /// Kernel asks for more shared local memory than a block may use.
  #[error("kernel requests {requested} bytes of shared local memory, budget is {budget}")]
  SharedMemoryExceeded {
    /// Bytes requested per block
    requested : usize,
    /// Bytes available per block
    budget : usize,
  },

  /// Element type is more strictly aligned than shared local memory.
  #[error("element alignment {align} exceeds shared memory alignment {max}")]
  UnsupportedElement {
    /// Alignment of the element type
    align : usize,
    /// Alignment of the shared memory arena
    max : usize,
  },

  /// The host could not create the worker threads for a launch.
  #[error("failed to spawn NoCL worker thread: {0}")]
  WorkerSpawn(#[from] std::io::Error),

  /// Buffer length does not match the matrix shape.
  #[error("{buffer} buffer holds {actual} elements, expected {expected}")]
  BufferSize {
    /// Which buffer
    buffer : &'static str,
    /// Elements implied by the shape
    expected : usize,
    /// Elements provided
    actual : usize,
  },

  /// Kernel was launched over a geometry other than the one it was built for.
  #[error("kernel built for {expected:?}, launched over {actual:?}")]
  DimsMismatch {
    /// Geometry the kernel was validated against
    expected : crate::nocl::Dims,
    /// Geometry of the launch
    actual : crate::nocl::Dims,
  },

  /// A NoCL thread panicked during execution.
  #[error("kernel failed: {0}")]
  KernelFailed(String),
}

impl NoclError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      NoclError::InvalidGeometry(_)
      | NoclError::BlockRowsMisaligned { .. }
      | NoclError::TileMisaligned { .. }
      | NoclError::BlockTooLarge { .. }
      | NoclError::SharedMemoryExceeded { .. }
      | NoclError::UnsupportedElement { .. }
      | NoclError::WorkerSpawn(_) => ErrorKind::Configuration,
      NoclError::BufferSize { .. }
      | NoclError::DimsMismatch { .. } => ErrorKind::Precondition,
      NoclError::KernelFailed(_) => ErrorKind::Kernel,
    }
  }
}
