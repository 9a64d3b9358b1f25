//! Host-side port of the NoCL SIMT runtime, with a shared-memory blocked
//! matrix transpose.
//!
//! Kernels implement [`Code`] and are launched over a grid of blocks with
//! [`nocl_run_kernel`].  Every NoCL thread runs on its own OS thread; the
//! threads of a block share a barrier ([`syncthreads`]) and a region of
//! shared local memory ([`alloc`]).
//!
//! ```
//! use nocl_transpose::{transpose, reference_transpose, Platform, TilePlan};
//!
//! let (rows, cols) = (64, 96);
//! let src : Vec<f32> = (0 .. rows * cols).map(|i| i as f32).collect();
//! let mut dst = vec![0.0; rows * cols];
//!
//! let plan = TilePlan::new(32, 8).unwrap();
//! let stats = transpose(&Platform::default(), &plan, &src, &mut dst, rows, cols).unwrap();
//!
//! assert_eq!(dst, reference_transpose(&src, rows, cols));
//! assert_eq!(stats.blocks, 6);
//! ```
//!
//! ## Cargo features
//!
//! - `large_data_set`: larger matrices in the self test and benchmarks
//! - `disable_bounds_checks`: drop index assertions in [`Shared`] and
//!   [`Global`] accessors

pub mod config;
pub mod error;
pub mod nocl;
pub mod prims;
pub mod rand;
pub mod transpose;

pub use config::Platform;
pub use error::{ErrorKind, NoclError, Result};
pub use nocl::{
  alloc, nocl_run_kernel, nocl_run_kernel_verbose, syncthreads, Code, Dim2, Dims, Element,
  Global, LaunchStats, Mem, My, Shared,
};
pub use transpose::{
  reference_transpose, transpose, transpose_naive, BlockedTranspose, NaiveTranspose, TilePlan,
};
