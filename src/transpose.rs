//! Matrix transpose kernels.
//!
//! [`BlockedTranspose`] stages one `tile_dim × tile_dim` square of the
//! source in shared local memory, synchronises the block, and writes the
//! square back at the mirrored tile position.  Reads from the source and
//! writes to the destination both walk rows, so neighbouring threads touch
//! neighbouring addresses; the column walk happens in shared memory.
//!
//! The staging square has one padding column (`tile_dim + 1` elements per
//! row).  This is an anti-aliasing stride adjustment: reading a column of
//! an unpadded square puts every lane of a warp on the same SRAM bank,
//! while the odd stride spreads them across banks.  It has no effect on the
//! result.
//!
//! [`NaiveTranspose`] is the unstaged baseline.

use core::mem;

use log::warn;

use crate::config::Platform;
use crate::error::{NoclError, Result};
use crate::nocl::*;

/// Tile geometry shared by both transpose kernels.
///
/// A block is `tile_dim × block_rows` threads; each thread moves
/// `tile_dim / block_rows` elements of its tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TilePlan {
  tile_dim : usize,
  block_rows : usize,
}

impl Default for TilePlan {
  fn default() -> Self {
    TilePlan { tile_dim: 32, block_rows: 8 }
  }
}

impl TilePlan {
  pub fn new(tile_dim : usize, block_rows : usize) -> Result<Self> {
    if tile_dim == 0 || block_rows == 0 {
      return Err(NoclError::InvalidGeometry(format!(
        "tile dim {tile_dim}, block rows {block_rows}")));
    }
    if tile_dim % block_rows != 0 {
      return Err(NoclError::BlockRowsMisaligned { tile_dim, block_rows });
    }
    if tile_dim.checked_add(1).and_then(|stride| stride.checked_mul(tile_dim)).is_none() {
      return Err(NoclError::InvalidGeometry(format!("tile dim {tile_dim} overflows staging")));
    }
    Ok(TilePlan { tile_dim, block_rows })
  }

  pub fn tile_dim(&self) -> usize { self.tile_dim }

  pub fn block_rows(&self) -> usize { self.block_rows }

  /// Elements per row of the staging square, including the padding column.
  pub fn staging_stride(&self) -> usize { self.tile_dim + 1 }

  pub fn staging_len(&self) -> usize { self.tile_dim * self.staging_stride() }

  /// Staging square size in bytes, saturating at `usize::MAX`.
  pub fn staging_bytes<T>(&self) -> usize {
    self.staging_len().saturating_mul(mem::size_of::<T>())
  }

  /// Launch geometry for a `rows × cols` source matrix.
  pub fn dims(&self, rows : usize, cols : usize) -> Result<Dims> {
    if rows == 0 || cols == 0 {
      return Err(NoclError::InvalidGeometry(format!("{rows}x{cols} matrix")));
    }
    if rows % self.tile_dim != 0 || cols % self.tile_dim != 0 {
      return Err(NoclError::TileMisaligned { rows, cols, tile_dim: self.tile_dim });
    }
    Ok(Dims {
      block_dim: Dim2 { x: self.tile_dim, y: self.block_rows },
      grid_dim: Dim2 { x: cols / self.tile_dim, y: rows / self.tile_dim }
    })
  }

  /// Worst-case lanes sharing a bank when one row of threads reads a
  /// column of the staging square.
  pub fn column_read_conflicts<T>(&self, platform : &Platform) -> usize {
    let words_per_elem = mem::size_of::<T>().div_ceil(4).max(1);
    bank_conflict_degree(self.staging_stride() * words_per_elem,
                         platform.simt_lanes.min(self.tile_dim),
                         platform.sram_banks)
  }
}

/// Maximum number of `lanes` that hit one of `banks` 4-byte banks when
/// lane `i` accesses word `i * stride_words`.
pub fn bank_conflict_degree(stride_words : usize, lanes : usize, banks : usize) -> usize {
  let banks = banks.max(1);
  let mut hits = vec![0usize; banks];
  for lane in 0 .. lanes {
    hits[(lane * stride_words) % banks] += 1
  }
  hits.into_iter().max().unwrap_or(0)
}

// Kernels
// =======

/// Transpose through a padded shared-memory square.
///
/// Block `(x, y)` handles source tile column `x`, tile row `y`; block
/// dimensions are `(tile_dim, block_rows)`.  Only launches over
/// [`BlockedTranspose::dims`] are accepted.
pub struct BlockedTranspose<'a, T> {
  plan : TilePlan,
  dims : Dims,
  rows : usize,
  cols : usize,
  input : &'a [T],
  output : Global<'a, T>,
}

impl<'a, T : Element> BlockedTranspose<'a, T> {
  /// Kernel moving the row-major `rows × cols` matrix `src` into `dst`.
  ///
  /// # Errors
  ///
  /// As [`transpose`], for everything checked before launch.
  pub fn new(plan : &TilePlan, src : &'a [T], dst : &'a mut [T],
             rows : usize, cols : usize) -> Result<Self> {
    let dims = prepare(plan, src, dst, rows, cols)?;
    Ok(BlockedTranspose { plan: *plan, dims, rows, cols, input: src, output: Global::from(dst) })
  }

  /// The only launch geometry this kernel runs over.
  pub fn dims(&self) -> Dims { self.dims }
}

impl<T : Element> Code for BlockedTranspose<'_, T> {
  fn shared_bytes(&self, _dims : &Dims) -> usize { self.plan.staging_bytes::<T>() }

  fn check(&self, dims : &Dims) -> Result<()> { same_dims(&self.dims, dims) }

  #[inline(always)]
  fn run(my : &My<'_>, shared : &mut Mem<'_>, params : &Self) {
    let tile_dim = params.plan.tile_dim;
    let block_rows = params.plan.block_rows;
    let stride = params.plan.staging_stride();
    let square = alloc::<T>(shared, params.plan.staging_len());

    let (worker_col, worker_row) = (my.thread_idx.x, my.thread_idx.y);
    let (tile_col, tile_row) = (my.block_idx.x, my.block_idx.y);

    // Load square
    let base_col = tile_col * tile_dim + worker_col;
    let base_row = tile_row * tile_dim + worker_row;
    for j in (0 .. tile_dim).step_by(block_rows) {
      let val = params.input[(base_row + j) * params.cols + base_col];
      // SAFETY: each cell of the square has exactly one writer and no
      // reader before the barrier
      unsafe { square.set((worker_row + j) * stride + worker_col, val) }
    }

    syncthreads(my);

    // Store square at the mirrored tile position
    let out_col = tile_row * tile_dim + worker_col;
    let out_row = tile_col * tile_dim + worker_row;
    for j in (0 .. tile_dim).step_by(block_rows) {
      // SAFETY: the square is read-only after the barrier; the launch
      // geometry is the validated one, so each destination element is in
      // bounds and has exactly one writer
      unsafe {
        let val = square.get(worker_col * stride + worker_row + j);
        params.output.set((out_row + j) * params.rows + out_col, val)
      }
    }
  }
}

/// Transpose straight from global to global memory.
///
/// Uses the same geometry as [`BlockedTranspose`]; destination writes are
/// strided by `rows`.
pub struct NaiveTranspose<'a, T> {
  plan : TilePlan,
  dims : Dims,
  rows : usize,
  cols : usize,
  input : &'a [T],
  output : Global<'a, T>,
}

impl<'a, T : Element> NaiveTranspose<'a, T> {
  pub fn new(plan : &TilePlan, src : &'a [T], dst : &'a mut [T],
             rows : usize, cols : usize) -> Result<Self> {
    let dims = prepare(plan, src, dst, rows, cols)?;
    Ok(NaiveTranspose { plan: *plan, dims, rows, cols, input: src, output: Global::from(dst) })
  }

  pub fn dims(&self) -> Dims { self.dims }
}

impl<T : Element> Code for NaiveTranspose<'_, T> {
  fn check(&self, dims : &Dims) -> Result<()> { same_dims(&self.dims, dims) }

  #[inline(always)]
  fn run(my : &My<'_>, _shared : &mut Mem<'_>, params : &Self) {
    let tile_dim = params.plan.tile_dim;
    let col = my.block_idx.x * tile_dim + my.thread_idx.x;
    let row = my.block_idx.y * tile_dim + my.thread_idx.y;
    for j in (0 .. tile_dim).step_by(params.plan.block_rows) {
      let val = params.input[(row + j) * params.cols + col];
      // SAFETY: the launch geometry is the validated one, so each
      // destination element is in bounds and has exactly one writer
      unsafe { params.output.set(col * params.rows + row + j, val) }
    }
  }
}

fn same_dims(expected : &Dims, actual : &Dims) -> Result<()> {
  if expected != actual {
    return Err(NoclError::DimsMismatch { expected: *expected, actual: *actual });
  }
  Ok(())
}

// Host entry points
// =================

fn rejected(e : NoclError) -> NoclError {
  warn!("transpose rejected: {e}");
  e
}

// Validate everything the kernels rely on; nothing runs on failure
fn prepare<T>(plan : &TilePlan, src : &[T], dst : &[T], rows : usize, cols : usize)
  -> Result<Dims>
{
  let dims = plan.dims(rows, cols)?;
  let expected = rows.checked_mul(cols).ok_or_else(|| {
    NoclError::InvalidGeometry(format!("{rows}x{cols} matrix overflows usize"))
  })?;
  if src.len() != expected {
    return Err(NoclError::BufferSize { buffer: "source", expected, actual: src.len() });
  }
  if dst.len() != expected {
    return Err(NoclError::BufferSize { buffer: "destination", expected, actual: dst.len() });
  }
  if mem::align_of::<T>() > SHARED_ALIGN {
    return Err(NoclError::UnsupportedElement { align: mem::align_of::<T>(), max: SHARED_ALIGN });
  }
  Ok(dims)
}

/// Transpose the row-major `rows × cols` matrix `src` into `dst`
/// (`cols × rows`) with [`BlockedTranspose`].
///
/// # Errors
///
/// Configuration errors for misaligned shapes, oversize blocks or a
/// staging square over the shared memory budget; precondition errors for
/// buffers that do not match the shape.  In either case `dst` is left
/// untouched.
///
/// # Example
///
/// ```
/// use nocl_transpose::{transpose, Platform, TilePlan};
///
/// let src : Vec<i32> = (0 .. 16).collect();
/// let mut dst = vec![0; 16];
/// let plan = TilePlan::new(4, 1).unwrap();
/// transpose(&Platform::default(), &plan, &src, &mut dst, 4, 4).unwrap();
/// assert_eq!(&dst[..4], &[0, 4, 8, 12]);
/// ```
pub fn transpose<T : Element>(platform : &Platform, plan : &TilePlan,
                              src : &[T], dst : &mut [T],
                              rows : usize, cols : usize) -> Result<LaunchStats> {
  let kernel = BlockedTranspose::new(plan, src, dst, rows, cols).map_err(rejected)?;
  nocl_run_kernel(platform, &kernel.dims(), &kernel)
}

/// As [`transpose`], using [`NaiveTranspose`].
pub fn transpose_naive<T : Element>(platform : &Platform, plan : &TilePlan,
                                    src : &[T], dst : &mut [T],
                                    rows : usize, cols : usize) -> Result<LaunchStats> {
  let kernel = NaiveTranspose::new(plan, src, dst, rows, cols).map_err(rejected)?;
  nocl_run_kernel(platform, &kernel.dims(), &kernel)
}

/// Sequential transpose used to check the kernels.
///
/// # Panics
///
/// Panics if `src` does not hold `rows * cols` elements.
pub fn reference_transpose<T : Copy>(src : &[T], rows : usize, cols : usize) -> Vec<T> {
  assert_eq!(src.len(), rows * cols, "expected {}x{}={} elements", rows, cols, rows * cols);
  let mut out = Vec::with_capacity(src.len());
  for j in 0 .. cols {
    for i in 0 .. rows {
      out.push(src[i * cols + j])
    }
  }
  out
}
