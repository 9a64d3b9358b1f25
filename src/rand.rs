// Pseudo-random inputs for kernels and self tests.

// Linear congruential generator yielding 15-bit values
pub fn rand15(seed : &mut u32) -> u32 {
  *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223) & 0x7fffffff;
  *seed >> 16
}

/// Endless stream of [`rand15`] values from a fixed seed.
#[derive(Clone, Debug)]
pub struct Rand15 {
  seed : u32
}

impl Rand15 {
  pub fn new(seed : u32) -> Self { Rand15 { seed } }
}

impl Iterator for Rand15 {
  type Item = u32;

  fn next(&mut self) -> Option<u32> {
    Some(rand15(&mut self.seed))
  }
}
