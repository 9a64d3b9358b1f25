// Self test: transpose a random matrix with the naive and blocked kernels.

use std::process::ExitCode;

use nocl_transpose::rand::Rand15;
use nocl_transpose::*;

// Benchmark
// =========

fn run<K : Code>(name : &str, platform : &Platform, dims : &Dims, params : &K) -> bool {
  log::info!("Kernel: {name}");
  match nocl_run_kernel_verbose(platform, dims, params) {
    Ok(stats) => {
      println!("{name}: {} blocks, {:?}", stats.blocks, stats.elapsed);
      true
    }
    Err(e) => {
      println!("{name}: {e}");
      false
    }
  }
}

fn main() -> ExitCode {
  env_logger::init();

  // Matrix size for benchmarking
  #[cfg(not(feature = "large_data_set"))]
  const WIDTH : usize = 256;
  #[cfg(not(feature = "large_data_set"))]
  const HEIGHT : usize = 64;
  #[cfg(feature = "large_data_set")]
  const WIDTH : usize = 2048;
  #[cfg(feature = "large_data_set")]
  const HEIGHT : usize = 2048;

  let platform = Platform::default();
  let plan = TilePlan::default();

  // Input and output matrix data
  let mat_in : Vec<i32> = Rand15::new(1).take(WIDTH * HEIGHT).map(|r| r as i32).collect();
  let mut naive_out : Vec<i32> = vec![0; WIDTH * HEIGHT];
  let mut blocked_out : Vec<i32> = vec![0; WIDTH * HEIGHT];

  let kernels = NaiveTranspose::new(&plan, &mat_in, &mut naive_out, HEIGHT, WIDTH)
    .and_then(|naive| {
      BlockedTranspose::new(&plan, &mat_in, &mut blocked_out, HEIGHT, WIDTH)
        .map(|blocked| (naive, blocked))
    });
  let (naive, blocked) = match kernels {
    Ok(kernels) => kernels,
    Err(e) => {
      eprintln!("{e}");
      return ExitCode::FAILURE;
    }
  };

  let mut ok = run("naive", &platform, &naive.dims(), &naive);
  ok = run("blocked", &platform, &blocked.dims(), &blocked) && ok;

  // Check result
  let expected = reference_transpose(&mat_in, HEIGHT, WIDTH);
  ok = ok && naive_out == expected && blocked_out == expected;

  // Display result
  println!("Self test: {}", if ok { "PASSED" } else { "FAILED" });
  if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
