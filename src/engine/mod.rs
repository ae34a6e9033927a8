// Pure book math: no I/O, no clocks
pub mod grid;   // raw levels -> fixed-step display grid
pub mod types;  // instrument, levels, grid rows, feed updates
