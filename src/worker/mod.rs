//! Worker side of a benchmark
//!
//! A worker executes its share of each round: it paces submissions through a
//! rate controller, reports progress every second and returns the final
//! statistics. [`runner`] holds the round loop; [`process`] wires it to a parent
//! over stdin/stdout.

pub mod process;
pub mod runner;

pub use runner::{trim_results, WorkerRunner, DEFAULT_UPDATE_INTERVAL};
