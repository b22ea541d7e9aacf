//! The phase/iteration driver and timing sample collection (spec.md §4.7).

pub mod context;
pub mod stats;

pub use context::Context;
pub use stats::{timeit, Stats, GLOBAL_STATS};
