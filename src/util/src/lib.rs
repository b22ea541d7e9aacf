//! Internal utility library for ovn-heater: error taxonomy, retry with
//! backoff, and tracing setup. The harness-wide equivalent of `mz-ore`.

pub mod error;
pub mod logging;
pub mod retry;

pub use error::{Error, Result, WaitType};
