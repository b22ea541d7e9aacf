//! Dual-stack address helpers: subnet slicing and forward/reverse host
//! enumeration over v4 and v6.

pub mod subnet;

pub use subnet::{DualStackIp, DualStackSubnet};
