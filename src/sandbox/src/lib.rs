//! The remote exec channel: run a shell command on a physical host or
//! container and return its exit status and captured output.

pub mod transport;

pub use transport::{testing, PhysicalNode, RunOpts, RunOutput, ShellTransport, Transport};
