//! Cluster/node/namespace model: bring-up, per-worker topology
//! provisioning, and the namespace/policy overlay (spec.md §4.4-4.6).

pub mod cluster;
pub mod lb;
pub mod namespace;
pub mod node;

pub use cluster::Cluster;
pub use namespace::Namespace;
pub use node::{BrExConfig, CentralNode, ClusterConfig, WorkerNode};
