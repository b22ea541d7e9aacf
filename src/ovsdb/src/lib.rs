//! Transactional client for the NB, SB, and local OVS databases: the
//! UUID-retry discipline, barrier-commit sync, and every topology
//! operation the harness issues against them (spec.md §3-4).

pub mod connection;
pub mod nb;
pub mod ovs;
pub mod sb;
pub mod schema;
pub mod sync;
pub mod transaction;
pub mod types;

pub use connection::{OvsdbConnection, TcpOvsdbConnection};
pub use nb::NbClient;
pub use ovs::OvsClient;
pub use sb::SbClient;
pub use schema::Monitor;
