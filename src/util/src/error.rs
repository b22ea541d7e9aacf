//! The error taxonomy shared across every component of the harness.
//!
//! These are the kinds named in the design: local, retryable failures are
//! handled inside the DB client (`Conflict`, the ambiguous-commit case that
//! feeds UUID-retry); everything else propagates to the enclosing phase as
//! a fatal error.

use std::time::Duration;

/// The barrier-commit wait mode (spec §4.2): how far propagation must reach
/// before `sync` returns. Lives here (rather than in `oh-ovsdb`) because the
/// error taxonomy needs to name it and `oh-ovsdb` already depends on this
/// crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitType {
    /// No propagation wait; the transaction commits and `sync` returns.
    None,
    /// Wait until `NB_Global.sb_cfg` reaches the committed `nb_cfg`.
    Sb,
    /// Wait until both `sb_cfg` and `hv_cfg` reach the committed `nb_cfg`.
    Hv,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error running `{cmd}` on {host}: {source}")]
    Transport {
        host: String,
        cmd: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("timed out waiting for chassis `{0}` to bind")]
    ChassisTimeout(String),

    #[error("timed out waiting for ping {src} -> {dest}")]
    PingTimeout { src: String, dest: String },

    #[error("sync timed out waiting for nb_cfg {target} to propagate (wait={wait:?})")]
    SyncTimeout { target: u64, wait: WaitType },

    #[error("failed to obtain UUID for `{natural_key}` after {attempts} attempts")]
    UUIDUnknown { natural_key: String, attempts: u32 },

    #[error("transaction conflict, cache is stale")]
    Conflict,

    #[error("transaction rejected by the database: {0}")]
    CommitError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
