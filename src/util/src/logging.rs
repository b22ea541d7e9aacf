//! Tracing setup matching the original's `ts | logger | LEVEL | message`
//! line format and its one piece of runtime log-level surgery: when
//! `global.log_cmds` is set, the transaction module is lowered to `DEBUG`
//! (the Python equivalent raised
//! `ovsdbapp.backend.ovs_idl.transaction` to `DEBUG`).

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. Idempotent-safe to call once at
/// process start; a second call is a programmer error and panics, matching
/// `tracing_subscriber::fmt().init()`'s own behavior.
pub fn init_tracing(log_cmds: bool) {
    let default_directive = if log_cmds {
        "info,oh_ovsdb::transaction=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();
}
