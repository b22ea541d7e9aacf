//! The barrier-commit ("sync") protocol (spec §4.2), grounded on
//! `ovn_utils.py::NBTransaction`'s `pre_commit`/`post_commit`/
//! `nb_has_completed` state machine: after committing a batch of
//! mutations, `NB_Global.nb_cfg` is incremented, and depending on the
//! requested `WaitType` the caller waits until `sb_cfg` (and `hv_cfg`)
//! reach that value before returning.

use std::time::{Duration, Instant};

use oh_util::error::{Error, WaitType};
use uuid::Uuid;

use crate::connection::OvsdbConnection;
use crate::schema::Monitor;

/// How often `sync` polls `NB_Global` while waiting for propagation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reads the current `nb_cfg` value and the `NB_Global` row's UUID.
fn read_nb_global(monitor: &Monitor) -> Result<(Uuid, u64), Error> {
    let (uuid, row) = monitor
        .singleton_row("NB_Global")
        .ok_or_else(|| Error::Other(anyhow::anyhow!("NB_Global row not yet observed by monitor")))?;
    let nb_cfg = row.get("nb_cfg").and_then(serde_json::Value::as_u64).unwrap_or(0);
    Ok((uuid, nb_cfg))
}

/// Increments `NB_Global.nb_cfg` via `connection` and, depending on
/// `wait`, polls the NB monitor until SB (and chassis) propagation has
/// caught up, or `timeout` elapses.
///
/// This is the one commit that always uses the simple non-retried path:
/// `NB_Global` is a singleton row whose UUID is already known, so there is
/// no natural-key ambiguity for UUID-retry to resolve.
pub async fn sync(
    connection: &dyn OvsdbConnection,
    wait: WaitType,
    timeout: Duration,
) -> Result<u64, Error> {
    let (global_uuid, current) = read_nb_global(connection.monitor())?;
    let target = current + 1;
    let ops = vec![serde_json::json!({
        "op": "mutate",
        "table": "NB_Global",
        "where": [["_uuid", "==", ["uuid", global_uuid]]],
        "mutations": [["nb_cfg", "+=", 1]],
    })];
    connection.transact("OVN_Northbound", ops).await?;

    if wait == WaitType::None {
        return Ok(target);
    }

    let deadline = Instant::now() + timeout;
    loop {
        let (_, row) = connection
            .monitor()
            .singleton_row("NB_Global")
            .ok_or_else(|| Error::Other(anyhow::anyhow!("NB_Global row disappeared")))?;
        let sb_cfg = row.get("sb_cfg").and_then(serde_json::Value::as_u64).unwrap_or(0);
        let hv_cfg = row.get("hv_cfg").and_then(serde_json::Value::as_u64).unwrap_or(0);
        let satisfied = match wait {
            WaitType::None => true,
            WaitType::Sb => sb_cfg >= target,
            WaitType::Hv => sb_cfg >= target && hv_cfg >= target,
        };
        if satisfied {
            return Ok(target);
        }
        if Instant::now() >= deadline {
            return Err(Error::SyncTimeout { target, wait });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::ScriptedConnection;
    use serde_json::json;
    use uuid::Uuid;

    fn seed_nb_global(conn: &ScriptedConnection, uuid: Uuid, nb_cfg: u64, sb_cfg: u64, hv_cfg: u64) {
        conn.monitor.apply_update("NB_Global", uuid, Some(json!({"nb_cfg": nb_cfg, "sb_cfg": sb_cfg, "hv_cfg": hv_cfg})));
    }

    #[tokio::test]
    async fn wait_none_returns_immediately_after_commit() {
        let conn = ScriptedConnection::new(vec![Ok(vec![json!({"count": 1})])]);
        seed_nb_global(&conn, Uuid::new_v4(), 4, 4, 4);
        let target = sync(&conn, WaitType::None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(target, 5);
    }

    #[tokio::test]
    async fn wait_sb_times_out_when_sb_cfg_never_catches_up() {
        let conn = ScriptedConnection::new(vec![Ok(vec![json!({"count": 1})])]);
        seed_nb_global(&conn, Uuid::new_v4(), 4, 3, 3);
        let result = sync(&conn, WaitType::Sb, Duration::from_millis(250)).await;
        assert!(matches!(result, Err(Error::SyncTimeout { target: 5, wait: WaitType::Sb })));
    }
}
