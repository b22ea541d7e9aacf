//! Southbound database operations, grounded on `ovn_utils.py::OvnSbctl`/
//! `BaseOvnSbIdl`. The harness only ever reads SB (chassis-bound polling)
//! and tweaks `Connection.inactivity_probe`; it never writes logical
//! topology there (SB is northd's output, not the harness's input).

use std::sync::Arc;
use std::time::{Duration, Instant};

use oh_util::error::Error;
use serde_json::json;
use uuid::Uuid;

use crate::connection::OvsdbConnection;

#[derive(Clone)]
pub struct SbClient {
    connection: Arc<dyn OvsdbConnection>,
}

impl SbClient {
    pub fn new(connection: Arc<dyn OvsdbConnection>) -> SbClient {
        SbClient { connection }
    }

    pub async fn set_inactivity_probe(&self, connection_uuid: Uuid, probe_ms: u64) -> Result<(), Error> {
        let ops = vec![json!({
            "op": "update",
            "table": "Connection",
            "where": [["_uuid", "==", ["uuid", connection_uuid]]],
            "row": {"inactivity_probe": probe_ms},
        })];
        self.connection.transact("OVN_Southbound", ops).await?;
        Ok(())
    }

    /// Polls the monitored `Chassis` table until a row named `chassis`
    /// appears, or `timeout` elapses. Grounded on
    /// `BaseOvnSbIdl.chassis_bound`'s `wait_for_change` loop.
    pub async fn chassis_bound(&self, chassis: &str, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.connection.monitor().find_row("Chassis", "name", chassis).is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::ChassisTimeout(chassis.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::ScriptedConnection;
    use serde_json::json as j;

    #[tokio::test]
    async fn chassis_bound_resolves_once_monitor_observes_the_row() {
        let conn = ScriptedConnection::new(vec![]);
        conn.monitor.apply_update("Chassis", Uuid::new_v4(), Some(j!({"name": "worker-1"})));
        let sb = SbClient::new(Arc::new(conn));
        sb.chassis_bound("worker-1", Duration::from_millis(500)).await.unwrap();
    }

    #[tokio::test]
    async fn chassis_bound_times_out_when_chassis_never_appears() {
        let conn = ScriptedConnection::new(vec![]);
        let sb = SbClient::new(Arc::new(conn));
        let result = sb.chassis_bound("worker-2", Duration::from_millis(250)).await;
        assert!(matches!(result, Err(Error::ChassisTimeout(_))));
    }
}
