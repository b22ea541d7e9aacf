//! Every logical-topology operation against the Northbound database,
//! grounded on `ovn_utils.py::OvnNbctl`. Row-creating operations go
//! through `transaction::uuid_retry`; everything else (mutate/delete) is a
//! single non-retried commit, since those targets are already addressed
//! by a known UUID.

use std::sync::Arc;

use oh_net::DualStackIp;
use oh_util::error::{Error, WaitType};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::connection::OvsdbConnection;
use crate::sync;
use crate::transaction::{uuid_retry, CommitOutcome};
use crate::types::{AddressSet, LRouter, LSwitch, LoadBalancer, LoadBalancerGroup, PortGroup};

/// Matches `ovn_utils.py`'s `MAX_PORTS_IN_BATCH` for port-group and
/// address-set membership mutations.
pub const MAX_PORTS_IN_BATCH: usize = 500;

#[derive(Clone)]
pub struct NbClient {
    connection: Arc<dyn OvsdbConnection>,
}

impl NbClient {
    pub fn new(connection: Arc<dyn OvsdbConnection>) -> NbClient {
        NbClient { connection }
    }

    async fn commit(&self, ops: Vec<Value>) -> Result<Vec<Value>, Error> {
        self.connection.transact("OVN_Northbound", ops).await
    }

    /// Creates one row via the UUID-retry discipline: `insert` op followed
    /// by a `select` echoing the natural key, so a dropped connection's
    /// ambiguous result can be resolved by re-reading the row on retry.
    async fn create_named_row(&self, table: &'static str, natural_key: &str, row: Value) -> Result<Uuid, Error> {
        uuid_retry(
            natural_key,
            || {
                let row = row.clone();
                async move { self.insert_row(table, row).await }
            },
            || self.find_by_column(table, "name", natural_key),
        )
        .await
    }

    /// Like `create_named_row`, but for tables (ACL, NAT, static routes,
    /// gateway chassis) that have no `"name"` column to hold the natural
    /// key: the key is tagged onto `external_ids["oh-key"]` on insert so a
    /// retry after an ambiguous commit can still find the row by it.
    async fn create_tagged_row(&self, table: &'static str, natural_key: &str, mut row: Value) -> Result<Uuid, Error> {
        row["external_ids"] = json!({"oh-key": natural_key});
        uuid_retry(
            natural_key,
            || {
                let row = row.clone();
                async move { self.insert_row(table, row).await }
            },
            || self.find_by_external_id(table, natural_key),
        )
        .await
    }

    async fn insert_row(&self, table: &'static str, row: Value) -> Result<CommitOutcome, Error> {
        let ops = vec![json!({"op": "insert", "table": table, "row": row})];
        match self.commit(ops).await {
            Ok(results) => match results.first().and_then(|r| r.get("uuid")).and_then(Value::as_array) {
                Some(pair) if pair.len() == 2 => {
                    let uuid = pair[1].as_str().and_then(|s| s.parse().ok());
                    uuid.map(CommitOutcome::Created).ok_or(Error::CommitError("malformed insert uuid".into()))
                }
                _ => Ok(CommitOutcome::Ambiguous),
            },
            Err(Error::Transport { .. }) => Ok(CommitOutcome::Ambiguous),
            Err(e) => Err(e),
        }
    }

    async fn find_by_name(&self, table: &str, name: &str) -> Result<Option<Uuid>, Error> {
        self.find_by_column(table, "name", name).await
    }

    async fn find_by_column(&self, table: &str, column: &str, value: &str) -> Result<Option<Uuid>, Error> {
        let (uuid, row) = match self.connection.monitor().find_row(table, column, value) {
            Some(found) => found,
            None => return Ok(None),
        };
        let _ = row;
        Ok(Some(uuid))
    }

    async fn find_by_external_id(&self, table: &str, value: &str) -> Result<Option<Uuid>, Error> {
        let (uuid, row) = match self.connection.monitor().find_row_by_external_id(table, "oh-key", value) {
            Some(found) => found,
            None => return Ok(None),
        };
        let _ = row;
        Ok(Some(uuid))
    }

    async fn mutate(&self, table: &'static str, row_uuid: Uuid, mutations: Value) -> Result<(), Error> {
        let ops = vec![json!({
            "op": "mutate",
            "table": table,
            "where": [["_uuid", "==", ["uuid", row_uuid]]],
            "mutations": mutations,
        })];
        self.commit(ops).await?;
        Ok(())
    }

    async fn update(&self, table: &'static str, row_uuid: Uuid, row: Value) -> Result<(), Error> {
        let ops = vec![json!({
            "op": "update",
            "table": table,
            "where": [["_uuid", "==", ["uuid", row_uuid]]],
            "row": row,
        })];
        self.commit(ops).await?;
        Ok(())
    }

    async fn delete_by_name(&self, table: &'static str, name: &str) -> Result<(), Error> {
        let ops = vec![json!({
            "op": "delete",
            "table": table,
            "where": [["name", "==", name]],
        })];
        self.commit(ops).await?;
        Ok(())
    }

    // -- Logical routers ----------------------------------------------

    pub async fn lr_add(&self, name: &str) -> Result<LRouter, Error> {
        let uuid = self.create_named_row("Logical_Router", name, json!({"name": name})).await?;
        Ok(LRouter { uuid, name: name.to_string() })
    }

    pub async fn lr_port_add(
        &self,
        router: &LRouter,
        name: &str,
        mac: &str,
        networks: &[String],
    ) -> Result<Uuid, Error> {
        let port_row = json!({
            "name": name,
            "mac": mac,
            "networks": networks,
        });
        let uuid = self.create_named_row("Logical_Router_Port", name, port_row).await?;
        self.mutate("Logical_Router", router.uuid, json!([["ports", "insert", ["set", [["uuid", uuid]]]]])).await?;
        Ok(uuid)
    }

    pub async fn lr_port_set_gw_chassis(&self, port_uuid: Uuid, chassis: &str, priority: u32) -> Result<(), Error> {
        let gw_row = json!({"chassis_name": chassis, "priority": priority});
        let gw_uuid = self.create_tagged_row("Gateway_Chassis", &format!("{port_uuid}-{chassis}"), gw_row).await?;
        self.mutate("Logical_Router_Port", port_uuid, json!([["gateway_chassis", "insert", ["set", [["uuid", gw_uuid]]]]])).await
    }

    pub async fn lr_set_options(&self, router: &LRouter, options: Value) -> Result<(), Error> {
        self.update("Logical_Router", router.uuid, json!({"options": options})).await
    }

    pub async fn lr_add_lbg(&self, router: &LRouter, lbg: &LoadBalancerGroup) -> Result<(), Error> {
        self.mutate("Logical_Router", router.uuid, json!([["load_balancer_group", "insert", ["set", [["uuid", lbg.uuid]]]]])).await
    }

    // -- Logical switches ----------------------------------------------

    pub async fn ls_add(&self, name: &str) -> Result<LSwitch, Error> {
        let uuid = self.create_named_row("Logical_Switch", name, json!({"name": name})).await?;
        Ok(LSwitch { uuid, name: name.to_string(), cidr4: None, cidr6: None })
    }

    pub async fn ls_port_add(&self, switch: &LSwitch, name: &str, row: Value) -> Result<Uuid, Error> {
        let mut row = row;
        row["name"] = json!(name);
        let uuid = self.create_named_row("Logical_Switch_Port", name, row).await?;
        self.mutate("Logical_Switch", switch.uuid, json!([["ports", "insert", ["set", [["uuid", uuid]]]]])).await?;
        Ok(uuid)
    }

    pub async fn ls_port_del(&self, switch: &LSwitch, port_uuid: Uuid) -> Result<(), Error> {
        self.mutate("Logical_Switch", switch.uuid, json!([["ports", "delete", ["set", [["uuid", port_uuid]]]]])).await
    }

    pub async fn ls_port_set_options(&self, port_uuid: Uuid, options: Value) -> Result<(), Error> {
        self.update("Logical_Switch_Port", port_uuid, json!({"options": options})).await
    }

    pub async fn ls_port_set_type(&self, port_uuid: Uuid, port_type: &str) -> Result<(), Error> {
        self.update("Logical_Switch_Port", port_uuid, json!({"type": port_type})).await
    }

    pub async fn ls_add_lbg(&self, switch: &LSwitch, lbg: &LoadBalancerGroup) -> Result<(), Error> {
        self.mutate("Logical_Switch", switch.uuid, json!([["load_balancer_group", "insert", ["set", [["uuid", lbg.uuid]]]]])).await
    }

    // -- Port groups / address sets -------------------------------------

    pub async fn port_group_create(&self, name: &str) -> Result<PortGroup, Error> {
        self.create_named_row("Port_Group", name, json!({"name": name})).await?;
        Ok(PortGroup { name: name.to_string() })
    }

    /// Adds `ports` to `group` in batches of `MAX_PORTS_IN_BATCH`, matching
    /// `ovn_utils.py::OvnNbctl.port_group_add`'s chunking.
    pub async fn port_group_add_ports(&self, group: &PortGroup, ports: &[Uuid]) -> Result<(), Error> {
        let group_uuid = self
            .find_by_name("Port_Group", &group.name)
            .await?
            .ok_or_else(|| Error::Other(anyhow::anyhow!("port group `{}` not found", group.name)))?;
        for chunk in ports.chunks(MAX_PORTS_IN_BATCH) {
            let set: Vec<Value> = chunk.iter().map(|p| json!(["uuid", p])).collect();
            self.mutate("Port_Group", group_uuid, json!([["ports", "insert", ["set", set]]])).await?;
        }
        Ok(())
    }

    pub async fn port_group_del(&self, group: &PortGroup) -> Result<(), Error> {
        self.delete_by_name("Port_Group", &group.name).await
    }

    /// Resolves a port group's current UUID through the monitor, for
    /// callers (ACL attachment) that need to mutate it by UUID.
    pub async fn port_group_uuid(&self, group: &PortGroup) -> Result<Uuid, Error> {
        self.find_by_name("Port_Group", &group.name)
            .await?
            .ok_or_else(|| Error::Other(anyhow::anyhow!("port group `{}` not found", group.name)))
    }

    pub async fn address_set_create(&self, name: &str) -> Result<AddressSet, Error> {
        self.create_named_row("Address_Set", name, json!({"name": name, "addresses": []})).await?;
        Ok(AddressSet { name: name.to_string() })
    }

    /// Adds `addrs` to `set` in batches of `MAX_PORTS_IN_BATCH`, matching
    /// `OvnNbctl.address_set_add`'s chunking.
    pub async fn address_set_add_addrs(&self, set: &AddressSet, addrs: &[String]) -> Result<(), Error> {
        let set_uuid = self
            .find_by_name("Address_Set", &set.name)
            .await?
            .ok_or_else(|| Error::Other(anyhow::anyhow!("address set `{}` not found", set.name)))?;
        for chunk in addrs.chunks(MAX_PORTS_IN_BATCH) {
            let values: Vec<Value> = chunk.iter().map(|a| json!(a)).collect();
            self.mutate("Address_Set", set_uuid, json!([["addresses", "insert", ["set", values]]])).await?;
        }
        Ok(())
    }

    pub async fn address_set_del(&self, set: &AddressSet) -> Result<(), Error> {
        self.delete_by_name("Address_Set", &set.name).await
    }

    // -- ACLs / routes / NAT --------------------------------------------

    /// Adds an ACL scoped to either a switch or a port group, deduplicated
    /// on `(owner, direction, priority, match)` so re-running `enforce()`
    /// (spec.md §4.6) is idempotent.
    pub async fn acl_add(
        &self,
        owner_table: &'static str,
        owner_uuid: Uuid,
        direction: &str,
        priority: u32,
        match_expr: &str,
        action: &str,
    ) -> Result<(), Error> {
        let acl_table = "ACL";
        let dedup_key = format!("{owner_uuid}:{direction}:{priority}:{match_expr}");
        let row = json!({
            "direction": direction,
            "priority": priority,
            "match": match_expr,
            "action": action,
        });
        let acl_uuid = self.create_tagged_row(acl_table, &dedup_key, row).await?;
        self.mutate(owner_table, owner_uuid, json!([["acls", "insert", ["set", [["uuid", acl_uuid]]]]])).await
    }

    /// Adds a static route for whichever address family `prefix`/`next_hop`
    /// agree on; silently does nothing if `ip` has no address in that
    /// family, matching the per-family skip in `OvnNbctl.route_add` (a
    /// worker with only an IPv4 uplink shouldn't get an IPv6 default
    /// route). `policy` is `"dst-ip"` or `"src-ip"`, passed straight
    /// through to the OVSDB row.
    pub async fn route_add(
        &self,
        router: &LRouter,
        ip: &DualStackIp,
        prefix: &str,
        next_hop: &str,
        port: &str,
        policy: &str,
    ) -> Result<(), Error> {
        let is_v6 = prefix.contains(':') || next_hop.contains(':');
        let family_present = if is_v6 { ip.ip6.is_some() } else { ip.ip4.is_some() };
        if !family_present {
            return Ok(());
        }
        let row = json!({"ip_prefix": prefix, "nexthop": next_hop, "output_port": port, "policy": policy});
        let route_uuid = self
            .create_tagged_row("Logical_Router_Static_Route", &format!("{}-{prefix}", router.name), row)
            .await?;
        self.mutate("Logical_Router", router.uuid, json!([["static_routes", "insert", ["set", [["uuid", route_uuid]]]]])).await
    }

    pub async fn nat_add(&self, router: &LRouter, nat_type: &str, external_ip: &str, logical_ip: &str) -> Result<(), Error> {
        let row = json!({"type": nat_type, "external_ip": external_ip, "logical_ip": logical_ip});
        let nat_uuid = self
            .create_tagged_row("NAT", &format!("{}-{external_ip}-{logical_ip}", router.name), row)
            .await?;
        self.mutate("Logical_Router", router.uuid, json!([["nat", "insert", ["set", [["uuid", nat_uuid]]]]])).await
    }

    // -- Load balancers ---------------------------------------------------

    /// Creates a load balancer with an empty `vips` column, through the
    /// same raw row-create-via-`uuid_retry` path as `create_named_row`,
    /// matching `OvnNbctl.create_lb`'s use of `db_create_transaction`
    /// directly because LB names are not guaranteed unique the way
    /// router/switch names are (hence a dedicated helper rather than
    /// `create_named_row` itself, which would dedup on `name`).
    pub async fn create_lb(&self, name: &str, protocol: &str) -> Result<LoadBalancer, Error> {
        let row = json!({"name": name, "protocol": protocol, "vips": {}});
        let uuid = self.create_tagged_row("Load_Balancer", &format!("{name}-{protocol}"), row).await?;
        Ok(LoadBalancer { name: name.to_string(), uuid })
    }

    pub async fn create_lbg(&self, name: &str) -> Result<LoadBalancerGroup, Error> {
        let uuid = self.create_named_row("Load_Balancer_Group", name, json!({"name": name})).await?;
        Ok(LoadBalancerGroup { name: name.to_string(), uuid })
    }

    pub async fn lbg_add_lb(&self, group: &LoadBalancerGroup, lb: &LoadBalancer) -> Result<(), Error> {
        self.mutate("Load_Balancer_Group", group.uuid, json!([["load_balancer", "insert", ["set", [["uuid", lb.uuid]]]]])).await
    }

    /// Merges `vips` into the load balancer's existing `vips` map rather
    /// than replacing it, matching `OvnLoadBalancer.add_vips`'s additive
    /// semantics: callers (per-worker cluster-LB provisioning, per-namespace
    /// VIP provisioning) each add their own slice of VIPs over time and rely
    /// on earlier callers' entries surviving. `lb_clear_vips` remains the
    /// explicit full-wipe operation for callers that actually want that.
    pub async fn lb_set_vips(&self, lb: &LoadBalancer, vips: &[(String, String)]) -> Result<(), Error> {
        let mut merged: std::collections::BTreeMap<String, String> = self
            .connection
            .monitor()
            .column("Load_Balancer", lb.uuid, "vips")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        for (vip, backends) in vips {
            merged.insert(vip.clone(), backends.clone());
        }
        let vip_map: Value = merged.into();
        self.update("Load_Balancer", lb.uuid, json!({"vips": vip_map})).await
    }

    pub async fn lb_clear_vips(&self, lb: &LoadBalancer) -> Result<(), Error> {
        self.update("Load_Balancer", lb.uuid, json!({"vips": {}})).await
    }

    pub async fn lb_add_to_switches(&self, lb: &LoadBalancer, switches: &[Uuid]) -> Result<(), Error> {
        for switch in switches {
            self.mutate("Logical_Switch", *switch, json!([["load_balancer", "insert", ["set", [["uuid", lb.uuid]]]]])).await?;
        }
        Ok(())
    }

    pub async fn lb_add_to_routers(&self, lb: &LoadBalancer, routers: &[Uuid]) -> Result<(), Error> {
        for router in routers {
            self.mutate("Logical_Router", *router, json!([["load_balancer", "insert", ["set", [["uuid", lb.uuid]]]]])).await?;
        }
        Ok(())
    }

    pub async fn lb_remove_from_switches(&self, lb: &LoadBalancer, switches: &[Uuid]) -> Result<(), Error> {
        for switch in switches {
            self.mutate("Logical_Switch", *switch, json!([["load_balancer", "delete", ["set", [["uuid", lb.uuid]]]]])).await?;
        }
        Ok(())
    }

    pub async fn lb_remove_from_routers(&self, lb: &LoadBalancer, routers: &[Uuid]) -> Result<(), Error> {
        for router in routers {
            self.mutate("Logical_Router", *router, json!([["load_balancer", "delete", ["set", [["uuid", lb.uuid]]]]])).await?;
        }
        Ok(())
    }

    // -- Global settings ----------------------------------------------

    pub async fn set_global(&self, options: Value) -> Result<(), Error> {
        let (uuid, _) = self
            .connection
            .monitor()
            .singleton_row("NB_Global")
            .ok_or_else(|| Error::Other(anyhow::anyhow!("NB_Global not yet observed")))?;
        self.update("NB_Global", uuid, json!({"options": options})).await
    }

    pub async fn set_inactivity_probe(&self, connection_uuid: Uuid, probe_ms: u64) -> Result<(), Error> {
        self.update("Connection", connection_uuid, json!({"inactivity_probe": probe_ms})).await
    }

    /// The barrier-commit sync (spec.md §4.2).
    pub async fn sync(&self, wait: WaitType, timeout: std::time::Duration) -> Result<u64, Error> {
        sync::sync(self.connection.as_ref(), wait, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::ScriptedConnection;

    fn insert_result(uuid: Uuid) -> Value {
        json!([{"uuid": ["uuid", uuid.to_string()]}])
    }

    #[tokio::test]
    async fn lr_add_returns_the_uuid_the_insert_reports() {
        let uuid = Uuid::new_v4();
        let conn = Arc::new(ScriptedConnection::new(vec![Ok(serde_json::from_value(insert_result(uuid)).unwrap())]));
        let nb = NbClient::new(conn);
        let router = nb.lr_add("lr0").await.unwrap();
        assert_eq!(router.uuid, uuid);
        assert_eq!(router.name, "lr0");
    }

    #[tokio::test]
    async fn lr_add_falls_back_to_lookup_after_ambiguous_commit() {
        let uuid = Uuid::new_v4();
        let conn = ScriptedConnection::new(vec![Err(Error::Transport {
            host: "c1".into(),
            cmd: "transact".into(),
            source: anyhow::anyhow!("connection reset"),
        })]);
        conn.monitor.apply_update("Logical_Router", uuid, Some(json!({"name": "lr0"})));
        let nb = NbClient::new(Arc::new(conn));
        let router = nb.lr_add("lr0").await.unwrap();
        assert_eq!(router.uuid, uuid);
    }

    #[tokio::test]
    async fn lb_set_vips_merges_rather_than_replaces() {
        let lb_uuid = Uuid::new_v4();
        let conn = Arc::new(ScriptedConnection::new(vec![Ok(vec![json!({"count": 1})])]));
        conn.monitor.apply_update(
            "Load_Balancer",
            lb_uuid,
            Some(json!({"name": "cluster-lb", "protocol": "tcp", "vips": {"42.42.0.1:80": "10.0.0.1:80"}})),
        );
        let nb = NbClient::new(Arc::clone(&conn) as Arc<dyn OvsdbConnection>);
        let lb = LoadBalancer { name: "cluster-lb".to_string(), uuid: lb_uuid };
        nb.lb_set_vips(&lb, &[("42.42.0.2:80".to_string(), "10.0.0.2:80".to_string())]).await.unwrap();
        let calls = conn.calls.lock().unwrap();
        let row = &calls[0].1[0]["row"]["vips"];
        assert_eq!(row["42.42.0.1:80"], "10.0.0.1:80");
        assert_eq!(row["42.42.0.2:80"], "10.0.0.2:80");
    }

    #[tokio::test]
    async fn port_group_add_ports_batches_at_500() {
        let group_uuid = Uuid::new_v4();
        let conn = ScriptedConnection::new(vec![Ok(vec![json!({"count": 1})]), Ok(vec![json!({"count": 1})])]);
        conn.monitor.apply_update("Port_Group", group_uuid, Some(json!({"name": "pg0"})));
        let nb = NbClient::new(Arc::new(conn));
        let group = PortGroup { name: "pg0".to_string() };
        let ports: Vec<Uuid> = (0..750).map(|_| Uuid::new_v4()).collect();
        nb.port_group_add_ports(&group, &ports).await.unwrap();
    }
}
