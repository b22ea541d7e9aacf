//! `ClusterConfig`, `BrExConfig`, and the per-node provisioning sequence:
//! `CentralNode` (DB/relay containers) and `WorkerNode` (one chassis'
//! topology). Grounded on `ovn_workload.py:16-362`.

use std::time::Duration;

use oh_net::{DualStackIp, DualStackSubnet};
use oh_ovsdb::nb::NbClient;
use oh_ovsdb::ovs::OvsClient;
use oh_ovsdb::sb::SbClient;
use oh_ovsdb::types::{LRouter, LSwitch, LoadBalancer, LsPort};
use oh_sandbox::{PhysicalNode, RunOpts};
use oh_util::error::Error;
use uuid::Uuid;

/// Every field of the original `ClusterConfig` namedtuple.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub cluster_cmd_path: String,
    pub monitor_all: bool,
    pub logical_dp_groups: bool,
    pub clustered_db: bool,
    pub datapath_type: String,
    pub raft_election_to: u32,
    pub northd_probe_interval: u32,
    pub db_inactivity_probe: u64,
    pub node_net: DualStackSubnet,
    pub enable_ssl: bool,
    pub node_remote: String,
    pub node_timeout_s: u64,
    pub internal_net: DualStackSubnet,
    pub external_net: DualStackSubnet,
    pub gw_net: DualStackSubnet,
    pub cluster_net: DualStackSubnet,
    pub n_workers: usize,
    pub n_relays: usize,
    pub vips: std::collections::BTreeMap<String, Vec<String>>,
    pub vips6: std::collections::BTreeMap<String, Vec<String>>,
    pub vip_subnet: DualStackSubnet,
    pub static_vips: std::collections::BTreeMap<String, Vec<String>>,
    pub static_vips6: std::collections::BTreeMap<String, Vec<String>>,
    pub use_ovsdb_etcd: bool,
}

#[derive(Debug, Clone)]
pub struct BrExConfig {
    pub physical_net: String,
}

/// Random MAC with OVN's locally-administered prefix, matching the
/// original's use of `randmac.RandMac()`.
pub fn random_mac() -> String {
    let mut bytes = [0u8; 6];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    bytes[0] = (bytes[0] & 0xfe) | 0x02;
    format!("{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
}

/// Builds the `ovn_cluster.sh` invocation common to every node kind,
/// grounded on `Node.build_cmd`.
pub fn build_cmd(cluster_cfg: &ClusterConfig, mgmt_net: &DualStackSubnet, mgmt_ip: &DualStackIp, cmd: &str, args: &[&str]) -> String {
    let host = mgmt_net.n4.map(|n| n.network().to_string()).unwrap_or_default();
    let prefix = mgmt_net.n4.map(|n| n.prefix_len()).unwrap_or_default();
    let start = mgmt_ip.ip4.map(|ip| ip.to_string()).unwrap_or_default();
    let onoff = |b: bool| if b { "yes" } else { "no" };
    let prefix_env = format!(
        "cd {} && OVN_MONITOR_ALL={} OVN_DB_CLUSTER={} ENABLE_SSL={} ENABLE_ETCD={} OVN_DP_TYPE={} \
         CREATE_FAKE_VMS=no CHASSIS_COUNT=0 GW_COUNT=0 RELAY_COUNT={} IP_HOST={} IP_CIDR={} IP_START={} \
         ./ovn_cluster.sh {}",
        cluster_cfg.cluster_cmd_path,
        onoff(cluster_cfg.monitor_all),
        onoff(cluster_cfg.clustered_db),
        onoff(cluster_cfg.enable_ssl),
        onoff(cluster_cfg.use_ovsdb_etcd),
        cluster_cfg.datapath_type,
        cluster_cfg.n_relays,
        host,
        prefix,
        start,
        cmd,
    );
    if args.is_empty() {
        prefix_env
    } else {
        format!("{prefix_env} {}", args.join(" "))
    }
}

#[derive(Clone)]
pub struct CentralNode {
    pub physical_node: PhysicalNode,
    pub container: String,
    pub mgmt_net: DualStackSubnet,
    pub mgmt_ip: DualStackIp,
    pub db_containers: Vec<String>,
    pub relay_containers: Vec<String>,
}

impl CentralNode {
    pub async fn start(&self, cluster_cfg: &ClusterConfig) -> Result<(), Error> {
        tracing::info!("starting central node");
        let cmd = build_cmd(cluster_cfg, &self.mgmt_net, &self.mgmt_ip, "start", &[]);
        self.physical_node.run(&cmd, RunOpts { check: true, ..Default::default() }).await?;
        // TODO: replace with a readiness probe on the DB containers; the
        // original just sleeps and relies on the RAFT-timer steps below
        // succeeding once the cluster is up.
        tokio::time::sleep(Duration::from_secs(5)).await;
        self.set_raft_election_timeout(cluster_cfg.raft_election_to).await?;
        self.enable_trim_on_compaction().await?;
        Ok(())
    }

    async fn set_raft_election_timeout(&self, timeout_s: u32) -> Result<(), Error> {
        let mut timeout = 1000;
        while timeout < (timeout_s + 1) * 1000 {
            tracing::info!(timeout, "setting RAFT election timeout");
            self.physical_node
                .run(
                    &format!("ovs-appctl -t /run/ovn/ovnnb_db.ctl cluster/change-election-timer OVN_Northbound {timeout}"),
                    RunOpts { check: true, ..Default::default() },
                )
                .await?;
            self.physical_node
                .run(
                    &format!("ovs-appctl -t /run/ovn/ovnsb_db.ctl cluster/change-election-timer OVN_Southbound {timeout}"),
                    RunOpts { check: true, ..Default::default() },
                )
                .await?;
            timeout += 1000;
        }
        Ok(())
    }

    /// Enables `ovsdb-server/memory-trim-on-compaction` on every DB and
    /// relay container. The original has a missing space before
    /// `ovs-appctl` in the relay loop (`f'docker exec {relay_container}'
    /// f'ovs-appctl -t ...'`, no trailing space on the first fragment);
    /// fixed here per spec.md §9's REDESIGN FLAG.
    async fn enable_trim_on_compaction(&self) -> Result<(), Error> {
        tracing::info!("setting DB trim-on-compaction");
        for db_container in &self.db_containers {
            self.physical_node
                .run(
                    &format!("docker exec {db_container} ovs-appctl -t /run/ovn/ovnnb_db.ctl ovsdb-server/memory-trim-on-compaction on"),
                    RunOpts { check: true, ..Default::default() },
                )
                .await?;
            self.physical_node
                .run(
                    &format!("docker exec {db_container} ovs-appctl -t /run/ovn/ovnsb_db.ctl ovsdb-server/memory-trim-on-compaction on"),
                    RunOpts { check: true, ..Default::default() },
                )
                .await?;
        }
        for relay_container in &self.relay_containers {
            self.physical_node
                .run(
                    &format!("docker exec {relay_container} ovs-appctl -t /run/ovn/ovnsb_db.ctl ovsdb-server/memory-trim-on-compaction on"),
                    RunOpts { check: true, ..Default::default() },
                )
                .await?;
        }
        Ok(())
    }
}

/// One worker chassis: its own switch, gateway router, external switch,
/// and the ports it hosts. `lports` is pre-sized with
/// `Vec::with_capacity` at construction — the state-of-the-world
/// equivalent of the original's `gc.disable()` (Rust has no tracing GC to
/// tune; this at least avoids the repeated reallocations that `gc.disable`
/// was working around in the Python list).
#[derive(Clone)]
pub struct WorkerNode {
    pub physical_node: PhysicalNode,
    pub container: String,
    pub mgmt_net: DualStackSubnet,
    pub mgmt_ip: DualStackIp,
    pub int_net: DualStackSubnet,
    pub ext_net: DualStackSubnet,
    pub gw_net: DualStackSubnet,
    pub id: usize,
    pub switch: Option<LSwitch>,
    pub gw_router: Option<LRouter>,
    pub ext_switch: Option<LSwitch>,
    pub gw_load_balancer: Option<LoadBalancer>,
    pub lports: Vec<LsPort>,
    pub next_lport_index: usize,
}

impl WorkerNode {
    pub fn new(
        physical_node: PhysicalNode,
        container: String,
        mgmt_net: DualStackSubnet,
        mgmt_ip: DualStackIp,
        int_net: DualStackSubnet,
        ext_net: DualStackSubnet,
        gw_net: DualStackSubnet,
        id: usize,
        n_pods_per_node: usize,
    ) -> WorkerNode {
        WorkerNode {
            physical_node,
            container,
            mgmt_net,
            mgmt_ip,
            int_net,
            ext_net,
            gw_net,
            id,
            switch: None,
            gw_router: None,
            ext_switch: None,
            gw_load_balancer: None,
            lports: Vec::with_capacity(n_pods_per_node),
            next_lport_index: 0,
        }
    }

    pub async fn start(&self, cluster_cfg: &ClusterConfig) -> Result<(), Error> {
        tracing::info!(container = %self.container, "starting worker");
        let cmd = build_cmd(cluster_cfg, &self.mgmt_net, &self.mgmt_ip, "add-chassis", &[&self.container, "tcp:0.0.0.1:6642"]);
        self.physical_node.run(&cmd, RunOpts { check: true, ..Default::default() }).await?;
        Ok(())
    }

    pub async fn connect(&self, cluster_cfg: &ClusterConfig) -> Result<(), Error> {
        oh_stats::timeit("bringup", "worker-connect", async {
            tracing::info!(container = %self.container, "connecting worker");
            let cmd = build_cmd(cluster_cfg, &self.mgmt_net, &self.mgmt_ip, "set-chassis-ovn-remote", &[&self.container, &cluster_cfg.node_remote]);
            self.physical_node.run(&cmd, RunOpts { check: true, ..Default::default() }).await?;
            Ok(())
        })
        .await
    }

    pub async fn configure_localnet(&self, physical_net: &str) -> Result<(), Error> {
        tracing::info!(container = %self.container, "creating localnet");
        self.physical_node
            .run(&format!("ovs-vsctl -- set open_vswitch . external-ids:ovn-bridge-mappings={physical_net}:br-ex"), RunOpts { check: true, ..Default::default() })
            .await?;
        Ok(())
    }

    /// Wires `ext-ns` with a veth pair into `br-ex` (spec.md §4.4 step 7,
    /// restored from `ovn_workload.py::WorkerNode.configure_external_host`).
    pub async fn configure_external_host(&self) -> Result<(), Error> {
        tracing::info!(container = %self.container, "adding external host");
        let gw_ip = self.ext_net.reverse(1)?;
        let host_ip = self.ext_net.reverse(2)?;
        let commands = ["ip link add veth0 type veth peer name veth1".to_string(), "ip netns add ext-ns".to_string(), "ip link set netns ext-ns dev veth0".to_string(), "ip netns exec ext-ns ip link set dev veth0 up".to_string()];
        for cmd in commands {
            self.physical_node.run(&cmd, RunOpts { check: true, ..Default::default() }).await?;
        }
        if let (Some(ip4), Some(plen4)) = (host_ip.ip4, host_ip.plen4) {
            self.physical_node
                .run(&format!("ip netns exec ext-ns ip addr add {ip4}/{plen4} dev veth0"), RunOpts { check: true, ..Default::default() })
                .await?;
        }
        if let Some(gw4) = gw_ip.ip4 {
            self.physical_node.run(&format!("ip netns exec ext-ns ip route add default via {gw4}"), RunOpts { check: true, ..Default::default() }).await?;
        }
        self.physical_node.run("ip link set dev veth1 up", RunOpts { check: true, ..Default::default() }).await?;
        self.physical_node.run("ovs-vsctl add-port br-ex veth1", RunOpts { check: true, ..Default::default() }).await?;
        Ok(())
    }

    pub async fn configure(&self, physical_net: &str) -> Result<(), Error> {
        self.configure_localnet(physical_net).await?;
        self.configure_external_host().await?;
        Ok(())
    }

    /// Polls the SB chassis table until this worker's chassis is bound
    /// or `node_timeout_s` elapses.
    pub async fn wait(&self, sbctl: &SbClient, node_timeout_s: u64) -> Result<(), Error> {
        oh_stats::timeit("bringup", "worker-wait", sbctl.chassis_bound(&self.container, Duration::from_secs(node_timeout_s))).await
    }

    /// Adds a static route for `dest` via `next_hop` if `ip`'s family
    /// overlaps, and a dual-stack NAT rule — shared tail of
    /// `provision`'s route/NAT calls.
    async fn route_and_nat(&self, nbctl: &NbClient, gw_router: &LRouter, cluster_router: &LRouter, cluster_net: &DualStackSubnet, gr_gw: DualStackIp) -> Result<(), Error> {
        let rp_gw = self.gw_net.reverse(1)?;
        if let (Some(n4), Some(gw4)) = (cluster_net.n4, rp_gw.ip4) {
            nbctl.route_add(gw_router, &rp_gw, &n4.to_string(), &gw4.to_string(), "", "dst-ip").await?;
        }
        let gr_def_gw = self.ext_net.reverse(2)?;
        if let Some(gw4) = gr_def_gw.ip4 {
            nbctl.route_add(gw_router, &gr_def_gw, "0.0.0.0/0", &gw4.to_string(), "", "dst-ip").await?;
        }
        // Forces the cluster<->gw path for traffic originating in this
        // worker's subnet to retrace its steps back through the same
        // gateway router rather than load-balancing across all of them.
        if let (Some(n4), Some(ggw4)) = (self.int_net.n4, gr_gw.ip4) {
            nbctl.route_add(cluster_router, &gr_gw, &n4.to_string(), &ggw4.to_string(), "", "src-ip").await?;
        }
        if let (Some(n4), Some(ggw4)) = (cluster_net.n4, gr_gw.ip4) {
            nbctl.nat_add(gw_router, "snat", &ggw4.to_string(), &n4.to_string()).await?;
        }
        Ok(())
    }

    /// Connects the chassis to the cluster and waits for it to bind, then
    /// runs the full 7-step topology provisioning sequence (spec.md §4.4),
    /// restored verbatim in semantics from `ovn_workload.py:180-264`:
    /// node switch + rtr port, distributed gateway chassis, gw router +
    /// join port, external switch + physnet localnet port, routes, SNAT.
    pub async fn provision(
        &mut self,
        nbctl: &NbClient,
        sbctl: &SbClient,
        cluster_cfg: &ClusterConfig,
        cluster_router: &LRouter,
        join_switch: &LSwitch,
        cluster_net: &DualStackSubnet,
        physical_net: &str,
    ) -> Result<(), Error> {
        oh_stats::timeit("bringup", "worker-provision", async {
            self.connect(cluster_cfg).await?;
            self.wait(sbctl, cluster_cfg.node_timeout_s).await?;
            self.provision_topology(nbctl, cluster_router, join_switch, cluster_net, physical_net).await
        })
        .await
    }

    async fn provision_topology(
        &mut self,
        nbctl: &NbClient,
        cluster_router: &LRouter,
        join_switch: &LSwitch,
        cluster_net: &DualStackSubnet,
        physical_net: &str,
    ) -> Result<(), Error> {
        let switch = nbctl.ls_add(&format!("lswitch-{}", self.container)).await?;
        let lrp_ip = self.int_net.reverse(1)?;
        let lrp_name = format!("rtr-to-node-{}", self.container);
        let ls_rp_name = format!("node-to-rtr-{}", self.container);
        let mac = random_mac();
        let networks = vec![format!("{}/{}", lrp_ip.ip4.map(|i| i.to_string()).unwrap_or_default(), lrp_ip.plen4.unwrap_or(24))];
        let rp = nbctl.lr_port_add(cluster_router, &lrp_name, &mac, &networks).await?;
        nbctl.ls_port_add(&switch, &ls_rp_name, serde_json::json!({"type": "router", "options": {"router-port": lrp_name}})).await?;
        nbctl.lr_port_set_gw_chassis(rp, &self.container, 10).await?;

        let gw_router = nbctl.lr_add(&format!("gwrouter-{}", self.container)).await?;
        nbctl.lr_set_options(&gw_router, serde_json::json!({"chassis": self.container})).await?;

        let gr_gw = self.gw_net.reverse(2 + self.id as u32)?;
        let join_rp_name = format!("gw-to-join-{}", self.container);
        let join_ls_rp_name = format!("join-to-gw-{}", self.container);
        let join_networks = vec![format!("{}/{}", gr_gw.ip4.map(|i| i.to_string()).unwrap_or_default(), gr_gw.plen4.unwrap_or(24))];
        nbctl.lr_port_add(&gw_router, &join_rp_name, &random_mac(), &join_networks).await?;
        nbctl.ls_port_add(join_switch, &join_ls_rp_name, serde_json::json!({"type": "router", "options": {"router-port": join_rp_name}})).await?;

        let ext_switch = nbctl.ls_add(&format!("ext-{}", self.container)).await?;
        let ext_lrp_name = format!("gw-to-ext-{}", self.container);
        let ext_ls_rp_name = format!("ext-to-gw-{}", self.container);
        let ext_lrp_ip = self.ext_net.reverse(1)?;
        let ext_networks = vec![format!("{}/{}", ext_lrp_ip.ip4.map(|i| i.to_string()).unwrap_or_default(), ext_lrp_ip.plen4.unwrap_or(24))];
        nbctl.lr_port_add(&gw_router, &ext_lrp_name, &random_mac(), &ext_networks).await?;
        nbctl.ls_port_add(&ext_switch, &ext_ls_rp_name, serde_json::json!({"type": "router", "options": {"router-port": ext_lrp_name}})).await?;

        let physnet_port = nbctl.ls_port_add(&ext_switch, &format!("provnet-{}", self.container), serde_json::json!({"addresses": ["unknown"]})).await?;
        nbctl.ls_port_set_type(physnet_port, "localnet").await?;
        nbctl.ls_port_set_options(physnet_port, serde_json::json!({"network_name": physical_net})).await?;

        self.route_and_nat(nbctl, &gw_router, cluster_router, cluster_net, gr_gw).await?;

        self.switch = Some(switch);
        self.gw_router = Some(gw_router);
        self.ext_switch = Some(ext_switch);
        Ok(())
    }

    /// Allocates the next port IP for this worker, matching
    /// `WorkerNode.provision_port`.
    pub async fn provision_port(&mut self, nbctl: &NbClient, passive: bool) -> Result<LsPort, Error> {
        let switch = self.switch.clone().ok_or_else(|| Error::Other(anyhow::anyhow!("worker not provisioned")))?;
        let name = format!("lp-{}-{}", self.id, self.next_lport_index);
        let ip = self.int_net.forward(self.next_lport_index as u32 + 1)?;
        let gw = self.int_net.reverse(1)?;
        let ext_gw = self.ext_net.reverse(2)?;
        let mac = random_mac();
        let row = serde_json::json!({
            "addresses": [format!("{} {}", mac, ip.ip4.map(|a| a.to_string()).unwrap_or_default())],
            "port_security": [format!("{} {}", mac, ip.ip4.map(|a| a.to_string()).unwrap_or_default())],
        });
        let uuid = nbctl.ls_port_add(&switch, &name, row).await?;
        let port = LsPort::Access {
            uuid,
            name,
            mac: Some(mac),
            ip: Some(ip),
            gw: Some(gw),
            ext_gw: Some(ext_gw),
            metadata: Some(self.id),
            passive,
        };
        self.lports.push(port.clone());
        self.next_lport_index += 1;
        Ok(port)
    }

    pub async fn unprovision_port(&mut self, nbctl: &NbClient, ovs: &OvsClient<'_>, port: &LsPort) -> Result<(), Error> {
        let switch = self.switch.clone().ok_or_else(|| Error::Other(anyhow::anyhow!("worker not provisioned")))?;
        nbctl.ls_port_del(&switch, port.uuid()).await?;
        self.unbind_port(ovs, port).await?;
        self.lports.retain(|p| p.uuid() != port.uuid());
        Ok(())
    }

    pub async fn provision_load_balancers(&mut self, nbctl: &NbClient, cluster_lb: &LoadBalancer, cluster_vips: &[String], ports: &[LsPort]) -> Result<(), Error> {
        let switch = self.switch.clone().ok_or_else(|| Error::Other(anyhow::anyhow!("worker not provisioned")))?;
        let gw_router = self.gw_router.clone().ok_or_else(|| Error::Other(anyhow::anyhow!("worker not provisioned")))?;
        let backends: Vec<(String, String)> = cluster_vips
            .iter()
            .map(|vip| {
                let backends = ports
                    .iter()
                    .filter_map(|p| p.ip())
                    .filter_map(|ip| ip.ip4.map(|a| format!("{a}:8080")))
                    .collect::<Vec<_>>()
                    .join(",");
                (vip.clone(), backends)
            })
            .collect();
        nbctl.lb_set_vips(cluster_lb, &backends).await?;
        nbctl.lb_add_to_switches(cluster_lb, &[switch.uuid]).await?;
        nbctl.lb_add_to_routers(cluster_lb, &[gw_router.uuid]).await?;

        let gw_lb = nbctl.create_lb(&format!("lb-{}", gw_router.name), "tcp").await?;
        nbctl.lb_add_to_routers(&gw_lb, &[gw_router.uuid]).await?;
        self.gw_load_balancer = Some(gw_lb);
        Ok(())
    }

    pub async fn bind_port(&self, ovs: &OvsClient<'_>, port: &LsPort) -> Result<(), Error> {
        oh_stats::timeit("bringup", "bind-port", async {
            ovs.add_port(port.name(), port.name()).await?;
            if !port.passive() {
                if let (Some(ip), Some(gw)) = (port.ip(), port.ext_gw()) {
                    ovs.bind_vm_port(port.name(), port.name(), "", &ip, &gw).await?;
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn unbind_port(&self, ovs: &OvsClient<'_>, port: &LsPort) -> Result<(), Error> {
        oh_stats::timeit("teardown", "unbind-port", async {
            if !port.passive() {
                ovs.unbind_vm_port(port.name()).await?;
            }
            ovs.del_port(port.name()).await?;
            Ok(())
        })
        .await
    }

    pub async fn provision_ports(&mut self, nbctl: &NbClient, ovs: &OvsClient<'_>, n_ports: usize, passive: bool) -> Result<Vec<LsPort>, Error> {
        let mut ports = Vec::with_capacity(n_ports);
        for _ in 0..n_ports {
            ports.push(self.provision_port(nbctl, passive).await?);
        }
        for port in &ports {
            self.bind_port(ovs, port).await?;
        }
        Ok(ports)
    }

    /// Pings `src` netns to `dest`, retrying on SSH failure until
    /// `node_timeout_s` elapses (spec.md §4.4 ping-oracle checks).
    pub async fn run_ping(&self, src: &str, dest: &str, node_timeout_s: u64) -> Result<(), Error> {
        let cmd = format!("ip netns exec {src} ping -q -c 1 -W 0.1 {dest}");
        let deadline = std::time::Instant::now() + Duration::from_secs(node_timeout_s);
        loop {
            match self.physical_node.run(&cmd, RunOpts { check: true, ..Default::default() }).await {
                Ok(_) => return Ok(()),
                Err(_) if std::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(_) => return Err(Error::PingTimeout { src: src.to_string(), dest: dest.to_string() }),
            }
        }
    }

    pub async fn ping_port(&self, port: &LsPort, dest: Option<&str>, node_timeout_s: u64) -> Result<(), Error> {
        oh_stats::timeit("test", "ping-port", async {
            let fallback = port.ext_gw().and_then(|ip| ip.ip4).map(|ip| ip.to_string());
            let dest = dest.map(str::to_string).or(fallback).ok_or_else(|| Error::Other(anyhow::anyhow!("no destination address")))?;
            self.run_ping(port.name(), &dest, node_timeout_s).await
        })
        .await
    }

    pub async fn ping_external(&self, port: &LsPort, node_timeout_s: u64) -> Result<(), Error> {
        oh_stats::timeit("test", "ping-external", async {
            let dest = port.ip().and_then(|ip| ip.ip4).map(|ip| ip.to_string()).ok_or_else(|| Error::Other(anyhow::anyhow!("port has no address")))?;
            self.run_ping("ext-ns", &dest, node_timeout_s).await
        })
        .await
    }

    pub async fn ping_ports(&self, ports: &[LsPort], node_timeout_s: u64) -> Result<(), Error> {
        for port in ports {
            self.ping_port(port, None, node_timeout_s).await?;
        }
        Ok(())
    }
}
