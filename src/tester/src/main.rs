//! Entry point: parse the two YAML inputs, stand up the cluster, run base
//! bring-up, then every configured test module in turn. Grounded on
//! `ovn_tester.py`'s `__main__` block and the functions it calls
//! (`read_physical_deployment`, `create_nodes`, `prepare_test`,
//! `run_base_cluster_bringup`).

mod config;
mod ext_cmd;
mod tests;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use oh_ovsdb::{OvsdbConnection, TcpOvsdbConnection};
use oh_sandbox::{PhysicalNode, ShellTransport, Transport};
use oh_stats::Context;
use oh_util::error::Error;
use oh_workload::{BrExConfig, CentralNode, Cluster, ClusterConfig, WorkerNode};
use serde_yaml::Value;

use config::{GlobalCfg, ClusterBringupCfg};

const NB_PORT: u16 = 6641;
const SB_PORT: u16 = 6642;

/// `PHYSICAL_DEPLOYMENT TEST_CONF`, matching `ovn_tester.py usage()`.
#[derive(Parser)]
#[clap(name = "ovn-heater", about = "OVN scale/performance test harness")]
struct Cli {
    /// YAML file defining the physical deployment (central node + workers).
    physical_deployment: PathBuf,
    /// YAML file defining the test parameters.
    test_conf: PathBuf,
}

/// `read_physical_deployment`: the `central-node`/`worker-nodes` sections
/// of the deployment YAML, each host wrapped as a `PhysicalNode` sharing
/// one `Transport`.
fn read_physical_deployment(
    deployment: &Value,
    log_cmds: bool,
    transport: Arc<dyn Transport>,
) -> Result<(PhysicalNode, Vec<PhysicalNode>), Error> {
    let central_dep = deployment
        .get("central-node")
        .ok_or_else(|| Error::InvalidConfig("physical deployment is missing `central-node`".into()))?;
    let central_name = central_dep.get("name").and_then(Value::as_str).unwrap_or("localhost");
    let central_node = PhysicalNode::new(central_name, log_cmds, Arc::clone(&transport));

    let worker_deps = deployment
        .get("worker-nodes")
        .and_then(Value::as_sequence)
        .ok_or_else(|| Error::InvalidConfig("physical deployment is missing `worker-nodes`".into()))?;
    let worker_nodes = worker_deps
        .iter()
        .map(|w| {
            let name = w.as_str().ok_or_else(|| Error::InvalidConfig("worker-nodes entries must be host names".into()))?;
            Ok(PhysicalNode::new(name, log_cmds, Arc::clone(&transport)))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok((central_node, worker_nodes))
}

/// `create_nodes`: deterministic container naming and mgmt-IP assignment
/// (spec.md §9 supplemented feature). `mgmt_ip` starts 2 hosts into
/// `node_net`; each worker takes the next consecutive host after that.
fn create_nodes(
    cluster_cfg: &ClusterConfig,
    bringup_cfg: &ClusterBringupCfg,
    central: PhysicalNode,
    workers: Vec<PhysicalNode>,
) -> Result<(CentralNode, Vec<WorkerNode>), Error> {
    if workers.is_empty() && cluster_cfg.n_workers > 0 {
        return Err(Error::InvalidConfig("no worker-nodes in the physical deployment".into()));
    }

    let mgmt_net = cluster_cfg.node_net;
    let mgmt_ip = mgmt_net.forward(2)?;
    let db_containers = oh_workload::cluster::db_container_names(cluster_cfg.clustered_db);
    let relay_containers = oh_workload::cluster::relay_container_names(cluster_cfg.n_relays);

    let central_node = CentralNode {
        container: db_containers[0].clone(),
        physical_node: central,
        mgmt_net,
        mgmt_ip,
        db_containers,
        relay_containers,
    };

    let mut worker_nodes = Vec::with_capacity(cluster_cfg.n_workers);
    for i in 0..cluster_cfg.n_workers {
        let physical_node = workers[i % workers.len()].clone();
        let worker_mgmt_ip = mgmt_net.forward(3 + i as u32)?;
        worker_nodes.push(WorkerNode::new(
            physical_node,
            oh_workload::cluster::worker_container_name(i),
            mgmt_net,
            worker_mgmt_ip,
            cluster_cfg.internal_net.next(i as u32),
            cluster_cfg.external_net.next(i as u32),
            cluster_cfg.gw_net,
            i,
            bringup_cfg.n_pods_per_node,
        ));
    }

    Ok((central_node, worker_nodes))
}

/// Dials the NB and SB databases on the central node's mgmt IP and starts
/// the cluster. `enable_ssl` only governs the `tcp:`/`ssl:` scheme chassis
/// use to reach the DB (`node_remote`, `config.rs::calculate_default_node_remotes`);
/// the harness's own NB/SB management connection always dials in plain TCP,
/// since `TcpOvsdbConnection` has no TLS transport to switch to.
async fn prepare_test(
    central_node: CentralNode,
    worker_nodes: Vec<WorkerNode>,
    cluster_cfg: ClusterConfig,
    brex_cfg: BrExConfig,
    ovs_transport: Arc<dyn Transport>,
) -> Result<Cluster, Error> {
    let mgmt_ip4 = central_node
        .mgmt_ip
        .ip4
        .ok_or_else(|| Error::InvalidConfig("node_net must carry an IPv4 range".into()))?;
    let nb_connection: Arc<dyn OvsdbConnection> =
        Arc::new(TcpOvsdbConnection::connect(format!("{mgmt_ip4}:{NB_PORT}"), "OVN_Northbound").await?);
    let sb_connection: Arc<dyn OvsdbConnection> =
        Arc::new(TcpOvsdbConnection::connect(format!("{mgmt_ip4}:{SB_PORT}"), "OVN_Southbound").await?);

    let mut ovn = Cluster::new(central_node, worker_nodes, cluster_cfg, brex_cfg, nb_connection, sb_connection, ovs_transport);

    let ctx = Context::new("prepare_test", 1, true);
    ovn.start().await?;
    let (_, report) = ctx.finish();
    tracing::debug!(%report, "phase report");

    Ok(ovn)
}

/// `run_base_cluster_bringup`: cluster-wide router/join-switch/LB first,
/// then per worker: connect & provision topology, provision its pod
/// quota directly (not round robin), wire its load balancers, and ping
/// every port it was just handed; finally groups the cluster LB under a
/// load balancer group attached to the router and join switch.
async fn run_base_cluster_bringup(ovn: &mut Cluster, bringup_cfg: &ClusterBringupCfg) -> Result<(), Error> {
    let n_workers = ovn.worker_nodes.len();
    let ctx = Context::new("base_cluster_bringup", n_workers, false);

    ovn.create_cluster_router("lr-cluster").await?;
    ovn.create_cluster_join_switch("ls-join").await?;
    ovn.create_cluster_load_balancer("lb-cluster").await?;

    let cluster_router = ovn.router.clone().ok_or_else(|| Error::Other(anyhow::anyhow!("cluster router not created")))?;
    let join_switch = ovn.join_switch.clone().ok_or_else(|| Error::Other(anyhow::anyhow!("cluster join switch not created")))?;
    let cluster_lb = ovn.load_balancer.clone().ok_or_else(|| Error::Other(anyhow::anyhow!("cluster load balancer not created")))?;
    let cluster_cfg = ovn.cluster_cfg.clone();
    let brex_cfg = ovn.brex_cfg.clone();
    let cluster_vips: Vec<String> = cluster_cfg.vips.keys().chain(cluster_cfg.vips6.keys()).cloned().collect();
    let nbctl = ovn.nbctl.clone();
    let sbctl = ovn.sbctl.clone();

    for i in 0..n_workers {
        ovn.worker_nodes[i]
            .provision(&nbctl, &sbctl, &cluster_cfg, &cluster_router, &join_switch, &cluster_cfg.cluster_net, &brex_cfg.physical_net)
            .await?;
        let ports = ovn.provision_ports_on(i, bringup_cfg.n_pods_per_node, false).await?;
        ovn.worker_nodes[i].provision_load_balancers(&nbctl, &cluster_lb, &cluster_vips, &ports).await?;
        ovn.worker_nodes[i].ping_ports(&ports, cluster_cfg.node_timeout_s).await?;
    }
    ovn.provision_lb_group("lbg-cluster").await?;

    let (_, report) = ctx.finish();
    tracing::debug!(%report, "phase report");
    Ok(())
}

async fn run() -> Result<(), Error> {
    let cli = Cli::parse();

    let test_conf_text = std::fs::read_to_string(&cli.test_conf)
        .map_err(|e| Error::InvalidConfig(format!("reading {}: {e}", cli.test_conf.display())))?;
    let config: Value = serde_yaml::from_str(&test_conf_text)
        .map_err(|e| Error::InvalidConfig(format!("parsing {}: {e}", cli.test_conf.display())))?;

    let (global_cfg, cluster_cfg, brex_cfg, bringup_cfg) = config::read_config(&config)?;

    oh_util::logging::init_tracing(global_cfg.log_cmds);

    if !global_cfg.run_ipv4 && !global_cfg.run_ipv6 {
        return Err(Error::InvalidConfig("at least one of run_ipv4/run_ipv6 must be set".into()));
    }

    let deployment_text = std::fs::read_to_string(&cli.physical_deployment)
        .map_err(|e| Error::InvalidConfig(format!("reading {}: {e}", cli.physical_deployment.display())))?;
    let deployment: Value = serde_yaml::from_str(&deployment_text)
        .map_err(|e| Error::InvalidConfig(format!("parsing {}: {e}", cli.physical_deployment.display())))?;

    let ovs_transport: Arc<dyn Transport> = Arc::new(ShellTransport);
    let (central, workers) = read_physical_deployment(&deployment, global_cfg.log_cmds, Arc::clone(&ovs_transport))?;
    let (central_node, worker_nodes) = create_nodes(&cluster_cfg, &bringup_cfg, central, workers)?;

    let tests = ext_cmd::configure_tests(&config);

    let mut ovn = prepare_test(central_node, worker_nodes, cluster_cfg, brex_cfg, ovs_transport).await?;
    run_base_cluster_bringup(&mut ovn, &bringup_cfg).await?;
    for test in &tests {
        test.run(&mut ovn, &global_cfg).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
