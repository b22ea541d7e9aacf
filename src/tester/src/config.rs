//! Test configuration and defaults, grounded on `ovn_tester.py:20-245`
//! (`read_config`, `calculate_default_vips`, `calculate_default_static_vips`,
//! `calculate_default_node_remotes`).

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use oh_net::DualStackSubnet;
use oh_util::error::Error;
use oh_workload::{BrExConfig, ClusterConfig};
use serde_yaml::Value;

pub const DEFAULT_VIP_SUBNET: &str = "4.0.0.0/8";
pub const DEFAULT_VIP_SUBNET6: &str = "4::/32";
pub const DEFAULT_N_VIPS: u32 = 2;
pub const DEFAULT_VIP_PORT: u16 = 80;
pub const DEFAULT_BACKEND_PORT: u16 = 8080;

pub const DEFAULT_STATIC_VIP_SUBNET: &str = "5.0.0.0/8";
pub const DEFAULT_STATIC_VIP_SUBNET6: &str = "5::/32";
pub const DEFAULT_N_STATIC_VIPS: u32 = 65;
pub const DEFAULT_STATIC_BACKEND_SUBNET: &str = "6.0.0.0/8";
pub const DEFAULT_STATIC_BACKEND_SUBNET6: &str = "6::/32";
pub const DEFAULT_N_STATIC_BACKENDS: u32 = 2;

/// Top-level sections handled by the core rather than by a named test
/// module; `configure_tests` in `main.rs` skips these.
pub const RESERVED: &[&str] = &["global", "cluster", "base_cluster_bringup", "ext_cmd"];

#[derive(Debug, Clone, Copy)]
pub struct GlobalCfg {
    pub log_cmds: bool,
    pub cleanup: bool,
    pub run_ipv4: bool,
    pub run_ipv6: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ClusterBringupCfg {
    pub n_pods_per_node: usize,
}

fn get_bool(map: &Value, key: &str, default: bool) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn get_u64(map: &Value, key: &str, default: u64) -> u64 {
    map.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn get_str<'a>(map: &'a Value, key: &str, default: &'a str) -> String {
    map.get(key).and_then(Value::as_str).unwrap_or(default).to_string()
}

fn parse_v4(s: &str) -> Result<Ipv4Net, Error> {
    s.parse().map_err(|e| Error::InvalidConfig(format!("invalid IPv4 subnet `{s}`: {e}")))
}

fn parse_v6(s: &str) -> Result<Ipv6Net, Error> {
    s.parse().map_err(|e| Error::InvalidConfig(format!("invalid IPv6 subnet `{s}`: {e}")))
}

/// The `index`-th host counting up from `net`'s network address, mirroring
/// `netaddr`'s `iter_hosts()` (which skips the network address itself).
fn nth_host_v4(net: Ipv4Net, index: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(net.network()) + index + 1)
}

fn nth_host_v6(net: Ipv6Net, index: u32) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(net.network()) + index as u128 + 1)
}

/// `calculate_default_vips`: `n` VIPs on `subnet`, each with no backends
/// assigned yet (an empty backend list stands in for Python's `None`).
pub fn calculate_default_vips(subnet: Ipv4Net, n: u32) -> BTreeMap<String, Vec<String>> {
    (0..n).map(|i| (format!("{}:{DEFAULT_VIP_PORT}", nth_host_v4(subnet, i)), Vec::new())).collect()
}

/// IPv6 counterpart of `calculate_default_vips`, bracketing the address the
/// way a `host:port` VIP string needs to when the host part is an IPv6
/// literal.
pub fn calculate_default_vips6(subnet: Ipv6Net, n: u32) -> BTreeMap<String, Vec<String>> {
    (0..n).map(|i| (format!("[{}]:{DEFAULT_VIP_PORT}", nth_host_v6(subnet, i)), Vec::new())).collect()
}

/// `calculate_default_static_vips`: `n_vips` VIPs, every one sharing the
/// same `n_backends`-sized backend list (the original's own simplifying
/// assumption: "this assumes it's OK to use the same backend list for
/// each VIP").
pub fn calculate_default_static_vips(vip_subnet: Ipv4Net, backend_subnet: Ipv4Net, n_vips: u32, n_backends: u32) -> BTreeMap<String, Vec<String>> {
    let backend_list: Vec<String> = (0..n_backends).map(|i| format!("{}:{DEFAULT_BACKEND_PORT}", nth_host_v4(backend_subnet, i))).collect();
    (0..n_vips).map(|i| (format!("{}:{DEFAULT_VIP_PORT}", nth_host_v4(vip_subnet, i)), backend_list.clone())).collect()
}

/// IPv6 counterpart of `calculate_default_static_vips`.
pub fn calculate_default_static_vips6(vip_subnet: Ipv6Net, backend_subnet: Ipv6Net, n_vips: u32, n_backends: u32) -> BTreeMap<String, Vec<String>> {
    let backend_list: Vec<String> = (0..n_backends).map(|i| format!("[{}]:{DEFAULT_BACKEND_PORT}", nth_host_v6(backend_subnet, i))).collect();
    (0..n_vips).map(|i| (format!("[{}]:{DEFAULT_VIP_PORT}", nth_host_v6(vip_subnet, i)), backend_list.clone())).collect()
}

/// `calculate_default_node_remotes`: the comma-joined list of `tcp:`/`ssl:`
/// remotes workers connect their chassis to, one per relay (or per DB
/// replica when there are no relays).
pub fn calculate_default_node_remotes(net: Ipv4Net, clustered: bool, n_relays: u32, enable_ssl: bool) -> String {
    let skip = if n_relays > 0 { if clustered { 3 } else { 1 } } else { 0 };
    let count = if n_relays > 0 { n_relays } else if clustered { 3 } else { 1 };
    let scheme = if enable_ssl { "ssl" } else { "tcp" };
    (0..count).map(|i| format!("{scheme}:{}:6642", nth_host_v4(net, skip + i))).collect::<Vec<_>>().join(",")
}

/// Parses the top-level YAML document into the four configuration
/// structs the bring-up sequence needs, matching `ovn_tester.py::read_config`.
pub fn read_config(config: &Value) -> Result<(GlobalCfg, ClusterConfig, BrExConfig, ClusterBringupCfg), Error> {
    let empty = Value::Mapping(Default::default());
    let global_args = config.get("global").unwrap_or(&empty);
    let global_cfg = GlobalCfg {
        log_cmds: get_bool(global_args, "log_cmds", false),
        cleanup: get_bool(global_args, "cleanup", false),
        run_ipv4: get_bool(global_args, "run_ipv4", true),
        run_ipv6: get_bool(global_args, "run_ipv6", false),
    };

    let cluster_args = config.get("cluster").unwrap_or(&empty);
    let clustered_db = get_bool(cluster_args, "clustered_db", true);
    let node_net = parse_v4(&get_str(cluster_args, "node_net", "192.16.0.0/16"))?;
    let enable_ssl = get_bool(cluster_args, "enable_ssl", true);
    let n_relays = get_u64(cluster_args, "n_relays", 0) as u32;

    let mut vips = BTreeMap::new();
    if global_cfg.run_ipv4 {
        vips.extend(calculate_default_vips(parse_v4(DEFAULT_VIP_SUBNET)?, DEFAULT_N_VIPS));
    }

    let mut vips6 = BTreeMap::new();
    if global_cfg.run_ipv6 {
        vips6.extend(calculate_default_vips6(parse_v6(DEFAULT_VIP_SUBNET6)?, DEFAULT_N_VIPS));
    }

    let mut static_vips = BTreeMap::new();
    if global_cfg.run_ipv4 {
        static_vips.extend(calculate_default_static_vips(
            parse_v4(DEFAULT_STATIC_VIP_SUBNET)?,
            parse_v4(DEFAULT_STATIC_BACKEND_SUBNET)?,
            DEFAULT_N_STATIC_VIPS,
            DEFAULT_N_STATIC_BACKENDS,
        ));
    }

    let mut static_vips6 = BTreeMap::new();
    if global_cfg.run_ipv6 {
        static_vips6.extend(calculate_default_static_vips6(
            parse_v6(DEFAULT_STATIC_VIP_SUBNET6)?,
            parse_v6(DEFAULT_STATIC_BACKEND_SUBNET6)?,
            DEFAULT_N_STATIC_VIPS,
            DEFAULT_N_STATIC_BACKENDS,
        ));
    }

    let internal_net = DualStackSubnet::new(
        global_cfg.run_ipv4.then(|| parse_v4(&get_str(cluster_args, "internal_net", "16.0.0.0/16"))).transpose()?,
        global_cfg.run_ipv6.then(|| parse_v6(&get_str(cluster_args, "internal_net6", "16::/64"))).transpose()?,
    )?;
    let external_net = DualStackSubnet::new(
        global_cfg.run_ipv4.then(|| parse_v4(&get_str(cluster_args, "external_net", "3.0.0.0/16"))).transpose()?,
        global_cfg.run_ipv6.then(|| parse_v6(&get_str(cluster_args, "external_net6", "3::/64"))).transpose()?,
    )?;
    let gw_net = DualStackSubnet::new(
        global_cfg.run_ipv4.then(|| parse_v4(&get_str(cluster_args, "gw_net", "2.0.0.0/16"))).transpose()?,
        global_cfg.run_ipv6.then(|| parse_v6(&get_str(cluster_args, "gw_net6", "2::/64"))).transpose()?,
    )?;
    let cluster_net = DualStackSubnet::new(
        global_cfg.run_ipv4.then(|| parse_v4(&get_str(cluster_args, "cluster_net", "16.0.0.0/4"))).transpose()?,
        global_cfg.run_ipv6.then(|| parse_v6(&get_str(cluster_args, "cluster_net6", "16::/32"))).transpose()?,
    )?;
    let vip_subnet = DualStackSubnet::new(Some(parse_v4(DEFAULT_VIP_SUBNET)?), None)?;
    let node_net_dual = DualStackSubnet::new(Some(node_net), None)?;

    let node_remote = get_str(
        cluster_args,
        "node_remote",
        &calculate_default_node_remotes(node_net, clustered_db, n_relays, enable_ssl),
    );

    let cluster_cfg = ClusterConfig {
        cluster_cmd_path: get_str(cluster_args, "cluster_cmd_path", "/root/ovn-heater/runtime/ovn-fake-multinode"),
        monitor_all: get_bool(cluster_args, "monitor_all", true),
        logical_dp_groups: get_bool(cluster_args, "logical_dp_groups", true),
        clustered_db,
        datapath_type: get_str(cluster_args, "datapath_type", "system"),
        raft_election_to: get_u64(cluster_args, "raft_election_to", 16) as u32,
        northd_probe_interval: get_u64(cluster_args, "northd_probe_interval", 5000) as u32,
        db_inactivity_probe: get_u64(cluster_args, "db_inactivity_probe", 60000),
        node_net: node_net_dual,
        enable_ssl,
        node_remote,
        node_timeout_s: get_u64(cluster_args, "node_timeout_s", 20),
        internal_net,
        external_net,
        gw_net,
        cluster_net,
        n_workers: get_u64(cluster_args, "n_workers", 2) as usize,
        n_relays: n_relays as usize,
        vips,
        vips6,
        vip_subnet,
        static_vips,
        static_vips6,
        use_ovsdb_etcd: get_bool(cluster_args, "use_ovsdb_etcd", false),
    };
    let brex_cfg = BrExConfig { physical_net: get_str(cluster_args, "physical_net", "providernet") };

    let bringup_args = config.get("base_cluster_bringup").unwrap_or(&empty);
    let bringup_cfg = ClusterBringupCfg { n_pods_per_node: get_u64(bringup_args, "n_pods_per_node", 10) as usize };

    Ok((global_cfg, cluster_cfg, brex_cfg, bringup_cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calculate_default_vips_skips_the_network_address() {
        let vips = calculate_default_vips(parse_v4("4.0.0.0/8").unwrap(), 2);
        assert_eq!(vips.len(), 2);
        assert!(vips.contains_key("4.0.0.1:80"));
        assert!(vips.contains_key("4.0.0.2:80"));
    }

    #[test]
    fn calculate_default_static_vips_shares_one_backend_list() {
        let vips = calculate_default_static_vips(parse_v4("5.0.0.0/8").unwrap(), parse_v4("6.0.0.0/8").unwrap(), 3, 2);
        assert_eq!(vips.len(), 3);
        for backends in vips.values() {
            assert_eq!(backends, &vec!["6.0.0.1:8080".to_string(), "6.0.0.2:8080".to_string()]);
        }
    }

    #[test]
    fn calculate_default_node_remotes_skips_past_clustered_db_replicas() {
        let remotes = calculate_default_node_remotes(parse_v4("192.16.0.0/16").unwrap(), true, 2, false);
        assert_eq!(remotes, "tcp:192.16.0.4:6642,tcp:192.16.0.5:6642");
    }

    #[test]
    fn read_config_applies_every_default_when_given_an_empty_document() {
        let doc: Value = serde_yaml::from_str("{}").unwrap();
        let (global_cfg, cluster_cfg, brex_cfg, bringup_cfg) = read_config(&doc).unwrap();
        assert!(global_cfg.run_ipv4);
        assert!(!global_cfg.run_ipv6);
        assert_eq!(cluster_cfg.n_workers, 2);
        assert_eq!(cluster_cfg.vips.len(), DEFAULT_N_VIPS as usize);
        assert!(cluster_cfg.vips6.is_empty());
        assert!(cluster_cfg.static_vips6.is_empty());
        assert_eq!(brex_cfg.physical_net, "providernet");
        assert_eq!(bringup_cfg.n_pods_per_node, 10);
    }

    #[test]
    fn calculate_default_vips6_brackets_the_address() {
        let vips = calculate_default_vips6(parse_v6("4::/32").unwrap(), 2);
        assert_eq!(vips.len(), 2);
        assert!(vips.contains_key("[4::1]:80"));
        assert!(vips.contains_key("[4::2]:80"));
    }

    #[test]
    fn read_config_generates_ipv6_vips_when_enabled() {
        let doc: Value = serde_yaml::from_str("global:\n  run_ipv6: true\n").unwrap();
        let (global_cfg, cluster_cfg, _, _) = read_config(&doc).unwrap();
        assert!(global_cfg.run_ipv6);
        assert_eq!(cluster_cfg.vips6.len(), DEFAULT_N_VIPS as usize);
        assert_eq!(cluster_cfg.static_vips6.len(), DEFAULT_N_STATIC_VIPS as usize);
    }
}
