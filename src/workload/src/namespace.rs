//! The namespace/policy model (spec.md §4.6), grounded on
//! `ovn_workload.py:364-581`. A `Namespace` bundles two deny port groups,
//! one allow port group, and one address set; ACLs are added idempotently
//! (re-adding the same rule via `enforce()` is a no-op) because
//! `NbClient::acl_add` dedups on `(owner, direction, priority, match)`.
//!
//! `Namespace` holds no back-reference to `Cluster` (spec.md §9 design
//! note: no shared ownership) — operations that need cluster/worker
//! services take `&mut Cluster` and the OVS transport explicitly.

use oh_ovsdb::nb::NbClient;
use oh_ovsdb::types::{AddressSet, LoadBalancer, LsPort, PortGroup};
use oh_util::error::Error;

use crate::cluster::Cluster;

pub const ACL_DEFAULT_DENY_PRIO: u32 = 1;
pub const ACL_DEFAULT_ALLOW_ARP_PRIO: u32 = 2;
pub const ACL_NETPOL_ALLOW_PRIO: u32 = 3;

pub struct Namespace {
    pub name: String,
    pub ports: Vec<LsPort>,
    pub enforcing: bool,
    pub pg_def_deny_igr: PortGroup,
    pub pg_def_deny_egr: PortGroup,
    pub pg: PortGroup,
    pub addr_set: AddressSet,
    pub sub_pg: Vec<PortGroup>,
    pub sub_as: Vec<AddressSet>,
    pub load_balancer: Option<LoadBalancer>,
    /// VIPs already handed out by `provision_vips_to_load_balancers`, so
    /// repeated calls extend the range instead of re-using addresses.
    pub vip_count: usize,
}

impl Namespace {
    /// Creates the namespace's four owned OVSDB rows (two deny port
    /// groups, one allow port group, one address set) and bumps
    /// `cluster.n_ns`, matching `create_namespace`.
    pub async fn create(cluster: &mut Cluster, name: &str) -> Result<Namespace, Error> {
        let pg_def_deny_igr = cluster.nbctl.port_group_create(&format!("pg_deny_igr_{name}")).await?;
        let pg_def_deny_egr = cluster.nbctl.port_group_create(&format!("pg_deny_egr_{name}")).await?;
        let pg = cluster.nbctl.port_group_create(&format!("pg_{name}")).await?;
        let addr_set = cluster.nbctl.address_set_create(&format!("as_{name}")).await?;
        cluster.n_ns += 1;
        Ok(Namespace {
            name: name.to_string(),
            ports: Vec::new(),
            enforcing: false,
            pg_def_deny_igr,
            pg_def_deny_egr,
            pg,
            addr_set,
            sub_pg: Vec::new(),
            sub_as: Vec::new(),
            load_balancer: None,
            vip_count: 0,
        })
    }

    /// Adds `ports`' addresses to the address set unconditionally, and to
    /// the port groups only if policy is already being enforced here
    /// (mirrors OpenShift's port groups appearing only once the first
    /// network policy lands).
    pub async fn add_ports(&mut self, nbctl: &NbClient, ports: Vec<LsPort>) -> Result<(), Error> {
        let addrs: Vec<String> = ports.iter().filter_map(|p| p.ip()).filter_map(|ip| ip.ip4.map(|a| a.to_string())).collect();
        nbctl.address_set_add_addrs(&self.addr_set, &addrs).await?;
        if self.enforcing {
            let uuids: Vec<_> = ports.iter().map(|p| p.uuid()).collect();
            nbctl.port_group_add_ports(&self.pg_def_deny_igr, &uuids).await?;
            nbctl.port_group_add_ports(&self.pg_def_deny_egr, &uuids).await?;
            nbctl.port_group_add_ports(&self.pg, &uuids).await?;
        }
        self.ports.extend(ports);
        Ok(())
    }

    /// Idempotently ensures `enforce` has run: adds every current port to
    /// all three port groups exactly once.
    async fn enforce(&mut self, nbctl: &NbClient) -> Result<(), Error> {
        if self.enforcing {
            return Ok(());
        }
        self.enforcing = true;
        let uuids: Vec<_> = self.ports.iter().map(|p| p.uuid()).collect();
        nbctl.port_group_add_ports(&self.pg_def_deny_igr, &uuids).await?;
        nbctl.port_group_add_ports(&self.pg_def_deny_egr, &uuids).await?;
        nbctl.port_group_add_ports(&self.pg, &uuids).await?;
        Ok(())
    }

    pub async fn default_deny(&mut self, nbctl: &NbClient) -> Result<(), Error> {
        self.enforce(nbctl).await?;
        let igr = self.pg_def_deny_igr.clone();
        let egr = self.pg_def_deny_egr.clone();
        let igr_uuid = named_port_group_uuid(nbctl, &igr).await?;
        let egr_uuid = named_port_group_uuid(nbctl, &egr).await?;
        nbctl
            .acl_add("Port_Group", igr_uuid, "to-lport", ACL_DEFAULT_DENY_PRIO, &format!("ip4.src == ${} && outport == @{}", self.addr_set.name, igr.name), "drop")
            .await?;
        nbctl
            .acl_add("Port_Group", egr_uuid, "to-lport", ACL_DEFAULT_DENY_PRIO, &format!("ip4.dst == ${} && inport == @{}", self.addr_set.name, egr.name), "drop")
            .await?;
        nbctl
            .acl_add("Port_Group", igr_uuid, "to-lport", ACL_DEFAULT_ALLOW_ARP_PRIO, &format!("outport == @{} && arp", igr.name), "allow")
            .await?;
        nbctl
            .acl_add("Port_Group", egr_uuid, "to-lport", ACL_DEFAULT_ALLOW_ARP_PRIO, &format!("inport == @{} && arp", egr.name), "allow")
            .await
    }

    pub async fn allow_within_namespace(&mut self, nbctl: &NbClient) -> Result<(), Error> {
        self.enforce(nbctl).await?;
        let pg_uuid = named_port_group_uuid(nbctl, &self.pg).await?;
        nbctl
            .acl_add("Port_Group", pg_uuid, "to-lport", ACL_NETPOL_ALLOW_PRIO, &format!("ip4.src == ${} && outport == @{}", self.addr_set.name, self.pg.name), "allow-related")
            .await?;
        nbctl
            .acl_add("Port_Group", pg_uuid, "to-lport", ACL_NETPOL_ALLOW_PRIO, &format!("ip4.dst == ${} && inport == @{}", self.addr_set.name, self.pg.name), "allow-related")
            .await
    }

    pub async fn allow_cross_namespace(&mut self, nbctl: &NbClient, other: &Namespace) -> Result<(), Error> {
        self.enforce(nbctl).await?;
        let pg_uuid = named_port_group_uuid(nbctl, &self.pg).await?;
        nbctl
            .acl_add("Port_Group", pg_uuid, "to-lport", ACL_NETPOL_ALLOW_PRIO, &format!("ip4.src == ${} && outport == @{}", self.addr_set.name, other.pg.name), "allow-related")
            .await?;
        nbctl
            .acl_add("Port_Group", pg_uuid, "to-lport", ACL_NETPOL_ALLOW_PRIO, &format!("ip4.dst == ${} && inport == @{}", other.addr_set.name, self.pg.name), "allow-related")
            .await
    }

    /// Creates a sub-namespace port group + address set from `ports`
    /// (without touching `enforcing`/the top-level groups), returning its
    /// index for use with `allow_sub_namespace`.
    pub async fn create_sub_ns(&mut self, nbctl: &NbClient, ports: &[LsPort]) -> Result<usize, Error> {
        let n_sub_pgs = self.sub_pg.len();
        let suffix = format!("{}_{n_sub_pgs}", self.name);
        let pg = nbctl.port_group_create(&format!("sub_pg_{suffix}")).await?;
        let uuids: Vec<_> = ports.iter().map(|p| p.uuid()).collect();
        nbctl.port_group_add_ports(&pg, &uuids).await?;
        self.sub_pg.push(pg);
        let addr_set = nbctl.address_set_create(&format!("sub_as_{suffix}")).await?;
        let addrs: Vec<String> = ports.iter().filter_map(|p| p.ip()).filter_map(|ip| ip.ip4.map(|a| a.to_string())).collect();
        nbctl.address_set_add_addrs(&addr_set, &addrs).await?;
        self.sub_as.push(addr_set);
        Ok(n_sub_pgs)
    }

    pub async fn allow_sub_namespace(&mut self, nbctl: &NbClient, src: usize, dst: usize) -> Result<(), Error> {
        let pg_uuid = named_port_group_uuid(nbctl, &self.pg).await?;
        nbctl
            .acl_add("Port_Group", pg_uuid, "to-lport", ACL_NETPOL_ALLOW_PRIO, &format!("ip4.src == ${} && outport == @{}", self.sub_as[src].name, self.sub_pg[dst].name), "allow-related")
            .await?;
        nbctl
            .acl_add("Port_Group", pg_uuid, "to-lport", ACL_NETPOL_ALLOW_PRIO, &format!("ip4.dst == ${} && inport == @{}", self.sub_as[dst].name, self.sub_pg[src].name), "allow-related")
            .await
    }

    pub async fn allow_from_external(&mut self, nbctl: &NbClient, mut external_ips: Vec<String>, include_ext_gw: bool) -> Result<(), Error> {
        self.enforce(nbctl).await?;
        if include_ext_gw {
            let ext_gw = self.ports.first().and_then(|p| p.ext_gw()).and_then(|ip| ip.ip4).ok_or_else(|| Error::Other(anyhow::anyhow!("namespace has no ports to derive an ext-gw from")))?;
            external_ips.push(ext_gw.to_string());
        }
        let pg_uuid = named_port_group_uuid(nbctl, &self.pg).await?;
        nbctl
            .acl_add("Port_Group", pg_uuid, "to-lport", ACL_NETPOL_ALLOW_PRIO, &format!("ip4.src == {{{}}} && outport == @{}", external_ips.join(","), self.pg.name), "allow-related")
            .await
    }

    pub async fn unprovision(&mut self, cluster: &mut Cluster) -> Result<(), Error> {
        let ports = std::mem::take(&mut self.ports);
        cluster.unprovision_ports(&ports).await?;
        cluster.nbctl.port_group_del(&self.pg_def_deny_igr).await?;
        cluster.nbctl.port_group_del(&self.pg_def_deny_egr).await?;
        cluster.nbctl.port_group_del(&self.pg).await?;
        cluster.nbctl.address_set_del(&self.addr_set).await?;
        for pg in &self.sub_pg {
            cluster.nbctl.port_group_del(pg).await?;
        }
        for addr_set in &self.sub_as {
            cluster.nbctl.address_set_del(addr_set).await?;
        }
        Ok(())
    }

    /// Unprovisions a subset of ports without tearing down the
    /// namespace or any policy attached to it.
    pub async fn unprovision_ports(&mut self, cluster: &mut Cluster, ports: &[LsPort]) -> Result<(), Error> {
        self.ports.retain(|p| !ports.iter().any(|q| q.uuid() == p.uuid()));
        cluster.unprovision_ports(ports).await
    }

    /// "Random" internal check: first port can reach the last port in
    /// the namespace.
    pub async fn check_enforcing_internal(&self, cluster: &Cluster) -> Result<(), Error> {
        if self.ports.len() > 1 {
            let src = &self.ports[0];
            let dst = &self.ports[self.ports.len() - 1];
            let dest_ip = dst.ip().and_then(|ip| ip.ip4).map(|a| a.to_string());
            let worker_idx = src.metadata().ok_or_else(|| Error::Other(anyhow::anyhow!("port has no owning worker")))?;
            cluster.worker_nodes[worker_idx].ping_port(src, dest_ip.as_deref(), cluster.cluster_cfg.node_timeout_s).await?;
        }
        Ok(())
    }

    pub async fn check_enforcing_external(&self, cluster: &Cluster) -> Result<(), Error> {
        if let Some(dst) = self.ports.first() {
            let worker_idx = dst.metadata().ok_or_else(|| Error::Other(anyhow::anyhow!("port has no owning worker")))?;
            cluster.worker_nodes[worker_idx].ping_external(dst, cluster.cluster_cfg.node_timeout_s).await?;
        }
        Ok(())
    }

    pub async fn check_enforcing_cross_ns(&self, cluster: &Cluster, other: &Namespace) -> Result<(), Error> {
        if let (Some(src), Some(dst)) = (self.ports.first(), other.ports.first()) {
            let dest_ip = dst.ip().and_then(|ip| ip.ip4).map(|a| a.to_string());
            let worker_idx = src.metadata().ok_or_else(|| Error::Other(anyhow::anyhow!("port has no owning worker")))?;
            cluster.worker_nodes[worker_idx].ping_port(src, dest_ip.as_deref(), cluster.cluster_cfg.node_timeout_s).await?;
        }
        Ok(())
    }

    pub async fn create_load_balancer(&mut self, nbctl: &NbClient) -> Result<(), Error> {
        self.load_balancer = Some(nbctl.create_lb(&format!("lb_{}", self.name), "tcp").await?);
        Ok(())
    }

    /// Allocates VIPs from this namespace's slice of the namespace VIP
    /// range (`30.0.0.0/16`, sliced per `cluster.n_ns`), continuing from
    /// `vip_count` so a second call doesn't clobber the first.
    pub async fn provision_vips_to_load_balancers(&mut self, nbctl: &NbClient, ns_vip_base: &oh_net::DualStackSubnet, n_ns: usize, backend_lists: &[Vec<LsPort>]) -> Result<(), Error> {
        let lb = self.load_balancer.clone().ok_or_else(|| Error::Other(anyhow::anyhow!("namespace load balancer not created")))?;
        let vip_net = ns_vip_base.next(n_ns as u32);
        let base_ip = vip_net.forward((self.vip_count + 1) as u32)?.ip4.ok_or_else(|| Error::Other(anyhow::anyhow!("namespace vip subnet has no ipv4 range")))?;
        let mut vips = Vec::with_capacity(backend_lists.len());
        for (i, ports) in backend_lists.iter().enumerate() {
            let vip_ip: std::net::Ipv4Addr = (u32::from(base_ip) + i as u32).into();
            let backends = ports.iter().filter_map(|p| p.ip()).filter_map(|ip| ip.ip4.map(|a| format!("{a}:8080"))).collect::<Vec<_>>().join(",");
            vips.push((format!("{vip_ip}:80"), backends));
        }
        self.vip_count += backend_lists.len();
        nbctl.lb_set_vips(&lb, &vips).await
    }
}

/// `acl_add` mutates a Port_Group row by UUID; `PortGroup` is addressed
/// purely by name elsewhere (spec.md §3), so this resolves the UUID
/// through the monitor the way `find_by_name` does inside `nb.rs`.
async fn named_port_group_uuid(nbctl: &NbClient, group: &PortGroup) -> Result<uuid::Uuid, Error> {
    nbctl.port_group_uuid(group).await
}
