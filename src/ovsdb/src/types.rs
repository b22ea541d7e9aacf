//! Logical entities mirrored from the NB database, per spec §3. Each owns
//! a stable UUID assigned by the database, except `PortGroup`/`AddressSet`
//! (identified by name only).

use oh_net::DualStackIp;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LRouter {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LrPort {
    pub name: String,
    pub mac: String,
    pub ip: DualStackIp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LSwitch {
    pub uuid: Uuid,
    pub name: String,
    pub cidr4: Option<ipnet::Ipv4Net>,
    pub cidr6: Option<ipnet::Ipv6Net>,
}

/// A switch port. The router-type variant peers 1:1 with exactly one
/// `LrPort` on the same logical link (spec §3); modeling it as a distinct
/// variant (rather than an `Option<LrPort>` field on one struct) makes
/// that peering structural instead of merely conventional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LsPort {
    /// A port bound to an endpoint (VM/pod), possibly passive (no
    /// endpoint actually bound — used for scale padding).
    Access {
        uuid: Uuid,
        name: String,
        mac: Option<String>,
        ip: Option<oh_net::DualStackIp>,
        gw: Option<oh_net::DualStackIp>,
        ext_gw: Option<oh_net::DualStackIp>,
        /// Back-reference to the owning worker. Never shared ownership
        /// (spec §9 design note) — an index into the cluster's worker
        /// table.
        metadata: Option<usize>,
        passive: bool,
    },
    /// A port peered 1:1 with a router port on the same logical link.
    Router { uuid: Uuid, name: String, peer: LrPort },
    /// A localnet port bound to a physical network.
    Localnet { uuid: Uuid, name: String, physical_net: String },
}

impl LsPort {
    pub fn uuid(&self) -> Uuid {
        match self {
            LsPort::Access { uuid, .. } => *uuid,
            LsPort::Router { uuid, .. } => *uuid,
            LsPort::Localnet { uuid, .. } => *uuid,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            LsPort::Access { name, .. } => name,
            LsPort::Router { name, .. } => name,
            LsPort::Localnet { name, .. } => name,
        }
    }

    pub fn passive(&self) -> bool {
        matches!(self, LsPort::Access { passive: true, .. })
    }

    pub fn metadata(&self) -> Option<usize> {
        match self {
            LsPort::Access { metadata, .. } => *metadata,
            _ => None,
        }
    }

    pub fn ip(&self) -> Option<oh_net::DualStackIp> {
        match self {
            LsPort::Access { ip, .. } => *ip,
            _ => None,
        }
    }

    pub fn ext_gw(&self) -> Option<oh_net::DualStackIp> {
        match self {
            LsPort::Access { ext_gw, .. } => *ext_gw,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortGroup {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressSet {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancer {
    pub name: String,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerGroup {
    pub name: String,
    pub uuid: Uuid,
}
