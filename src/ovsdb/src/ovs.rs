//! Local `ovs-vsctl` operations against the worker's `br-int`, grounded on
//! `ovn_utils.py::OvsVsctl`. Unlike `nb.rs`/`sb.rs` these are not OVSDB
//! transactions through the monitored connection at all — they run
//! `ovs-vsctl`/`ip netns` commands on the worker host through
//! `oh_sandbox::Transport`, since the local `Open_vSwitch` database is
//! addressed through the CLI tool in the same way the original shells out
//! to it rather than opening a socket to it directly.

use oh_net::DualStackIp;
use oh_sandbox::{RunOpts, Transport};
use oh_util::error::Error;

pub struct OvsClient<'a> {
    transport: &'a dyn Transport,
    host: String,
}

impl<'a> OvsClient<'a> {
    pub fn new(transport: &'a dyn Transport, host: impl Into<String>) -> OvsClient<'a> {
        OvsClient { transport, host: host.into() }
    }

    /// Adds `port` to `br-int` tagged with the logical switch port's name
    /// as its `iface-id`, the binding key northd watches to mark a port
    /// bound (spec.md §4.4).
    pub async fn add_port(&self, port: &str, iface_id: &str) -> Result<(), Error> {
        let cmd = format!(
            "ovs-vsctl add-port br-int {port} -- set interface {port} external_ids:iface-id={iface_id}"
        );
        self.transport.run(&self.host, &cmd, RunOpts { check: true, ..Default::default() }).await?;
        Ok(())
    }

    pub async fn del_port(&self, port: &str) -> Result<(), Error> {
        let cmd = format!("ovs-vsctl del-port br-int {port}");
        self.transport.run(&self.host, &cmd, RunOpts { check: true, ..Default::default() }).await?;
        Ok(())
    }

    /// Creates a netns for `port`, wires a veth pair with one end plugged
    /// into `br-int` as `port` and the other moved into the netns as
    /// `eth0`, and assigns `ip`/`mac` and a default route via `gw` inside
    /// the netns. Mirrors `OvsVsctl.bind_vm_port`'s full command sequence.
    pub async fn bind_vm_port(&self, port: &str, iface_id: &str, mac: &str, ip: &DualStackIp, gw: &DualStackIp) -> Result<(), Error> {
        self.add_port(port, iface_id).await?;
        let ns = format!("{port}-ns");
        let veth_host = format!("{port}-veth0");
        let veth_ns = format!("{port}-veth1");
        let commands = [
            format!("ip netns add {ns}"),
            format!("ip link add {veth_host} type veth peer name {veth_ns}"),
            format!("ip link set {veth_ns} netns {ns}"),
            format!("ip netns exec {ns} ip link set {veth_ns} address {mac}"),
            format!("ip netns exec {ns} ip link set {veth_ns} name eth0"),
            format!("ip netns exec {ns} ip link set eth0 up"),
            format!("ip netns exec {ns} ip link set lo up"),
        ];
        for cmd in commands {
            self.transport.run(&self.host, &cmd, RunOpts { check: true, ..Default::default() }).await?;
        }
        if let (Some(ip4), Some(plen4)) = (ip.ip4, ip.plen4) {
            self.transport
                .run(&self.host, &format!("ip netns exec {ns} ip addr add {ip4}/{plen4} dev eth0"), RunOpts { check: true, ..Default::default() })
                .await?;
            if let Some(gw4) = gw.ip4 {
                self.transport
                    .run(&self.host, &format!("ip netns exec {ns} ip route add default via {gw4}"), RunOpts { check: true, ..Default::default() })
                    .await?;
            }
        }
        if let (Some(ip6), Some(plen6)) = (ip.ip6, ip.plen6) {
            self.transport
                .run(&self.host, &format!("ip netns exec {ns} ip -6 addr add {ip6}/{plen6} dev eth0"), RunOpts { check: true, ..Default::default() })
                .await?;
            if let Some(gw6) = gw.ip6 {
                self.transport
                    .run(&self.host, &format!("ip netns exec {ns} ip -6 route add default via {gw6}"), RunOpts { check: true, ..Default::default() })
                    .await?;
            }
        }
        self.transport
            .run(&self.host, &format!("ip link set {veth_host} master br-int"), RunOpts { check: false, ..Default::default() })
            .await?;
        Ok(())
    }

    /// Tears down a port's netns/veth pair and removes it from `br-int`.
    pub async fn unbind_vm_port(&self, port: &str) -> Result<(), Error> {
        let ns = format!("{port}-ns");
        self.transport.run(&self.host, &format!("ip netns del {ns}"), RunOpts { check: false, ..Default::default() }).await?;
        self.del_port(port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oh_sandbox::testing::RecordingTransport;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn bind_vm_port_issues_netns_and_address_commands() {
        let transport = RecordingTransport::default();
        let ovs = OvsClient::new(&transport, "worker-1");
        let ip = DualStackIp::v4_only(Ipv4Addr::new(16, 0, 0, 5), 24);
        let gw = DualStackIp::v4_only(Ipv4Addr::new(16, 0, 0, 1), 24);
        ovs.bind_vm_port("lp0", "lp0", "02:00:00:00:00:01", &ip, &gw).await.unwrap();
        let calls = transport.calls.lock().unwrap();
        assert!(calls.iter().any(|(_, cmd)| cmd.contains("ip netns add lp0-ns")));
        assert!(calls.iter().any(|(_, cmd)| cmd.contains("ip addr add 16.0.0.5/24 dev eth0")));
        assert!(calls.iter().any(|(_, cmd)| cmd.contains("ip route add default via 16.0.0.1")));
    }

    #[tokio::test]
    async fn unbind_vm_port_deletes_netns_then_the_ovs_port() {
        let transport = RecordingTransport::default();
        let ovs = OvsClient::new(&transport, "worker-1");
        ovs.unbind_vm_port("lp0").await.unwrap();
        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls[0].1, "ip netns del lp0-ns");
        assert!(calls[1].1.contains("del-port br-int lp0"));
    }
}
