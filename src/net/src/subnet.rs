//! Dual-stack subnet slicing and host enumeration.
//!
//! Grounded on `ovn_utils.py::DualStackSubnet`/`DualStackIP`: a subnet pair
//! `{n4?, n6?}` supports three operations — `next(i)` (the i-th same-sized
//! child subnet after this one, used to carve one `/16` per worker out of a
//! larger range), `forward(i)` (the i-th host counting up from the network
//! address), and `reverse(i)` (the i-th host counting down from the
//! broadcast/last address).

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use oh_util::error::Error;

/// An address that may be present in one or both families, mirroring
/// whichever families are present in the subnet it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualStackIp {
    pub ip4: Option<Ipv4Addr>,
    pub plen4: Option<u8>,
    pub ip6: Option<Ipv6Addr>,
    pub plen6: Option<u8>,
}

impl DualStackIp {
    pub fn v4_only(ip: Ipv4Addr, plen: u8) -> DualStackIp {
        DualStackIp { ip4: Some(ip), plen4: Some(plen), ip6: None, plen6: None }
    }

    pub fn v6_only(ip: Ipv6Addr, plen: u8) -> DualStackIp {
        DualStackIp { ip4: None, plen4: None, ip6: Some(ip), plen6: Some(plen) }
    }
}

/// A subnet pair; at least one family must be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualStackSubnet {
    pub n4: Option<Ipv4Net>,
    pub n6: Option<Ipv6Net>,
}

impl DualStackSubnet {
    pub fn new(n4: Option<Ipv4Net>, n6: Option<Ipv6Net>) -> Result<DualStackSubnet, Error> {
        if n4.is_none() && n6.is_none() {
            return Err(Error::InvalidConfig(
                "dual-stack subnet requires at least one address family".into(),
            ));
        }
        Ok(DualStackSubnet { n4, n6 })
    }

    /// The `index`-th same-sized child subnet following `self`.
    pub fn next(&self, index: u32) -> DualStackSubnet {
        DualStackSubnet {
            n4: self.n4.map(|n| next_v4(n, index)),
            n6: self.n6.map(|n| next_v6(n, index)),
        }
    }

    /// The `index`-th host counting up from the network address.
    pub fn forward(&self, index: u32) -> Result<DualStackIp, Error> {
        if self.n4.is_none() && self.n6.is_none() {
            return Err(Error::InvalidConfig("invalid configuration".into()));
        }
        Ok(DualStackIp {
            ip4: self.n4.map(|n| Ipv4Addr::from(u32::from(n.network()) + index)),
            plen4: self.n4.map(|n| n.prefix_len()),
            ip6: self.n6.map(|n| Ipv6Addr::from(u128::from(n.network()) + index as u128)),
            plen6: self.n6.map(|n| n.prefix_len()),
        })
    }

    /// The `index`-th host counting down from the last address in the
    /// subnet (the broadcast address for v4).
    pub fn reverse(&self, index: u32) -> Result<DualStackIp, Error> {
        if self.n4.is_none() && self.n6.is_none() {
            return Err(Error::InvalidConfig("invalid configuration".into()));
        }
        Ok(DualStackIp {
            ip4: self.n4.map(|n| Ipv4Addr::from(u32::from(n.broadcast()) - index)),
            plen4: self.n4.map(|n| n.prefix_len()),
            ip6: self.n6.map(|n| Ipv6Addr::from(u128::from(n.broadcast()) - index as u128)),
            plen6: self.n6.map(|n| n.prefix_len()),
        })
    }
}

fn next_v4(n: Ipv4Net, index: u32) -> Ipv4Net {
    let size = 1u64 << (32 - n.prefix_len());
    let base = u32::from(n.network()) as u64 + size * index as u64;
    Ipv4Net::new(Ipv4Addr::from(base as u32), n.prefix_len()).expect("prefix length preserved")
}

fn next_v6(n: Ipv6Net, index: u32) -> Ipv6Net {
    let size = 1u128 << (128 - n.prefix_len());
    let base = u128::from(n.network()) + size * index as u128;
    Ipv6Net::new(Ipv6Addr::from(base), n.prefix_len()).expect("prefix length preserved")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn next_carves_equal_sized_children() {
        let base = DualStackSubnet::new(Some(v4("16.0.0.0/16")), None).unwrap();
        let child = base.next(2);
        assert_eq!(child.n4.unwrap(), v4("16.2.0.0/16"));
    }

    #[test]
    fn forward_counts_up_from_network_address() {
        let s = DualStackSubnet::new(Some(v4("16.0.0.0/24")), None).unwrap();
        let ip = s.forward(5).unwrap();
        assert_eq!(ip.ip4.unwrap(), Ipv4Addr::new(16, 0, 0, 5));
        assert!(ip.ip6.is_none());
    }

    #[test]
    fn reverse_counts_down_from_broadcast() {
        let s = DualStackSubnet::new(Some(v4("16.0.0.0/24")), None).unwrap();
        let ip = s.reverse(1).unwrap();
        assert_eq!(ip.ip4.unwrap(), Ipv4Addr::new(16, 0, 0, 254));
    }

    #[test]
    fn absent_family_stays_absent() {
        let s = DualStackSubnet::new(Some(v4("16.0.0.0/24")), None).unwrap();
        let ip = s.forward(1).unwrap();
        assert!(ip.ip6.is_none() && ip.plen6.is_none());
    }

    #[test]
    fn rejects_empty_subnet() {
        assert!(DualStackSubnet::new(None, None).is_err());
    }
}
