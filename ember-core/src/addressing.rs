//! Deterministic per-slot network addressing.
//!
//! Every name and address a sandbox uses on the host is a pure function of
//! its slot index, so teardown and recovery need no stored mapping.
//!
//! With `hi = index / 256` and `lo = index % 256`:
//!
//! | Item | Value |
//! |---|---|
//! | namespace | `ns-<index>` |
//! | host-side veth | `veth<index>`, `10.<hi>.<lo>.1/30` |
//! | namespace-side veth | `vpeer0`, `10.<hi>.<lo>.2/30` |
//! | host-routable VM IP | `192.168.<hi>.<lo>/32` |
//! | guest IP inside the namespace | `169.254.0.21` |
//! | tap device inside the namespace | `tap0`, `169.254.0.22/30` |
//! | guest MAC | `02:FC:00:00:00:05` |

use std::fmt;
use std::net::Ipv4Addr;

/// Name of the tap device inside every sandbox namespace.
pub const TAP_NAME: &str = "tap0";

/// Name of the namespace-side veth endpoint inside every sandbox namespace.
pub const VPEER_NAME: &str = "vpeer0";

/// Address the guest kernel is configured with in the snapshot.
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 21);

/// Address of `tap0`, the guest's gateway.
pub const TAP_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 22);

/// MAC address baked into the snapshot's network interface.
pub const GUEST_MAC: &str = "02:FC:00:00:00:05";

/// Prefix length of the point-to-point links (veth pair, tap).
pub const LINK_PREFIX: u8 = 30;

/// An IPv4 address with a prefix length, rendered as `a.b.c.d/p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    /// Interface or host address.
    pub addr: Ipv4Addr,
    /// Prefix length in bits.
    pub prefix: u8,
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

fn split(index: u16) -> (u8, u8) {
    let [hi, lo] = index.to_be_bytes();
    (hi, lo)
}

/// Network namespace name for a slot.
#[must_use]
pub fn namespace_name(index: u16) -> String {
    format!("ns-{index}")
}

/// Host-side veth device name for a slot.
#[must_use]
pub fn veth_name(index: u16) -> String {
    format!("veth{index}")
}

/// Host-side veth address (`10.<hi>.<lo>.1`).
#[must_use]
pub fn veth_ip(index: u16) -> Ipv4Addr {
    let (hi, lo) = split(index);
    Ipv4Addr::new(10, hi, lo, 1)
}

/// Namespace-side veth address (`10.<hi>.<lo>.2`).
#[must_use]
pub fn vpeer_ip(index: u16) -> Ipv4Addr {
    let (hi, lo) = split(index);
    Ipv4Addr::new(10, hi, lo, 2)
}

/// `veth_ip` with its link prefix.
#[must_use]
pub fn veth_cidr(index: u16) -> Cidr {
    Cidr {
        addr: veth_ip(index),
        prefix: LINK_PREFIX,
    }
}

/// `vpeer_ip` with its link prefix.
#[must_use]
pub fn vpeer_cidr(index: u16) -> Cidr {
    Cidr {
        addr: vpeer_ip(index),
        prefix: LINK_PREFIX,
    }
}

/// Address under which the host reaches the guest (`192.168.<hi>.<lo>`).
#[must_use]
pub fn host_vm_ip(index: u16) -> Ipv4Addr {
    let (hi, lo) = split(index);
    Ipv4Addr::new(192, 168, hi, lo)
}

/// Host route destination for the guest.
#[must_use]
pub fn host_vm_cidr(index: u16) -> Cidr {
    Cidr {
        addr: host_vm_ip(index),
        prefix: 32,
    }
}

/// `tap0` address with its link prefix.
#[must_use]
pub fn tap_cidr() -> Cidr {
    Cidr {
        addr: TAP_IP,
        prefix: LINK_PREFIX,
    }
}

/// All derived values for one slot, computed at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAddresses {
    pub namespace: String,
    pub veth: String,
    pub veth_cidr: Cidr,
    pub vpeer_cidr: Cidr,
    pub host_vm_ip: Ipv4Addr,
}

/// Compute every derived name and address for `index`.
#[must_use]
pub fn addresses(index: u16) -> SlotAddresses {
    SlotAddresses {
        namespace: namespace_name(index),
        veth: veth_name(index),
        veth_cidr: veth_cidr(index),
        vpeer_cidr: vpeer_cidr(index),
        host_vm_ip: host_vm_ip(index),
    }
}
