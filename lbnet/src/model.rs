//! Shared value types: MAC addresses and the flag sets used by the tables.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::BitOr;
use std::str::FromStr;
use thiserror::Error;

/// The unspecified address of the same family as `like`.
pub fn unspecified(like: IpAddr) -> IpAddr {
    match like {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        MacAddr(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid MAC address: {0}")]
pub struct MacParseError(String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for b in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| MacParseError(s.to_string()))?;
            if part.len() != 2 {
                return Err(MacParseError(s.to_string()));
            }
            *b = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacParseError(s.to_string()));
        }
        Ok(MacAddr(bytes))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! bit_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$cmeta:meta])* $flag:ident = $val:expr,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            $($(#[$cmeta])* pub const $flag: $name = $name($val);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// All bits of `other` are set.
            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            /// Any bit of `other` is set.
            pub fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut first = true;
                $(
                    if self.0 & $val != 0 {
                        if !first {
                            f.write_str("|")?;
                        }
                        f.write_str(stringify!($flag))?;
                        first = false;
                    }
                )*
                if first {
                    f.write_str("-")?;
                }
                Ok(())
            }
        }
    };
}

bit_set! {
    /// Roles a port can play. A port may combine several roles, e.g. a
    /// physical port that is also an untagged VLAN member is `REAL | VLAN_SIF`.
    PortKind {
        REAL = 0x1,
        BOND_SIF = 0x2,
        BOND = 0x4,
        VLAN_SIF = 0x8,
        VLAN_BR = 0x10,
        VXLAN_SIF = 0x20,
        VXLAN_BR = 0x40,
        WG = 0x80,
        VTI = 0x100,
    }
}

impl PortKind {
    /// Ports that own a forwarding attachment of their own.
    pub fn is_leaf(self) -> bool {
        self.intersects(PortKind::REAL | PortKind::BOND | PortKind::VTI | PortKind::WG)
    }

    /// Ports that are a member of some other port.
    pub fn is_slave(self) -> bool {
        self.intersects(PortKind::VLAN_SIF | PortKind::BOND_SIF)
    }

    /// Layer 3 tunnel devices without a MAC of their own.
    pub fn is_l3_tunnel(self) -> bool {
        self.intersects(PortKind::VTI | PortKind::WG)
    }
}

bit_set! {
    /// Port properties pushed to the forwarding engine.
    PortProp {
        UPP = 0x1,
        SPAN = 0x2,
        POL = 0x4,
    }
}

/// Tunnel encapsulations understood by the forwarding engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Vxlan = 1,
    Gre = 2,
    Gtp = 3,
    Stt = 4,
    IpIp = 5,
}

bit_set! {
    /// Route type flags.
    RtFlags {
        IND = 0x1,
        DYN = 0x2,
        SELF = 0x4,
        HOST = 0x8,
        INTF = 0x10,
    }
}

bit_set! {
    NhType {
        NORMAL = 0x1,
        TUN = 0x2,
        /// Next hop supplied by a tunnel endpoint further down the chain.
        RECURSIVE = 0x4,
    }
}

/// Object a mirror or policer is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum AttachPoint {
    Port(String),
    /// A load-balancer rule, by name.
    Rule(String),
}

impl AttachPoint {
    pub fn port(&self) -> Option<&str> {
        match self {
            AttachPoint::Port(p) => Some(p),
            AttachPoint::Rule(_) => None,
        }
    }
}

impl fmt::Display for AttachPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachPoint::Port(p) => write!(f, "port:{p}"),
            AttachPoint::Rule(r) => write!(f, "rule:{r}"),
        }
    }
}
