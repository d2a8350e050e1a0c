//! LPM (Longest Prefix Match) table over IPv4 and IPv6 prefixes.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use prefix_trie::PrefixMap;
use std::net::IpAddr;

/// A single LPM table supporting both address families.
#[derive(Clone)]
pub struct LpmTable<T> {
    ipv4: PrefixMap<Ipv4Net, T>,
    ipv6: PrefixMap<Ipv6Net, T>,
}

impl<T> LpmTable<T> {
    pub fn new() -> Self {
        LpmTable {
            ipv4: PrefixMap::new(),
            ipv6: PrefixMap::new(),
        }
    }

    /// Insert a prefix, returning the value it replaced.
    pub fn insert(&mut self, prefix: IpNet, value: T) -> Option<T> {
        match prefix.trunc() {
            IpNet::V4(p) => self.ipv4.insert(p, value),
            IpNet::V6(p) => self.ipv6.insert(p, value),
        }
    }

    /// Remove an exact prefix.
    pub fn remove(&mut self, prefix: &IpNet) -> Option<T> {
        match prefix.trunc() {
            IpNet::V4(p) => self.ipv4.remove(&p),
            IpNet::V6(p) => self.ipv6.remove(&p),
        }
    }

    /// Exact prefix lookup.
    pub fn get(&self, prefix: &IpNet) -> Option<&T> {
        match prefix.trunc() {
            IpNet::V4(p) => self.ipv4.get(&p),
            IpNet::V6(p) => self.ipv6.get(&p),
        }
    }

    /// Longest matching prefix for `addr` and its value.
    pub fn lookup(&self, addr: IpAddr) -> Option<(IpNet, &T)> {
        match addr {
            IpAddr::V4(a) => {
                let prefix = Ipv4Net::new(a, 32).ok()?;
                self.ipv4
                    .get_lpm(&prefix)
                    .map(|(p, v)| (IpNet::V4(*p), v))
            }
            IpAddr::V6(a) => {
                let prefix = Ipv6Net::new(a, 128).ok()?;
                self.ipv6
                    .get_lpm(&prefix)
                    .map(|(p, v)| (IpNet::V6(*p), v))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ipv4.iter().count() + self.ipv6.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for LpmTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_lookup_longest_match() {
        let mut t = LpmTable::new();
        t.insert(net("0.0.0.0/0"), "default");
        t.insert(net("10.0.0.0/8"), "ten");
        t.insert(net("10.1.0.0/16"), "ten-one");
        t.insert(net("10.1.2.0/24"), "ten-one-two");
        t.insert(net("192.168.0.0/16"), "private");

        assert_eq!(t.lookup(ip("10.1.2.3")).unwrap().1, &"ten-one-two");
        assert_eq!(t.lookup(ip("10.1.3.3")).unwrap().1, &"ten-one");
        assert_eq!(t.lookup(ip("10.2.0.1")).unwrap().1, &"ten");
        assert_eq!(t.lookup(ip("192.168.7.7")).unwrap().0, net("192.168.0.0/16"));
        assert_eq!(t.lookup(ip("8.8.8.8")).unwrap().1, &"default");
    }

    #[test]
    fn test_remove_falls_back() {
        let mut t = LpmTable::new();
        t.insert(net("10.0.0.0/8"), 1);
        t.insert(net("10.0.0.0/24"), 2);
        assert_eq!(t.lookup(ip("10.0.0.5")).unwrap().1, &2);

        assert_eq!(t.remove(&net("10.0.0.0/24")), Some(2));
        assert_eq!(t.lookup(ip("10.0.0.5")).unwrap().1, &1);
        assert_eq!(t.remove(&net("10.0.0.0/24")), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_host_bits_truncated() {
        let mut t = LpmTable::new();
        t.insert(net("172.16.5.9/16"), ());
        assert!(t.get(&net("172.16.0.0/16")).is_some());
    }

    #[test]
    fn test_ipv6() {
        let mut t = LpmTable::new();
        t.insert(net("2001:db8::/32"), "doc");
        t.insert(net("2001:db8:1::/48"), "doc-1");
        assert_eq!(t.lookup(ip("2001:db8:1::1")).unwrap().1, &"doc-1");
        assert_eq!(t.lookup(ip("2001:db8:2::1")).unwrap().1, &"doc");
        assert!(t.lookup(ip("10.0.0.1")).is_none());
    }
}
