// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Longest prefix match over the inet routes known to flow management, per VRF.

use hashbrown::HashMap;
use ipnet::{Ipv4Net, Ipv6Net};
use prefix_trie::PrefixMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::key::{InetRouteKey, VrfId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct V4Prefix(Ipv4Net);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct V6Prefix(Ipv6Net);

impl prefix_trie::Prefix for V4Prefix {
    type R = u32;

    fn repr(&self) -> u32 {
        self.0.network().to_bits()
    }

    fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    fn from_repr_len(repr: u32, len: u8) -> Self {
        let net = Ipv4Net::new(Ipv4Addr::from_bits(repr), len)
            .unwrap_or_else(|_| panic!("Invalid prefix in from_repr_len: {repr:#x}/{len}"));
        V4Prefix(net.trunc())
    }
}

impl prefix_trie::Prefix for V6Prefix {
    type R = u128;

    fn repr(&self) -> u128 {
        self.0.network().to_bits()
    }

    fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    fn from_repr_len(repr: u128, len: u8) -> Self {
        let net = Ipv6Net::new(Ipv6Addr::from_bits(repr), len)
            .unwrap_or_else(|_| panic!("Invalid prefix in from_repr_len: {repr:#x}/{len}"));
        V6Prefix(net.trunc())
    }
}

/// Prefix index of the routes that saw a database add, per VRF
#[derive(Default)]
pub(crate) struct RouteLpm {
    v4: HashMap<VrfId, PrefixMap<V4Prefix, ()>>,
    v6: HashMap<VrfId, PrefixMap<V6Prefix, ()>>,
}

impl RouteLpm {
    pub(crate) fn insert(&mut self, key: &InetRouteKey) {
        match key.addr() {
            IpAddr::V4(a) => {
                if let Ok(net) = Ipv4Net::new(a, key.plen()) {
                    self.v4
                        .entry(key.vrf())
                        .or_insert_with(PrefixMap::new)
                        .insert(V4Prefix(net), ());
                }
            }
            IpAddr::V6(a) => {
                if let Ok(net) = Ipv6Net::new(a, key.plen()) {
                    self.v6
                        .entry(key.vrf())
                        .or_insert_with(PrefixMap::new)
                        .insert(V6Prefix(net), ());
                }
            }
        }
    }

    pub(crate) fn remove(&mut self, key: &InetRouteKey) {
        let vrf = key.vrf();
        match key.addr() {
            IpAddr::V4(a) => {
                if let (Some(map), Ok(net)) = (self.v4.get_mut(&vrf), Ipv4Net::new(a, key.plen())) {
                    map.remove(&V4Prefix(net));
                    if map.iter().next().is_none() {
                        self.v4.remove(&vrf);
                    }
                }
            }
            IpAddr::V6(a) => {
                if let (Some(map), Ok(net)) = (self.v6.get_mut(&vrf), Ipv6Net::new(a, key.plen())) {
                    map.remove(&V6Prefix(net));
                    if map.iter().next().is_none() {
                        self.v6.remove(&vrf);
                    }
                }
            }
        }
    }

    /// Longest prefix in the index covering `key` (the key itself included)
    pub(crate) fn lpm(&self, key: &InetRouteKey) -> Option<InetRouteKey> {
        let vrf = key.vrf();
        let (addr, plen) = match key.addr() {
            IpAddr::V4(a) => {
                let net = Ipv4Net::new(a, key.plen()).ok()?;
                let (found, _) = self.v4.get(&vrf)?.get_lpm(&V4Prefix(net))?;
                (IpAddr::V4(found.0.network()), found.0.prefix_len())
            }
            IpAddr::V6(a) => {
                let net = Ipv6Net::new(a, key.plen()).ok()?;
                let (found, _) = self.v6.get(&vrf)?.get_lpm(&V6Prefix(net))?;
                (IpAddr::V6(found.0.network()), found.0.prefix_len())
            }
        };
        InetRouteKey::new(vrf, addr, plen).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(vrf: VrfId, addr: &str, plen: u8) -> InetRouteKey {
        InetRouteKey::new(vrf, addr.parse().unwrap(), plen).unwrap()
    }

    #[test]
    fn test_lpm_v4() {
        let mut lpm = RouteLpm::default();
        lpm.insert(&key(1, "10.0.0.0", 8));
        lpm.insert(&key(1, "10.1.0.0", 16));
        lpm.insert(&key(2, "0.0.0.0", 0));

        assert_eq!(lpm.lpm(&key(1, "10.1.2.0", 24)), Some(key(1, "10.1.0.0", 16)));
        assert_eq!(lpm.lpm(&key(1, "10.2.0.0", 16)), Some(key(1, "10.0.0.0", 8)));
        assert_eq!(lpm.lpm(&key(1, "11.0.0.0", 8)), None);
        assert_eq!(lpm.lpm(&key(2, "11.0.0.0", 8)), Some(key(2, "0.0.0.0", 0)));

        lpm.remove(&key(1, "10.1.0.0", 16));
        assert_eq!(lpm.lpm(&key(1, "10.1.2.0", 24)), Some(key(1, "10.0.0.0", 8)));
    }

    #[test]
    fn test_lpm_matches_linear_search() {
        bolero::check!()
            .with_type::<(Vec<(u32, u8)>, u32, u8)>()
            .for_each(|(routes, addr, plen)| {
                let mut lpm = RouteLpm::default();
                let mut known = vec![];
                for (a, l) in routes {
                    let k = key(1, &Ipv4Addr::from_bits(*a).to_string(), l % 33);
                    lpm.insert(&k);
                    known.push(k);
                }
                let query = key(1, &Ipv4Addr::from_bits(*addr).to_string(), plen % 33);
                let expected = known
                    .iter()
                    .filter(|k| {
                        k.plen() <= query.plen()
                            && InetRouteKey::new(1, query.addr(), k.plen())
                                .is_ok_and(|q| q.addr() == k.addr())
                    })
                    .max_by_key(|k| k.plen())
                    .copied();
                assert_eq!(lpm.lpm(&query), expected);
            });
    }

    #[test]
    fn test_lpm_v6() {
        let mut lpm = RouteLpm::default();
        lpm.insert(&key(1, "2001:db8::", 32));
        assert_eq!(
            lpm.lpm(&key(1, "2001:db8:1::", 48)),
            Some(key(1, "2001:db8::", 32))
        );
        assert_eq!(lpm.lpm(&key(1, "2001:db9::", 32)), None);
        assert_eq!(lpm.lpm(&key(1, "10.0.0.0", 8)), None);
    }
}
