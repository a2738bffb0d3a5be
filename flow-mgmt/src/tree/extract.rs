// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Derivation of the keys a flow depends on, from its current forwarding state

use std::net::IpAddr;
use tracing::warn;

use crate::flow::{FlowEntry, FlowFlags, OperDb, RouteRef};
use crate::key::{
    BgpAsAServiceKey, BridgeRouteKey, FlowMgmtKey, FlowMgmtKeyNode, FlowMgmtKeyTree, InetRouteKey,
    Mac, VrfId,
};

fn insert(keys: &mut FlowMgmtKeyTree, key: FlowMgmtKey) {
    keys.entry(key).or_default();
}

fn acl_keys(flow: &FlowEntry, keys: &mut FlowMgmtKeyTree) {
    // the same ACL may be matched through several policies
    for m in &flow.acls {
        let node = keys
            .entry(FlowMgmtKey::Acl(m.acl))
            .or_insert_with(FlowMgmtKeyNode::default);
        for ace in &m.ace_ids {
            if !node.ace_ids.contains(ace) {
                node.ace_ids.push(*ace);
            }
        }
    }
}

fn object_keys(flow: &FlowEntry, keys: &mut FlowMgmtKeyTree) {
    if let Some(intf) = flow.interface {
        insert(keys, FlowMgmtKey::Interface(intf));
    }
    if let Some(vn) = flow.vn {
        insert(keys, FlowMgmtKey::Vn(vn));
    }
    for vm in [flow.in_vm, flow.out_vm].into_iter().flatten() {
        insert(keys, FlowMgmtKey::Vm(vm));
    }
    if let Some(nh) = flow.rpf_nh {
        insert(keys, FlowMgmtKey::Nh(nh));
    }
}

fn inet_route_key(
    flow: &FlowEntry,
    db: &dyn OperDb,
    keys: &mut FlowMgmtKeyTree,
    vrf: VrfId,
    addr: IpAddr,
    plen: u8,
) {
    // VRFs are never renewed: ignore deleted ones
    if !db.vrf_exists(vrf) {
        return;
    }
    let key = if flow.is_l3() {
        InetRouteKey::new(vrf, addr, plen)
    } else {
        let Some((route, route_plen)) = db.uc_route(vrf, addr) else {
            return;
        };
        InetRouteKey::new(vrf, route, route_plen)
    };
    match key {
        Ok(key) => insert(keys, FlowMgmtKey::InetRoute(key)),
        Err(e) => warn!("Ignoring route of {}: {e}", flow.id),
    }
}

fn inet_route_keys(flow: &FlowEntry, db: &dyn OperDb, keys: &mut FlowMgmtKeyTree) {
    let (src, dst) = (flow.key.src, flow.key.dst);
    let routes = &flow.routes;
    let mut add = |r: Option<RouteRef>, addr: IpAddr| {
        if let Some(r) = r {
            inet_route_key(flow, db, keys, r.vrf, addr, r.plen);
        }
    };

    // l2 flows only track the inet route used for rpf
    if !flow.is_l3() {
        add(routes.rpf, src);
        return;
    }

    add(routes.source, src);
    if let Some(vrf) = routes.acl_assigned_vrf {
        let plen = |r: Option<RouteRef>| r.map_or(0, |r| r.plen);
        add(Some(RouteRef { vrf, plen: plen(routes.source) }), src);
        add(Some(RouteRef { vrf, plen: plen(routes.dest) }), dst);
    }
    for (vrf, plen) in &routes.source_plen_map {
        add(Some(RouteRef { vrf: *vrf, plen: *plen }), src);
    }
    add(routes.dest, dst);
    for (vrf, plen) in &routes.dest_plen_map {
        add(Some(RouteRef { vrf: *vrf, plen: *plen }), dst);
    }
    add(routes.src_policy, src);
    add(routes.dst_policy, dst);
}

fn bridge_route_keys(flow: &FlowEntry, db: &dyn OperDb, keys: &mut FlowMgmtKeyTree) {
    if flow.is_l3() {
        return;
    }
    let sides: [(Option<RouteRef>, Mac); 2] = [
        (flow.routes.source, flow.smac),
        (flow.routes.dest, flow.dmac),
    ];
    for (route, mac) in sides {
        if let Some(RouteRef { vrf, .. }) = route
            && db.vrf_exists(vrf)
        {
            insert(keys, FlowMgmtKey::BridgeRoute(BridgeRouteKey { vrf, mac }));
        }
    }
}

fn bgp_as_a_service_keys(flow: &FlowEntry, db: &dyn OperDb, keys: &mut FlowMgmtKeyTree) {
    if !flow.flags.contains(FlowFlags::BGP_ROUTER_SERVICE) || flow.bgp_as_a_service_sport == 0 {
        return;
    }
    let Some(vmi) = flow.vmi_uuid else {
        return;
    };
    // the control node is the peer of the session: the source of the reverse flow
    let peer = if flow.is_reverse() {
        Some(flow.key.src)
    } else {
        flow.reverse.map(|r| r.src)
    };
    let Some(cn_index) = peer.and_then(|addr| db.controller_index(addr)) else {
        return;
    };
    insert(
        keys,
        FlowMgmtKey::BgpAsAService(BgpAsAServiceKey {
            vmi,
            sport: flow.bgp_as_a_service_sport,
            cn_index,
        }),
    );
}

/// The complete set of keys `flow` depends on
#[must_use]
pub fn extract_keys(flow: &FlowEntry, db: &dyn OperDb) -> FlowMgmtKeyTree {
    let mut keys = FlowMgmtKeyTree::new();
    acl_keys(flow, &mut keys);
    object_keys(flow, &mut keys);
    inet_route_keys(flow, db, &mut keys);
    bridge_route_keys(flow, db, &mut keys);
    bgp_as_a_service_keys(flow, db, &mut keys);
    keys
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::flow::{FlowId, FlowKey, MatchAcl};
    use crate::key::{AceId, AclId, InterfaceId, NhId, VmId, VnId};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    /// Operational database with a fixed set of VRFs, routes and control nodes
    #[derive(Default)]
    pub(crate) struct TestDb {
        pub(crate) vrfs: BTreeSet<VrfId>,
        pub(crate) routes: Vec<(VrfId, IpAddr, u8)>,
        pub(crate) controllers: Vec<IpAddr>,
    }

    impl TestDb {
        pub(crate) fn with_vrfs(vrfs: &[VrfId]) -> Self {
            Self {
                vrfs: vrfs.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    impl OperDb for TestDb {
        fn vrf_exists(&self, vrf: VrfId) -> bool {
            self.vrfs.contains(&vrf)
        }
        fn uc_route(&self, vrf: VrfId, addr: IpAddr) -> Option<(IpAddr, u8)> {
            self.routes
                .iter()
                .filter(|(v, prefix, plen)| {
                    *v == vrf
                        && InetRouteKey::new(vrf, addr, *plen)
                            .is_ok_and(|k| k.addr() == *prefix)
                })
                .max_by_key(|(_, _, plen)| *plen)
                .map(|(_, prefix, plen)| (*prefix, *plen))
        }
        fn controller_index(&self, addr: IpAddr) -> Option<u8> {
            self.controllers
                .iter()
                .position(|a| *a == addr)
                .and_then(|i| u8::try_from(i).ok())
        }
    }

    fn l3_flow() -> FlowEntry {
        let key = FlowKey {
            src: "10.1.1.1".parse().unwrap(),
            dst: "10.2.2.2".parse().unwrap(),
            proto: 6,
            sport: 1000,
            dport: 80,
            ..Default::default()
        };
        let mut flow = FlowEntry::new(FlowId(1), key);
        flow.routes.source = Some(RouteRef { vrf: 1, plen: 24 });
        flow.routes.dest = Some(RouteRef { vrf: 2, plen: 16 });
        flow
    }

    fn route(vrf: VrfId, addr: &str, plen: u8) -> FlowMgmtKey {
        FlowMgmtKey::InetRoute(InetRouteKey::new(vrf, addr.parse().unwrap(), plen).unwrap())
    }

    #[test]
    fn test_l3_flow_keys() {
        let db = TestDb::with_vrfs(&[1, 2]);
        let mut flow = l3_flow();
        flow.interface = Some(InterfaceId(3));
        flow.vn = Some(VnId(4));
        flow.in_vm = Some(VmId(5));
        flow.out_vm = Some(VmId(5));
        flow.rpf_nh = Some(NhId(6));

        let keys = extract_keys(&flow, &db);
        let expected: Vec<FlowMgmtKey> = vec![
            FlowMgmtKey::Interface(InterfaceId(3)),
            FlowMgmtKey::Vn(VnId(4)),
            FlowMgmtKey::Vm(VmId(5)),
            route(1, "10.1.1.0", 24),
            route(2, "10.2.0.0", 16),
            FlowMgmtKey::Nh(NhId(6)),
        ];
        pretty_assertions::assert_eq!(keys.keys().copied().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_deleted_vrf_is_skipped() {
        let db = TestDb::with_vrfs(&[2]);
        let keys = extract_keys(&l3_flow(), &db);
        assert_eq!(keys.len(), 1);
        assert!(keys.contains_key(&route(2, "10.2.0.0", 16)));
    }

    #[test]
    fn test_acl_aces_are_merged() {
        let db = TestDb::default();
        let mut flow = l3_flow();
        flow.acls = vec![
            MatchAcl {
                acl: AclId(1),
                ace_ids: vec![AceId(1), AceId(2)],
            },
            MatchAcl {
                acl: AclId(1),
                ace_ids: vec![AceId(2), AceId(3)],
            },
        ];
        let keys = extract_keys(&flow, &db);
        assert_eq!(
            keys.get(&FlowMgmtKey::Acl(AclId(1))).map(|n| n.ace_ids.clone()),
            Some(vec![AceId(1), AceId(2), AceId(3)])
        );
    }

    #[test]
    fn test_l2_flow_keys() {
        let mut db = TestDb::with_vrfs(&[1, 2]);
        db.routes.push((1, "10.1.0.0".parse().unwrap(), 16));
        let mut flow = l3_flow();
        flow.flags = FlowFlags::empty();
        flow.smac = Mac([0, 0, 0, 0, 0, 1]);
        flow.dmac = Mac([0, 0, 0, 0, 0, 2]);
        flow.routes.rpf = Some(RouteRef { vrf: 1, plen: 32 });

        let keys = extract_keys(&flow, &db);
        let expected: Vec<FlowMgmtKey> = vec![
            route(1, "10.1.0.0", 16),
            FlowMgmtKey::BridgeRoute(BridgeRouteKey {
                vrf: 1,
                mac: flow.smac,
            }),
            FlowMgmtKey::BridgeRoute(BridgeRouteKey {
                vrf: 2,
                mac: flow.dmac,
            }),
        ];
        pretty_assertions::assert_eq!(keys.keys().copied().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_bgp_as_a_service_key() {
        let mut db = TestDb::with_vrfs(&[]);
        let cn: IpAddr = "192.0.2.1".parse().unwrap();
        db.controllers = vec!["192.0.2.9".parse().unwrap(), cn];
        let vmi = Uuid::new_v4();

        let mut flow = l3_flow();
        flow.flags |= FlowFlags::BGP_ROUTER_SERVICE;
        flow.vmi_uuid = Some(vmi);
        flow.bgp_as_a_service_sport = 179;
        // no reverse flow, no control node
        assert!(extract_keys(&flow, &db).is_empty());

        flow.reverse = Some(FlowKey {
            src: cn,
            ..Default::default()
        });
        let keys = extract_keys(&flow, &db);
        assert!(keys.contains_key(&FlowMgmtKey::BgpAsAService(BgpAsAServiceKey {
            vmi,
            sport: 179,
            cn_index: 1
        })));
    }
}
