// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow management proper: the per-flow dependency sets, the per-object trees,
//! and the processing of requests against them.

use hashbrown::HashMap;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::entry::{FlowMgmtEntry, InterfaceFlowCounters, VnFlowCounters};
use crate::errors::FlowMgmtError;
use crate::event::FlowEvent;
use crate::flow::{FlowEntry, FlowId, OperDb};
use crate::key::{
    AceId, AclId, BgpAsAServiceKey, FlowMgmtKey, FlowMgmtKeyNode, FlowMgmtKeyTree, InterfaceId,
    VnId, VrfId,
};
use crate::request::{DbOperation, FlowMgmtRequest, RouteTableType};
use crate::tree::FlowMgmtTree;
use crate::tree::extract::extract_keys;
use crate::tree::route::{BridgeRouteFlowMgmtTree, InetRouteFlowMgmtTree};
use crate::tree::vrf::VrfFlowMgmtTree;

/// What flow management remembers of a flow
#[derive(Debug, Default)]
struct FlowEntryInfo {
    keys: FlowMgmtKeyTree,
    // number of add requests seen for the flow
    count: u64,
    local_flow: bool,
    ingress: bool,
}

/// Flow counts of an interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceFlowCount {
    pub active: usize,
    pub created: u64,
    pub aged: u64,
}

pub struct FlowMgmtManager {
    db: Arc<dyn OperDb>,
    acl_tree: FlowMgmtTree,
    interface_tree: FlowMgmtTree,
    vn_tree: FlowMgmtTree,
    vm_tree: FlowMgmtTree,
    nh_tree: FlowMgmtTree,
    inet4_tree: InetRouteFlowMgmtTree,
    inet6_tree: InetRouteFlowMgmtTree,
    bridge_tree: BridgeRouteFlowMgmtTree,
    vrf_tree: VrfFlowMgmtTree,
    bgp_as_a_service_tree: FlowMgmtTree,
    flow_tree: HashMap<FlowId, FlowEntryInfo>,
    events: Vec<FlowEvent>,
}

impl FlowMgmtManager {
    #[must_use]
    pub fn new(db: Arc<dyn OperDb>) -> Self {
        Self {
            db,
            acl_tree: FlowMgmtTree::new("acl"),
            interface_tree: FlowMgmtTree::new("interface"),
            vn_tree: FlowMgmtTree::new("vn"),
            vm_tree: FlowMgmtTree::new("vm"),
            nh_tree: FlowMgmtTree::new("nh"),
            inet4_tree: InetRouteFlowMgmtTree::new(true),
            inet6_tree: InetRouteFlowMgmtTree::new(false),
            bridge_tree: BridgeRouteFlowMgmtTree::default(),
            vrf_tree: VrfFlowMgmtTree::default(),
            bgp_as_a_service_tree: FlowMgmtTree::new("bgp-as-a-service"),
            flow_tree: HashMap::new(),
            events: Vec::new(),
        }
    }

    /// Take the events produced since the last call
    pub fn take_events(&mut self) -> Vec<FlowEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn process(&mut self, req: FlowMgmtRequest) {
        trace!("Processing {req:?}");
        match req {
            FlowMgmtRequest::AddFlow(flow) => self.add_flow(&flow),
            FlowMgmtRequest::DeleteFlow(flow) => {
                if let Err(e) = self.delete_flow(flow) {
                    debug!("{e}");
                }
            }
            FlowMgmtRequest::DbEntry {
                op,
                key,
                gen_id,
                nh_changed,
            } => self.db_entry_event(op, key, gen_id, nh_changed),
            FlowMgmtRequest::RouteTableDeleted { vrf, table } => {
                self.route_table_deleted(vrf, table);
            }
            FlowMgmtRequest::RetryDeleteVrf(vrf) => self.retry_vrf_delete(vrf),
            FlowMgmtRequest::BgpAsAServiceHealthCheck { key, health_check } => {
                self.bgp_as_a_service_health_check(key, health_check);
            }
            FlowMgmtRequest::DeleteBgpAsAService(key) => self.delete_bgp_as_a_service(key),
            FlowMgmtRequest::DeleteAllBgpAsAService => self.delete_all_bgp_as_a_service(),
        }
    }

    /// Track a new flow, or the new state of a known flow
    pub fn add_flow(&mut self, flow: &FlowEntry) {
        let new_keys = extract_keys(flow, self.db.as_ref());
        let mut info = self.flow_tree.remove(&flow.id).unwrap_or_default();
        info.count += 1;
        let old_keys = std::mem::take(&mut info.keys);

        // both key sets are ordered: walk them together
        let mut old_it = old_keys.into_iter().peekable();
        let mut new_it = new_keys.into_iter().peekable();
        loop {
            let order = match (new_it.peek(), old_it.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((new, _)), Some((old, _))) => new.cmp(old),
            };
            match order {
                Ordering::Less => {
                    if let Some((key, node)) = new_it.next() {
                        self.add_flow_mgmt_key(flow, &info, &key, &node, None);
                        info.keys.insert(key, node);
                    }
                }
                Ordering::Greater => {
                    if let Some((key, node)) = old_it.next() {
                        self.delete_flow_mgmt_key(flow.id, &info, &key, &node);
                    }
                }
                Ordering::Equal => {
                    if let (Some((key, node)), Some((_, old_node))) = (new_it.next(), old_it.next())
                    {
                        self.add_flow_mgmt_key(flow, &info, &key, &node, Some(&old_node));
                        info.keys.insert(key, node);
                    }
                }
            }
        }

        info.local_flow = flow.is_local();
        info.ingress = flow.is_ingress();
        self.flow_tree.insert(flow.id, info);
    }

    /// Forget a flow and release every object it depended on.
    ///
    /// # Errors
    /// Fails if the flow is unknown. The flow reference is released anyway.
    pub fn delete_flow(&mut self, flow: FlowId) -> Result<(), FlowMgmtError> {
        let info = self.flow_tree.remove(&flow);
        if let Some(info) = &info {
            for (key, node) in &info.keys {
                self.delete_flow_mgmt_key(flow, info, key, node);
            }
        }
        self.events.push(FlowEvent::FreeFlowRef { flow });
        info.map(|_| ()).ok_or(FlowMgmtError::UnknownFlow(flow))
    }

    fn generic_tree(&mut self, key: &FlowMgmtKey) -> Option<&mut FlowMgmtTree> {
        match key {
            FlowMgmtKey::Acl(_) => Some(&mut self.acl_tree),
            FlowMgmtKey::Interface(_) => Some(&mut self.interface_tree),
            FlowMgmtKey::Vn(_) => Some(&mut self.vn_tree),
            FlowMgmtKey::Vm(_) => Some(&mut self.vm_tree),
            FlowMgmtKey::Nh(_) => Some(&mut self.nh_tree),
            FlowMgmtKey::BgpAsAService(_) => Some(&mut self.bgp_as_a_service_tree),
            FlowMgmtKey::BridgeRoute(_) => Some(self.bridge_tree.tree_mut()),
            FlowMgmtKey::InetRoute(_) | FlowMgmtKey::Vrf(_) => None,
        }
    }

    fn inet_tree(&mut self, ipv4: bool) -> &mut InetRouteFlowMgmtTree {
        if ipv4 {
            &mut self.inet4_tree
        } else {
            &mut self.inet6_tree
        }
    }

    fn add_flow_mgmt_key(
        &mut self,
        flow: &FlowEntry,
        info: &FlowEntryInfo,
        key: &FlowMgmtKey,
        node: &FlowMgmtKeyNode,
        old: Option<&FlowMgmtKeyNode>,
    ) {
        if let FlowMgmtKey::InetRoute(route) = key {
            self.inet_tree(route.is_ipv4()).add(route, flow.id);
            return;
        }
        let Some(tree) = self.generic_tree(key) else {
            warn!("{key} cannot be a flow dependency");
            return;
        };
        let entry = tree.locate(key);
        let new_flow = entry.add(flow.id);
        match key {
            FlowMgmtKey::Acl(_) => {
                let old_aces = if new_flow {
                    None
                } else {
                    old.map(|o| o.ace_ids.as_slice())
                };
                entry.update_ace_flows(&node.ace_ids, old_aces);
            }
            FlowMgmtKey::Vn(_) => {
                let old_flags = (!new_flow).then_some((info.local_flow, info.ingress));
                entry.vn_add_flow(flow.is_local(), flow.is_ingress(), old_flags);
            }
            _ => {}
        }
    }

    fn delete_flow_mgmt_key(
        &mut self,
        flow: FlowId,
        info: &FlowEntryInfo,
        key: &FlowMgmtKey,
        node: &FlowMgmtKeyNode,
    ) {
        let mut events = std::mem::take(&mut self.events);
        match key {
            FlowMgmtKey::InetRoute(route) => {
                self.inet_tree(route.is_ipv4()).delete(route, flow, &mut events);
            }
            _ => {
                if let Some(tree) = self.generic_tree(key) {
                    if let Some(entry) = tree.find_mut(key) {
                        match key {
                            FlowMgmtKey::Acl(_) => entry.remove_ace_flows(&node.ace_ids),
                            FlowMgmtKey::Vn(_) if entry.contains(flow) => {
                                entry.vn_delete_flow(info.local_flow, info.ingress);
                            }
                            _ => {}
                        }
                    }
                    tree.delete(key, flow, &mut events);
                }
            }
        }
        self.events = events;
        if let Some(vrf) = key.route_vrf() {
            self.retry_vrf_delete(vrf);
        }
    }

    fn db_entry_event(&mut self, op: DbOperation, key: FlowMgmtKey, gen_id: u32, nh_changed: bool) {
        debug!("Database {op} of {key} (gen {gen_id})");
        let mut events = std::mem::take(&mut self.events);
        match (key, op) {
            (FlowMgmtKey::InetRoute(route), DbOperation::Delete | DbOperation::Implicit) => {
                self.inet_tree(route.is_ipv4())
                    .oper_entry_delete(op, &route, gen_id, &mut events);
            }
            (FlowMgmtKey::InetRoute(route), _) => {
                self.inet_tree(route.is_ipv4())
                    .oper_entry_add(op, &route, gen_id, nh_changed, &mut events);
            }
            (FlowMgmtKey::Vrf(vrf), DbOperation::Delete | DbOperation::Implicit) => {
                self.events = events;
                self.delete_vrf(vrf, gen_id);
                return;
            }
            (FlowMgmtKey::Vrf(vrf), _) => self.vrf_tree.oper_entry_add(vrf, gen_id, &mut events),
            (key, DbOperation::Delete | DbOperation::Implicit) => {
                if let Some(tree) = self.generic_tree(&key) {
                    tree.oper_entry_delete(op, &key, gen_id, true, &mut events);
                }
            }
            (key, DbOperation::Add) => {
                if let Some(tree) = self.generic_tree(&key) {
                    tree.oper_entry_add(op, &key, gen_id, &mut events);
                }
            }
            (key, DbOperation::Change) => {
                if let Some(tree) = self.generic_tree(&key) {
                    tree.oper_entry_change(&key, gen_id, &mut events);
                    if nh_changed && let Some(entry) = tree.find(&key) {
                        entry.handle_nh_change(&key, &mut events);
                    }
                }
            }
        }
        self.events = events;
        if matches!(op, DbOperation::Delete | DbOperation::Implicit)
            && let Some(vrf) = key.route_vrf()
        {
            self.retry_vrf_delete(vrf);
        }
    }

    /// Database delete of a VRF. A default route only known through flows will
    /// never see a database delete: it is deleted here on behalf of the database.
    fn delete_vrf(&mut self, vrf: VrfId, gen_id: u32) {
        let mut events = std::mem::take(&mut self.events);
        self.inet4_tree.implicit_default_route_delete(vrf, &mut events);
        self.inet6_tree.implicit_default_route_delete(vrf, &mut events);
        let busy = self.has_vrf_flows(vrf);
        self.vrf_tree.oper_entry_delete(vrf, gen_id, busy, &mut events);
        self.events = events;
    }

    fn route_table_deleted(&mut self, vrf: VrfId, table: RouteTableType) {
        if self.vrf_tree.route_table_deleted(vrf, table) {
            self.retry_vrf_delete(vrf);
        }
    }

    /// Release a deleted VRF if no flow refers to it any more
    pub fn retry_vrf_delete(&mut self, vrf: VrfId) {
        let busy = self.has_vrf_flows(vrf);
        let mut events = std::mem::take(&mut self.events);
        if self.vrf_tree.retry_delete(vrf, busy, &mut events) {
            debug!("Vrf {vrf} released");
        }
        self.events = events;
    }

    /// Whether a route entry of the VRF is still held by flows or by the database
    #[must_use]
    pub fn has_vrf_flows(&self, vrf: VrfId) -> bool {
        self.inet4_tree.has_vrf_flows(vrf)
            || self.inet6_tree.has_vrf_flows(vrf)
            || self.bridge_tree.has_vrf_flows(vrf)
    }

    fn bgp_as_a_service_health_check(
        &mut self,
        key: BgpAsAServiceKey,
        health_check: Option<uuid::Uuid>,
    ) {
        let mkey = FlowMgmtKey::BgpAsAService(key);
        if let Some(entry) = self.bgp_as_a_service_tree.find_mut(&mkey) {
            entry.set_health_check(health_check);
            entry.revaluate_all(&mkey, &mut self.events);
        }
    }

    fn delete_bgp_as_a_service(&mut self, key: BgpAsAServiceKey) {
        let mkey = FlowMgmtKey::BgpAsAService(key);
        self.bgp_as_a_service_tree
            .non_oper_entry_delete(&mkey, &mut self.events);
    }

    fn delete_all_bgp_as_a_service(&mut self) {
        let notifications = self
            .bgp_as_a_service_tree
            .keys()
            .filter_map(|k| match k {
                FlowMgmtKey::BgpAsAService(k) => Some(FlowEvent::BgpAsAServiceNotify {
                    vmi: k.vmi,
                    sport: k.sport,
                }),
                _ => None,
            })
            .collect::<Vec<_>>();
        self.events.extend(notifications);
    }

    /// Entry of any kind of key
    #[must_use]
    pub fn entry(&self, key: &FlowMgmtKey) -> Option<&FlowMgmtEntry> {
        match key {
            FlowMgmtKey::Acl(_) => self.acl_tree.find(key),
            FlowMgmtKey::Interface(_) => self.interface_tree.find(key),
            FlowMgmtKey::Vn(_) => self.vn_tree.find(key),
            FlowMgmtKey::Vm(_) => self.vm_tree.find(key),
            FlowMgmtKey::Nh(_) => self.nh_tree.find(key),
            FlowMgmtKey::InetRoute(route) if route.is_ipv4() => self.inet4_tree.tree().find(key),
            FlowMgmtKey::InetRoute(_) => self.inet6_tree.tree().find(key),
            FlowMgmtKey::BridgeRoute(_) => self.bridge_tree.tree().find(key),
            FlowMgmtKey::Vrf(vrf) => self.vrf_tree.find(*vrf),
            FlowMgmtKey::BgpAsAService(_) => self.bgp_as_a_service_tree.find(key),
        }
    }

    #[must_use]
    pub fn vn_flow_counters(&self, vn: VnId) -> VnFlowCounters {
        self.vn_tree
            .find(&FlowMgmtKey::Vn(vn))
            .and_then(FlowMgmtEntry::vn_counters)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn interface_flow_count(&self, intf: InterfaceId) -> InterfaceFlowCount {
        self.interface_tree
            .find(&FlowMgmtKey::Interface(intf))
            .map(|entry| {
                let InterfaceFlowCounters { created, aged } =
                    entry.interface_counters().unwrap_or_default();
                InterfaceFlowCount {
                    active: entry.size(),
                    created,
                    aged,
                }
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn ace_flow_count(&self, acl: AclId, ace: AceId) -> u32 {
        self.acl_tree
            .find(&FlowMgmtKey::Acl(acl))
            .map_or(0, |entry| entry.ace_flow_count(ace))
    }

    /// Keys the flow currently depends on
    #[must_use]
    pub fn flow_keys(&self, flow: FlowId) -> Option<Vec<FlowMgmtKey>> {
        self.flow_tree
            .get(&flow)
            .map(|info| info.keys.keys().copied().collect())
    }

    /// Number of add requests seen for the flow
    #[must_use]
    pub fn flow_add_count(&self, flow: FlowId) -> u64 {
        self.flow_tree.get(&flow).map_or(0, |info| info.count)
    }

    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.flow_tree.len()
    }

    #[must_use]
    pub fn inet4_tree(&self) -> &InetRouteFlowMgmtTree {
        &self.inet4_tree
    }
    #[must_use]
    pub fn inet6_tree(&self) -> &InetRouteFlowMgmtTree {
        &self.inet6_tree
    }
    #[must_use]
    pub fn vrf_tree(&self) -> &VrfFlowMgmtTree {
        &self.vrf_tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::OperState;
    use crate::event::FlowAction;
    use crate::flow::{FlowFlags, FlowKey, MatchAcl, RouteRef};
    use crate::key::InetRouteKey;
    use crate::tree::extract::tests::TestDb;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;
    use uuid::Uuid;

    fn manager(vrfs: &[VrfId]) -> FlowMgmtManager {
        FlowMgmtManager::new(Arc::new(TestDb::with_vrfs(vrfs)))
    }

    fn flow(id: u64, vrf: VrfId) -> FlowEntry {
        let key = FlowKey {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.1.1".parse().unwrap(),
            proto: 17,
            sport: 5000,
            dport: 53,
            ..Default::default()
        };
        let mut flow = FlowEntry::new(FlowId(id), key);
        flow.routes.source = Some(RouteRef { vrf, plen: 24 });
        flow
    }

    fn src_route(vrf: VrfId) -> FlowMgmtKey {
        FlowMgmtKey::InetRoute(InetRouteKey::new(vrf, "10.0.0.0".parse().unwrap(), 24).unwrap())
    }

    #[test]
    #[traced_test]
    fn test_add_change_delete_flow() {
        let mut mgr = manager(&[1]);
        let mut f = flow(1, 1);
        f.acls = vec![MatchAcl {
            acl: AclId(1),
            ace_ids: vec![AceId(1), AceId(2)],
        }];
        f.vn = Some(VnId(1));
        mgr.add_flow(&f);
        assert_eq!(
            mgr.flow_keys(FlowId(1)),
            Some(vec![
                FlowMgmtKey::Acl(AclId(1)),
                FlowMgmtKey::Vn(VnId(1)),
                src_route(1)
            ])
        );
        assert_eq!(mgr.ace_flow_count(AclId(1), AceId(1)), 1);
        assert_eq!(mgr.vn_flow_counters(VnId(1)).egress(), 1);

        // change: new ACE list, new VN, direction flipped
        f.acls[0].ace_ids = vec![AceId(2), AceId(3)];
        f.vn = Some(VnId(2));
        f.flags |= FlowFlags::INGRESS_DIR;
        mgr.add_flow(&f);
        assert_eq!(mgr.ace_flow_count(AclId(1), AceId(1)), 0);
        assert_eq!(mgr.ace_flow_count(AclId(1), AceId(2)), 1);
        assert_eq!(mgr.ace_flow_count(AclId(1), AceId(3)), 1);
        assert!(mgr.entry(&FlowMgmtKey::Vn(VnId(1))).is_none());
        assert_eq!(mgr.vn_flow_counters(VnId(2)).ingress(), 1);
        assert_eq!(mgr.flow_add_count(FlowId(1)), 2);

        mgr.delete_flow(FlowId(1)).unwrap();
        assert_eq!(mgr.flow_count(), 0);
        assert!(mgr.entry(&FlowMgmtKey::Acl(AclId(1))).is_none());
        assert!(mgr.entry(&src_route(1)).is_none());
        assert_eq!(mgr.take_events(), vec![FlowEvent::FreeFlowRef { flow: FlowId(1) }]);
        assert_eq!(mgr.delete_flow(FlowId(1)), Err(FlowMgmtError::UnknownFlow(FlowId(1))));
    }

    #[test]
    fn test_vn_direction_change_keeps_totals() {
        let mut mgr = manager(&[1]);
        let mut f = flow(1, 1);
        f.vn = Some(VnId(1));
        f.flags |= FlowFlags::INGRESS_DIR;
        mgr.add_flow(&f);
        f.flags.remove(FlowFlags::INGRESS_DIR);
        mgr.add_flow(&f);
        let counters = mgr.vn_flow_counters(VnId(1));
        assert_eq!((counters.ingress(), counters.egress()), (0, 1));

        f.flags |= FlowFlags::LOCAL_FLOW;
        mgr.add_flow(&f);
        let counters = mgr.vn_flow_counters(VnId(1));
        assert_eq!((counters.ingress(), counters.egress()), (1, 1));
    }

    #[test]
    fn test_object_delete_deletes_flows() {
        let mut mgr = manager(&[1]);
        let mut f = flow(7, 1);
        f.interface = Some(InterfaceId(2));
        mgr.add_flow(&f);
        let key = FlowMgmtKey::Interface(InterfaceId(2));
        mgr.process(FlowMgmtRequest::add(key, 0));
        mgr.take_events();
        mgr.process(FlowMgmtRequest::delete(key, 0));
        assert_eq!(
            mgr.take_events(),
            vec![FlowEvent::flow(FlowAction::Delete, FlowId(7), key)]
        );
        // the flow table deletes the flow in response
        mgr.process(FlowMgmtRequest::DeleteFlow(FlowId(7)));
        assert_eq!(
            mgr.take_events(),
            vec![
                FlowEvent::FreeDbEntry { key, gen_id: 0 },
                FlowEvent::FreeFlowRef { flow: FlowId(7) }
            ]
        );
        assert_eq!(mgr.interface_flow_count(InterfaceId(2)), InterfaceFlowCount::default());
    }

    fn interface_flow(id: u64) -> FlowMgmtRequest {
        let mut f = flow(id, 1);
        f.interface = Some(InterfaceId(4));
        FlowMgmtRequest::AddFlow(Arc::new(f))
    }

    #[test]
    fn test_flow_and_db_add_in_either_order() {
        let key = FlowMgmtKey::Interface(InterfaceId(4));
        let db_first = [FlowMgmtRequest::add(key, 1), interface_flow(1)];
        let flow_first = [interface_flow(1), FlowMgmtRequest::add(key, 1)];
        for requests in [db_first, flow_first] {
            let mut mgr = manager(&[1]);
            for req in requests {
                mgr.process(req);
            }
            let entry = mgr.entry(&key).unwrap();
            assert_eq!(entry.oper_state(), OperState::AddSeen);
            assert_eq!(entry.gen_id(), 1);
            assert!(entry.contains(FlowId(1)));
            assert_eq!(mgr.interface_flow_count(InterfaceId(4)).active, 1);
            assert_eq!(mgr.flow_keys(FlowId(1)).map(|keys| keys.contains(&key)), Some(true));
        }
    }

    #[test]
    #[traced_test]
    fn test_stale_delete_after_re_add() {
        let mut mgr = manager(&[1]);
        let key = FlowMgmtKey::Interface(InterfaceId(4));
        mgr.process(interface_flow(1));
        mgr.process(FlowMgmtRequest::add(key, 1));
        mgr.process(FlowMgmtRequest::delete(key, 1));
        assert_eq!(mgr.entry(&key).unwrap().oper_state(), OperState::DelSeen);
        mgr.process(FlowMgmtRequest::add(key, 2));
        mgr.take_events();

        // late delete of the first generation
        mgr.process(FlowMgmtRequest::delete(key, 1));
        let entry = mgr.entry(&key).unwrap();
        assert_eq!(entry.oper_state(), OperState::AddSeen);
        assert_eq!(entry.gen_id(), 2);
        assert!(entry.contains(FlowId(1)));
        assert!(mgr.take_events().is_empty());
        assert!(logs_contain("ignoring stale delete"));
    }

    #[test]
    fn test_interface_flow_count() {
        let mut mgr = manager(&[1]);
        let key = FlowMgmtKey::Interface(InterfaceId(2));
        mgr.process(FlowMgmtRequest::add(key, 0));
        for id in 1..=3 {
            let mut f = flow(id, 1);
            f.interface = Some(InterfaceId(2));
            mgr.add_flow(&f);
        }
        mgr.delete_flow(FlowId(2)).unwrap();
        assert_eq!(
            mgr.interface_flow_count(InterfaceId(2)),
            InterfaceFlowCount {
                active: 2,
                created: 3,
                aged: 1
            }
        );
    }

    #[test]
    #[traced_test]
    fn test_vrf_delete_waits_for_flows() {
        let mut mgr = manager(&[1]);
        mgr.process(FlowMgmtRequest::add(FlowMgmtKey::Vrf(1), 0));
        mgr.add_flow(&flow(1, 1));
        mgr.add_flow(&flow(2, 1));

        mgr.process(FlowMgmtRequest::delete(FlowMgmtKey::Vrf(1), 0));
        for table in [RouteTableType::Inet4, RouteTableType::Inet6, RouteTableType::Bridge] {
            mgr.process(FlowMgmtRequest::RouteTableDeleted { vrf: 1, table });
        }
        assert!(mgr.has_vrf_flows(1));
        mgr.delete_flow(FlowId(1)).unwrap();
        assert!(!mgr.take_events().contains(&FlowEvent::DeleteObjectVrf { vrf: 1, gen_id: 0 }));

        mgr.delete_flow(FlowId(2)).unwrap();
        assert!(mgr.take_events().contains(&FlowEvent::DeleteObjectVrf { vrf: 1, gen_id: 0 }));
        assert!(mgr.vrf_tree().is_empty());
        assert!(logs_contain("Vrf 1 released"));
    }

    #[test]
    fn test_vrf_delete_removes_implicit_default_route() {
        let mut mgr = manager(&[1]);
        mgr.process(FlowMgmtRequest::add(FlowMgmtKey::Vrf(1), 3));
        let mut f = flow(1, 1);
        f.routes.source = Some(RouteRef { vrf: 1, plen: 0 });
        mgr.add_flow(&f);
        let default = FlowMgmtKey::InetRoute(InetRouteKey::default_route(1, true));
        assert!(mgr.entry(&default).is_some());

        for table in [RouteTableType::Inet4, RouteTableType::Inet6, RouteTableType::Bridge] {
            mgr.process(FlowMgmtRequest::RouteTableDeleted { vrf: 1, table });
        }
        mgr.process(FlowMgmtRequest::delete(FlowMgmtKey::Vrf(1), 3));
        assert_eq!(
            mgr.take_events(),
            vec![FlowEvent::flow(FlowAction::Revaluate, FlowId(1), default)]
        );
        mgr.process(FlowMgmtRequest::DeleteFlow(FlowId(1)));
        assert_eq!(
            mgr.take_events(),
            vec![
                FlowEvent::DeleteObjectVrf { vrf: 1, gen_id: 3 },
                FlowEvent::FreeFlowRef { flow: FlowId(1) }
            ]
        );
    }

    #[test]
    fn test_route_delete_retries_vrf_delete() {
        let mut mgr = manager(&[1]);
        let route = src_route(1);
        mgr.process(FlowMgmtRequest::add(FlowMgmtKey::Vrf(1), 0));
        mgr.process(FlowMgmtRequest::add(route, 0));
        mgr.process(FlowMgmtRequest::delete(FlowMgmtKey::Vrf(1), 0));
        for table in [RouteTableType::Inet4, RouteTableType::Inet6, RouteTableType::Bridge] {
            mgr.process(FlowMgmtRequest::RouteTableDeleted { vrf: 1, table });
        }
        // the route entry is held by the database
        assert!(mgr.take_events().is_empty());
        mgr.process(FlowMgmtRequest::delete(route, 0));
        assert_eq!(
            mgr.take_events(),
            vec![
                FlowEvent::FreeDbEntry {
                    key: route,
                    gen_id: 0
                },
                FlowEvent::DeleteObjectVrf { vrf: 1, gen_id: 0 }
            ]
        );
    }

    #[test]
    fn test_bgp_as_a_service() {
        let vmi = Uuid::new_v4();
        let cn = "192.0.2.1".parse().unwrap();
        let db = TestDb {
            controllers: vec![cn],
            ..TestDb::with_vrfs(&[])
        };
        let mut mgr = FlowMgmtManager::new(Arc::new(db));
        let mut f = flow(1, 1);
        f.flags |= FlowFlags::BGP_ROUTER_SERVICE | FlowFlags::REVERSE_FLOW;
        f.key.src = cn;
        f.vmi_uuid = Some(vmi);
        f.bgp_as_a_service_sport = 50179;
        mgr.add_flow(&f);

        let key = BgpAsAServiceKey {
            vmi,
            sport: 50179,
            cn_index: 0,
        };
        let mkey = FlowMgmtKey::BgpAsAService(key);
        let hc = Uuid::new_v4();
        mgr.process(FlowMgmtRequest::BgpAsAServiceHealthCheck {
            key,
            health_check: Some(hc),
        });
        assert_eq!(mgr.entry(&mkey).and_then(FlowMgmtEntry::health_check), Some(hc));
        assert_eq!(
            mgr.take_events(),
            vec![FlowEvent::flow(FlowAction::Revaluate, FlowId(1), mkey)]
        );

        mgr.process(FlowMgmtRequest::DeleteAllBgpAsAService);
        assert_eq!(
            mgr.take_events(),
            vec![FlowEvent::BgpAsAServiceNotify { vmi, sport: 50179 }]
        );

        mgr.process(FlowMgmtRequest::DeleteBgpAsAService(key));
        assert_eq!(
            mgr.take_events(),
            vec![FlowEvent::flow(FlowAction::Delete, FlowId(1), mkey)]
        );
        mgr.process(FlowMgmtRequest::DeleteFlow(FlowId(1)));
        assert!(mgr.entry(&mkey).is_none());
    }
}
