// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Route trees. Route entries of a VRF are contiguous in key order, which lets
//! the trees tell whether any flow still refers to a VRF.

use tracectl::trace_target;
use tracing::debug;

use super::FlowMgmtTree;
use super::lpm::RouteLpm;
use crate::entry::{FlowMgmtEntry, OperState};
use crate::event::FlowEvent;
use crate::flow::FlowId;
use crate::key::{BridgeRouteKey, FlowMgmtKey, InetRouteKey, Mac, VrfId};
use crate::request::DbOperation;

trace_target!("flow-mgmt-lpm", LevelFilter::INFO, &["flow"]);

/// Inet routes of one address family
pub struct InetRouteFlowMgmtTree {
    tree: FlowMgmtTree,
    lpm: RouteLpm,
    ipv4: bool,
    covering_recomputes: u64,
}

impl InetRouteFlowMgmtTree {
    #[must_use]
    pub fn new(ipv4: bool) -> Self {
        Self {
            tree: FlowMgmtTree::new(if ipv4 { "inet4-route" } else { "inet6-route" }),
            lpm: RouteLpm::default(),
            ipv4,
            covering_recomputes: 0,
        }
    }
    #[must_use]
    pub fn tree(&self) -> &FlowMgmtTree {
        &self.tree
    }
    #[must_use]
    pub fn find(&self, key: &InetRouteKey) -> Option<&FlowMgmtEntry> {
        self.tree.find(&FlowMgmtKey::InetRoute(*key))
    }
    /// Number of times a new route caused the flows of a covering route to be recomputed
    #[must_use]
    pub fn covering_recomputes(&self) -> u64 {
        self.covering_recomputes
    }
    /// Longest prefix match among the routes that saw a database add
    #[must_use]
    pub fn lpm(&self, key: &InetRouteKey) -> Option<InetRouteKey> {
        self.lpm.lpm(key)
    }
    /// The most specific known route strictly covering `key`
    #[must_use]
    pub fn covering_route(&self, key: &InetRouteKey) -> Option<InetRouteKey> {
        key.parent().and_then(|parent| self.lpm.lpm(&parent))
    }

    pub(crate) fn add(&mut self, key: &InetRouteKey, flow: FlowId) -> bool {
        debug_assert_eq!(key.is_ipv4(), self.ipv4);
        self.tree.add(&FlowMgmtKey::InetRoute(*key), flow)
    }

    pub(crate) fn delete(
        &mut self,
        key: &InetRouteKey,
        flow: FlowId,
        events: &mut Vec<FlowEvent>,
    ) -> bool {
        self.tree.delete(&FlowMgmtKey::InetRoute(*key), flow, events)
    }

    /// Database add or change of a route. A route added for the first time may
    /// be more specific than the route some flows currently use: those flows,
    /// found through the covering route, must be recomputed.
    pub(crate) fn oper_entry_add(
        &mut self,
        op: DbOperation,
        key: &InetRouteKey,
        gen_id: u32,
        nh_changed: bool,
        events: &mut Vec<FlowEvent>,
    ) {
        let mkey = FlowMgmtKey::InetRoute(*key);
        let new_route = self
            .tree
            .find(&mkey)
            .is_none_or(|e| e.oper_state() != OperState::AddSeen);
        match op {
            DbOperation::Change => self.tree.oper_entry_change(&mkey, gen_id, events),
            _ => self.tree.oper_entry_add(op, &mkey, gen_id, events),
        }
        if nh_changed && let Some(entry) = self.tree.find(&mkey) {
            entry.handle_nh_change(&mkey, events);
        }
        self.lpm.insert(key);
        if !new_route {
            return;
        }
        if let Some(covering) = self.covering_route(key) {
            let ckey = FlowMgmtKey::InetRoute(covering);
            if let Some(entry) = self.tree.find(&ckey) {
                debug!("Route {key} recomputes flows of covering route {covering}");
                entry.recompute_covering_route(&ckey, events);
                self.covering_recomputes += 1;
            }
        }
    }

    pub(crate) fn oper_entry_delete(
        &mut self,
        op: DbOperation,
        key: &InetRouteKey,
        gen_id: u32,
        events: &mut Vec<FlowEvent>,
    ) -> bool {
        let mkey = FlowMgmtKey::InetRoute(*key);
        let done = self.tree.oper_entry_delete(op, &mkey, gen_id, true, events);
        if done {
            self.lpm.remove(key);
        }
        done
    }

    /// Delete the default route of `vrf` if flows use it without the database
    /// having ever reported it. Returns true if the route was deleted.
    pub(crate) fn implicit_default_route_delete(
        &mut self,
        vrf: VrfId,
        events: &mut Vec<FlowEvent>,
    ) -> bool {
        let key = InetRouteKey::default_route(vrf, self.ipv4);
        let mkey = FlowMgmtKey::InetRoute(key);
        match self.tree.find(&mkey) {
            Some(e) if e.oper_state() == OperState::NotSeen => {
                debug!("Implicit delete of {key}");
                self.tree
                    .oper_entry_delete(DbOperation::Implicit, &mkey, 0, true, events)
            }
            _ => false,
        }
    }

    /// Whether any route entry of `vrf` is left
    #[must_use]
    pub fn has_vrf_flows(&self, vrf: VrfId) -> bool {
        let first = FlowMgmtKey::InetRoute(InetRouteKey::default_route(vrf, self.ipv4));
        matches!(
            self.tree.lower_bound(&first),
            Some(FlowMgmtKey::InetRoute(k)) if k.vrf() == vrf && k.is_ipv4() == self.ipv4
        )
    }
}

/// Bridge routes
pub struct BridgeRouteFlowMgmtTree {
    tree: FlowMgmtTree,
}

impl Default for BridgeRouteFlowMgmtTree {
    fn default() -> Self {
        Self {
            tree: FlowMgmtTree::new("bridge-route"),
        }
    }
}

impl BridgeRouteFlowMgmtTree {
    #[must_use]
    pub fn tree(&self) -> &FlowMgmtTree {
        &self.tree
    }
    pub(crate) fn tree_mut(&mut self) -> &mut FlowMgmtTree {
        &mut self.tree
    }
    #[must_use]
    pub fn has_vrf_flows(&self, vrf: VrfId) -> bool {
        let first = FlowMgmtKey::BridgeRoute(BridgeRouteKey { vrf, mac: Mac::ZERO });
        matches!(
            self.tree.lower_bound(&first),
            Some(FlowMgmtKey::BridgeRoute(k)) if k.vrf == vrf
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FlowAction;

    fn key(vrf: VrfId, addr: &str, plen: u8) -> InetRouteKey {
        InetRouteKey::new(vrf, addr.parse().unwrap(), plen).unwrap()
    }

    #[test]
    fn test_covering_route_recompute() {
        let mut tree = InetRouteFlowMgmtTree::new(true);
        let mut events = vec![];
        let covering = key(1, "10.0.0.0", 8);
        tree.oper_entry_add(DbOperation::Add, &covering, 0, false, &mut events);
        tree.add(&covering, FlowId(1));
        events.clear();

        let specific = key(1, "10.1.0.0", 16);
        tree.oper_entry_add(DbOperation::Add, &specific, 0, false, &mut events);
        assert_eq!(
            events,
            vec![FlowEvent::flow(
                FlowAction::Recompute,
                FlowId(1),
                FlowMgmtKey::InetRoute(covering)
            )]
        );
        assert_eq!(tree.covering_recomputes(), 1);

        // a change of an existing route does not recompute again
        events.clear();
        tree.oper_entry_add(DbOperation::Change, &specific, 0, false, &mut events);
        assert!(events.is_empty());
        assert_eq!(tree.covering_recomputes(), 1);
    }

    #[test]
    fn test_covering_route_is_strictly_shorter() {
        let mut tree = InetRouteFlowMgmtTree::new(true);
        let mut events = vec![];
        let long = key(1, "10.0.0.0", 24);
        let short = key(1, "10.0.0.0", 16);
        tree.oper_entry_add(DbOperation::Add, &long, 0, false, &mut events);
        tree.oper_entry_add(DbOperation::Add, &short, 0, false, &mut events);
        assert_eq!(tree.covering_route(&long), Some(short));
        assert_eq!(tree.lpm(&long), Some(long));
        assert_eq!(tree.covering_route(&short), None);
    }

    #[test]
    fn test_route_change_events() {
        let mut tree = InetRouteFlowMgmtTree::new(true);
        let mut events = vec![];
        let route = key(2, "192.168.1.0", 24);
        let mkey = FlowMgmtKey::InetRoute(route);
        tree.add(&route, FlowId(4));
        tree.oper_entry_add(DbOperation::Add, &route, 0, false, &mut events);
        assert_eq!(events, vec![FlowEvent::flow(FlowAction::Revaluate, FlowId(4), mkey)]);

        events.clear();
        tree.oper_entry_add(DbOperation::Change, &route, 0, true, &mut events);
        assert_eq!(
            events,
            vec![
                FlowEvent::flow(FlowAction::RevaluateRoute, FlowId(4), mkey),
                FlowEvent::flow(FlowAction::ResolveNh, FlowId(4), mkey),
            ]
        );
    }

    #[test]
    fn test_has_vrf_flows() {
        let mut tree = InetRouteFlowMgmtTree::new(true);
        let mut events = vec![];
        let route = key(5, "172.16.0.0", 12);
        assert!(!tree.has_vrf_flows(5));
        tree.add(&route, FlowId(1));
        assert!(tree.has_vrf_flows(5));
        assert!(!tree.has_vrf_flows(4));
        assert!(!tree.has_vrf_flows(6));
        tree.delete(&route, FlowId(1), &mut events);
        assert!(!tree.has_vrf_flows(5));
    }

    #[test]
    fn test_implicit_default_route_delete() {
        let mut tree = InetRouteFlowMgmtTree::new(true);
        let mut events = vec![];
        let default = InetRouteKey::default_route(3, true);
        tree.add(&default, FlowId(1));
        assert!(tree.implicit_default_route_delete(3, &mut events));
        assert_eq!(tree.find(&default).unwrap().oper_state(), OperState::DelSeen);

        // the entry goes once the flow leaves, without any free notification
        events.clear();
        tree.delete(&default, FlowId(1), &mut events);
        assert!(tree.find(&default).is_none());
        assert!(events.is_empty());

        // not implicit when the database reported the route
        tree.oper_entry_add(DbOperation::Add, &default, 0, false, &mut events);
        assert!(!tree.implicit_default_route_delete(3, &mut events));
    }

    #[test]
    fn test_bridge_has_vrf_flows() {
        let mut tree = BridgeRouteFlowMgmtTree::default();
        let key = FlowMgmtKey::BridgeRoute(BridgeRouteKey {
            vrf: 7,
            mac: Mac([0, 1, 2, 3, 4, 5]),
        });
        tree.tree_mut().add(&key, FlowId(1));
        assert!(tree.has_vrf_flows(7));
        assert!(!tree.has_vrf_flows(8));
    }
}
