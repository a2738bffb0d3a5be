// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-object state: the set of dependent flows and the lifecycle of the
//! database object as seen by flow management.

use hashbrown::HashSet;
use std::collections::BTreeMap;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::event::{FlowAction, FlowEvent};
use crate::flow::FlowId;
use crate::key::{AceId, FlowMgmtKey};
use crate::request::{DbOperation, RouteTableType, flow_action};

/// State of the database object behind an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
pub enum OperState {
    #[default]
    Invalid,
    /// Only known through flows
    NotSeen,
    AddSeen,
    DelSeen,
}

/// Flow counters of a virtual network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VnFlowCounters {
    pub ingress_local: u32,
    pub ingress_remote: u32,
    pub egress_local: u32,
    pub egress_remote: u32,
}

impl VnFlowCounters {
    #[must_use]
    pub fn ingress(&self) -> u32 {
        self.ingress_local + self.ingress_remote
    }
    #[must_use]
    pub fn egress(&self) -> u32 {
        self.egress_local + self.egress_remote
    }

    // local flows are seen in both directions and account in both counters
    fn slots(&mut self, local: bool, ingress: bool) -> Vec<&mut u32> {
        match (local, ingress) {
            (true, _) => vec![&mut self.ingress_local, &mut self.egress_local],
            (false, true) => vec![&mut self.ingress_remote],
            (false, false) => vec![&mut self.egress_remote],
        }
    }
    fn account(&mut self, local: bool, ingress: bool) {
        self.slots(local, ingress).into_iter().for_each(|c| *c += 1);
    }
    fn unaccount(&mut self, local: bool, ingress: bool) {
        self.slots(local, ingress)
            .into_iter()
            .for_each(|c| *c = c.saturating_sub(1));
    }
}

/// Flows seen on an interface since its entry was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceFlowCounters {
    pub created: u64,
    pub aged: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteTableState {
    deleted: bool,
}

impl RouteTableState {
    fn mark_deleted(&mut self, vrf_key: &FlowMgmtKey, table: RouteTableType) {
        assert!(
            !self.deleted,
            "Route table {table} of {vrf_key} deleted twice"
        );
        self.deleted = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryData {
    Plain,
    Acl { ace_flows: BTreeMap<AceId, u32> },
    Vn(VnFlowCounters),
    Interface(InterfaceFlowCounters),
    Route { db_entry_seen: bool },
    Vrf { tables: [RouteTableState; 3] },
    BgpAsAService { health_check: Option<Uuid> },
}

impl EntryData {
    fn for_key(key: &FlowMgmtKey) -> Self {
        match key {
            FlowMgmtKey::Acl(_) => EntryData::Acl {
                ace_flows: BTreeMap::new(),
            },
            FlowMgmtKey::Vn(_) => EntryData::Vn(VnFlowCounters::default()),
            FlowMgmtKey::Interface(_) => EntryData::Interface(InterfaceFlowCounters::default()),
            FlowMgmtKey::InetRoute(_) | FlowMgmtKey::BridgeRoute(_) => EntryData::Route {
                db_entry_seen: false,
            },
            FlowMgmtKey::Vrf(_) => EntryData::Vrf {
                tables: [RouteTableState::default(); 3],
            },
            FlowMgmtKey::BgpAsAService(_) => EntryData::BgpAsAService { health_check: None },
            FlowMgmtKey::Vm(_) | FlowMgmtKey::Nh(_) => EntryData::Plain,
        }
    }
}

/// State kept for one database object
#[derive(Debug, Clone)]
pub struct FlowMgmtEntry {
    oper_state: OperState,
    gen_id: u32,
    flows: HashSet<FlowId>,
    data: EntryData,
}

impl FlowMgmtEntry {
    pub(crate) fn new(key: &FlowMgmtKey) -> Self {
        Self {
            oper_state: OperState::NotSeen,
            gen_id: 0,
            flows: HashSet::new(),
            data: EntryData::for_key(key),
        }
    }
    #[must_use]
    pub fn oper_state(&self) -> OperState {
        self.oper_state
    }
    #[must_use]
    pub fn gen_id(&self) -> u32 {
        self.gen_id
    }
    #[must_use]
    pub fn size(&self) -> usize {
        self.flows.len()
    }
    #[must_use]
    pub fn contains(&self, flow: FlowId) -> bool {
        self.flows.contains(&flow)
    }
    pub fn flows(&self) -> impl Iterator<Item = FlowId> + '_ {
        self.flows.iter().copied()
    }
    #[must_use]
    pub fn data(&self) -> &EntryData {
        &self.data
    }

    /// Add a flow. Returns true if the flow was not in the entry yet.
    pub(crate) fn add(&mut self, flow: FlowId) -> bool {
        let inserted = self.flows.insert(flow);
        if inserted && let EntryData::Interface(counters) = &mut self.data {
            counters.created += 1;
        }
        inserted
    }

    /// Remove a flow. Returns true if no flow is left.
    pub(crate) fn delete(&mut self, flow: FlowId) -> bool {
        if self.flows.remove(&flow)
            && let EntryData::Interface(counters) = &mut self.data
        {
            counters.aged += 1;
        }
        self.flows.is_empty()
    }

    /// Whether the entry can be removed from its tree.
    ///
    /// # Panics
    /// Panics if the entry was never initialized.
    #[must_use]
    pub fn can_delete(&self) -> bool {
        assert_ne!(self.oper_state, OperState::Invalid, "Uninitialized entry");
        if !self.flows.is_empty() || self.oper_state == OperState::AddSeen {
            return false;
        }
        match &self.data {
            EntryData::Vrf { tables } => tables.iter().all(|t| t.deleted),
            _ => true,
        }
    }

    fn notify_flows(&self, action: FlowAction, key: &FlowMgmtKey, events: &mut Vec<FlowEvent>) {
        trace!("{action} {} flows of {key}", self.flows.len());
        events.extend(
            self.flows
                .iter()
                .map(|flow| FlowEvent::flow(action, *flow, *key)),
        );
    }

    fn set_db_entry_seen(&mut self) {
        if let EntryData::Route { db_entry_seen } = &mut self.data {
            *db_entry_seen = true;
        }
    }

    /// Whether the owner of the object must be notified when the entry goes away
    pub(crate) fn needs_free_notify(&self) -> bool {
        match self.data {
            EntryData::Route { db_entry_seen } => db_entry_seen,
            _ => true,
        }
    }

    pub(crate) fn oper_entry_add(
        &mut self,
        op: DbOperation,
        key: &FlowMgmtKey,
        gen_id: u32,
        events: &mut Vec<FlowEvent>,
    ) {
        self.oper_state = OperState::AddSeen;
        self.gen_id = gen_id;
        self.set_db_entry_seen();
        if let Some(action) = flow_action(op, key) {
            self.notify_flows(action, key, events);
        }
    }

    pub(crate) fn oper_entry_delete(
        &mut self,
        op: DbOperation,
        key: &FlowMgmtKey,
        gen_id: u32,
        events: &mut Vec<FlowEvent>,
    ) {
        self.oper_state = OperState::DelSeen;
        self.gen_id = gen_id;
        if op != DbOperation::Implicit {
            self.set_db_entry_seen();
        }
        if let Some(action) = flow_action(op, key) {
            self.notify_flows(action, key, events);
        }
    }

    /// Delete of an object that flow management tracks without a database entry
    pub(crate) fn non_oper_entry_delete(&mut self, key: &FlowMgmtKey, events: &mut Vec<FlowEvent>) {
        self.oper_state = OperState::DelSeen;
        self.notify_flows(FlowAction::Delete, key, events);
    }

    pub(crate) fn recompute_covering_route(
        &self,
        key: &FlowMgmtKey,
        events: &mut Vec<FlowEvent>,
    ) {
        self.notify_flows(FlowAction::Recompute, key, events);
    }

    pub(crate) fn handle_nh_change(&self, key: &FlowMgmtKey, events: &mut Vec<FlowEvent>) {
        self.notify_flows(FlowAction::ResolveNh, key, events);
    }

    pub(crate) fn revaluate_all(&self, key: &FlowMgmtKey, events: &mut Vec<FlowEvent>) {
        self.notify_flows(FlowAction::Revaluate, key, events);
    }

    /// Account the ACEs matched by a flow. `old` is the ACE list the flow had
    /// on this ACL before, if any.
    pub(crate) fn update_ace_flows(&mut self, new: &[AceId], old: Option<&[AceId]>) {
        let EntryData::Acl { ace_flows } = &mut self.data else {
            return;
        };
        if old == Some(new) {
            return;
        }
        for ace in old.unwrap_or_default() {
            decrement(ace_flows, *ace);
        }
        for ace in new {
            *ace_flows.entry(*ace).or_default() += 1;
        }
    }

    pub(crate) fn remove_ace_flows(&mut self, aces: &[AceId]) {
        if let EntryData::Acl { ace_flows } = &mut self.data {
            for ace in aces {
                decrement(ace_flows, *ace);
            }
        }
    }

    #[must_use]
    pub fn ace_flow_count(&self, ace: AceId) -> u32 {
        match &self.data {
            EntryData::Acl { ace_flows } => ace_flows.get(&ace).copied().unwrap_or(0),
            _ => 0,
        }
    }

    /// Account a flow on a VN entry. `old` holds the (local, ingress) flags the
    /// flow was accounted with, if it was already in the entry.
    pub(crate) fn vn_add_flow(&mut self, local: bool, ingress: bool, old: Option<(bool, bool)>) {
        if let EntryData::Vn(counters) = &mut self.data {
            if let Some((old_local, old_ingress)) = old {
                counters.unaccount(old_local, old_ingress);
            }
            counters.account(local, ingress);
        }
    }

    pub(crate) fn vn_delete_flow(&mut self, local: bool, ingress: bool) {
        if let EntryData::Vn(counters) = &mut self.data {
            counters.unaccount(local, ingress);
        }
    }

    #[must_use]
    pub fn vn_counters(&self) -> Option<VnFlowCounters> {
        match &self.data {
            EntryData::Vn(counters) => Some(*counters),
            _ => None,
        }
    }

    #[must_use]
    pub fn interface_counters(&self) -> Option<InterfaceFlowCounters> {
        match &self.data {
            EntryData::Interface(counters) => Some(*counters),
            _ => None,
        }
    }

    pub(crate) fn route_table_deleted(&mut self, key: &FlowMgmtKey, table: RouteTableType) {
        if let EntryData::Vrf { tables } = &mut self.data {
            tables[table.index()].mark_deleted(key, table);
            debug!("Route table {table} of {key} deleted");
        }
    }

    pub(crate) fn set_health_check(&mut self, uuid: Option<Uuid>) {
        if let EntryData::BgpAsAService { health_check } = &mut self.data {
            *health_check = uuid;
        }
    }

    #[must_use]
    pub fn health_check(&self) -> Option<Uuid> {
        match &self.data {
            EntryData::BgpAsAService { health_check } => *health_check,
            _ => None,
        }
    }
}

fn decrement(counts: &mut BTreeMap<AceId, u32>, ace: AceId) {
    if let Some(count) = counts.get_mut(&ace) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(&ace);
        }
    }
}
