// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! VRF tree. A deleted VRF is released only once all of its route tables are
//! gone and no route entry of the VRF holds flows.

use std::collections::BTreeSet;
use tracectl::trace_target;
use tracing::debug;

use super::FlowMgmtTree;
use crate::entry::FlowMgmtEntry;
use crate::event::FlowEvent;
use crate::key::{FlowMgmtKey, VrfId};
use crate::request::{DbOperation, RouteTableType};

trace_target!("flow-mgmt-vrf", LevelFilter::INFO, &["flow"]);

pub struct VrfFlowMgmtTree {
    tree: FlowMgmtTree,
    // VRFs that have an entry in the tree
    id_map: BTreeSet<VrfId>,
}

impl Default for VrfFlowMgmtTree {
    fn default() -> Self {
        Self {
            tree: FlowMgmtTree::new("vrf"),
            id_map: BTreeSet::new(),
        }
    }
}

impl VrfFlowMgmtTree {
    #[must_use]
    pub fn find(&self, vrf: VrfId) -> Option<&FlowMgmtEntry> {
        self.tree.find(&FlowMgmtKey::Vrf(vrf))
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub(crate) fn oper_entry_add(&mut self, vrf: VrfId, gen_id: u32, events: &mut Vec<FlowEvent>) {
        self.tree
            .oper_entry_add(DbOperation::Add, &FlowMgmtKey::Vrf(vrf), gen_id, events);
        self.id_map.insert(vrf);
    }

    /// Database delete of a VRF. `busy` tells whether route entries of the VRF
    /// still hold flows.
    pub(crate) fn oper_entry_delete(
        &mut self,
        vrf: VrfId,
        gen_id: u32,
        busy: bool,
        events: &mut Vec<FlowEvent>,
    ) {
        let key = FlowMgmtKey::Vrf(vrf);
        self.tree
            .oper_entry_delete(DbOperation::Delete, &key, gen_id, !busy, events);
        self.sync_id_map(vrf);
    }

    /// A route table of the VRF has been deleted
    pub(crate) fn route_table_deleted(&mut self, vrf: VrfId, table: RouteTableType) -> bool {
        let key = FlowMgmtKey::Vrf(vrf);
        match self.tree.find_mut(&key) {
            Some(entry) => {
                entry.route_table_deleted(&key, table);
                true
            }
            None => {
                debug!("Route table {table} deleted for unknown vrf {vrf}");
                false
            }
        }
    }

    /// Release the VRF if it is ready to go. Returns true if it was released.
    pub(crate) fn retry_delete(&mut self, vrf: VrfId, busy: bool, events: &mut Vec<FlowEvent>) -> bool {
        if !self.id_map.contains(&vrf) {
            return false;
        }
        let deleted = self.tree.try_delete(&FlowMgmtKey::Vrf(vrf), !busy, events);
        self.sync_id_map(vrf);
        deleted
    }

    fn sync_id_map(&mut self, vrf: VrfId) {
        if self.find(vrf).is_none() {
            self.id_map.remove(&vrf);
        }
    }
}
