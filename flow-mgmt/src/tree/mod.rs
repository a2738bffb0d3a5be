// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Ordered maps from object keys to their flow management entries

pub mod extract;
pub(crate) mod lpm;
pub mod route;
pub mod vrf;

use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::debug;

use crate::entry::{FlowMgmtEntry, OperState};
use crate::event::FlowEvent;
use crate::flow::FlowId;
use crate::key::FlowMgmtKey;
use crate::request::DbOperation;

/// Entries of one kind of object, ordered by key
#[derive(Debug)]
pub struct FlowMgmtTree {
    name: &'static str,
    tree: BTreeMap<FlowMgmtKey, FlowMgmtEntry>,
}

impl FlowMgmtTree {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tree: BTreeMap::new(),
        }
    }
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
    #[must_use]
    pub fn find(&self, key: &FlowMgmtKey) -> Option<&FlowMgmtEntry> {
        self.tree.get(key)
    }
    pub(crate) fn find_mut(&mut self, key: &FlowMgmtKey) -> Option<&mut FlowMgmtEntry> {
        self.tree.get_mut(key)
    }
    pub fn keys(&self) -> impl Iterator<Item = &FlowMgmtKey> {
        self.tree.keys()
    }
    /// Find the entry of `key`, creating it if absent
    pub(crate) fn locate(&mut self, key: &FlowMgmtKey) -> &mut FlowMgmtEntry {
        self.tree
            .entry(*key)
            .or_insert_with(|| FlowMgmtEntry::new(key))
    }
    /// First key greater than or equal to `key`
    #[must_use]
    pub fn lower_bound(&self, key: &FlowMgmtKey) -> Option<&FlowMgmtKey> {
        self.tree
            .range((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k)
    }

    /// Add a flow to the entry of `key`. Returns true if the flow is new to the entry.
    pub(crate) fn add(&mut self, key: &FlowMgmtKey, flow: FlowId) -> bool {
        self.locate(key).add(flow)
    }

    /// Remove a flow from the entry of `key` and try to delete the entry.
    pub(crate) fn delete(
        &mut self,
        key: &FlowMgmtKey,
        flow: FlowId,
        events: &mut Vec<FlowEvent>,
    ) -> bool {
        let Some(entry) = self.tree.get_mut(key) else {
            return false;
        };
        let contained = entry.contains(flow);
        entry.delete(flow);
        self.try_delete(key, true, events);
        contained
    }

    /// Remove the entry of `key` if nothing holds it any more. `allowed`
    /// carries conditions known only to the caller. The owner of the object is
    /// told once the database delete has been seen.
    pub(crate) fn try_delete(
        &mut self,
        key: &FlowMgmtKey,
        allowed: bool,
        events: &mut Vec<FlowEvent>,
    ) -> bool {
        let Some(entry) = self.tree.get(key) else {
            return false;
        };
        if !allowed || !entry.can_delete() {
            return false;
        }
        if entry.oper_state() == OperState::DelSeen
            && entry.needs_free_notify()
            && let Some(event) = FlowEvent::free_notify(*key, entry.gen_id())
        {
            events.push(event);
        }
        debug!("{}: removing entry of {key}", self.name);
        self.remove(key);
        true
    }

    /// Drop the entry of `key` from the tree.
    ///
    /// # Panics
    /// Panics if flows still depend on the entry.
    fn remove(&mut self, key: &FlowMgmtKey) -> Option<FlowMgmtEntry> {
        let entry = self.tree.remove(key)?;
        assert_eq!(
            entry.size(),
            0,
            "{}: entry of {key} removed with flows left",
            self.name
        );
        Some(entry)
    }

    pub(crate) fn oper_entry_add(
        &mut self,
        op: DbOperation,
        key: &FlowMgmtKey,
        gen_id: u32,
        events: &mut Vec<FlowEvent>,
    ) {
        self.locate(key).oper_entry_add(op, key, gen_id, events);
    }

    /// A change for an object never added is handled as an add.
    pub(crate) fn oper_entry_change(
        &mut self,
        key: &FlowMgmtKey,
        gen_id: u32,
        events: &mut Vec<FlowEvent>,
    ) {
        self.oper_entry_add(DbOperation::Change, key, gen_id, events);
    }

    /// Process the database delete of `key`. Returns false if the delete is
    /// stale, i.e. for an older generation than the one last added.
    pub(crate) fn oper_entry_delete(
        &mut self,
        op: DbOperation,
        key: &FlowMgmtKey,
        gen_id: u32,
        allowed: bool,
        events: &mut Vec<FlowEvent>,
    ) -> bool {
        let Some(entry) = self.tree.get_mut(key) else {
            // nothing kept for the object: it can go right away
            if op != DbOperation::Implicit
                && let Some(event) = FlowEvent::free_notify(*key, gen_id)
            {
                events.push(event);
            }
            return true;
        };
        if entry.oper_state() == OperState::AddSeen && gen_id < entry.gen_id() {
            debug!(
                "{}: ignoring stale delete of {key} (gen {gen_id} < {})",
                self.name,
                entry.gen_id()
            );
            return false;
        }
        entry.oper_entry_delete(op, key, gen_id, events);
        self.try_delete(key, allowed, events);
        true
    }

    /// Delete of an object that is not backed by a database entry
    pub(crate) fn non_oper_entry_delete(&mut self, key: &FlowMgmtKey, events: &mut Vec<FlowEvent>) {
        if let Some(entry) = self.tree.get_mut(key) {
            entry.non_oper_entry_delete(key, events);
            self.try_delete(key, true, events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FlowAction;
    use crate::key::{AclId, NhId};

    #[test]
    fn test_entry_lifecycle() {
        let mut tree = FlowMgmtTree::new("nh");
        let key = FlowMgmtKey::Nh(NhId(1));
        let mut events = vec![];

        assert!(tree.add(&key, FlowId(1)));
        assert_eq!(tree.find(&key).unwrap().oper_state(), OperState::NotSeen);
        tree.oper_entry_add(DbOperation::Add, &key, 1, &mut events);
        assert_eq!(
            events,
            vec![FlowEvent::flow(FlowAction::Revaluate, FlowId(1), key)]
        );
        events.clear();

        // entry survives the last flow while the object exists
        assert!(tree.delete(&key, FlowId(1), &mut events));
        assert!(tree.find(&key).is_some());

        assert!(tree.oper_entry_delete(DbOperation::Delete, &key, 1, true, &mut events));
        assert!(tree.find(&key).is_none());
        assert_eq!(events, vec![FlowEvent::FreeDbEntry { key, gen_id: 1 }]);
    }

    #[test]
    fn test_entry_without_db_object_goes_silently() {
        let mut tree = FlowMgmtTree::new("acl");
        let key = FlowMgmtKey::Acl(AclId(1));
        let mut events = vec![];
        tree.add(&key, FlowId(1));
        tree.delete(&key, FlowId(1), &mut events);
        assert!(tree.is_empty());
        assert!(events.is_empty());
    }

    #[test]
    fn test_delete_of_unknown_key_frees_it() {
        let mut tree = FlowMgmtTree::new("acl");
        let key = FlowMgmtKey::Acl(AclId(5));
        let mut events = vec![];
        tree.oper_entry_delete(DbOperation::Delete, &key, 3, true, &mut events);
        assert_eq!(events, vec![FlowEvent::FreeDbEntry { key, gen_id: 3 }]);
    }

    #[test]
    fn test_stale_delete_is_ignored() {
        let mut tree = FlowMgmtTree::new("acl");
        let key = FlowMgmtKey::Acl(AclId(5));
        let mut events = vec![];
        tree.oper_entry_add(DbOperation::Add, &key, 2, &mut events);
        assert!(!tree.oper_entry_delete(DbOperation::Delete, &key, 1, true, &mut events));
        assert_eq!(tree.find(&key).unwrap().oper_state(), OperState::AddSeen);
        assert!(events.is_empty());
    }

    #[test]
    fn test_entry_outlives_its_flows() {
        // (flow, add or delete flow, database op)
        bolero::check!()
            .with_type::<Vec<(u8, bool, Option<bool>)>>()
            .for_each(|ops| {
                let mut tree = FlowMgmtTree::new("vn");
                let key = FlowMgmtKey::Nh(NhId(1));
                let mut events = vec![];
                let mut flows = std::collections::BTreeSet::new();
                for (flow, add, db) in ops {
                    let flow = FlowId(u64::from(flow % 8));
                    if *add {
                        tree.add(&key, flow);
                        flows.insert(flow);
                    } else {
                        tree.delete(&key, flow, &mut events);
                        flows.remove(&flow);
                    }
                    match db {
                        Some(true) => tree.oper_entry_add(DbOperation::Add, &key, 0, &mut events),
                        Some(false) => {
                            tree.oper_entry_delete(DbOperation::Delete, &key, 0, true, &mut events);
                        }
                        None => {}
                    }
                    match tree.find(&key) {
                        Some(entry) => assert_eq!(entry.size(), flows.len()),
                        None => assert!(flows.is_empty()),
                    }
                }
            });
    }

    #[test]
    #[should_panic(expected = "removed with flows left")]
    fn test_remove_entry_with_flows() {
        let mut tree = FlowMgmtTree::new("nh");
        let key = FlowMgmtKey::Nh(NhId(3));
        tree.add(&key, FlowId(1));
        tree.remove(&key);
    }

    #[test]
    fn test_delete_before_flows_leave() {
        let mut tree = FlowMgmtTree::new("acl");
        let key = FlowMgmtKey::Acl(AclId(5));
        let mut events = vec![];
        tree.oper_entry_add(DbOperation::Add, &key, 0, &mut events);
        tree.add(&key, FlowId(9));
        tree.oper_entry_delete(DbOperation::Delete, &key, 0, true, &mut events);
        assert_eq!(
            events,
            vec![FlowEvent::flow(FlowAction::Delete, FlowId(9), key)]
        );
        events.clear();
        assert!(tree.find(&key).is_some());

        tree.delete(&key, FlowId(9), &mut events);
        assert!(tree.find(&key).is_none());
        assert_eq!(events, vec![FlowEvent::FreeDbEntry { key, gen_id: 0 }]);
    }
}
