// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-memory operational database, written under the `DbTable` identity and
//! read by flow management.

use flow_mgmt::OperDb;
use flow_mgmt::key::VrfId;
use hashbrown::{HashMap, HashSet};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct DbState {
    vrfs: HashSet<VrfId>,
    routes: HashMap<VrfId, Vec<IpNet>>,
    controllers: Vec<IpAddr>,
}

#[derive(Debug, Default)]
pub struct InMemoryOperDb {
    state: RwLock<DbState>,
}

impl InMemoryOperDb {
    fn read(&self) -> RwLockReadGuard<'_, DbState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
    fn write(&self) -> RwLockWriteGuard<'_, DbState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_vrf(&self, vrf: VrfId) {
        debug!("Adding vrf {vrf}");
        self.write().vrfs.insert(vrf);
    }

    /// Remove a VRF and its routes
    pub fn delete_vrf(&self, vrf: VrfId) {
        debug!("Deleting vrf {vrf}");
        let mut state = self.write();
        state.vrfs.remove(&vrf);
        state.routes.remove(&vrf);
    }

    pub fn add_route(&self, vrf: VrfId, prefix: IpNet) {
        let prefix = prefix.trunc();
        let mut state = self.write();
        let routes = state.routes.entry(vrf).or_default();
        if !routes.contains(&prefix) {
            routes.push(prefix);
        }
    }

    pub fn delete_route(&self, vrf: VrfId, prefix: IpNet) {
        let prefix = prefix.trunc();
        if let Some(routes) = self.write().routes.get_mut(&vrf) {
            routes.retain(|r| *r != prefix);
        }
    }

    #[must_use]
    pub fn routes(&self, vrf: VrfId) -> Vec<IpNet> {
        self.read().routes.get(&vrf).cloned().unwrap_or_default()
    }

    /// Set the control nodes; their index is their position in `controllers`
    pub fn set_controllers(&self, controllers: Vec<IpAddr>) {
        self.write().controllers = controllers;
    }
}

impl OperDb for InMemoryOperDb {
    fn vrf_exists(&self, vrf: VrfId) -> bool {
        self.read().vrfs.contains(&vrf)
    }

    fn uc_route(&self, vrf: VrfId, addr: IpAddr) -> Option<(IpAddr, u8)> {
        let state = self.read();
        if !state.vrfs.contains(&vrf) {
            return None;
        }
        state
            .routes
            .get(&vrf)?
            .iter()
            .filter(|prefix| prefix.contains(&addr))
            .max_by_key(|prefix| prefix.prefix_len())
            .map(|prefix| (prefix.network(), prefix.prefix_len()))
    }

    fn controller_index(&self, addr: IpAddr) -> Option<u8> {
        let state = self.read();
        let index = state.controllers.iter().position(|c| *c == addr)?;
        u8::try_from(index).ok()
    }
}
