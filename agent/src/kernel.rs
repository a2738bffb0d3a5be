// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Kernel flow table counters, as last read from the forwarding plane

use flow_stats::{KernelFlowSource, KernelFlowStats};
use hashbrown::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Default)]
pub struct KernelFlowTable(Arc<RwLock<HashMap<u32, KernelFlowStats>>>);

impl KernelFlowTable {
    pub fn update(&self, handle: u32, stats: KernelFlowStats) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, stats);
    }
    pub fn remove(&self, handle: u32) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KernelFlowSource for KernelFlowTable {
    fn flow_stats(&self, handle: u32) -> Option<KernelFlowStats> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_updates() {
        let table = KernelFlowTable::default();
        let reader = table.clone();
        table.update(
            7,
            KernelFlowStats {
                bytes: 64,
                packets: 1,
                ..Default::default()
            },
        );
        assert_eq!(reader.flow_stats(7).map(|s| s.total_bytes()), Some(64));
        table.remove(7);
        assert!(reader.flow_stats(7).is_none());
        assert_eq!(reader.len(), 0);
    }
}
