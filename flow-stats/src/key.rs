// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Keys of the aging tables

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// An aging table applies to the flows of a protocol and port. Port 0 catches
/// all the flows of the protocol, and protocol 0 all the flows.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FlowAgingTableKey {
    pub proto: u8,
    pub port: u16,
}

impl FlowAgingTableKey {
    /// Key of the table that catches every flow without a better match
    pub const GLOBAL: FlowAgingTableKey = FlowAgingTableKey { proto: 0, port: 0 };

    #[must_use]
    pub const fn new(proto: u8, port: u16) -> Self {
        Self { proto, port }
    }
    #[must_use]
    pub fn is_global(&self) -> bool {
        *self == Self::GLOBAL
    }
    #[must_use]
    pub fn is_protocol_wide(&self) -> bool {
        self.port == 0
    }
}

impl Display for FlowAgingTableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_global() {
            write!(f, "aging table (default)")
        } else if self.is_protocol_wide() {
            write!(f, "aging table proto {}", self.proto)
        } else {
            write!(f, "aging table proto {} port {}", self.proto, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aging_table_key_order() {
        let mut keys = vec![
            FlowAgingTableKey::new(17, 53),
            FlowAgingTableKey::new(6, 0),
            FlowAgingTableKey::GLOBAL,
            FlowAgingTableKey::new(6, 80),
        ];
        keys.sort();
        assert_eq!(keys[0], FlowAgingTableKey::GLOBAL);
        assert_eq!(keys[1], FlowAgingTableKey::new(6, 0));
        assert_eq!(keys[3].to_string(), "aging table proto 17 port 53");
    }
}
