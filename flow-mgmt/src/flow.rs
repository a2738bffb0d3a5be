// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The view of a flow entry used by flow management, and the lookups into the
//! operational database needed to derive its dependencies.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

use crate::key::{AceId, AclId, InterfaceId, Mac, NhId, VmId, VnId, VrfId};

/// Identifies a flow entry for its whole life
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FlowId(pub u64);

impl Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow-{}", self.0)
    }
}

/// The 5-tuple of a flow, plus the next-hop index it was looked up with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub nh: u32,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    pub sport: u16,
    pub dport: u16,
}

impl Default for FlowKey {
    fn default() -> Self {
        Self {
            nh: 0,
            src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            proto: 0,
            sport: 0,
            dport: 0,
        }
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto {} nh {}",
            self.src, self.sport, self.dst, self.dport, self.proto, self.nh
        )
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct FlowFlags: u32 {
        const L3_FLOW            = 0b0000_0001;
        const LOCAL_FLOW         = 0b0000_0010;
        const INGRESS_DIR        = 0b0000_0100;
        const REVERSE_FLOW       = 0b0000_1000;
        const SHORT_FLOW         = 0b0001_0000;
        const BGP_ROUTER_SERVICE = 0b0010_0000;
        const NAT_FLOW           = 0b0100_0000;
        const ACTION_LOG         = 0b1000_0000;
    }
}

/// An ACL matched by a flow, with the ACEs that matched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchAcl {
    pub acl: AclId,
    pub ace_ids: Vec<AceId>,
}

/// A route looked up in a VRF with a given prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRef {
    pub vrf: VrfId,
    pub plen: u8,
}

/// The route lookups performed when the flow was set up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowRoutes {
    pub source: Option<RouteRef>,
    pub dest: Option<RouteRef>,
    pub acl_assigned_vrf: Option<VrfId>,
    pub source_plen_map: BTreeMap<VrfId, u8>,
    pub dest_plen_map: BTreeMap<VrfId, u8>,
    pub src_policy: Option<RouteRef>,
    pub dst_policy: Option<RouteRef>,
    pub rpf: Option<RouteRef>,
}

/// Snapshot of a flow entry, taken when the flow is added or changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowEntry {
    pub id: FlowId,
    pub key: FlowKey,
    pub flags: FlowFlags,
    pub interface: Option<InterfaceId>,
    pub vmi_uuid: Option<Uuid>,
    pub vn: Option<VnId>,
    pub rpf_nh: Option<NhId>,
    pub in_vm: Option<VmId>,
    pub out_vm: Option<VmId>,
    pub acls: Vec<MatchAcl>,
    pub routes: FlowRoutes,
    pub smac: Mac,
    pub dmac: Mac,
    pub bgp_as_a_service_sport: u16,
    pub reverse: Option<FlowKey>,
}

impl FlowEntry {
    #[must_use]
    pub fn new(id: FlowId, key: FlowKey) -> Self {
        Self {
            id,
            key,
            flags: FlowFlags::L3_FLOW,
            ..Default::default()
        }
    }
    #[must_use]
    pub fn is_l3(&self) -> bool {
        self.flags.contains(FlowFlags::L3_FLOW)
    }
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.flags.contains(FlowFlags::LOCAL_FLOW)
    }
    #[must_use]
    pub fn is_ingress(&self) -> bool {
        self.flags.contains(FlowFlags::INGRESS_DIR)
    }
    #[must_use]
    pub fn is_reverse(&self) -> bool {
        self.flags.contains(FlowFlags::REVERSE_FLOW)
    }
}

/// Lookups into the operational database. Implementations must answer from
/// the current state of the database.
pub trait OperDb: Send + Sync {
    /// Whether the VRF exists and is not being deleted
    fn vrf_exists(&self, vrf: VrfId) -> bool;
    /// Longest prefix match of `addr` in the unicast table of `vrf`
    fn uc_route(&self, vrf: VrfId, addr: IpAddr) -> Option<(IpAddr, u8)>;
    /// Index of the control node with the given address
    fn controller_index(&self, addr: IpAddr) -> Option<u8>;
}
