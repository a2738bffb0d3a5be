// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Keys identifying the objects a flow depends on.

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

use crate::errors::FlowMgmtError;

/// Index of a VRF
pub type VrfId = u32;

macro_rules! object_id {
    ($name:ident, $label:literal) => {
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($label, "-{}"), self.0)
            }
        }
    };
}

object_id!(AclId, "acl");
object_id!(AceId, "ace");
object_id!(VnId, "vn");
object_id!(InterfaceId, "intf");
object_id!(NhId, "nh");
object_id!(VmId, "vm");

/// An ethernet MAC address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub const ZERO: Mac = Mac([0; 6]);
}

impl Display for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// An inet route: the prefix address is always stored with its host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InetRouteKey {
    vrf: VrfId,
    addr: IpAddr,
    plen: u8,
}

impl InetRouteKey {
    /// Build the key of the route `addr/plen` in `vrf`. Host bits of `addr` are masked.
    ///
    /// # Errors
    /// Fails if `plen` exceeds the length of the address family.
    pub fn new(vrf: VrfId, addr: IpAddr, plen: u8) -> Result<Self, FlowMgmtError> {
        let addr = match addr {
            IpAddr::V4(a) => IpAddr::V4(
                Ipv4Net::new(a, plen)
                    .map_err(|_| FlowMgmtError::InvalidPrefixLength(plen, 32))?
                    .network(),
            ),
            IpAddr::V6(a) => IpAddr::V6(
                Ipv6Net::new(a, plen)
                    .map_err(|_| FlowMgmtError::InvalidPrefixLength(plen, 128))?
                    .network(),
            ),
        };
        Ok(Self { vrf, addr, plen })
    }
    /// The default route of the given family in `vrf`
    #[must_use]
    pub fn default_route(vrf: VrfId, ipv4: bool) -> Self {
        let addr = if ipv4 {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        Self { vrf, addr, plen: 0 }
    }
    #[must_use]
    pub fn vrf(&self) -> VrfId {
        self.vrf
    }
    #[must_use]
    pub fn addr(&self) -> IpAddr {
        self.addr
    }
    #[must_use]
    pub fn plen(&self) -> u8 {
        self.plen
    }
    #[must_use]
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }
    /// The key one prefix length shorter, i.e. where a covering route lookup starts.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let plen = self.plen.checked_sub(1)?;
        Self::new(self.vrf, self.addr, plen).ok()
    }
}

impl Display for InetRouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vrf {} {}/{}", self.vrf, self.addr, self.plen)
    }
}

/// A bridge (L2) route
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BridgeRouteKey {
    pub vrf: VrfId,
    pub mac: Mac,
}

/// A BGP-as-a-service session, as seen by the flows towards one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BgpAsAServiceKey {
    pub vmi: Uuid,
    pub sport: u16,
    pub cn_index: u8,
}

/// Identifies one object that flows can depend on. Keys order by kind first,
/// then by the fields of the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FlowMgmtKey {
    Interface(InterfaceId),
    Acl(AclId),
    Vn(VnId),
    Vm(VmId),
    InetRoute(InetRouteKey),
    BridgeRoute(BridgeRouteKey),
    Nh(NhId),
    Vrf(VrfId),
    BgpAsAService(BgpAsAServiceKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FlowMgmtKeyKind {
    Interface,
    Acl,
    Vn,
    Vm,
    Inet4Route,
    Inet6Route,
    BridgeRoute,
    Nh,
    Vrf,
    BgpAsAService,
}

impl FlowMgmtKey {
    #[must_use]
    pub fn kind(&self) -> FlowMgmtKeyKind {
        match self {
            FlowMgmtKey::Interface(_) => FlowMgmtKeyKind::Interface,
            FlowMgmtKey::Acl(_) => FlowMgmtKeyKind::Acl,
            FlowMgmtKey::Vn(_) => FlowMgmtKeyKind::Vn,
            FlowMgmtKey::Vm(_) => FlowMgmtKeyKind::Vm,
            FlowMgmtKey::InetRoute(k) if k.is_ipv4() => FlowMgmtKeyKind::Inet4Route,
            FlowMgmtKey::InetRoute(_) => FlowMgmtKeyKind::Inet6Route,
            FlowMgmtKey::BridgeRoute(_) => FlowMgmtKeyKind::BridgeRoute,
            FlowMgmtKey::Nh(_) => FlowMgmtKeyKind::Nh,
            FlowMgmtKey::Vrf(_) => FlowMgmtKeyKind::Vrf,
            FlowMgmtKey::BgpAsAService(_) => FlowMgmtKeyKind::BgpAsAService,
        }
    }

    /// The VRF a route key lives in
    #[must_use]
    pub fn route_vrf(&self) -> Option<VrfId> {
        match self {
            FlowMgmtKey::InetRoute(k) => Some(k.vrf()),
            FlowMgmtKey::BridgeRoute(k) => Some(k.vrf),
            _ => None,
        }
    }

    /// Whether the owner of the object must be told once flow management
    /// holds no more state for it.
    #[must_use]
    pub(crate) fn frees_db_entry(&self) -> bool {
        !matches!(self, FlowMgmtKey::Vm(_) | FlowMgmtKey::BgpAsAService(_))
    }
}

impl Display for FlowMgmtKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowMgmtKey::Interface(id) => write!(f, "{id}"),
            FlowMgmtKey::Acl(id) => write!(f, "{id}"),
            FlowMgmtKey::Vn(id) => write!(f, "{id}"),
            FlowMgmtKey::Vm(id) => write!(f, "{id}"),
            FlowMgmtKey::InetRoute(k) => write!(f, "inet route {k}"),
            FlowMgmtKey::BridgeRoute(k) => write!(f, "bridge route vrf {} {}", k.vrf, k.mac),
            FlowMgmtKey::Nh(id) => write!(f, "{id}"),
            FlowMgmtKey::Vrf(vrf) => write!(f, "vrf-{vrf}"),
            FlowMgmtKey::BgpAsAService(k) => {
                write!(f, "bgpaas {}:{} cn {}", k.vmi, k.sport, k.cn_index)
            }
        }
    }
}

/// State carried by the edge between one flow and one key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowMgmtKeyNode {
    /// ACE ids of an ACL matched by the flow
    pub ace_ids: Vec<AceId>,
}

/// The set of keys a flow depends on
pub type FlowMgmtKeyTree = BTreeMap<FlowMgmtKey, FlowMgmtKeyNode>;
