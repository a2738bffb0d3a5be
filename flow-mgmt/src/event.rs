// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Events produced by flow management for the flow table and for the owners
//! of the database objects.

use uuid::Uuid;

use crate::flow::FlowId;
use crate::key::{FlowMgmtKey, VrfId};

/// What the flow table must do with one flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FlowAction {
    /// Re-evaluate the flow against the current state of the object
    Revaluate,
    /// A route changed in place: re-evaluate the route dependent fields
    RevaluateRoute,
    /// The object is gone: delete the flow
    Delete,
    /// A more specific route covering the flow was added
    Recompute,
    /// The next-hop of the route changed
    ResolveNh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// Per-flow action, caused by a change on `key`
    Flow {
        action: FlowAction,
        flow: FlowId,
        key: FlowMgmtKey,
    },
    /// Flow management holds no more state for the object
    FreeDbEntry { key: FlowMgmtKey, gen_id: u32 },
    /// The VRF can be deleted: no flow refers to it any more
    DeleteObjectVrf { vrf: VrfId, gen_id: u32 },
    /// Flow management released its reference to the flow
    FreeFlowRef { flow: FlowId },
    /// A BGP-as-a-service session must be reconsidered by its owner
    BgpAsAServiceNotify { vmi: Uuid, sport: u16 },
}

impl FlowEvent {
    #[must_use]
    pub fn flow(action: FlowAction, flow: FlowId, key: FlowMgmtKey) -> Self {
        FlowEvent::Flow { action, flow, key }
    }
    /// The event telling the owner of `key` that its object may be released, if any.
    #[must_use]
    pub fn free_notify(key: FlowMgmtKey, gen_id: u32) -> Option<Self> {
        match key {
            FlowMgmtKey::Vrf(vrf) => Some(FlowEvent::DeleteObjectVrf { vrf, gen_id }),
            key if key.frees_db_entry() => Some(FlowEvent::FreeDbEntry { key, gen_id }),
            _ => None,
        }
    }
}
