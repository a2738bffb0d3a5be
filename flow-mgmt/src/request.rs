// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Requests processed by flow management

use std::sync::Arc;
use uuid::Uuid;

use crate::event::FlowAction;
use crate::flow::{FlowEntry, FlowId};
use crate::key::{BgpAsAServiceKey, FlowMgmtKey, VrfId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DbOperation {
    Add,
    Change,
    Delete,
    /// Delete decided by flow management itself, with no database notification
    Implicit,
}

/// The route tables of a VRF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum RouteTableType {
    Inet4,
    Inet6,
    Bridge,
}

impl RouteTableType {
    pub(crate) fn index(self) -> usize {
        match self {
            RouteTableType::Inet4 => 0,
            RouteTableType::Inet6 => 1,
            RouteTableType::Bridge => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FlowMgmtRequest {
    /// A flow was added or changed
    AddFlow(Arc<FlowEntry>),
    DeleteFlow(FlowId),
    /// A database object was added, changed or deleted
    DbEntry {
        op: DbOperation,
        key: FlowMgmtKey,
        gen_id: u32,
        nh_changed: bool,
    },
    RouteTableDeleted {
        vrf: VrfId,
        table: RouteTableType,
    },
    RetryDeleteVrf(VrfId),
    BgpAsAServiceHealthCheck {
        key: BgpAsAServiceKey,
        health_check: Option<Uuid>,
    },
    DeleteBgpAsAService(BgpAsAServiceKey),
    DeleteAllBgpAsAService,
}

impl FlowMgmtRequest {
    #[must_use]
    pub fn add(key: FlowMgmtKey, gen_id: u32) -> Self {
        Self::db(DbOperation::Add, key, gen_id)
    }
    #[must_use]
    pub fn change(key: FlowMgmtKey, gen_id: u32) -> Self {
        Self::db(DbOperation::Change, key, gen_id)
    }
    #[must_use]
    pub fn delete(key: FlowMgmtKey, gen_id: u32) -> Self {
        Self::db(DbOperation::Delete, key, gen_id)
    }
    #[must_use]
    pub fn nh_change(key: FlowMgmtKey, gen_id: u32) -> Self {
        FlowMgmtRequest::DbEntry {
            op: DbOperation::Change,
            key,
            gen_id,
            nh_changed: true,
        }
    }
    fn db(op: DbOperation, key: FlowMgmtKey, gen_id: u32) -> Self {
        FlowMgmtRequest::DbEntry {
            op,
            key,
            gen_id,
            nh_changed: false,
        }
    }
}

/// The action applied to every flow of `key` for a database operation, if any.
#[must_use]
pub fn flow_action(op: DbOperation, key: &FlowMgmtKey) -> Option<FlowAction> {
    match (key, op) {
        (FlowMgmtKey::Vrf(_) | FlowMgmtKey::Vm(_) | FlowMgmtKey::BgpAsAService(_), _) => None,
        (FlowMgmtKey::InetRoute(_), DbOperation::Change) => Some(FlowAction::RevaluateRoute),
        (FlowMgmtKey::InetRoute(_) | FlowMgmtKey::BridgeRoute(_), _) => {
            Some(FlowAction::Revaluate)
        }
        (_, DbOperation::Add | DbOperation::Change) => Some(FlowAction::Revaluate),
        (_, DbOperation::Delete | DbOperation::Implicit) => Some(FlowAction::Delete),
    }
}
