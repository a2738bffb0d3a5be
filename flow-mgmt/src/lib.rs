// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow management: tracks which flows depend on which configuration and
//! forwarding objects, and turns object changes into per-flow actions.

#![deny(clippy::all)]

pub mod entry;
pub mod errors;
pub mod event;
pub mod flow;
pub mod key;
pub mod manager;
pub mod request;
pub mod tree;

pub use entry::{FlowMgmtEntry, OperState, VnFlowCounters};
pub use errors::FlowMgmtError;
pub use event::{FlowAction, FlowEvent};
pub use flow::{FlowEntry, FlowFlags, FlowId, FlowKey, OperDb};
pub use key::{FlowMgmtKey, FlowMgmtKeyKind, FlowMgmtKeyNode};
pub use manager::FlowMgmtManager;
pub use request::{DbOperation, FlowMgmtRequest, RouteTableType};

use tracectl::trace_target;
trace_target!("flow-mgmt", LevelFilter::INFO, &["flow"]);
