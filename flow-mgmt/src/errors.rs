// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Errors of flow management

use thiserror::Error;

use crate::flow::FlowId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FlowMgmtError {
    #[error("Invalid prefix length {0} (max is {1})")]
    InvalidPrefixLength(u8, u8),
    #[error("Unknown flow {0}")]
    UnknownFlow(FlowId),
}
