// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Errors of flow aging and export

use thiserror::Error;

use crate::key::FlowAgingTableKey;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FlowStatsError {
    #[error("No aging table for {0}")]
    UnknownAgingTable(FlowAgingTableKey),
    #[error("The default aging table can't be deleted")]
    DefaultAgingTable,
    #[error("Request queue of collector {0} is closed")]
    QueueClosed(usize),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
