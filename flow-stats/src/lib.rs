// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow aging and flow export. Flows are spread over aging tables keyed by
//! protocol and port; each table runs one or more collectors that age idle
//! flows out and export flow records, subject to a shared export budget.

#![deny(clippy::all)]

pub mod collector;
pub mod config;
pub mod counters;
pub mod errors;
pub mod export;
pub mod index;
pub mod key;
pub mod manager;
pub mod threshold;

pub use collector::{FlowDeleteRequest, FlowExportInfo, FlowStatsCollector, RevFlowDepParams};
pub use config::{FlowStatsConfig, FlowStatsConfigBuilder};
pub use counters::{KernelFlowSource, KernelFlowStats, TcpFlags};
pub use errors::FlowStatsError;
pub use export::{ExportControl, ExportSink, FlowExportStats, FlowLogRecord, TracingSink};
pub use key::FlowAgingTableKey;
pub use manager::{AgingTableInfo, AgingTableOp, FlowStatsManager, describe_metrics};
pub use threshold::ThresholdControl;

use tracectl::trace_target;
trace_target!("flow-stats", LevelFilter::INFO, &["flow", "stats"]);
