// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use flow_mgmt::FlowMgmtError;
use flow_stats::FlowStatsError;
use thiserror::Error;
use tracectl::TraceCtlError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Channel to {0} task is closed")]
    ChannelClosed(&'static str),
    #[error("Could not read configuration {path}: {source}")]
    ConfigRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    ConfigParse(#[from] serde_yaml_ng::Error),
    #[error(transparent)]
    FlowMgmt(#[from] FlowMgmtError),
    #[error(transparent)]
    FlowStats(#[from] FlowStatsError),
    #[error(transparent)]
    Tracing(#[from] TraceCtlError),
    #[error("Could not start metrics exporter: {0}")]
    Metrics(String),
    #[error("Runtime failure: {0}")]
    Runtime(String),
}
