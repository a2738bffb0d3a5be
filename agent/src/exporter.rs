// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::errors::AgentError;

/// Install the prometheus recorder with its HTTP listener on `addr`. Must be
/// called from within the runtime.
pub fn start_metrics_exporter(addr: SocketAddr) -> Result<(), AgentError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| AgentError::Metrics(e.to_string()))?;
    flow_stats::describe_metrics();
    crate::flow_handler::describe_metrics();
    info!("Metrics available at http://{addr}/metrics");
    Ok(())
}
