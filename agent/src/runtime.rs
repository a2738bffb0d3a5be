// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Start and stop of the agent tasks

use flow_stats::{ExportSink, FlowStatsConfig, FlowStatsManager};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::db_table::DbTable;
use crate::errors::AgentError;
use crate::flow_handler::{FlowHandler, FlowTableSender};
use crate::flow_mgmt_task::{FlowMgmtSender, FlowMgmtTask};
use crate::kernel::KernelFlowTable;
use crate::oper_db::InMemoryOperDb;
use crate::stats_task::{StatsSender, StatsTask};
use crate::task::TaskGate;

/// The running agent: handles to its tasks and to the database writer
pub struct Agent {
    pub flow_table: FlowTableSender,
    pub flow_mgmt: FlowMgmtSender,
    pub stats: StatsSender,
    pub db: DbTable,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Agent {
    /// Spawn the flow management, flow stats and flow table tasks. Must be
    /// called from within the runtime.
    pub fn start(
        config: FlowStatsConfig,
        sink: Box<dyn ExportSink>,
        kernel: KernelFlowTable,
    ) -> Result<Self, AgentError> {
        let gate = TaskGate::new();
        let db = Arc::new(InMemoryOperDb::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (deletes_tx, deletes_rx) = mpsc::unbounded_channel();

        let manager = FlowStatsManager::new(config, sink, Box::new(kernel.clone()))?;
        let (stats_task, stats) = StatsTask::new(manager, gate.clone(), deletes_tx);
        let (flow_mgmt_task, flow_mgmt) = FlowMgmtTask::new(db.clone(), gate.clone(), events_tx);
        let (handler, flow_table) = FlowHandler::new(
            events_rx,
            deletes_rx,
            flow_mgmt.clone(),
            stats.clone(),
            kernel,
            gate.clone(),
        );
        let db = DbTable::new(db, flow_mgmt.clone(), gate);

        let tasks = vec![
            ("flow-mgmt", tokio::spawn(flow_mgmt_task.run())),
            ("stats-collector", tokio::spawn(stats_task.run())),
            ("flow-handler", tokio::spawn(handler.run())),
        ];
        info!("Agent tasks started");
        Ok(Self {
            flow_table,
            flow_mgmt,
            stats,
            db,
            tasks,
        })
    }

    /// Stop the tasks and wait for them to finish
    pub async fn shutdown(self) -> Result<(), AgentError> {
        let Self {
            flow_table,
            flow_mgmt,
            stats,
            db,
            tasks,
        } = self;
        drop(flow_table);
        drop(db);
        flow_mgmt.shutdown().await?;
        stats.shutdown().await?;
        for (name, task) in tasks {
            task.await
                .map_err(|e| AgentError::Runtime(format!("{name} task failed: {e}")))?;
        }
        info!("Agent tasks stopped");
        Ok(())
    }
}
