// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The flow stats task: owns the aging tables, ages and exports flows on the
//! collectors' timers and adjusts the export threshold on its own timer.

use flow_mgmt::FlowKey;
use flow_stats::{
    AgingTableInfo, AgingTableOp, FlowAgingTableKey, FlowDeleteRequest, FlowExportInfo,
    FlowStatsError, FlowStatsManager, RevFlowDepParams,
};
use kanal::{AsyncReceiver, AsyncSender, ReceiveError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::errors::AgentError;
use crate::task::{TaskGate, TaskId};

const NAME: &str = "stats-collector";

type AgingTableReply = oneshot::Sender<Result<AgingTableInfo, FlowStatsError>>;

pub enum StatsMsg {
    AddFlow {
        key: FlowKey,
        info: Box<FlowExportInfo>,
    },
    DeleteFlow {
        key: FlowKey,
        time: u64,
        rev: Option<RevFlowDepParams>,
    },
    UpdateFlowIndex {
        key: FlowKey,
        index: u32,
    },
    AddAgingTable {
        key: FlowAgingTableKey,
        interval: u64,
        cache_timeout: u64,
    },
    AgingTable {
        proto: u8,
        port: u16,
        op: AgingTableOp,
        reply: AgingTableReply,
    },
    SetExportRate(u32),
    Shutdown,
}

/// Sends flow events and requests to the flow stats task
#[derive(Clone)]
pub struct StatsSender(AsyncSender<StatsMsg>);

impl From<AsyncSender<StatsMsg>> for StatsSender {
    fn from(sender: AsyncSender<StatsMsg>) -> Self {
        Self(sender)
    }
}

impl StatsSender {
    async fn send(&self, msg: StatsMsg) -> Result<(), AgentError> {
        self.0
            .send(msg)
            .await
            .map_err(|_| AgentError::ChannelClosed(NAME))
    }

    pub async fn add_flow(&self, key: FlowKey, info: FlowExportInfo) -> Result<(), AgentError> {
        self.send(StatsMsg::AddFlow {
            key,
            info: Box::new(info),
        })
        .await
    }

    pub async fn delete_flow(
        &self,
        key: FlowKey,
        time: u64,
        rev: Option<RevFlowDepParams>,
    ) -> Result<(), AgentError> {
        self.send(StatsMsg::DeleteFlow { key, time, rev }).await
    }

    pub async fn update_flow_index(&self, key: FlowKey, index: u32) -> Result<(), AgentError> {
        self.send(StatsMsg::UpdateFlowIndex { key, index }).await
    }

    pub async fn add_aging_table(
        &self,
        key: FlowAgingTableKey,
        interval: u64,
        cache_timeout: u64,
    ) -> Result<(), AgentError> {
        self.send(StatsMsg::AddAgingTable {
            key,
            interval,
            cache_timeout,
        })
        .await
    }

    /// Query, reconfigure or delete an aging table
    pub async fn aging_table(
        &self,
        proto: u8,
        port: u16,
        op: AgingTableOp,
    ) -> Result<AgingTableInfo, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(StatsMsg::AgingTable {
            proto,
            port,
            op,
            reply: reply_tx,
        })
        .await?;
        let reply = reply_rx
            .await
            .map_err(|_| AgentError::ChannelClosed(NAME))?;
        Ok(reply?)
    }

    pub async fn set_export_rate(&self, rate: u32) -> Result<(), AgentError> {
        self.send(StatsMsg::SetExportRate(rate)).await
    }

    pub async fn shutdown(&self) -> Result<(), AgentError> {
        self.send(StatsMsg::Shutdown).await
    }
}

pub struct StatsTask {
    manager: FlowStatsManager,
    requests: AsyncReceiver<StatsMsg>,
    deletes: mpsc::UnboundedSender<FlowDeleteRequest>,
    gate: Arc<TaskGate>,
    start: Instant,
}

impl StatsTask {
    const CHANNEL_CAPACITY: usize = 4096;
    // timer deadline when no collector is due
    const IDLE_TICK: Duration = Duration::from_secs(1);

    /// Create the task and its sender. Flows to delete go to `deletes`.
    #[must_use]
    pub fn new(
        manager: FlowStatsManager,
        gate: Arc<TaskGate>,
        deletes: mpsc::UnboundedSender<FlowDeleteRequest>,
    ) -> (Self, StatsSender) {
        let (tx, rx) = kanal::bounded_async(Self::CHANNEL_CAPACITY);
        let task = Self {
            manager,
            requests: rx,
            deletes,
            gate,
            start: Instant::now(),
        };
        (task, StatsSender(tx))
    }

    /// Microseconds since the task was created
    fn now(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn aging_deadline(&self) -> Instant {
        match self.manager.next_run() {
            Some(next) => self.start + Duration::from_micros(next),
            None => Instant::now() + Self::IDLE_TICK,
        }
    }

    fn handle(&mut self, msg: StatsMsg) {
        let result = match msg {
            StatsMsg::AddFlow { key, info } => self.manager.add_event(key, *info),
            StatsMsg::DeleteFlow { key, time, rev } => self.manager.delete_event(key, time, rev),
            StatsMsg::UpdateFlowIndex { key, index } => {
                self.manager.update_flow_index_event(key, index)
            }
            StatsMsg::AddAgingTable {
                key,
                interval,
                cache_timeout,
            } => {
                self.manager.add(key, interval, cache_timeout);
                Ok(())
            }
            StatsMsg::AgingTable {
                proto,
                port,
                op,
                reply,
            } => {
                let result = self.manager.request_handler(proto, port, op);
                if reply.send(result).is_err() {
                    debug!("Aging table requester went away");
                }
                Ok(())
            }
            StatsMsg::SetExportRate(rate) => {
                self.manager.set_flow_export_rate(rate);
                Ok(())
            }
            StatsMsg::Shutdown => Ok(()),
        };
        if let Err(e) = result {
            warn!("Flow stats request failed: {e}");
        }
    }

    async fn age(&mut self) {
        let _guard = self.gate.enter(TaskId::StatsCollector).await;
        let now = self.now();
        for delete in self.manager.run_due(now) {
            trace!("Requesting delete of flow {}", delete.key);
            if self.deletes.send(delete).is_err() {
                error!("Flow delete receiver is gone");
                return;
            }
        }
    }

    async fn update_threshold(&mut self) {
        let _guard = self.gate.enter(TaskId::StatsCollector).await;
        let now = self.now();
        let threshold = self.manager.update_flow_threshold(now);
        trace!("Flow export threshold is {threshold}");
    }

    /// Serve requests and timers until shut down or until every sender is gone
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run(mut self) {
        info!("Flow stats task started");
        let period = self.manager.config().threshold_update_period();
        let mut threshold_timer = tokio::time::interval(period);
        threshold_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let deadline = self.aging_deadline();
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => self.age().await,
                _ = threshold_timer.tick() => self.update_threshold().await,
                msg = self.requests.recv() => {
                    match msg {
                        Ok(StatsMsg::Shutdown) => {
                            info!("Flow stats task shutting down");
                            return;
                        }
                        Ok(msg) => {
                            let _guard = self.gate.enter(TaskId::StatsCollector).await;
                            self.handle(msg);
                        }
                        Err(ReceiveError::Closed) => {
                            error!("flow stats receiver closed!");
                            panic!("flow stats receiver closed");
                        }
                        Err(ReceiveError::SendClosed) => {
                            info!("All flow stats senders are closed");
                            return;
                        }
                    }
                }
            }
        }
    }
}
