// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The flow management task. It owns the flow management trees: every change
//! to them arrives as a request on its queue and is processed in order.

use flow_mgmt::key::VrfId;
use flow_mgmt::{FlowEvent, FlowMgmtManager, FlowMgmtRequest, OperDb};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace};

use crate::errors::AgentError;
use crate::task::{TaskGate, TaskId};

const NAME: &str = "flow-mgmt";

pub enum FlowMgmtMsg {
    Request(FlowMgmtRequest),
    HasVrfFlows(VrfId, oneshot::Sender<bool>),
    HasVrf(VrfId, oneshot::Sender<bool>),
    FlowCount(oneshot::Sender<usize>),
    Shutdown,
}

/// Sends requests to the flow management task
#[derive(Clone)]
pub struct FlowMgmtSender(mpsc::Sender<FlowMgmtMsg>);

impl From<mpsc::Sender<FlowMgmtMsg>> for FlowMgmtSender {
    fn from(sender: mpsc::Sender<FlowMgmtMsg>) -> Self {
        Self(sender)
    }
}

impl FlowMgmtSender {
    async fn send(&self, msg: FlowMgmtMsg) -> Result<(), AgentError> {
        self.0
            .send(msg)
            .await
            .map_err(|_| AgentError::ChannelClosed(NAME))
    }

    pub async fn request(&self, request: FlowMgmtRequest) -> Result<(), AgentError> {
        self.send(FlowMgmtMsg::Request(request)).await
    }

    pub async fn has_vrf_flows(&self, vrf: VrfId) -> Result<bool, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(FlowMgmtMsg::HasVrfFlows(vrf, reply_tx)).await?;
        reply_rx.await.map_err(|_| AgentError::ChannelClosed(NAME))
    }

    /// Whether flow management still tracks the VRF, i.e. it was added and
    /// not released yet
    pub async fn has_vrf(&self, vrf: VrfId) -> Result<bool, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(FlowMgmtMsg::HasVrf(vrf, reply_tx)).await?;
        reply_rx.await.map_err(|_| AgentError::ChannelClosed(NAME))
    }

    pub async fn flow_count(&self) -> Result<usize, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(FlowMgmtMsg::FlowCount(reply_tx)).await?;
        reply_rx.await.map_err(|_| AgentError::ChannelClosed(NAME))
    }

    pub async fn shutdown(&self) -> Result<(), AgentError> {
        self.send(FlowMgmtMsg::Shutdown).await
    }
}

pub struct FlowMgmtTask {
    manager: FlowMgmtManager,
    requests: mpsc::Receiver<FlowMgmtMsg>,
    events: mpsc::UnboundedSender<FlowEvent>,
    gate: Arc<TaskGate>,
}

impl FlowMgmtTask {
    const CHANNEL_CAPACITY: usize = 1024;

    /// Create the task and the sender of its requests. The events produced by
    /// flow management go to `events`.
    #[must_use]
    pub fn new(
        db: Arc<dyn OperDb>,
        gate: Arc<TaskGate>,
        events: mpsc::UnboundedSender<FlowEvent>,
    ) -> (Self, FlowMgmtSender) {
        let (tx, rx) = mpsc::channel(Self::CHANNEL_CAPACITY);
        let task = Self {
            manager: FlowMgmtManager::new(db),
            requests: rx,
            events,
            gate,
        };
        (task, FlowMgmtSender(tx))
    }

    async fn process(&mut self, request: FlowMgmtRequest) {
        let events = {
            let _guard = self.gate.enter(TaskId::FlowMgmt).await;
            trace!("Processing {request:?}");
            self.manager.process(request);
            self.manager.take_events()
        };
        for event in events {
            if self.events.send(event).is_err() {
                error!("Flow event receiver is gone, dropping events");
                return;
            }
        }
    }

    /// Serve requests until shut down or until every sender is gone
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run(mut self) {
        info!("Flow management task started");
        while let Some(msg) = self.requests.recv().await {
            match msg {
                FlowMgmtMsg::Request(request) => self.process(request).await,
                FlowMgmtMsg::HasVrfFlows(vrf, reply) => {
                    if reply.send(self.manager.has_vrf_flows(vrf)).is_err() {
                        debug!("Requester of vrf {vrf} flows went away");
                    }
                }
                FlowMgmtMsg::HasVrf(vrf, reply) => {
                    let _ = reply.send(self.manager.vrf_tree().find(vrf).is_some());
                }
                FlowMgmtMsg::FlowCount(reply) => {
                    let _ = reply.send(self.manager.flow_count());
                }
                FlowMgmtMsg::Shutdown => {
                    info!("Flow management task shutting down");
                    return;
                }
            }
        }
        info!("All flow management senders are closed");
    }
}
