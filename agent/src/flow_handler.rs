// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The agent's view of the flow table. Flows set up by the forwarding plane
//! are registered here, then handed to flow management and to the stats task.
//! Deletes asked by flow management or by aging are applied here and
//! propagated the same way.

use flow_mgmt::{FlowAction, FlowEntry, FlowEvent, FlowId, FlowKey, FlowMgmtRequest};
use flow_stats::{FlowDeleteRequest, FlowExportInfo, RevFlowDepParams};
use hashbrown::HashMap;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::AgentError;
use crate::flow_mgmt_task::FlowMgmtSender;
use crate::kernel::KernelFlowTable;
use crate::stats_task::StatsSender;
use crate::task::{TaskGate, TaskId};

pub const METRIC_FLOW_EVENTS: &str = "vrouter_flow_mgmt_events";
pub const METRIC_FLOWS_AGED: &str = "vrouter_flows_aged";
pub const METRIC_FLOWS: &str = "vrouter_flows";

const NAME: &str = "flow-handler";

pub fn describe_metrics() {
    describe_counter!(METRIC_FLOW_EVENTS, "Events produced by flow management");
    describe_counter!(METRIC_FLOWS_AGED, "Flows deleted by aging");
    describe_gauge!(METRIC_FLOWS, "Flows in the flow table");
}

fn event_kind(event: &FlowEvent) -> &'static str {
    match event {
        FlowEvent::Flow { .. } => "flow",
        FlowEvent::FreeDbEntry { .. } => "free-db-entry",
        FlowEvent::DeleteObjectVrf { .. } => "delete-vrf",
        FlowEvent::FreeFlowRef { .. } => "free-flow-ref",
        FlowEvent::BgpAsAServiceNotify { .. } => "bgp-as-a-service",
    }
}

pub enum FlowTableMsg {
    Add {
        flow: Arc<FlowEntry>,
        handle: Option<u32>,
    },
    /// Delete a flow and its reverse
    Delete(FlowKey),
}

/// Sends flows set up or torn down by the forwarding plane
#[derive(Clone)]
pub struct FlowTableSender(mpsc::Sender<FlowTableMsg>);

impl FlowTableSender {
    async fn send(&self, msg: FlowTableMsg) -> Result<(), AgentError> {
        self.0
            .send(msg)
            .await
            .map_err(|_| AgentError::ChannelClosed(NAME))
    }

    /// Add or update a flow. `handle` is its index in the kernel flow table.
    pub async fn add_flow(&self, flow: FlowEntry, handle: Option<u32>) -> Result<(), AgentError> {
        self.send(FlowTableMsg::Add {
            flow: Arc::new(flow),
            handle,
        })
        .await
    }

    pub async fn delete_flow(&self, key: FlowKey) -> Result<(), AgentError> {
        self.send(FlowTableMsg::Delete(key)).await
    }
}

struct FlowRecord {
    flow: Arc<FlowEntry>,
    uuid: Uuid,
    handle: Option<u32>,
}

pub struct FlowHandler {
    requests: mpsc::Receiver<FlowTableMsg>,
    events: mpsc::UnboundedReceiver<FlowEvent>,
    deletes: mpsc::UnboundedReceiver<FlowDeleteRequest>,
    flow_mgmt: FlowMgmtSender,
    stats: StatsSender,
    kernel: KernelFlowTable,
    gate: Arc<TaskGate>,
    flows: HashMap<FlowKey, FlowRecord>,
    ids: HashMap<FlowId, FlowKey>,
    start: Instant,
}

impl FlowHandler {
    const CHANNEL_CAPACITY: usize = 1024;

    /// Create the handler and the sender of the flows to track. Flow
    /// management `events` and aging `deletes` are applied as they come.
    #[must_use]
    pub fn new(
        events: mpsc::UnboundedReceiver<FlowEvent>,
        deletes: mpsc::UnboundedReceiver<FlowDeleteRequest>,
        flow_mgmt: FlowMgmtSender,
        stats: StatsSender,
        kernel: KernelFlowTable,
        gate: Arc<TaskGate>,
    ) -> (Self, FlowTableSender) {
        let (tx, rx) = mpsc::channel(Self::CHANNEL_CAPACITY);
        let handler = Self {
            requests: rx,
            events,
            deletes,
            flow_mgmt,
            stats,
            kernel,
            gate,
            flows: HashMap::new(),
            ids: HashMap::new(),
            start: Instant::now(),
        };
        (handler, FlowTableSender(tx))
    }

    fn now(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn export_info(flow: &FlowEntry, uuid: Uuid, handle: Option<u32>, now: u64) -> FlowExportInfo {
        let mut info = FlowExportInfo::new(uuid, now);
        info.flags = flow.flags;
        info.reverse = flow.reverse;
        info.flow_handle = handle;
        info.interface = flow.vmi_uuid;
        info
    }

    async fn add(&mut self, flow: Arc<FlowEntry>, handle: Option<u32>) -> Result<(), AgentError> {
        let now = self.now();
        let new_info = {
            let _guard = self.gate.enter(TaskId::FlowHandler).await;
            let known = self.flows.get(&flow.key).map(|r| (r.uuid, r.flow.id, r.handle));
            if let Some((_, old_id, _)) = known
                && old_id != flow.id
            {
                self.ids.remove(&old_id);
            }
            let uuid = known.map_or_else(Uuid::new_v4, |(uuid, _, _)| uuid);
            self.ids.insert(flow.id, flow.key);
            self.flows.insert(
                flow.key,
                FlowRecord {
                    flow: flow.clone(),
                    uuid,
                    handle: handle.or(known.and_then(|(_, _, handle)| handle)),
                },
            );
            #[allow(clippy::cast_precision_loss)]
            gauge!(METRIC_FLOWS).set(self.flows.len() as f64);
            known
                .is_none()
                .then(|| Self::export_info(&flow, uuid, handle, now))
        };
        debug!("Tracking flow {} ({})", flow.id, flow.key);
        let key = flow.key;
        self.flow_mgmt
            .request(FlowMgmtRequest::AddFlow(flow))
            .await?;
        match (new_info, handle) {
            (Some(info), _) => self.stats.add_flow(key, info).await,
            (None, Some(index)) => self.stats.update_flow_index(key, index).await,
            (None, None) => Ok(()),
        }
    }

    /// Delete a flow, with its reverse if `rev`
    async fn delete(&mut self, key: FlowKey, rev: bool) -> Result<(), AgentError> {
        let now = self.now();
        let removed = {
            let _guard = self.gate.enter(TaskId::FlowHandler).await;
            let Some(record) = self.flows.remove(&key) else {
                debug!("Flow {key} is already gone");
                return Ok(());
            };
            let reverse = record
                .flow
                .reverse
                .filter(|_| rev)
                .and_then(|rkey| self.flows.remove(&rkey));
            let mut removed = vec![record];
            removed.extend(reverse);
            for record in &removed {
                self.ids.remove(&record.flow.id);
                if let Some(handle) = record.handle {
                    self.kernel.remove(handle);
                }
            }
            #[allow(clippy::cast_precision_loss)]
            gauge!(METRIC_FLOWS).set(self.flows.len() as f64);
            removed
        };

        // each direction tells the stats task about the other one
        let params: Vec<_> = removed
            .iter()
            .map(|r| RevFlowDepParams {
                key: r.flow.key,
                uuid: r.uuid,
            })
            .collect();
        for (n, record) in removed.iter().enumerate() {
            debug!("Deleting flow {} ({})", record.flow.id, record.flow.key);
            self.flow_mgmt
                .request(FlowMgmtRequest::DeleteFlow(record.flow.id))
                .await?;
            let other = match params.as_slice() {
                [first, second] => Some(if n == 0 { *second } else { *first }),
                _ => None,
            };
            self.stats.delete_flow(record.flow.key, now, other).await?;
        }
        Ok(())
    }

    async fn on_event(&mut self, event: FlowEvent) -> Result<(), AgentError> {
        counter!(METRIC_FLOW_EVENTS, "kind" => event_kind(&event)).increment(1);
        match event {
            FlowEvent::Flow {
                action: FlowAction::Delete,
                flow,
                key,
            } => {
                debug!("Flow {flow} lost its dependency on {key}");
                let flow_key = self.ids.get(&flow).copied();
                match flow_key {
                    Some(flow_key) => self.delete(flow_key, true).await?,
                    None => debug!("Flow {flow} is already gone"),
                }
            }
            FlowEvent::Flow { action, flow, key } => debug!("{action} flow {flow} ({key})"),
            FlowEvent::DeleteObjectVrf { vrf, gen_id } => {
                info!("Vrf {vrf} (gen {gen_id}) is free of flows");
            }
            other => debug!("{other:?}"),
        }
        Ok(())
    }

    async fn on_aged(&mut self, delete: FlowDeleteRequest) -> Result<(), AgentError> {
        counter!(METRIC_FLOWS_AGED).increment(1);
        debug!("Flow {} aged", delete.key);
        self.delete(delete.key, delete.rev).await
    }

    /// Serve the flow table until the flow table sender and the flow management
    /// and stats tasks are all gone
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run(mut self) {
        info!("Flow handler started");
        let (mut requests_open, mut events_open, mut deletes_open) = (true, true, true);
        while requests_open || events_open || deletes_open {
            let result = tokio::select! {
                msg = self.requests.recv(), if requests_open => match msg {
                    Some(FlowTableMsg::Add { flow, handle }) => self.add(flow, handle).await,
                    Some(FlowTableMsg::Delete(key)) => self.delete(key, true).await,
                    None => {
                        requests_open = false;
                        Ok(())
                    }
                },
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        events_open = false;
                        Ok(())
                    }
                },
                delete = self.deletes.recv(), if deletes_open => match delete {
                    Some(delete) => self.on_aged(delete).await,
                    None => {
                        deletes_open = false;
                        Ok(())
                    }
                },
            };
            if let Err(e) = result {
                warn!("Flow table update not propagated: {e}");
            }
        }
        info!("Flow handler done");
    }
}
