// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow stats manager: owns the aging tables, dispatches flow events to their
//! collectors and drives the export threshold.

use flow_mgmt::FlowKey;
use hashbrown::HashMap;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use serde::Serialize;
use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::collector::{
    CollectorCtx, CollectorRequest, FlowDeleteRequest, FlowExportInfo, FlowStatsCollector,
    RevFlowDepParams,
};
use crate::config::FlowStatsConfig;
use crate::counters::KernelFlowSource;
use crate::errors::FlowStatsError;
use crate::export::{self, ExportControl, ExportSink, FlowExportStats};
use crate::index::IndexVector;
use crate::key::FlowAgingTableKey;

pub const METRIC_FLOW_DISPATCH_DROPS: &str = "vrouter_flow_stats_dispatch_drops";
pub const METRIC_FLOWS: &str = "vrouter_flow_stats_flows";

/// Describe the flow stats metrics to the installed recorder
pub fn describe_metrics() {
    export::describe_metrics();
    describe_counter!(
        METRIC_FLOW_DISPATCH_DROPS,
        "Flow events dropped for lack of an aging table"
    );
    describe_gauge!(METRIC_FLOWS, "Flows tracked by the collectors");
}

/// The collectors of one aging table. A flow goes to one of them, picked by
/// hashing its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowStatsCollectorObject {
    key: FlowAgingTableKey,
    collectors: Vec<usize>,
}

impl FlowStatsCollectorObject {
    #[must_use]
    pub fn key(&self) -> FlowAgingTableKey {
        self.key
    }
    /// Indices of the collectors of the table
    #[must_use]
    pub fn collectors(&self) -> &[usize] {
        &self.collectors
    }
    fn collector_for(&self, flow: &FlowKey) -> Option<usize> {
        let mut hasher = DefaultHasher::new();
        flow.hash(&mut hasher);
        let n = u64::try_from(self.collectors.len()).ok().filter(|n| *n > 0)?;
        let slot = usize::try_from(hasher.finish() % n).ok()?;
        self.collectors.get(slot).copied()
    }
}

/// Operations on an aging table from the administrative interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgingTableOp {
    Query,
    Configure { interval: u64, cache_timeout: u64 },
    Delete,
}

/// Parameters and state of an aging table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgingTableInfo {
    pub key: FlowAgingTableKey,
    /// timer interval (ms)
    pub interval: u64,
    /// cache timeout (s)
    pub cache_timeout: u64,
    pub flow_count: usize,
    pub threshold: u32,
    pub collectors: usize,
}

/// Everything the collectors share
struct CollectorEnv {
    export: ExportControl,
    sink: Box<dyn ExportSink>,
    kernel: Box<dyn KernelFlowSource>,
    deletes: Vec<FlowDeleteRequest>,
    delete_short_flows: bool,
}

impl CollectorEnv {
    fn ctx(&mut self) -> CollectorCtx<'_> {
        CollectorCtx {
            export: &mut self.export,
            sink: self.sink.as_mut(),
            kernel: self.kernel.as_ref(),
            deletes: &mut self.deletes,
            delete_short_flows: self.delete_short_flows,
        }
    }
}

pub struct FlowStatsManager {
    config: FlowStatsConfig,
    collectors: IndexVector<FlowStatsCollector>,
    tables: BTreeMap<FlowAgingTableKey, FlowStatsCollectorObject>,
    // protocol-wide tables, by protocol
    protocol_list: Vec<Option<FlowStatsCollectorObject>>,
    // collector of every flow
    flow_index: HashMap<FlowKey, usize>,
    env: CollectorEnv,
    dispatch_drops: u64,
    last_threshold_update: Option<u64>,
}

impl FlowStatsManager {
    /// A manager with the default aging table, exporting to `sink` and reading
    /// flow counters from `kernel`
    pub fn new(
        config: FlowStatsConfig,
        sink: Box<dyn ExportSink>,
        kernel: Box<dyn KernelFlowSource>,
    ) -> Result<Self, FlowStatsError> {
        let export = ExportControl::new(&config);
        Self::with_export_control(config, export, sink, kernel)
    }

    pub fn with_export_control(
        config: FlowStatsConfig,
        export: ExportControl,
        sink: Box<dyn ExportSink>,
        kernel: Box<dyn KernelFlowSource>,
    ) -> Result<Self, FlowStatsError> {
        config.validate()?;
        let mut manager = Self {
            collectors: IndexVector::default(),
            tables: BTreeMap::new(),
            protocol_list: vec![None; usize::from(u8::MAX) + 1],
            flow_index: HashMap::new(),
            env: CollectorEnv {
                export,
                sink,
                kernel,
                deletes: vec![],
                delete_short_flows: config.delete_short_flows,
            },
            dispatch_drops: 0,
            last_threshold_update: None,
            config,
        };
        manager.add(
            FlowAgingTableKey::GLOBAL,
            manager.config.flow_stats_interval,
            manager.config.flow_cache_timeout,
        );
        Ok(manager)
    }

    #[must_use]
    pub fn config(&self) -> &FlowStatsConfig {
        &self.config
    }

    /// Create the aging table of `key`, or update its parameters if it exists.
    /// Only flows added afterwards dispatch to a new table: flows already
    /// kept by a broader table stay there until they are deleted.
    pub fn add(&mut self, key: FlowAgingTableKey, interval_ms: u64, cache_timeout_s: u64) {
        if let Some(object) = self.tables.get(&key) {
            for index in &object.collectors {
                if let Some(collector) = self.collectors.get_mut(*index) {
                    collector.set_parameters(interval_ms, cache_timeout_s);
                }
            }
            return;
        }
        let config = &self.config;
        let collectors = (0..config.collectors_per_table)
            .map(|_| {
                self.collectors.allocate_with(|instance| {
                    FlowStatsCollector::new(key, instance, interval_ms, cache_timeout_s, config)
                })
            })
            .collect();
        let object = FlowStatsCollectorObject { key, collectors };
        if key.is_protocol_wide() && !key.is_global() {
            self.protocol_list[usize::from(key.proto)] = Some(object.clone());
        }
        info!("Added {key}: interval {interval_ms}ms, cache timeout {cache_timeout_s}s");
        self.tables.insert(key, object);
    }

    /// Delete the aging table of `key`. Its flows move to the tables they
    /// dispatch to now.
    pub fn delete(&mut self, key: FlowAgingTableKey) -> Result<(), FlowStatsError> {
        if key.is_global() {
            return Err(FlowStatsError::DefaultAgingTable);
        }
        let object = self
            .tables
            .remove(&key)
            .ok_or(FlowStatsError::UnknownAgingTable(key))?;
        if key.is_protocol_wide() {
            self.protocol_list[usize::from(key.proto)] = None;
        }

        let mut moved = vec![];
        for index in &object.collectors {
            if let Some(mut collector) = self.collectors.free(*index) {
                moved.extend(collector.take_flows(&mut self.env.ctx()));
            }
        }
        info!("Deleted {key}, moving {} flows", moved.len());
        for (flow, info) in moved {
            self.flow_index.remove(&flow);
            self.add_event(flow, info)?;
        }
        Ok(())
    }

    /// The aging table of a flow: the table of its protocol and port, else the
    /// table of its protocol, else the default table
    #[must_use]
    pub fn collector_object(&self, flow: &FlowKey) -> Option<&FlowStatsCollectorObject> {
        [flow.dport, flow.sport]
            .into_iter()
            .filter(|port| *port != 0)
            .find_map(|port| self.tables.get(&FlowAgingTableKey::new(flow.proto, port)))
            .or_else(|| self.protocol_list[usize::from(flow.proto)].as_ref())
            .or_else(|| self.tables.get(&FlowAgingTableKey::GLOBAL))
    }

    fn dispatch_drop(&mut self, flow: &FlowKey) {
        warn!("No aging table for flow {flow}, dropping event");
        self.dispatch_drops += 1;
        counter!(METRIC_FLOW_DISPATCH_DROPS).increment(1);
    }

    fn enqueue(&mut self, index: usize, request: CollectorRequest) -> Result<(), FlowStatsError> {
        match self.collectors.get(index) {
            Some(collector) => collector.enqueue(request),
            None => Err(FlowStatsError::QueueClosed(index)),
        }
    }

    /// A flow was added or changed
    pub fn add_event(&mut self, flow: FlowKey, info: FlowExportInfo) -> Result<(), FlowStatsError> {
        let index = match self.flow_index.get(&flow) {
            Some(index) => *index,
            None => {
                let Some(index) = self
                    .collector_object(&flow)
                    .and_then(|object| object.collector_for(&flow))
                else {
                    self.dispatch_drop(&flow);
                    return Ok(());
                };
                self.flow_index.insert(flow, index);
                #[allow(clippy::cast_precision_loss)]
                let flows = self.flow_index.len() as f64;
                gauge!(METRIC_FLOWS).set(flows);
                index
            }
        };
        self.enqueue(
            index,
            CollectorRequest::AddFlow {
                key: flow,
                info: Box::new(info),
            },
        )
    }

    /// A flow was deleted by the flow table at `time`
    pub fn delete_event(
        &mut self,
        flow: FlowKey,
        time: u64,
        rev: Option<RevFlowDepParams>,
    ) -> Result<(), FlowStatsError> {
        let Some(index) = self.flow_index.remove(&flow) else {
            self.dispatch_drop(&flow);
            return Ok(());
        };
        #[allow(clippy::cast_precision_loss)]
        let flows = self.flow_index.len() as f64;
        gauge!(METRIC_FLOWS).set(flows);
        self.enqueue(
            index,
            CollectorRequest::DeleteFlow {
                key: flow,
                time,
                rev,
            },
        )
    }

    /// The kernel index of a flow is known
    pub fn update_flow_index_event(&mut self, flow: FlowKey, index: u32) -> Result<(), FlowStatsError> {
        let Some(collector) = self.flow_index.get(&flow).copied() else {
            self.dispatch_drop(&flow);
            return Ok(());
        };
        self.enqueue(collector, CollectorRequest::UpdateFlowIndex { key: flow, index })
    }

    /// Process the requests queued to every collector
    pub fn process_requests(&mut self) {
        let mut ctx = self.env.ctx();
        for (_, collector) in self.collectors.iter_mut() {
            collector.process_requests(&mut ctx);
        }
    }

    /// Run the collectors whose timer expired at `now` (us). Returns the flows
    /// to delete.
    pub fn run_due(&mut self, now: u64) -> Vec<FlowDeleteRequest> {
        let total = u64::try_from(self.flow_index.len()).unwrap_or(u64::MAX);
        let mut ctx = self.env.ctx();
        for (_, collector) in self.collectors.iter_mut() {
            if collector.next_run() <= now {
                collector.run(now, total, &mut ctx);
            }
        }
        std::mem::take(&mut self.env.deletes)
    }

    /// Earliest time a collector is due (us)
    #[must_use]
    pub fn next_run(&self) -> Option<u64> {
        self.collectors.iter().map(|(_, c)| c.next_run()).min()
    }

    /// Close the current export period at `now` (us) and adjust the export
    /// threshold. The first call only opens a period.
    pub fn update_flow_threshold(&mut self, now: u64) -> u32 {
        if let Some(last) = self.last_threshold_update {
            let elapsed = Duration::from_micros(now.saturating_sub(last));
            self.env.export.update_threshold(elapsed);
        }
        self.last_threshold_update = Some(now);
        self.env.export.threshold()
    }

    pub fn set_flow_export_rate(&mut self, rate: u32) {
        self.env.export.set_rate(rate);
    }

    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.env.export.threshold()
    }
    #[must_use]
    pub fn export_stats(&self) -> FlowExportStats {
        self.env.export.stats()
    }
    /// Measured records exported per second
    #[must_use]
    pub fn flow_export_rate(&self) -> u64 {
        self.env.export.measured_rate()
    }
    #[must_use]
    pub fn dispatch_drops(&self) -> u64 {
        self.dispatch_drops
    }
    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.flow_index.len()
    }
    pub fn table_keys(&self) -> impl Iterator<Item = &FlowAgingTableKey> {
        self.tables.keys()
    }
    #[must_use]
    pub fn collector(&self, index: usize) -> Option<&FlowStatsCollector> {
        self.collectors.get(index)
    }
    /// The collector a flow was dispatched to
    #[must_use]
    pub fn flow_collector(&self, flow: &FlowKey) -> Option<&FlowStatsCollector> {
        self.collectors.get(*self.flow_index.get(flow)?)
    }

    #[must_use]
    pub fn table_info(&self, key: FlowAgingTableKey) -> Option<AgingTableInfo> {
        let object = self.tables.get(&key)?;
        let collectors: Vec<&FlowStatsCollector> = object
            .collectors
            .iter()
            .filter_map(|i| self.collectors.get(*i))
            .collect();
        let first = collectors.first()?;
        Some(AgingTableInfo {
            key,
            interval: first.default_interval(),
            cache_timeout: first.age_time() / 1_000_000,
            flow_count: collectors.iter().map(|c| c.len()).sum(),
            threshold: self.threshold(),
            collectors: collectors.len(),
        })
    }

    /// Administrative access to the aging table of `proto` and `port`
    pub fn request_handler(
        &mut self,
        proto: u8,
        port: u16,
        op: AgingTableOp,
    ) -> Result<AgingTableInfo, FlowStatsError> {
        let key = FlowAgingTableKey::new(proto, port);
        // answer with every queued flow event applied
        self.process_requests();
        if !self.tables.contains_key(&key) {
            return Err(FlowStatsError::UnknownAgingTable(key));
        }
        match op {
            AgingTableOp::Query => {}
            AgingTableOp::Configure {
                interval,
                cache_timeout,
            } => {
                debug!("Configuring {key}");
                self.add(key, interval, cache_timeout);
            }
            AgingTableOp::Delete => {
                let info = self.table_info(key);
                self.delete(key)?;
                return info.ok_or(FlowStatsError::UnknownAgingTable(key));
            }
        }
        self.table_info(key)
            .ok_or(FlowStatsError::UnknownAgingTable(key))
    }
}
