// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow stats collector: keeps the export state of the flows of an aging
//! table, walks them periodically to refresh their counters from the kernel,
//! exports them and asks for the deletion of the idle ones.

use flow_mgmt::{FlowFlags, FlowKey};
use hashbrown::HashSet;
use std::collections::BTreeMap;
use std::ops::Bound;
use tracectl::trace_target;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::{FlowStatsConfig, cache_timeout_us};
use crate::counters::{
    KernelFlowSource, KernelFlowStats, TcpFlags, kernel_bits_bytes, updated_bytes, updated_packets,
};
use crate::errors::FlowStatsError;
use crate::export::{ExportControl, ExportSink, ExportVerdict, FlowLogRecord, RecordBatch, normalize};
use crate::key::FlowAgingTableKey;

trace_target!("flow-aging", LevelFilter::INFO, &["flow", "stats"]);

const IPPROTO_TCP: u8 = 6;

/// Bounds of the timer interval of a collector (ms)
pub const FLOW_STATS_MIN_INTERVAL_MS: u64 = 100;
pub const FLOW_STATS_MAX_INTERVAL_MS: u64 = 1000;
/// Smallest number of flows visited per pass
pub const MIN_FLOW_COUNT_PER_PASS: u64 = 100;

/// Export state of one flow
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowExportInfo {
    pub uuid: Uuid,
    /// Uuid of the egress record of local flows
    pub egress_uuid: Uuid,
    /// Index of the flow in the kernel flow table, once known
    pub flow_handle: Option<u32>,
    /// Times in microseconds
    pub setup_time: u64,
    pub last_modified_time: u64,
    pub teardown_time: Option<u64>,
    /// Agent counters, with the agent overflow bits
    pub bytes: u64,
    pub packets: u64,
    pub tcp_flags: TcpFlags,
    pub underlay_source_port: u16,
    pub underlay_sport_exported: bool,
    pub flags: FlowFlags,
    pub exported: bool,
    pub reverse: Option<FlowKey>,
    pub source_vn: String,
    pub dest_vn: String,
    pub interface: Option<Uuid>,
}

impl FlowExportInfo {
    #[must_use]
    pub fn new(uuid: Uuid, setup_time: u64) -> Self {
        Self {
            uuid,
            egress_uuid: Uuid::new_v4(),
            setup_time,
            last_modified_time: setup_time,
            ..Default::default()
        }
    }
    #[must_use]
    pub fn is_action_log(&self) -> bool {
        self.flags.contains(FlowFlags::ACTION_LOG)
    }
}

/// What the flow table knows of the reverse of a deleted flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevFlowDepParams {
    pub key: FlowKey,
    pub uuid: Uuid,
}

/// Requests queued to a collector, processed in order
#[derive(Debug)]
pub enum CollectorRequest {
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
}

/// Deletion asked to the flow table for an aged flow. With `rev` set, the
/// reverse flow goes along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowDeleteRequest {
    pub key: FlowKey,
    pub rev: bool,
}

/// What a collector works with besides its own flows
pub(crate) struct CollectorCtx<'a> {
    pub(crate) export: &'a mut ExportControl,
    pub(crate) sink: &'a mut dyn ExportSink,
    pub(crate) kernel: &'a dyn KernelFlowSource,
    pub(crate) deletes: &'a mut Vec<FlowDeleteRequest>,
    pub(crate) delete_short_flows: bool,
}

pub struct FlowStatsCollector {
    table: FlowAgingTableKey,
    instance: usize,
    flows: BTreeMap<FlowKey, FlowExportInfo>,
    /// last flow visited by an unfinished walk
    cursor: Option<FlowKey>,
    age_time_us: u64,
    tcp_syn_age_time_us: u64,
    default_interval_ms: u64,
    interval_ms: u64,
    count_per_pass: u64,
    multiplier: u64,
    max_flows: u64,
    next_run_us: u64,
    run_counter: u64,
    requests_tx: kanal::Sender<CollectorRequest>,
    requests_rx: kanal::Receiver<CollectorRequest>,
    batch: RecordBatch,
}

impl FlowStatsCollector {
    #[must_use]
    pub fn new(
        table: FlowAgingTableKey,
        instance: usize,
        interval_ms: u64,
        cache_timeout_s: u64,
        config: &FlowStatsConfig,
    ) -> Self {
        let (requests_tx, requests_rx) = kanal::unbounded();
        let mut collector = Self {
            table,
            instance,
            flows: BTreeMap::new(),
            cursor: None,
            age_time_us: cache_timeout_us(cache_timeout_s),
            tcp_syn_age_time_us: config.tcp_syn_age_time.saturating_mul(1_000_000),
            default_interval_ms: interval_ms,
            interval_ms,
            count_per_pass: MIN_FLOW_COUNT_PER_PASS,
            multiplier: 0,
            max_flows: config.max_flows,
            next_run_us: 0,
            run_counter: 0,
            requests_tx,
            requests_rx,
            batch: RecordBatch::default(),
        };
        collector.update_multiplier();
        collector
    }

    #[must_use]
    pub fn table(&self) -> FlowAgingTableKey {
        self.table
    }
    #[must_use]
    pub fn instance(&self) -> usize {
        self.instance
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
    #[must_use]
    pub fn find(&self, key: &FlowKey) -> Option<&FlowExportInfo> {
        self.flows.get(key)
    }
    pub fn keys(&self) -> impl Iterator<Item = &FlowKey> {
        self.flows.keys()
    }
    /// Current timer interval (ms)
    #[must_use]
    pub fn interval(&self) -> u64 {
        self.interval_ms
    }
    #[must_use]
    pub fn default_interval(&self) -> u64 {
        self.default_interval_ms
    }
    /// Idle time after which flows are aged (us)
    #[must_use]
    pub fn age_time(&self) -> u64 {
        self.age_time_us
    }
    #[must_use]
    pub fn count_per_pass(&self) -> u64 {
        self.count_per_pass
    }
    #[must_use]
    pub fn run_counter(&self) -> u64 {
        self.run_counter
    }
    #[must_use]
    pub fn next_run(&self) -> u64 {
        self.next_run_us
    }
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.requests_rx.len()
    }

    /// Queue a request, to be processed before the next pass
    pub fn enqueue(&self, request: CollectorRequest) -> Result<(), FlowStatsError> {
        self.requests_tx
            .send(request)
            .map_err(|_| FlowStatsError::QueueClosed(self.instance))
    }

    /// Change the timer interval (ms) and the cache timeout (s)
    pub fn set_parameters(&mut self, interval_ms: u64, cache_timeout_s: u64) {
        self.default_interval_ms = interval_ms;
        self.interval_ms = interval_ms;
        self.age_time_us = cache_timeout_us(cache_timeout_s);
        self.update_multiplier();
        debug!(
            "{} collector {}: interval {interval_ms}ms, cache timeout {}s",
            self.table,
            self.instance,
            self.age_time_us / 1_000_000
        );
    }

    fn update_multiplier(&mut self) {
        let age_ms = (self.age_time_us / 1000).max(1);
        let default_age_ms = cache_timeout_us(0) / 1000;
        let max_flows = self.max_flows.saturating_mul(age_ms) / default_age_ms;
        self.multiplier = max_flows.saturating_mul(FLOW_STATS_MIN_INTERVAL_MS) / age_ms;
    }

    /// Remove all the flows, to be handed to another collector
    pub(crate) fn take_flows(&mut self, ctx: &mut CollectorCtx) -> BTreeMap<FlowKey, FlowExportInfo> {
        self.process_requests(ctx);
        self.cursor = None;
        std::mem::take(&mut self.flows)
    }

    pub(crate) fn process_requests(&mut self, ctx: &mut CollectorCtx) {
        while let Ok(Some(request)) = self.requests_rx.try_recv() {
            match request {
                CollectorRequest::AddFlow { key, info } => self.add_flow(key, *info),
                CollectorRequest::DeleteFlow { key, time, rev } => {
                    self.delete_flow(key, time, rev, ctx);
                }
                CollectorRequest::UpdateFlowIndex { key, index } => {
                    if let Some(info) = self.flows.get_mut(&key) {
                        info.flow_handle = Some(index);
                    }
                }
            }
        }
    }

    fn add_flow(&mut self, key: FlowKey, info: FlowExportInfo) {
        if self.flows.insert(key, info).is_none() {
            trace!("{} collector {}: new flow {key}", self.table, self.instance);
        }
    }

    /// A flow is gone: export it one last time with its teardown time
    fn delete_flow(
        &mut self,
        key: FlowKey,
        time: u64,
        rev: Option<RevFlowDepParams>,
        ctx: &mut CollectorCtx,
    ) {
        let reverse_uuid = self.reverse_uuid(&key).or(rev.map(|r| r.uuid));
        let Some(info) = self.flows.get_mut(&key) else {
            warn!(
                "{} collector {}: delete of unknown flow {key}",
                self.table, self.instance
            );
            return;
        };
        info.teardown_time = Some(time);
        let (diff_bytes, diff_packets) = match info.flow_handle.and_then(|h| ctx.kernel.flow_stats(h)) {
            Some(kflow) => update_counters(info, &kflow),
            None => (0, 0),
        };
        export_flow(&key, info, reverse_uuid, diff_bytes, diff_packets, &mut self.batch, ctx);
        self.batch.flush(ctx.sink);
        self.flows.remove(&key);

        // the reverse flow no longer pairs with this one
        if let Some(rev) = rev
            && let Some(rinfo) = self.flows.get_mut(&rev.key)
            && rinfo.reverse == Some(key)
        {
            rinfo.reverse = None;
        }
        if self.cursor == Some(key) {
            self.cursor = self.flows.range(..key).next_back().map(|(k, _)| *k);
        }
    }

    fn reverse_uuid(&self, key: &FlowKey) -> Option<Uuid> {
        let reverse = self.flows.get(key)?.reverse?;
        self.flows.get(&reverse).map(|r| r.uuid)
    }

    fn key_after(&self, key: &FlowKey) -> Option<FlowKey> {
        self.flows
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| *k)
    }

    fn tcp_should_be_aged(&self, info: &FlowExportInfo, kflow: &KernelFlowStats, now: u64) -> bool {
        if kflow.tcp_flags.intersects(TcpFlags::HALF_CLOSE | TcpFlags::RST) {
            return true;
        }
        if kflow.tcp_flags.intersects(TcpFlags::SYN | TcpFlags::SYN_R)
            && !kflow
                .tcp_flags
                .intersects(TcpFlags::ESTABLISHED | TcpFlags::ESTABLISHED_R)
        {
            return now.saturating_sub(info.setup_time) >= self.tcp_syn_age_time_us;
        }
        false
    }

    fn should_be_aged(
        &self,
        key: &FlowKey,
        info: &FlowExportInfo,
        kflow: Option<&KernelFlowStats>,
        now: u64,
    ) -> bool {
        if let Some(kflow) = kflow {
            if key.proto == IPPROTO_TCP && self.tcp_should_be_aged(info, kflow, now) {
                return true;
            }
            // traffic since the last pass
            if kernel_bits_bytes(info.bytes) < kflow.total_bytes() {
                return false;
            }
        }
        now.saturating_sub(info.last_modified_time) >= self.age_time_us
    }

    /// One timer pass: visit at most `count_per_pass` flows from where the
    /// previous pass stopped, then adapt the timer to `total_flows`.
    pub(crate) fn run(&mut self, now: u64, total_flows: u64, ctx: &mut CollectorCtx) {
        self.run_counter += 1;
        self.process_requests(ctx);
        if !self.flows.is_empty() {
            self.age_pass(now, ctx);
        }
        self.batch.flush(ctx.sink);
        self.update_interval(total_flows);
        self.next_run_us = now.saturating_add(self.interval_ms.saturating_mul(1000));
    }

    fn age_pass(&mut self, now: u64, ctx: &mut CollectorCtx) {
        let budget = self.count_per_pass.max(1);
        let mut count = 0;
        let mut next = match self.cursor {
            Some(cursor) => self.key_after(&cursor),
            None => self.flows.keys().next().copied(),
        };

        // reverse flows already part of a delete of this pass
        let mut requested = HashSet::new();

        while let Some(key) = next {
            next = self.key_after(&key);
            self.cursor = Some(key);
            if requested.remove(&key) {
                continue;
            }
            let Some(info) = self.flows.get(&key) else {
                continue;
            };
            let kflow = info.flow_handle.and_then(|h| ctx.kernel.flow_stats(h));
            let reverse = info.reverse.filter(|r| self.flows.contains_key(r));
            let short = info.flags.contains(FlowFlags::SHORT_FLOW);

            // flows with a reverse go only once both directions are idle
            let mut deleted = false;
            if self.should_be_aged(&key, info, kflow.as_ref(), now) {
                deleted = match reverse.and_then(|r| self.flows.get(&r).map(|ri| (r, ri))) {
                    Some((rkey, rinfo)) => {
                        let rflow = rinfo.flow_handle.and_then(|h| ctx.kernel.flow_stats(h));
                        self.should_be_aged(&rkey, rinfo, rflow.as_ref(), now)
                    }
                    None => true,
                };
            }

            let delete_short = !deleted && short && ctx.delete_short_flows;
            if deleted || delete_short {
                // the reverse goes with this one, don't visit it again
                if reverse.is_some() && next == reverse {
                    self.cursor = next;
                    next = next.and_then(|k| self.key_after(&k));
                } else if let Some(rkey) = reverse {
                    requested.insert(rkey);
                }
                debug!(
                    "{} collector {}: deleting {} flow {key}",
                    self.table,
                    self.instance,
                    if deleted { "aged" } else { "short" }
                );
                ctx.deletes.push(FlowDeleteRequest {
                    key,
                    rev: delete_short || reverse.is_some(),
                });
                if reverse.is_some() {
                    count += 1;
                }
            } else if let Some(kflow) = kflow {
                self.refresh(key, &kflow, now, ctx);
            }

            count += 1;
            if count >= budget {
                break;
            }
        }

        // the walk restarts from the first flow once it reached the last one
        if next.is_none() {
            self.cursor = None;
        }
    }

    /// Pull the kernel counters of a live flow and export it if it moved or
    /// was never exported
    fn refresh(&mut self, key: FlowKey, kflow: &KernelFlowStats, now: u64, ctx: &mut CollectorCtx) {
        let reverse_uuid = self.reverse_uuid(&key);
        let Some(info) = self.flows.get_mut(&key) else {
            return;
        };
        info.underlay_source_port = kflow.underlay_source_port;
        info.tcp_flags = kflow.tcp_flags;
        if kernel_bits_bytes(info.bytes) != kflow.total_bytes() {
            let (diff_bytes, diff_packets) = update_counters(info, kflow);
            info.last_modified_time = now;
            export_flow(&key, info, reverse_uuid, diff_bytes, diff_packets, &mut self.batch, ctx);
        } else if !info.exported {
            export_flow(&key, info, reverse_uuid, 0, 0, &mut self.batch, ctx);
        }
    }

    fn update_interval(&mut self, total_flows: u64) {
        let age_ms = self.age_time_us / 1000;
        self.interval_ms = if total_flows > 0 {
            (age_ms.saturating_mul(self.multiplier) / total_flows)
                .clamp(FLOW_STATS_MIN_INTERVAL_MS, FLOW_STATS_MAX_INTERVAL_MS)
        } else {
            self.default_interval_ms
        };
        self.count_per_pass = if age_ms > 0 {
            (self.interval_ms.saturating_mul(total_flows) / age_ms).max(MIN_FLOW_COUNT_PER_PASS)
        } else {
            MIN_FLOW_COUNT_PER_PASS
        };
    }
}

/// Fold the kernel counters into the flow, returning the deltas
fn update_counters(info: &mut FlowExportInfo, kflow: &KernelFlowStats) -> (u64, u64) {
    let bytes = updated_bytes(info.bytes, kflow.total_bytes());
    let packets = updated_packets(info.packets, kflow.total_packets());
    let diff = (bytes.wrapping_sub(info.bytes), packets.wrapping_sub(info.packets));
    info.bytes = bytes;
    info.packets = packets;
    diff
}

fn export_flow(
    key: &FlowKey,
    info: &mut FlowExportInfo,
    reverse_uuid: Option<Uuid>,
    diff_bytes: u64,
    diff_packets: u64,
    batch: &mut RecordBatch,
    ctx: &mut CollectorCtx,
) {
    let (diff_bytes, diff_packets) = match ctx.export.decide(info.is_action_log(), diff_bytes) {
        ExportVerdict::Drop => return,
        ExportVerdict::Export(None) => (diff_bytes, diff_packets),
        ExportVerdict::Export(Some(probability)) => normalize(diff_bytes, diff_packets, probability),
    };
    let mut record = FlowLogRecord {
        flow_uuid: info.uuid,
        reverse_uuid,
        vmi_uuid: info.interface,
        key: *key,
        source_vn: info.source_vn.clone(),
        dest_vn: info.dest_vn.clone(),
        bytes: info.bytes,
        packets: info.packets,
        diff_bytes,
        diff_packets,
        tcp_flags: info.tcp_flags.bits(),
        ingress: info.flags.contains(FlowFlags::INGRESS_DIR),
        setup_time: None,
        teardown_time: info.teardown_time,
        underlay_source_port: None,
    };
    if !info.exported {
        record.setup_time = Some(info.setup_time);
        info.exported = true;
    }
    if !info.underlay_sport_exported && info.underlay_source_port != 0 {
        record.underlay_source_port = Some(info.underlay_source_port);
        info.underlay_sport_exported = true;
    }

    if info.flags.contains(FlowFlags::LOCAL_FLOW) {
        // local flows are seen both ways: one record per direction
        record.ingress = true;
        let egress = FlowLogRecord {
            flow_uuid: info.egress_uuid,
            ingress: false,
            ..record.clone()
        };
        batch.push(record, ctx.sink);
        batch.push(egress, ctx.sink);
        ctx.export.record_sent(2);
    } else {
        batch.push(record, ctx.sink);
        ctx.export.record_sent(1);
    }
}
