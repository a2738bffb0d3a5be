// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow export: the decision to export a flow record or not, the records and
//! where they go.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::Duration;
use tracectl::trace_target;
use tracing::{debug, info};
use uuid::Uuid;

use flow_mgmt::FlowKey;

use crate::config::FlowStatsConfig;
use crate::threshold::ThresholdControl;

trace_target!("flow-export", LevelFilter::INFO, &["flow", "stats"]);

/// Records handed to the sink at once
pub const FLOW_RECORDS_PER_DISPATCH: usize = 16;

/// Share of the configured rate from which small flows are sampled
const SAMPLING_RATE_RATIO: f64 = 0.8;

pub const METRIC_FLOW_EXPORTS: &str = "vrouter_flow_exports";
pub const METRIC_FLOW_EXPORT_DROPS: &str = "vrouter_flow_export_drops";
pub const METRIC_FLOW_EXPORT_DISABLE_DROPS: &str = "vrouter_flow_export_disable_drops";
pub const METRIC_FLOW_EXPORT_SAMPLING_DROPS: &str = "vrouter_flow_export_sampling_drops";
pub const METRIC_FLOW_EXPORT_THRESHOLD: &str = "vrouter_flow_export_threshold";
pub const METRIC_FLOW_EXPORT_RATE: &str = "vrouter_flow_export_rate";

/// Describe the export metrics to the installed recorder
pub fn describe_metrics() {
    describe_counter!(METRIC_FLOW_EXPORTS, "Flow export attempts that were exported");
    describe_counter!(
        METRIC_FLOW_EXPORT_DROPS,
        "Flow exports dropped because the export threshold was reached"
    );
    describe_counter!(
        METRIC_FLOW_EXPORT_DISABLE_DROPS,
        "Flow exports dropped because export is disabled"
    );
    describe_counter!(
        METRIC_FLOW_EXPORT_SAMPLING_DROPS,
        "Flow exports dropped by sampling"
    );
    describe_gauge!(
        METRIC_FLOW_EXPORT_THRESHOLD,
        "Flow records that may be exported per threshold update period"
    );
    describe_gauge!(METRIC_FLOW_EXPORT_RATE, "Measured flow records exported per second");
}

/// Outcome counters of the export attempts. Every attempt lands in exactly
/// one of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowExportStats {
    pub exports: u64,
    pub drops: u64,
    pub disable_drops: u64,
    pub sampling_drops: u64,
}

impl FlowExportStats {
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.exports + self.drops + self.disable_drops + self.sampling_drops
    }
}

/// What to do with one export attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ExportVerdict {
    /// Export, with the deltas divided by the sampling probability if one is given
    Export(Option<f64>),
    Drop,
}

/// Export state shared by all the collectors
#[derive(Debug)]
pub struct ExportControl {
    stats: FlowExportStats,
    threshold: ThresholdControl,
    /// configured records per second
    rate: u32,
    sampling_bytes: u64,
    period_records: u64,
    measured_rate: u64,
    rng: StdRng,
}

impl ExportControl {
    #[must_use]
    pub fn new(config: &FlowStatsConfig) -> Self {
        Self::with_rng(config, StdRng::from_rng(&mut rand::rng()))
    }

    #[must_use]
    pub fn with_rng(config: &FlowStatsConfig, rng: StdRng) -> Self {
        Self {
            stats: FlowExportStats::default(),
            threshold: ThresholdControl::new(config.threshold_gain),
            rate: config.flow_export_rate,
            sampling_bytes: config.sampling_bytes.max(1),
            period_records: 0,
            measured_rate: 0,
            rng,
        }
    }

    #[must_use]
    pub fn stats(&self) -> FlowExportStats {
        self.stats
    }
    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold.threshold()
    }
    #[must_use]
    pub fn rate(&self) -> u32 {
        self.rate
    }
    #[must_use]
    pub fn measured_rate(&self) -> u64 {
        self.measured_rate
    }
    pub fn set_rate(&mut self, rate: u32) {
        if rate != self.rate {
            info!("Flow export rate set to {rate}");
            self.rate = rate;
        }
    }

    /// Decide on one export attempt. Flows marked for logging are always
    /// exported. `diff_bytes` is the traffic seen since the last export.
    pub(crate) fn decide(&mut self, action_log: bool, diff_bytes: u64) -> ExportVerdict {
        if !action_log {
            if self.rate == 0 {
                self.stats.disable_drops += 1;
                counter!(METRIC_FLOW_EXPORT_DISABLE_DROPS).increment(1);
                return ExportVerdict::Drop;
            }
            if self.period_records >= u64::from(self.threshold.threshold()) {
                self.stats.drops += 1;
                counter!(METRIC_FLOW_EXPORT_DROPS).increment(1);
                return ExportVerdict::Drop;
            }
            #[allow(clippy::cast_precision_loss)]
            let busy = self.measured_rate as f64 >= f64::from(self.rate) * SAMPLING_RATE_RATIO;
            if busy && diff_bytes < self.sampling_bytes {
                let draw = self.rng.random_range(0..self.sampling_bytes);
                if draw > diff_bytes {
                    self.stats.sampling_drops += 1;
                    counter!(METRIC_FLOW_EXPORT_SAMPLING_DROPS).increment(1);
                    return ExportVerdict::Drop;
                }
                self.stats.exports += 1;
                counter!(METRIC_FLOW_EXPORTS).increment(1);
                #[allow(clippy::cast_precision_loss)]
                let probability = diff_bytes as f64 / self.sampling_bytes as f64;
                return ExportVerdict::Export(Some(probability));
            }
        }
        self.stats.exports += 1;
        counter!(METRIC_FLOW_EXPORTS).increment(1);
        ExportVerdict::Export(None)
    }

    /// Account records that went out in the current period
    pub(crate) fn record_sent(&mut self, records: u64) {
        self.period_records += records;
    }

    /// End the current period, which lasted `elapsed`, and adjust the threshold
    pub fn update_threshold(&mut self, elapsed: Duration) -> u32 {
        let secs = elapsed.as_secs();
        if secs > 0 {
            self.measured_rate = self.period_records / secs;
        }
        self.threshold = self.threshold.next(self.period_records, elapsed, self.rate);
        debug!(
            "Export period of {elapsed:?}: {} records, rate {}/s, threshold {}",
            self.period_records,
            self.measured_rate,
            self.threshold.threshold()
        );
        self.period_records = 0;
        gauge!(METRIC_FLOW_EXPORT_THRESHOLD).set(f64::from(self.threshold.threshold()));
        #[allow(clippy::cast_precision_loss)]
        let rate = self.measured_rate as f64;
        gauge!(METRIC_FLOW_EXPORT_RATE).set(rate);
        self.threshold.threshold()
    }
}

/// Scale traffic deltas of a sampled flow up by the sampling probability
#[must_use]
pub(crate) fn normalize(diff_bytes: u64, diff_packets: u64, probability: f64) -> (u64, u64) {
    if probability <= 0.0 {
        return (0, 0);
    }
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let scale = |v: u64| (v as f64 / probability) as u64;
    (scale(diff_bytes), scale(diff_packets))
}

/// One exported flow record
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowLogRecord {
    pub flow_uuid: Uuid,
    pub reverse_uuid: Option<Uuid>,
    pub vmi_uuid: Option<Uuid>,
    pub key: FlowKey,
    pub source_vn: String,
    pub dest_vn: String,
    pub bytes: u64,
    pub packets: u64,
    pub diff_bytes: u64,
    pub diff_packets: u64,
    pub tcp_flags: u16,
    pub ingress: bool,
    pub setup_time: Option<u64>,
    pub teardown_time: Option<u64>,
    pub underlay_source_port: Option<u16>,
}

/// Destination of the exported flow records
pub trait ExportSink: Send {
    fn dispatch(&mut self, records: Vec<FlowLogRecord>);
}

impl ExportSink for Vec<FlowLogRecord> {
    fn dispatch(&mut self, records: Vec<FlowLogRecord>) {
        self.extend(records);
    }
}

/// Sink writing the records to the log
#[derive(Debug, Default)]
pub struct TracingSink;

impl ExportSink for TracingSink {
    fn dispatch(&mut self, records: Vec<FlowLogRecord>) {
        for r in records {
            info!(
                "flow {} {} {}/{} bytes {}/{} packets{}",
                r.flow_uuid,
                r.key,
                r.diff_bytes,
                r.bytes,
                r.diff_packets,
                r.packets,
                if r.teardown_time.is_some() { " (teardown)" } else { "" }
            );
        }
    }
}

/// Records waiting to be dispatched
#[derive(Debug, Default)]
pub(crate) struct RecordBatch {
    records: Vec<FlowLogRecord>,
}

impl RecordBatch {
    pub(crate) fn push(&mut self, record: FlowLogRecord, sink: &mut dyn ExportSink) {
        self.records.push(record);
        if self.records.len() == FLOW_RECORDS_PER_DISPATCH {
            self.flush(sink);
        }
    }
    pub(crate) fn flush(&mut self, sink: &mut dyn ExportSink) {
        if !self.records.is_empty() {
            sink.dispatch(std::mem::take(&mut self.records));
        }
    }
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowStatsConfigBuilder;

    fn control(rate: u32) -> ExportControl {
        let config = FlowStatsConfigBuilder::default()
            .flow_export_rate(rate)
            .build()
            .unwrap();
        ExportControl::with_rng(&config, StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_disabled_export() {
        let mut control = control(0);
        assert_eq!(control.decide(false, 1000), ExportVerdict::Drop);
        assert_eq!(control.decide(true, 1000), ExportVerdict::Export(None));
        let stats = control.stats();
        assert_eq!(stats.disable_drops, 1);
        assert_eq!(stats.exports, 1);
    }

    #[test]
    fn test_threshold_drop() {
        let mut control = control(1000);
        control.record_sent(u64::from(control.threshold()));
        assert_eq!(control.decide(false, 10_000), ExportVerdict::Drop);
        assert_eq!(control.stats().drops, 1);
        // logged flows still go out
        assert_eq!(control.decide(true, 10_000), ExportVerdict::Export(None));
    }

    #[test]
    fn test_sampling_only_when_busy() {
        let mut control = control(10);
        // idle: small flows go out as they are
        assert_eq!(control.decide(false, 1), ExportVerdict::Export(None));
        control.record_sent(100);
        control.update_threshold(Duration::from_secs(2));
        assert_eq!(control.measured_rate(), 50);
        // busy: a flow with no new bytes is almost always dropped
        let mut sampled = 0;
        for _ in 0..100 {
            if control.decide(false, 0) == ExportVerdict::Drop {
                sampled += 1;
            }
        }
        assert!(sampled > 90);
        assert_eq!(control.stats().sampling_drops, sampled);
        // big flows are never sampled
        assert_eq!(control.decide(false, 500), ExportVerdict::Export(None));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(100, 10, 0.5), (200, 20));
        assert_eq!(normalize(100, 10, 0.0), (0, 0));
    }

    #[test]
    fn test_batching() {
        let mut sink: Vec<FlowLogRecord> = vec![];
        let mut batch = RecordBatch::default();
        for _ in 0..FLOW_RECORDS_PER_DISPATCH + 3 {
            batch.push(FlowLogRecord::default(), &mut sink);
        }
        assert_eq!(sink.len(), FLOW_RECORDS_PER_DISPATCH);
        assert_eq!(batch.len(), 3);
        batch.flush(&mut sink);
        assert_eq!(sink.len(), FLOW_RECORDS_PER_DISPATCH + 3);
    }

    #[test]
    fn test_attempts_are_partitioned() {
        // (flow marked for logging, new bytes, records sent, end of period)
        bolero::check!()
            .with_type::<(u16, Vec<(bool, u16, u8, bool)>)>()
            .for_each(|(rate, attempts)| {
                let mut control = control(u32::from(*rate % 64));
                for (n, (log, bytes, sent, tick)) in attempts.iter().enumerate() {
                    control.decide(*log, u64::from(*bytes));
                    control.record_sent(u64::from(*sent));
                    if *tick {
                        control.update_threshold(Duration::from_secs(1));
                    }
                    assert_eq!(control.stats().attempts(), n as u64 + 1);
                }
            });
    }
}
