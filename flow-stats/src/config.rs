// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Parameters of flow aging and export

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::FlowStatsError;

pub const DEFAULT_FLOW_STATS_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_FLOW_CACHE_TIMEOUT_S: u64 = 180;
pub const DEFAULT_FLOW_EXPORT_RATE: u32 = 1000;
pub const DEFAULT_THRESHOLD_UPDATE_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_TCP_SYN_AGE_TIME_S: u64 = 180;
pub const DEFAULT_MAX_FLOWS: u64 = 512 * 1024;
pub const DEFAULT_THRESHOLD_GAIN: f64 = 0.5;
pub const DEFAULT_SAMPLING_BYTES: u64 = 500;

/// Flow aging and export configuration. Every field has a default, both when
/// built with [`FlowStatsConfigBuilder`] and when deserialized.
#[derive(Builder, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FlowStatsConfig {
    /// Default timer interval of the collectors (ms)
    #[builder(default = DEFAULT_FLOW_STATS_INTERVAL_MS)]
    pub flow_stats_interval: u64,

    /// Idle time after which a flow is aged (s). 0 means the default.
    #[builder(default = DEFAULT_FLOW_CACHE_TIMEOUT_S)]
    pub flow_cache_timeout: u64,

    /// Target ceiling of exported flow records per second. 0 disables the
    /// export of flows not marked for logging.
    #[builder(default = DEFAULT_FLOW_EXPORT_RATE)]
    pub flow_export_rate: u32,

    #[builder(default = DEFAULT_THRESHOLD_UPDATE_INTERVAL_MS)]
    pub threshold_update_interval: u64,

    /// Age of TCP flows stuck in SYN without being established (s)
    #[builder(default = DEFAULT_TCP_SYN_AGE_TIME_S)]
    pub tcp_syn_age_time: u64,

    #[builder(default = true)]
    pub delete_short_flows: bool,

    #[builder(default = 1)]
    pub collectors_per_table: usize,

    #[builder(default = DEFAULT_MAX_FLOWS)]
    pub max_flows: u64,

    /// Step of the export threshold control loop, in (0, 1]
    #[builder(default = DEFAULT_THRESHOLD_GAIN)]
    pub threshold_gain: f64,

    /// Flows with fewer new bytes than this are sampled under load
    #[builder(default = DEFAULT_SAMPLING_BYTES)]
    pub sampling_bytes: u64,
}

impl Default for FlowStatsConfig {
    fn default() -> Self {
        Self {
            flow_stats_interval: DEFAULT_FLOW_STATS_INTERVAL_MS,
            flow_cache_timeout: DEFAULT_FLOW_CACHE_TIMEOUT_S,
            flow_export_rate: DEFAULT_FLOW_EXPORT_RATE,
            threshold_update_interval: DEFAULT_THRESHOLD_UPDATE_INTERVAL_MS,
            tcp_syn_age_time: DEFAULT_TCP_SYN_AGE_TIME_S,
            delete_short_flows: true,
            collectors_per_table: 1,
            max_flows: DEFAULT_MAX_FLOWS,
            threshold_gain: DEFAULT_THRESHOLD_GAIN,
            sampling_bytes: DEFAULT_SAMPLING_BYTES,
        }
    }
}

impl FlowStatsConfig {
    /// Check the configuration for values the collectors can't work with
    pub fn validate(&self) -> Result<(), FlowStatsError> {
        if self.collectors_per_table == 0 {
            return Err(FlowStatsError::InvalidConfig(
                "collectors-per-table must be at least 1".to_string(),
            ));
        }
        if !(self.threshold_gain > 0.0 && self.threshold_gain <= 1.0) {
            return Err(FlowStatsError::InvalidConfig(format!(
                "threshold-gain {} is not in (0, 1]",
                self.threshold_gain
            )));
        }
        if self.sampling_bytes == 0 {
            return Err(FlowStatsError::InvalidConfig(
                "sampling-bytes must be positive".to_string(),
            ));
        }
        if self.flow_stats_interval == 0 || self.threshold_update_interval == 0 {
            return Err(FlowStatsError::InvalidConfig(
                "timer intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The cache timeout in microseconds, with 0 standing for the default
    #[must_use]
    pub fn cache_timeout_us(&self) -> u64 {
        cache_timeout_us(self.flow_cache_timeout)
    }

    #[must_use]
    pub fn threshold_update_period(&self) -> Duration {
        Duration::from_millis(self.threshold_update_interval)
    }
}

pub(crate) fn cache_timeout_us(seconds: u64) -> u64 {
    let seconds = if seconds == 0 {
        DEFAULT_FLOW_CACHE_TIMEOUT_S
    } else {
        seconds
    };
    seconds.saturating_mul(1_000_000)
}
