// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Agent configuration, read from a YAML file

use flow_mgmt::key::VrfId;
use flow_stats::{FlowAgingTableKey, FlowStatsConfig};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use tracing::debug;

use crate::errors::AgentError;

/// An aging table created at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgingTableConfig {
    pub protocol: u8,
    #[serde(default)]
    pub port: u16,
    /// seconds, 0 for the default
    #[serde(default)]
    pub cache_timeout: u64,
}

impl AgingTableConfig {
    #[must_use]
    pub fn key(&self) -> FlowAgingTableKey {
        FlowAgingTableKey::new(self.protocol, self.port)
    }
}

/// A VRF loaded in the operational database at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VrfConfig {
    pub id: VrfId,
    #[serde(default)]
    pub routes: Vec<IpNet>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AgentConfig {
    pub flow_stats: FlowStatsConfig,
    pub aging_tables: Vec<AgingTableConfig>,
    pub vrfs: Vec<VrfConfig>,
    /// control nodes, in index order
    pub controllers: Vec<IpAddr>,
    pub tracing: Option<String>,
    pub metrics_address: Option<SocketAddr>,
}

impl AgentConfig {
    /// Parse and validate a configuration
    pub fn from_yaml(input: &str) -> Result<Self, AgentError> {
        let config: AgentConfig = serde_yaml_ng::from_str(input)?;
        config.flow_stats.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, AgentError> {
        debug!("Loading configuration from {}", path.display());
        let input = std::fs::read_to_string(path).map_err(|source| AgentError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_stats::FlowStatsError;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_full_config() {
        let yaml = r"
flow-stats:
  flow-cache-timeout: 60
  flow-export-rate: 200
  collectors-per-table: 2
aging-tables:
  - protocol: 6
    port: 22
    cache-timeout: 3600
  - protocol: 17
vrfs:
  - id: 1
    routes: [10.0.0.0/8, 2001:db8::/32]
  - id: 2
controllers: [192.0.2.1]
tracing: default=info,flow=debug
metrics-address: 127.0.0.1:9100
";
        let config = AgentConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.flow_stats.flow_cache_timeout, 60);
        assert_eq!(config.flow_stats.flow_export_rate, 200);
        assert_eq!(config.flow_stats.collectors_per_table, 2);
        // unset fields keep their defaults
        assert_eq!(
            config.flow_stats.flow_stats_interval,
            FlowStatsConfig::default().flow_stats_interval
        );
        assert_eq!(
            config.aging_tables,
            vec![
                AgingTableConfig {
                    protocol: 6,
                    port: 22,
                    cache_timeout: 3600
                },
                AgingTableConfig {
                    protocol: 17,
                    port: 0,
                    cache_timeout: 0
                },
            ]
        );
        assert_eq!(config.aging_tables[1].key(), FlowAgingTableKey::new(17, 0));
        assert_eq!(
            config.vrfs,
            vec![
                VrfConfig {
                    id: 1,
                    routes: vec!["10.0.0.0/8".parse().unwrap(), "2001:db8::/32".parse().unwrap()]
                },
                VrfConfig {
                    id: 2,
                    routes: vec![]
                },
            ]
        );
        assert_eq!(config.controllers, vec!["192.0.2.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.tracing.as_deref(), Some("default=info,flow=debug"));
        assert_eq!(config.metrics_address, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn test_empty_config() {
        assert_eq!(AgentConfig::from_yaml("{}").unwrap(), AgentConfig::default());
    }

    #[test]
    fn test_invalid_config() {
        let err = AgentConfig::from_yaml("flow-stats:\n  collectors-per-table: 0\n").unwrap_err();
        assert!(matches!(
            err,
            AgentError::FlowStats(FlowStatsError::InvalidConfig(_))
        ));
        assert!(matches!(
            AgentConfig::from_yaml("aging-tables: 3"),
            Err(AgentError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AgentConfig::load(Path::new("/nonexistent/agent.yaml")),
            Err(AgentError::ConfigRead { .. })
        ));
    }
}
