// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of tracing levels, per target and per tag.

use ordermap::OrderMap;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Registry, prelude::*, reload};

use crate::LevelFilter;
use crate::display::RegistryByTag;
use crate::targets::TRACE_TARGETS;
use crate::trace_target;

trace_target!("tracectl", LevelFilter::INFO, &[]);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TraceCtlError {
    #[error("Invalid syntax '{0}': expected tag=level")]
    Syntax(String),
    #[error("Invalid level '{0}'")]
    Level(String),
    #[error("Could not install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Configuration of one tracing target.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub(crate) target: &'static str,
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: Vec<&'static str>,
}

impl TargetConfig {
    fn new(
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) -> Self {
        // a target can always be addressed by its name
        let mut tags = tags.to_vec();
        if !tags.contains(&name) {
            tags.push(name);
        }
        Self {
            target,
            name,
            level,
            tags,
        }
    }
    #[must_use]
    pub fn target(&self) -> &'static str {
        self.target
    }
    #[must_use]
    pub fn level(&self) -> LevelFilter {
        self.level
    }
}

#[derive(Debug)]
pub(crate) struct TargetRegistry {
    pub(crate) default: LevelFilter,
    pub(crate) targets: OrderMap<&'static str, TargetConfig>,
    pub(crate) tags: OrderMap<&'static str, BTreeSet<&'static str>>,
}

impl TargetRegistry {
    fn new(default: LevelFilter) -> Self {
        let mut registry = Self {
            default,
            targets: OrderMap::new(),
            tags: OrderMap::new(),
        };
        for t in TRACE_TARGETS {
            registry.register(TargetConfig::new(t.target, t.name, t.level, t.tags));
        }
        registry
    }

    fn register(&mut self, config: TargetConfig) {
        let target = config.target;
        for tag in &config.tags {
            self.tags.entry(tag).or_default().insert(target);
        }
        if self.targets.insert(target, config).is_some() {
            warn!("Tracing target {target} is declared more than once");
        }
    }

    fn env_filter(&self) -> EnvFilter {
        self.targets.values().fold(
            EnvFilter::new(self.default.to_string()),
            |filter, t| match format!("{}={}", t.target, t.level).parse() {
                Ok(directive) => filter.add_directive(directive),
                Err(e) => {
                    error!("Bad directive for target {}: {e}", t.target);
                    filter
                }
            },
        )
    }

    fn targets_with_tag(&self, tag: &str) -> Vec<&'static str> {
        self.tags
            .get(tag)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Set the level of every target carrying `tag`. Returns the number of changed targets.
    fn set_tag_level(&mut self, tag: &str, level: LevelFilter) -> usize {
        let mut changed = 0;
        for target in self.targets_with_tag(tag) {
            if let Some(t) = self.targets.get_mut(target)
                && t.level != level
            {
                t.level = level;
                changed += 1;
            }
        }
        changed
    }

    pub(crate) fn as_config_string(&self) -> String {
        let mut out = format!("default={}", self.default);
        for t in self.targets.values() {
            out += &format!(",{}={}", t.name, t.level);
        }
        out
    }
}

/// Handle to the process-wide tracing configuration.
#[derive(Debug)]
pub struct TracingControl {
    registry: Mutex<TargetRegistry>,
    reload: reload::Handle<EnvFilter, Registry>,
}

impl TracingControl {
    fn new() -> Result<Self, TraceCtlError> {
        let registry = TargetRegistry::new(LevelFilter::INFO);
        let (filter, reload) = reload::Layer::new(registry.env_filter());
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_line_number(true)
            .with_target(true)
            .with_thread_names(true)
            .with_level(true);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TraceCtlError::Subscriber(e.to_string()))?;

        Ok(Self {
            registry: Mutex::new(registry),
            reload,
        })
    }

    fn lock(&self) -> MutexGuard<'_, TargetRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, registry: &TargetRegistry) {
        if let Err(e) = self.reload.reload(registry.env_filter()) {
            error!("Failed to reload tracing filter: {e}");
        }
    }

    /// Initialize tracing, if not done yet.
    pub fn init() {
        get_trace_ctl();
    }

    pub fn set_tag_level(&self, tag: &str, level: LevelFilter) {
        let mut registry = self.lock();
        let changed = registry.set_tag_level(tag, level);
        if changed > 0 {
            self.apply(&registry);
        }
        info!("Log level for tag '{tag}' set to {level} ({changed} targets changed)");
    }

    pub fn set_level_all(&self, level: LevelFilter) {
        let mut registry = self.lock();
        registry.targets.values_mut().for_each(|t| t.level = level);
        self.apply(&registry);
    }

    pub fn set_default_level(&self, level: LevelFilter) {
        let mut registry = self.lock();
        if registry.default != level {
            registry.default = level;
            self.apply(&registry);
            info!("Default log level set to {level}");
        }
    }

    #[must_use]
    pub fn get_default_level(&self) -> LevelFilter {
        self.lock().default
    }

    fn parse(input: &str) -> Result<OrderMap<String, LevelFilter>, TraceCtlError> {
        let mut out = OrderMap::new();
        for item in input.split(',').map(str::trim) {
            let (tag, level) = item
                .split_once('=')
                .ok_or_else(|| TraceCtlError::Syntax(item.to_owned()))?;
            let level = LevelFilter::from_str(level.trim())
                .map_err(|_| TraceCtlError::Level(level.trim().to_owned()))?;
            out.insert(tag.trim().to_owned(), level);
        }
        Ok(out)
    }

    /// Apply a comma-separated list of `tag=level`. The reserved tags `default`
    /// and `all` set the default level and the level of every target; other
    /// entries are applied afterwards so that they override `all`.
    ///
    /// # Errors
    /// Fails without changing anything if the input is malformed.
    pub fn setup_from_string(&self, input: &str) -> Result<(), TraceCtlError> {
        let config = Self::parse(input)?;
        if let Some(level) = config.get("default") {
            self.set_default_level(*level);
        }
        if let Some(level) = config.get("all") {
            self.set_level_all(*level);
        }
        config
            .iter()
            .filter(|(tag, _)| !matches!(tag.as_str(), "default" | "all"))
            .for_each(|(tag, level)| self.set_tag_level(tag, *level));
        Ok(())
    }

    #[must_use]
    pub fn get_target(&self, target: &str) -> Option<TargetConfig> {
        self.lock().targets.get(target).cloned()
    }

    #[must_use]
    pub fn get_targets_by_tag(&self, tag: &str) -> Vec<TargetConfig> {
        let registry = self.lock();
        registry
            .targets_with_tag(tag)
            .into_iter()
            .filter_map(|t| registry.targets.get(t).cloned())
            .collect()
    }

    #[must_use]
    pub fn as_config_string(&self) -> String {
        self.lock().as_config_string()
    }

    pub fn dump(&self) {
        info!("{}", *self.lock());
    }

    pub fn dump_targets_by_tag(&self) {
        let registry = self.lock();
        info!("{}", RegistryByTag(&registry));
    }
}

static TRACING_CTL: OnceLock<TracingControl> = OnceLock::new();

/// Get the process-wide [`TracingControl`], initializing tracing on first use.
///
/// # Panics
/// Panics if another global subscriber was installed before.
pub fn get_trace_ctl() -> &'static TracingControl {
    TRACING_CTL.get_or_init(|| match TracingControl::new() {
        Ok(ctl) => ctl,
        Err(e) => panic!("Fatal: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_target;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_link_time_registration() {
        custom_target!("ctl-test-a", LevelFilter::ERROR, &["ctl-test"]);
        let tctl = get_trace_ctl();
        assert!(tctl.get_target("ctl-test-a").is_some());
        // declared below, still collected at link time
        assert!(tctl.get_target("ctl-test-b").is_some());
        assert!(tctl.get_target(module_path!()).is_some());
        custom_target!("ctl-test-b", LevelFilter::WARN, &["ctl-test"]);
    }

    #[test]
    #[serial]
    fn test_tag_level() {
        custom_target!("tag-test-1", LevelFilter::DEBUG, &["tag-test"]);
        custom_target!("tag-test-2", LevelFilter::ERROR, &["tag-test"]);
        let tctl = get_trace_ctl();
        assert_eq!(tctl.get_targets_by_tag("tag-test").len(), 2);

        tctl.set_tag_level("tag-test", LevelFilter::OFF);
        for t in tctl.get_targets_by_tag("tag-test") {
            assert_eq!(t.level(), LevelFilter::OFF);
        }
        // targets are tagged with their own name too
        tctl.set_tag_level("tag-test-1", LevelFilter::TRACE);
        assert_eq!(
            tctl.get_target("tag-test-1").map(|t| t.level()),
            Some(LevelFilter::TRACE)
        );
    }

    #[test]
    #[serial]
    fn test_setup_from_string() {
        custom_target!("str-test", LevelFilter::INFO, &["str-tag"]);
        let tctl = get_trace_ctl();
        tctl.setup_from_string("default=warn, str-tag=error").unwrap();
        assert_eq!(tctl.get_default_level(), LevelFilter::WARN);
        assert_eq!(
            tctl.get_target("str-test").map(|t| t.level()),
            Some(LevelFilter::ERROR)
        );

        assert_eq!(
            tctl.setup_from_string("str-tag=loud"),
            Err(TraceCtlError::Level("loud".to_owned()))
        );
        assert_eq!(
            tctl.setup_from_string("str-tag=error, foo"),
            Err(TraceCtlError::Syntax("foo".to_owned()))
        );
        // failed parses change nothing
        assert_eq!(
            tctl.get_target("str-test").map(|t| t.level()),
            Some(LevelFilter::ERROR)
        );
        assert!(tctl.as_config_string().starts_with("default=warn"));
        tctl.set_default_level(LevelFilter::INFO);
    }
}
