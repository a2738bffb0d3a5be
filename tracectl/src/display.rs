// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Display of the tracing configuration

use crate::control::{TargetConfig, TargetRegistry};
use std::fmt::{Display, Formatter, Result};

macro_rules! TARGET_FMT {
    () => {
        "{:>48} │ {:>8} │ {}"
    };
}

impl Display for TargetConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(
            f,
            TARGET_FMT!(),
            self.target,
            self.level,
            self.tags.join(",")
        )
    }
}

impl Display for TargetRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        writeln!(f)?;
        writeln!(f, "{:>40}", "──── Tracing targets ────")?;
        writeln!(f, TARGET_FMT!(), "TARGET", "LEVEL", "TAGS")?;
        for target in self.targets.values() {
            writeln!(f, "{target}")?;
        }
        write!(f, TARGET_FMT!(), "(default)", self.default, "--")
    }
}

pub(crate) struct RegistryByTag<'a>(pub(crate) &'a TargetRegistry);

impl Display for RegistryByTag<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let registry = self.0;
        writeln!(f)?;
        writeln!(f, "{:>40}", "──── Tracing targets by tag ────")?;
        for (tag, targets) in &registry.tags {
            writeln!(f, " {tag}:")?;
            for target in targets.iter().filter_map(|t| registry.targets.get(t)) {
                writeln!(f, "      {:<48} : {}", target.target, target.level)?;
            }
        }
        Ok(())
    }
}
