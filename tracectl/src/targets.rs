// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Static registry of the tracing targets declared by every linked crate.

use crate::LevelFilter;
use linkme::distributed_slice;

/// A tracing target as declared with [`trace_target!`] or [`custom_target!`].
pub struct TraceTarget {
    pub(crate) target: &'static str,
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: &'static [&'static str],
}

impl TraceTarget {
    #[must_use]
    pub const fn new(
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) -> Self {
        Self {
            target,
            name,
            level,
            tags,
        }
    }
}

#[distributed_slice]
pub static TRACE_TARGETS: [TraceTarget];

#[doc(hidden)]
#[macro_export]
macro_rules! trace_target_deps {
    () => {
        use linkme::distributed_slice;
        use $crate::LevelFilter;
        use $crate::targets::{TRACE_TARGETS, TraceTarget};
    };
}

/// Declare the tracing target of the calling module, with a short name used as
/// tag, its default level and extra tags.
#[macro_export]
macro_rules! trace_target {
    // each expansion lives in its own const scope so that the static gets a
    // distinct linker name on every invocation
    ($name:expr, $level:expr, $tags:expr) => {
        const _: () = {
            $crate::trace_target_deps!();

            #[distributed_slice(TRACE_TARGETS)]
            static TRACE_TGT: TraceTarget = TraceTarget::new(module_path!(), $name, $level, $tags);
        };
    };
}

/// Declare a tracing target that is not a module path (e.g. a dependency).
#[macro_export]
macro_rules! custom_target {
    ($target:expr, $level:expr, $tags:expr) => {
        const _: () = {
            $crate::trace_target_deps!();

            #[distributed_slice(TRACE_TARGETS)]
            static TRACE_TGT: TraceTarget = TraceTarget::new($target, $target, $level, $tags);
        };
    };
}
