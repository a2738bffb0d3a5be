// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

pub(crate) use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "vRouter agent")]
#[command(version = "0.1")]
#[command(about = "Flow management and flow aging for the vRouter", long_about = None)]
pub(crate) struct CmdArgs {
    #[arg(long, value_name = "YAML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "tracing configuration, e.g. default=info,flow=debug")]
    tracing: Option<String>,

    #[arg(long, default_value_t = false, help = "Show the tracing targets and exit")]
    show_tracing_targets: bool,

    #[arg(long, default_value_t = false, help = "Show the tracing tags and exit")]
    show_tracing_tags: bool,

    #[arg(long, value_name = "address of the prometheus metrics listener")]
    metrics_address: Option<SocketAddr>,
}

impl CmdArgs {
    pub fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
    pub fn tracing(&self) -> Option<&str> {
        self.tracing.as_deref()
    }
    pub fn show_tracing_targets(&self) -> bool {
        self.show_tracing_targets
    }
    pub fn show_tracing_tags(&self) -> bool {
        self.show_tracing_tags
    }
    pub fn metrics_address(&self) -> Option<SocketAddr> {
        self.metrics_address
    }
}
