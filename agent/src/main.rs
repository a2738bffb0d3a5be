// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

mod args;

use crate::args::{CmdArgs, Parser};
use vrouter_agent::kernel::KernelFlowTable;
use vrouter_agent::{Agent, AgentConfig, AgentError, exporter};

use flow_stats::TracingSink;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracectl::{custom_target, get_trace_ctl};
use tracing::{error, info, level_filters::LevelFilter};

// pulled in by the HTTP listener of the prometheus exporter
custom_target!("hyper", LevelFilter::ERROR, &[]);

fn init_logging(config: &AgentConfig, cmdline: Option<&str>) -> Result<(), AgentError> {
    let tctl = get_trace_ctl();
    tctl.set_default_level(LevelFilter::INFO);
    // the command line wins over the configuration file
    for tracing in [config.tracing.as_deref(), cmdline].into_iter().flatten() {
        tctl.setup_from_string(tracing)?;
    }
    Ok(())
}

/// Start the tasks and run until `stop` fires
async fn run(
    config: AgentConfig,
    mut stop: mpsc::UnboundedReceiver<()>,
) -> Result<(), AgentError> {
    if let Some(addr) = config.metrics_address {
        exporter::start_metrics_exporter(addr)?;
    }

    let mut agent = Agent::start(
        config.flow_stats.clone(),
        Box::new(TracingSink),
        KernelFlowTable::default(),
    )?;
    agent.db.set_controllers(config.controllers.clone()).await;
    agent.db.apply(&config.vrfs).await?;
    for table in &config.aging_tables {
        agent
            .stats
            .add_aging_table(
                table.key(),
                config.flow_stats.flow_stats_interval,
                table.cache_timeout,
            )
            .await?;
    }
    info!("vRouter agent running");

    if stop.recv().await.is_none() {
        error!("Stop signal handler is gone");
    }
    info!("Shutting down vRouter agent");
    agent.shutdown().await
}

fn main() -> ExitCode {
    let args = CmdArgs::parse();
    let tctl = get_trace_ctl();
    if args.show_tracing_tags() {
        tctl.dump_targets_by_tag();
        return ExitCode::SUCCESS;
    }
    if args.show_tracing_targets() {
        tctl.dump();
        return ExitCode::SUCCESS;
    }

    let config = match args.config().map(AgentConfig::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let config = AgentConfig {
        metrics_address: args.metrics_address().or(config.metrics_address),
        ..config
    };
    if let Err(e) = init_logging(&config, args.tracing()) {
        error!("Invalid tracing configuration: {e}");
        return ExitCode::FAILURE;
    }
    info!("Starting vRouter agent...");

    let (stop_tx, stop_rx) = mpsc::unbounded_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    }) {
        error!("Failed to set signal handler: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("vrouter-agent")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(config, stop_rx)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
