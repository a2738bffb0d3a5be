// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The vRouter agent tasks: flow management, flow stats collection, the flow
//! table and the operational database, each running under its own task
//! identity.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

pub mod config;
pub mod db_table;
pub mod errors;
pub mod exporter;
pub mod flow_handler;
pub mod flow_mgmt_task;
pub mod kernel;
pub mod oper_db;
pub mod runtime;
pub mod stats_task;
pub mod task;

pub use config::AgentConfig;
pub use errors::AgentError;
pub use runtime::Agent;

use tracectl::trace_target;
trace_target!("agent", LevelFilter::INFO, &["agent"]);
