// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Task identities and their exclusion policy. Work done under one identity
//! never overlaps with work done under the same identity, nor with work done
//! under an identity it is excluded with.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracectl::trace_target;
use tracing::trace;

trace_target!("agent-tasks", LevelFilter::INFO, &["agent"]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum TaskId {
    #[strum(serialize = "Agent::FlowHandler")]
    FlowHandler,
    #[strum(serialize = "Agent::FlowMgmt")]
    FlowMgmt,
    #[strum(serialize = "Agent::StatsCollector")]
    StatsCollector,
    #[strum(serialize = "db::DBTable")]
    DbTable,
}

impl TaskId {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        match self {
            TaskId::FlowHandler => 0,
            TaskId::FlowMgmt => 1,
            TaskId::StatsCollector => 2,
            TaskId::DbTable => 3,
        }
    }
}

/// Pairs of identities that never run at the same time
pub const EXCLUSIONS: &[(TaskId, TaskId)] = &[
    (TaskId::FlowMgmt, TaskId::DbTable),
    (TaskId::StatsCollector, TaskId::FlowHandler),
];

/// Proof that the holder runs as a task identity. Dropping it lets the
/// excluded identities run.
#[derive(Debug)]
pub struct TaskGuard {
    task: TaskId,
    _locks: Vec<OwnedMutexGuard<()>>,
}

impl TaskGuard {
    #[must_use]
    pub fn task(&self) -> TaskId {
        self.task
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        trace!("{} done", self.task);
    }
}

/// The locks behind task identities: one per identity, then one per
/// exclusion pair. Guards take them in that order.
#[derive(Debug)]
pub struct TaskGate {
    locks: Vec<Arc<Mutex<()>>>,
}

impl Default for TaskGate {
    fn default() -> Self {
        Self {
            locks: (0..TaskId::COUNT + EXCLUSIONS.len())
                .map(|_| Arc::new(Mutex::new(())))
                .collect(),
        }
    }
}

impl TaskGate {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock_indices(task: TaskId) -> impl Iterator<Item = usize> {
        std::iter::once(task.index()).chain(
            EXCLUSIONS
                .iter()
                .enumerate()
                .filter(move |(_, (a, b))| *a == task || *b == task)
                .map(|(n, _)| TaskId::COUNT + n),
        )
    }

    /// Wait until `task` may run
    pub async fn enter(&self, task: TaskId) -> TaskGuard {
        let mut locks = vec![];
        for index in Self::lock_indices(task) {
            locks.push(self.locks[index].clone().lock_owned().await);
        }
        trace!("{task} running");
        TaskGuard {
            task,
            _locks: locks,
        }
    }

    /// Run as `task` if nothing excludes it right now
    #[must_use]
    pub fn try_enter(&self, task: TaskId) -> Option<TaskGuard> {
        let mut locks = vec![];
        for index in Self::lock_indices(task) {
            locks.push(self.locks[index].clone().try_lock_owned().ok()?);
        }
        Some(TaskGuard {
            task,
            _locks: locks,
        })
    }

    /// Whether `a` and `b` may run at the same time
    #[must_use]
    pub fn compatible(a: TaskId, b: TaskId) -> bool {
        a != b
            && !EXCLUSIONS
                .iter()
                .any(|(x, y)| (*x == a && *y == b) || (*x == b && *y == a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use strum::IntoEnumIterator;

    #[test]
    fn test_task_names() {
        assert_eq!(TaskId::FlowHandler.to_string(), "Agent::FlowHandler");
        assert_eq!(TaskId::DbTable.to_string(), "db::DBTable");
    }

    #[tokio::test]
    async fn test_exclusions() {
        let gate = TaskGate::new();
        for a in TaskId::iter() {
            let held = gate.enter(a).await;
            for b in TaskId::iter() {
                let other = gate.try_enter(b);
                assert_eq!(other.is_some(), TaskGate::compatible(a, b), "{a} vs {b}");
            }
            drop(held);
        }
    }

    #[tokio::test]
    async fn test_compatible_tasks_run_together() {
        let gate = TaskGate::new();
        let _mgmt = gate.enter(TaskId::FlowMgmt).await;
        let _stats = gate.enter(TaskId::StatsCollector).await;
        assert!(gate.try_enter(TaskId::DbTable).is_none());
        assert!(gate.try_enter(TaskId::FlowHandler).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_excluded_tasks_never_overlap() {
        let gate = TaskGate::new();
        let running = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for n in 0..16 {
            let task = if n % 2 == 0 {
                TaskId::FlowMgmt
            } else {
                TaskId::DbTable
            };
            let gate = gate.clone();
            let running = running.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let _guard = gate.enter(task).await;
                    assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_micros(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
