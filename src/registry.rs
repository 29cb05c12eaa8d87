//! In-flight acquisition tasks, keyed by book identifier.
//!
//! The registry is the only shared mutable state of the coordinator. Every
//! read-modify-write goes through a single `DashMap` entry, so operations on
//! one identifier are atomic with respect to each other. Mutations that come
//! from a transfer carry its task id and are ignored once that task has been
//! retired.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bearer::BearerToken;
use crate::download::TransferControl;
use crate::progress::ProgressSource;
use crate::rights::RightsManagementKind;

/// One in-flight acquisition.
#[derive(Debug)]
pub struct AcquisitionTask {
    task_id: u64,
    progress: f64,
    rights: RightsManagementKind,
    bearer_token: Option<BearerToken>,
    cancel: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
}

impl AcquisitionTask {
    fn new(task_id: u64) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            task_id,
            progress: 0.0,
            rights: RightsManagementKind::Unknown,
            bearer_token: None,
            cancel: CancellationToken::new(),
            pause: Arc::new(pause),
        }
    }

    /// Task id, unique for the registry's lifetime.
    #[must_use]
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Cancels the transfer driven by this task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Signals for the transfer driven by this task.
    #[must_use]
    pub fn control(&self) -> TransferControl {
        TransferControl::new(self.cancel.clone(), self.pause.subscribe())
    }

    /// Cancellation token of this task.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id,
            progress: self.progress,
            rights: self.rights,
            bearer_token: self.bearer_token.clone(),
        }
    }
}

/// Copy of a task's observable fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub task_id: u64,
    pub progress: f64,
    pub rights: RightsManagementKind,
    pub bearer_token: Option<BearerToken>,
}

/// Maps book identifiers to their in-flight task.
#[derive(Debug, Default)]
pub struct AcquisitionTaskRegistry {
    tasks: DashMap<String, AcquisitionTask>,
    next_id: AtomicU64,
}

impl AcquisitionTaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a task with a fresh id. It is not registered yet.
    pub fn new_task(&self) -> AcquisitionTask {
        AcquisitionTask::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Registers `task` unless the identifier already has one.
    ///
    /// # Errors
    ///
    /// Hands the task back when the slot is occupied.
    pub fn insert(
        &self,
        identifier: &str,
        task: AcquisitionTask,
    ) -> Result<TransferControl, AcquisitionTask> {
        match self.tasks.entry(identifier.to_string()) {
            Entry::Occupied(_) => Err(task),
            Entry::Vacant(slot) => {
                let control = task.control();
                debug!(identifier = %identifier, task_id = task.task_id, "task registered");
                slot.insert(task);
                Ok(control)
            }
        }
    }

    /// Retires the task `expected_task_id` and registers `task` in its place
    /// in one step.
    ///
    /// # Errors
    ///
    /// Hands the task back when the slot is empty or holds another task.
    pub fn replace(
        &self,
        identifier: &str,
        expected_task_id: u64,
        task: AcquisitionTask,
    ) -> Result<TransferControl, AcquisitionTask> {
        match self.tasks.entry(identifier.to_string()) {
            Entry::Occupied(mut slot) if slot.get().task_id == expected_task_id => {
                let control = task.control();
                debug!(
                    identifier = %identifier,
                    retired = expected_task_id,
                    task_id = task.task_id,
                    "task replaced"
                );
                slot.insert(task);
                Ok(control)
            }
            _ => Err(task),
        }
    }

    /// Snapshot of the task for `identifier`.
    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<TaskSnapshot> {
        self.tasks.get(identifier).map(|task| task.snapshot())
    }

    /// Removes and returns the task for `identifier`.
    pub fn remove(&self, identifier: &str) -> Option<AcquisitionTask> {
        self.tasks.remove(identifier).map(|(_, task)| task)
    }

    /// Removes the task only if it is still `task_id`.
    pub fn remove_if_current(&self, identifier: &str, task_id: u64) -> Option<AcquisitionTask> {
        self.tasks
            .remove_if(identifier, |_, task| task.task_id == task_id)
            .map(|(_, task)| task)
    }

    /// Whether `task_id` is the registered task for `identifier`.
    #[must_use]
    pub fn is_current(&self, identifier: &str, task_id: u64) -> bool {
        self.tasks
            .get(identifier)
            .is_some_and(|task| task.task_id == task_id)
    }

    /// Records the rights kind of a task. Returns false for a retired task.
    pub fn update_rights(
        &self,
        identifier: &str,
        task_id: u64,
        rights: RightsManagementKind,
    ) -> bool {
        self.with_current(identifier, task_id, |task| task.rights = rights)
    }

    /// Records progress, clamped to `[0, 1]`. Returns false for a retired task.
    pub fn update_progress(&self, identifier: &str, task_id: u64, fraction: f64) -> bool {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.with_current(identifier, task_id, |task| task.progress = fraction)
    }

    /// Attaches a captured bearer token. Returns false for a retired task.
    pub fn set_bearer_token(&self, identifier: &str, task_id: u64, token: BearerToken) -> bool {
        self.with_current(identifier, task_id, |task| task.bearer_token = Some(token))
    }

    /// Pauses or resumes the transfer. Returns false if no task exists.
    pub fn set_paused(&self, identifier: &str, paused: bool) -> bool {
        match self.tasks.get(identifier) {
            Some(task) => {
                task.pause.send_replace(paused);
                true
            }
            None => false,
        }
    }

    /// Progress of `identifier`, 0 when nothing is in flight.
    #[must_use]
    pub fn progress(&self, identifier: &str) -> f64 {
        self.tasks
            .get(identifier)
            .map_or(0.0, |task| task.progress)
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Removes every task.
    pub fn drain(&self) -> Vec<(String, AcquisitionTask)> {
        let keys: Vec<String> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.tasks.remove(&key))
            .collect()
    }

    fn with_current(
        &self,
        identifier: &str,
        task_id: u64,
        update: impl FnOnce(&mut AcquisitionTask),
    ) -> bool {
        match self.tasks.get_mut(identifier) {
            Some(mut task) if task.task_id == task_id => {
                update(&mut task);
                true
            }
            _ => false,
        }
    }
}

impl ProgressSource for AcquisitionTaskRegistry {
    fn progress_snapshot(&self) -> HashMap<String, f64> {
        self.tasks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().progress))
            .collect()
    }
}
