//! Task state machine
//!
//! ```text
//! Pending ─► Running{1} ─► Succeeded
//!                │
//!                └─► Failed{retryable: true} ─► Running{n+1} ─► ...
//!                └─► Failed{retryable: false}            (terminal)
//! ```

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running { attempt: u32 },
    Succeeded,
    Failed { retryable: bool },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed { retryable: false }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal transition for task {task}: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub task: String,
    pub from: TaskState,
    pub to: TaskState,
}

/// Tracks one task through its attempts, rejecting illegal transitions
#[derive(Debug, Clone)]
pub struct TaskTracker {
    task: String,
    state: TaskState,
    attempts: u32,
    history: Vec<TaskState>,
}

impl TaskTracker {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            state: TaskState::Pending,
            attempts: 0,
            history: vec![TaskState::Pending],
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[TaskState] {
        &self.history
    }

    /// Enter `Running` for the next attempt, returning its number
    pub fn begin_attempt(&mut self) -> Result<u32, TransitionError> {
        let attempt = self.attempts + 1;
        self.transition(TaskState::Running { attempt })?;
        self.attempts = attempt;
        Ok(attempt)
    }

    pub fn succeed(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskState::Succeeded)
    }

    pub fn fail(&mut self, retryable: bool) -> Result<(), TransitionError> {
        self.transition(TaskState::Failed { retryable })
    }

    fn transition(&mut self, to: TaskState) -> Result<(), TransitionError> {
        let allowed = match (self.state, to) {
            (TaskState::Pending, TaskState::Running { attempt }) => attempt == 1,
            (TaskState::Running { .. }, TaskState::Succeeded) => true,
            (TaskState::Running { .. }, TaskState::Failed { .. }) => true,
            (TaskState::Failed { retryable: true }, TaskState::Running { attempt }) => {
                attempt == self.attempts + 1
            }
            _ => false,
        };
        if !allowed {
            return Err(TransitionError {
                task: self.task.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.history.push(to);
        Ok(())
    }
}
