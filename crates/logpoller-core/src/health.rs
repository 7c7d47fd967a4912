//! Lifecycle state and critical-error reporting.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::PollerError;

/// Runtime state of the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollerState {
    /// Not yet started.
    Idle,
    /// Control loop is running.
    Running,
    /// Shutting down gracefully.
    Stopping,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for PollerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Result of [`HealthMonitor::report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub state: PollerState,
    /// The control loop is running.
    pub ready: bool,
    /// No critical error was recorded since the previous report.
    pub healthy: bool,
    /// Critical errors recorded since the previous report, oldest first.
    pub errors: Vec<String>,
}

struct Inner {
    state: PollerState,
    errors: VecDeque<String>,
}

/// Tracks lifecycle state and buffers critical errors for operators.
///
/// The buffer is bounded; when full, the oldest error is dropped.
pub struct HealthMonitor {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl HealthMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                state: PollerState::Idle,
                errors: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, state: PollerState) {
        self.lock().state = state;
    }

    /// Record a critical error.
    pub fn record(&self, err: &PollerError) {
        let mut inner = self.lock();
        if inner.errors.len() == self.capacity {
            inner.errors.pop_front();
        }
        inner.errors.push_back(err.to_string());
    }

    /// Current health. Reading drains the error buffer.
    pub fn report(&self) -> HealthReport {
        let mut inner = self.lock();
        let errors: Vec<String> = inner.errors.drain(..).collect();
        HealthReport {
            state: inner.state,
            ready: inner.state == PollerState::Running,
            healthy: errors.is_empty(),
            errors,
        }
    }
}
