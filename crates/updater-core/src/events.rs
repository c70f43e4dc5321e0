//! Event system for front-end decoupling.
//!
//! Lets a daemon, CLI or test harness observe activation progress without
//! coupling to the updater internals.

use std::fmt;
use std::sync::Mutex;

use crate::state::ActivationState;
use crate::version::VersionId;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Events emitted by the item updater.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdaterEvent {
    /// A version entered the registry.
    Registered { id: VersionId, state: ActivationState },
    /// Activation state changed.
    StateChanged {
        id: VersionId,
        from: ActivationState,
        to: ActivationState,
    },
    /// Activation progress (0-100).
    Progress { id: VersionId, percent: u8 },
    /// Redundancy priority assigned or bumped.
    PriorityChanged { id: VersionId, priority: u8 },
    /// Boot environment now selects `id`.
    BootTargetChanged { id: VersionId },
    /// Version removed from the registry.
    Erased { id: VersionId },
    /// Signature verification failed.
    VerifyFailed { id: VersionId },
    /// Minimum ship level not met.
    PolicyViolation {
        id: VersionId,
        min: String,
        actual: String,
    },
    /// Reboot requested to apply an image.
    RebootRequested,
    /// Log message.
    Log { level: LogLevel, message: String },
}

/// Observer trait for receiving updater events.
pub trait UpdaterObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdaterEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdaterObserver for NullObserver {
    fn on_event(&self, _event: &UpdaterEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdaterObserver for TracingObserver {
    fn on_event(&self, event: &UpdaterEvent) {
        match event {
            UpdaterEvent::Registered { id, state } => {
                tracing::info!(id = %id, state = %state, "Version registered");
            }
            UpdaterEvent::StateChanged { id, from, to } => {
                tracing::info!(id = %id, from = %from, to = %to, "Activation state changed");
            }
            UpdaterEvent::Progress { id, percent } => {
                tracing::debug!(id = %id, progress = %format!("{}%", percent), "Progress");
            }
            UpdaterEvent::PriorityChanged { id, priority } => {
                tracing::debug!(id = %id, priority = priority, "Priority changed");
            }
            UpdaterEvent::BootTargetChanged { id } => {
                tracing::info!(id = %id, "Boot target updated");
            }
            UpdaterEvent::Erased { id } => {
                tracing::info!(id = %id, "Version erased");
            }
            UpdaterEvent::VerifyFailed { id } => {
                tracing::error!(id = %id, "Error occurred during image validation");
            }
            UpdaterEvent::PolicyViolation { id, min, actual } => {
                tracing::error!(
                    id = %id,
                    min_version = %min,
                    actual_version = %actual,
                    "Minimum ship level not met"
                );
            }
            UpdaterEvent::RebootRequested => {
                tracing::info!("Reboot requested");
            }
            UpdaterEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}

/// Observer that keeps every event, for tests and front-ends that poll.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<UpdaterEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UpdaterEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn drain_events(&self) -> Vec<UpdaterEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }
}

impl UpdaterObserver for RecordingObserver {
    fn on_event(&self, event: &UpdaterEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
