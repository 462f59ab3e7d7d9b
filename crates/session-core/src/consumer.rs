//! ActivityConsumer: the receiving end of local activity execution.
//!
//! Consumers are applied in two phases: passive observers first, then
//! active consumers that mutate local state. A failing consumer never
//! stops the fan-out: its error is logged with the offending activity
//! and the remaining consumers still run.

use crate::activity::Activity;
use thiserror::Error;

/// Failure of a single consumer for a single activity.
///
/// Expected, recoverable by design: the dispatcher logs it and moves
/// on. A consumer that cannot apply an activity must not poison the
/// batch.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConsumerError {
    message: String,
}

impl ConsumerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Which fan-out phase a consumer runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerPriority {
    /// Mutates local state (applies edits, file operations).
    Active,
    /// Observes activities (indices, awareness displays).
    Passive,
}

/// A subsystem that activities are applied to.
pub trait ActivityConsumer: Send + Sync {
    fn exec(&self, activity: &Activity) -> Result<(), ConsumerError>;
}
