//! Boundary traits toward the messaging transport and the activity
//! handler.
//!
//! Implementations live outside this crate: the transport wraps the
//! federated messaging layer, the handler wraps the concurrency-engine
//! integration. The session only ever talks to these traits.

use crate::activity::Activity;
use crate::participant::{ParticipantId, User};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("No acknowledgment from {0}")]
    NoAcknowledgment(ParticipantId),

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Outbound edge of the session toward the network.
///
/// Errors reported by `send` are caught and logged by the session -
/// a transport failure must never crash activity routing.
#[async_trait]
pub trait ActivityTransmitter: Send + Sync {
    /// Make the transport aware of a joining participant.
    fn register_user(&self, user: &User);

    /// Drop a participant from the routing tables and release its
    /// connection.
    fn unregister_user(&self, id: &ParticipantId);

    /// Deliver one activity to the given recipients. A recipient equal
    /// to the local user means "loop back locally".
    async fn send(&self, recipients: &[ParticipantId], activity: &Activity) -> Result<()>;

    /// Broadcast the authoritative user list and wait until every
    /// recipient acknowledged. The caller bounds the wait with its own
    /// timeout.
    async fn synchronize_user_list(
        &self,
        users: &[User],
        recipients: &[ParticipantId],
    ) -> Result<()>;
}

/// Callback the session hands to the activity handler.
///
/// The handler decides *where* activities go; these two entry points
/// are *how*. Both are non-blocking: `send` enqueues onto the
/// session's ordered outgoing lane, `execute` runs the local consumer
/// fan-out inline.
pub trait ActivityHandlerCallback: Send + Sync {
    fn send(&self, recipients: Vec<ParticipantId>, activity: Activity);
    fn execute(&self, activity: Activity);
}

/// The external activity handler between producers, the network, and
/// local execution.
///
/// The session calls each hook once per locally observed batch; the
/// handler transforms activities as needed (concurrency engine,
/// recipient selection) and feeds the results back through the
/// callback. Hooks must not block and must not call back into
/// blocking session operations.
pub trait ActivityHandler: Send + Sync {
    /// A batch fired by local producers, headed for the network and/or
    /// local re-entrant execution.
    fn handle_outgoing(&self, activities: Vec<Activity>, callback: Arc<dyn ActivityHandlerCallback>);

    /// A validated, de-queued inbound batch, headed for local
    /// execution.
    fn handle_incoming(&self, activities: Vec<Activity>, callback: Arc<dyn ActivityHandlerCallback>);
}
