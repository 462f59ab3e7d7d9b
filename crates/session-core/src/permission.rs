//! Distributed write-permission handover.
//!
//! Changing a participant's write access must not race with that
//! participant's own activity stream: the host first pauses the target
//! through the external Stop coordinator, applies and broadcasts the
//! change on the apply context, then resumes the target. Handovers are
//! strictly sequential: a second change blocks until the first is
//! done.
//!
//! Incoming permission-change activities (the client side of the
//! protocol) are consumed here as well: validated against current
//! membership, then applied directly.

use crate::activity::Activity;
use crate::consumer::{ActivityConsumer, ConsumerError};
use crate::dispatch::{ActivityListener, ActivityProducer, ListenerRegistry, ProducerSupport, SessionListener};
use crate::executor::ApplyQueue;
use crate::participant::{ParticipantId, Permission, UserRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Reason string handed to the stop coordinator during a handover.
const STOP_REASON: &str = "Write access change in progress";

#[derive(Debug, Error)]
pub enum StopError {
    #[error("Stop request to {0} timed out")]
    Timeout(ParticipantId),

    #[error("Participant {0} is not reachable")]
    Unreachable(ParticipantId),

    #[error("Stop coordination failed: {0}")]
    Other(String),
}

/// Proof that one remote participant's activity stream is paused.
///
/// Consumed by `resume`: the pause is released exactly once.
#[async_trait]
pub trait StopHandle: Send + Sync {
    /// Unblock the remote participant. Returns false if the peer could
    /// not be unblocked (already running, protocol violation).
    async fn resume(self: Box<Self>) -> bool;
}

/// External Stop/Start coordinator.
///
/// `request_stop` blocks until the remote participant confirmed the
/// pause. Implementations must not call back into the session
/// synchronously while stopping.
#[async_trait]
pub trait StopCoordinator: Send + Sync {
    async fn request_stop(
        &self,
        user: &ParticipantId,
        reason: &str,
    ) -> Result<Box<dyn StopHandle>, StopError>;
}

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("Only the host may initiate a permission change")]
    NotHost,

    #[error("Permission change target {0} is not a session member")]
    UnknownTarget(ParticipantId),

    #[error("Could not pause {target} for the permission change")]
    StopFailed {
        target: ParticipantId,
        #[source]
        source: StopError,
    },
}

/// Implements the write-permission handover protocol.
///
/// The manager is an activity producer (it fires the permission-change
/// activity toward the network) and an activity consumer (it applies
/// changes received from the wire); the session factory registers it
/// as both.
pub struct PermissionManager {
    users: Arc<UserRegistry>,
    listeners: Arc<ListenerRegistry<dyn SessionListener>>,
    apply: Arc<ApplyQueue>,
    stop: Arc<dyn StopCoordinator>,
    producer: Arc<ProducerSupport>,
    /// Serializes handovers; no two changes are ever in flight.
    handover: tokio::sync::Mutex<()>,
}

impl PermissionManager {
    pub fn new(
        users: Arc<UserRegistry>,
        listeners: Arc<ListenerRegistry<dyn SessionListener>>,
        apply: Arc<ApplyQueue>,
        stop: Arc<dyn StopCoordinator>,
    ) -> Self {
        Self {
            users,
            listeners,
            apply,
            stop,
            producer: Arc::new(ProducerSupport::new()),
            handover: tokio::sync::Mutex::new(()),
        }
    }

    /// Change `target`'s write access.
    ///
    /// Host-only. For a remote target the call blocks across the whole
    /// stop → apply → resume round-trip. A resume failure after a
    /// successful apply is logged, not returned: the change has already
    /// taken effect locally and on the wire.
    pub async fn change_permission(
        &self,
        target: &ParticipantId,
        permission: Permission,
    ) -> Result<(), PermissionError> {
        let _guard = self.handover.lock().await;

        if !self.users.is_local_host() {
            return Err(PermissionError::NotHost);
        }
        let target_user = self
            .users
            .get(target)
            .filter(|u| u.in_session)
            .ok_or_else(|| PermissionError::UnknownTarget(target.clone()))?;

        if target_user.is_local {
            // The host changes its own permission: no stream to pause
            self.apply_and_broadcast(target.clone(), permission).await;
            return Ok(());
        }

        let handle = self
            .stop
            .request_stop(target, STOP_REASON)
            .await
            .map_err(|source| PermissionError::StopFailed {
                target: target.clone(),
                source,
            })?;

        self.apply_and_broadcast(target.clone(), permission).await;

        if !handle.resume().await {
            error!(
                %target,
                "Remote participant could not be unblocked after the permission change"
            );
        }
        Ok(())
    }

    /// Fire the activity and mutate local state, in that order, on the
    /// apply context.
    async fn apply_and_broadcast(&self, target: ParticipantId, permission: Permission) {
        let users = self.users.clone();
        let listeners = self.listeners.clone();
        let producer = self.producer.clone();
        let source = users.local_id().clone();

        self.apply
            .run(move || {
                producer.fire(Activity::PermissionChange {
                    source,
                    target: target.clone(),
                    permission,
                });
                users.set_permission(&target, permission);
                if let Some(user) = users.get(&target) {
                    for listener in listeners.snapshot() {
                        listener.permission_changed(&user);
                    }
                }
                debug!(%target, ?permission, "Permission change applied");
            })
            .await;
    }
}

impl ActivityProducer for PermissionManager {
    fn add_activity_listener(&self, listener: ActivityListener) {
        self.producer.add(listener);
    }

    fn remove_activity_listener(&self, listener: &ActivityListener) {
        self.producer.remove(listener);
    }
}

impl ActivityConsumer for PermissionManager {
    fn exec(&self, activity: &Activity) -> Result<(), ConsumerError> {
        let Activity::PermissionChange {
            target, permission, ..
        } = activity
        else {
            return Ok(());
        };

        if !self.users.is_member(target) {
            warn!(%target, "Permission change for non-member dropped");
            return Ok(());
        }
        self.users.set_permission(target, *permission);
        if let Some(user) = self.users.get(target) {
            for listener in self.listeners.snapshot() {
                listener.permission_changed(&user);
            }
        }
        Ok(())
    }
}
