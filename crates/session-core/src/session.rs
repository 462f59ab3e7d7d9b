//! Session: the orchestrator gluing membership, queuing, sharing, and
//! permission handling together.
//!
//! Activity flow:
//!
//! 1. A registered producer fires an activity. The session's single
//!    internal listener hands it to the external [`ActivityHandler`]
//!    as an outgoing batch.
//! 2. The handler calls back: `send` puts the activity on the ordered
//!    outgoing lane (suppression and consistency checks happen there,
//!    then the transmitter), `execute` runs the local consumer fan-out.
//! 3. Inbound batches enter through [`Session::exec`]: invalid
//!    activities are dropped, the queuer defers what its reference
//!    point is not ready for, the rest goes to the handler as an
//!    incoming batch, which feeds `execute`.
//!
//! Local execution fans out to passive consumers first, then active
//! ones; afterwards filesystem mutations update the partial-sharing
//! membership exactly once.

use crate::activity::Activity;
use crate::consistency::update_partial_sharing;
use crate::consumer::{ActivityConsumer, ConsumerPriority};
use crate::dispatch::{ActivityListener, ActivityProducer, ListenerRegistry, SessionListener};
use crate::executor::ApplyQueue;
use crate::fs::FileStore;
use crate::participant::{ParticipantId, Permission, User, UserRegistry, UserRegistryError};
use crate::permission::{PermissionError, PermissionManager, StopCoordinator};
use crate::queue::ActivityQueuer;
use crate::reference_point::ReferencePoint;
use crate::shared_resources::{SharedResourceMap, SharedResourceMapError};
use crate::transport::{ActivityHandler, ActivityHandlerCallback, ActivityTransmitter, TransportError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Lifecycle of one session. `Starting`/`Stopping` are transient;
/// routing entry points treat anything but `Started` as "drop and log".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Tunables injected at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-call bound on the blocking user-list synchronization.
    pub user_list_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_list_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session is not running")]
    NotRunning,

    #[error(transparent)]
    User(#[from] UserRegistryError),

    #[error(transparent)]
    SharedResources(#[from] SharedResourceMapError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("User-list synchronization for {user} failed, join rolled back")]
    JoinSyncFailed {
        user: ParticipantId,
        #[source]
        source: TransportError,
    },

    #[error("User-list synchronization for {user} timed out after {timeout:?}, join rolled back")]
    JoinTimeout {
        user: ParticipantId,
        timeout: Duration,
    },

    #[error("'{0}' is a host-only operation")]
    HostOnly(&'static str),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Default)]
struct Consumers {
    active: Vec<Arc<dyn ActivityConsumer>>,
    passive: Vec<Arc<dyn ActivityConsumer>>,
}

struct Shared {
    users: Arc<UserRegistry>,
    resources: Arc<SharedResourceMap>,
    queuer: ActivityQueuer,
    consumers: Mutex<Consumers>,
    producers: Mutex<Vec<Arc<dyn ActivityProducer>>>,
    listeners: Arc<ListenerRegistry<dyn SessionListener>>,
    permission: Arc<PermissionManager>,
    handler: Arc<dyn ActivityHandler>,
    transmitter: Arc<dyn ActivityTransmitter>,
    fs: Arc<dyn FileStore>,
    apply: Arc<ApplyQueue>,
    state: Mutex<SessionState>,
    config: SessionConfig,
    /// Ordered outgoing lane; present only while started.
    outgoing: Mutex<Option<mpsc::UnboundedSender<(Vec<ParticipantId>, Activity)>>>,
    /// The one listener registered with every producer.
    internal_listener: ActivityListener,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn callback(self: &Arc<Self>) -> Arc<dyn ActivityHandlerCallback> {
        Arc::new(SessionCallback {
            shared: Arc::downgrade(self),
        })
    }

    fn enqueue_outgoing(&self, recipients: Vec<ParticipantId>, activity: Activity) {
        let outgoing = self.outgoing.lock().unwrap();
        match outgoing.as_ref() {
            Some(tx) => {
                // Receiver lives as long as the sender is installed
                let _ = tx.send((recipients, activity));
            }
            None => warn!(
                kind = activity.kind(),
                "Outgoing activity dropped: session not running"
            ),
        }
    }

    /// Suppression and consistency checks, then the transmitter.
    async fn dispatch_outgoing(&self, mut recipients: Vec<ParticipantId>, activity: Activity) {
        if activity.resource().is_some() && self.resources.size() == 0 {
            debug!(
                kind = activity.kind(),
                "Resource activity suppressed: nothing is shared"
            );
            return;
        }

        // Host side: never deliver resource activities for a point the
        // recipient has not fully received
        if let Some(resource) = activity.resource() {
            if self.users.is_local_host() {
                let point = resource.reference_point.clone();
                recipients.retain(|r| {
                    r == self.users.local_id()
                        || self.resources.user_has_reference_point(r, &point)
                });
            }
        }

        if activity.mutates_filesystem()
            && recipients.iter().any(|r| r == self.users.local_id())
        {
            let outcome = update_partial_sharing(&self.resources, &*self.fs, &activity);
            if !outcome.is_accepted() {
                // The receiving side recovers via full resync, not via
                // this message
                debug!(kind = activity.kind(), "Send suppressed by consistency check");
                return;
            }
        }

        if recipients.is_empty() {
            return;
        }
        if let Err(e) = self.transmitter.send(&recipients, &activity).await {
            error!(kind = activity.kind(), error = %e, "Failed to send activity");
        }
    }

    /// Local execution: passive consumers, then active ones, then the
    /// partial-sharing membership update.
    fn execute_activity(&self, activity: &Activity) {
        let (passive, active) = {
            let consumers = self.consumers.lock().unwrap();
            (consumers.passive.clone(), consumers.active.clone())
        };
        for consumer in passive.iter().chain(active.iter()) {
            if let Err(e) = consumer.exec(activity) {
                error!(
                    kind = activity.kind(),
                    source = %activity.source(),
                    error = %e,
                    "Consumer failed; fan-out continues"
                );
            }
        }

        if activity.mutates_filesystem() {
            // Post-fan-out by design; a rejection leaves the membership
            // stale until the next full resync
            let _ = update_partial_sharing(&self.resources, &*self.fs, activity);
        }
    }
}

struct SessionCallback {
    shared: Weak<Shared>,
}

impl ActivityHandlerCallback for SessionCallback {
    fn send(&self, recipients: Vec<ParticipantId>, activity: Activity) {
        if let Some(shared) = self.shared.upgrade() {
            shared.enqueue_outgoing(recipients, activity);
        }
    }

    fn execute(&self, activity: Activity) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.state() != SessionState::Started {
            warn!(
                kind = activity.kind(),
                "Activity execution dropped: session not running"
            );
            return;
        }
        shared.execute_activity(&activity);
    }
}

/// One collaborative session.
///
/// Built by [`SessionBuilder`]; all collaborators are injected, there
/// is no ambient lookup. Cloning hands out another handle to the same
/// session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    // ---- lifecycle --------------------------------------------------

    /// Start activity routing. May be called exactly once.
    ///
    /// Panics when called twice or on a stopped session: lifecycle
    /// misuse is a caller bug, not a runtime condition.
    pub fn start(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            assert_eq!(
                *state,
                SessionState::Created,
                "start() may be called exactly once, on a fresh session"
            );
            *state = SessionState::Starting;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.shared.outgoing.lock().unwrap() = Some(tx);
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some((recipients, activity)) = rx.recv().await {
                shared.dispatch_outgoing(recipients, activity).await;
            }
        });

        *self.shared.state.lock().unwrap() = SessionState::Started;
        info!(local = %self.shared.users.local_id(), "Session started");
    }

    /// Stop activity routing and detach from all producers. May be
    /// called exactly once, after `start`.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            assert_eq!(
                *state,
                SessionState::Started,
                "stop() requires a started session"
            );
            *state = SessionState::Stopping;
        }

        let producers: Vec<_> = {
            let mut producers = self.shared.producers.lock().unwrap();
            producers.drain(..).collect()
        };
        for producer in producers {
            producer.remove_activity_listener(&self.shared.internal_listener);
        }
        *self.shared.outgoing.lock().unwrap() = None;

        *self.shared.state.lock().unwrap() = SessionState::Stopped;
        info!("Session stopped");
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    fn ensure_started(&self) -> Result<()> {
        match self.state() {
            SessionState::Started => Ok(()),
            _ => Err(SessionError::NotRunning),
        }
    }

    // ---- membership -------------------------------------------------

    /// Admit a participant.
    ///
    /// On the host this registers the user with the transport and runs
    /// the blocking user-list synchronization; if any remote fails to
    /// acknowledge in time the join is rolled back and reported as an
    /// error. Must not be called from the thread delivering incoming
    /// activities.
    pub async fn add_user(
        &self,
        mut user: User,
        properties: HashMap<String, Value>,
    ) -> Result<()> {
        self.ensure_started()?;
        user.properties.extend(properties);
        let id = user.id.clone();
        self.shared.users.add(user.clone())?;

        if self.shared.users.is_local_host() {
            self.shared.transmitter.register_user(&user);

            let recipients: Vec<ParticipantId> = self
                .shared
                .users
                .users()
                .into_iter()
                .filter(|u| !u.is_local)
                .map(|u| u.id)
                .collect();
            let snapshot = self.shared.users.users();
            let timeout = self.shared.config.user_list_timeout;
            let sync = self
                .shared
                .transmitter
                .synchronize_user_list(&snapshot, &recipients);

            let failure = match tokio::time::timeout(timeout, sync).await {
                Ok(Ok(())) => None,
                Ok(Err(source)) => Some(SessionError::JoinSyncFailed {
                    user: id.clone(),
                    source,
                }),
                Err(_) => Some(SessionError::JoinTimeout {
                    user: id.clone(),
                    timeout,
                }),
            };
            if let Some(err) = failure {
                warn!(user = %id, "Join rolled back: user list was not acknowledged");
                self.shared.transmitter.unregister_user(&id);
                self.shared.users.remove(&id);
                return Err(err);
            }
        }

        let shared = self.shared.clone();
        let joined_id = id.clone();
        self.shared
            .apply
            .run(move || {
                if let Some(user) = shared.users.mark_joined(&joined_id) {
                    for listener in shared.listeners.snapshot() {
                        listener.user_joined(&user);
                    }
                }
            })
            .await;
        info!(user = %id, "Participant joined");
        Ok(())
    }

    /// Remove a participant (leave or kick).
    ///
    /// Idempotent: removing an absent or already-left participant is a
    /// logged no-op. On the host the updated user list is re-broadcast
    /// to the remaining remotes; failures there are logged, not fatal.
    pub async fn remove_user(&self, id: &ParticipantId, kicked: bool) {
        if !self.shared.users.mark_left(id) {
            warn!(user = %id, "remove_user: participant already out of the session");
            return;
        }

        self.shared.resources.user_left(id);

        let remaining: Vec<ParticipantId> = self.shared.users.remote_ids();
        if self.shared.users.is_local_host() && !remaining.is_empty() {
            let snapshot: Vec<User> = self
                .shared
                .users
                .users()
                .into_iter()
                .filter(|u| u.in_session)
                .collect();
            let timeout = self.shared.config.user_list_timeout;
            let sync = self
                .shared
                .transmitter
                .synchronize_user_list(&snapshot, &remaining);
            match tokio::time::timeout(timeout, sync).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(user = %id, error = %e, "User-list update after leave failed")
                }
                Err(_) => warn!(user = %id, "User-list update after leave timed out"),
            }
        }

        // Releases the participant's connection as well
        self.shared.transmitter.unregister_user(id);
        let removed = self.shared.users.remove(id);

        if let Some(user) = removed {
            let shared = self.shared.clone();
            self.shared
                .apply
                .run(move || {
                    for listener in shared.listeners.snapshot() {
                        listener.user_left(&user, kicked);
                    }
                })
                .await;
        }
        info!(user = %id, kicked, "Participant removed");
    }

    /// Host-only: a joined user started queuing: from now on it may
    /// receive resource activities for every registered point.
    pub fn user_started_queuing(&self, id: &ParticipantId) -> Result<()> {
        if !self.shared.users.is_local_host() {
            return Err(SessionError::HostOnly("user_started_queuing"));
        }
        self.shared.resources.add_missing_reference_points_to_user(id);
        debug!(user = %id, "User may now receive resource activities");
        Ok(())
    }

    /// Host-only: a user's resource copy finished negotiation: from
    /// now on it may locally apply resource activities.
    pub fn user_finished_project_negotiation(&self, id: &ParticipantId) -> Result<()> {
        if !self.shared.users.is_local_host() {
            return Err(SessionError::HostOnly("user_finished_project_negotiation"));
        }
        match self.shared.users.mark_resources_ready(id) {
            Some(user) => {
                for listener in self.shared.listeners.snapshot() {
                    listener.user_resources_ready(&user);
                }
                debug!(user = %id, "User may now apply resource activities");
            }
            None => warn!(user = %id, "Negotiation finished for unknown participant"),
        }
        Ok(())
    }

    // ---- queries ----------------------------------------------------

    pub fn users(&self) -> Vec<User> {
        self.shared.users.users()
    }

    pub fn remote_users(&self) -> Vec<User> {
        self.shared
            .users
            .users()
            .into_iter()
            .filter(|u| u.in_session && !u.is_local)
            .collect()
    }

    pub fn user(&self, id: &ParticipantId) -> Option<User> {
        self.shared.users.get(id)
    }

    pub fn local_user(&self) -> User {
        self.shared.users.local_user()
    }

    pub fn host(&self) -> User {
        self.shared.users.host_user()
    }

    /// Whether the local process hosts this session.
    pub fn is_host(&self) -> bool {
        self.shared.users.is_local_host()
    }

    pub fn has_write_access(&self, id: &ParticipantId) -> bool {
        self.shared
            .users
            .get(id)
            .is_some_and(|u| u.has_write_access())
    }

    pub fn set_user_property(&self, id: &ParticipantId, key: &str, value: Value) -> bool {
        self.shared.users.set_property(id, key, value)
    }

    pub fn user_property(&self, id: &ParticipantId, key: &str) -> Option<Value> {
        self.shared.users.property(id, key)
    }

    // ---- sharing ----------------------------------------------------

    /// Register a reference point (or upgrade partial → complete) and
    /// notify listeners.
    pub fn add_reference_point(
        &self,
        id: &str,
        point: &ReferencePoint,
        is_partial: bool,
    ) -> Result<()> {
        self.shared.resources.add_reference_point(id, point, is_partial)?;
        for listener in self.shared.listeners.snapshot() {
            listener.resources_added(point);
        }
        Ok(())
    }

    pub fn remove_reference_point(&self, id: &str) {
        self.shared.resources.remove_reference_point(id);
    }

    /// Grow a partially shared point's resource set and notify
    /// listeners.
    pub fn add_shared_resources(&self, point: &ReferencePoint, paths: Vec<String>) {
        self.shared.resources.add_resources(point, paths);
        for listener in self.shared.listeners.snapshot() {
            listener.resources_added(point);
        }
    }

    pub fn is_shared(&self, resource: &crate::activity::ResourcePath) -> bool {
        self.shared.resources.is_shared(resource)
    }

    pub fn is_completely_shared(&self, point: &ReferencePoint) -> bool {
        self.shared.resources.is_completely_shared(point)
    }

    pub fn is_partially_shared(&self, point: &ReferencePoint) -> bool {
        self.shared.resources.is_partially_shared(point)
    }

    /// Defer delivery of resource activities for `point` until the
    /// matching `disable_queuing`. Must be balanced, e.g. at the end of
    /// an invitation.
    pub fn enable_queuing(&self, point: &ReferencePoint) {
        self.shared.queuer.enable_queuing(point);
    }

    pub fn disable_queuing(&self, point: &ReferencePoint) {
        self.shared.queuer.disable_queuing(point);
    }

    // ---- registries -------------------------------------------------

    /// Register a producer; the session installs its internal listener.
    /// Re-adding the same producer is a no-op.
    pub fn add_producer(&self, producer: Arc<dyn ActivityProducer>) {
        let mut producers = self.shared.producers.lock().unwrap();
        if producers.iter().any(|p| Arc::ptr_eq(p, &producer)) {
            return;
        }
        producer.add_activity_listener(self.shared.internal_listener.clone());
        producers.push(producer);
    }

    /// Deregister a producer. Unknown producers are a no-op.
    pub fn remove_producer(&self, producer: &Arc<dyn ActivityProducer>) {
        let mut producers = self.shared.producers.lock().unwrap();
        let before = producers.len();
        producers.retain(|p| !Arc::ptr_eq(p, producer));
        if producers.len() != before {
            producer.remove_activity_listener(&self.shared.internal_listener);
        }
    }

    /// Register a consumer in one phase. Re-adding moves it: any prior
    /// registration (either phase) is removed first.
    pub fn add_consumer(&self, consumer: Arc<dyn ActivityConsumer>, priority: ConsumerPriority) {
        let mut consumers = self.shared.consumers.lock().unwrap();
        consumers.active.retain(|c| !Arc::ptr_eq(c, &consumer));
        consumers.passive.retain(|c| !Arc::ptr_eq(c, &consumer));
        match priority {
            ConsumerPriority::Active => consumers.active.push(consumer),
            ConsumerPriority::Passive => consumers.passive.push(consumer),
        }
    }

    /// Deregister a consumer from whichever phase holds it.
    pub fn remove_consumer(&self, consumer: &Arc<dyn ActivityConsumer>) {
        let mut consumers = self.shared.consumers.lock().unwrap();
        consumers.active.retain(|c| !Arc::ptr_eq(c, consumer));
        consumers.passive.retain(|c| !Arc::ptr_eq(c, consumer));
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.shared.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SessionListener>) {
        self.shared.listeners.remove(listener);
    }

    // ---- permission -------------------------------------------------

    /// Change a participant's write access (host-only, blocking across
    /// the stop/resume round-trip for remote targets). Must not be
    /// called from the thread delivering incoming activities.
    pub async fn change_permission(
        &self,
        target: &ParticipantId,
        permission: Permission,
    ) -> Result<()> {
        self.ensure_started()?;
        self.shared
            .permission
            .change_permission(target, permission)
            .await?;
        Ok(())
    }

    // ---- routing ----------------------------------------------------

    /// Execute one inbound batch. Never fails: invalid activities are
    /// dropped and logged, queued activities are deferred, the rest is
    /// handed to the activity handler for local execution.
    pub fn exec(&self, activities: Vec<Activity>) {
        if self.state() != SessionState::Started {
            warn!(
                count = activities.len(),
                "exec while session not running; batch dropped"
            );
            return;
        }

        let valid: Vec<Activity> = activities
            .into_iter()
            .filter(|a| {
                if a.is_valid() {
                    true
                } else {
                    warn!(kind = a.kind(), source = %a.source(), "Invalid activity dropped");
                    false
                }
            })
            .collect();

        let batch = self.shared.queuer.process(valid);
        if batch.is_empty() {
            return;
        }
        self.shared
            .handler
            .handle_incoming(batch, self.shared.callback());
    }
}

/// Wires a fully-formed [`Session`] from explicitly injected
/// collaborators; there are no global registries to look up.
pub struct SessionBuilder {
    local: User,
    host: Option<User>,
    fs: Arc<dyn FileStore>,
    transmitter: Arc<dyn ActivityTransmitter>,
    handler: Arc<dyn ActivityHandler>,
    stop: Arc<dyn StopCoordinator>,
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new(
        local: User,
        fs: Arc<dyn FileStore>,
        transmitter: Arc<dyn ActivityTransmitter>,
        handler: Arc<dyn ActivityHandler>,
        stop: Arc<dyn StopCoordinator>,
    ) -> Self {
        Self {
            local,
            host: None,
            fs,
            transmitter,
            handler,
            stop,
            config: SessionConfig::default(),
        }
    }

    /// Join someone else's session: `host` is its (remote) host user.
    pub fn joining(mut self, host: User) -> Self {
        self.host = Some(host);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the session. Must be called inside a tokio runtime (the
    /// apply context and the outgoing lane are tasks).
    pub fn build(self) -> Session {
        let users = Arc::new(UserRegistry::new(self.local, self.host));
        let listeners: Arc<ListenerRegistry<dyn SessionListener>> =
            Arc::new(ListenerRegistry::new());
        let apply = Arc::new(ApplyQueue::new());
        let resources = Arc::new(SharedResourceMap::new(self.fs.clone()));
        let permission = Arc::new(PermissionManager::new(
            users.clone(),
            listeners.clone(),
            apply.clone(),
            self.stop,
        ));

        let handler = self.handler;
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let internal_listener: ActivityListener = {
                let weak = weak.clone();
                let handler = handler.clone();
                Arc::new(move |activity: Activity| {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    handler.handle_outgoing(vec![activity], shared.callback());
                })
            };
            Shared {
                users,
                resources,
                queuer: ActivityQueuer::new(),
                consumers: Mutex::new(Consumers::default()),
                producers: Mutex::new(Vec::new()),
                listeners,
                permission: permission.clone(),
                handler,
                transmitter: self.transmitter,
                fs: self.fs,
                apply,
                state: Mutex::new(SessionState::Created),
                config: self.config,
                outgoing: Mutex::new(None),
                internal_listener,
            }
        });

        let session = Session { shared };
        // The permission manager takes part in routing like any other
        // subsystem: as a producer and as an active consumer
        session.add_producer(permission.clone());
        session.add_consumer(permission, ConsumerPriority::Active);
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{EditorAction, ResourcePath};
    use crate::consumer::ConsumerError;
    use crate::fs::InMemoryFileStore;
    use crate::permission::{StopError, StopHandle};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(s: &str) -> ParticipantId {
        s.parse().unwrap()
    }

    /// Transport mock: records sends, user-list sync behavior is
    /// scripted per test.
    struct MockTransmitter {
        sent: Mutex<Vec<(Vec<ParticipantId>, Activity)>>,
        registered: Mutex<Vec<ParticipantId>>,
        sync_mode: SyncMode,
    }

    #[derive(Clone, Copy)]
    enum SyncMode {
        Ack,
        Fail,
        Hang,
    }

    impl MockTransmitter {
        fn new(sync_mode: SyncMode) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                registered: Mutex::new(Vec::new()),
                sync_mode,
            }
        }
    }

    #[async_trait]
    impl ActivityTransmitter for MockTransmitter {
        fn register_user(&self, user: &User) {
            self.registered.lock().unwrap().push(user.id.clone());
        }

        fn unregister_user(&self, id: &ParticipantId) {
            self.registered.lock().unwrap().retain(|r| r != id);
        }

        async fn send(
            &self,
            recipients: &[ParticipantId],
            activity: &Activity,
        ) -> crate::transport::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((recipients.to_vec(), activity.clone()));
            Ok(())
        }

        async fn synchronize_user_list(
            &self,
            _users: &[User],
            recipients: &[ParticipantId],
        ) -> crate::transport::Result<()> {
            match self.sync_mode {
                SyncMode::Ack => Ok(()),
                SyncMode::Fail => Err(TransportError::NoAcknowledgment(
                    recipients.first().cloned().unwrap_or_else(|| id("x@c.ex/i")),
                )),
                SyncMode::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    /// Handler mock: incoming batches are executed one by one;
    /// outgoing batches go to every remote member and loop back.
    struct LoopbackHandler {
        local: ParticipantId,
    }

    impl ActivityHandler for LoopbackHandler {
        fn handle_outgoing(
            &self,
            activities: Vec<Activity>,
            callback: Arc<dyn ActivityHandlerCallback>,
        ) {
            for activity in activities {
                callback.send(vec![self.local.clone()], activity);
            }
        }

        fn handle_incoming(
            &self,
            activities: Vec<Activity>,
            callback: Arc<dyn ActivityHandlerCallback>,
        ) {
            for activity in activities {
                callback.execute(activity);
            }
        }
    }

    struct NoStop;

    #[async_trait]
    impl StopCoordinator for NoStop {
        async fn request_stop(
            &self,
            user: &ParticipantId,
            _reason: &str,
        ) -> std::result::Result<Box<dyn StopHandle>, StopError> {
            Err(StopError::Unreachable(user.clone()))
        }
    }

    struct TaggingConsumer {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl ActivityConsumer for TaggingConsumer {
        fn exec(&self, _activity: &Activity) -> std::result::Result<(), ConsumerError> {
            self.log.lock().unwrap().push(self.tag);
            if self.fail {
                return Err(ConsumerError::new("scripted failure"));
            }
            Ok(())
        }
    }

    struct Fixture {
        session: Session,
        transmitter: Arc<MockTransmitter>,
        fs: Arc<InMemoryFileStore>,
    }

    fn host_session(sync_mode: SyncMode) -> Fixture {
        let local = User::new(id("host@c.ex/ide"), true, true, Permission::WriteAccess);
        let fs = Arc::new(InMemoryFileStore::new());
        let transmitter = Arc::new(MockTransmitter::new(sync_mode));
        let handler = Arc::new(LoopbackHandler {
            local: local.id.clone(),
        });
        let session = SessionBuilder::new(
            local,
            fs.clone(),
            transmitter.clone(),
            handler,
            Arc::new(NoStop),
        )
        .config(SessionConfig {
            user_list_timeout: Duration::from_millis(50),
        })
        .build();
        session.start();
        Fixture {
            session,
            transmitter,
            fs,
        }
    }

    fn edit(point: &ReferencePoint, path: &str, author: &str) -> Activity {
        Activity::TextEdit {
            source: id(&format!("{author}@c.ex/ide")),
            resource: ResourcePath::new(point.clone(), path),
            offset: 0,
            replaced: String::new(),
            inserted: "x".into(),
        }
    }

    #[tokio::test]
    async fn test_consumer_phase_order_passive_then_active() {
        let f = host_session(SyncMode::Ack);
        let log = Arc::new(Mutex::new(Vec::new()));

        f.session.add_consumer(
            Arc::new(TaggingConsumer { tag: "active", log: log.clone(), fail: false }),
            ConsumerPriority::Active,
        );
        f.session.add_consumer(
            Arc::new(TaggingConsumer { tag: "passive", log: log.clone(), fail: false }),
            ConsumerPriority::Passive,
        );

        f.session.exec(vec![Activity::NoOp { source: id("v@c.ex/ide") }]);

        assert_eq!(*log.lock().unwrap(), vec!["passive", "active"]);
    }

    #[tokio::test]
    async fn test_consumer_failure_does_not_stop_fanout() {
        let f = host_session(SyncMode::Ack);
        let log = Arc::new(Mutex::new(Vec::new()));

        f.session.add_consumer(
            Arc::new(TaggingConsumer { tag: "first", log: log.clone(), fail: true }),
            ConsumerPriority::Active,
        );
        f.session.add_consumer(
            Arc::new(TaggingConsumer { tag: "second", log: log.clone(), fail: false }),
            ConsumerPriority::Active,
        );

        f.session.exec(vec![Activity::NoOp { source: id("v@c.ex/ide") }]);

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_readding_consumer_changes_phase() {
        let f = host_session(SyncMode::Ack);
        let log = Arc::new(Mutex::new(Vec::new()));
        let probe = Arc::new(TaggingConsumer { tag: "probe", log: log.clone(), fail: false });
        let marker = Arc::new(TaggingConsumer { tag: "marker", log: log.clone(), fail: false });

        f.session.add_consumer(marker, ConsumerPriority::Passive);
        f.session.add_consumer(probe.clone(), ConsumerPriority::Passive);
        // Re-register with the other priority: moves, not duplicates
        f.session.add_consumer(probe, ConsumerPriority::Active);

        f.session.exec(vec![Activity::NoOp { source: id("v@c.ex/ide") }]);

        assert_eq!(*log.lock().unwrap(), vec!["marker", "probe"]);
    }

    #[tokio::test]
    async fn test_invalid_activities_are_dropped() {
        let f = host_session(SyncMode::Ack);
        let count = Arc::new(AtomicUsize::new(0));
        struct Counting(Arc<AtomicUsize>);
        impl ActivityConsumer for Counting {
            fn exec(&self, _a: &Activity) -> std::result::Result<(), ConsumerError> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
        f.session
            .add_consumer(Arc::new(Counting(count.clone())), ConsumerPriority::Active);

        let point = ReferencePoint::new("p");
        f.session.exec(vec![
            Activity::FileMoved {
                source: id("v@c.ex/ide"),
                from: ResourcePath::new(point.clone(), "same.txt"),
                to: ResourcePath::new(point.clone(), "same.txt"),
            },
            Activity::NoOp { source: id("v@c.ex/ide") },
        ]);

        assert_eq!(count.load(Ordering::Relaxed), 1, "only the valid one ran");
    }

    #[tokio::test]
    async fn test_exec_defers_to_queuer() {
        let f = host_session(SyncMode::Ack);
        let log = Arc::new(Mutex::new(Vec::new()));
        struct Kinds(Arc<Mutex<Vec<&'static str>>>);
        impl ActivityConsumer for Kinds {
            fn exec(&self, a: &Activity) -> std::result::Result<(), ConsumerError> {
                self.0.lock().unwrap().push(a.kind());
                Ok(())
            }
        }
        f.session
            .add_consumer(Arc::new(Kinds(log.clone())), ConsumerPriority::Active);

        let point = ReferencePoint::new("p");
        f.session.enable_queuing(&point);
        f.session.exec(vec![edit(&point, "f.txt", "v")]);
        assert!(log.lock().unwrap().is_empty(), "deferred while queuing");

        f.session.disable_queuing(&point);
        f.session.exec(vec![]);

        assert_eq!(*log.lock().unwrap(), vec!["Editor", "TextEdit"]);
    }

    #[tokio::test]
    async fn test_incoming_fs_mutation_updates_membership_after_fanout() {
        let f = host_session(SyncMode::Ack);
        let point = ReferencePoint::new("p");
        f.session.add_reference_point("net-1", &point, true).unwrap();
        f.session
            .add_shared_resources(&point, vec!["src".into()]);

        // The consumer observes the pre-update sharing state
        struct SharingProbe {
            session: Mutex<Option<Session>>,
            observed: Arc<Mutex<Option<bool>>>,
        }
        impl ActivityConsumer for SharingProbe {
            fn exec(&self, a: &Activity) -> std::result::Result<(), ConsumerError> {
                if let Some(resource) = a.resource() {
                    let session = self.session.lock().unwrap();
                    let shared = session.as_ref().unwrap().is_shared(resource);
                    *self.observed.lock().unwrap() = Some(shared);
                }
                Ok(())
            }
        }
        let observed = Arc::new(Mutex::new(None));
        f.session.add_consumer(
            Arc::new(SharingProbe {
                session: Mutex::new(Some(f.session.clone())),
                observed: observed.clone(),
            }),
            ConsumerPriority::Active,
        );

        let resource = ResourcePath::new(point.clone(), "src/A.java");
        f.fs.put_file(&resource);
        f.session.exec(vec![Activity::FileCreated {
            source: id("v@c.ex/ide"),
            resource: resource.clone(),
        }]);

        assert_eq!(
            *observed.lock().unwrap(),
            Some(false),
            "consumer ran before the membership update"
        );
        assert!(f.session.is_shared(&resource), "membership updated after");
    }

    #[tokio::test]
    async fn test_add_user_rejects_duplicate() {
        let f = host_session(SyncMode::Ack);
        let bob = User::new(id("bob@c.ex/ide"), false, false, Permission::ReadOnly);

        f.session.add_user(bob.clone(), HashMap::new()).await.unwrap();
        let result = f.session.add_user(bob, HashMap::new()).await;

        assert!(matches!(
            result,
            Err(SessionError::User(UserRegistryError::AlreadyPresent(_)))
        ));
    }

    #[tokio::test]
    async fn test_join_rollback_on_sync_timeout() {
        let f = host_session(SyncMode::Hang);
        let bob = User::new(id("bob@c.ex/ide"), false, false, Permission::ReadOnly);

        let result = f.session.add_user(bob, HashMap::new()).await;

        assert!(matches!(result, Err(SessionError::JoinTimeout { .. })));
        assert!(f.session.user(&id("bob@c.ex/ide")).is_none(), "rolled back");
        assert!(
            f.transmitter.registered.lock().unwrap().is_empty(),
            "unregistered from the transport"
        );
    }

    #[tokio::test]
    async fn test_join_rollback_on_sync_failure() {
        let f = host_session(SyncMode::Fail);
        let bob = User::new(id("bob@c.ex/ide"), false, false, Permission::ReadOnly);

        let result = f.session.add_user(bob, HashMap::new()).await;

        assert!(matches!(result, Err(SessionError::JoinSyncFailed { .. })));
        assert!(f.session.user(&id("bob@c.ex/ide")).is_none());
    }

    #[tokio::test]
    async fn test_remove_user_is_idempotent() {
        let f = host_session(SyncMode::Ack);
        let bob = User::new(id("bob@c.ex/ide"), false, false, Permission::ReadOnly);
        f.session.add_user(bob, HashMap::new()).await.unwrap();

        f.session.remove_user(&id("bob@c.ex/ide"), false).await;
        assert!(f.session.user(&id("bob@c.ex/ide")).is_none());

        // Second removal: logged no-op
        f.session.remove_user(&id("bob@c.ex/ide"), false).await;
    }

    #[tokio::test]
    async fn test_producer_registration_is_idempotent() {
        let f = host_session(SyncMode::Ack);
        let fired = Arc::new(AtomicUsize::new(0));

        struct CountingProducer {
            support: crate::dispatch::ProducerSupport,
        }
        impl ActivityProducer for CountingProducer {
            fn add_activity_listener(&self, listener: ActivityListener) {
                self.support.add(listener);
            }
            fn remove_activity_listener(&self, listener: &ActivityListener) {
                self.support.remove(listener);
            }
        }

        let producer = Arc::new(CountingProducer {
            support: crate::dispatch::ProducerSupport::new(),
        });
        f.session.add_producer(producer.clone());
        f.session.add_producer(producer.clone());

        // If the listener were registered twice the activity would be
        // handled twice and sent twice
        let fired_probe = fired.clone();
        producer.support.add(Arc::new(move |_| {
            fired_probe.fetch_add(1, Ordering::Relaxed);
        }));
        producer
            .support
            .fire(Activity::NoOp { source: id("host@c.ex/ide") });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        let sent = f.transmitter.sent.lock().unwrap().len();
        assert!(sent <= 1, "single internal listener, single send");

        // Removing an unregistered producer is a no-op
        let stranger: Arc<dyn ActivityProducer> = Arc::new(CountingProducer {
            support: crate::dispatch::ProducerSupport::new(),
        });
        f.session.remove_producer(&stranger);
    }

    #[tokio::test]
    async fn test_resource_sends_suppressed_when_nothing_shared() {
        let f = host_session(SyncMode::Ack);
        let point = ReferencePoint::new("p");

        // No reference point registered: resource activity is suppressed
        f.shared_fire(edit(&point, "f.txt", "host"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.transmitter.sent.lock().unwrap().is_empty());

        // Non-resource activities still go out
        f.shared_fire(Activity::NoOp { source: id("host@c.ex/ide") });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.transmitter.sent.lock().unwrap().len(), 1);
    }

    impl Fixture {
        /// Fire an activity as if a local producer emitted it.
        fn shared_fire(&self, activity: Activity) {
            let listener = self.session.shared.internal_listener.as_ref();
            listener(activity);
        }
    }

    #[tokio::test]
    async fn test_outgoing_fs_mutation_suppressed_on_rejection() {
        let f = host_session(SyncMode::Ack);
        let point = ReferencePoint::new("p");
        f.session.add_reference_point("net-1", &point, true).unwrap();

        // Move of a never-shared file: consistency check rejects,
        // nothing reaches the transmitter
        f.shared_fire(Activity::FileMoved {
            source: id("host@c.ex/ide"),
            from: ResourcePath::new(point.clone(), "old.txt"),
            to: ResourcePath::new(point.clone(), "new.txt"),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.transmitter.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "start() may be called exactly once")]
    async fn test_double_start_panics() {
        let f = host_session(SyncMode::Ack);
        f.session.start();
    }

    #[tokio::test]
    #[should_panic(expected = "stop() requires a started session")]
    async fn test_double_stop_panics() {
        let f = host_session(SyncMode::Ack);
        f.session.stop();
        f.session.stop();
    }

    #[tokio::test]
    async fn test_exec_after_stop_drops_batch() {
        let f = host_session(SyncMode::Ack);
        let count = Arc::new(AtomicUsize::new(0));
        struct Counting(Arc<AtomicUsize>);
        impl ActivityConsumer for Counting {
            fn exec(&self, _a: &Activity) -> std::result::Result<(), ConsumerError> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
        f.session
            .add_consumer(Arc::new(Counting(count.clone())), ConsumerPriority::Active);

        f.session.stop();
        f.session.exec(vec![Activity::NoOp { source: id("v@c.ex/ide") }]);

        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_host_only_guards() {
        let host = User::new(id("host@c.ex/ide"), true, false, Permission::WriteAccess);
        let local = User::new(id("bob@c.ex/ide"), false, true, Permission::ReadOnly);
        let fs = Arc::new(InMemoryFileStore::new());
        let transmitter = Arc::new(MockTransmitter::new(SyncMode::Ack));
        let handler = Arc::new(LoopbackHandler { local: local.id.clone() });
        let session = SessionBuilder::new(local, fs, transmitter, handler, Arc::new(NoStop))
            .joining(host)
            .build();
        session.start();

        assert!(!session.is_host());
        assert!(matches!(
            session.user_started_queuing(&id("bob@c.ex/ide")),
            Err(SessionError::HostOnly(_))
        ));
        assert!(matches!(
            session.user_finished_project_negotiation(&id("bob@c.ex/ide")),
            Err(SessionError::HostOnly(_))
        ));
    }
}
