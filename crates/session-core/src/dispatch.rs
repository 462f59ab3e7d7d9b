//! Listener dispatch: ordered, identity-keyed fan-out registries.
//!
//! The session talks to external subsystems exclusively through
//! listeners. Registries are append-ordered, deduplicate by identity
//! (the same `Arc` registered twice stays registered once), and
//! snapshot before iterating so a listener may add or remove listeners
//! while being notified.

use crate::activity::Activity;
use crate::participant::User;
use crate::reference_point::ReferencePoint;
use std::sync::{Arc, Mutex};

/// Ordered registry of shared listener handles.
///
/// The registry never owns a listener's lifetime; dropping the last
/// external `Arc` after removal is the owner's business.
pub struct ListenerRegistry<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Append a listener. Re-adding the same handle is a no-op;
    /// returns whether the registry changed.
    pub fn add(&self, listener: Arc<L>) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Remove a listener by identity; returns whether it was present.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Copy of the current listener list, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().unwrap().is_empty()
    }
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer of session membership and sharing changes.
///
/// All methods default to no-ops so implementors only override what
/// they care about. Called on the apply context; implementations must
/// not block.
pub trait SessionListener: Send + Sync {
    /// A participant completed its join.
    fn user_joined(&self, _user: &User) {}

    /// A participant left; `kicked` tells removal apart from leaving.
    fn user_left(&self, _user: &User, _kicked: bool) {}

    /// A participant's write access changed.
    fn permission_changed(&self, _user: &User) {}

    /// A reference point became shared or its shared set grew.
    fn resources_added(&self, _point: &ReferencePoint) {}

    /// A joined participant's copy of the shared resources became
    /// trustworthy (project negotiation finished).
    fn user_resources_ready(&self, _user: &User) {}
}

/// Callback invoked with every activity a producer fires.
pub type ActivityListener = Arc<dyn Fn(Activity) + Send + Sync>;

/// Anything that emits activities toward the session.
///
/// Producers own their listener list; the session registers exactly one
/// listener per producer and deregisters it when the producer is
/// removed.
pub trait ActivityProducer: Send + Sync {
    fn add_activity_listener(&self, listener: ActivityListener);
    fn remove_activity_listener(&self, listener: &ActivityListener);
}

/// Listener bookkeeping for [`ActivityProducer`] implementations.
///
/// Embed one and delegate the trait methods to it; `fire` hands the
/// activity to every registered listener in registration order.
pub struct ProducerSupport {
    listeners: ListenerRegistry<dyn Fn(Activity) + Send + Sync>,
}

impl ProducerSupport {
    pub fn new() -> Self {
        Self {
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn add(&self, listener: ActivityListener) {
        self.listeners.add(listener);
    }

    pub fn remove(&self, listener: &ActivityListener) {
        self.listeners.remove(listener);
    }

    pub fn fire(&self, activity: Activity) {
        for listener in self.listeners.snapshot() {
            let listener = listener.as_ref();
            listener(activity.clone());
        }
    }
}

impl Default for ProducerSupport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::ParticipantId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_add_is_idempotent_by_identity() {
        let registry: ListenerRegistry<dyn Fn() + Send + Sync> = ListenerRegistry::new();
        let listener: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});

        assert!(registry.add(listener.clone()));
        assert!(!registry.add(listener.clone()));
        assert_eq!(registry.snapshot().len(), 1);

        // A different closure with identical code is a different listener
        let other: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        assert!(registry.add(other));
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry: ListenerRegistry<dyn Fn() + Send + Sync> = ListenerRegistry::new();
        let listener: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        assert!(!registry.remove(&listener));

        registry.add(listener.clone());
        assert!(registry.remove(&listener));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_preserves_registration_order() {
        let registry: ListenerRegistry<dyn Fn(&mut Vec<u32>) + Send + Sync> =
            ListenerRegistry::new();
        registry.add(Arc::new(|v: &mut Vec<u32>| v.push(1)));
        registry.add(Arc::new(|v: &mut Vec<u32>| v.push(2)));
        registry.add(Arc::new(|v: &mut Vec<u32>| v.push(3)));

        let mut order = Vec::new();
        for listener in registry.snapshot() {
            let listener = listener.as_ref();
            listener(&mut order);
        }
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_producer_support_fires_to_all() {
        let support = ProducerSupport::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        support.add(Arc::new(move |_| {
            c1.fetch_add(1, Ordering::Relaxed);
        }));
        let c2 = count.clone();
        let second: ActivityListener = Arc::new(move |_| {
            c2.fetch_add(10, Ordering::Relaxed);
        });
        support.add(second.clone());

        let source: ParticipantId = "a@c.ex/ide".parse().unwrap();
        support.fire(Activity::NoOp { source: source.clone() });
        assert_eq!(count.load(Ordering::Relaxed), 11);

        support.remove(&second);
        support.fire(Activity::NoOp { source });
        assert_eq!(count.load(Ordering::Relaxed), 12);
    }
}
