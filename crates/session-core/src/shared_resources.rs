//! SharedResourceMap: which resource trees are shared, and how.
//!
//! Tracks every registered reference point in exactly one of two
//! states: completely shared (the whole tree minus derived build
//! output) or partially shared (an explicit, mutable resource set).
//! Also keeps the host-side record of which participants have already
//! received which reference points: the gate for delivering resource
//! activities to late joiners.
//!
//! All state sits behind one mutex; every operation is atomic with
//! respect to every other. Best-effort mutations (resource set updates
//! for unknown or completely shared points) log and do nothing rather
//! than fail: the caller is expected to have validated beforehand.

use crate::activity::ResourcePath;
use crate::fs::FileStore;
use crate::participant::ParticipantId;
use crate::reference_point::ReferencePoint;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SharedResourceMapError {
    #[error("ID '{0}' is already mapped to a different reference point")]
    IdInUse(String),

    #[error("Reference point {0} is already registered under ID '{1}'")]
    PointInUse(ReferencePoint, String),

    #[error("Reference point {0} is already completely shared")]
    AlreadyCompletelyShared(ReferencePoint),

    #[error("Reference point {0} is already partially shared")]
    AlreadyPartiallyShared(ReferencePoint),

    #[error("Reference point {0} cannot be downgraded from complete to partial sharing")]
    DowngradeRejected(ReferencePoint),
}

pub type Result<T> = std::result::Result<T, SharedResourceMapError>;

#[derive(Default)]
struct Inner {
    id_to_point: HashMap<String, ReferencePoint>,
    point_to_id: HashMap<ReferencePoint, String>,
    completely_shared: HashSet<ReferencePoint>,
    /// Explicit shared-resource sets, partially shared points only.
    partially_shared: HashMap<ReferencePoint, HashSet<String>>,
    /// Host-only: reference-point IDs each participant has received.
    user_points: HashMap<ParticipantId, HashSet<String>>,
}

impl Inner {
    fn assert_disjoint(&self) {
        debug_assert!(
            self.completely_shared
                .iter()
                .all(|p| !self.partially_shared.contains_key(p)),
            "a reference point must never be completely and partially shared at once"
        );
    }
}

/// Membership map of all shared reference points of one session.
pub struct SharedResourceMap {
    inner: Mutex<Inner>,
    fs: Arc<dyn FileStore>,
}

impl SharedResourceMap {
    pub fn new(fs: Arc<dyn FileStore>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            fs,
        }
    }

    /// Register a reference point under its network-wide ID, or upgrade
    /// a partially shared point to complete sharing.
    ///
    /// The id↔point mapping is a bijection: re-registering either side
    /// against a different partner fails. Re-registering at the same
    /// sharing level fails too: the only legal repeat call is the
    /// partial→complete upgrade, which discards the explicit set.
    pub fn add_reference_point(
        &self,
        id: &str,
        point: &ReferencePoint,
        is_partial: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.id_to_point.get(id) {
            if existing != point {
                return Err(SharedResourceMapError::IdInUse(id.to_string()));
            }
        }
        if let Some(existing_id) = inner.point_to_id.get(point) {
            if existing_id != id {
                return Err(SharedResourceMapError::PointInUse(
                    point.clone(),
                    existing_id.clone(),
                ));
            }
        }

        let was_complete = inner.completely_shared.contains(point);
        let was_partial = inner.partially_shared.contains_key(point);

        match (was_complete, was_partial, is_partial) {
            (true, _, false) => {
                return Err(SharedResourceMapError::AlreadyCompletelyShared(point.clone()))
            }
            (true, _, true) => {
                return Err(SharedResourceMapError::DowngradeRejected(point.clone()))
            }
            (_, true, true) => {
                return Err(SharedResourceMapError::AlreadyPartiallyShared(point.clone()))
            }
            (false, true, false) => {
                // Upgrade: the explicit set is superseded by "everything"
                inner.partially_shared.remove(point);
                inner.completely_shared.insert(point.clone());
                debug!(point = %point, "Upgraded to complete sharing");
            }
            (false, false, _) => {
                inner.id_to_point.insert(id.to_string(), point.clone());
                inner.point_to_id.insert(point.clone(), id.to_string());
                if is_partial {
                    inner.partially_shared.insert(point.clone(), HashSet::new());
                } else {
                    inner.completely_shared.insert(point.clone());
                }
                debug!(point = %point, id, partial = is_partial, "Reference point registered");
            }
        }

        inner.assert_disjoint();
        Ok(())
    }

    /// Unregister a reference point by its ID. Unknown IDs are logged
    /// and ignored.
    pub fn remove_reference_point(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        match inner.id_to_point.remove(id) {
            Some(point) => {
                inner.point_to_id.remove(&point);
                inner.completely_shared.remove(&point);
                inner.partially_shared.remove(&point);
                debug!(point = %point, id, "Reference point unregistered");
            }
            None => warn!(id, "remove_reference_point: unknown ID ignored"),
        }
        inner.assert_disjoint();
    }

    /// Add resources to a partially shared point's explicit set.
    /// Logs and does nothing for unknown or completely shared points.
    pub fn add_resources(&self, point: &ReferencePoint, to_add: Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        Self::with_partial_set(&mut inner, point, "add_resources", |set| {
            set.extend(to_add);
        });
    }

    /// Remove resources from a partially shared point's explicit set.
    /// Logs and does nothing for unknown or completely shared points.
    pub fn remove_resources(&self, point: &ReferencePoint, to_remove: Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        Self::with_partial_set(&mut inner, point, "remove_resources", |set| {
            for path in &to_remove {
                set.remove(path);
            }
        });
    }

    /// Remove, then add, under a single lock acquisition.
    pub fn remove_and_add_resources(
        &self,
        point: &ReferencePoint,
        to_remove: Vec<String>,
        to_add: Vec<String>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        Self::with_partial_set(&mut inner, point, "remove_and_add_resources", |set| {
            for path in &to_remove {
                set.remove(path);
            }
            set.extend(to_add);
        });
    }

    fn with_partial_set(
        inner: &mut Inner,
        point: &ReferencePoint,
        op: &str,
        mutate: impl FnOnce(&mut HashSet<String>),
    ) {
        if inner.completely_shared.contains(point) {
            warn!(point = %point, op, "Resource set update on completely shared point ignored");
            return;
        }
        match inner.partially_shared.get_mut(point) {
            Some(set) => mutate(set),
            None => warn!(point = %point, op, "Resource set update on unknown point ignored"),
        }
    }

    /// Whether a resource is currently shared.
    ///
    /// Completely shared points share everything except derived build
    /// output; partially shared points share exactly their explicit set.
    pub fn is_shared(&self, resource: &ResourcePath) -> bool {
        let inner = self.inner.lock().unwrap();
        let point = &resource.reference_point;
        if inner.completely_shared.contains(point) {
            return !self.fs.is_derived(resource);
        }
        inner
            .partially_shared
            .get(point)
            .is_some_and(|set| set.contains(&resource.path))
    }

    /// Like [`is_shared`](Self::is_shared), scoped to one point.
    pub fn is_shared_in(&self, resource: &ResourcePath, point: &ReferencePoint) -> bool {
        resource.reference_point == *point && self.is_shared(resource)
    }

    pub fn is_completely_shared(&self, point: &ReferencePoint) -> bool {
        self.inner.lock().unwrap().completely_shared.contains(point)
    }

    pub fn is_partially_shared(&self, point: &ReferencePoint) -> bool {
        self.inner
            .lock()
            .unwrap()
            .partially_shared
            .contains_key(point)
    }

    /// Number of registered reference points.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().point_to_id.len()
    }

    pub fn reference_points(&self) -> Vec<ReferencePoint> {
        self.inner.lock().unwrap().point_to_id.keys().cloned().collect()
    }

    pub fn id_for(&self, point: &ReferencePoint) -> Option<String> {
        self.inner.lock().unwrap().point_to_id.get(point).cloned()
    }

    pub fn point_for(&self, id: &str) -> Option<ReferencePoint> {
        self.inner.lock().unwrap().id_to_point.get(id).cloned()
    }

    /// Flattened union of all explicit resource sets.
    pub fn partially_shared_resources(&self) -> Vec<ResourcePath> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<ResourcePath> = inner
            .partially_shared
            .iter()
            .flat_map(|(point, set)| {
                set.iter()
                    .map(|path| ResourcePath::new(point.clone(), path.clone()))
            })
            .collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    /// Per-point resource listing; `None` marks a completely shared
    /// point (conventionally "everything").
    pub fn reference_point_resource_mapping(
        &self,
    ) -> HashMap<ReferencePoint, Option<Vec<String>>> {
        let inner = self.inner.lock().unwrap();
        let mut mapping = HashMap::new();
        for point in &inner.completely_shared {
            mapping.insert(point.clone(), None);
        }
        for (point, set) in &inner.partially_shared {
            let mut paths: Vec<String> = set.iter().cloned().collect();
            paths.sort();
            mapping.insert(point.clone(), Some(paths));
        }
        mapping
    }

    /// Host-only: whether `user` has fully received `point`.
    pub fn user_has_reference_point(
        &self,
        user: &ParticipantId,
        point: &ReferencePoint,
    ) -> bool {
        let inner = self.inner.lock().unwrap();
        let Some(id) = inner.point_to_id.get(point) else {
            return false;
        };
        inner
            .user_points
            .get(user)
            .is_some_and(|ids| ids.contains(id))
    }

    /// Host-only: record that `user` now has every currently registered
    /// reference point.
    pub fn add_missing_reference_points_to_user(&self, user: &ParticipantId) {
        let mut inner = self.inner.lock().unwrap();
        let all_ids: Vec<String> = inner.id_to_point.keys().cloned().collect();
        inner
            .user_points
            .entry(user.clone())
            .or_default()
            .extend(all_ids);
        debug!(%user, "Marked all reference points as known to user");
    }

    /// Host-only: discard a departed participant's record.
    pub fn user_left(&self, user: &ParticipantId) {
        self.inner.lock().unwrap().user_points.remove(user);
    }
}
