//! ReferencePoint: opaque handle to one shared resource tree.
//!
//! The handle identifies a root folder ("project", "module") locally,
//! independent of how the IDE represents it. Across the network a
//! reference point is addressed by an owner-assigned string ID; the
//! mapping between the two lives in
//! [`SharedResourceMap`](crate::shared_resources::SharedResourceMap).

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Opaque handle to a shared resource tree.
///
/// Cheap to clone; identity (equality, hashing) is carried by a random
/// local id so that two points with the same display name never
/// collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferencePoint {
    id: Uuid,
    name: String,
}

impl ReferencePoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    /// Display name of the root folder. Not unique.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for ReferencePoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ReferencePoint {}

impl Hash for ReferencePoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Display for ReferencePoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Short id suffix keeps log lines readable while staying unambiguous
        write!(f, "{} [{}]", self.name, &self.id.to_string()[..8])
    }
}
