//! Partial-sharing consistency: keep the explicit resource set of a
//! partially shared reference point in lockstep with the filesystem
//! mutations flowing through the session.
//!
//! Every filesystem-mutating activity passes through
//! [`update_partial_sharing`]: on the outgoing path before the send
//! (a rejected activity is suppressed), on the incoming path after the
//! consumers applied it (a rejection leaves the membership stale until
//! the next full resync; the activity itself already happened).
//!
//! Rejections are expected conditions, reported as a status value and
//! logged with the precondition that failed: never as an error.

use crate::activity::{Activity, ResourcePath};
use crate::fs::FileStore;
use crate::shared_resources::SharedResourceMap;
use std::fmt::{self, Display, Formatter};
use tracing::warn;

/// Why a filesystem-mutating activity failed the consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Create: the parent folder is not part of the shared set.
    ParentNotShared { parent: ResourcePath },
    /// Create / move destination: the resource is not on disk yet.
    MissingOnDisk { resource: ResourcePath },
    /// Remove / move origin: the resource is still on disk.
    StillOnDisk { resource: ResourcePath },
    /// Remove / move origin: the resource was never shared.
    NotShared { resource: ResourcePath },
    /// Move destination: the resource is already shared.
    AlreadyShared { resource: ResourcePath },
    /// Move between two different reference points.
    CrossReferencePoint,
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ParentNotShared { parent } => {
                write!(f, "expected parent {parent} to be shared, it is not")
            }
            RejectReason::MissingOnDisk { resource } => {
                write!(f, "expected {resource} to exist on disk, it does not")
            }
            RejectReason::StillOnDisk { resource } => {
                write!(f, "expected {resource} to be gone from disk, it still exists")
            }
            RejectReason::NotShared { resource } => {
                write!(f, "expected {resource} to be shared, it is not")
            }
            RejectReason::AlreadyShared { resource } => {
                write!(f, "expected {resource} to be unshared, it already is shared")
            }
            RejectReason::CrossReferencePoint => {
                write!(f, "move crosses reference points")
            }
        }
    }
}

/// Outcome of the consistency check for one activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharingUpdate {
    /// Deliverable/applied; the shared set was updated if needed.
    Accepted,
    /// Precondition mismatch; the shared set was left untouched.
    Rejected(RejectReason),
}

impl SharingUpdate {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SharingUpdate::Accepted)
    }
}

/// Check a filesystem-mutating activity against the current disk and
/// sharing state and update the shared set on success.
///
/// Activities on reference points that are not partially shared pass
/// through untouched. Non-filesystem activities always pass.
pub fn update_partial_sharing(
    map: &SharedResourceMap,
    fs: &dyn FileStore,
    activity: &Activity,
) -> SharingUpdate {
    let Some(resource) = activity.resource() else {
        return SharingUpdate::Accepted;
    };
    let point = resource.reference_point.clone();
    if !map.is_partially_shared(&point) {
        return SharingUpdate::Accepted;
    }

    let outcome = match activity {
        Activity::FileCreated { resource, .. } | Activity::FolderCreated { resource, .. } => {
            // The point root itself is always shared; only explicit
            // subfolders need to be in the set
            let parent_shared = match resource.parent() {
                Some(parent) => match map.is_shared(&parent) {
                    true => Ok(()),
                    false => Err(RejectReason::ParentNotShared { parent }),
                },
                None => Ok(()),
            };
            parent_shared.and_then(|()| {
                if !fs.exists(resource) {
                    return Err(RejectReason::MissingOnDisk {
                        resource: resource.clone(),
                    });
                }
                map.add_resources(&point, vec![resource.path.clone()]);
                Ok(())
            })
        }
        Activity::FileRemoved { resource, .. } | Activity::FolderRemoved { resource, .. } => {
            if !map.is_shared(resource) {
                Err(RejectReason::NotShared {
                    resource: resource.clone(),
                })
            } else if fs.exists(resource) {
                Err(RejectReason::StillOnDisk {
                    resource: resource.clone(),
                })
            } else {
                map.remove_resources(&point, vec![resource.path.clone()]);
                Ok(())
            }
        }
        Activity::FileMoved { from, to, .. } => {
            if from.reference_point != to.reference_point {
                Err(RejectReason::CrossReferencePoint)
            } else if !map.is_shared(from) {
                Err(RejectReason::NotShared {
                    resource: from.clone(),
                })
            } else if fs.exists(from) {
                Err(RejectReason::StillOnDisk {
                    resource: from.clone(),
                })
            } else if map.is_shared(to) {
                Err(RejectReason::AlreadyShared {
                    resource: to.clone(),
                })
            } else if !fs.exists(to) {
                Err(RejectReason::MissingOnDisk {
                    resource: to.clone(),
                })
            } else {
                map.remove_and_add_resources(
                    &point,
                    vec![from.path.clone()],
                    vec![to.path.clone()],
                );
                Ok(())
            }
        }
        // Edits, awareness, permission changes never touch the set
        _ => Ok(()),
    };

    match outcome {
        Ok(()) => SharingUpdate::Accepted,
        Err(reason) => {
            warn!(
                kind = activity.kind(),
                %reason,
                "Partial-sharing consistency check rejected activity"
            );
            SharingUpdate::Rejected(reason)
        }
    }
}
