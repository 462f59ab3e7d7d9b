//! Activity: one immutable unit of collaborative change.
//!
//! Activities flow in both directions: local producers fire them toward
//! the network, incoming batches are executed against local consumers.
//! An activity is a value; once constructed it is never modified, only
//! routed. The wire encoding is owned by the transport layer: this
//! module only guarantees the types are serde-encodable.

use crate::participant::{ParticipantId, Permission};
use crate::reference_point::ReferencePoint;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// A path to one resource inside a shared reference point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    pub reference_point: ReferencePoint,
    /// Relative, '/'-separated, no leading or trailing slash.
    pub path: String,
}

impl ResourcePath {
    pub fn new(reference_point: ReferencePoint, path: impl Into<String>) -> Self {
        Self {
            reference_point,
            path: path.into(),
        }
    }

    /// Path of the containing folder, or None at the tree root.
    pub fn parent(&self) -> Option<ResourcePath> {
        let pos = self.path.rfind('/')?;
        Some(ResourcePath {
            reference_point: self.reference_point.clone(),
            path: self.path[..pos].to_string(),
        })
    }

    /// A well-formed relative path: non-empty, no absolute or dotted
    /// segments. Malformed paths make the whole activity invalid.
    pub fn is_well_formed(&self) -> bool {
        !self.path.is_empty()
            && !self.path.starts_with('/')
            && !self.path.ends_with('/')
            && self.path.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..")
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.reference_point.name(), self.path)
    }
}

/// Editor lifecycle signal carried by [`Activity::Editor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditorAction {
    /// The document is open and its per-user shadow state exists.
    Activated,
    Closed,
    Saved,
}

/// One unit of collaborative change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Activity {
    /// A text replacement in an open document.
    TextEdit {
        source: ParticipantId,
        resource: ResourcePath,
        offset: usize,
        /// Text removed at `offset` (empty for pure insertion).
        replaced: String,
        /// Text inserted at `offset` (empty for pure deletion).
        inserted: String,
    },
    /// Editor open/close/save signal for a document.
    Editor {
        source: ParticipantId,
        resource: ResourcePath,
        action: EditorAction,
    },
    /// Opaque message of the concurrency engine for a document.
    EngineSync {
        source: ParticipantId,
        resource: ResourcePath,
        payload: Vec<u8>,
    },
    FileCreated {
        source: ParticipantId,
        resource: ResourcePath,
    },
    FileRemoved {
        source: ParticipantId,
        resource: ResourcePath,
    },
    FileMoved {
        source: ParticipantId,
        from: ResourcePath,
        to: ResourcePath,
    },
    FolderCreated {
        source: ParticipantId,
        resource: ResourcePath,
    },
    FolderRemoved {
        source: ParticipantId,
        resource: ResourcePath,
    },
    /// Host-initiated write-access change for `target`.
    PermissionChange {
        source: ParticipantId,
        target: ParticipantId,
        permission: Permission,
    },
    /// Caret/selection awareness signal.
    Selection {
        source: ParticipantId,
        resource: ResourcePath,
        offset: usize,
        length: usize,
    },
    /// Visible line range awareness signal.
    Viewport {
        source: ParticipantId,
        resource: ResourcePath,
        first_line: usize,
        last_line: usize,
    },
    /// Keepalive; routed like any other activity, applied by nobody.
    NoOp { source: ParticipantId },
}

impl Activity {
    /// The participant that caused this activity.
    pub fn source(&self) -> &ParticipantId {
        match self {
            Activity::TextEdit { source, .. }
            | Activity::Editor { source, .. }
            | Activity::EngineSync { source, .. }
            | Activity::FileCreated { source, .. }
            | Activity::FileRemoved { source, .. }
            | Activity::FileMoved { source, .. }
            | Activity::FolderCreated { source, .. }
            | Activity::FolderRemoved { source, .. }
            | Activity::PermissionChange { source, .. }
            | Activity::Selection { source, .. }
            | Activity::Viewport { source, .. }
            | Activity::NoOp { source } => source,
        }
    }

    /// The resource this activity is scoped to, if any.
    ///
    /// For a move this is the destination: the path under which the
    /// resource lives once the activity has been applied.
    pub fn resource(&self) -> Option<&ResourcePath> {
        match self {
            Activity::TextEdit { resource, .. }
            | Activity::Editor { resource, .. }
            | Activity::EngineSync { resource, .. }
            | Activity::FileCreated { resource, .. }
            | Activity::FileRemoved { resource, .. }
            | Activity::FolderCreated { resource, .. }
            | Activity::FolderRemoved { resource, .. }
            | Activity::Selection { resource, .. }
            | Activity::Viewport { resource, .. } => Some(resource),
            Activity::FileMoved { to, .. } => Some(to),
            Activity::PermissionChange { .. } | Activity::NoOp { .. } => None,
        }
    }

    /// Whether applying this activity changes the file tree.
    pub fn mutates_filesystem(&self) -> bool {
        matches!(
            self,
            Activity::FileCreated { .. }
                | Activity::FileRemoved { .. }
                | Activity::FileMoved { .. }
                | Activity::FolderCreated { .. }
                | Activity::FolderRemoved { .. }
        )
    }

    /// Whether this activity depends on an editor activation for its
    /// document (text edits and concurrency-engine traffic do).
    pub fn is_edit_related(&self) -> bool {
        matches!(
            self,
            Activity::TextEdit { .. } | Activity::EngineSync { .. }
        )
    }

    /// Self-validity check. Invalid activities are dropped before
    /// execution, never applied.
    pub fn is_valid(&self) -> bool {
        match self {
            Activity::FileMoved { from, to, .. } => {
                from.is_well_formed() && to.is_well_formed() && from != to
            }
            other => other
                .resource()
                .map_or(true, ResourcePath::is_well_formed),
        }
    }

    /// Short label for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Activity::TextEdit { .. } => "TextEdit",
            Activity::Editor { .. } => "Editor",
            Activity::EngineSync { .. } => "EngineSync",
            Activity::FileCreated { .. } => "FileCreated",
            Activity::FileRemoved { .. } => "FileRemoved",
            Activity::FileMoved { .. } => "FileMoved",
            Activity::FolderCreated { .. } => "FolderCreated",
            Activity::FolderRemoved { .. } => "FolderRemoved",
            Activity::PermissionChange { .. } => "PermissionChange",
            Activity::Selection { .. } => "Selection",
            Activity::Viewport { .. } => "Viewport",
            Activity::NoOp { .. } => "NoOp",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> ParticipantId {
        "alice@c.ex/ide".parse().unwrap()
    }

    fn res(path: &str) -> ResourcePath {
        ResourcePath::new(ReferencePoint::new("proj"), path)
    }

    #[test]
    fn test_resource_path_parent() {
        assert_eq!(res("src/main.rs").parent().unwrap().path, "src");
        assert!(res("main.rs").parent().is_none());
    }

    #[test]
    fn test_resource_path_well_formed() {
        assert!(res("src/a.rs").is_well_formed());
        assert!(!res("").is_well_formed());
        assert!(!res("/src/a.rs").is_well_formed());
        assert!(!res("src/").is_well_formed());
        assert!(!res("src//a.rs").is_well_formed());
        assert!(!res("../escape").is_well_formed());
    }

    #[test]
    fn test_moved_resource_is_destination() {
        let activity = Activity::FileMoved {
            source: source(),
            from: res("old.txt"),
            to: res("new.txt"),
        };
        assert_eq!(activity.resource().unwrap().path, "new.txt");
    }

    #[test]
    fn test_degenerate_move_is_invalid() {
        let activity = Activity::FileMoved {
            source: source(),
            from: res("same.txt"),
            to: res("same.txt"),
        };
        assert!(!activity.is_valid());
    }

    #[test]
    fn test_classification() {
        let edit = Activity::TextEdit {
            source: source(),
            resource: res("a.txt"),
            offset: 0,
            replaced: String::new(),
            inserted: "x".into(),
        };
        assert!(edit.is_edit_related());
        assert!(!edit.mutates_filesystem());

        let created = Activity::FileCreated {
            source: source(),
            resource: res("a.txt"),
        };
        assert!(created.mutates_filesystem());
        assert!(!created.is_edit_related());

        let noop = Activity::NoOp { source: source() };
        assert!(noop.resource().is_none());
        assert!(noop.is_valid());
    }

    #[test]
    fn test_serde_tagged_encoding() {
        let activity = Activity::Editor {
            source: source(),
            resource: res("doc.md"),
            action: EditorAction::Activated,
        };
        let json = serde_json::to_string(&activity).unwrap();
        assert!(json.contains("\"type\":\"editor\""));
        let back: Activity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "Editor");
    }
}
