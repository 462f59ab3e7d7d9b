//! session-core: coordination core for real-time collaborative editing
//! sessions.
//!
//! This crate provides the core functionality for:
//! - Routing activities between local producers, remote participants,
//!   and local consumers, in order
//! - Deferring resource activities until the receiving side is ready
//!   (reference-counted queuing with synthetic editor activations)
//! - Tracking complete and partial sharing of resource trees
//! - The distributed write-permission handover protocol
//! - FileStore, ActivityTransmitter, ActivityHandler and
//!   StopCoordinator trait abstractions for the host IDE, the
//!   messaging transport, and the concurrency engine

pub mod activity;
pub mod consistency;
pub mod consumer;
pub mod dispatch;
pub mod executor;
pub mod fs;
pub mod participant;
pub mod permission;
pub mod queue;
pub mod reference_point;
pub mod session;
pub mod shared_resources;
pub mod transport;

pub use activity::{Activity, EditorAction, ResourcePath};
pub use consistency::{RejectReason, SharingUpdate};
pub use consumer::{ActivityConsumer, ConsumerError, ConsumerPriority};
pub use dispatch::{ActivityListener, ActivityProducer, ListenerRegistry, ProducerSupport, SessionListener};
pub use executor::ApplyQueue;
pub use fs::{FileStore, InMemoryFileStore};
pub use participant::{ParticipantId, ParticipantIdError, Permission, User, UserRegistry};
pub use permission::{PermissionError, PermissionManager, StopCoordinator, StopError, StopHandle};
pub use queue::ActivityQueuer;
pub use reference_point::ReferencePoint;
pub use session::{Session, SessionBuilder, SessionConfig, SessionError, SessionState};
pub use shared_resources::{SharedResourceMap, SharedResourceMapError};
pub use transport::{ActivityHandler, ActivityHandlerCallback, ActivityTransmitter, TransportError};
