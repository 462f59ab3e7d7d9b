//! Participant identity and the session's canonical user table.
//!
//! A `ParticipantId` is the fully-qualified network address of one
//! participant (`name@domain/resource`). The session never accepts a
//! bare address: without the resource part two devices of the same
//! account would be indistinguishable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ParticipantIdError {
    #[error("Invalid participant address: expected name@domain/resource, got '{0}'")]
    NotFullyQualified(String),
}

/// Fully-qualified network address of a participant.
///
/// # Examples
/// ```
/// use session_core::ParticipantId;
///
/// let id: ParticipantId = "alice@collab.example/desktop".parse().unwrap();
/// assert_eq!(id.bare(), "alice@collab.example");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// The bare address without the resource part.
    pub fn bare(&self) -> &str {
        match self.0.find('/') {
            Some(pos) => &self.0[..pos],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ParticipantId {
    type Err = ParticipantIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let at = s.find('@');
        let slash = s.find('/');
        match (at, slash) {
            (Some(a), Some(sl)) if a > 0 && sl > a + 1 && sl + 1 < s.len() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(ParticipantIdError::NotFullyQualified(s.to_string())),
        }
    }
}

// Serialize as the plain address string for consistency in logs and JSON
impl Serialize for ParticipantId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Write access level of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    ReadOnly,
    WriteAccess,
}

/// One participant of the session.
///
/// Snapshots of this struct are handed out by [`UserRegistry`]; the
/// canonical copy lives inside the registry and is only mutated through
/// registry methods.
#[derive(Debug, Clone)]
pub struct User {
    pub id: ParticipantId,
    /// Exactly one user per session carries this flag.
    pub is_host: bool,
    /// Exactly one user per process carries this flag.
    pub is_local: bool,
    pub permission: Permission,
    /// False until the join completed, false again after leave/kick.
    pub in_session: bool,
    /// True once the user's copy of the shared resources finished
    /// negotiation and may be mutated by resource activities.
    pub resources_ready: bool,
    /// Free-form per-user preferences (color, nickname, ...).
    pub properties: HashMap<String, Value>,
}

impl User {
    pub fn new(id: ParticipantId, is_host: bool, is_local: bool, permission: Permission) -> Self {
        Self {
            id,
            is_host,
            is_local,
            permission,
            in_session: false,
            resources_ready: false,
            properties: HashMap::new(),
        }
    }

    pub fn has_write_access(&self) -> bool {
        self.permission == Permission::WriteAccess
    }
}

#[derive(Debug, Error)]
pub enum UserRegistryError {
    #[error("Participant {0} is already in the session")]
    AlreadyPresent(ParticipantId),

    #[error("Session already has a host, cannot add {0} as host")]
    SecondHost(ParticipantId),

    #[error("Session already has a local user, cannot add {0} as local")]
    SecondLocal(ParticipantId),
}

/// The canonical user table of one session.
///
/// All membership state is behind a single mutex; every accessor
/// returns a snapshot. Mutation happens exclusively through methods so
/// the one-host / one-local invariants hold at all times.
pub struct UserRegistry {
    users: Mutex<HashMap<ParticipantId, User>>,
    local: ParticipantId,
    host: ParticipantId,
}

impl UserRegistry {
    /// Create a registry seeded with the local user (and the host user,
    /// when the local side is a client joining someone else's session).
    pub fn new(local: User, host: Option<User>) -> Self {
        debug_assert!(local.is_local);
        let local_id = local.id.clone();
        let host_id = match &host {
            Some(h) => {
                debug_assert!(h.is_host && !local.is_host);
                h.id.clone()
            }
            None => {
                debug_assert!(local.is_host);
                local_id.clone()
            }
        };

        let mut users = HashMap::new();
        let mut local = local;
        local.in_session = true;
        users.insert(local_id.clone(), local);
        if let Some(mut h) = host {
            h.in_session = true;
            users.insert(h.id.clone(), h);
        }

        Self {
            users: Mutex::new(users),
            local: local_id,
            host: host_id,
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    pub fn host_id(&self) -> &ParticipantId {
        &self.host
    }

    /// Whether the local process is hosting this session.
    pub fn is_local_host(&self) -> bool {
        self.local == self.host
    }

    /// Add a joining participant. Fails on duplicates and on a second
    /// host or local user.
    pub fn add(&self, user: User) -> Result<(), UserRegistryError> {
        let mut users = self.users.lock().unwrap();
        if users.contains_key(&user.id) {
            return Err(UserRegistryError::AlreadyPresent(user.id));
        }
        if user.is_host {
            return Err(UserRegistryError::SecondHost(user.id));
        }
        if user.is_local {
            return Err(UserRegistryError::SecondLocal(user.id));
        }
        users.insert(user.id.clone(), user);
        Ok(())
    }

    /// Remove a participant, returning its last state.
    pub fn remove(&self, id: &ParticipantId) -> Option<User> {
        self.users.lock().unwrap().remove(id)
    }

    /// Snapshot of one participant.
    pub fn get(&self, id: &ParticipantId) -> Option<User> {
        self.users.lock().unwrap().get(id).cloned()
    }

    /// Whether the participant is currently a session member.
    pub fn is_member(&self, id: &ParticipantId) -> bool {
        self.users
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|u| u.in_session)
    }

    pub fn local_user(&self) -> User {
        self.get(&self.local).expect("local user is always present")
    }

    pub fn host_user(&self) -> User {
        self.get(&self.host).expect("host user is always present")
    }

    /// Snapshot of all users, local and host included.
    pub fn users(&self) -> Vec<User> {
        let mut all: Vec<User> = self.users.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Ids of all members except the local user.
    pub fn remote_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self
            .users
            .lock()
            .unwrap()
            .values()
            .filter(|u| u.in_session && !u.is_local)
            .map(|u| u.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Update a member's permission. Returns false if unknown.
    pub fn set_permission(&self, id: &ParticipantId, permission: Permission) -> bool {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(id) {
            Some(user) => {
                user.permission = permission;
                true
            }
            None => {
                warn!(%id, "Permission update for unknown participant dropped");
                false
            }
        }
    }

    /// Mark a member as fully joined. Returns the updated snapshot.
    pub fn mark_joined(&self, id: &ParticipantId) -> Option<User> {
        let mut users = self.users.lock().unwrap();
        users.get_mut(id).map(|u| {
            u.in_session = true;
            u.clone()
        })
    }

    /// Mark a member's resource copy as negotiated and applicable.
    /// Returns the updated snapshot.
    pub fn mark_resources_ready(&self, id: &ParticipantId) -> Option<User> {
        let mut users = self.users.lock().unwrap();
        users.get_mut(id).map(|u| {
            u.resources_ready = true;
            u.clone()
        })
    }

    /// Mark a member as gone. Returns false if it already was.
    pub fn mark_left(&self, id: &ParticipantId) -> bool {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(id) {
            Some(u) if u.in_session => {
                u.in_session = false;
                true
            }
            _ => false,
        }
    }

    /// Set one entry of a member's property bag.
    pub fn set_property(&self, id: &ParticipantId, key: &str, value: Value) -> bool {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(id) {
            Some(user) => {
                user.properties.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    pub fn property(&self, id: &ParticipantId, key: &str) -> Option<Value> {
        self.users
            .lock()
            .unwrap()
            .get(id)
            .and_then(|u| u.properties.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ParticipantId {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_fully_qualified() {
        let p: ParticipantId = "alice@collab.example/desktop".parse().unwrap();
        assert_eq!(p.bare(), "alice@collab.example");
        assert_eq!(p.to_string(), "alice@collab.example/desktop");
    }

    #[test]
    fn test_reject_bare_address() {
        assert!("alice@collab.example".parse::<ParticipantId>().is_err());
        assert!("alice".parse::<ParticipantId>().is_err());
        assert!("@collab.example/desktop".parse::<ParticipantId>().is_err());
        assert!("alice@collab.example/".parse::<ParticipantId>().is_err());
        assert!("".parse::<ParticipantId>().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = id("bob@collab.example/laptop");
        let json = serde_json::to_string(&original).unwrap();
        let parsed: ParticipantId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_registry_host_session() {
        let local = User::new(id("host@c.ex/ide"), true, true, Permission::WriteAccess);
        let registry = UserRegistry::new(local, None);

        assert!(registry.is_local_host());
        assert_eq!(registry.local_id(), registry.host_id());
        assert_eq!(registry.users().len(), 1);
        assert!(registry.remote_ids().is_empty());
    }

    #[test]
    fn test_registry_client_session_has_both() {
        let local = User::new(id("bob@c.ex/ide"), false, true, Permission::ReadOnly);
        let host = User::new(id("host@c.ex/ide"), true, false, Permission::WriteAccess);
        let registry = UserRegistry::new(local, Some(host));

        assert!(!registry.is_local_host());
        assert_eq!(registry.users().len(), 2);
        assert_eq!(registry.remote_ids(), vec![id("host@c.ex/ide")]);
    }

    #[test]
    fn test_registry_rejects_duplicates_and_second_host() {
        let local = User::new(id("host@c.ex/ide"), true, true, Permission::WriteAccess);
        let registry = UserRegistry::new(local, None);

        let bob = User::new(id("bob@c.ex/ide"), false, false, Permission::ReadOnly);
        registry.add(bob.clone()).unwrap();

        assert!(matches!(
            registry.add(bob),
            Err(UserRegistryError::AlreadyPresent(_))
        ));
        let impostor = User::new(id("eve@c.ex/ide"), true, false, Permission::ReadOnly);
        assert!(matches!(
            registry.add(impostor),
            Err(UserRegistryError::SecondHost(_))
        ));
    }

    #[test]
    fn test_permission_update() {
        let local = User::new(id("host@c.ex/ide"), true, true, Permission::WriteAccess);
        let registry = UserRegistry::new(local, None);
        let bob = id("bob@c.ex/ide");
        registry
            .add(User::new(bob.clone(), false, false, Permission::ReadOnly))
            .unwrap();

        assert!(registry.set_permission(&bob, Permission::WriteAccess));
        assert!(registry.get(&bob).unwrap().has_write_access());

        assert!(!registry.set_permission(&id("ghost@c.ex/ide"), Permission::ReadOnly));
    }

    #[test]
    fn test_mark_left_is_idempotent() {
        let local = User::new(id("host@c.ex/ide"), true, true, Permission::WriteAccess);
        let registry = UserRegistry::new(local, None);
        let bob = id("bob@c.ex/ide");
        registry
            .add(User::new(bob.clone(), false, false, Permission::ReadOnly))
            .unwrap();
        registry.mark_joined(&bob).unwrap();

        assert!(registry.mark_left(&bob));
        assert!(!registry.mark_left(&bob), "second leave is a no-op");
    }

    #[test]
    fn test_property_bag() {
        let local = User::new(id("host@c.ex/ide"), true, true, Permission::WriteAccess);
        let registry = UserRegistry::new(local.clone(), None);

        assert!(registry.set_property(&local.id, "color", serde_json::json!("#ff7f00")));
        assert_eq!(
            registry.property(&local.id, "color"),
            Some(serde_json::json!("#ff7f00"))
        );
        assert_eq!(registry.property(&local.id, "nick"), None);
    }
}
