//! Session, operation-key, and authenticated-user identities.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical client session a cursor may be bound to.
///
/// Cursors opened inside a session can only be used from that session and
/// may be killed per session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-supplied handle administrative commands use to match a set of
/// in-flight operations and their cursors.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKey(Uuid);

impl OperationKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationKey({})", self.0)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An authenticated user allowed to use a cursor: user name plus the
/// database it authenticated against.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserName {
    pub name: String,
    pub db: String,
}

impl UserName {
    pub fn new(name: impl Into<String>, db: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db: db.into(),
        }
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.db)
    }
}

/// Whether checkout verifies the caller's session against the cursor's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthCheck {
    CheckSession,
    SkipSession,
}

/// Two user snapshots authorize each other when both are unauthenticated or
/// they share at least one user.
pub fn is_coauthorized(a: &[UserName], b: &[UserName]) -> bool {
    if a.is_empty() && b.is_empty() {
        return true;
    }
    a.iter().any(|user| b.contains(user))
}
