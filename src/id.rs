//! Cursor and namespace identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 64-bit cursor identifier.
///
/// The upper 32 bits are a prefix shared by every cursor on the same
/// namespace; the lower 32 bits are a random per-cursor suffix. The prefix
/// lets the registry recover a namespace from an id alone, which the legacy
/// close-by-id path needs. Zero is reserved to mean "no cursor".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorId(u64);

impl CursorId {
    pub const ZERO: CursorId = CursorId(0);

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn from_parts(prefix: u32, suffix: u32) -> Self {
        Self(((prefix as u64) << 32) | suffix as u64)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Namespace prefix, the upper 32 bits.
    pub fn prefix(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Per-cursor suffix, the lower 32 bits.
    pub fn suffix(self) -> u32 {
        self.0 as u32
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CursorId({})", self.0)
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified namespace a cursor reads from, e.g. `"app.orders"`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Database portion, everything before the first dot.
    pub fn db(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// Collection portion, everything after the first dot.
    pub fn collection(&self) -> Option<&str> {
        self.0.split_once('.').map(|(_, coll)| coll)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({:?})", self.0)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn id_split_and_join() {
        let id = CursorId::from_parts(0xDEAD_BEEF, 0x0123_4567);
        assert_eq!(id.prefix(), 0xDEAD_BEEF);
        assert_eq!(id.suffix(), 0x0123_4567);
        assert_eq!(id.as_u64(), 0xDEAD_BEEF_0123_4567);
    }

    #[test]
    fn zero_is_reserved() {
        assert!(CursorId::ZERO.is_zero());
        assert!(!CursorId::from_parts(0, 1).is_zero());
        assert!(!CursorId::from_parts(1, 0).is_zero());
    }

    #[test]
    fn namespace_parts() {
        let ns = Namespace::new("app.orders");
        assert_eq!(ns.db(), "app");
        assert_eq!(ns.collection(), Some("orders"));

        let db_only = Namespace::new("admin");
        assert_eq!(db_only.db(), "admin");
        assert_eq!(db_only.collection(), None);

        let nested = Namespace::new("app.orders.archive");
        assert_eq!(nested.db(), "app");
        assert_eq!(nested.collection(), Some("orders.archive"));
    }

    proptest! {
        #[test]
        fn split_join_round_trip(prefix: u32, suffix: u32) {
            let id = CursorId::from_parts(prefix, suffix);
            prop_assert_eq!(id.prefix(), prefix);
            prop_assert_eq!(id.suffix(), suffix);
            prop_assert_eq!(CursorId::from_raw(id.as_u64()), id);
        }

        #[test]
        fn nonzero_suffix_means_nonzero_id(prefix: u32, suffix in 1u32..) {
            prop_assert!(!CursorId::from_parts(prefix, suffix).is_zero());
        }
    }
}
