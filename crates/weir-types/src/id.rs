use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
        )]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw counter value.
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// The raw counter value.
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Process-wide unique, monotonically assigned record identifier.
    ///
    /// Assigned from a single [`crate::Sequence`] whose high-water mark is
    /// restored from the record repository on startup, so identifiers never
    /// repeat across a restart.
    RecordId,
    "rec"
);

define_id!(
    /// Identifier of a content claim within the content store.
    ClaimId,
    "claim"
);

define_id!(
    /// Identifier of an append-only container file in the content store.
    ContainerId,
    "container"
);

define_id!(
    /// Identifier of a connection queue between two stages.
    ConnectionId,
    "conn"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_prefix() {
        assert_eq!(format!("{}", RecordId::new(17)), "rec:17");
        assert_eq!(format!("{}", ClaimId::new(3)), "claim:3");
        assert_eq!(format!("{}", ContainerId::new(0)), "container:0");
        assert_eq!(format!("{}", ConnectionId::new(9)), "conn:9");
    }

    #[test]
    fn ordering_follows_counter() {
        assert!(RecordId::new(1) < RecordId::new(2));
        assert!(ClaimId::new(10) > ClaimId::new(9));
    }

    #[test]
    fn u64_roundtrip() {
        let id = RecordId::from(42u64);
        assert_eq!(u64::from(id), 42);
        assert_eq!(id.as_u64(), 42);
    }

    #[test]
    fn serde_roundtrip() {
        let id = ConnectionId::new(7);
        let json = serde_json::to_string(&id).unwrap();
        let parsed: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
