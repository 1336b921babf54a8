//! Identifier newtypes.
//!
//! Servers, contracts and branches are all identified by UUIDs. Wrapping
//! them keeps a contract id from being passed where a branch id is expected.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            /// The nil id. Only used in tests and placeholders.
            pub fn nil() -> Self {
                Self(Uuid::nil())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// A server (node) in the cluster.
    ServerId
);

uuid_id!(
    /// A contract issued by the table's Raft state.
    ContractId
);

uuid_id!(
    /// A segment of a region's write history.
    BranchId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_differ() {
        assert_ne!(ContractId::new_random(), ContractId::new_random());
    }

    #[test]
    fn ids_serialize_as_bare_uuid() {
        let id = ServerId(Uuid::from_u128(7));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000007\"");
    }
}
