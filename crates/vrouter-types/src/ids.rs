//! Object identifiers.
//!
//! Each id is a thin newtype so a VRF id can never be passed where an
//! interface id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub const fn new(id: u32) -> Self {
                Self(id)
            }

            pub const fn get(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<u32> for $name {
            fn from(id: u32) -> Self {
                Self(id)
            }
        }
    };
}

object_id!(
    /// Index of a VRF in the agent's VRF table.
    VrfId,
    "vrf-"
);
object_id!(
    /// Index of an interface (VM port, tunnel, physical).
    InterfaceId,
    "intf-"
);
object_id!(
    /// Virtual network id.
    VnId,
    "vn-"
);
object_id!(
    /// Health-check service id.
    HealthCheckId,
    "hc-"
);
