use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(RoomId);
id_newtype!(MessageId);
id_newtype!(MemberUid);

/// Account role carried in token claims. Ordered so that `role >= Role::User`
/// reads as "at least a registered user".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    User,
    Admin,
}

impl Role {
    pub fn from_ordinal(ordinal: i64) -> Option<Self> {
        match ordinal {
            0 => Some(Role::Guest),
            1 => Some(Role::User),
            2 => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn ordinal(self) -> i64 {
        match self {
            Role::Guest => 0,
            Role::User => 1,
            Role::Admin => 2,
        }
    }
}
