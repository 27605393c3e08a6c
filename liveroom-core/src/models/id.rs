//! Numeric identifiers issued by the persistence layer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            #[must_use]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map(Self)
            }
        }
    };
}

numeric_id!(
    /// Room identifier
    RoomId
);
numeric_id!(
    /// Participant identifier, unique per (room, user or anonymous guest)
    ParticipantId
);
numeric_id!(
    /// Registered user identifier
    UserId
);
numeric_id!(
    /// Chat message identifier
    MessageId
);
numeric_id!(
    /// Question identifier
    QuestionId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_numbers() {
        let json = serde_json::to_string(&RoomId::new(42)).unwrap();
        assert_eq!(json, "42");

        let id: ParticipantId = serde_json::from_str("7").unwrap();
        assert_eq!(id.get(), 7);
    }

    #[test]
    fn test_parse_from_string() {
        assert_eq!("15".parse::<ParticipantId>().unwrap(), ParticipantId::new(15));
        assert_eq!(" 3 ".parse::<RoomId>().unwrap(), RoomId::new(3));
        assert!("abc".parse::<UserId>().is_err());
    }
}
