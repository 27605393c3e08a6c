//! Identifiers shared by rooms, peers and tracks

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// A participant's media session within one room
    PeerId
);
string_id!(
    /// A relay room; one per application room
    RoomId
);
string_id!(
    /// Track id as announced by the publishing client
    TrackId
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_lookup_by_str() {
        let mut peers = HashMap::new();
        peers.insert(PeerId::from("17"), 1);
        assert_eq!(peers.get("17"), Some(&1));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        assert_eq!(serde_json::to_string(&PeerId::new("p1")).unwrap(), "\"p1\"");
        assert_eq!(RoomId::from("r1".to_string()).to_string(), "r1");
    }
}
