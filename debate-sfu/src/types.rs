//! Common types used throughout the debate SFU

use serde::{Deserialize, Serialize};
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
    };
}

string_id!(
    /// Identifier of a participant, tied to its signaling connection
    PeerId
);

impl PeerId {
    /// Fresh random connection id
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(20))
    }
}

string_id!(
    /// External identifier of a debate room, chosen by its creator
    RoomId
);

string_id!(
    /// Media engine transport id
    TransportId
);

string_id!(
    /// Media engine producer id
    ProducerId
);

string_id!(
    /// Media engine consumer id
    ConsumerId
);

/// A (team, order) cell of a room's seating grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Seat {
    pub team: usize,
    pub order: usize,
}

impl Seat {
    #[must_use]
    pub const fn new(team: usize, order: usize) -> Self {
        Self { team, order }
    }

    /// Speaker key of this seat as used by debate rules, e.g. `team_a_1`
    #[must_use]
    pub fn role(&self) -> String {
        let team = u8::try_from(self.team)
            .ok()
            .and_then(|t| b'a'.checked_add(t))
            .filter(u8::is_ascii_lowercase)
            .map_or_else(|| self.team.to_string(), |c| char::from(c).to_string());
        format!("team_{}_{}", team, self.order + 1)
    }
}

impl fmt::Display for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.team, self.order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seat_role() {
        assert_eq!(Seat::new(0, 0).role(), "team_a_1");
        assert_eq!(Seat::new(1, 2).role(), "team_b_3");
        assert_eq!(Seat::new(30, 0).role(), "team_30_1");
    }

    #[test]
    fn test_ids_serialize_as_strings() {
        let id = PeerId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        assert_ne!(PeerId::generate(), PeerId::generate());
    }
}
