use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Matrix identifiers are minted by the homeserver; we only carry them around.
/// The sigil is checked by `is_well_formed` but never enforced on construction,
/// since the engine round-trips whatever the server sent.
macro_rules! matrix_id {
    ($name:ident, $sigil:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const SIGIL: char = $sigil;

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_well_formed(&self) -> bool {
                self.0.len() > 1 && self.0.starts_with(Self::SIGIL)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

matrix_id!(RoomId, '!');
matrix_id!(EventId, '$');
matrix_id!(UserId, '@');

/// Device IDs carry no sigil.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_sigil() {
        assert!(RoomId::from_raw("!abc:example.org").is_well_formed());
        assert!(!RoomId::from_raw("abc:example.org").is_well_formed());
        assert!(!RoomId::from_raw("!").is_well_formed());
    }

    #[test]
    fn event_and_user_sigils() {
        assert!(EventId::from_raw("$15163622445EBvZJ:localhost").is_well_formed());
        assert!(UserId::from_raw("@example2:localhost").is_well_formed());
        assert!(!UserId::from_raw("$nope").is_well_formed());
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = RoomId::from_raw("!room:localhost");
        let s = id.to_string();
        let parsed: RoomId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_is_transparent() {
        let id = EventId::from_raw("$ev:localhost");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"$ev:localhost\"");
        let parsed: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn device_id_preserves_value() {
        let id = DeviceId::from_raw("ABCDEFG");
        assert_eq!(id.as_str(), "ABCDEFG");
        assert_eq!(id.to_string(), "ABCDEFG");
    }
}
