//! Access level enumerations.
//!
//! Levels are ordered integers on the wire; a higher level includes every
//! capability of the lower ones.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

macro_rules! access_level {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "i32", into = "i32")]
        #[repr(i32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl TryFrom<i32> for $name {
            type Error = ValidationError;

            fn try_from(value: i32) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(ValidationError::UnknownLevel(other)),
                }
            }
        }

        impl From<$name> for i32 {
            fn from(level: $name) -> i32 {
                level as i32
            }
        }
    };
}

access_level! {
    /// What a user may see of a stream.
    ReadLevel {
        /// Can't see the stream
        None = 0,
        /// Icon and title
        See = 10,
        /// Preview the stream and its content
        Content = 20,
        Participants = 30,
        Messages = 40,
    }
}

access_level! {
    /// What a user may change in a stream.
    WriteLevel {
        None = 0,
        /// Become a participant, chat, and leave
        Join = 10,
        Vote = 13,
        /// Post messages which require a manager's approval
        PostPending = 18,
        Post = 20,
        Relate = 23,
        Relations = 25,
        Suggest = 28,
        Edit = 30,
        ClosePending = 35,
        /// Prevent new changes; joining and leaving still work
        Close = 40,
    }
}

access_level! {
    /// Administrative capabilities over a stream.
    AdminLevel {
        None = 0,
        Tell = 10,
        Invite = 20,
        Manage = 30,
        Own = 40,
    }
}

/// Levels the server granted the current user on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Access {
    pub read_level: ReadLevel,
    pub write_level: WriteLevel,
    pub admin_level: AdminLevel,
}

impl Default for Access {
    fn default() -> Self {
        Self {
            read_level: ReadLevel::None,
            write_level: WriteLevel::None,
            admin_level: AdminLevel::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(WriteLevel::Post > WriteLevel::PostPending);
        assert!(ReadLevel::Messages > ReadLevel::Content);
        assert!(AdminLevel::Own > AdminLevel::Manage);
    }

    #[test]
    fn test_level_wire_format() {
        let json = serde_json::to_string(&WriteLevel::Relate).unwrap();
        assert_eq!(json, "23");
        let parsed: ReadLevel = serde_json::from_str("30").unwrap();
        assert_eq!(parsed, ReadLevel::Participants);
        assert!(serde_json::from_str::<AdminLevel>("15").is_err());
    }
}
