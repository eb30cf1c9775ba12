//! Validated identifiers
//!
//! Ids become store key segments, so they are restricted to a charset without
//! namespace separators before anything touches the store.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest id accepted
pub const MAX_ID_LEN: usize = 128;

/// Check an id: non-empty, bounded, only `[A-Za-z0-9_-]`
pub fn is_valid_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_ID_LEN
        && raw.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// First `n` characters of an id, for log lines and error messages
pub fn short(raw: &str, n: usize) -> &str {
    match raw.char_indices().nth(n) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}

macro_rules! validated_id {
    ($(#[$meta:meta])* $name:ident, $error:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw id
            pub fn parse(raw: &str) -> Result<Self> {
                if is_valid_id(raw) {
                    Ok(Self(raw.to_string()))
                } else {
                    Err(Error::$error(short(raw, 20).to_string()))
                }
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

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(raw: String) -> Result<Self> {
                Self::parse(&raw)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

validated_id!(
    /// Caller-supplied id of one live connection
    ConnectionId,
    InvalidConnectionIdFormat
);

validated_id!(
    /// Id of a party session
    SessionId,
    InvalidSessionIdFormat
);

validated_id!(
    /// Id of one manager instance
    InstanceId,
    InvalidInstanceIdFormat
);

impl InstanceId {
    /// Fresh random instance id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
