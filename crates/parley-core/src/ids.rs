use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Length of a hyphenated UUID (`8-4-4-4-12`).
const HYPHENATED_LEN: usize = 36;

/// Whether `s` is a hyphenated UUID. Backend ids are always issued in this
/// form, so braced/urn/simple spellings are rejected.
pub fn is_valid_uuid(s: &str) -> bool {
    s.len() == HYPHENATED_LEN && Uuid::try_parse(s).is_ok()
}

macro_rules! backend_id {
    ($name:ident) => {
        /// Backend-issued identifier. Construction never validates; use
        /// [`Self::parse`] when the value comes from an untrusted source.
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Parse a hyphenated UUID, rejecting empty or malformed input.
            pub fn parse(s: &str) -> Option<Self> {
                let s = s.trim();
                is_valid_uuid(s).then(|| Self(s.to_owned()))
            }

            pub fn is_valid(&self) -> bool {
                is_valid_uuid(&self.0)
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
    };
}

backend_id!(AccountId);
backend_id!(CustomerId);
backend_id!(ConversationId);
backend_id!(MessageId);

impl CustomerId {
    /// Owner id stamped on synthetic greeting messages.
    pub fn bot() -> Self {
        Self("bot".to_owned())
    }
}

/// Client-generated token attached to every optimistic send and echoed back
/// by the server in the confirmed message.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientToken(String);

impl ClientToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
