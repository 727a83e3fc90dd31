//! Identifier and time types for Tether.
//!
//! Backbone-issued identifiers are strings made of a 3-letter type prefix
//! followed by 17 alphanumeric characters (`REL4kQ2...`). Parsing checks both,
//! so a malformed id is rejected before it can reach any stored state.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::TypesError;

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const ID_RANDOM_LEN: usize = 17;
const ADDRESS_MAX_LEN: usize = 100;

fn random_suffix() -> String {
    let mut bytes = [0u8; ID_RANDOM_LEN];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    bytes
        .iter()
        .map(|b| ID_ALPHABET[(*b as usize) % ID_ALPHABET.len()] as char)
        .collect()
}

fn validate_prefixed(value: &str, prefix: &str, kind: &'static str) -> Result<(), TypesError> {
    let valid = value.len() == prefix.len() + ID_RANDOM_LEN
        && value.starts_with(prefix)
        && value[prefix.len()..].bytes().all(|b| b.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(TypesError::InvalidId {
            kind,
            value: value.to_string(),
        })
    }
}

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Three-letter type prefix of this identifier.
            pub const PREFIX: &'static str = $prefix;

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(format!("{}{}", $prefix, random_suffix()))
            }

            /// Parse and validate an identifier.
            pub fn parse(value: &str) -> Result<Self, TypesError> {
                validate_prefixed(value, $prefix, stringify!($name))?;
                Ok(Self(value.to_string()))
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = TypesError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                validate_prefixed(&value, $prefix, stringify!($name))?;
                Ok(Self(value))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = TypesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

prefixed_id!(
    /// Identifier of a relationship between two identities.
    RelationshipId,
    "REL"
);
prefixed_id!(
    /// Identifier of a single change (creation, termination) of a relationship.
    RelationshipChangeId,
    "RCH"
);
prefixed_id!(
    /// Identifier of a published relationship template.
    RelationshipTemplateId,
    "RLT"
);
prefixed_id!(
    /// Handle of a relationship secret inside the device's secret store.
    RelationshipSecretId,
    "RSC"
);
prefixed_id!(
    /// Identifier of a template exchange keypair held by the templator.
    TemplateKeyId,
    "TPK"
);
prefixed_id!(
    /// Identifier of a server-pushed external event.
    ExternalEventId,
    "EVT"
);
prefixed_id!(
    /// Identifier of a backbone sync run.
    SyncRunId,
    "SYR"
);
prefixed_id!(
    /// Identifier of a message.
    MessageId,
    "MSG"
);
prefixed_id!(
    /// Local identifier of a queued datawallet modification.
    ModificationId,
    "DWM"
);
prefixed_id!(
    /// Identifier of one device of an identity.
    DeviceId,
    "DVC"
);

/// Realm tag an identity belongs to.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Realm(String);

impl Realm {
    /// Create a realm tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Borrow the realm tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Realm {
    fn default() -> Self {
        Self("id1".to_string())
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Realm({})", self.0)
    }
}

/// Stable address of an identity.
///
/// Derived from the identity's public signature key and realm, so two
/// devices of the same identity always agree on it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Derive the address for a public key within a realm.
    pub fn from_public_key(realm: &Realm, public_key: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(b"tether-address-v1");
        hasher.update(public_key);
        let digest = hasher.finalize();
        Self(format!("{}{}", realm, URL_SAFE_NO_PAD.encode(&digest[..20])))
    }

    /// Parse and validate an address.
    pub fn parse(value: &str) -> Result<Self, TypesError> {
        let valid = !value.is_empty()
            && value.len() <= ADDRESS_MAX_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(TypesError::InvalidAddress(value.to_string()))
        }
    }

    /// Borrow the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> String {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

/// Milliseconds since the Unix epoch.
///
/// Informational only: ordering between devices is carried by the
/// backbone's modification index, never by timestamps.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        )
    }

    /// Create a timestamp from milliseconds since the epoch.
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the epoch.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// This timestamp shifted forward by `millis`.
    pub fn plus_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}
