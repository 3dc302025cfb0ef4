//! Validated identifier newtypes for tables, fields and records.
//!
//! All IDs are distinct newtype wrappers over `String` carrying a fixed
//! three-letter prefix followed by 16 ASCII alphanumerics, so that a
//! `FieldId` cannot be accidentally used where a `TableId` is expected and a
//! malformed id is rejected at the boundary instead of deep inside SQL.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// Number of random characters after the prefix.
pub const ID_BODY_LEN: usize = 16;

fn validate(kind: &'static str, prefix: &str, raw: &str) -> Result<(), CoreError> {
    let body = raw.strip_prefix(prefix).ok_or_else(|| CoreError::InvalidId {
        kind,
        value: raw.to_string(),
        reason: format!("expected prefix '{prefix}'"),
    })?;
    if body.len() != ID_BODY_LEN {
        return Err(CoreError::InvalidId {
            kind,
            value: raw.to_string(),
            reason: format!("expected {ID_BODY_LEN} characters after prefix, got {}", body.len()),
        });
    }
    if !body.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(CoreError::InvalidId {
            kind,
            value: raw.to_string(),
            reason: "only ASCII alphanumerics are allowed".to_string(),
        });
    }
    Ok(())
}

fn random_body() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_BODY_LEN)
        .map(char::from)
        .collect()
}

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Id prefix for this kind.
            pub const PREFIX: &'static str = $prefix;

            /// Parses and validates an id.
            pub fn parse(raw: impl Into<String>) -> Result<Self, CoreError> {
                let raw = raw.into();
                validate($kind, $prefix, &raw)?;
                Ok($name(raw))
            }

            /// Generates a fresh random id.
            pub fn generate() -> Self {
                $name(format!("{}{}", $prefix, random_body()))
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

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                $name::parse(raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

prefixed_id!(
    /// Table identity (`tbl` + 16 alphanumerics).
    TableId,
    "tbl",
    "table"
);

prefixed_id!(
    /// Field identity (`fld` + 16 alphanumerics).
    FieldId,
    "fld",
    "field"
);

prefixed_id!(
    /// Record identity (`rec` + 16 alphanumerics).
    RecordId,
    "rec",
    "record"
);
