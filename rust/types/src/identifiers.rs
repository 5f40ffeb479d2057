//! Validated names used by terms, session types and declarations.

use std::fmt;
use std::sync::Arc;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentifierError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for IdentifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} identifier: {}", self.kind, self.value)
    }
}

impl std::error::Error for IdentifierError {}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn validate_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if is_ident_start(first) => chars.all(is_ident_continue),
        _ => false,
    }
}

/// Plain names are a single segment; qualified names may be dot-separated
/// (`billing.Invoice`).
fn validate_ident(kind: &'static str, value: &str, qualified: bool) -> Result<(), IdentifierError> {
    let ok = if qualified {
        value.split('.').all(validate_segment)
    } else {
        validate_segment(value)
    };
    if ok {
        Ok(())
    } else {
        Err(IdentifierError {
            kind,
            value: value.to_string(),
        })
    }
}

macro_rules! define_ident {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $qualified:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, IdentifierError> {
                let value = value.into();
                validate_ident($kind, &value, $qualified)?;
                Ok(Self(Arc::from(value)))
            }

            /// Build from a literal known to be valid.
            ///
            /// # Panics
            ///
            /// Panics if `value` is not a valid identifier.
            #[must_use]
            pub fn from_static(value: &'static str) -> Self {
                assert!(
                    validate_ident($kind, value, $qualified).is_ok(),
                    concat!("invalid ", $kind, " literal: {}"),
                    value
                );
                Self(Arc::from(value))
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdentifierError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = IdentifierError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.as_str() == *other
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let value = String::deserialize(deserializer)?;
                $name::new(value).map_err(de::Error::custom)
            }
        }
    };
}

define_ident!(
    /// Process-local name under which a channel is reachable.
    Placeholder,
    "placeholder",
    false
);
define_ident!(
    /// Choice arm label.
    Label,
    "label",
    false
);
define_ident!(
    /// Name of a declared session type.
    TypeName,
    "type",
    true
);
define_ident!(
    /// Name of a declared process.
    ProcName,
    "process",
    true
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_identifiers() {
        assert!(Placeholder::new("x").is_ok());
        assert!(Placeholder::new("_tmp1").is_ok());
        assert!(Placeholder::new("1x").is_err());
        assert!(Placeholder::new("").is_err());
        assert!(Placeholder::new("a.b").is_err());
    }

    #[test]
    fn test_qualified_identifiers() {
        assert!(ProcName::new("billing.Invoice").is_ok());
        assert!(TypeName::new("billing..Invoice").is_err());
        assert!(TypeName::new("billing.").is_err());
    }

    #[test]
    fn test_identifier_error_display() {
        let err = Label::new("no way").unwrap_err();
        assert_eq!(err.to_string(), "invalid label identifier: no way");
    }

    #[test]
    fn test_serde_round_trip_rejects_invalid() {
        let label = Label::from_static("ok");
        let json = serde_json::to_string(&label).unwrap();
        assert_eq!(json, "\"ok\"");
        assert!(serde_json::from_str::<Label>("\"9lives\"").is_err());
    }
}
