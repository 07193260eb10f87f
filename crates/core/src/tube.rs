//! Validated tube (channel) names.
//!
//! A tube name is interpolated into remote procedure names such as
//! `queue.tube.<name>:put`, so it is restricted to a safe identifier charset
//! and fixed at startup from configuration.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Maximum accepted tube name length.
pub const MAX_TUBE_NAME_LEN: usize = 64;

/// A named logical queue within the broker.
///
/// Invariant: matches `[A-Za-z_][A-Za-z0-9_]*` and is at most
/// [`MAX_TUBE_NAME_LEN`] bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TubeName(String);

impl TubeName {
    pub fn parse(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(DomainError::invalid_name(name, "must not be empty"));
        }
        if name.len() > MAX_TUBE_NAME_LEN {
            return Err(DomainError::invalid_name(name, "too long"));
        }

        let mut chars = name.chars();
        let first_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !first_ok {
            return Err(DomainError::invalid_name(
                name,
                "must start with an ASCII letter or underscore",
            ));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DomainError::invalid_name(
                name,
                "only ASCII letters, digits and underscores are allowed",
            ));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fully-qualified remote procedure name for a tube method, e.g.
    /// `queue.tube.deals:take`.
    pub fn procedure(&self, method: &str) -> String {
        format!("queue.tube.{}:{}", self.0, method)
    }
}

impl ValueObject for TubeName {}

impl core::fmt::Display for TubeName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TubeName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TubeName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TubeName> for String {
    fn from(value: TubeName) -> Self {
        value.0
    }
}
