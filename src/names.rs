//! # Name Normalization
//!
//! The job subsystem reports instances, workers, plugins and repos either as
//! qualified internal identifiers (`jobs::MyApp.Mailer`) or as plain strings.
//! Metrics want the human-readable form, so qualified identifiers lose their
//! namespace prefix and plain strings pass through untouched.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace prefix the job subsystem puts on its internal identifiers.
pub const NAMESPACE_PREFIX: &str = "jobs::";

/// An identifier as reported by the job subsystem.
///
/// Qualified identifiers serialize as `{"module": "jobs::Name"}`, plain ones
/// as bare strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Qualified { module: String },
    Plain(String),
}

impl Identifier {
    pub fn qualified(module: impl Into<String>) -> Self {
        Identifier::Qualified {
            module: module.into(),
        }
    }

    pub fn plain(value: impl Into<String>) -> Self {
        Identifier::Plain(value.into())
    }

    /// Human-readable form, see [`normalize`].
    pub fn normalized(&self) -> String {
        normalize(self)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Qualified { module } => write!(f, "{module}"),
            Identifier::Plain(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Identifier::Plain(value.to_string())
    }
}

/// Strip the namespace prefix from qualified identifiers.
///
/// Every leading occurrence of [`NAMESPACE_PREFIX`] is removed so the result
/// is stable under repeated normalization. Plain strings are returned as-is.
pub fn normalize(identifier: &Identifier) -> String {
    match identifier {
        Identifier::Qualified { module } => strip_namespace(module).to_string(),
        Identifier::Plain(value) => value.clone(),
    }
}

fn strip_namespace(mut module: &str) -> &str {
    while let Some(rest) = module.strip_prefix(NAMESPACE_PREFIX) {
        module = rest;
    }
    module
}

/// Normalize a list of identifiers into a single comma-joined tag value.
pub fn normalize_list<'a, I>(identifiers: I) -> String
where
    I: IntoIterator<Item = &'a Identifier>,
{
    identifiers
        .into_iter()
        .map(normalize)
        .collect::<Vec<_>>()
        .join(",")
}
