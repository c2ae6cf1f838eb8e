//! Typed bundle identifier.
//!
//! App listings and per-app operations key on a `BundleId` rather than
//! bare strings, keeping catalog mappings logically unique and the
//! operation contracts explicit.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A reverse-DNS application bundle identifier (`com.vendor.App`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(String);

impl BundleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BundleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BundleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
