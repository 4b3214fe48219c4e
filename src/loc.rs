//! Package locators.
//!
//! A locator identifies one package in the cluster package store as
//! `repository/name:version`, where the version is strict semver.

use std::fmt;
use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::GupError;

/// The repository all cluster-local packages live in.
pub const DEFAULT_REPOSITORY: &str = "gravitational.io";

/// Identifier of a single package: repository, name and semver version.
///
/// Serializes as the compact `repository/name:version` form used in manifests
/// and persisted plans.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locator {
    pub repository: String,
    pub name: String,
    pub version: Version,
}

impl Serialize for Locator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Locator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Locator {
    /// Build a locator, parsing the version string as semver.
    pub fn new(repository: &str, name: &str, version: &str) -> Result<Self, GupError> {
        let version = Version::parse(version)
            .map_err(|e| GupError::Invalid(format!("version {version:?}: {e}")))?;
        Ok(Self {
            repository: repository.to_string(),
            name: name.to_string(),
            version,
        })
    }

    /// Shorthand for a locator in the default repository.
    pub fn local(name: &str, version: &str) -> Result<Self, GupError> {
        Self::new(DEFAULT_REPOSITORY, name, version)
    }

    /// Returns a copy of this locator with a different version.
    pub fn with_version(&self, version: Version) -> Self {
        Self {
            repository: self.repository.clone(),
            name: self.name.clone(),
            version,
        }
    }

    /// Returns true if both locators name the same package, ignoring version.
    pub fn same_package(&self, other: &Self) -> bool {
        self.repository == other.repository && self.name == other.name
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.version)
    }
}

impl FromStr for Locator {
    type Err = GupError;

    /// Parse `repository/name:version`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (repository, rest) = s
            .split_once('/')
            .ok_or_else(|| GupError::Invalid(format!("locator {s:?}: missing repository")))?;
        let (name, version) = rest
            .split_once(':')
            .ok_or_else(|| GupError::Invalid(format!("locator {s:?}: missing version")))?;
        if repository.is_empty() || name.is_empty() {
            return Err(GupError::Invalid(format!("locator {s:?}: empty component")));
        }
        Self::new(repository, name, version)
    }
}
