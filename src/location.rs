//! Location resolution: stack snapshot → attributable location key
//!
//! Supports:
//! - Monitored-name prefixes: `filter-method-names = ["com.example", "app.worker"]`
//! - Grouping prefixes: `grouping-method-names = ["app.db"]` collapses every
//!   frame whose scope starts with `app.db` into the single key `app.db`
//!
//! Resolution walks the snapshot innermost → outermost. At each frame grouping
//! is checked first, then the (grouped or concrete) candidate is tested against
//! the monitored prefixes. The first accepted candidate wins.

use crate::runtime::StackSnapshot;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Attribution unit: a concrete `scope.operation` or a group name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationKey(String);

impl LocationKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LocationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for LocationKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LocationKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Ordered list of name prefixes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrefixRules(Vec<String>);

impl PrefixRules {
    /// Build from raw prefixes, trimming whitespace and dropping empty entries
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            prefixes
                .into_iter()
                .map(|p| p.as_ref().trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        )
    }

    /// First prefix (in configured order) that `name` starts with
    pub fn first_match(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|prefix| name.starts_with(prefix.as_str()))
            .map(String::as_str)
    }

    pub fn matches(&self, name: &str) -> bool {
        self.first_match(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Inclusion and grouping rules applied to every snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRules {
    /// Monitored-name prefixes; a key is accepted only if it starts with one
    pub monitored: PrefixRules,
    /// Grouping prefixes matched against a frame's scope
    pub groups: PrefixRules,
}

impl LocationRules {
    pub fn new(monitored: PrefixRules, groups: PrefixRules) -> Self {
        Self { monitored, groups }
    }

    /// Whether a candidate key passes the inclusion filter
    pub fn is_monitored(&self, name: &str) -> bool {
        self.monitored.matches(name)
    }

    /// Group name collapsing `scope`, if any grouping rule matches
    pub fn group_match(&self, scope: &str) -> Option<&str> {
        self.groups.first_match(scope)
    }

    /// Resolve a snapshot to at most one location key
    pub fn resolve(&self, snapshot: &StackSnapshot) -> Option<LocationKey> {
        for frame in snapshot.frames() {
            let candidate = match self.group_match(&frame.scope) {
                Some(group) => group.to_string(),
                None => frame.qualified_name(),
            };

            if self.is_monitored(&candidate) {
                return Some(LocationKey(candidate));
            }
        }
        None
    }
}
