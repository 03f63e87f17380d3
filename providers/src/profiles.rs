//! Profile recipes: named, ordered lists of branches, which may reference
//! other profiles with a leading `#`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer};

/// Prefix marking a recipe entry as a reference to another profile.
pub const REFERENCE_PREFIX: char = '#';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid profile name {0:?}")]
    InvalidName(String),

    #[error("invalid branch name {branch:?} in profile {profile:?}")]
    InvalidBranch { profile: String, branch: String },

    #[error("profile {profile:?} references undefined profile {reference:?}")]
    Undefined { profile: String, reference: String },

    #[error("profile {profile:?} has a cyclic reference to {reference:?}")]
    Cyclic { profile: String, reference: String },
}

/// The profiles served, keyed by name. Construction validates names and
/// rejects undefined or cyclic references, so every lookup afterwards
/// resolves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profiles(BTreeMap<String, Vec<String>>);

impl Profiles {
    pub fn new(recipes: BTreeMap<String, Vec<String>>) -> Result<Self, Error> {
        for (name, entries) in &recipes {
            if !is_valid_name(name) {
                return Err(Error::InvalidName(name.clone()));
            }
            for entry in entries {
                if entry.strip_prefix(REFERENCE_PREFIX).is_none() && !is_valid_branch(entry) {
                    return Err(Error::InvalidBranch {
                        profile: name.clone(),
                        branch: entry.clone(),
                    });
                }
            }
        }

        let profiles = Self(recipes);
        for name in profiles.0.keys() {
            profiles.check(name, &mut vec![name.as_str()])?;
        }
        Ok(profiles)
    }

    /// Depth-first walk over the references of `name`, `stack` holding the
    /// profiles currently being expanded.
    fn check<'a>(&'a self, name: &str, stack: &mut Vec<&'a str>) -> Result<(), Error> {
        for reference in self.0[name]
            .iter()
            .filter_map(|e| e.strip_prefix(REFERENCE_PREFIX))
        {
            let Some((reference, _)) = self.0.get_key_value(reference) else {
                return Err(Error::Undefined {
                    profile: stack[0].to_string(),
                    reference: reference.to_string(),
                });
            };
            if stack.contains(&reference.as_str()) {
                return Err(Error::Cyclic {
                    profile: stack[0].to_string(),
                    reference: reference.clone(),
                });
            }
            stack.push(reference);
            self.check(reference, stack)?;
            stack.pop();
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// All profile names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Returns the fully resolved branch list of a profile: references are
    /// expanded in place, duplicates keep their first position.
    pub fn branches(&self, name: &str) -> Option<Vec<String>> {
        let entries = self.0.get(name)?;
        let mut branches = Vec::new();
        self.collect(entries, &mut branches);
        Some(branches)
    }

    fn collect(&self, entries: &[String], branches: &mut Vec<String>) {
        for entry in entries {
            match entry.strip_prefix(REFERENCE_PREFIX) {
                Some(reference) => self.collect(&self.0[reference], branches),
                None if !branches.contains(entry) => branches.push(entry.clone()),
                None => {}
            }
        }
    }

    /// Every branch used by any profile, sorted and deduplicated.
    pub fn all_branches(&self) -> Vec<String> {
        self.0
            .values()
            .flatten()
            .filter(|e| !e.starts_with(REFERENCE_PREFIX))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Groups of profiles whose recipes resolve to the same branch list, and
    /// thus share one materialized directory.
    pub fn shared_recipes(&self) -> Vec<Vec<&str>> {
        let mut groups: BTreeMap<Vec<String>, Vec<&str>> = BTreeMap::new();
        for name in self.names() {
            if let Some(branches) = self.branches(name) {
                groups.entry(branches).or_default().push(name);
            }
        }
        groups.into_values().filter(|g| g.len() > 1).collect()
    }

    /// Names of the profiles whose resolved recipe contains any of `changed`.
    pub fn dependents<'a>(&'a self, changed: &'a [String]) -> impl Iterator<Item = &'a str> {
        self.names().filter(move |name| {
            self.branches(name)
                .is_some_and(|branches| branches.iter().any(|b| changed.contains(b)))
        })
    }
}

impl<'de> Deserialize<'de> for Profiles {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let recipes = BTreeMap::<String, Vec<String>>::deserialize(deserializer)?;
        Profiles::new(recipes).map_err(serde::de::Error::custom)
    }
}

/// Profile names become file names and URL segments.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Branch names become (possibly nested) directories below the checkout.
fn is_valid_branch(branch: &str) -> bool {
    !branch.is_empty()
        && !branch.starts_with('/')
        && branch
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}
