//! Profiles: named dimensions (target device, channel) selecting which
//! resource configs apply to a given execution.

use std::collections::{BTreeSet, HashMap};

use crate::error::ConfigError;

/// A base profile and the sub-profiles it expands to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSet {
    base_profile: String,
    sub_profiles: BTreeSet<String>,
}

impl ProfileSet {
    /// Create a profile set with no sub-profiles.
    #[must_use]
    pub fn new(base_profile: impl Into<String>) -> Self {
        Self {
            base_profile: base_profile.into(),
            sub_profiles: BTreeSet::new(),
        }
    }

    /// The base profile name.
    #[must_use]
    pub fn base_profile(&self) -> &str {
        &self.base_profile
    }

    /// Add one sub-profile.
    pub fn add_profile(&mut self, profile: impl Into<String>) {
        let profile = profile.into();
        let trimmed = profile.trim();
        if !trimmed.is_empty() {
            self.sub_profiles.insert(trimmed.to_string());
        }
    }

    /// Add sub-profiles from an iterator (empty names ignored).
    pub fn add_profiles<I, S>(&mut self, profiles: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for profile in profiles {
            self.add_profile(profile);
        }
    }

    /// The sub-profiles, sorted.
    pub fn sub_profiles(&self) -> impl Iterator<Item = &str> {
        self.sub_profiles.iter().map(String::as_str)
    }

    /// Whether a profile name is the base profile or one of the
    /// sub-profiles.
    #[must_use]
    pub fn is_member(&self, profile: &str) -> bool {
        self.base_profile == profile || self.sub_profiles.contains(profile)
    }
}

/// A store of profile sets, unique per base profile.
#[derive(Debug, Default)]
pub struct ProfileStore {
    sets: HashMap<String, ProfileSet>,
}

impl ProfileStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a profile set. A set with the same base profile replaces the
    /// previous one (uniqueness is on the base profile).
    ///
    /// An empty base profile name is rejected.
    pub fn add(&mut self, profile_set: ProfileSet) -> Result<(), ConfigError> {
        if profile_set.base_profile().trim().is_empty() {
            return Err(ConfigError::SchemaInvalid {
                reason: "profile base name must not be empty".to_string(),
            });
        }
        self.sets
            .insert(profile_set.base_profile().to_string(), profile_set);
        Ok(())
    }

    /// Look up a profile set by base profile.
    pub fn get(&self, base_profile: &str) -> Result<&ProfileSet, ConfigError> {
        self.sets
            .get(base_profile)
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: base_profile.to_string(),
            })
    }

    /// Number of stored sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
