//! Ordered, named container of resource configs and profile sets.
//!
//! Duplicate names are legal; order of insertion is the order of
//! application. The name is usually the base URI the sequence was digested
//! from.

use std::fmt;
use std::sync::Arc;

use crate::profile::ProfileSet;
use crate::resource::ResourceConfig;

/// One entry of a [`ResourceConfigSeq`].
#[derive(Debug, Clone)]
pub enum SeqEntry {
    /// A resource config.
    Resource(Arc<ResourceConfig>),
    /// A profile set declaration.
    Profiles(ProfileSet),
}

/// An insertion-ordered sequence of resource configs and profile sets.
#[derive(Debug, Default)]
pub struct ResourceConfigSeq {
    name: String,
    entries: Vec<SeqEntry>,
}

impl ResourceConfigSeq {
    /// Create an empty sequence with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// The sequence name (usually its base URI).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a resource config.
    pub fn add(&mut self, config: ResourceConfig) -> Arc<ResourceConfig> {
        let config = Arc::new(config);
        self.entries.push(SeqEntry::Resource(Arc::clone(&config)));
        config
    }

    /// Append an already-shared resource config.
    pub fn add_shared(&mut self, config: Arc<ResourceConfig>) {
        self.entries.push(SeqEntry::Resource(config));
    }

    /// Append a profile set.
    pub fn add_profile_set(&mut self, profile_set: ProfileSet) {
        self.entries.push(SeqEntry::Profiles(profile_set));
    }

    /// All entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[SeqEntry] {
        &self.entries
    }

    /// The resource configs, in insertion order.
    pub fn resource_configs(&self) -> impl Iterator<Item = &Arc<ResourceConfig>> {
        self.entries.iter().filter_map(|entry| match entry {
            SeqEntry::Resource(config) => Some(config),
            SeqEntry::Profiles(_) => None,
        })
    }

    /// The profile sets, in insertion order.
    pub fn profile_sets(&self) -> impl Iterator<Item = &ProfileSet> {
        self.entries.iter().filter_map(|entry| match entry {
            SeqEntry::Profiles(set) => Some(set),
            SeqEntry::Resource(_) => None,
        })
    }

    /// Whether the sequence holds no resource configs.
    ///
    /// Profile sets alone do not make a sequence non-empty; digestion of a
    /// document that produced no resources is an error.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resource_configs().next().is_none()
    }

    /// Number of resource configs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resource_configs().count()
    }
}

impl fmt::Display for ResourceConfigSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} resources)", self.name, self.len())
    }
}
