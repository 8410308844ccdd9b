//! Ordered PV database with build-time validation.
//!
//! Built once at IOC startup from descriptors and immutable after
//! construction. Lookups are O(1); iteration preserves insertion order
//! so database dumps and driver registration stay deterministic.

use std::collections::HashMap;

use crate::pv::{DescriptorError, PvDescriptor};

/// Database construction error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    /// Two descriptors share a name.
    #[error("duplicate PV name '{name}'")]
    DuplicateName { name: String },

    /// A descriptor failed its own validation.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Ordered mapping of PV name to descriptor.
#[derive(Debug, Default, Clone)]
pub struct PvDatabase {
    descriptors: Vec<PvDescriptor>,
    index: HashMap<String, usize>,
}

impl PvDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and append a descriptor.
    ///
    /// # Errors
    ///
    /// Rejects invalid descriptors and duplicate names.
    pub fn insert(&mut self, descriptor: PvDescriptor) -> Result<(), DbError> {
        descriptor.validate()?;
        if self.index.contains_key(&descriptor.name) {
            return Err(DbError::DuplicateName {
                name: descriptor.name.clone(),
            });
        }
        self.index
            .insert(descriptor.name.clone(), self.descriptors.len());
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Look up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&PvDescriptor> {
        self.index.get(name).map(|&i| &self.descriptors[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Descriptors in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PvDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
