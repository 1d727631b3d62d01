//! Change notifications and generation filtering.

use std::collections::HashMap;

use crate::resource::{ManagedResource, ResourceKey};

/// A change observed on a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub key: ResourceKey,
    pub generation: i64,
    pub deletion_requested: bool,
}

impl Notification {
    pub fn new(key: ResourceKey, generation: i64) -> Self {
        Self {
            key,
            generation,
            deletion_requested: false,
        }
    }

    #[must_use]
    pub fn deleting(mut self) -> Self {
        self.deletion_requested = true;
        self
    }

    pub fn for_record<R: ManagedResource>(record: &R) -> Self {
        let meta = record.metadata();
        Self {
            key: meta.key(),
            generation: meta.generation,
            deletion_requested: meta.deletion_requested(),
        }
    }
}

/// Drops notifications whose generation was already processed successfully.
///
/// Deletion requests always pass. Marker and status writes do not advance the
/// generation, so the reconciler's own updates are filtered out here.
#[derive(Debug, Default)]
pub struct GenerationFilter {
    observed: HashMap<ResourceKey, i64>,
}

impl GenerationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, notification: &Notification) -> bool {
        if notification.deletion_requested {
            return true;
        }
        match self.observed.get(&notification.key) {
            Some(&seen) => notification.generation > seen,
            None => true,
        }
    }

    /// Record a successfully processed generation.
    pub fn observe(&mut self, key: &ResourceKey, generation: i64) {
        let seen = self.observed.entry(key.clone()).or_insert(generation);
        if generation > *seen {
            *seen = generation;
        }
    }

    /// Drop state for a removed identity.
    pub fn forget(&mut self, key: &ResourceKey) {
        self.observed.remove(key);
    }

    pub fn observed(&self, key: &ResourceKey) -> Option<i64> {
        self.observed.get(key).copied()
    }
}
