// Insertion-ordered feature collection owned by one session.

use std::collections::{BTreeMap, HashMap};

use mapplan_common::types::{Feature, FeatureId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureSetError {
    #[error("feature {0} does not exist")]
    NotFound(FeatureId),

    #[error("feature {} is at version {}, expected {expected}", .current.id, .current.version)]
    VersionConflict { expected: u64, current: Feature },

    #[error("feature id or version space exhausted")]
    Exhausted,
}

/// Features keyed by server-assigned id, iterated in insertion order.
///
/// Ids are `f{n}` where `n` is a per-set counter that is never reused, so the
/// counter doubles as the ordering key.
#[derive(Debug)]
pub struct FeatureSet {
    entries: BTreeMap<u64, Feature>,
    index: HashMap<FeatureId, u64>,
    next_seq: u64,
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureSet {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new(), index: HashMap::new(), next_seq: 1 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.index.get(id).and_then(|seq| self.entries.get(seq))
    }

    /// Store a new feature at version 1 under a fresh id.
    pub fn insert(&mut self, payload: serde_json::Value) -> Result<&Feature, FeatureSetError> {
        let seq = self.next_seq;
        self.next_seq = seq.checked_add(1).ok_or(FeatureSetError::Exhausted)?;

        let id = format!("f{seq}");
        self.index.insert(id.clone(), seq);
        Ok(self.entries.entry(seq).or_insert(Feature { id, payload, version: 1 }))
    }

    /// Compare-and-swap on `version`: replaces the payload only when
    /// `expected_version` matches, leaving the feature untouched otherwise.
    pub fn update(
        &mut self,
        id: &str,
        expected_version: u64,
        payload: serde_json::Value,
    ) -> Result<&Feature, FeatureSetError> {
        let feature = self
            .index
            .get(id)
            .and_then(|seq| self.entries.get_mut(seq))
            .ok_or_else(|| FeatureSetError::NotFound(id.to_string()))?;

        if feature.version != expected_version {
            return Err(FeatureSetError::VersionConflict {
                expected: expected_version,
                current: feature.clone(),
            });
        }

        feature.version = feature.version.checked_add(1).ok_or(FeatureSetError::Exhausted)?;
        feature.payload = payload;
        Ok(feature)
    }

    pub fn remove(&mut self, id: &str) -> Result<Feature, FeatureSetError> {
        let seq = self.index.remove(id).ok_or_else(|| FeatureSetError::NotFound(id.to_string()))?;
        self.entries.remove(&seq).ok_or_else(|| FeatureSetError::NotFound(id.to_string()))
    }

    /// Full ordered copy, as sent to a newly joined peer.
    pub fn snapshot(&self) -> Vec<Feature> {
        self.entries.values().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn with_next_seq(next_seq: u64) -> Self {
        Self { next_seq, ..Self::new() }
    }
}
