//! Artifact slots and bundles.
//!
//! A slot is declared when the pipeline is defined; a bundle is the set of
//! files that flows through that slot during a run.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::ResourceId;

/// What an artifact slot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Raw checkout of the tracked branch.
    Source,
    /// Output of the build procedure.
    Website,
}

/// A structural artifact slot bound to one producer and its consumer.
///
/// Slots have no runtime content; two slots are the same artifact iff
/// their ids are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSlot {
    pub id: ResourceId,
    pub name: String,
    pub kind: ArtifactKind,
}

impl ArtifactSlot {
    pub fn new(name: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            id: ResourceId::new(),
            name: name.into(),
            kind,
        }
    }
}

/// Files carried through an artifact slot, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactBundle {
    files: BTreeMap<String, Bytes>,
}

impl ArtifactBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file. Leading `./` and `/` are stripped from the key.
    pub fn insert(&mut self, path: impl AsRef<str>, content: impl Into<Bytes>) {
        self.files
            .insert(normalize_key(path.as_ref()), content.into());
    }

    pub fn with_file(mut self, path: impl AsRef<str>, content: impl Into<Bytes>) -> Self {
        self.insert(path, content);
        self
    }

    pub fn get(&self, path: &str) -> Option<&Bytes> {
        self.files.get(&normalize_key(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(&normalize_key(path))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|b| b.len() as u64).sum()
    }

    /// SHA-256 over every path and its content, in path order.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, content) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update((content.len() as u64).to_be_bytes());
            hasher.update(content);
        }
        hex::encode(hasher.finalize())
    }

    pub fn into_files(self) -> BTreeMap<String, Bytes> {
        self.files
    }
}

impl FromIterator<(String, Bytes)> for ArtifactBundle {
    fn from_iter<I: IntoIterator<Item = (String, Bytes)>>(iter: I) -> Self {
        let mut bundle = Self::new();
        for (path, content) in iter {
            bundle.insert(path, content);
        }
        bundle
    }
}

fn normalize_key(path: &str) -> String {
    path.trim_start_matches("./").trim_start_matches('/').to_string()
}
