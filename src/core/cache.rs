use crate::core::corner::CornerConfig;
use crate::core::digest::ContentDigest;
use crate::core::fingerprint::FingerprintSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CACHE_FILE_NAME: &str = ".leafcull-cache.json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What earlier runs learned about one file's content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Corner verdict under the cached [`CornerConfig`]; `None` when the
    /// corner stage has not looked at this content yet.
    #[serde(default)]
    pub corner_artifact: Option<bool>,
    #[serde(default)]
    pub fingerprints: Option<FingerprintSet>,
}

/// Analysis results from earlier runs, keyed by content digest so a renamed
/// or moved file still hits.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FingerprintCache {
    hash_size: u32,
    #[serde(default)]
    corners: CornerConfig,
    entries: HashMap<String, CacheEntry>,
    #[serde(skip)]
    dirty: bool,
}

impl FingerprintCache {
    pub fn empty(hash_size: u32, corners: CornerConfig) -> Self {
        Self {
            hash_size,
            corners,
            ..Self::default()
        }
    }

    pub fn path_for(root: &Path) -> PathBuf {
        root.join(CACHE_FILE_NAME)
    }

    /// Load the cache under `root`. A missing, unreadable or stale cache
    /// (different hash size) yields an empty one. Corner verdicts made
    /// under other corner settings are dropped, as are fingerprint sets
    /// that are empty or not `hash_size` bits wide.
    pub fn load(root: &Path, hash_size: u32, corners: &CornerConfig) -> Self {
        let path = Self::path_for(root);
        if !path.is_file() {
            return Self::empty(hash_size, *corners);
        }
        let mut cache = match Self::read(&path) {
            Ok(cache) if cache.hash_size == hash_size => cache,
            Ok(_) => {
                log::info!("Fingerprint cache was built with another hash size; ignoring it");
                return Self::empty(hash_size, *corners);
            }
            Err(e) => {
                log::warn!("Ignoring unreadable fingerprint cache {}: {}", path.display(), e);
                return Self::empty(hash_size, *corners);
            }
        };

        if cache.corners != *corners {
            log::info!("Corner settings changed; discarding cached corner verdicts");
            for entry in cache.entries.values_mut() {
                entry.corner_artifact = None;
            }
            cache.corners = *corners;
            cache.dirty = true;
        }

        let width = (hash_size as usize * hash_size as usize).div_ceil(8);
        let mut malformed = 0usize;
        for entry in cache.entries.values_mut() {
            if entry.fingerprints.as_ref().is_some_and(|set| !set.has_width(width)) {
                entry.fingerprints = None;
                malformed += 1;
            }
        }
        if malformed > 0 {
            log::warn!("Dropped {} malformed fingerprint set(s) from {}", malformed, path.display());
            cache.dirty = true;
        }
        cache
            .entries
            .retain(|_, entry| entry.corner_artifact.is_some() || entry.fingerprints.is_some());

        log::info!("Loaded {} cached analysis entries", cache.entries.len());
        cache
    }

    fn read(path: &Path) -> Result<Self, CacheError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn get(&self, digest: &ContentDigest) -> Option<&CacheEntry> {
        self.entries.get(&digest.to_hex())
    }

    pub fn record_corner(&mut self, digest: &ContentDigest, artifact: bool) {
        self.entries.entry(digest.to_hex()).or_default().corner_artifact = Some(artifact);
        self.dirty = true;
    }

    pub fn record_fingerprints(&mut self, digest: &ContentDigest, set: FingerprintSet) {
        self.entries.entry(digest.to_hex()).or_default().fingerprints = Some(set);
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write back if anything changed.
    pub fn save(&mut self, root: &Path) -> Result<(), CacheError> {
        if !self.dirty {
            return Ok(());
        }
        let path = Self::path_for(root);
        fs::write(&path, serde_json::to_string(self)?)?;
        self.dirty = false;
        log::debug!("Saved {} cache entries to {}", self.entries.len(), path.display());
        Ok(())
    }
}
