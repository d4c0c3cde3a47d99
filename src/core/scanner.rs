use crate::config::{ConfigError, EngineConfig};
use crate::core::cache::{CacheEntry, FingerprintCache};
use crate::core::category::{CategoryLabel, LayoutCheck};
use crate::core::corner::CornerDetector;
use crate::core::digest::{ContentDigest, DigestEngine, DigestError};
use crate::core::fingerprint::{FingerprintEngine, FingerprintError, FingerprintSet, load_image};
use crate::core::matcher::NearDuplicateMatcher;
use crate::core::report::{CategoryCounts, FailurePhase, FileFailure, RemovalReason, bump};
use crate::core::retention::{PolicyTable, RetentionPolicy};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Directory not found: {path}")]
    DirectoryNotFound { path: String },

    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    #[error("No images found under {path}")]
    NoImagesFound { path: String },

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Could not start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Operation cancelled")]
    Cancelled,
}

/// One image under consideration for the current run.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub category: CategoryLabel,
    pub digest: Option<ContentDigest>,
    pub fingerprints: Option<FingerprintSet>,
}

impl ImageRecord {
    /// Category comes from the path below `root`; the root's own
    /// directory names never count.
    pub fn new(root: &Path, path: PathBuf) -> Self {
        let category = CategoryLabel::classify(path.strip_prefix(root).unwrap_or(&path));
        Self {
            path,
            category,
            digest: None,
            fingerprints: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GroupKind {
    Exact,
    Near,
}

/// Records joined by the matching relation, with the retention outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub kind: GroupKind,
    /// Record indices in scan order.
    pub members: Vec<usize>,
    /// Record index of the survivor.
    pub keep: usize,
    pub protection_applied: bool,
}

impl DuplicateGroup {
    pub fn removed(&self) -> impl Iterator<Item = usize> + '_ {
        self.members.iter().copied().filter(move |&m| m != self.keep)
    }
}

/// Working state threaded through the planning phases.
#[derive(Debug)]
pub struct EngineState {
    pub root: PathBuf,
    pub records: Vec<ImageRecord>,
    pub policies: PolicyTable,
    pub before: CategoryCounts,
    pub removals: BTreeMap<usize, RemovalReason>,
    pub groups: Vec<DuplicateGroup>,
    pub corner_artifacts: Vec<usize>,
    pub failures: Vec<FileFailure>,
    /// Records that could not be read or decoded.
    pub excluded: Vec<bool>,
}

impl EngineState {
    pub fn new(root: &Path, paths: Vec<PathBuf>, min_count: usize) -> Self {
        let records: Vec<ImageRecord> = paths
            .into_iter()
            .map(|path| ImageRecord::new(root, path))
            .collect();
        let mut before = CategoryCounts::new();
        for record in &records {
            bump(&mut before, record.category);
        }
        let policies = PolicyTable::from_counts(&before, min_count);
        let excluded = vec![false; records.len()];
        Self {
            root: root.to_path_buf(),
            records,
            policies,
            before,
            removals: BTreeMap::new(),
            groups: Vec::new(),
            corner_artifacts: Vec::new(),
            failures: Vec::new(),
            excluded,
        }
    }

    /// Still eligible for a later phase.
    pub fn is_active(&self, index: usize) -> bool {
        !self.excluded[index] && !self.removals.contains_key(&index)
    }

    fn exclude(&mut self, index: usize, phase: FailurePhase, message: String) {
        let path = &self.records[index].path;
        log::warn!("Skipping {}: {}", path.display(), message);
        self.failures.push(FileFailure::new(path.clone(), phase, message));
        self.excluded[index] = true;
    }

    /// Run retention over `members` (scan order) and record the outcome.
    fn settle_group(&mut self, kind: GroupKind, members: Vec<usize>, reason: RemovalReason) {
        let labels: Vec<CategoryLabel> = members.iter().map(|&i| self.records[i].category).collect();
        let Some(decision) = RetentionPolicy::new(&self.policies).decide(&labels) else {
            return;
        };

        let keep = members[decision.keep];
        for &pos in &decision.delete {
            self.removals.insert(members[pos], reason);
        }
        if decision.protection_applied {
            log::debug!(
                "Kept protected {} over earlier members: {}",
                self.records[keep].category,
                self.records[keep].path.display()
            );
        }
        self.groups.push(DuplicateGroup {
            kind,
            members,
            keep,
            protection_applied: decision.protection_applied,
        });
    }
}

/// What a run intends to remove. Rendered as-is in a dry run, handed to
/// [`crate::core::executor::Executor`] to commit.
#[derive(Debug)]
pub struct CleanupPlan {
    pub root: PathBuf,
    pub records: Vec<ImageRecord>,
    pub policies: PolicyTable,
    pub before: CategoryCounts,
    pub groups: Vec<DuplicateGroup>,
    pub corner_artifacts: Vec<usize>,
    pub removals: BTreeMap<usize, RemovalReason>,
    pub failures: Vec<FileFailure>,
}

impl CleanupPlan {
    pub fn exact_groups(&self) -> impl Iterator<Item = &DuplicateGroup> {
        self.groups.iter().filter(|g| g.kind == GroupKind::Exact)
    }

    pub fn near_groups(&self) -> impl Iterator<Item = &DuplicateGroup> {
        self.groups.iter().filter(|g| g.kind == GroupKind::Near)
    }

    pub fn marked(&self) -> usize {
        self.removals.len()
    }

    pub fn marked_by(&self, reason: RemovalReason) -> CategoryCounts {
        let mut counts = CategoryCounts::new();
        for (&index, &r) in &self.removals {
            if r == reason {
                bump(&mut counts, self.records[index].category);
            }
        }
        counts
    }

    pub fn path(&self, index: usize) -> &Path {
        &self.records[index].path
    }
}

impl From<EngineState> for CleanupPlan {
    fn from(state: EngineState) -> Self {
        Self {
            root: state.root,
            records: state.records,
            policies: state.policies,
            before: state.before,
            groups: state.groups,
            corner_artifacts: state.corner_artifacts,
            removals: state.removals,
            failures: state.failures,
        }
    }
}

/// Category counts and layout check without any hashing.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetSurvey {
    pub root: PathBuf,
    pub total: usize,
    pub counts: CategoryCounts,
    pub protected: Vec<CategoryLabel>,
    pub layout: LayoutCheck,
}

enum Analysis {
    Artifact,
    Fingerprinted(FingerprintSet),
    Clean,
    Failed(FingerprintError),
}

/// Runs the duplicate and corner-artifact pipeline over a dataset root.
pub struct ScannerService {
    config: EngineConfig,
    cancellation_token: Arc<AtomicBool>,
    pool: rayon::ThreadPool,
    digest_engine: DigestEngine,
    fingerprint_engine: FingerprintEngine,
    corner_detector: CornerDetector,
    matcher: NearDuplicateMatcher,
}

impl ScannerService {
    pub fn new(config: EngineConfig) -> Result<Self, ScanError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .build()?;

        Ok(Self {
            cancellation_token: Arc::new(AtomicBool::new(false)),
            pool,
            digest_engine: DigestEngine::new(),
            fingerprint_engine: FingerprintEngine::new(config.hash_size),
            corner_detector: CornerDetector::new(config.corners),
            matcher: NearDuplicateMatcher::new(config.threshold),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn get_cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel_scan(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    fn check_cancelled(&self) -> Result<(), ScanError> {
        if self.is_cancelled() {
            Err(ScanError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn quarantine_root(&self, root: &Path) -> PathBuf {
        root.join(&self.config.quarantine_dir)
    }

    pub(crate) fn progress_bar(&self, len: u64, message: &'static str) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:40.green}] {pos}/{len} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message(message);
        bar
    }

    /// Recursively list recognized images under `root`, sorted by path so
    /// "first in scan order" is the same on every platform.
    pub fn discover_files(&self, root: &Path) -> Result<Vec<PathBuf>, ScanError> {
        if !root.exists() {
            return Err(ScanError::DirectoryNotFound {
                path: root.to_string_lossy().to_string(),
            });
        }
        if !root.is_dir() {
            return Err(ScanError::NotADirectory {
                path: root.to_string_lossy().to_string(),
            });
        }

        let spinner = if self.config.show_progress {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::hidden()
        };
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message("Scanning for images…");
        spinner.enable_steady_tick(Duration::from_millis(100));

        let quarantine = self.quarantine_root(root);
        let mut images = Vec::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.path() != quarantine.as_path());

        for entry in walker {
            self.check_cancelled()?;
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_file() && self.config.accepts_extension(entry.path()) {
                        images.push(entry.into_path());
                    }
                }
                Err(e) => log::warn!("Walk error: {}", e),
            }
        }
        spinner.finish_and_clear();

        images.sort();
        Ok(images)
    }

    /// Count images per category and check the expected directory layout.
    pub fn survey(&self, root: &Path) -> Result<DatasetSurvey, ScanError> {
        let files = self.discover_files(root)?;
        let state = EngineState::new(root, files, self.config.min_count);
        Ok(DatasetSurvey {
            root: root.to_path_buf(),
            total: state.records.len(),
            protected: state.policies.protected_labels(),
            counts: state.before,
            layout: LayoutCheck::inspect(root),
        })
    }

    /// Run every enabled planning phase. Nothing on disk changes.
    pub fn plan(&self, root: &Path) -> Result<CleanupPlan, ScanError> {
        self.check_cancelled()?;

        let layout = LayoutCheck::inspect(root);
        let files = self.discover_files(root)?;
        if files.is_empty() {
            return Err(ScanError::NoImagesFound {
                path: root.to_string_lossy().to_string(),
            });
        }
        for missing in &layout.missing {
            log::warn!("Expected category directory missing: {}", missing);
        }

        let mut state = EngineState::new(root, files, self.config.min_count);
        log::info!(
            "Found {} images; protected categories: {:?}",
            state.records.len(),
            state.policies.protected_labels()
        );

        let stages = self.config.stages;
        if stages.exact || self.config.use_cache {
            self.digest_phase(&mut state)?;
        }
        if stages.exact {
            self.exact_phase(&mut state);
        }
        self.check_cancelled()?;

        if stages.near || stages.corners {
            let mut cache = if self.config.use_cache {
                Some(FingerprintCache::load(root, self.config.hash_size, &self.config.corners))
            } else {
                None
            };
            self.analysis_phase(&mut state, cache.as_mut())?;
            if let Some(cache) = cache.as_mut() {
                if let Err(e) = cache.save(root) {
                    log::warn!("Failed to save fingerprint cache: {}", e);
                }
            }
        }
        if stages.near {
            self.near_phase(&mut state)?;
        }

        Ok(state.into())
    }

    /// Content digests for every record, in parallel.
    pub fn digest_phase(&self, state: &mut EngineState) -> Result<(), ScanError> {
        let bar = self.progress_bar(state.records.len() as u64, "Hashing files");
        let results: Vec<Result<ContentDigest, DigestError>> = self.pool.install(|| {
            state
                .records
                .par_iter()
                .map(|record| {
                    self.check_cancelled()?;
                    let result = self.digest_engine.digest_file(&record.path);
                    bar.inc(1);
                    Ok(result)
                })
                .collect::<Result<Vec<_>, ScanError>>()
        })?;
        bar.finish_and_clear();

        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(digest) => state.records[index].digest = Some(digest),
                Err(e) => state.exclude(index, FailurePhase::Read, e.to_string()),
            }
        }
        Ok(())
    }

    /// Group byte-identical files and apply retention to each group.
    pub fn exact_phase(&self, state: &mut EngineState) {
        let mut by_digest: BTreeMap<ContentDigest, Vec<usize>> = BTreeMap::new();
        for (index, record) in state.records.iter().enumerate() {
            if let (true, Some(digest)) = (state.is_active(index), record.digest) {
                by_digest.entry(digest).or_default().push(index);
            }
        }

        let mut groups: Vec<Vec<usize>> = by_digest.into_values().filter(|g| g.len() > 1).collect();
        groups.sort_by_key(|g| g[0]);

        let count = groups.len();
        for members in groups {
            state.settle_group(GroupKind::Exact, members, RemovalReason::ExactDuplicate);
        }
        log::info!("Exact stage: {} group(s) of byte-identical files", count);
    }

    /// Decode surviving images once; flag corner artifacts and compute
    /// fingerprint closures.
    pub fn analysis_phase(
        &self,
        state: &mut EngineState,
        mut cache: Option<&mut FingerprintCache>,
    ) -> Result<(), ScanError> {
        let stages = self.config.stages;
        let mut pending: Vec<usize> = Vec::new();
        let mut resolved: Vec<(usize, Analysis)> = Vec::new();

        for index in 0..state.records.len() {
            if !state.is_active(index) {
                continue;
            }
            let entry = match (cache.as_deref(), state.records[index].digest) {
                (Some(cache), Some(digest)) => cache.get(&digest),
                _ => None,
            };
            match entry.and_then(|entry| self.resolve_cached(entry)) {
                Some(analysis) => resolved.push((index, analysis)),
                None => pending.push(index),
            }
        }
        if !resolved.is_empty() {
            log::debug!("{} image(s) resolved from the cache", resolved.len());
        }

        let bar = self.progress_bar(pending.len() as u64, "Analyzing images");
        let results: Vec<(usize, Analysis)> = self.pool.install(|| {
            pending
                .par_iter()
                .map(|&index| {
                    self.check_cancelled()?;
                    let analysis = self.analyze(&state.records[index].path);
                    bar.inc(1);
                    Ok((index, analysis))
                })
                .collect::<Result<Vec<_>, ScanError>>()
        })?;
        bar.finish_and_clear();

        if let Some(cache) = cache.as_deref_mut() {
            for (index, analysis) in &results {
                let Some(digest) = state.records[*index].digest else {
                    continue;
                };
                match analysis {
                    Analysis::Artifact => cache.record_corner(&digest, true),
                    Analysis::Fingerprinted(set) => {
                        if stages.corners {
                            cache.record_corner(&digest, false);
                        }
                        cache.record_fingerprints(&digest, set.clone());
                    }
                    Analysis::Clean => {
                        if stages.corners {
                            cache.record_corner(&digest, false);
                        }
                    }
                    Analysis::Failed(_) => {}
                }
            }
        }

        for (index, analysis) in resolved.into_iter().chain(results) {
            match analysis {
                Analysis::Artifact => {
                    let record = &state.records[index];
                    if state.policies.is_protected(record.category) {
                        log::warn!(
                            "Protected category {} has a corner artifact: {}",
                            record.category,
                            record.path.display()
                        );
                    }
                    state.removals.insert(index, RemovalReason::CornerArtifact);
                    state.corner_artifacts.push(index);
                }
                Analysis::Fingerprinted(set) => state.records[index].fingerprints = Some(set),
                Analysis::Clean => {}
                Analysis::Failed(e) => state.exclude(index, FailurePhase::Decode, e.to_string()),
            }
        }

        log::info!(
            "Analysis stage: {} image(s) decoded, {} corner artifact(s)",
            pending.len(),
            state.corner_artifacts.len()
        );
        Ok(())
    }

    /// The analysis a cache entry already answers, or `None` when the
    /// image still has to be decoded.
    fn resolve_cached(&self, entry: &CacheEntry) -> Option<Analysis> {
        let stages = self.config.stages;
        if stages.corners {
            if entry.corner_artifact? {
                return Some(Analysis::Artifact);
            }
        }
        if !stages.near {
            return Some(Analysis::Clean);
        }
        entry.fingerprints.clone().map(Analysis::Fingerprinted)
    }

    fn analyze(&self, path: &Path) -> Analysis {
        let img = match load_image(path) {
            Ok(img) => img,
            Err(e) => return Analysis::Failed(e),
        };
        if self.config.stages.corners && self.corner_detector.is_rotation_artifact(&img) {
            return Analysis::Artifact;
        }
        if self.config.stages.near {
            Analysis::Fingerprinted(self.fingerprint_engine.fingerprint_closure(&img))
        } else {
            Analysis::Clean
        }
    }

    /// Cluster fingerprinted survivors and apply retention per cluster.
    pub fn near_phase(&self, state: &mut EngineState) -> Result<(), ScanError> {
        self.check_cancelled()?;

        let candidates: Vec<usize> = (0..state.records.len())
            .filter(|&i| state.is_active(i) && state.records[i].fingerprints.is_some())
            .collect();
        let sets: Vec<&FingerprintSet> = candidates
            .iter()
            .filter_map(|&i| state.records[i].fingerprints.as_ref())
            .collect();

        let clusters = self.pool.install(|| self.matcher.group(&sets));
        self.check_cancelled()?;

        let count = clusters.len();
        for cluster in clusters {
            let members: Vec<usize> = cluster.into_iter().map(|pos| candidates[pos]).collect();
            state.settle_group(GroupKind::Near, members, RemovalReason::NearDuplicate);
        }
        log::info!("Near-duplicate stage: {} group(s) among {} image(s)", count, candidates.len());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Stages;
    use crate::core::corner::CornerConfig;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::fs;
    use tempfile::TempDir;

    pub(crate) fn quiet_config() -> EngineConfig {
        EngineConfig {
            show_progress: false,
            workers: 2,
            ..EngineConfig::default()
        }
    }

    /// Deterministic noise image; different seeds never look alike.
    pub(crate) fn noise_image(width: u32, height: u32, seed: u32) -> DynamicImage {
        let mut state = seed.wrapping_mul(2654435761).wrapping_add(0x1234_5678);
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let v = 40 + (state % 200) as u8;
            Rgb([v, 255 - v, v / 2 + 60])
        }))
    }

    pub(crate) fn write_image(path: &Path, img: &DynamicImage) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        img.save(path).unwrap();
    }

    pub(crate) fn black_cornered(width: u32, height: u32, seed: u32) -> DynamicImage {
        let mut img = noise_image(width, height, seed).to_rgb8();
        let leg = 30;
        for dy in 0..leg {
            for dx in 0..(leg - dy) {
                for (x, y) in [
                    (dx, dy),
                    (width - 1 - dx, dy),
                    (dx, height - 1 - dy),
                    (width - 1 - dx, height - 1 - dy),
                ] {
                    img.put_pixel(x, y, Rgb([0, 0, 0]));
                }
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = ScannerService::new(quiet_config()).unwrap();
        let result = scanner.plan(&temp_dir.path().join("nope"));
        assert!(matches!(result, Err(ScanError::DirectoryNotFound { .. })));
    }

    #[test]
    fn test_empty_root_reports_no_images() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = ScannerService::new(quiet_config()).unwrap();
        assert!(matches!(
            scanner.plan(temp_dir.path()),
            Err(ScanError::NoImagesFound { .. })
        ));
    }

    #[test]
    fn test_discovery_filters_sorts_and_skips_quarantine() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for rel in ["Healthy/b.jpg", "Healthy/a.PNG", "Blight/c.webp", "duplicates/Healthy/z.jpg"] {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"x").unwrap();
        }
        fs::write(root.join("Healthy/notes.txt"), b"x").unwrap();

        let scanner = ScannerService::new(quiet_config()).unwrap();
        let files = scanner.discover_files(root).unwrap();
        let rel: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(rel, vec!["Blight/c.webp", "Healthy/a.PNG", "Healthy/b.jpg"]);
    }

    #[test]
    fn test_cancelled_before_start() {
        let temp_dir = TempDir::new().unwrap();
        write_image(&temp_dir.path().join("Healthy/a.png"), &noise_image(48, 48, 1));

        let scanner = ScannerService::new(quiet_config()).unwrap();
        scanner.get_cancellation_token().store(true, Ordering::Relaxed);
        assert!(matches!(scanner.plan(temp_dir.path()), Err(ScanError::Cancelled)));
    }

    #[test]
    fn test_exact_duplicates_protect_rust_survivor() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let a = root.join("Common_Rust/a1.png");
        write_image(&a, &noise_image(64, 64, 1));
        fs::copy(&a, root.join("Common_Rust/a2.png")).unwrap();
        fs::create_dir_all(root.join("Blight")).unwrap();
        fs::copy(&a, root.join("Blight/a3.png")).unwrap();
        for seed in 10..14 {
            write_image(&root.join(format!("Blight/x{}.png", seed)), &noise_image(64, 64, seed));
        }

        let config = EngineConfig {
            min_count: 4,
            ..quiet_config()
        };
        let scanner = ScannerService::new(config).unwrap();
        let plan = scanner.plan(root).unwrap();

        // Blight/a3 sorts first, but Common_Rust is protected (2 < 4).
        let exact: Vec<&DuplicateGroup> = plan.exact_groups().collect();
        assert_eq!(exact.len(), 1);
        assert!(exact[0].protection_applied);
        assert_eq!(plan.path(exact[0].keep), a.as_path());
        assert_eq!(plan.marked(), 2);
        assert_eq!(plan.near_groups().count(), 0);
    }

    #[test]
    fn test_rotated_and_mirrored_copies_are_near_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let img = noise_image(80, 60, 5);
        write_image(&root.join("Healthy/orig.png"), &img);
        write_image(&root.join("Healthy/rot90.png"), &img.rotate90());
        write_image(&root.join("Healthy/mirror.png"), &img.fliph());
        write_image(&root.join("Healthy/other.png"), &noise_image(80, 60, 99));

        let scanner = ScannerService::new(EngineConfig {
            min_count: 1,
            ..quiet_config()
        })
        .unwrap();
        let plan = scanner.plan(root).unwrap();

        let near: Vec<&DuplicateGroup> = plan.near_groups().collect();
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].members.len(), 3);
        // mirror.png sorts first.
        assert!(plan.path(near[0].keep).ends_with("mirror.png"));
        assert_eq!(plan.marked_by(RemovalReason::NearDuplicate).get(&CategoryLabel::Healthy), Some(&2));
    }

    #[test]
    fn test_mixed_near_group_keeps_protected_member() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let img = noise_image(64, 64, 8);
        write_image(&root.join("Blight/leaf.png"), &img);
        write_image(&root.join("Common_Rust/leaf_rot.png"), &img.rotate270());
        for seed in 20..23 {
            write_image(&root.join(format!("Blight/x{}.png", seed)), &noise_image(64, 64, seed));
        }

        let scanner = ScannerService::new(EngineConfig {
            min_count: 3,
            ..quiet_config()
        })
        .unwrap();
        let plan = scanner.plan(root).unwrap();

        let near: Vec<&DuplicateGroup> = plan.near_groups().collect();
        assert_eq!(near.len(), 1);
        assert_eq!(plan.records[near[0].keep].category, CategoryLabel::CommonRust);
        assert!(near[0].protection_applied);
    }

    #[test]
    fn test_corner_artifacts_flagged_and_excluded_from_matching() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write_image(&root.join("Healthy/padded.png"), &black_cornered(100, 80, 3));
        write_image(&root.join("Healthy/clean.png"), &noise_image(100, 80, 4));

        let scanner = ScannerService::new(quiet_config()).unwrap();
        let plan = scanner.plan(root).unwrap();
        assert_eq!(plan.corner_artifacts.len(), 1);
        assert!(plan.path(plan.corner_artifacts[0]).ends_with("padded.png"));
        assert!(plan.records[plan.corner_artifacts[0]].fingerprints.is_none());
    }

    #[test]
    fn test_corner_only_pass_skips_fingerprints() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let img = noise_image(64, 64, 2);
        write_image(&root.join("Healthy/a.png"), &img);
        write_image(&root.join("Healthy/b.png"), &img);
        write_image(&root.join("Healthy/c.png"), &black_cornered(90, 90, 6));

        let scanner = ScannerService::new(EngineConfig {
            stages: Stages::corners_only(),
            ..quiet_config()
        })
        .unwrap();
        let plan = scanner.plan(root).unwrap();
        assert!(plan.groups.is_empty());
        assert_eq!(plan.corner_artifacts.len(), 1);
        assert!(plan.records.iter().all(|r| r.fingerprints.is_none() && r.digest.is_none()));
    }

    #[test]
    fn test_undecodable_file_is_reported_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("Healthy")).unwrap();
        fs::write(root.join("Healthy/broken.jpg"), b"not an image").unwrap();
        write_image(&root.join("Healthy/fine.png"), &noise_image(64, 64, 1));

        let scanner = ScannerService::new(quiet_config()).unwrap();
        let plan = scanner.plan(root).unwrap();
        assert_eq!(plan.failures.len(), 1);
        assert_eq!(plan.failures[0].phase, FailurePhase::Decode);
        assert!(plan.failures[0].path.ends_with("broken.jpg"));
        assert_eq!(plan.marked(), 0);
    }

    #[test]
    fn test_cache_is_written_and_reused() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let img = noise_image(64, 64, 4);
        write_image(&root.join("Healthy/a.png"), &img);
        write_image(&root.join("Healthy/b.png"), &img.rotate180());

        let config = EngineConfig {
            use_cache: true,
            stages: Stages {
                corners: false,
                ..Stages::default()
            },
            ..quiet_config()
        };
        let scanner = ScannerService::new(config).unwrap();
        let first = scanner.plan(root).unwrap();
        assert!(FingerprintCache::path_for(root).exists());

        let cache = FingerprintCache::load(root, 8, &CornerConfig::default());
        assert_eq!(cache.len(), 2);

        let second = scanner.plan(root).unwrap();
        assert_eq!(first.groups, second.groups);
    }

    #[test]
    fn test_default_stages_answer_from_cache() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let a = root.join("Healthy/a.png");
        let b = root.join("Healthy/b.png");
        write_image(&a, &noise_image(64, 64, 21));
        write_image(&b, &noise_image(64, 64, 22));

        let config = EngineConfig {
            use_cache: true,
            min_count: 1,
            ..quiet_config()
        };
        let scanner = ScannerService::new(config).unwrap();
        let first = scanner.plan(root).unwrap();
        assert_eq!(first.near_groups().count(), 0);

        let digests = DigestEngine::new();
        let digest_a = digests.digest_file(&a).unwrap();
        let digest_b = digests.digest_file(&b).unwrap();
        let mut cache = FingerprintCache::load(root, 8, &CornerConfig::default());
        let entry_a = cache.get(&digest_a).unwrap().clone();
        assert_eq!(entry_a.corner_artifact, Some(false));
        assert_eq!(cache.get(&digest_b).unwrap().corner_artifact, Some(false));

        // Only a run that trusts the cache can see these two as alike.
        cache.record_fingerprints(&digest_b, entry_a.fingerprints.unwrap());
        cache.save(root).unwrap();

        let second = scanner.plan(root).unwrap();
        assert_eq!(second.near_groups().count(), 1);
        assert_eq!(second.removals.len(), 1);
    }

    #[test]
    fn test_cached_corner_verdict_flags_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let path = root.join("Healthy/a.png");
        write_image(&path, &noise_image(64, 64, 23));

        let digest = DigestEngine::new().digest_file(&path).unwrap();
        let mut cache = FingerprintCache::empty(8, CornerConfig::default());
        cache.record_corner(&digest, true);
        cache.save(root).unwrap();

        let config = EngineConfig {
            use_cache: true,
            ..quiet_config()
        };
        let plan = ScannerService::new(config).unwrap().plan(root).unwrap();
        assert_eq!(plan.corner_artifacts.len(), 1);
    }

    #[test]
    fn test_root_directory_name_does_not_classify() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("Blight");
        let path = root.join("Gray_Leaf_Spot/x.png");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"x").unwrap();

        let scanner = ScannerService::new(quiet_config()).unwrap();
        let survey = scanner.survey(&root).unwrap();
        assert_eq!(survey.counts.get(&CategoryLabel::GrayLeafSpot), Some(&1));
        assert_eq!(survey.counts.get(&CategoryLabel::Blight), None);
    }

    #[test]
    fn test_survey_counts_categories() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for rel in ["Healthy/a.jpg", "Healthy/b.jpg", "Compound_Cases/Blight_Rust/c.jpg", "misc/d.jpg"] {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"x").unwrap();
        }

        let scanner = ScannerService::new(quiet_config()).unwrap();
        let survey = scanner.survey(root).unwrap();
        assert_eq!(survey.total, 4);
        assert_eq!(survey.counts.get(&CategoryLabel::Healthy), Some(&2));
        assert_eq!(survey.counts.get(&CategoryLabel::BlightRust), Some(&1));
        assert_eq!(survey.counts.get(&CategoryLabel::Unknown), Some(&1));
        assert!(survey.layout.present.contains(&"Healthy".to_string()));
        assert!(survey.layout.missing.contains(&"Common_Rust".to_string()));
    }
}
