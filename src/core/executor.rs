use crate::core::history::{CullAction, CulledFile, History, HistoryRecord};
use crate::core::report::{CleanupReport, FailurePhase, FileFailure, RemovalReason, bump};
use crate::core::scanner::{CleanupPlan, GroupKind, ScannerService};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalMode {
    /// Report what would happen; touch nothing.
    DryRun,
    Delete,
    /// Move into this directory, mirroring paths relative to the root.
    Quarantine(PathBuf),
}

impl RemovalMode {
    fn action(&self) -> CullAction {
        match self {
            RemovalMode::Quarantine(_) => CullAction::Moved,
            _ => CullAction::Deleted,
        }
    }
}

/// Files removed together and logged as one history record.
struct RemovalUnit {
    reason: RemovalReason,
    retained: Option<usize>,
    files: Vec<usize>,
}

/// Commits a [`CleanupPlan`]. Each file is handled on its own; a failure is
/// recorded and the batch moves on.
pub struct Executor {
    mode: RemovalMode,
    cancellation_token: Arc<AtomicBool>,
    show_progress: bool,
}

impl Executor {
    pub fn new(mode: RemovalMode, cancellation_token: Arc<AtomicBool>) -> Self {
        Self {
            mode,
            cancellation_token,
            show_progress: false,
        }
    }

    /// Share the scanner's cancellation token and progress setting.
    pub fn for_scanner(scanner: &ScannerService, mode: RemovalMode) -> Self {
        Self {
            mode,
            cancellation_token: scanner.get_cancellation_token(),
            show_progress: scanner.config().show_progress,
        }
    }

    pub fn execute(&self, plan: &CleanupPlan) -> CleanupReport {
        let mut report = summarize(plan);
        report.dry_run = self.mode == RemovalMode::DryRun;

        if report.dry_run {
            report.after = plan.before.clone();
            for &index in plan.removals.keys() {
                if let Some(count) = report.after.get_mut(&plan.records[index].category) {
                    *count -= 1;
                }
            }
            return report;
        }

        let bar = if self.show_progress {
            ProgressBar::new(plan.marked() as u64)
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:40.red}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message("Removing");

        let mut history = Vec::new();
        'units: for unit in removal_units(plan) {
            let mut culled = Vec::new();
            for &index in &unit.files {
                if self.cancellation_token.load(Ordering::Relaxed) {
                    log::warn!("Cancelled after {} removal(s)", report.removed);
                    report.cancelled = true;
                    push_history(&mut history, plan, &unit, culled, self.mode.action());
                    break 'units;
                }

                let record = &plan.records[index];
                report.attempted += 1;
                match self.remove(&plan.root, &record.path) {
                    Ok(stored) => {
                        report.removed += 1;
                        bump(report.removed_by_reason.entry(unit.reason).or_default(), record.category);
                        log::debug!("Removed {} ({})", record.path.display(), unit.reason);
                        culled.push(CulledFile {
                            original: record.path.to_string_lossy().into_owned(),
                            stored: stored.map(|p| p.to_string_lossy().into_owned()),
                        });
                    }
                    Err(e) => {
                        log::warn!("Failed to remove {}: {}", record.path.display(), e);
                        report
                            .failures
                            .push(FileFailure::new(record.path.clone(), FailurePhase::Remove, e));
                    }
                }
                bar.inc(1);
            }
            push_history(&mut history, plan, &unit, culled, self.mode.action());
        }
        bar.finish_and_clear();

        if let Err(e) = History::at(&plan.root).append(&history) {
            log::warn!("Failed to write history: {}", e);
        }

        report.after = plan.before.clone();
        for counts in report.removed_by_reason.values() {
            for (label, removed) in counts {
                if let Some(count) = report.after.get_mut(label) {
                    *count -= removed;
                }
            }
        }
        report
    }

    /// Returns where the file went when quarantined.
    fn remove(&self, root: &Path, path: &Path) -> io::Result<Option<PathBuf>> {
        match &self.mode {
            RemovalMode::DryRun => Ok(None),
            RemovalMode::Delete => fs::remove_file(path).map(|_| None),
            RemovalMode::Quarantine(dir) => {
                let destination = resolve_destination(root, dir, path);
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                move_file(path, &destination)?;
                Ok(Some(destination))
            }
        }
    }
}

fn summarize(plan: &CleanupPlan) -> CleanupReport {
    CleanupReport {
        root: plan.root.clone(),
        total_scanned: plan.records.len(),
        protected_categories: plan.policies.protected_labels(),
        before: plan.before.clone(),
        exact_groups: plan.exact_groups().count(),
        exact_duplicates: plan.marked_by(RemovalReason::ExactDuplicate),
        near_groups: plan.near_groups().count(),
        near_duplicates: plan.marked_by(RemovalReason::NearDuplicate),
        corner_artifacts: plan.marked_by(RemovalReason::CornerArtifact),
        protected_survivors: plan.groups.iter().filter(|g| g.protection_applied).count(),
        marked: plan.marked(),
        failures: plan.failures.clone(),
        ..CleanupReport::default()
    }
}

fn removal_units(plan: &CleanupPlan) -> Vec<RemovalUnit> {
    let mut units: Vec<RemovalUnit> = plan
        .groups
        .iter()
        .map(|group| RemovalUnit {
            reason: match group.kind {
                GroupKind::Exact => RemovalReason::ExactDuplicate,
                GroupKind::Near => RemovalReason::NearDuplicate,
            },
            retained: Some(group.keep),
            files: group.removed().collect(),
        })
        .collect();
    if !plan.corner_artifacts.is_empty() {
        units.push(RemovalUnit {
            reason: RemovalReason::CornerArtifact,
            retained: None,
            files: plan.corner_artifacts.clone(),
        });
    }
    units
}

fn push_history(
    history: &mut Vec<HistoryRecord>,
    plan: &CleanupPlan,
    unit: &RemovalUnit,
    culled: Vec<CulledFile>,
    action: CullAction,
) {
    if culled.is_empty() {
        return;
    }
    let retained = unit.retained.map(|index| plan.path(index));
    history.push(HistoryRecord::now(unit.reason, retained, culled, action));
}

/// Mirror `source`'s position under `root` inside `target`; on a clash
/// append ` (n)` to the stem.
fn resolve_destination(root: &Path, target: &Path, source: &Path) -> PathBuf {
    let relative = source
        .strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| source.file_name().map(PathBuf::from).unwrap_or_default());

    let mut candidate = target.join(&relative);
    if !candidate.exists() {
        return candidate;
    }

    let stem = source
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.to_string())
        .unwrap_or_else(|| String::from("file"));
    let extension = source.extension().and_then(|ext| ext.to_str());
    let parent = candidate.parent().map(Path::to_path_buf).unwrap_or_else(|| target.to_path_buf());
    let mut index = 1;

    loop {
        let mut name = format!("{} ({})", stem, index);
        if let Some(ext) = extension {
            name.push('.');
            name.push_str(ext);
        }
        candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
        index += 1;
    }
}

/// Rename, falling back to copy + delete across filesystems.
fn move_file(source: &Path, destination: &Path) -> io::Result<()> {
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(_) if source.is_file() => {
            fs::copy(source, destination)?;
            fs::remove_file(source)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::category::CategoryLabel;
    use crate::core::history::RestoreSelection;
    use crate::core::scanner::tests::{noise_image, quiet_config, write_image};
    use tempfile::TempDir;

    /// Three copies of A in Common_Rust, two copies of B plus two unrelated
    /// images in Blight.
    fn seed_dataset(root: &Path) {
        let a = root.join("Common_Rust/a1.png");
        write_image(&a, &noise_image(64, 64, 1));
        fs::copy(&a, root.join("Common_Rust/a2.png")).unwrap();
        fs::copy(&a, root.join("Common_Rust/a3.png")).unwrap();

        let b = root.join("Blight/b1.png");
        write_image(&b, &noise_image(64, 64, 2));
        fs::copy(&b, root.join("Blight/b2.png")).unwrap();
        write_image(&root.join("Blight/c.png"), &noise_image(64, 64, 3));
        write_image(&root.join("Blight/d.png"), &noise_image(64, 64, 4));
    }

    fn scanner() -> ScannerService {
        ScannerService::new(EngineConfig {
            min_count: 4,
            ..quiet_config()
        })
        .unwrap()
    }

    fn survivors(root: &Path, dir: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root.join(dir))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_delete_end_to_end() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        seed_dataset(root);

        let scanner = scanner();
        let plan = scanner.plan(root).unwrap();
        assert_eq!(plan.policies.protected_labels(), vec![CategoryLabel::CommonRust]);

        let report = Executor::for_scanner(&scanner, RemovalMode::Delete).execute(&plan);
        assert_eq!(survivors(root, "Common_Rust"), vec!["a1.png"]);
        assert_eq!(survivors(root, "Blight"), vec!["b1.png", "c.png", "d.png"]);

        assert_eq!(report.removed_for(RemovalReason::ExactDuplicate, CategoryLabel::CommonRust), 2);
        assert_eq!(report.removed_for(RemovalReason::ExactDuplicate, CategoryLabel::Blight), 1);
        assert_eq!(report.exact_groups, 2);
        assert_eq!(report.marked, 3);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.removed, 3);
        assert_eq!(report.after.get(&CategoryLabel::CommonRust), Some(&1));
        assert_eq!(report.after.get(&CategoryLabel::Blight), Some(&3));
        assert!(!report.dry_run);

        let history = History::at(root).load().unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.action == CullAction::Deleted));
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        seed_dataset(root);

        let scanner = scanner();
        let plan = scanner.plan(root).unwrap();
        let report = Executor::for_scanner(&scanner, RemovalMode::DryRun).execute(&plan);

        assert!(report.dry_run);
        assert_eq!(report.marked, 3);
        assert_eq!(report.removed, 0);
        assert_eq!(report.after.get(&CategoryLabel::CommonRust), Some(&1));
        assert_eq!(survivors(root, "Common_Rust").len(), 3);
        assert!(!History::at(root).path().exists());
    }

    #[test]
    fn test_quarantine_mirrors_layout_and_restores() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        seed_dataset(root);
        let target = root.join("duplicates");
        // Pre-existing file forces a suffixed name.
        write_image(&target.join("Common_Rust/a2.png"), &noise_image(8, 8, 9));

        let scanner = scanner();
        let plan = scanner.plan(root).unwrap();
        let report = Executor::for_scanner(&scanner, RemovalMode::Quarantine(target.clone())).execute(&plan);
        assert_eq!(report.removed, 3);
        assert!(target.join("Common_Rust/a2 (1).png").exists());
        assert!(target.join("Common_Rust/a3.png").exists());
        assert!(target.join("Blight/b2.png").exists());
        assert_eq!(survivors(root, "Common_Rust"), vec!["a1.png"]);

        let summary = History::at(root).restore(RestoreSelection::All).unwrap();
        assert_eq!(summary.restored, 3);
        assert_eq!(survivors(root, "Common_Rust"), vec!["a1.png", "a2.png", "a3.png"]);
        assert_eq!(survivors(root, "Blight").len(), 4);
    }

    #[test]
    fn test_failed_removal_is_counted_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        seed_dataset(root);

        let scanner = scanner();
        let plan = scanner.plan(root).unwrap();
        fs::remove_file(root.join("Common_Rust/a2.png")).unwrap();

        let report = Executor::for_scanner(&scanner, RemovalMode::Delete).execute(&plan);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.removed, 2);
        let failures: Vec<&FileFailure> = report.failures_in(FailurePhase::Remove).collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].path.ends_with("a2.png"));
        assert!(!root.join("Common_Rust/a3.png").exists());
    }

    #[test]
    fn test_cancelled_execution_stops_between_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        seed_dataset(root);

        let scanner = scanner();
        let plan = scanner.plan(root).unwrap();
        scanner.cancel_scan();

        let report = Executor::for_scanner(&scanner, RemovalMode::Delete).execute(&plan);
        assert!(report.cancelled);
        assert_eq!(report.attempted, 0);
        assert_eq!(survivors(root, "Common_Rust").len(), 3);
    }

    #[test]
    fn test_resolve_destination_falls_back_to_file_name() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("q");
        let dest = resolve_destination(Path::new("/data/set"), &target, Path::new("/elsewhere/leaf.jpg"));
        assert_eq!(dest, target.join("leaf.jpg"));
    }
}
