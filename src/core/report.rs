use crate::core::category::CategoryLabel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub type CategoryCounts = BTreeMap<CategoryLabel, usize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RemovalReason {
    ExactDuplicate,
    NearDuplicate,
    CornerArtifact,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RemovalReason::ExactDuplicate => "exact duplicate",
            RemovalReason::NearDuplicate => "near duplicate",
            RemovalReason::CornerArtifact => "corner artifact",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePhase {
    Read,
    Decode,
    Remove,
}

/// A per-file problem that was recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub phase: FailurePhase,
    pub message: String,
}

impl FileFailure {
    pub fn new(path: impl Into<PathBuf>, phase: FailurePhase, message: impl ToString) -> Self {
        Self {
            path: path.into(),
            phase,
            message: message.to_string(),
        }
    }
}

/// Summary of one run, dry or committed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub root: PathBuf,
    pub dry_run: bool,
    pub cancelled: bool,
    pub total_scanned: usize,
    pub protected_categories: Vec<CategoryLabel>,
    pub before: CategoryCounts,
    /// Before minus marked in a dry run, before minus removed otherwise.
    pub after: CategoryCounts,
    pub exact_groups: usize,
    /// Marked exact duplicates per category.
    pub exact_duplicates: CategoryCounts,
    pub near_groups: usize,
    pub near_duplicates: CategoryCounts,
    pub corner_artifacts: CategoryCounts,
    /// Groups where protection picked the survivor.
    pub protected_survivors: usize,
    pub marked: usize,
    pub attempted: usize,
    pub removed: usize,
    /// Successful removals per reason and category.
    pub removed_by_reason: BTreeMap<RemovalReason, CategoryCounts>,
    pub failures: Vec<FileFailure>,
}

impl CleanupReport {
    pub fn removed_for(&self, reason: RemovalReason, label: CategoryLabel) -> usize {
        self.removed_by_reason
            .get(&reason)
            .and_then(|counts| counts.get(&label))
            .copied()
            .unwrap_or(0)
    }

    pub fn failures_in(&self, phase: FailurePhase) -> impl Iterator<Item = &FileFailure> {
        self.failures.iter().filter(move |f| f.phase == phase)
    }
}

pub fn total(counts: &CategoryCounts) -> usize {
    counts.values().sum()
}

pub fn bump(counts: &mut CategoryCounts, label: CategoryLabel) {
    *counts.entry(label).or_default() += 1;
}
