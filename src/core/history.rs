use crate::core::report::RemovalReason;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const HISTORY_FILE_NAME: &str = ".leafcull-history.jsonl";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No 'moved' history records to restore")]
    NothingToRestore,

    #[error("Invalid history index {index}; valid range is 0..{len}")]
    InvalidIndex { index: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CullAction {
    Moved,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CulledFile {
    pub original: String,
    /// Where the file went in quarantine; `None` once deleted.
    pub stored: Option<String>,
}

/// One line of the history file: a group (or a corner flag) that was culled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: String,
    pub reason: RemovalReason,
    pub retained: Option<String>,
    pub culled: Vec<CulledFile>,
    pub action: CullAction,
}

impl HistoryRecord {
    pub fn now(
        reason: RemovalReason,
        retained: Option<&Path>,
        culled: Vec<CulledFile>,
        action: CullAction,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            reason,
            retained: retained.map(|p| p.to_string_lossy().into_owned()),
            culled,
            action,
        }
    }
}

/// Which moved records to bring back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSelection {
    Latest,
    Index(usize),
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub records: usize,
    pub restored: usize,
    pub skipped: usize,
}

/// Append-only JSON-lines log kept at the dataset root.
pub struct History {
    path: PathBuf,
}

impl History {
    pub fn at(root: &Path) -> Self {
        Self {
            path: root.join(HISTORY_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub fn append(&self, records: &[HistoryRecord]) -> Result<(), HistoryError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        for record in records {
            writeln!(out, "{}", serde_json::to_string(record)?).map_err(|e| self.io_err(e))?;
        }
        Ok(())
    }

    fn raw_lines(&self) -> Result<Vec<String>, HistoryError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let f = File::open(&self.path).map_err(|e| self.io_err(e))?;
        BufReader::new(f)
            .lines()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.io_err(e))
    }

    /// All parseable records in file order. Malformed lines are skipped.
    pub fn load(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let mut records = Vec::new();
        for (i, line) in self.raw_lines()?.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(line) {
                Ok(rec) => records.push(rec),
                Err(err) => log::warn!("Skipping malformed history entry {}: {}", i, err),
            }
        }
        Ok(records)
    }

    /// Move quarantined files back and drop the restored records from the
    /// file. Indices count only `moved` records.
    pub fn restore(&self, selection: RestoreSelection) -> Result<RestoreSummary, HistoryError> {
        let lines = self.raw_lines()?;

        // (line number, record) for every restorable record
        let moved: Vec<(usize, HistoryRecord)> = lines
            .iter()
            .enumerate()
            .filter_map(|(n, line)| {
                serde_json::from_str::<HistoryRecord>(line)
                    .ok()
                    .filter(|rec| rec.action == CullAction::Moved)
                    .map(|rec| (n, rec))
            })
            .collect();

        if moved.is_empty() {
            return Err(HistoryError::NothingToRestore);
        }

        let chosen: Vec<usize> = match selection {
            RestoreSelection::All => (0..moved.len()).collect(),
            RestoreSelection::Latest => vec![moved.len() - 1],
            RestoreSelection::Index(index) => {
                if index >= moved.len() {
                    return Err(HistoryError::InvalidIndex {
                        index,
                        len: moved.len(),
                    });
                }
                vec![index]
            }
        };

        let mut summary = RestoreSummary::default();
        let mut restored_lines = Vec::new();
        for &i in &chosen {
            let (line_no, rec) = &moved[i];
            log::info!(
                "Restoring {} file(s) from record {}",
                rec.culled.len(),
                rec.timestamp
            );
            for file in &rec.culled {
                if restore_file(file) {
                    summary.restored += 1;
                } else {
                    summary.skipped += 1;
                }
            }
            restored_lines.push(*line_no);
            summary.records += 1;
        }

        let remaining: Vec<&str> = lines
            .iter()
            .enumerate()
            .filter(|(n, _)| !restored_lines.contains(n))
            .map(|(_, line)| line.as_str())
            .collect();
        let new_content = if remaining.is_empty() {
            String::new()
        } else {
            remaining.join("\n") + "\n"
        };
        fs::write(&self.path, new_content).map_err(|e| self.io_err(e))?;

        Ok(summary)
    }
}

fn restore_file(file: &CulledFile) -> bool {
    let Some(stored) = file.stored.as_deref() else {
        log::warn!("{} was deleted, not moved; cannot restore", file.original);
        return false;
    };
    let src = Path::new(stored);
    let dest = Path::new(&file.original);

    if !src.exists() {
        log::warn!("Quarantined file {} no longer exists; skipping", src.display());
        return false;
    }
    if dest.exists() {
        log::warn!("{} already exists; not overwriting", dest.display());
        return false;
    }
    if let Some(parent) = dest.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            log::warn!("Failed to recreate {}: {}", parent.display(), e);
            return false;
        }
    }
    match fs::rename(src, dest) {
        Ok(()) => {
            log::debug!("Restored {} -> {}", src.display(), dest.display());
            true
        }
        Err(e) => {
            log::warn!("Failed to restore {} -> {}: {}", src.display(), dest.display(), e);
            false
        }
    }
}
