use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Dataset category derived from the directory a file lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CategoryLabel {
    Healthy,
    CommonRust,
    Blight,
    GrayLeafSpot,
    BlightRust,
    GraySpotRust,
    Unknown,
}

/// Ordered `(segment, label)` table. The first entry that equals any path
/// segment wins.
const SEGMENT_TABLE: &[(&str, CategoryLabel)] = &[
    ("Healthy", CategoryLabel::Healthy),
    ("Common_Rust", CategoryLabel::CommonRust),
    ("Blight", CategoryLabel::Blight),
    ("Gray_Leaf_Spot", CategoryLabel::GrayLeafSpot),
    ("Blight_Rust", CategoryLabel::BlightRust),
    ("Gray_Spot_Rust", CategoryLabel::GraySpotRust),
];

/// Directories a well-formed dataset root is expected to contain.
pub const EXPECTED_LAYOUT: &[&str] = &[
    "Healthy",
    "Common_Rust",
    "Blight",
    "Gray_Leaf_Spot",
    "Compound_Cases/Blight_Rust",
    "Compound_Cases/Gray_Spot_Rust",
];

impl CategoryLabel {
    pub const ALL: [CategoryLabel; 7] = [
        CategoryLabel::Healthy,
        CategoryLabel::CommonRust,
        CategoryLabel::Blight,
        CategoryLabel::GrayLeafSpot,
        CategoryLabel::BlightRust,
        CategoryLabel::GraySpotRust,
        CategoryLabel::Unknown,
    ];

    /// Directory name used on disk for this label.
    pub fn dir_name(&self) -> &'static str {
        SEGMENT_TABLE
            .iter()
            .find(|(_, label)| label == self)
            .map(|(segment, _)| *segment)
            .unwrap_or("Unknown")
    }

    /// Classify a path by scanning its segments against the label table.
    ///
    /// Both `/` and `\` act as separators regardless of platform, so paths
    /// recorded on one OS classify the same on another.
    pub fn classify(path: &Path) -> CategoryLabel {
        let normalized = path.to_string_lossy().replace('\\', "/");
        let segments: Vec<&str> = normalized.split('/').collect();

        SEGMENT_TABLE
            .iter()
            .find(|(pattern, _)| segments.contains(pattern))
            .map(|(_, label)| *label)
            .unwrap_or(CategoryLabel::Unknown)
    }
}

impl fmt::Display for CategoryLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Which of the expected category directories exist under a root.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LayoutCheck {
    pub present: Vec<String>,
    pub missing: Vec<String>,
}

impl LayoutCheck {
    pub fn inspect(root: &Path) -> Self {
        let mut check = LayoutCheck::default();
        for expected in EXPECTED_LAYOUT {
            let dir: PathBuf = expected.split('/').fold(root.to_path_buf(), |p, s| p.join(s));
            if dir.is_dir() {
                check.present.push(expected.to_string());
            } else {
                check.missing.push(expected.to_string());
            }
        }
        check
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}
