//! Normalized path keys and natural sort ordering.
//!
//! Exposure maps are keyed by a normalized, case-folded rendition of an
//! absolute path so the same file always lands on the same score regardless
//! of separator style or drive-letter casing. The newtype keeps raw paths
//! from leaking into those maps.

use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Normalized path key: `normcase(normpath(path))`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct PathKey(String);

impl PathKey {
    pub fn new(path: &Path) -> Self {
        let normalized = normalize_components(path);
        let mut rendered = normalized.to_string_lossy().replace('\\', "/");
        // Case-fold so exposure survives case-insensitive filesystems.
        rendered = rendered.to_lowercase();
        PathKey(rendered)
    }

    pub fn from_str_path(path: &str) -> Self {
        Self::new(Path::new(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collapses `.` and `..` components without touching the filesystem.
fn normalize_components(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Lowercased final path component.
pub fn basename_lower(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Lowercased final path component without its extension.
pub fn stem_lower(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// One chunk of a natural sort key: digit runs compare numerically, text
/// chunks compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaturalSortPart {
    Number(u64),
    Text(String),
}

/// Splits a string into natural sort parts, so "s1e2" < "s1e10".
pub fn natural_sort_key(s: &str) -> Vec<NaturalSortPart> {
    let mut parts = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            let mut value: u64 = 0;
            while let Some(&d) = chars.peek() {
                if let Some(digit) = d.to_digit(10) {
                    value = value.saturating_mul(10).saturating_add(u64::from(digit));
                    chars.next();
                } else {
                    break;
                }
            }
            parts.push(NaturalSortPart::Number(value));
        } else {
            let mut text = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    break;
                }
                text.push(d);
                chars.next();
            }
            parts.push(NaturalSortPart::Text(text.to_lowercase()));
        }
    }
    parts
}
