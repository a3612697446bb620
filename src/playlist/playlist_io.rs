//! Playlist JSON persistence.
//!
//! Playlists are plain JSON files in the per-user playlists folder. Bump
//! items are transient and never serialized; the exposure score store lives
//! in the same folder but is not a playlist.

use std::path::{Path, PathBuf};

use log::warn;

use crate::exposure::ExposureStore;
use crate::playlist::frequency::FrequencySettingsData;
use crate::playlist::scheduler::{PlaylistItem, PlaylistScheduler, ShuffleMode};

const EXPOSURE_STORE_FILENAME: &str = "exposure_scores.json";

/// One persisted playlist entry. Legacy playlists stored bare path strings;
/// those are treated as episodes.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum PlaylistItemData {
    Entry {
        #[serde(rename = "type", default = "default_item_type")]
        kind: String,
        path: String,
    },
    Path(String),
}

fn default_item_type() -> String {
    "video".to_string()
}

impl PlaylistItemData {
    pub fn kind(&self) -> &str {
        match self {
            PlaylistItemData::Entry { kind, .. } => kind,
            PlaylistItemData::Path(_) => "video",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            PlaylistItemData::Entry { path, .. } => path,
            PlaylistItemData::Path(path) => path,
        }
    }
}

/// On-disk playlist model.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct PlaylistFile {
    #[serde(default)]
    pub playlist: Vec<PlaylistItemData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffle_mode: Option<String>,
    /// Legacy field: `true` meant standard shuffle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffle_default: Option<bool>,
    #[serde(default)]
    pub auto_generated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_folder: Option<String>,
    /// Legacy playlists stored this under a top-level `exposure_overrides`.
    #[serde(
        default,
        alias = "exposure_overrides",
        skip_serializing_if = "Option::is_none"
    )]
    pub frequency_settings: Option<FrequencySettingsData>,
}

impl PlaylistFile {
    /// Effective shuffle mode, resolving the legacy bool form.
    pub fn effective_shuffle_mode(&self) -> ShuffleMode {
        if let Some(mode) = &self.shuffle_mode {
            return ShuffleMode::from_name(mode);
        }
        match self.shuffle_default {
            Some(true) => ShuffleMode::Standard,
            _ => ShuffleMode::Off,
        }
    }
}

/// Snapshot of the scheduler's playlist for saving. Bump items are
/// transient and excluded; frequency settings travel with the playlist.
pub fn playlist_file_from_scheduler(scheduler: &PlaylistScheduler) -> PlaylistFile {
    let playlist = scheduler
        .items()
        .iter()
        .filter_map(|item| match item {
            PlaylistItem::Video(path) => Some(PlaylistItemData::Entry {
                kind: "video".to_string(),
                path: path.to_string_lossy().into_owned(),
            }),
            PlaylistItem::Interstitial(path) => Some(PlaylistItemData::Entry {
                kind: "interstitial".to_string(),
                path: path.to_string_lossy().into_owned(),
            }),
            PlaylistItem::Bump(_) => None,
        })
        .collect();
    let frequency_settings = if scheduler.frequency().is_empty() {
        None
    } else {
        Some(scheduler.frequency().to_data())
    };
    PlaylistFile {
        playlist,
        shuffle_mode: Some(scheduler.shuffle_mode().name().to_string()),
        shuffle_default: None,
        auto_generated: false,
        source_folder: None,
        frequency_settings,
    }
}

/// Installs a loaded playlist file into the scheduler: items, shuffle mode
/// (legacy bool accepted), and per-playlist frequency settings.
pub fn apply_playlist_file(
    playlist: &PlaylistFile,
    scheduler: &mut PlaylistScheduler,
    exposure: &mut ExposureStore,
) {
    let items: Vec<PlaylistItem> = playlist
        .playlist
        .iter()
        .map(|data| {
            let path = PathBuf::from(data.path());
            if data.kind() == "interstitial" {
                PlaylistItem::Interstitial(path)
            } else {
                PlaylistItem::Video(path)
            }
        })
        .collect();
    scheduler.set_playlist(items, exposure);
    if let Some(data) = &playlist.frequency_settings {
        scheduler.frequency_mut().apply(data);
    } else {
        scheduler.frequency_mut().clear();
    }
    scheduler.set_shuffle_mode(playlist.effective_shuffle_mode(), exposure);
}

/// True for `scheme://...` values; URL playlist sources are not supported.
pub fn is_url(value: &str) -> bool {
    let Some(colon) = value.find("://") else {
        return false;
    };
    let scheme = &value[..colon];
    let mut chars = scheme.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '.' || c == '-')
}

/// Loads a playlist file, rejecting URL sources.
pub fn load_playlist(path: &Path) -> std::io::Result<PlaylistFile> {
    let rendered = path.to_string_lossy();
    if is_url(&rendered) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Loading playlists from URLs is not supported. Use local playlist files.",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|err| {
        warn!("Playlist: malformed {}: {}", path.display(), err);
        std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())
    })
}

/// Writes a playlist file (pretty JSON).
pub fn save_playlist(path: &Path, playlist: &PlaylistFile) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(playlist)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;
    std::fs::write(path, body)
}

/// The per-user playlists folder (also holds the exposure store).
pub fn default_playlists_dir() -> PathBuf {
    let base = dirs::config_dir()
        .map(|dir| dir.join("lullatv"))
        .unwrap_or_else(|| PathBuf::from("."));
    let folder = base.join("playlists");
    if let Err(err) = std::fs::create_dir_all(&folder) {
        warn!(
            "Playlist: cannot create playlists dir {}: {}",
            folder.display(),
            err
        );
    }
    folder
}

/// Playlist filenames in `folder`, excluding internal state files.
pub fn list_saved_playlists(folder: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(folder) else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let lower = name.to_lowercase();
        if !lower.ends_with(".json") || lower == EXPOSURE_STORE_FILENAME {
            continue;
        }
        out.push(name);
    }
    out.sort_unstable();
    out
}
