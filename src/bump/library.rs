//! Bump asset scanning and case-insensitive asset resolution.
//!
//! Scripts, music, and outro sounds come from user-selected folders that may
//! live on slow removable drives, so every scan accepts bounds (file count,
//! depth, time budget) and never stalls startup. Durations are read from the
//! audio stream when possible and fall back to a filename convention.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::SyncSender;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lofty::file::AudioFile;
use log::{debug, info, warn};

use crate::bump::script::{parse_script_text, Script};
use crate::config::Config;

/// Extensions recognized as bump music / sound FX files.
pub const AUDIO_EXTENSIONS: [&str; 9] = [
    "mp3", "flac", "wav", "ogg", "m4a", "aac", "opus", "webm", "mp4",
];

/// Extensions recognized as bump video assets.
pub const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "webm", "mkv", "mov", "avi", "m4v"];

/// Extensions (plus extensionless files) treated as bump scripts.
const SCRIPT_EXTENSIONS: [&str; 2] = ["txt", "text"];

/// One scanned music track. Duration is authoritative from the audio stream
/// when known; otherwise parsed from the basename.
#[derive(Clone, Debug, PartialEq)]
pub struct MusicEntry {
    pub path: PathBuf,
    pub duration_ms: Option<u64>,
    pub duration_s: Option<f64>,
}

impl MusicEntry {
    /// Best-known duration in milliseconds.
    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
            .or_else(|| self.duration_s.map(|s| (s * 1000.0).round() as u64))
    }
}

/// Bounds for a folder scan.
#[derive(Clone, Copy, Debug)]
pub struct ScanOptions {
    pub recursive: bool,
    pub max_files: Option<usize>,
    pub max_depth: Option<usize>,
    pub time_budget: Option<Duration>,
    pub probe_durations: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            max_files: None,
            max_depth: None,
            time_budget: None,
            probe_durations: true,
        }
    }
}

/// Resolves filenames referenced by scripts against configured base folders,
/// case-insensitively, then against the script's own directory.
#[derive(Debug, Default)]
pub struct AssetResolver {
    images_dir: Option<PathBuf>,
    audio_fx_dir: Option<PathBuf>,
    videos_dir: Option<PathBuf>,
    // Lazy lowercase-basename indexes; rebuilt when the folder changes.
    images_index: RefCell<Option<(PathBuf, HashMap<String, PathBuf>)>>,
    fx_index: RefCell<Option<(PathBuf, HashMap<String, PathBuf>)>>,
}

impl AssetResolver {
    pub fn new(
        images_dir: Option<PathBuf>,
        audio_fx_dir: Option<PathBuf>,
        videos_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            images_dir,
            audio_fx_dir,
            videos_dir,
            images_index: RefCell::new(None),
            fx_index: RefCell::new(None),
        }
    }

    pub fn resolve_image(&self, filename: &str, base_dir: Option<&Path>) -> PathBuf {
        let name = clean_name(filename);
        if name.is_empty() {
            return PathBuf::new();
        }
        let candidates = vec![name.clone()];
        self.resolve_with(
            &candidates,
            self.images_dir.as_deref(),
            Some(&self.images_index),
            base_dir,
        )
        .unwrap_or_else(|| PathBuf::from(name))
    }

    pub fn resolve_sound(&self, filename: &str, base_dir: Option<&Path>) -> PathBuf {
        let name = clean_name(filename);
        if name.is_empty() {
            return PathBuf::new();
        }
        let candidates = extension_candidates(&name, &AUDIO_EXTENSIONS);
        self.resolve_with(
            &candidates,
            self.audio_fx_dir.as_deref(),
            Some(&self.fx_index),
            base_dir,
        )
        .unwrap_or_else(|| PathBuf::from(name))
    }

    pub fn resolve_video(&self, filename: &str, base_dir: Option<&Path>) -> PathBuf {
        let name = clean_name(filename);
        if name.is_empty() {
            return PathBuf::new();
        }
        let candidates = extension_candidates(&name, &VIDEO_EXTENSIONS);
        self.resolve_with(&candidates, self.videos_dir.as_deref(), None, base_dir)
            .unwrap_or_else(|| PathBuf::from(name))
    }

    fn resolve_with(
        &self,
        candidates: &[String],
        primary_dir: Option<&Path>,
        index: Option<&RefCell<Option<(PathBuf, HashMap<String, PathBuf>)>>>,
        base_dir: Option<&Path>,
    ) -> Option<PathBuf> {
        if let Some(dir) = primary_dir {
            for candidate in candidates {
                let joined = dir.join(candidate);
                if joined.exists() {
                    return Some(joined);
                }
            }
            if let Some(index_cell) = index {
                if let Some(hit) = lookup_index(index_cell, dir, candidates) {
                    return Some(hit);
                }
            }
            // Refresh-safe fallback: the cached index may be stale.
            for candidate in candidates {
                if let Some(hit) = find_case_insensitive(dir, candidate) {
                    return Some(hit);
                }
            }
        }

        if let Some(dir) = base_dir {
            for candidate in candidates {
                let joined = dir.join(candidate);
                if joined.exists() {
                    return Some(joined);
                }
            }
            for candidate in candidates {
                if let Some(hit) = find_case_insensitive(dir, candidate) {
                    return Some(hit);
                }
            }
        }
        None
    }
}

fn clean_name(filename: &str) -> String {
    filename.trim().trim_matches(|c| c == '"' || c == '\'').to_string()
}

/// Extensionless names try every known extension.
fn extension_candidates(name: &str, extensions: &[&str]) -> Vec<String> {
    let has_extension = Path::new(name)
        .extension()
        .is_some_and(|ext| !ext.is_empty());
    if has_extension {
        vec![name.to_string()]
    } else {
        extensions.iter().map(|ext| format!("{name}.{ext}")).collect()
    }
}

fn lookup_index(
    cell: &RefCell<Option<(PathBuf, HashMap<String, PathBuf>)>>,
    dir: &Path,
    candidates: &[String],
) -> Option<PathBuf> {
    let mut slot = cell.borrow_mut();
    let rebuild = match slot.as_ref() {
        Some((indexed_dir, _)) => indexed_dir != dir,
        None => true,
    };
    if rebuild {
        *slot = Some((dir.to_path_buf(), build_file_index(dir)));
    }
    let (_, index) = slot.as_ref()?;
    for candidate in candidates {
        let Some(basename) = Path::new(candidate)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
        else {
            continue;
        };
        if let Some(hit) = index.get(&basename) {
            if hit.exists() {
                return Some(hit.clone());
            }
        }
    }
    None
}

/// `{lower_basename: full_path}` for files under `folder`, recursive.
fn build_file_index(folder: &Path) -> HashMap<String, PathBuf> {
    let mut out = HashMap::new();
    let mut pending = vec![folder.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Some(name) = path.file_name() {
                out.insert(name.to_string_lossy().to_lowercase(), path.clone());
            }
        }
    }
    out
}

/// Case-insensitive basename match under `folder`, recursive.
fn find_case_insensitive(folder: &Path, filename: &str) -> Option<PathBuf> {
    let wanted = Path::new(filename).file_name()?.to_string_lossy().to_lowercase();
    let mut pending = vec![folder.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().to_lowercase() == wanted)
            {
                return Some(path);
            }
        }
    }
    None
}

/// Exact duration from the audio stream, or `None`.
pub fn duration_from_audio_file_ms(path: &Path) -> Option<u64> {
    let tagged = match lofty::read_from_path(path) {
        Ok(tagged) => tagged,
        Err(err) => {
            debug!("Duration probe failed for {}: {}", path.display(), err);
            return None;
        }
    };
    let ms = tagged.properties().duration().as_millis() as u64;
    if ms == 0 {
        None
    } else {
        Some(ms)
    }
}

/// Duration (seconds) parsed from the filename's last whitespace-delimited
/// token: "Cool Track 29.mp3" -> 29, "Cool Track 29.5s.mp3" -> 29.5.
pub fn duration_from_music_filename(path: &Path) -> Option<f64> {
    let stem = path.file_stem()?.to_string_lossy();
    let last = stem.split(' ').filter(|t| !t.is_empty()).next_back()?;
    let digits_start = last.find(|c: char| c.is_ascii_digit())?;
    let numeric: String = last[digits_start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f64 = numeric.parse().ok()?;
    if value > 0.0 {
        Some(value)
    } else {
        None
    }
}

/// Scanned bump inventory: scripts, music, and outro sounds.
#[derive(Debug, Default)]
pub struct BumpLibrary {
    pub scripts: Vec<Script>,
    pub music_files: Vec<MusicEntry>,
    pub outro_sounds: Vec<PathBuf>,
}

impl BumpLibrary {
    /// Loads bump scripts from a folder (recursive, bounded).
    pub fn load_bump_scripts(
        folder: &Path,
        options: &ScanOptions,
        resolver: &AssetResolver,
        config: &Config,
    ) -> Vec<Script> {
        let mut scripts = Vec::new();
        if !folder.is_dir() {
            return scripts;
        }
        let mut parsed_files = 0usize;
        let files = walk_files(folder, options);
        for path in files {
            let is_script = match path.extension() {
                None => true,
                Some(ext) => {
                    let ext = ext.to_string_lossy().to_lowercase();
                    SCRIPT_EXTENSIONS.contains(&ext.as_str())
                }
            };
            if !is_script {
                continue;
            }
            let Some(content) = read_script_file(&path) else {
                continue;
            };
            scripts.extend(parse_script_text(&content, Some(&path), resolver, config));
            parsed_files += 1;
            if options.max_files.is_some_and(|max| parsed_files >= max) {
                break;
            }
        }
        info!(
            "BumpLibrary: loaded {} scripts from {}",
            scripts.len(),
            folder.display()
        );
        scripts
    }

    /// Scans a folder for bump music files.
    pub fn scan_music(folder: &Path, options: &ScanOptions) -> Vec<MusicEntry> {
        let mut music = Vec::new();
        if !folder.is_dir() {
            return music;
        }
        let started = Instant::now();
        for path in walk_files(folder, options) {
            if options
                .time_budget
                .is_some_and(|budget| started.elapsed() >= budget)
            {
                warn!(
                    "BumpLibrary: music scan hit its time budget after {} files",
                    music.len()
                );
                break;
            }
            if !has_extension_in(&path, &AUDIO_EXTENSIONS) {
                continue;
            }
            let duration_ms = if options.probe_durations {
                duration_from_audio_file_ms(&path)
            } else {
                None
            };
            let duration_s = match duration_ms {
                Some(ms) => Some(ms as f64 / 1000.0),
                None => duration_from_music_filename(&path),
            };
            music.push(MusicEntry {
                path,
                duration_ms,
                duration_s,
            });
            if options.max_files.is_some_and(|max| music.len() >= max) {
                break;
            }
        }
        info!(
            "BumpLibrary: scanned {} music files from {}",
            music.len(),
            folder.display()
        );
        music
    }

    /// Flat listing of outro sound files.
    pub fn scan_outro_sounds(folder: &Path) -> Vec<PathBuf> {
        let mut sounds = Vec::new();
        let Ok(entries) = std::fs::read_dir(folder) else {
            return sounds;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && has_extension_in(&path, &AUDIO_EXTENSIONS) {
                sounds.push(path);
            }
        }
        sounds.sort_unstable();
        sounds
    }
}

fn has_extension_in(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// Files under `folder` in sorted order, honoring depth/recursion bounds.
fn walk_files(folder: &Path, options: &ScanOptions) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![(folder.to_path_buf(), 0usize)];
    while let Some((dir, depth)) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let descend = options.recursive
                    && options.max_depth.is_none_or(|max| depth + 1 <= max);
                if descend {
                    pending.push((path, depth + 1));
                }
            } else {
                files.push(path);
            }
        }
    }
    files.sort_unstable();
    files
}

/// Script files may be authored in various encodings. Prefer UTF-8 (with BOM
/// support) and fall back to latin-1.
fn read_script_file(path: &Path) -> Option<String> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("BumpLibrary: cannot read {}: {}", path.display(), err);
            return None;
        }
    };
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => err.into_bytes().iter().map(|&b| b as char).collect(),
    };
    Some(text.strip_prefix('\u{feff}').unwrap_or(&text).to_string())
}

/// Result of a background asset scan, posted back to the coordinator.
#[derive(Debug)]
pub enum ScanOutcome {
    Scripts(Vec<Script>),
    Music(Vec<MusicEntry>),
    OutroSounds(Vec<PathBuf>),
}

/// What a scan worker should enumerate.
#[derive(Clone, Debug)]
pub enum ScanRequest {
    Scripts {
        folder: PathBuf,
        options: ScanOptions,
        resolver_dirs: (Option<PathBuf>, Option<PathBuf>, Option<PathBuf>),
        config: Box<Config>,
    },
    Music {
        folder: PathBuf,
        options: ScanOptions,
    },
    OutroSounds {
        folder: PathBuf,
    },
}

/// Runs a scan on a worker thread and posts the outcome over `results_tx`.
/// The worker owns its inputs and never touches coordinator state; a full
/// channel drops the result rather than blocking shutdown.
pub fn spawn_scan_worker(
    request: ScanRequest,
    results_tx: SyncSender<ScanOutcome>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let outcome = match request {
            ScanRequest::Scripts {
                folder,
                options,
                resolver_dirs,
                config,
            } => {
                let (images, fx, videos) = resolver_dirs;
                let resolver = AssetResolver::new(images, fx, videos);
                ScanOutcome::Scripts(BumpLibrary::load_bump_scripts(
                    &folder, &options, &resolver, &config,
                ))
            }
            ScanRequest::Music { folder, options } => {
                ScanOutcome::Music(BumpLibrary::scan_music(&folder, &options))
            }
            ScanRequest::OutroSounds { folder } => {
                ScanOutcome::OutroSounds(BumpLibrary::scan_outro_sounds(&folder))
            }
        };
        if results_tx.try_send(outcome).is_err() {
            debug!("Scan worker result dropped: coordinator channel unavailable");
        }
    })
}
