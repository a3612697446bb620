//! Additive exposure scores for episodes and bump components.
//!
//! Selection everywhere favors the minimum score, so a growing score means
//! "rest this asset for a while". Scores persist in a single JSON file next
//! to the playlists so behavior is stable across runs. Saves are throttled;
//! rapid bump cards would otherwise spam the disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::bump::composer::CompleteBump;
use crate::bump::library::MusicEntry;
use crate::bump::script::Script;
use crate::bump::timing;
use crate::config::FitterConfig;
use crate::paths::{stem_lower, PathKey};

const SAVE_THROTTLE: Duration = Duration::from_millis(1500);

/// Music tracks that ship with install-time exposure so brand-new libraries
/// don't hammer the same handful of files.
const SEED_MUSIC_BASENAMES: [&str; 8] = [
    "vibe1", "vibe2", "vibe3", "vibe4", "chill1", "chill2", "chill3", "chill4",
];

/// Which session counter a play advances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayKind {
    Episode,
    Bump,
}

/// Persistent exposure score store.
pub struct ExposureStore {
    episodes: HashMap<PathKey, f64>,
    scripts: HashMap<String, f64>,
    music: HashMap<PathKey, f64>,
    videos: HashMap<PathKey, f64>,
    outros: HashMap<PathKey, f64>,

    store_path: Option<PathBuf>,
    dirty: bool,
    last_save: Option<Instant>,

    session_episode_plays: u32,
    session_bump_plays: u32,
    sleep_timer_active: bool,

    music_seeded_last_changed: bool,
    script_seeded_last_changed: bool,
}

impl ExposureStore {
    /// Creates a store backed by `exposure_scores.json` under `dir`, loading
    /// any persisted state.
    pub fn open(dir: &Path) -> Self {
        let mut store = Self::in_memory();
        store.store_path = Some(dir.join("exposure_scores.json"));
        store.load();
        store
    }

    /// Creates an unbacked store (nothing persists).
    pub fn in_memory() -> Self {
        Self {
            episodes: HashMap::new(),
            scripts: HashMap::new(),
            music: HashMap::new(),
            videos: HashMap::new(),
            outros: HashMap::new(),
            store_path: None,
            dirty: false,
            last_save: None,
            session_episode_plays: 0,
            session_bump_plays: 0,
            sleep_timer_active: false,
            music_seeded_last_changed: false,
            script_seeded_last_changed: false,
        }
    }

    // --- Score reads --------------------------------------------------------

    pub fn episode_score(&self, key: &PathKey) -> f64 {
        self.episodes.get(key).copied().unwrap_or(0.0)
    }

    pub fn script_score(&self, script_key: &str) -> f64 {
        self.scripts.get(script_key).copied().unwrap_or(0.0)
    }

    pub fn music_score(&self, key: &PathKey) -> f64 {
        self.music.get(key).copied().unwrap_or(0.0)
    }

    pub fn video_score(&self, key: &PathKey) -> f64 {
        self.videos.get(key).copied().unwrap_or(0.0)
    }

    pub fn outro_score(&self, key: &PathKey) -> f64 {
        self.outros.get(key).copied().unwrap_or(0.0)
    }

    pub fn music_scores(&self) -> &HashMap<PathKey, f64> {
        &self.music
    }

    // --- Session counters and deltas ----------------------------------------

    /// Updates whether episode deltas diminish this session. Toggling restarts
    /// the tiering so "first 3 plays" applies only while the mode is active.
    pub fn set_sleep_timer_active(&mut self, active: bool) {
        if self.sleep_timer_active != active {
            self.session_episode_plays = 0;
        }
        self.sleep_timer_active = active;
    }

    pub fn sleep_timer_active(&self) -> bool {
        self.sleep_timer_active
    }

    /// New viewing session: restart the tiering counters.
    pub fn reset_session(&mut self) {
        self.session_episode_plays = 0;
        self.session_bump_plays = 0;
    }

    /// The score increment the next play of `kind` would receive. The first
    /// 3 plays give +100, the next 3 give +50, then +25, never below 1.
    pub fn next_play_delta(&self, kind: PlayKind) -> f64 {
        let n = match kind {
            PlayKind::Bump => self.session_bump_plays,
            PlayKind::Episode => {
                // Sleep timer off: episode deltas stay constant all session.
                if !self.sleep_timer_active {
                    return 100.0;
                }
                self.session_episode_plays
            }
        };
        let tier = n / 3;
        (100.0 / 2.0_f64.powi(tier as i32)).max(1.0)
    }

    /// Applies a play of an episode: returns the factor-scaled delta that was
    /// recorded against `key` and advances the session counter when tiering
    /// is active.
    pub fn register_episode_play(&mut self, key: &PathKey, factor: f64) -> f64 {
        let delta = self.next_play_delta(PlayKind::Episode) * factor;
        if self.sleep_timer_active {
            self.session_episode_plays += 1;
        }
        if !key.is_empty() {
            *self.episodes.entry(key.clone()).or_insert(0.0) += delta;
            self.dirty = true;
            self.save(false);
        }
        delta
    }

    /// Applies a play of a complete bump to its components.
    pub fn register_bump_play(&mut self, bump: &CompleteBump) -> f64 {
        let delta = self.next_play_delta(PlayKind::Bump);
        self.session_bump_plays += 1;
        self.apply_bump_exposure(bump, delta);
        delta
    }

    /// Adds `delta` to every component the bump used.
    pub fn apply_bump_exposure(&mut self, bump: &CompleteBump, delta: f64) {
        if !bump.script.script_key.is_empty() {
            *self
                .scripts
                .entry(bump.script.script_key.clone())
                .or_insert(0.0) += delta;
        }
        if let Some(audio) = &bump.audio {
            *self.music.entry(PathKey::new(audio)).or_insert(0.0) += delta;
        }
        if let Some(video) = &bump.video {
            *self.videos.entry(PathKey::new(video)).or_insert(0.0) += delta;
        }
        if let Some(outro) = &bump.outro_audio_path {
            *self.outros.entry(PathKey::new(outro)).or_insert(0.0) += delta;
        }
        self.dirty = true;
        self.save(false);
    }

    /// Deducts a skipped/cut-off episode's points (pre-scaled by the caller's
    /// effective factor). Idempotence per play-start is the caller's guard.
    pub fn apply_episode_skip_penalty(&mut self, key: &PathKey, points: f64, factor: f64) -> f64 {
        let points = points.abs();
        if key.is_empty() || points <= 0.0 {
            return 0.0;
        }
        let delta = -points * factor;
        *self.episodes.entry(key.clone()).or_insert(0.0) += delta;
        self.dirty = true;
        self.save(false);
        delta
    }

    pub fn clear_episode_scores_for_keys(&mut self, keys: &[PathKey]) -> usize {
        let mut removed = 0;
        for key in keys {
            if self.episodes.remove(key).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            self.dirty = true;
            self.save(true);
        }
        removed
    }

    pub fn clear_episode_scores(&mut self) {
        self.episodes.clear();
        self.dirty = true;
        self.save(true);
    }

    // --- Seeding ------------------------------------------------------------

    /// Seeds install-time scores for selected music basenames. Idempotent:
    /// never overwrites an existing score.
    pub fn seed_music_scores(&mut self, music_files: &[MusicEntry]) -> bool {
        let mut changed = false;
        for entry in music_files {
            let stem = stem_lower(&entry.path);
            if stem.is_empty() || !SEED_MUSIC_BASENAMES.contains(&stem.as_str()) {
                continue;
            }
            let key = PathKey::new(&entry.path);
            if key.is_empty() || self.music.contains_key(&key) {
                continue;
            }
            self.music.insert(key, 1.0);
            changed = true;
        }
        self.music_seeded_last_changed = changed;
        if changed {
            self.dirty = true;
        }
        changed
    }

    /// Seeds scores for scripts that cannot be compressed into a short clip,
    /// so fresh long scripts don't dominate early queues. Idempotent.
    pub fn seed_script_scores(&mut self, scripts: &[Script], config: &FitterConfig) -> bool {
        let target_ms = config.short_bump_target_ms();
        let eps = config.short_bump_overage_tolerance;
        let mut changed = false;
        for script in scripts {
            if timing::can_fit_short_clip(&script.timing, target_ms, eps, config) {
                // Short-clip candidate; do not seed.
                continue;
            }
            let key = &script.script_key;
            if key.is_empty() || self.scripts.contains_key(key) {
                continue;
            }
            self.scripts.insert(key.clone(), 1.0);
            changed = true;
        }
        self.script_seeded_last_changed = changed;
        if changed {
            self.dirty = true;
        }
        changed
    }

    /// True when the last seeding pass added anything; callers use this to
    /// force an immediate save.
    pub fn seeded_last_changed(&self) -> bool {
        self.music_seeded_last_changed || self.script_seeded_last_changed
    }

    // --- Persistence --------------------------------------------------------

    fn load(&mut self) {
        let Some(path) = self.store_path.clone() else {
            return;
        };
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return,
        };
        let value: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "ExposureStore: ignoring malformed {}: {}",
                    path.display(),
                    err
                );
                return;
            }
        };

        self.episodes = clean_path_map(value.get("episodes"));
        if let Some(bump) = value.get("bump_components") {
            self.scripts = clean_string_map(bump.get("scripts"));
            self.music = clean_path_map(bump.get("music"));
            self.videos = clean_path_map(bump.get("videos"));
            self.outros = clean_path_map(bump.get("outro"));
        }
        debug!(
            "ExposureStore: loaded {} episode and {} bump component scores",
            self.episodes.len(),
            self.scripts.len() + self.music.len() + self.videos.len() + self.outros.len()
        );
    }

    /// Persists to disk when dirty. Writes are throttled unless `force`; the
    /// write is atomic (`tmp` + rename).
    pub fn save(&mut self, force: bool) {
        if !self.dirty && !force {
            return;
        }
        if !force {
            if let Some(last) = self.last_save {
                if last.elapsed() < SAVE_THROTTLE {
                    return;
                }
            }
        }
        let Some(path) = self.store_path.clone() else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let payload = serde_json::json!({
            "episodes": render_path_map(&self.episodes),
            "bump_components": {
                "scripts": &self.scripts,
                "music": render_path_map(&self.music),
                "videos": render_path_map(&self.videos),
                "outro": render_path_map(&self.outros),
            },
        });

        let tmp = path.with_extension("json.tmp");
        let write_result = serde_json::to_string_pretty(&payload)
            .map_err(std::io::Error::other)
            .and_then(|body| std::fs::write(&tmp, body))
            .and_then(|()| std::fs::rename(&tmp, &path));
        match write_result {
            Ok(()) => {
                self.last_save = Some(Instant::now());
                self.dirty = false;
            }
            Err(err) => {
                warn!("ExposureStore: save to {} failed: {}", path.display(), err);
                let _ = std::fs::remove_file(&tmp);
            }
        }
    }

    #[cfg(test)]
    fn set_music_score(&mut self, key: PathKey, score: f64) {
        self.music.insert(key, score);
    }
}

fn clean_path_map(value: Option<&serde_json::Value>) -> HashMap<PathKey, f64> {
    let mut out = HashMap::new();
    let Some(map) = value.and_then(serde_json::Value::as_object) else {
        return out;
    };
    for (k, v) in map {
        let Some(score) = v.as_f64() else {
            continue;
        };
        let key = PathKey::from_str_path(k);
        if !key.is_empty() {
            out.insert(key, score);
        }
    }
    out
}

fn clean_string_map(value: Option<&serde_json::Value>) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    let Some(map) = value.and_then(serde_json::Value::as_object) else {
        return out;
    };
    for (k, v) in map {
        let Some(score) = v.as_f64() else {
            continue;
        };
        if !k.is_empty() {
            out.insert(k.clone(), score);
        }
    }
    out
}

fn render_path_map(map: &HashMap<PathKey, f64>) -> HashMap<&str, f64> {
    map.iter().map(|(k, v)| (k.as_str(), *v)).collect()
}
