//! Complete-bump queue composition.
//!
//! A complete bump pairs a materialized script with chosen music or video
//! and an optional outro sound. Complete bumps are transient; persistent
//! scores live on the components. The composer builds a FIFO of them,
//! favoring the least-exposed components, gating long scripts out of the
//! early queue, and spacing music basenames across rebuild boundaries.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use log::{debug, info};
use rand::{rngs::StdRng, RngExt, SeedableRng};

use crate::bump::library::BumpLibrary;
use crate::bump::script::Script;
use crate::bump::timing;
use crate::config::{ComposerConfig, Config, FitterConfig};
use crate::exposure::ExposureStore;
use crate::paths::{basename_lower, PathKey};

/// Slack over the short-bump target when classing a track as "short".
const SHORT_TRACK_SLACK_MS: u64 = 750;

/// A fully assembled bump, ready for playback. Never persisted.
#[derive(Clone, Debug)]
pub struct CompleteBump {
    /// Materialized script: every card duration is concrete.
    pub script: Script,
    pub audio: Option<PathBuf>,
    pub video: Option<PathBuf>,
    pub video_inclusive: bool,
    pub outro_audio_path: Option<PathBuf>,
}

/// Diagnostics from the most recent queue rebuild.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueRebuildStats {
    pub queue_target: usize,
    pub scripts_total: usize,
    pub scripts_audio: usize,
    pub scripts_video: usize,
    pub music_total: usize,
    pub skipped_audio_no_music_fit: usize,
    pub queue_built: usize,
}

/// Builds and serves the FIFO of complete bumps.
pub struct BumpComposer {
    queue: VecDeque<CompleteBump>,
    fitter: FitterConfig,
    composer: ComposerConfig,
    rng: StdRng,

    // Recent-usage tails (spacing across rebuilds), capped at recent_spread_n.
    recent_script_keys: VecDeque<String>,
    recent_music_basenames: VecDeque<String>,
    recent_video_basenames: VecDeque<String>,
    recent_outro_basenames: VecDeque<String>,

    last_stats: Option<QueueRebuildStats>,
}

impl BumpComposer {
    pub fn new(config: &Config) -> Self {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).expect("Failed to generate random seed");
        Self::with_seed(config, seed)
    }

    /// Deterministic construction for tests.
    pub fn with_seed(config: &Config, seed: [u8; 32]) -> Self {
        Self {
            queue: VecDeque::new(),
            fitter: config.fitter.clone(),
            composer: config.composer.clone(),
            rng: StdRng::from_seed(seed),
            recent_script_keys: VecDeque::new(),
            recent_music_basenames: VecDeque::new(),
            recent_video_basenames: VecDeque::new(),
            recent_outro_basenames: VecDeque::new(),
            last_stats: None,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn last_stats(&self) -> Option<&QueueRebuildStats> {
        self.last_stats.as_ref()
    }

    /// Drops the staged queue so the next pop rebuilds against fresh inventory.
    pub fn invalidate_queue(&mut self) {
        self.queue.clear();
    }

    /// Pops the next complete bump, rebuilding the queue on demand. Records
    /// recent component usage for spacing across rebuilds.
    pub fn pop_bump(
        &mut self,
        library: &BumpLibrary,
        exposure: &ExposureStore,
    ) -> Option<CompleteBump> {
        if self.queue.is_empty() {
            self.rebuild_queue(library, exposure);
        }
        let item = self.queue.pop_front()?;

        self.note_recent(&item);
        Some(item)
    }

    /// Peeks at the upcoming bump without consuming it (prefetch staging).
    pub fn peek_next(&self) -> Option<&CompleteBump> {
        self.queue.front()
    }

    fn note_recent(&mut self, item: &CompleteBump) {
        let cap = self.composer.recent_spread_n;
        push_capped(&mut self.recent_script_keys, item.script.script_key.clone(), cap);
        if let Some(audio) = &item.audio {
            push_capped(&mut self.recent_music_basenames, basename_lower(audio), cap);
        }
        if let Some(video) = &item.video {
            push_capped(&mut self.recent_video_basenames, basename_lower(video), cap);
        }
        if let Some(outro) = &item.outro_audio_path {
            push_capped(&mut self.recent_outro_basenames, basename_lower(outro), cap);
        }
    }

    /// Rebuilds the unified bump queue from the library inventory.
    pub fn rebuild_queue(&mut self, library: &BumpLibrary, exposure: &ExposureStore) {
        self.queue.clear();
        let scripts = &library.scripts;
        if scripts.is_empty() {
            return;
        }

        let mut video_script_indices: Vec<usize> = Vec::new();
        let mut audio_script_indices: Vec<usize> = Vec::new();
        for (i, script) in scripts.iter().enumerate() {
            if script.is_video_bump() {
                video_script_indices.push(i);
            } else {
                audio_script_indices.push(i);
            }
        }

        let has_video = !video_script_indices.is_empty();
        let has_music = !library.music_files.is_empty();
        if !has_video && (!has_music || audio_script_indices.is_empty()) {
            return;
        }

        // Cap by configured target and available sources. Music may be reused
        // across the queue, so audio capacity is the script count.
        let max_audio = if has_music { audio_script_indices.len() } else { 0 };
        let max_possible = max_audio + video_script_indices.len();
        let target_cap = if self.composer.bump_queue_size == 0 {
            max_possible
        } else {
            self.composer.bump_queue_size
        };
        let max_n = target_cap.min(max_possible);
        if max_n == 0 {
            return;
        }

        let mut script_pool: Vec<usize> = if has_music && !audio_script_indices.is_empty() {
            video_script_indices
                .iter()
                .chain(audio_script_indices.iter())
                .copied()
                .collect()
        } else {
            video_script_indices.clone()
        };
        let mut music_pool: Vec<usize> = (0..library.music_files.len()).collect();

        // Which scripts can genuinely be compressed into the short target.
        let short_target_ms = self.fitter.short_bump_target_ms();
        let short_eps = self.fitter.short_bump_overage_tolerance;
        let short_fit_scripts: HashSet<usize> = scripts
            .iter()
            .enumerate()
            .filter(|(_, script)| {
                timing::can_fit_short_clip(&script.timing, short_target_ms, short_eps, &self.fitter)
            })
            .map(|(i, _)| i)
            .collect();

        // Temporary penalty maps; never persisted. They only prevent repeats
        // inside this queue and across the rebuild boundary.
        let mut temp_script: HashMap<String, f64> = scripts
            .iter()
            .map(|script| {
                (
                    script.script_key.clone(),
                    exposure.script_score(&script.script_key),
                )
            })
            .collect();
        let mut temp_music: HashMap<PathKey, f64> = exposure.music_scores().clone();
        let mut temp_video: HashMap<PathKey, f64> = HashMap::new();
        let mut temp_outro: HashMap<PathKey, f64> = HashMap::new();
        let mut temp_music_basename_penalty: HashMap<String, f64> = HashMap::new();

        let recent_set: HashSet<String> = self
            .recent_music_basenames
            .iter()
            .rev()
            .take(self.composer.recent_spread_n)
            .cloned()
            .collect();

        // Strong penalty so recently-used music is very unlikely early on.
        let base_penalty = temp_music
            .values()
            .copied()
            .fold(0.0_f64, f64::max)
            + 1000.0;

        if !recent_set.is_empty() {
            for entry in &library.music_files {
                let bn = basename_lower(&entry.path);
                if bn.is_empty() || !recent_set.contains(&bn) {
                    continue;
                }
                *temp_music.entry(PathKey::new(&entry.path)).or_insert(0.0) += base_penalty;
            }
        }

        let mut last_music_basename: Option<String> =
            self.recent_music_basenames.back().cloned();
        let mut used_music_basenames_recent: VecDeque<String> = VecDeque::new();
        let music_spread_n = self.composer.recent_spread_n.max(1);

        let queue_delta = base_penalty;
        let mut stats = QueueRebuildStats {
            queue_target: max_n,
            scripts_total: scripts.len(),
            scripts_audio: audio_script_indices.len(),
            scripts_video: video_script_indices.len(),
            music_total: library.music_files.len(),
            skipped_audio_no_music_fit: 0,
            queue_built: 0,
        };

        let mut guard = max_n * 6;
        while self.queue.len() < max_n && !script_pool.is_empty() && guard > 0 {
            guard -= 1;

            // Early-queue gate: when short-fit scripts exist, the opening
            // slots admit only those (video bumps always pass).
            let mut candidates: Vec<usize> = script_pool.clone();
            let early_slots = self.composer.early_short_only_slots;
            if early_slots > 0 && !short_fit_scripts.is_empty() && self.queue.len() < early_slots {
                let filtered: Vec<usize> = candidates
                    .iter()
                    .copied()
                    .filter(|i| short_fit_scripts.contains(i))
                    .collect();
                if !filtered.is_empty() {
                    let mut merged: Vec<usize> = candidates
                        .iter()
                        .copied()
                        .filter(|i| video_script_indices.contains(i))
                        .collect();
                    for idx in filtered {
                        if !merged.contains(&idx) {
                            merged.push(idx);
                        }
                    }
                    candidates = merged;
                }
            }

            let script_score = |idx: usize| -> f64 {
                let script = &scripts[idx];
                let mut score = temp_script
                    .get(&script.script_key)
                    .copied()
                    .unwrap_or(0.0);
                if script.is_video_bump() {
                    if let Some(video) = &script.video {
                        score += temp_video
                            .get(&PathKey::new(&video.path))
                            .copied()
                            .unwrap_or(0.0)
                            + exposure.video_score(&PathKey::new(&video.path));
                    }
                } else if !short_fit_scripts.contains(&idx) {
                    // Long scripts must not dominate the early queue.
                    score += base_penalty;
                }
                score
            };

            let Some(script_idx) = pick_min_score(&candidates, script_score, &mut self.rng)
            else {
                break;
            };
            let script = &scripts[script_idx];

            // --- Video bump: no music selection required. ---
            if script.is_video_bump() {
                let materialized = timing::materialize_without_music(script);
                let video = script.video.as_ref().expect("video bump has video");
                let mut item = CompleteBump {
                    script: materialized,
                    audio: None,
                    video: Some(video.path.clone()),
                    video_inclusive: video.inclusive,
                    outro_audio_path: None,
                };
                if script.needs_outro_audio() {
                    item.outro_audio_path = pick_outro_by_exposure(
                        &library.outro_sounds,
                        &temp_outro,
                        exposure,
                        &mut self.rng,
                    );
                }

                *temp_script.entry(script.script_key.clone()).or_insert(0.0) += queue_delta;
                *temp_video.entry(PathKey::new(&video.path)).or_insert(0.0) += queue_delta;
                if let Some(outro) = &item.outro_audio_path {
                    *temp_outro.entry(PathKey::new(outro)).or_insert(0.0) += queue_delta;
                }

                self.queue.push_back(item);
                script_pool.retain(|&i| i != script_idx);
                continue;
            }

            // --- Music bump. ---
            if music_pool.is_empty() {
                script_pool.retain(|&i| i != script_idx);
                continue;
            }

            let disallow: HashSet<String> = used_music_basenames_recent
                .iter()
                .rev()
                .take(music_spread_n)
                .cloned()
                .collect();

            // Spacing fallbacks: drop the avoid rule first, then the recent
            // basename exclusion, so a small music library still fills the
            // queue (adjacent repeats only happen with no alternative).
            let no_disallow = HashSet::new();
            let attempts: [(Option<&str>, &HashSet<String>); 4] = [
                (last_music_basename.as_deref(), &disallow),
                (None, &disallow),
                (last_music_basename.as_deref(), &no_disallow),
                (None, &no_disallow),
            ];
            let mut music_idx = None;
            for (avoid, disallowed) in attempts {
                music_idx = self.select_music_for_script(
                    script,
                    &music_pool,
                    library,
                    avoid,
                    disallowed,
                    &temp_music,
                    &temp_music_basename_penalty,
                );
                if music_idx.is_some() {
                    break;
                }
            }
            let Some(music_idx) = music_idx else {
                // No eligible music right now; drop the script this rebuild.
                stats.skipped_audio_no_music_fit += 1;
                script_pool.retain(|&i| i != script_idx);
                continue;
            };

            let entry = &library.music_files[music_idx];
            let audio_path = entry.path.clone();
            let bn = basename_lower(&audio_path);
            if !bn.is_empty() {
                last_music_basename = Some(bn.clone());
                used_music_basenames_recent.push_back(bn.clone());
            }

            let materialized = match entry.duration_ms() {
                Some(duration) => timing::materialize_for_music(
                    script,
                    duration.min(u64::from(u32::MAX)) as u32,
                    &self.fitter,
                ),
                None => Some(timing::materialize_without_music(script)),
            };
            let Some(materialized) = materialized else {
                // Fitting failed; drop this music and retry the script.
                music_pool.retain(|&i| i != music_idx);
                continue;
            };

            let mut item = CompleteBump {
                script: materialized,
                audio: Some(audio_path.clone()),
                video: None,
                video_inclusive: false,
                outro_audio_path: None,
            };
            if script.needs_outro_audio() {
                item.outro_audio_path = pick_outro_by_exposure(
                    &library.outro_sounds,
                    &temp_outro,
                    exposure,
                    &mut self.rng,
                );
            }

            // Penalize the chosen components so subsequent picks diverge.
            *temp_script.entry(script.script_key.clone()).or_insert(0.0) += queue_delta;
            *temp_music.entry(PathKey::new(&audio_path)).or_insert(0.0) += queue_delta;
            if !bn.is_empty() {
                *temp_music_basename_penalty.entry(bn).or_insert(0.0) += queue_delta;
            }
            if let Some(outro) = &item.outro_audio_path {
                *temp_outro.entry(PathKey::new(outro)).or_insert(0.0) += queue_delta;
            }

            self.queue.push_back(item);
            script_pool.retain(|&i| i != script_idx);
        }

        stats.queue_built = self.queue.len();
        info!(
            "BumpComposer: rebuilt queue with {}/{} items ({} audio skipped)",
            stats.queue_built, stats.queue_target, stats.skipped_audio_no_music_fit
        );
        self.last_stats = Some(stats);
    }

    /// Chooses music for an audio script: explicit requests are exact-match
    /// or nothing; "any" selection spaces recent basenames, skips reserved
    /// tracks, prefers short tracks for short-fit scripts, then takes the
    /// minimum-exposure candidate.
    #[allow(clippy::too_many_arguments)]
    fn select_music_for_script(
        &mut self,
        script: &Script,
        pool: &[usize],
        library: &BumpLibrary,
        avoid_basename: Option<&str>,
        disallow_basenames: &HashSet<String>,
        temp_music: &HashMap<PathKey, f64>,
        temp_basename_penalty: &HashMap<String, f64>,
    ) -> Option<usize> {
        if pool.is_empty() {
            return None;
        }
        let timing_info = &script.timing;
        let short_target_ms = self.fitter.short_bump_target_ms();
        let short_eps = self.fitter.short_bump_overage_tolerance;
        let prefer_short =
            timing::can_fit_short_clip(timing_info, short_target_ms, short_eps, &self.fitter);

        // Explicit track request: never substitute. If the requested track is
        // missing or ineligible, the script fails selection for this build.
        let pref = script.music_pref.trim();
        if !pref.is_empty() && !pref.eq_ignore_ascii_case("any") {
            let want = pref.to_lowercase();
            for &idx in pool {
                let entry = &library.music_files[idx];
                if basename_lower(&entry.path) != want {
                    continue;
                }
                if let Some(duration) = entry.duration_ms() {
                    let eligible = timing::is_music_eligible(
                        timing_info,
                        duration.min(u64::from(u32::MAX)) as u32,
                        &self.fitter,
                        None,
                    );
                    if !eligible {
                        return None;
                    }
                }
                return Some(idx);
            }
            return None;
        }

        let short_cap_ms = u64::from(short_target_ms) + SHORT_TRACK_SLACK_MS;
        let max_est_ms = (f64::from(short_target_ms) * (1.0 + short_eps)).round() as u32;
        let mut eligible: Vec<usize> = Vec::new();
        let mut eligible_short: Vec<usize> = Vec::new();
        for &idx in pool {
            let entry = &library.music_files[idx];
            let bn = basename_lower(&entry.path);
            if bn.is_empty() {
                continue;
            }
            if disallow_basenames.contains(&bn) {
                continue;
            }
            if avoid_basename.is_some_and(|avoid| avoid.eq_ignore_ascii_case(&bn)) {
                continue;
            }
            // Reserved tracks only play when a script asks for them by name.
            if is_reserved_music_basename(&bn) {
                continue;
            }
            let Some(duration) = entry.duration_ms() else {
                continue;
            };
            let duration_u32 = duration.min(u64::from(u32::MAX)) as u32;

            if prefer_short && duration <= short_cap_ms {
                // Short tracks may compress the script within the short
                // acceptance window, as long as the fitter really succeeds.
                if timing_info.estimated_ms > max_est_ms {
                    continue;
                }
                if timing::fit_scalable_durations(timing_info, duration_u32, &self.fitter)
                    .is_none()
                {
                    continue;
                }
            } else if !timing::is_music_eligible(timing_info, duration_u32, &self.fitter, None) {
                continue;
            }

            eligible.push(idx);
            if duration <= short_cap_ms {
                eligible_short.push(idx);
            }
        }

        let music_score = |idx: usize| -> f64 {
            let entry = &library.music_files[idx];
            let base = temp_music
                .get(&PathKey::new(&entry.path))
                .copied()
                .unwrap_or(0.0);
            let extra = temp_basename_penalty
                .get(&basename_lower(&entry.path))
                .copied()
                .unwrap_or(0.0);
            base + extra
        };

        if prefer_short && !eligible_short.is_empty() {
            return pick_min_score(&eligible_short, music_score, &mut self.rng);
        }
        if !eligible.is_empty() {
            return pick_min_score(&eligible, music_score, &mut self.rng);
        }
        None
    }
}

fn push_capped(tail: &mut VecDeque<String>, value: String, cap: usize) {
    if value.is_empty() {
        return;
    }
    tail.push_back(value);
    while tail.len() > cap {
        tail.pop_front();
    }
}

/// Reserved basenames are excluded from `music=any` auto-selection.
fn is_reserved_music_basename(name_lower: &str) -> bool {
    name_lower.starts_with("xmas") || name_lower.starts_with("special")
}

/// Minimum-score pick with a uniform random tie-break.
fn pick_min_score<F>(indices: &[usize], score_fn: F, rng: &mut StdRng) -> Option<usize>
where
    F: Fn(usize) -> f64,
{
    let mut best_score: Option<f64> = None;
    let mut ties: Vec<usize> = Vec::new();
    for &idx in indices {
        let score = score_fn(idx);
        match best_score {
            None => {
                best_score = Some(score);
                ties = vec![idx];
            }
            Some(best) => {
                if score < best {
                    best_score = Some(score);
                    ties = vec![idx];
                } else if (score - best).abs() < 1e-9 {
                    ties.push(idx);
                }
            }
        }
    }
    if ties.is_empty() {
        None
    } else {
        Some(ties[rng.random_range(0..ties.len())])
    }
}

fn pick_outro_by_exposure(
    outro_sounds: &[PathBuf],
    temp_outro: &HashMap<PathKey, f64>,
    exposure: &ExposureStore,
    rng: &mut StdRng,
) -> Option<PathBuf> {
    if outro_sounds.is_empty() {
        return None;
    }
    let indices: Vec<usize> = (0..outro_sounds.len()).collect();
    let score = |idx: usize| -> f64 {
        let key = PathKey::new(&outro_sounds[idx]);
        exposure.outro_score(&key) + temp_outro.get(&key).copied().unwrap_or(0.0)
    };
    let chosen = pick_min_score(&indices, score, rng)?;
    debug!(
        "BumpComposer: outro pick {}",
        outro_sounds[chosen].display()
    );
    Some(outro_sounds[chosen].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bump::library::{AssetResolver, MusicEntry};
    use crate::bump::script::parse_script_text;
    use crate::bump::timing::materialized_total_ms;
    use std::path::Path;

    fn parse_named(body: &str, name: &str) -> Vec<Script> {
        let resolver = AssetResolver::default();
        let config = Config::default();
        parse_script_text(
            body,
            Some(Path::new(&format!("/scripts/{name}.txt"))),
            &resolver,
            &config,
        )
    }

    fn short_script(name: &str) -> Script {
        parse_named("<bump>\n<card>\nshort and sweet\n", name)
            .into_iter()
            .next()
            .unwrap()
    }

    /// A script whose estimate (~20s) exceeds the ~23s/15s short window once
    /// fixed time is added, but still fits longer tracks.
    fn long_script(name: &str) -> Script {
        parse_named(
            "<bump>\n<card>\nthe first of many long cards in this bump\n\
             <pause=6000>\n<pause=6000>\n<pause=6000>\n<pause=4000>\n",
            name,
        )
        .into_iter()
        .next()
        .unwrap()
    }

    fn video_script(name: &str) -> Script {
        parse_named("<bump video=clip.mp4 inclusive>\n<card>\nover video\n", name)
            .into_iter()
            .next()
            .unwrap()
    }

    fn music(path: &str, seconds: u64) -> MusicEntry {
        MusicEntry {
            path: PathBuf::from(path),
            duration_ms: Some(seconds * 1000),
            duration_s: Some(seconds as f64),
        }
    }

    fn composer() -> BumpComposer {
        BumpComposer::with_seed(&Config::default(), [7u8; 32])
    }

    fn library(scripts: Vec<Script>, music_files: Vec<MusicEntry>) -> BumpLibrary {
        BumpLibrary {
            scripts,
            music_files,
            outro_sounds: Vec::new(),
        }
    }

    #[test]
    fn queue_respects_capacity_bottleneck() {
        let lib = library(
            vec![short_script("a"), short_script("b"), short_script("c")],
            vec![music("/m/track one 20.mp3", 20)],
        );
        let exposure = ExposureStore::in_memory();
        let mut composer = composer();
        composer.rebuild_queue(&lib, &exposure);
        // Music reuse allows one track to cover all three scripts.
        assert_eq!(composer.queue_len(), 3);

        let stats = composer.last_stats().unwrap();
        assert_eq!(stats.queue_target, 3);
        assert_eq!(stats.queue_built, 3);
        assert_eq!(stats.scripts_audio, 3);
    }

    #[test]
    fn configured_queue_size_caps_the_build() {
        let mut config = Config::default();
        config.composer.bump_queue_size = 2;
        let lib = library(
            vec![short_script("a"), short_script("b"), short_script("c")],
            vec![music("/m/track one 20.mp3", 20), music("/m/track two 18.mp3", 18)],
        );
        let exposure = ExposureStore::in_memory();
        let mut composer = BumpComposer::with_seed(&config, [3u8; 32]);
        composer.rebuild_queue(&lib, &exposure);
        assert_eq!(composer.queue_len(), 2);
    }

    #[test]
    fn empty_inventory_yields_empty_queue() {
        let exposure = ExposureStore::in_memory();
        let mut composer = composer();
        composer.rebuild_queue(&library(Vec::new(), Vec::new()), &exposure);
        assert_eq!(composer.queue_len(), 0);

        // Audio scripts without music are equally hopeless.
        composer.rebuild_queue(&library(vec![short_script("a")], Vec::new()), &exposure);
        assert_eq!(composer.queue_len(), 0);
    }

    #[test]
    fn audio_bumps_materialize_to_capped_music_duration() {
        let lib = library(
            vec![short_script("a")],
            vec![music("/m/track 18.mp3", 18)],
        );
        let exposure = ExposureStore::in_memory();
        let mut composer = composer();
        composer.rebuild_queue(&lib, &exposure);
        let bump = composer.pop_bump(&lib, &exposure).unwrap();
        // Short script against an 18s track: no compression needed, the
        // template duration stands.
        assert_eq!(
            materialized_total_ms(&bump.script),
            lib.scripts[0].estimated_ms
        );
        assert_eq!(bump.audio, Some(PathBuf::from("/m/track 18.mp3")));
    }

    #[test]
    fn fitted_bump_sums_to_music_duration() {
        // ~16s estimate against a 10s track forces real compression.
        let script = parse_named(
            "<bump>\n<card>\nfirst long chatty card for the evening\n\
             <card>\nsecond long chatty card for the evening\n\
             <card>\nthird long chatty card for the evening\n\
             <card>\nfourth long chatty card for the evening\n\
             <card>\nfifth long chatty card for the evening\n",
            "fit",
        )
        .into_iter()
        .next()
        .unwrap();
        let lib = library(vec![script], vec![music("/m/ten 10.mp3", 10)]);
        let exposure = ExposureStore::in_memory();
        let mut composer = composer();
        composer.rebuild_queue(&lib, &exposure);
        let bump = composer.pop_bump(&lib, &exposure).unwrap();
        assert_eq!(materialized_total_ms(&bump.script), 10_000);
    }

    #[test]
    fn early_slots_prefer_short_fit_scripts() {
        let mut scripts = vec![long_script("long")];
        for name in ["s1", "s2", "s3", "s4", "s5"] {
            scripts.push(short_script(name));
        }
        let lib = library(
            scripts,
            vec![
                music("/m/alpha 25.mp3", 25),
                music("/m/beta 26.mp3", 26),
                music("/m/gamma 24.mp3", 24),
                music("/m/delta 27.mp3", 27),
                music("/m/epsilon 23.mp3", 23),
            ],
        );
        // The long script has the lowest exposure, so only the gate keeps it
        // out of the early queue.
        let mut exposure = ExposureStore::in_memory();
        for script in &lib.scripts[1..] {
            let bump = CompleteBump {
                script: script.clone(),
                audio: None,
                video: None,
                video_inclusive: false,
                outro_audio_path: None,
            };
            exposure.apply_bump_exposure(&bump, 10.0);
        }

        let mut composer = composer();
        composer.rebuild_queue(&lib, &exposure);
        assert_eq!(composer.queue_len(), 6);
        for slot in 0..4 {
            let item = &composer.queue[slot];
            assert_ne!(
                item.script.script_key, "/scripts/long.txt#bump0",
                "slot {slot} must hold a short-fit script"
            );
        }
    }

    #[test]
    fn consecutive_music_basenames_differ() {
        let lib = library(
            vec![
                short_script("a"),
                short_script("b"),
                short_script("c"),
                short_script("d"),
            ],
            vec![music("/m/one 20.mp3", 20), music("/m/two 21.mp3", 21)],
        );
        let exposure = ExposureStore::in_memory();
        let mut composer = composer();
        composer.rebuild_queue(&lib, &exposure);
        let names: Vec<String> = composer
            .queue
            .iter()
            .map(|item| basename_lower(item.audio.as_ref().unwrap()))
            .collect();
        for pair in names.windows(2) {
            assert_ne!(pair[0], pair[1], "adjacent bumps reused {names:?}");
        }
    }

    #[test]
    fn explicit_music_pref_is_exact_or_nothing() {
        let script = parse_named("<bump music=special campfire.mp3>\n<card>\ncozy\n", "pref")
            .into_iter()
            .next()
            .unwrap();
        // Requested track present: honored even though it's reserved.
        let lib = library(
            vec![script.clone()],
            vec![
                music("/m/special campfire.mp3", 20),
                music("/m/other 20.mp3", 20),
            ],
        );
        let exposure = ExposureStore::in_memory();
        let mut comp = composer();
        comp.rebuild_queue(&lib, &exposure);
        let bump = comp.pop_bump(&lib, &exposure).unwrap();
        assert_eq!(bump.audio, Some(PathBuf::from("/m/special campfire.mp3")));

        // Requested track absent: the script is dropped, not substituted.
        let lib = library(vec![script], vec![music("/m/other 20.mp3", 20)]);
        let mut comp = composer();
        comp.rebuild_queue(&lib, &exposure);
        assert_eq!(comp.queue_len(), 0);
        assert_eq!(comp.last_stats().unwrap().skipped_audio_no_music_fit, 1);
    }

    #[test]
    fn reserved_tracks_are_skipped_for_any() {
        let lib = library(
            vec![short_script("a")],
            vec![
                music("/m/xmas bells 20.mp3", 20),
                music("/m/special tune 20.mp3", 20),
                music("/m/plain 20.mp3", 20),
            ],
        );
        let exposure = ExposureStore::in_memory();
        let mut composer = composer();
        composer.rebuild_queue(&lib, &exposure);
        let bump = composer.pop_bump(&lib, &exposure).unwrap();
        assert_eq!(bump.audio, Some(PathBuf::from("/m/plain 20.mp3")));
    }

    #[test]
    fn video_bumps_skip_music_and_carry_inclusive() {
        let lib = library(vec![video_script("v")], Vec::new());
        let exposure = ExposureStore::in_memory();
        let mut composer = composer();
        composer.rebuild_queue(&lib, &exposure);
        let bump = composer.pop_bump(&lib, &exposure).unwrap();
        assert!(bump.audio.is_none());
        assert!(bump.video_inclusive);
        assert!(bump.video.as_ref().unwrap().ends_with("clip.mp4"));
        // Video bump cards keep template durations.
        assert_eq!(
            materialized_total_ms(&bump.script),
            lib.scripts[0].estimated_ms
        );
    }

    #[test]
    fn outro_selection_prefers_low_exposure() {
        let script = parse_named("<bump>\n<card>\nhi\n<outro audio>\n", "o")
            .into_iter()
            .next()
            .unwrap();
        let mut lib = library(vec![script], vec![music("/m/one 20.mp3", 20)]);
        lib.outro_sounds = vec![PathBuf::from("/o/worn.wav"), PathBuf::from("/o/fresh.wav")];

        let mut exposure = ExposureStore::in_memory();
        let bump = CompleteBump {
            script: lib.scripts[0].clone(),
            audio: None,
            video: None,
            video_inclusive: false,
            outro_audio_path: Some(PathBuf::from("/o/worn.wav")),
        };
        exposure.apply_bump_exposure(&bump, 50.0);

        let mut composer = composer();
        composer.rebuild_queue(&lib, &exposure);
        let bump = composer.pop_bump(&lib, &exposure).unwrap();
        assert_eq!(bump.outro_audio_path, Some(PathBuf::from("/o/fresh.wav")));
    }

    #[test]
    fn pop_rebuilds_on_demand_and_tracks_recents() {
        let lib = library(
            vec![short_script("a")],
            vec![music("/m/one 20.mp3", 20)],
        );
        let exposure = ExposureStore::in_memory();
        let mut composer = composer();
        // No explicit rebuild; pop self-primes.
        let bump = composer.pop_bump(&lib, &exposure).unwrap();
        assert!(bump.audio.is_some());
        assert_eq!(
            composer.recent_music_basenames.back().map(String::as_str),
            Some("one 20.mp3")
        );
        assert_eq!(
            composer.recent_script_keys.back().map(String::as_str),
            Some("/scripts/a.txt#bump0")
        );
    }

    #[test]
    fn low_exposure_music_wins_selection() {
        let lib = library(
            vec![short_script("a")],
            vec![music("/m/worn 20.mp3", 20), music("/m/fresh 20.mp3", 20)],
        );
        let mut exposure = ExposureStore::in_memory();
        let worn = CompleteBump {
            script: lib.scripts[0].clone(),
            audio: Some(PathBuf::from("/m/worn 20.mp3")),
            video: None,
            video_inclusive: false,
            outro_audio_path: None,
        };
        exposure.apply_bump_exposure(&worn, 500.0);

        let mut composer = composer();
        composer.rebuild_queue(&lib, &exposure);
        let bump = composer.pop_bump(&lib, &exposure).unwrap();
        assert_eq!(bump.audio, Some(PathBuf::from("/m/fresh 20.mp3")));
    }

    #[test]
    fn ineligible_music_is_skipped() {
        // Estimate ~20s fixed requires a track of >= ~16.7s; an 8s track
        // fails the overage window.
        let lib = library(
            vec![long_script("long")],
            vec![music("/m/tiny 8.mp3", 8), music("/m/roomy 28.mp3", 28)],
        );
        let exposure = ExposureStore::in_memory();
        let mut composer = composer();
        composer.rebuild_queue(&lib, &exposure);
        let bump = composer.pop_bump(&lib, &exposure).unwrap();
        assert_eq!(bump.audio, Some(PathBuf::from("/m/roomy 28.mp3")));
    }
}
