//! Episode queue construction and playback sequencing.
//!
//! The scheduler owns the current playlist and a hidden queue of upcoming
//! episode indices. Shuffle modes order that queue by exposure so the least
//! watched material surfaces first; multi-part episodes are stitched back
//! together across injected interludes; history powers back/forward
//! navigation without breaking shuffle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rand::{rngs::StdRng, RngExt, SeedableRng};

use crate::bump::composer::{BumpComposer, CompleteBump};
use crate::bump::library::BumpLibrary;
use crate::exposure::{ExposureStore, PlayKind};
use crate::paths::{natural_sort_key, PathKey};
use crate::playlist::frequency::FrequencySettings;

const EPISODE_HISTORY_CAP: usize = 50;
const PLAYBACK_HISTORY_CAP: usize = 200;
/// Below this elapsed time, "previous" steps back instead of restarting.
pub const PREVIOUS_RESTART_THRESHOLD_S: f64 = 3.0;

/// One entry of the active playlist.
#[derive(Clone, Debug)]
pub enum PlaylistItem {
    Video(PathBuf),
    Interstitial(PathBuf),
    Bump(CompleteBump),
}

impl PlaylistItem {
    /// Only regular video items count as episodes for shuffle purposes.
    pub fn is_episode(&self) -> bool {
        matches!(self, PlaylistItem::Video(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            PlaylistItem::Video(path) | PlaylistItem::Interstitial(path) => Some(path),
            PlaylistItem::Bump(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShuffleMode {
    #[default]
    Off,
    Standard,
    Season,
}

impl ShuffleMode {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "standard" => ShuffleMode::Standard,
            "season" => ShuffleMode::Season,
            _ => ShuffleMode::Off,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ShuffleMode::Off => "off",
            ShuffleMode::Standard => "standard",
            ShuffleMode::Season => "season",
        }
    }

    pub fn is_shuffled(self) -> bool {
        self != ShuffleMode::Off
    }
}

/// What "previous episode" should do, given the current position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreviousAction {
    /// Restart the current item from zero.
    SeekToStart,
    /// Play this playlist index.
    Play(usize),
    /// Nothing to go back to.
    None,
}

struct PlayStart {
    index: usize,
    token: u64,
    penalized: bool,
}

/// Owns playlist state and sequencing decisions.
pub struct PlaylistScheduler {
    items: Vec<PlaylistItem>,
    current_index: Option<usize>,
    shuffle_mode: ShuffleMode,
    play_queue: Vec<usize>,
    episode_history: Vec<usize>,
    playback_history: Vec<usize>,
    playback_history_pos: Option<usize>,
    forced_next_episode_index: Option<usize>,
    frequency: FrequencySettings,
    rng: StdRng,
    play_start_seq: u64,
    last_play_start: Option<PlayStart>,
}

impl Default for PlaylistScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaylistScheduler {
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).expect("Failed to generate random seed");
        Self::with_seed(seed)
    }

    /// Deterministic construction for tests.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            items: Vec::new(),
            current_index: None,
            shuffle_mode: ShuffleMode::Off,
            play_queue: Vec::new(),
            episode_history: Vec::new(),
            playback_history: Vec::new(),
            playback_history_pos: None,
            forced_next_episode_index: None,
            frequency: FrequencySettings::default(),
            rng: StdRng::from_seed(seed),
            play_start_seq: 0,
            last_play_start: None,
        }
    }

    // --- Playlist state -----------------------------------------------------

    pub fn items(&self) -> &[PlaylistItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn set_current_index(&mut self, index: Option<usize>) {
        self.current_index = index.filter(|&i| i < self.items.len());
    }

    pub fn shuffle_mode(&self) -> ShuffleMode {
        self.shuffle_mode
    }

    pub fn play_queue(&self) -> &[usize] {
        &self.play_queue
    }

    pub fn set_play_queue(&mut self, queue: Vec<usize>) {
        let len = self.items.len();
        self.play_queue = queue.into_iter().filter(|&i| i < len).collect();
    }

    pub fn frequency(&self) -> &FrequencySettings {
        &self.frequency
    }

    pub fn frequency_mut(&mut self) -> &mut FrequencySettings {
        &mut self.frequency
    }

    /// Installs a new playlist; playback state resets.
    pub fn set_playlist(&mut self, items: Vec<PlaylistItem>, exposure: &mut ExposureStore) {
        self.items = items;
        self.current_index = None;
        self.reset_playback_state(exposure);
        self.rebuild_queue(exposure);
    }

    /// New viewing session: queue, histories, and session counters restart.
    pub fn reset_playback_state(&mut self, exposure: &mut ExposureStore) {
        self.play_queue.clear();
        self.episode_history.clear();
        self.playback_history.clear();
        self.playback_history_pos = None;
        self.forced_next_episode_index = None;
        self.last_play_start = None;
        exposure.reset_session();
    }

    // --- Episode helpers ----------------------------------------------------

    fn episode_indices(&self) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_episode())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn episode_path_for_index(&self, index: usize) -> Option<&Path> {
        self.items.get(index).and_then(PlaylistItem::path)
    }

    fn is_episode_index(&self, index: usize) -> bool {
        self.items.get(index).is_some_and(PlaylistItem::is_episode)
    }

    fn chronological_episode_indices(&self) -> Vec<usize> {
        let mut indices = self.episode_indices();
        indices.sort_by_key(|&i| {
            natural_sort_key(
                &self
                    .episode_path_for_index(i)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            )
        });
        indices
    }

    /// Multi-part sequencing only applies to King of the Hill style
    /// playlists, recognized by path tokens.
    fn is_koth_playlist(&self) -> bool {
        self.episode_indices()
            .into_iter()
            .take(30)
            .filter_map(|i| self.episode_path_for_index(i))
            .any(|path| {
                let lower = path.to_string_lossy().to_lowercase();
                lower.contains("king of the hill") || lower.contains("koth")
            })
    }

    fn is_part1_episode(path: &Path) -> bool {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().trim_end().ends_with("(1)"))
            .unwrap_or(false)
    }

    fn next_chronological_episode_index_after(&self, episode_index: usize) -> Option<usize> {
        let ordered = self.chronological_episode_indices();
        let pos = ordered.iter().position(|&i| i == episode_index)?;
        ordered.get(pos + 1).copied()
    }

    // --- Season keys --------------------------------------------------------

    /// Season number parsed from any path component ("Season 1", "s04", ...).
    pub fn season_number_from_path(path: &Path) -> u32 {
        for component in path.components() {
            let part = component.as_os_str().to_string_lossy();
            if let Some(number) = season_number_in(&part) {
                return number;
            }
        }
        0
    }

    /// Candidate season bucket keys for overrides: show-qualified first,
    /// then the bare `season:N` form.
    pub fn season_bucket_keys(path: &Path) -> Vec<String> {
        let mut keys = Vec::new();
        let parts: Vec<String> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .filter(|p| !p.is_empty() && p != "/" && p != "\\")
            .collect();
        let season_num = Self::season_number_from_path(path);

        let season_idx = parts.iter().position(|p| season_number_in(p).is_some());
        let show_name = match season_idx {
            // The folder right before the season folder names the show.
            Some(idx) if idx > 0 => parts[idx - 1].clone(),
            _ if parts.len() >= 2 => parts[parts.len() - 2].clone(),
            _ => String::new(),
        };
        let show_name = show_name.trim().to_string();
        if show_name.is_empty() {
            keys.push(format!("season:{season_num}"));
        } else {
            keys.push(format!("{show_name}|season:{season_num}"));
            if season_num != 0 {
                keys.push(format!("season:{season_num}"));
            }
        }
        keys
    }

    // --- Exposure-weighted scoring ------------------------------------------

    /// Queue ordering score: stored exposure, plus user offsets, plus the
    /// projected next-play delta scaled by the user factor. A heavy factor
    /// pushes an episode later before it accrues any visible exposure.
    fn episode_score(&self, index: usize, exposure: &ExposureStore) -> f64 {
        let Some(path) = self.episode_path_for_index(index) else {
            return 0.0;
        };
        let key = PathKey::new(path);
        let season_keys = Self::season_bucket_keys(path);
        let base = exposure.episode_score(&key);
        let offset = self.frequency.effective_offset(&key, &season_keys);
        let factor = self.frequency.effective_factor(&key, &season_keys);
        let projected = exposure.next_play_delta(PlayKind::Episode) * factor;
        base + offset + projected
    }

    pub fn effective_episode_factor(&self, path: &Path) -> f64 {
        let key = PathKey::new(path);
        let season_keys = Self::season_bucket_keys(path);
        self.frequency.effective_factor(&key, &season_keys)
    }

    /// Groups indices by score and shuffles inside equal-score buckets, so
    /// under-watched episodes lead without becoming deterministic.
    fn order_by_exposure(&mut self, indices: &[usize], exposure: &ExposureStore) -> Vec<usize> {
        let mut buckets: Vec<(i64, Vec<usize>)> = Vec::new();
        let mut by_score: HashMap<i64, usize> = HashMap::new();
        for &i in indices {
            let score = (self.episode_score(i, exposure) * 1e6).round() as i64;
            match by_score.get(&score) {
                Some(&slot) => buckets[slot].1.push(i),
                None => {
                    by_score.insert(score, buckets.len());
                    buckets.push((score, vec![i]));
                }
            }
        }
        buckets.sort_by_key(|(score, _)| *score);
        let mut out = Vec::with_capacity(indices.len());
        for (_, mut bucket) in buckets {
            shuffle(&mut bucket, &mut self.rng);
            out.extend(bucket);
        }
        out
    }

    // --- Queue construction -------------------------------------------------

    /// Rebuilds the hidden queue of upcoming episodes for the current mode.
    /// Never touches `current_index`.
    pub fn rebuild_queue(&mut self, exposure: &ExposureStore) {
        let episode_idxs = self.episode_indices();
        if episode_idxs.is_empty() {
            self.play_queue.clear();
            return;
        }

        let order: Vec<usize> = match self.shuffle_mode {
            ShuffleMode::Standard => self.order_by_exposure(&episode_idxs, exposure),
            ShuffleMode::Season => {
                let mut season_map: Vec<(u32, Vec<usize>)> = Vec::new();
                let mut season_slots: HashMap<u32, usize> = HashMap::new();
                for &idx in &episode_idxs {
                    let season = self
                        .episode_path_for_index(idx)
                        .map(Self::season_number_from_path)
                        .unwrap_or(0);
                    match season_slots.get(&season) {
                        Some(&slot) => season_map[slot].1.push(idx),
                        None => {
                            season_slots.insert(season, season_map.len());
                            season_map.push((season, vec![idx]));
                        }
                    }
                }

                // Order seasons by their least-exposed episode, ties random.
                let mut season_scores: Vec<(i64, usize)> = season_map
                    .iter()
                    .enumerate()
                    .map(|(slot, (_, eps))| {
                        let min_score = eps
                            .iter()
                            .map(|&i| (self.episode_score(i, exposure) * 1e6).round() as i64)
                            .min()
                            .unwrap_or(0);
                        (min_score, slot)
                    })
                    .collect();
                season_scores.sort_by_key(|(score, _)| *score);
                let mut ordered_slots: Vec<usize> = Vec::new();
                let mut j = 0;
                while j < season_scores.len() {
                    let mut k = j;
                    while k < season_scores.len() && season_scores[k].0 == season_scores[j].0 {
                        k += 1;
                    }
                    let mut chunk: Vec<usize> =
                        season_scores[j..k].iter().map(|&(_, slot)| slot).collect();
                    shuffle(&mut chunk, &mut self.rng);
                    ordered_slots.extend(chunk);
                    j = k;
                }

                let mut order = Vec::with_capacity(episode_idxs.len());
                for slot in ordered_slots {
                    let eps = season_map[slot].1.clone();
                    order.extend(self.order_by_exposure(&eps, exposure));
                }
                order
            }
            ShuffleMode::Off => {
                let ordered = self.chronological_episode_indices();
                match self.current_index {
                    Some(current) if ordered.contains(&current) => {
                        let pos = ordered.iter().position(|&i| i == current).unwrap();
                        // Upcoming begins after current and wraps around.
                        ordered[pos + 1..]
                            .iter()
                            .chain(ordered[..pos].iter())
                            .copied()
                            .collect()
                    }
                    _ => ordered,
                }
            }
        };

        // The current episode never appears in its own upcoming queue.
        self.play_queue = order
            .into_iter()
            .filter(|&i| Some(i) != self.current_index)
            .collect();
        debug!(
            "Scheduler: rebuilt queue ({} upcoming, mode {})",
            self.play_queue.len(),
            self.shuffle_mode.name()
        );
    }

    /// Changes the shuffle mode and rebuilds the queue. Playback continues
    /// uninterrupted: `current_index` is never mutated here.
    pub fn set_shuffle_mode(&mut self, mode: ShuffleMode, exposure: &ExposureStore) {
        self.shuffle_mode = mode;
        self.rebuild_queue(exposure);
    }

    // --- Sequencing ---------------------------------------------------------

    /// The next playlist index to play, or `None` at the end of material.
    pub fn get_next_index(&mut self, exposure: &ExposureStore) -> Option<usize> {
        if self.items.is_empty() {
            return None;
        }

        if let Some(current) = self.current_index {
            if !self.is_episode_index(current) {
                // Non-episode items advance linearly; chains of injections
                // are allowed.
                let next = current + 1;
                if next < self.items.len() && !self.is_episode_index(next) {
                    return Some(next);
                }
                // Injections done; honor a pending multipart override.
                if let Some(forced) = self.take_forced_index() {
                    return Some(forced);
                }
                if next < self.items.len() {
                    return Some(next);
                }
                return None;
            }

            // Current is an episode. If an injection follows, play it next.
            let next = current + 1;
            if next < self.items.len() && !self.is_episode_index(next) {
                // Remember part 2 now so the injection doesn't lose it.
                if self.shuffle_mode.is_shuffled() {
                    let part1 = self
                        .episode_path_for_index(current)
                        .is_some_and(Self::is_part1_episode);
                    if part1 && self.is_koth_playlist() {
                        if let Some(forced) = self.next_chronological_episode_index_after(current)
                        {
                            self.forced_next_episode_index = Some(forced);
                        }
                    }
                }
                return Some(next);
            }

            // Multipart rule: "(1)" episodes force the chronological next
            // once, then shuffle resumes.
            if self.shuffle_mode.is_shuffled() && self.forced_next_episode_index.is_none() {
                let part1 = self
                    .episode_path_for_index(current)
                    .is_some_and(Self::is_part1_episode);
                if part1 && self.is_koth_playlist() {
                    if let Some(forced) = self.next_chronological_episode_index_after(current) {
                        if forced != current {
                            self.play_queue.retain(|&i| i != forced);
                            return Some(forced);
                        }
                    }
                }
            }
        }

        if let Some(forced) = self.take_forced_index() {
            return Some(forced);
        }

        if self.play_queue.is_empty() {
            self.rebuild_queue(exposure);
        }
        if self.play_queue.is_empty() {
            return None;
        }
        Some(self.play_queue.remove(0))
    }

    fn take_forced_index(&mut self) -> Option<usize> {
        let forced = self.forced_next_episode_index.take()?;
        self.play_queue.retain(|&i| i != forced);
        if forced < self.items.len() {
            Some(forced)
        } else {
            None
        }
    }

    // --- Manual navigation --------------------------------------------------

    /// Jumps straight to the next episode, bypassing the bump gate: forward
    /// history first, else the queue (injections are skipped entirely).
    pub fn skip_to_next_episode(&mut self, exposure: &ExposureStore) -> Option<usize> {
        // Consume forward history when the user had stepped back.
        while let Some(pos) = self.playback_history_pos {
            if pos + 1 >= self.playback_history.len() {
                break;
            }
            let candidate = self.playback_history[pos + 1];
            self.playback_history_pos = Some(pos + 1);
            if self.is_episode_index(candidate) {
                return Some(candidate);
            }
        }

        if let Some(forced) = self.take_forced_index() {
            return Some(forced);
        }
        if self.play_queue.is_empty() {
            self.rebuild_queue(exposure);
        }
        if self.play_queue.is_empty() {
            return None;
        }
        Some(self.play_queue.remove(0))
    }

    /// "Previous" semantics: restart the current episode when it has played
    /// for more than a few seconds, else step back through history (episodes
    /// only), else fall back to the chronological previous episode.
    pub fn skip_to_previous_episode(&mut self, time_pos_s: f64) -> PreviousAction {
        if time_pos_s > PREVIOUS_RESTART_THRESHOLD_S {
            return PreviousAction::SeekToStart;
        }

        // Step back through playback history, skipping injections.
        while let Some(pos) = self.playback_history_pos {
            if pos == 0 {
                break;
            }
            let candidate = self.playback_history[pos - 1];
            self.playback_history_pos = Some(pos - 1);
            if self.is_episode_index(candidate) {
                return PreviousAction::Play(candidate);
            }
        }

        // Chronological fallback.
        if let Some(current) = self.current_index {
            let ordered = self.chronological_episode_indices();
            if let Some(pos) = ordered.iter().position(|&i| i == current) {
                if pos > 0 {
                    return PreviousAction::Play(ordered[pos - 1]);
                }
            }
        }
        PreviousAction::None
    }

    // --- History ------------------------------------------------------------

    /// Records a successful playback start. Stepping back then playing
    /// something new truncates the abandoned "future".
    pub fn record_playback_index(&mut self, index: usize) {
        if index >= self.items.len() {
            return;
        }
        if let Some(pos) = self.playback_history_pos {
            if pos + 1 < self.playback_history.len() {
                self.playback_history.truncate(pos + 1);
            }
        }
        if self.playback_history.last() != Some(&index) {
            self.playback_history.push(index);
        }
        if self.playback_history.len() > PLAYBACK_HISTORY_CAP {
            let extra = self.playback_history.len() - PLAYBACK_HISTORY_CAP;
            self.playback_history.drain(..extra);
        }
        self.playback_history_pos = Some(self.playback_history.len() - 1);
    }

    pub fn playback_history(&self) -> &[usize] {
        &self.playback_history
    }

    // --- Exposure hooks -----------------------------------------------------

    /// Marks an episode as started: applies factor-scaled exposure, tracks
    /// history, and arms the skip-penalty guard for this play-start.
    pub fn mark_episode_started(
        &mut self,
        index: usize,
        sleep_timer_on: Option<bool>,
        exposure: &mut ExposureStore,
    ) {
        if !self.is_episode_index(index) {
            return;
        }
        if let Some(active) = sleep_timer_on {
            exposure.set_sleep_timer_active(active);
        }

        if let Some(path) = self.episode_path_for_index(index) {
            let key = PathKey::new(path);
            let factor = self.effective_episode_factor(path);
            exposure.register_episode_play(&key, factor);
        }

        self.play_start_seq += 1;
        self.last_play_start = Some(PlayStart {
            index,
            token: self.play_start_seq,
            penalized: false,
        });

        self.episode_history.push(index);
        if self.episode_history.len() > EPISODE_HISTORY_CAP {
            let extra = self.episode_history.len() - EPISODE_HISTORY_CAP;
            self.episode_history.drain(..extra);
        }
    }

    /// Applies the skip penalty for a cut-off episode. Idempotent per
    /// play-start: a second call for the same start is a no-op.
    pub fn apply_episode_skip_penalty(
        &mut self,
        index: usize,
        points: f64,
        exposure: &mut ExposureStore,
    ) -> f64 {
        if !self.is_episode_index(index) {
            return 0.0;
        }
        let Some(start) = &mut self.last_play_start else {
            return 0.0;
        };
        if start.index != index || start.penalized {
            return 0.0;
        }
        start.penalized = true;
        let token = start.token;
        let Some(path) = self.episode_path_for_index(index) else {
            return 0.0;
        };
        let key = PathKey::new(path);
        let factor = self.effective_episode_factor(path);
        let delta = exposure.apply_episode_skip_penalty(&key, points, factor);
        debug!("Scheduler: skip penalty {delta} for start #{token} at index {index}");
        delta
    }

    /// Applies bump exposure for a consumed bump.
    pub fn note_bump_played(&mut self, bump: &CompleteBump, exposure: &mut ExposureStore) {
        exposure.register_bump_play(bump);
    }

    // --- Generation ---------------------------------------------------------

    /// Builds a playlist from an episode pool, optionally injecting one
    /// interlude (interstitial or bump, random among enabled kinds) into
    /// each gap between episodes.
    pub fn generate_playlist(
        &mut self,
        episode_pool: &[PathBuf],
        interstitials: &[PathBuf],
        inject_interstitials: bool,
        inject_bumps: bool,
        composer: &mut BumpComposer,
        library: &BumpLibrary,
        exposure: &mut ExposureStore,
    ) -> usize {
        let mut items: Vec<PlaylistItem> = Vec::new();
        for (i, episode) in episode_pool.iter().enumerate() {
            items.push(PlaylistItem::Video(episode.clone()));
            if i + 1 >= episode_pool.len() {
                continue;
            }
            let mut kinds: Vec<u8> = Vec::new();
            if inject_interstitials && !interstitials.is_empty() {
                kinds.push(0);
            }
            if inject_bumps && !library.scripts.is_empty() {
                kinds.push(1);
            }
            if kinds.is_empty() {
                continue;
            }
            let kind = kinds[self.rng.random_range(0..kinds.len())];
            if kind == 0 {
                let pick = self.rng.random_range(0..interstitials.len());
                items.push(PlaylistItem::Interstitial(interstitials[pick].clone()));
            } else if let Some(bump) = composer.pop_bump(library, exposure) {
                items.push(PlaylistItem::Bump(bump));
            }
        }
        let count = items.len();
        self.set_playlist(items, exposure);
        info!(
            "Scheduler: generated playlist with {} items from {} episodes",
            count,
            episode_pool.len()
        );
        count
    }
}

/// Fisher-Yates over a bucket.
fn shuffle(indices: &mut [usize], rng: &mut StdRng) {
    for i in (1..indices.len()).rev() {
        let j = rng.random_range(0..=i);
        indices.swap(i, j);
    }
}

/// First `season`/`s` + optional separator + 1-2 digit run in a string.
fn season_number_in(part: &str) -> Option<u32> {
    let lower = part.to_lowercase();
    let bytes = lower.as_bytes();
    for start in 0..bytes.len() {
        if bytes[start] != b's' {
            continue;
        }
        // Prefer the long spelling at this position.
        let after = if lower[start..].starts_with("season") {
            start + "season".len()
        } else {
            start + 1
        };
        let mut at = after;
        if at < bytes.len() && matches!(bytes[at], b' ' | b'_' | b'-') {
            at += 1;
        }
        let digits_end = lower[at..]
            .char_indices()
            .take_while(|(offset, c)| *offset < 2 && c.is_ascii_digit())
            .count();
        if digits_end == 0 {
            continue;
        }
        if let Ok(number) = lower[at..at + digits_end].parse::<u32>() {
            return Some(number);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposure::ExposureStore;

    fn video(path: &str) -> PlaylistItem {
        PlaylistItem::Video(PathBuf::from(path))
    }

    fn interstitial(path: &str) -> PlaylistItem {
        PlaylistItem::Interstitial(PathBuf::from(path))
    }

    fn scheduler_with(items: Vec<PlaylistItem>) -> (PlaylistScheduler, ExposureStore) {
        let mut exposure = ExposureStore::in_memory();
        let mut scheduler = PlaylistScheduler::with_seed([11u8; 32]);
        scheduler.set_playlist(items, &mut exposure);
        (scheduler, exposure)
    }

    #[test]
    fn season_number_parsing() {
        assert_eq!(
            PlaylistScheduler::season_number_from_path(Path::new("/tv/Show/Season 2/e1.mkv")),
            2
        );
        assert_eq!(
            PlaylistScheduler::season_number_from_path(Path::new("/tv/Show/season_10/e1.mkv")),
            10
        );
        assert_eq!(
            PlaylistScheduler::season_number_from_path(Path::new("/tv/Show/S3/e1.mkv")),
            3
        );
        assert_eq!(
            PlaylistScheduler::season_number_from_path(Path::new("/tv/Show/extras/e1.mkv")),
            0
        );
    }

    #[test]
    fn season_bucket_keys_include_show_and_bare_forms() {
        let keys =
            PlaylistScheduler::season_bucket_keys(Path::new("/tv/King Show/Season 2/e1.mkv"));
        assert_eq!(
            keys,
            vec!["King Show|season:2".to_string(), "season:2".to_string()]
        );
    }

    #[test]
    fn off_mode_rotates_chronologically_after_current() {
        let (mut scheduler, exposure) = scheduler_with(vec![
            video("/tv/show/s1e1.mkv"),
            video("/tv/show/s1e2.mkv"),
            video("/tv/show/s1e10.mkv"),
        ]);
        scheduler.set_current_index(Some(1));
        scheduler.rebuild_queue(&exposure);
        // Natural sort: e2 -> e10 -> (wrap) e1.
        assert_eq!(scheduler.play_queue(), &[2, 0]);
    }

    #[test]
    fn standard_mode_orders_low_exposure_first() {
        let (mut scheduler, mut exposure) = scheduler_with(vec![
            video("/tv/show/a.mkv"),
            video("/tv/show/b.mkv"),
            video("/tv/show/c.mkv"),
        ]);
        // Scenario: exposure {a: 0, b: 100, c: 0}.
        exposure.register_episode_play(&PathKey::from_str_path("/tv/show/b.mkv"), 1.0);
        scheduler.set_shuffle_mode(ShuffleMode::Standard, &exposure);
        let queue = scheduler.play_queue().to_vec();
        assert_eq!(queue.len(), 3);
        let b_pos = queue.iter().position(|&i| i == 1).unwrap();
        assert_eq!(b_pos, 2, "the watched episode must come last: {queue:?}");
    }

    #[test]
    fn season_mode_groups_whole_seasons() {
        let (mut scheduler, mut exposure) = scheduler_with(vec![
            video("/tv/show/Season 1/e1.mkv"),
            video("/tv/show/Season 2/e1.mkv"),
            video("/tv/show/Season 1/e2.mkv"),
            video("/tv/show/Season 2/e2.mkv"),
        ]);
        // Season 1 has been watched; season 2 must lead.
        exposure.register_episode_play(&PathKey::from_str_path("/tv/show/Season 1/e1.mkv"), 1.0);
        exposure.register_episode_play(&PathKey::from_str_path("/tv/show/Season 1/e2.mkv"), 1.0);
        scheduler.set_shuffle_mode(ShuffleMode::Season, &exposure);
        let queue = scheduler.play_queue().to_vec();
        let seasons: Vec<u32> = queue
            .iter()
            .map(|&i| {
                PlaylistScheduler::season_number_from_path(
                    scheduler.episode_path_for_index(i).unwrap(),
                )
            })
            .collect();
        assert_eq!(seasons, vec![2, 2, 1, 1]);
    }

    #[test]
    fn offsets_push_episodes_later() {
        let (mut scheduler, exposure) = scheduler_with(vec![
            video("/tv/show/a.mkv"),
            video("/tv/show/b.mkv"),
        ]);
        let data = crate::playlist::frequency::FrequencySettingsData {
            episode_offsets: [("/tv/show/a.mkv".to_string(), 500.0)].into(),
            ..Default::default()
        };
        scheduler.frequency_mut().apply(&data);
        scheduler.set_shuffle_mode(ShuffleMode::Standard, &exposure);
        assert_eq!(scheduler.play_queue(), &[1, 0]);
    }

    #[test]
    fn factors_defer_via_projected_delta() {
        let (mut scheduler, exposure) = scheduler_with(vec![
            video("/tv/show/a.mkv"),
            video("/tv/show/b.mkv"),
        ]);
        let data = crate::playlist::frequency::FrequencySettingsData {
            episode_factors: [("/tv/show/a.mkv".to_string(), 3.0)].into(),
            ..Default::default()
        };
        scheduler.frequency_mut().apply(&data);
        // a projects 300, b projects 100; b leads even with zero exposure.
        scheduler.set_shuffle_mode(ShuffleMode::Standard, &exposure);
        assert_eq!(scheduler.play_queue(), &[1, 0]);
    }

    #[test]
    fn set_shuffle_mode_keeps_current_index() {
        let (mut scheduler, exposure) = scheduler_with(vec![
            video("/tv/show/a.mkv"),
            video("/tv/show/b.mkv"),
            video("/tv/show/c.mkv"),
        ]);
        scheduler.set_current_index(Some(2));
        scheduler.set_shuffle_mode(ShuffleMode::Standard, &exposure);
        assert_eq!(scheduler.current_index(), Some(2));
        scheduler.set_shuffle_mode(ShuffleMode::Off, &exposure);
        assert_eq!(scheduler.current_index(), Some(2));
        // The current episode never queues behind itself.
        assert!(!scheduler.play_queue().contains(&2));
    }

    #[test]
    fn non_episode_items_advance_linearly() {
        let (mut scheduler, exposure) = scheduler_with(vec![
            video("/tv/show/a.mkv"),
            interstitial("/int/x.mp4"),
            interstitial("/int/y.mp4"),
            video("/tv/show/b.mkv"),
        ]);
        scheduler.set_current_index(Some(1));
        // Injection chains play through.
        assert_eq!(scheduler.get_next_index(&exposure), Some(2));
        scheduler.set_current_index(Some(2));
        assert_eq!(scheduler.get_next_index(&exposure), Some(3));
    }

    #[test]
    fn episode_followed_by_injection_plays_injection() {
        let (mut scheduler, exposure) = scheduler_with(vec![
            video("/tv/show/a.mkv"),
            interstitial("/int/x.mp4"),
            video("/tv/show/b.mkv"),
        ]);
        scheduler.set_current_index(Some(0));
        assert_eq!(scheduler.get_next_index(&exposure), Some(1));
    }

    #[test]
    fn koth_part1_forces_part2_in_shuffle() {
        let (mut scheduler, exposure) = scheduler_with(vec![
            video("/tv/King of the Hill/Season 1/e01 part (1).mkv"),
            video("/tv/King of the Hill/Season 1/e01 part (2).mkv"),
            video("/tv/King of the Hill/Season 1/e05.mkv"),
            video("/tv/King of the Hill/Season 1/e06.mkv"),
        ]);
        scheduler.set_shuffle_mode(ShuffleMode::Standard, &exposure);
        scheduler.set_current_index(Some(0));
        let next = scheduler.get_next_index(&exposure);
        assert_eq!(next, Some(1), "part (2) must follow part (1)");
    }

    #[test]
    fn koth_part1_forces_part2_across_injection() {
        // Scenario: part (1) -> interstitial -> part (2), shuffled.
        let (mut scheduler, exposure) = scheduler_with(vec![
            video("/tv/King of the Hill/Season 1/e01 part (1).mkv"),
            interstitial("/int/x.mp4"),
            video("/tv/King of the Hill/Season 1/e01 part (2).mkv"),
            video("/tv/King of the Hill/Season 1/e05.mkv"),
        ]);
        scheduler.set_shuffle_mode(ShuffleMode::Standard, &exposure);
        scheduler.set_current_index(Some(0));
        let injected = scheduler.get_next_index(&exposure);
        assert_eq!(injected, Some(1), "the injection still plays first");
        scheduler.set_current_index(Some(1));
        let resumed = scheduler.get_next_index(&exposure);
        assert_eq!(resumed, Some(2), "part (2) resumes after the injection");
    }

    #[test]
    fn non_koth_playlists_ignore_part_markers() {
        let (mut scheduler, exposure) = scheduler_with(vec![
            video("/tv/Other Show/e01 (1).mkv"),
            video("/tv/Other Show/e01 (2).mkv"),
            video("/tv/Other Show/e05.mkv"),
        ]);
        scheduler.set_shuffle_mode(ShuffleMode::Standard, &exposure);
        scheduler.set_current_index(Some(0));
        // Whatever comes next comes from the queue, not a forced index.
        let next = scheduler.get_next_index(&exposure).unwrap();
        assert!(scheduler.forced_next_episode_index.is_none());
        assert!(next < 3);
    }

    #[test]
    fn queue_rebuilds_when_exhausted() {
        let (mut scheduler, exposure) = scheduler_with(vec![
            video("/tv/show/a.mkv"),
            video("/tv/show/b.mkv"),
        ]);
        scheduler.set_current_index(Some(0));
        let first = scheduler.get_next_index(&exposure).unwrap();
        scheduler.set_current_index(Some(first));
        // Queue is now empty; the next call rebuilds instead of ending.
        let second = scheduler.get_next_index(&exposure);
        assert!(second.is_some());
    }

    #[test]
    fn record_playback_truncates_abandoned_future() {
        let (mut scheduler, _exposure) = scheduler_with(vec![
            video("/tv/show/a.mkv"),
            video("/tv/show/b.mkv"),
            video("/tv/show/c.mkv"),
        ]);
        scheduler.record_playback_index(0);
        scheduler.record_playback_index(1);
        scheduler.record_playback_index(2);
        // Step back twice, then play something new.
        scheduler.set_current_index(Some(2));
        assert_eq!(scheduler.skip_to_previous_episode(0.0), PreviousAction::Play(1));
        assert_eq!(scheduler.skip_to_previous_episode(0.0), PreviousAction::Play(0));
        scheduler.record_playback_index(1);
        assert_eq!(scheduler.playback_history(), &[0, 1]);
    }

    #[test]
    fn previous_restarts_when_past_threshold() {
        let (mut scheduler, _exposure) = scheduler_with(vec![video("/tv/show/a.mkv")]);
        scheduler.set_current_index(Some(0));
        assert_eq!(
            scheduler.skip_to_previous_episode(10.0),
            PreviousAction::SeekToStart
        );
    }

    #[test]
    fn double_previous_reaches_prior_episode() {
        // First press (past threshold) restarts; second steps history.
        let (mut scheduler, _exposure) = scheduler_with(vec![
            video("/tv/show/a.mkv"),
            video("/tv/show/b.mkv"),
        ]);
        scheduler.record_playback_index(0);
        scheduler.record_playback_index(1);
        scheduler.set_current_index(Some(1));
        assert_eq!(
            scheduler.skip_to_previous_episode(5.0),
            PreviousAction::SeekToStart
        );
        assert_eq!(
            scheduler.skip_to_previous_episode(0.0),
            PreviousAction::Play(0)
        );
    }

    #[test]
    fn previous_skips_injections_in_history() {
        let (mut scheduler, _exposure) = scheduler_with(vec![
            video("/tv/show/a.mkv"),
            interstitial("/int/x.mp4"),
            video("/tv/show/b.mkv"),
        ]);
        scheduler.record_playback_index(0);
        scheduler.record_playback_index(1);
        scheduler.record_playback_index(2);
        scheduler.set_current_index(Some(2));
        assert_eq!(
            scheduler.skip_to_previous_episode(0.0),
            PreviousAction::Play(0)
        );
    }

    #[test]
    fn previous_falls_back_to_chronological() {
        let (mut scheduler, _exposure) = scheduler_with(vec![
            video("/tv/show/e1.mkv"),
            video("/tv/show/e2.mkv"),
        ]);
        scheduler.set_current_index(Some(1));
        assert_eq!(
            scheduler.skip_to_previous_episode(0.0),
            PreviousAction::Play(0)
        );
    }

    #[test]
    fn skip_to_next_prefers_forward_history() {
        let (mut scheduler, exposure) = scheduler_with(vec![
            video("/tv/show/a.mkv"),
            video("/tv/show/b.mkv"),
            video("/tv/show/c.mkv"),
        ]);
        scheduler.record_playback_index(0);
        scheduler.record_playback_index(1);
        scheduler.set_current_index(Some(1));
        scheduler.skip_to_previous_episode(0.0);
        assert_eq!(scheduler.skip_to_next_episode(&exposure), Some(1));
    }

    #[test]
    fn skip_penalty_is_idempotent_per_start() {
        let (mut scheduler, mut exposure) = scheduler_with(vec![video("/tv/show/a.mkv")]);
        scheduler.mark_episode_started(0, None, &mut exposure);
        let first = scheduler.apply_episode_skip_penalty(0, 5.0, &mut exposure);
        assert_eq!(first, -5.0);
        let second = scheduler.apply_episode_skip_penalty(0, 5.0, &mut exposure);
        assert_eq!(second, 0.0);
        // A fresh start re-arms the guard.
        scheduler.mark_episode_started(0, None, &mut exposure);
        let third = scheduler.apply_episode_skip_penalty(0, 5.0, &mut exposure);
        assert_eq!(third, -5.0);
    }

    #[test]
    fn mark_episode_started_applies_factor_scaled_exposure() {
        let (mut scheduler, mut exposure) = scheduler_with(vec![video("/tv/show/a.mkv")]);
        let data = crate::playlist::frequency::FrequencySettingsData {
            episode_factors: [("/tv/show/a.mkv".to_string(), 2.0)].into(),
            ..Default::default()
        };
        scheduler.frequency_mut().apply(&data);
        scheduler.mark_episode_started(0, None, &mut exposure);
        assert_eq!(
            exposure.episode_score(&PathKey::from_str_path("/tv/show/a.mkv")),
            200.0
        );
    }

    #[test]
    fn generate_playlist_injects_one_per_gap() {
        let mut exposure = ExposureStore::in_memory();
        let mut scheduler = PlaylistScheduler::with_seed([5u8; 32]);
        let mut composer = BumpComposer::with_seed(&crate::config::Config::default(), [5u8; 32]);
        let library = BumpLibrary::default();
        let episodes: Vec<PathBuf> = (0..4)
            .map(|i| PathBuf::from(format!("/tv/show/e{i}.mkv")))
            .collect();
        let interstitials = vec![PathBuf::from("/int/x.mp4")];
        scheduler.generate_playlist(
            &episodes,
            &interstitials,
            true,
            false,
            &mut composer,
            &library,
            &mut exposure,
        );
        // 4 episodes + 3 gaps.
        assert_eq!(scheduler.len(), 7);
        let kinds: Vec<bool> = scheduler.items().iter().map(PlaylistItem::is_episode).collect();
        assert_eq!(kinds, vec![true, false, true, false, true, false, true]);
    }
}
