//! Resume state capture/restore and missing-media recovery.
//!
//! Resume state survives restarts and drive unplugs: it records the playlist,
//! the upcoming episode queue (as normalized keys so playlist reloads don't
//! invalidate it), and the playback position. Restore is best-effort — keys
//! that no longer match simply drop out. The recovery monitor watches for
//! stalled playback of vanished media and schedules re-apply polls; the
//! player driver stays external, so both pieces are driven by injected
//! clocks and observations.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::paths::PathKey;
use crate::playlist::playlist_io::{self, PlaylistFile, PlaylistItemData};
use crate::playlist::scheduler::{PlaylistItem, PlaylistScheduler};

/// No `time_pos` advance for this long (while playing) counts as a stall.
const STALL_WINDOW: Duration = Duration::from_millis(2500);
/// Recovery re-checks the missing file on this cadence.
const RECOVERY_POLL: Duration = Duration::from_secs(2);
/// Recovery gives up after this long.
const RECOVERY_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// Persisted playback snapshot.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct ResumeState {
    #[serde(default)]
    pub shuffle_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_file: Option<String>,
    /// Playlist items with bump entries filtered out.
    #[serde(default)]
    pub playlist_items: Vec<PlaylistItemData>,
    /// Upcoming episode queue as normalized path keys.
    #[serde(default)]
    pub queue_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_episode_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_episode_path: Option<String>,
    #[serde(default)]
    pub position_s: f64,
    #[serde(default)]
    pub duration_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_play_target: Option<String>,
}

/// What restore decided: play this index with the gate bypassed, seeking
/// slightly behind the captured position.
#[derive(Clone, Debug, PartialEq)]
pub struct RestorePlan {
    pub index: Option<usize>,
    pub seek_to_s: f64,
    pub bypass_bump_gate: bool,
}

/// Captures and restores playback snapshots, and arms auto-resume.
#[derive(Debug, Default)]
pub struct ResumeCoordinator {
    pending: Option<ResumeState>,
}

impl ResumeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the scheduler plus the player position.
    pub fn capture(
        scheduler: &PlaylistScheduler,
        playlist_file: Option<&Path>,
        position_s: f64,
        duration_s: f64,
        last_play_target: Option<&Path>,
    ) -> ResumeState {
        let playlist_items = scheduler
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

        let queue_keys = scheduler
            .play_queue()
            .iter()
            .filter_map(|&i| scheduler.episode_path_for_index(i))
            .map(|path| PathKey::new(path).as_str().to_string())
            .collect();

        let current_episode_path = scheduler
            .current_index()
            .and_then(|i| scheduler.episode_path_for_index(i))
            .map(|path| path.to_string_lossy().into_owned());
        let current_episode_key = scheduler
            .current_index()
            .and_then(|i| scheduler.episode_path_for_index(i))
            .map(|path| PathKey::new(path).as_str().to_string());

        ResumeState {
            shuffle_mode: scheduler.shuffle_mode().name().to_string(),
            playlist_file: playlist_file.map(|p| p.to_string_lossy().into_owned()),
            playlist_items,
            queue_keys,
            current_index: scheduler.current_index(),
            current_episode_key,
            current_episode_path,
            position_s,
            duration_s,
            last_play_target: last_play_target.map(|p| p.to_string_lossy().into_owned()),
        }
    }

    /// Rebuilds scheduler state from a snapshot and plans the restart play.
    pub fn restore(
        state: &ResumeState,
        scheduler: &mut PlaylistScheduler,
        exposure: &mut crate::exposure::ExposureStore,
    ) -> RestorePlan {
        // Prefer the saved playlist file; fall back to the inline items.
        let items_data: Vec<PlaylistItemData> = state
            .playlist_file
            .as_deref()
            .and_then(|file| playlist_io::load_playlist(Path::new(file)).ok())
            .map(|playlist: PlaylistFile| playlist.playlist)
            .unwrap_or_else(|| state.playlist_items.clone());

        let items: Vec<PlaylistItem> = items_data
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
        scheduler.set_shuffle_mode(
            crate::playlist::scheduler::ShuffleMode::from_name(&state.shuffle_mode),
            exposure,
        );

        // Queue keys -> indices, best effort.
        let mut key_to_index: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        for (i, item) in scheduler.items().iter().enumerate() {
            if !item.is_episode() {
                continue;
            }
            if let Some(path) = item.path() {
                key_to_index
                    .entry(PathKey::new(path).as_str().to_string())
                    .or_insert(i);
            }
        }
        let queue: Vec<usize> = state
            .queue_keys
            .iter()
            .filter_map(|key| key_to_index.get(key).copied())
            .collect();
        if !queue.is_empty() {
            scheduler.set_play_queue(queue);
        }

        // Choose the index: episode key lookup wins over the raw index.
        let index = state
            .current_episode_key
            .as_deref()
            .and_then(|key| key_to_index.get(key).copied())
            .or(state.current_index)
            .filter(|&i| i < scheduler.len());
        scheduler.set_current_index(index);

        info!(
            "Resume: restored {} items, queue {}, index {:?}",
            scheduler.len(),
            scheduler.play_queue().len(),
            index
        );
        RestorePlan {
            index,
            seek_to_s: (state.position_s - 3.0).max(0.0),
            bypass_bump_gate: true,
        }
    }

    /// Arms auto-resume when the loaded playlist matches the saved one.
    pub fn arm_for_playlist(&mut self, state: ResumeState, loaded_playlist: &Path) {
        let matches = state
            .playlist_file
            .as_deref()
            .is_some_and(|saved| PathKey::from_str_path(saved) == PathKey::new(loaded_playlist));
        if matches {
            info!("Resume: armed for {}", loaded_playlist.display());
            self.pending = Some(state);
        } else {
            self.pending = None;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Auto-resume fires only when playback starts at the predicted default
    /// start index; any other start discards the pending state.
    pub fn on_playback_start(
        &mut self,
        started_index: usize,
        predicted_default_index: Option<usize>,
    ) -> Option<ResumeState> {
        let pending = self.pending.take()?;
        if predicted_default_index == Some(started_index) {
            Some(pending)
        } else {
            info!("Resume: discarded (manual start at {started_index})");
            None
        }
    }
}

/// Recovery monitor phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecoveryPhase {
    Watching,
    Recovering,
}

/// Outcome of a recovery poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryStatus {
    /// Keep polling.
    Waiting,
    /// The file is back; re-apply resume state now.
    Recovered,
    /// Deadline passed; stop trying.
    GaveUp,
}

/// Watches playback progress for vanished-media stalls and paces the
/// reappearance polls. Pure state machine; the caller supplies the clock and
/// the on-disk observations.
#[derive(Debug)]
pub struct RecoveryMonitor {
    phase: RecoveryPhase,
    last_advance: Option<Instant>,
    last_time_pos: Option<f64>,
    recovery_started: Option<Instant>,
    next_poll: Option<Instant>,
}

impl Default for RecoveryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryMonitor {
    pub fn new() -> Self {
        Self {
            phase: RecoveryPhase::Watching,
            last_advance: None,
            last_time_pos: None,
            recovery_started: None,
            next_poll: None,
        }
    }

    pub fn is_recovering(&self) -> bool {
        self.phase == RecoveryPhase::Recovering
    }

    /// Feeds a playback observation. Returns `true` when progress has
    /// stalled long enough that the caller should check the target on disk
    /// (and enter recovery if it vanished).
    pub fn observe_progress(
        &mut self,
        now: Instant,
        time_pos_s: Option<f64>,
        paused: bool,
        idle: bool,
    ) -> bool {
        if self.phase == RecoveryPhase::Recovering {
            return false;
        }
        if paused || idle {
            // Paused/idle time doesn't count toward a stall.
            self.last_advance = Some(now);
            return false;
        }
        let advanced = match (self.last_time_pos, time_pos_s) {
            (Some(previous), Some(current)) => current > previous + f64::EPSILON,
            (None, Some(_)) => true,
            _ => false,
        };
        if time_pos_s.is_some() {
            self.last_time_pos = time_pos_s;
        }
        if advanced || self.last_advance.is_none() {
            self.last_advance = Some(now);
            return false;
        }
        self.last_advance
            .is_some_and(|last| now.duration_since(last) >= STALL_WINDOW)
    }

    /// Enters recovery mode: the caller has stopped the player and persisted
    /// state with force.
    pub fn begin_recovery(&mut self, now: Instant) {
        warn!("Recovery: media target missing, polling for reappearance");
        self.phase = RecoveryPhase::Recovering;
        self.recovery_started = Some(now);
        self.next_poll = Some(now + RECOVERY_POLL);
    }

    /// Drives the poll loop. Call whenever the timer fires; the monitor
    /// paces itself to one check every 2 seconds for up to 10 minutes.
    pub fn poll(&mut self, now: Instant, target_exists: bool) -> RecoveryStatus {
        if self.phase != RecoveryPhase::Recovering {
            return RecoveryStatus::Waiting;
        }
        if target_exists {
            info!("Recovery: media target is back");
            self.reset();
            return RecoveryStatus::Recovered;
        }
        if self
            .recovery_started
            .is_some_and(|started| now.duration_since(started) >= RECOVERY_DEADLINE)
        {
            warn!("Recovery: giving up after {RECOVERY_DEADLINE:?}");
            self.reset();
            return RecoveryStatus::GaveUp;
        }
        if self.next_poll.is_none_or(|due| now >= due) {
            self.next_poll = Some(now + RECOVERY_POLL);
        }
        RecoveryStatus::Waiting
    }

    /// Cancels recovery (user-initiated stop, successful restore).
    pub fn reset(&mut self) {
        self.phase = RecoveryPhase::Watching;
        self.last_advance = None;
        self.last_time_pos = None;
        self.recovery_started = None;
        self.next_poll = None;
    }

    /// When the next poll is due, if recovering.
    pub fn next_poll_due(&self) -> Option<Instant> {
        self.next_poll
    }
}
