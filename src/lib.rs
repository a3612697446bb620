//! Bump/episode scheduling core for an ambient TV player.
//!
//! This crate composes an evening of playback from three asset pools:
//! episodes, interlude videos, and short music-timed "bumps". It owns the
//! bump script timing model and music fitter, the exposure-weighted bump
//! queue composer, and the playlist scheduler with its shuffle modes and
//! resume/recovery state. Rendering, decoding, and the player process are
//! external collaborators.

pub mod bump;
pub mod config;
pub mod exposure;
pub mod paths;
pub mod playlist;
pub mod resume;

pub use bump::composer::{BumpComposer, CompleteBump, QueueRebuildStats};
pub use bump::library::{BumpLibrary, MusicEntry};
pub use bump::script::{Card, DurationMode, Script};
pub use bump::timing::ScriptTiming;
pub use config::Config;
pub use exposure::ExposureStore;
pub use paths::PathKey;
pub use playlist::frequency::FrequencySettings;
pub use playlist::scheduler::{PlaylistItem, PlaylistScheduler, ShuffleMode};
pub use resume::{RecoveryMonitor, ResumeCoordinator, ResumeState};
