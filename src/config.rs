//! Persistent tuning configuration model and defaults.

use std::path::Path;

use log::warn;

/// Root configuration persisted to `lullatv.toml`.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Card readability timing model.
    pub cards: CardTimingConfig,
    #[serde(default)]
    /// Music fitter behavior.
    pub fitter: FitterConfig,
    #[serde(default)]
    /// Bump queue composition.
    pub composer: ComposerConfig,
}

/// Readability model for auto-timed cards.
///
/// Duration is derived from character count:
/// `(base + chars * ms_per_char * ms_per_char_scale) * duration_scale`,
/// plus a single-line bonus, clamped to `[min_card_ms, max_card_ms]`.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct CardTimingConfig {
    #[serde(default = "default_base_card_ms")]
    pub base_card_ms: u32,
    #[serde(default = "default_ms_per_char")]
    pub ms_per_char: u32,
    #[serde(default = "default_ms_per_char_scale")]
    pub ms_per_char_scale: f64,
    #[serde(default = "default_duration_scale")]
    pub duration_scale: f64,
    #[serde(default = "default_one_line_bonus_ms")]
    pub one_line_bonus_ms: u32,
    #[serde(default = "default_min_card_ms")]
    pub min_card_ms: u32,
    #[serde(default = "default_max_card_ms")]
    pub max_card_ms: u32,
    #[serde(default = "default_estimate_scale")]
    pub estimate_scale: f64,
}

/// Music fit targets and the soft-clamp solver knobs.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct FitterConfig {
    /// Scripts are never stretched or compressed to targets beyond this cap,
    /// even when the chosen music runs longer.
    #[serde(default = "default_bump_target_cap_ms")]
    pub bump_target_cap_ms: u32,
    /// How far `estimated_ms` may exceed the music length and stay eligible.
    #[serde(default = "default_music_overage_tolerance")]
    pub music_overage_tolerance: f64,
    #[serde(default = "default_short_bump_seconds")]
    pub short_bump_seconds: f64,
    /// Acceptance window for the short-clip compression heuristic
    /// (a 15s target accepts estimates up to ~23s).
    #[serde(default = "default_short_bump_overage_tolerance")]
    pub short_bump_overage_tolerance: f64,
    /// Per-card floor as a fraction of the auto-timed base duration.
    #[serde(default = "default_min_scalable_fraction")]
    pub min_scalable_fraction: f64,
    /// Weight exponent: 0 equalizes reductions, 1 is proportional to the
    /// original duration, >1 exaggerates.
    #[serde(default = "default_normalization_exponent")]
    pub normalization_exponent: f64,
    /// Soft clamp strength for reduction saturation.
    #[serde(default = "default_soft_clamp_k")]
    pub soft_clamp_k: f64,
}

/// Queue composition and spacing.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ComposerConfig {
    /// The N most recently used items are spaced away from fresh picks.
    #[serde(default = "default_recent_spread_n")]
    pub recent_spread_n: usize,
    /// When any short-fit script exists, the first slots of a rebuilt queue
    /// only admit short-fit audio scripts.
    #[serde(default = "default_early_short_only_slots")]
    pub early_short_only_slots: usize,
    /// Target queue length; 0 builds as many complete bumps as feasible.
    #[serde(default)]
    pub bump_queue_size: usize,
}

impl Default for CardTimingConfig {
    fn default() -> Self {
        Self {
            base_card_ms: default_base_card_ms(),
            ms_per_char: default_ms_per_char(),
            ms_per_char_scale: default_ms_per_char_scale(),
            duration_scale: default_duration_scale(),
            one_line_bonus_ms: default_one_line_bonus_ms(),
            min_card_ms: default_min_card_ms(),
            max_card_ms: default_max_card_ms(),
            estimate_scale: default_estimate_scale(),
        }
    }
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            bump_target_cap_ms: default_bump_target_cap_ms(),
            music_overage_tolerance: default_music_overage_tolerance(),
            short_bump_seconds: default_short_bump_seconds(),
            short_bump_overage_tolerance: default_short_bump_overage_tolerance(),
            min_scalable_fraction: default_min_scalable_fraction(),
            normalization_exponent: default_normalization_exponent(),
            soft_clamp_k: default_soft_clamp_k(),
        }
    }
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            recent_spread_n: default_recent_spread_n(),
            early_short_only_slots: default_early_short_only_slots(),
            bump_queue_size: 0,
        }
    }
}

impl FitterConfig {
    /// Short-clip target in milliseconds.
    pub fn short_bump_target_ms(&self) -> u32 {
        (self.short_bump_seconds * 1000.0).round() as u32
    }
}

fn default_base_card_ms() -> u32 {
    550
}

fn default_ms_per_char() -> u32 {
    41
}

fn default_ms_per_char_scale() -> f64 {
    1.15
}

fn default_duration_scale() -> f64 {
    // +20% readability, then an additional +5%.
    1.26
}

fn default_one_line_bonus_ms() -> u32 {
    800
}

fn default_min_card_ms() -> u32 {
    900
}

fn default_max_card_ms() -> u32 {
    6000
}

fn default_estimate_scale() -> f64 {
    1.0
}

fn default_bump_target_cap_ms() -> u32 {
    29_000
}

fn default_music_overage_tolerance() -> f64 {
    0.20
}

fn default_short_bump_seconds() -> f64 {
    15.0
}

fn default_short_bump_overage_tolerance() -> f64 {
    // 23s max accepted estimate for a 15s target.
    (23.0 / 15.0) - 1.0
}

fn default_min_scalable_fraction() -> f64 {
    0.40
}

fn default_normalization_exponent() -> f64 {
    1.0
}

fn default_soft_clamp_k() -> f64 {
    4.0
}

fn default_recent_spread_n() -> usize {
    8
}

fn default_early_short_only_slots() -> usize {
    4
}

impl Config {
    /// Loads the tuning config from `path`, falling back to defaults when the
    /// file is missing or malformed.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => return Self::default(),
        };
        match toml::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    "Config: failed to parse {}: {}. Using defaults.",
                    path.display(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Writes the tuning config to `path`.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let serialized = toml::to_string_pretty(self)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serialized)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_match_reference_tuning() {
        let config = Config::default();
        assert_eq!(config.cards.base_card_ms, 550);
        assert_eq!(config.cards.ms_per_char, 41);
        assert_eq!(config.cards.min_card_ms, 900);
        assert_eq!(config.cards.max_card_ms, 6000);
        assert_eq!(config.fitter.bump_target_cap_ms, 29_000);
        assert_eq!(config.fitter.short_bump_target_ms(), 15_000);
        assert!((config.fitter.short_bump_overage_tolerance - (23.0 / 15.0 - 1.0)).abs() < 1e-12);
        assert_eq!(config.composer.recent_spread_n, 8);
        assert_eq!(config.composer.early_short_only_slots, 4);
        assert_eq!(config.composer.bump_queue_size, 0);
    }

    #[test]
    fn partial_toml_fills_missing_fields() {
        let parsed: Config = toml::from_str("[fitter]\nbump_target_cap_ms = 20000\n").unwrap();
        assert_eq!(parsed.fitter.bump_target_cap_ms, 20_000);
        assert!((parsed.fitter.soft_clamp_k - 4.0).abs() < 1e-12);
        assert_eq!(parsed.cards.base_card_ms, 550);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let config = Config::load(std::path::Path::new("/nonexistent/lullatv.toml"));
        assert_eq!(config.fitter.bump_target_cap_ms, 29_000);
    }
}
