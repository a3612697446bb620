//! Per-playlist frequency overrides for episodes and seasons.
//!
//! Offsets add to an episode's base exposure when ordering the queue, so a
//! positive offset pushes the episode later. Factors scale the projected
//! per-play delta, which both defers heavy episodes and makes their skip
//! penalty proportionally larger. Settings travel with the playlist JSON.

use std::collections::HashMap;

use crate::paths::PathKey;

/// Cleaned per-playlist offsets and factors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrequencySettings {
    pub episode_offsets: HashMap<PathKey, f64>,
    pub season_offsets: HashMap<String, f64>,
    pub episode_factors: HashMap<PathKey, f64>,
    pub season_factors: HashMap<String, f64>,
}

/// Raw serde model under the playlist JSON `frequency_settings` key. Legacy
/// spellings are accepted on load.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct FrequencySettingsData {
    #[serde(default, alias = "episode_min_exposure")]
    pub episode_offsets: HashMap<String, f64>,
    #[serde(default, alias = "season_min_exposure")]
    pub season_offsets: HashMap<String, f64>,
    #[serde(default, alias = "episode_exposure_factors")]
    pub episode_factors: HashMap<String, f64>,
    #[serde(default, alias = "season_exposure_factors")]
    pub season_factors: HashMap<String, f64>,
}

impl FrequencySettings {
    /// Replaces settings in bulk, cleaning as the UI dialog expects:
    /// offsets are clamped to >= 0 and dropped at zero; factors must be
    /// positive and different from the 1.0 default.
    pub fn apply(&mut self, data: &FrequencySettingsData) {
        self.episode_offsets = data
            .episode_offsets
            .iter()
            .filter(|(_, &v)| v > 0.0)
            .map(|(k, &v)| (PathKey::from_str_path(k), v))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        self.season_offsets = data
            .season_offsets
            .iter()
            .filter(|(k, &v)| !k.trim().is_empty() && v > 0.0)
            .map(|(k, &v)| (k.trim().to_string(), v))
            .collect();
        self.episode_factors = data
            .episode_factors
            .iter()
            .filter(|(_, &v)| v > 0.0 && (v - 1.0).abs() > 1e-9)
            .map(|(k, &v)| (PathKey::from_str_path(k), v))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        self.season_factors = data
            .season_factors
            .iter()
            .filter(|(k, &v)| !k.trim().is_empty() && v > 0.0 && (v - 1.0).abs() > 1e-9)
            .map(|(k, &v)| (k.trim().to_string(), v))
            .collect();
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Snapshot for saving back into playlist JSON.
    pub fn to_data(&self) -> FrequencySettingsData {
        FrequencySettingsData {
            episode_offsets: self
                .episode_offsets
                .iter()
                .map(|(k, &v)| (k.as_str().to_string(), v))
                .collect(),
            season_offsets: self.season_offsets.clone(),
            episode_factors: self
                .episode_factors
                .iter()
                .map(|(k, &v)| (k.as_str().to_string(), v))
                .collect(),
            season_factors: self.season_factors.clone(),
        }
    }

    /// Additive offset for an episode: its own offset plus every matching
    /// season key's offset. Never negative.
    pub fn effective_offset(&self, key: &PathKey, season_keys: &[String]) -> f64 {
        let mut offset = 0.0;
        for season_key in season_keys {
            offset += self.season_offsets.get(season_key).copied().unwrap_or(0.0);
        }
        offset += self.episode_offsets.get(key).copied().unwrap_or(0.0);
        offset.max(0.0)
    }

    /// Delta factor for an episode: episode override first, then season keys
    /// in priority order, else 1.0. Non-positive values fall back to 1.0.
    pub fn effective_factor(&self, key: &PathKey, season_keys: &[String]) -> f64 {
        let mut factor = self.episode_factors.get(key).copied();
        if factor.is_none() {
            for season_key in season_keys {
                if let Some(&value) = self.season_factors.get(season_key) {
                    factor = Some(value);
                    break;
                }
            }
        }
        match factor {
            Some(value) if value > 0.0 => value,
            _ => 1.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.episode_offsets.is_empty()
            && self.season_offsets.is_empty()
            && self.episode_factors.is_empty()
            && self.season_factors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_with(
        episode_offsets: &[(&str, f64)],
        episode_factors: &[(&str, f64)],
    ) -> FrequencySettingsData {
        FrequencySettingsData {
            episode_offsets: episode_offsets
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            episode_factors: episode_factors
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            ..FrequencySettingsData::default()
        }
    }

    #[test]
    fn apply_rejects_nonpositive_offsets_and_unit_factors() {
        let mut settings = FrequencySettings::default();
        settings.apply(&data_with(
            &[("/a.mkv", 50.0), ("/b.mkv", 0.0), ("/c.mkv", -5.0)],
            &[("/a.mkv", 2.0), ("/b.mkv", 1.0), ("/c.mkv", -1.0)],
        ));
        assert_eq!(settings.episode_offsets.len(), 1);
        assert_eq!(settings.episode_factors.len(), 1);
        assert_eq!(
            settings.episode_factors[&PathKey::from_str_path("/a.mkv")],
            2.0
        );
    }

    #[test]
    fn effective_offset_sums_episode_and_seasons() {
        let mut settings = FrequencySettings::default();
        let data = FrequencySettingsData {
            episode_offsets: [("/show/season 2/e1.mkv".to_string(), 10.0)].into(),
            season_offsets: [
                ("show|season:2".to_string(), 25.0),
                ("season:2".to_string(), 5.0),
            ]
            .into(),
            ..FrequencySettingsData::default()
        };
        settings.apply(&data);
        let key = PathKey::from_str_path("/show/season 2/e1.mkv");
        let season_keys = vec!["show|season:2".to_string(), "season:2".to_string()];
        assert_eq!(settings.effective_offset(&key, &season_keys), 40.0);
    }

    #[test]
    fn effective_factor_prefers_episode_over_season() {
        let mut settings = FrequencySettings::default();
        let data = FrequencySettingsData {
            episode_factors: [("/show/season 2/e1.mkv".to_string(), 3.0)].into(),
            season_factors: [("season:2".to_string(), 2.0)].into(),
            ..FrequencySettingsData::default()
        };
        settings.apply(&data);
        let key = PathKey::from_str_path("/show/season 2/e1.mkv");
        let season_keys = vec!["season:2".to_string()];
        assert_eq!(settings.effective_factor(&key, &season_keys), 3.0);
        let other = PathKey::from_str_path("/show/season 2/e2.mkv");
        assert_eq!(settings.effective_factor(&other, &season_keys), 2.0);
        let unrelated = PathKey::from_str_path("/show/season 3/e1.mkv");
        assert_eq!(settings.effective_factor(&unrelated, &[]), 1.0);
    }

    #[test]
    fn legacy_aliases_deserialize() {
        let json = r#"{
            "episode_min_exposure": {"/a.mkv": 12.0},
            "season_exposure_factors": {"season:1": 2.5}
        }"#;
        let data: FrequencySettingsData = serde_json::from_str(json).unwrap();
        assert_eq!(data.episode_offsets["/a.mkv"], 12.0);
        assert_eq!(data.season_factors["season:1"], 2.5);
    }

    #[test]
    fn round_trips_through_data() {
        let mut settings = FrequencySettings::default();
        settings.apply(&data_with(&[("/a.mkv", 7.5)], &[("/a.mkv", 0.5)]));
        let mut reloaded = FrequencySettings::default();
        reloaded.apply(&settings.to_data());
        assert_eq!(settings, reloaded);
    }
}
