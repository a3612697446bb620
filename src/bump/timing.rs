//! Script timing analysis and the music fitter.
//!
//! The analyzer splits a script's cards into fixed and scalable time; the
//! fitter compresses the scalable portion so the whole script lands exactly
//! on a music track's duration (capped at the bump target). Reductions are
//! distributed by a soft-clamped residual loop so long cards absorb more
//! compression without any card dropping below its floor.

use std::collections::HashMap;

use crate::bump::script::{Card, DurationMode, Script};
use crate::config::FitterConfig;

/// Fixed/scalable aggregates for a parsed script template.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScriptTiming {
    /// Pauses, abs-mode cards, and all delta adjustments.
    pub fixed_ms: u32,
    /// Sum of scalable baselines.
    pub scalable_orig_ms: u32,
    /// `fixed_ms + scalable_orig_ms`.
    pub estimated_ms: u32,
    /// Fixed time plus every scalable card at its floor.
    pub min_possible_ms: u32,
    pub scalable_cards: Vec<ScalableCard>,
}

/// One scalable card's handle into the fitter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScalableCard {
    pub idx: usize,
    /// Baseline duration.
    pub t: f64,
    /// Floor: `t * min_scalable_fraction`.
    pub t_min: f64,
    pub delta_ms: i32,
    pub mode: DurationMode,
}

/// Computes timing aggregates for a card list.
pub fn analyze_cards(cards: &[Card], config: &FitterConfig) -> ScriptTiming {
    if cards.is_empty() {
        return ScriptTiming::default();
    }

    let min_frac = config.min_scalable_fraction;
    let mut fixed_ms: i64 = 0;
    let mut scalable_orig_ms: i64 = 0;
    let mut min_scalable_ms: i64 = 0;
    let mut scalable_cards = Vec::new();

    for (i, card) in cards.iter().enumerate() {
        match card.mode() {
            DurationMode::Fixed | DurationMode::Abs => {
                fixed_ms += i64::from(card.duration_ms());
            }
            mode @ (DurationMode::Auto | DurationMode::Delta) => {
                let t = f64::from(card.base_duration_ms()).max(0.0);
                let t_min = t * min_frac;
                let delta_ms = card.delta_ms();
                // Deltas are fixed-time adjustments.
                fixed_ms += i64::from(delta_ms);
                scalable_orig_ms += t.round() as i64;
                min_scalable_ms += t_min.round() as i64;
                scalable_cards.push(ScalableCard {
                    idx: i,
                    t,
                    t_min,
                    delta_ms,
                    mode,
                });
            }
        }
    }

    let fixed_ms = fixed_ms.max(0) as u32;
    let scalable_orig_ms = scalable_orig_ms.max(0) as u32;
    let min_scalable_ms = min_scalable_ms.max(0) as u32;
    ScriptTiming {
        fixed_ms,
        scalable_orig_ms,
        estimated_ms: fixed_ms + scalable_orig_ms,
        min_possible_ms: fixed_ms + min_scalable_ms,
        scalable_cards,
    }
}

/// True when the script could fit *some* track under the target cap.
pub fn can_fit_any_track(timing: &ScriptTiming, config: &FitterConfig) -> bool {
    timing.fixed_ms <= config.bump_target_cap_ms
        && timing.min_possible_ms <= config.bump_target_cap_ms
}

/// Selection heuristic: the estimate may exceed the music length by the
/// overage tolerance, and the minimum must fit the capped target.
pub fn is_music_eligible(
    timing: &ScriptTiming,
    music_duration_ms: u32,
    config: &FitterConfig,
    overage_tolerance: Option<f64>,
) -> bool {
    if music_duration_ms == 0 {
        return false;
    }
    let eps = overage_tolerance.unwrap_or(config.music_overage_tolerance);
    if f64::from(timing.estimated_ms) > f64::from(music_duration_ms) * (1.0 + eps) {
        return false;
    }
    let target = music_duration_ms.min(config.bump_target_cap_ms);
    timing.min_possible_ms <= target
}

/// Stricter short-clip predicate: the short overage window must hold and the
/// fitter must actually produce a solution at the short target.
pub fn can_fit_short_clip(
    timing: &ScriptTiming,
    target_ms: u32,
    overage_tolerance: f64,
    config: &FitterConfig,
) -> bool {
    if target_ms == 0 {
        return false;
    }
    let max_est_ms = (f64::from(target_ms) * (1.0 + overage_tolerance)).round() as u32;
    if timing.estimated_ms > max_est_ms {
        return false;
    }
    if timing.min_possible_ms > target_ms.min(config.bump_target_cap_ms) {
        return false;
    }
    fit_scalable_durations(timing, target_ms, config).is_some()
}

/// Fits scalable card baselines so the script sums exactly to
/// `min(music_duration_ms, cap)`. Returns `card index -> fitted base ms`, or
/// `None` when the target is infeasible.
pub fn fit_scalable_durations(
    timing: &ScriptTiming,
    music_duration_ms: u32,
    config: &FitterConfig,
) -> Option<HashMap<usize, u32>> {
    if music_duration_ms == 0 {
        return None;
    }
    let target = music_duration_ms.min(config.bump_target_cap_ms);
    let scalable_target = i64::from(target) - i64::from(timing.fixed_ms);
    if scalable_target < 0 {
        return None;
    }
    let scalable_target = scalable_target as f64;

    let mut order: Vec<usize> = Vec::new();
    let mut cur: HashMap<usize, f64> = HashMap::new();
    let mut orig: HashMap<usize, f64> = HashMap::new();
    let mut t_min: HashMap<usize, f64> = HashMap::new();
    for item in &timing.scalable_cards {
        let t = item.t.max(0.0);
        let mut mn = item.t_min.max(0.0);
        if mn > t {
            mn = t;
        }
        order.push(item.idx);
        orig.insert(item.idx, t);
        cur.insert(item.idx, t);
        t_min.insert(item.idx, mn);
    }
    let mut active = order.clone();

    let scalable_orig: f64 = cur.values().sum();
    if scalable_orig <= scalable_target + 0.0001 {
        // No scaling required.
        return Some(
            cur.iter()
                .map(|(&idx, &ms)| (idx, ms.round() as u32))
                .collect(),
        );
    }

    let alpha = config.normalization_exponent;
    let k = config.soft_clamp_k;
    let mut remaining = scalable_orig - scalable_target;

    // Residual redistribution loop.
    for _ in 0..64 {
        if remaining <= 0.5 {
            remaining = 0.0;
            break;
        }
        if active.is_empty() {
            break;
        }

        // Weight computation (power normalization).
        let mut weights: HashMap<usize, f64> = HashMap::new();
        if alpha.abs() < 1e-9 {
            for &idx in &active {
                weights.insert(idx, 1.0);
            }
        } else {
            for &idx in &active {
                weights.insert(idx, orig[&idx].powf(alpha));
            }
        }
        let mut sum_w: f64 = weights.values().sum();
        if sum_w <= 0.0 {
            sum_w = active.len() as f64;
            for &idx in &active {
                weights.insert(idx, 1.0);
            }
        }

        let mut total_r = 0.0;
        let mut saturated: Vec<usize> = Vec::new();
        for &idx in &active {
            let w = weights[&idx];
            let r_ideal = remaining * (w / sum_w);

            let r_max = cur[&idx] - t_min[&idx];
            if r_max <= 0.0 {
                saturated.push(idx);
                continue;
            }

            let x = (r_ideal / r_max).max(0.0);
            let r = (r_max * (1.0 - (-k * x).exp())).clamp(0.0, r_max);

            let next = cur[&idx] - r;
            if next <= t_min[&idx] + 0.5 {
                cur.insert(idx, t_min[&idx]);
                saturated.push(idx);
            } else {
                cur.insert(idx, next);
            }
            total_r += r;
        }

        if total_r <= 0.0001 {
            break;
        }
        remaining -= total_r;
        if !saturated.is_empty() {
            active.retain(|idx| !saturated.contains(idx));
        }
    }

    if remaining > 1.0 {
        // Not enough reduction capacity to reach the target.
        return None;
    }

    // Integer rounding: floor, then settle the remainder by fractional parts.
    let mut base: HashMap<usize, i64> = HashMap::new();
    let mut mins: HashMap<usize, i64> = HashMap::new();
    let mut fracs: Vec<(usize, f64)> = Vec::new();
    let mut base_sum: i64 = 0;
    for &idx in &order {
        let v = cur[&idx];
        let mut b = v.floor() as i64;
        let mn = t_min[&idx].round() as i64;
        mins.insert(idx, mn);
        if b < mn {
            b = mn;
        }
        base.insert(idx, b);
        base_sum += b;
        fracs.push((idx, v - v.floor()));
    }

    let mut remainder = scalable_target as i64 - base_sum;
    if remainder > 0 && !fracs.is_empty() {
        fracs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut j = 0;
        while remainder > 0 {
            let idx = fracs[j % fracs.len()].0;
            *base.get_mut(&idx).unwrap() += 1;
            remainder -= 1;
            j += 1;
        }
    }

    if remainder < 0 && !fracs.is_empty() {
        // Min-duration clamps pushed the floor sum past the target; walk it
        // back from cards that still have slack, smallest fraction first.
        let mut take = -remainder;
        fracs.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut guard = 0;
        while take > 0 && guard < 100_000 {
            guard += 1;
            let mut progressed = false;
            for &(idx, _) in &fracs {
                if take <= 0 {
                    break;
                }
                if base[&idx] > mins[&idx] {
                    *base.get_mut(&idx).unwrap() -= 1;
                    take -= 1;
                    progressed = true;
                }
            }
            if !progressed {
                // Not enough slack to hit the target exactly.
                return None;
            }
        }
    }

    Some(
        base.into_iter()
            .map(|(idx, ms)| (idx, ms.max(0) as u32))
            .collect(),
    )
}

/// Produces a playable copy of `script` with card durations fitted to the
/// music, or `None` when the fit is infeasible.
pub fn materialize_for_music(
    script: &Script,
    music_duration_ms: u32,
    config: &FitterConfig,
) -> Option<Script> {
    if music_duration_ms == 0 {
        return None;
    }
    let target = music_duration_ms.min(config.bump_target_cap_ms);
    // The estimated-duration overage check is only a selection heuristic; if
    // the solver can compress the scalable cards into the target, allow it.
    if script.timing.min_possible_ms > target {
        return None;
    }
    let fitted = fit_scalable_durations(&script.timing, music_duration_ms, config)?;
    Some(materialize_with_fitted(script, Some(&fitted)))
}

/// Produces a playable copy of `script` with its template durations (no
/// music fitting); used for video bumps.
pub fn materialize_without_music(script: &Script) -> Script {
    materialize_with_fitted(script, None)
}

fn materialize_with_fitted(script: &Script, fitted: Option<&HashMap<usize, u32>>) -> Script {
    let mut out = script.clone();
    let mut total: u32 = 0;
    for (i, card) in out.cards.iter_mut().enumerate() {
        let duration = match card.mode() {
            DurationMode::Fixed | DurationMode::Abs => card.duration_ms().max(1),
            DurationMode::Auto | DurationMode::Delta => {
                let base = fitted
                    .and_then(|map| map.get(&i).copied())
                    .unwrap_or_else(|| card.base_duration_ms());
                let with_delta = i64::from(base) + i64::from(card.delta_ms());
                with_delta.max(1) as u32
            }
        };
        card.set_duration_ms(duration);
        total += duration;
    }
    out.estimated_ms = total;
    out.timing = ScriptTiming::default();
    out
}

/// Total playing time of a materialized script.
pub fn materialized_total_ms(script: &Script) -> u32 {
    script.cards.iter().map(Card::duration_ms).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bump::library::AssetResolver;
    use crate::bump::script::parse_script_text;
    use crate::config::Config;

    fn parse_one(body: &str) -> Script {
        let resolver = AssetResolver::default();
        let config = Config::default();
        let scripts = parse_script_text(body, None, &resolver, &config);
        assert_eq!(scripts.len(), 1);
        scripts.into_iter().next().unwrap()
    }

    fn fitter() -> FitterConfig {
        FitterConfig::default()
    }

    /// Builds a synthetic timing with one scalable card of `base` ms plus
    /// `fixed` ms of fixed time.
    fn synthetic_timing(base: u32, fixed: u32) -> ScriptTiming {
        let config = fitter();
        let t = f64::from(base);
        let t_min = t * config.min_scalable_fraction;
        ScriptTiming {
            fixed_ms: fixed,
            scalable_orig_ms: base,
            estimated_ms: fixed + base,
            min_possible_ms: fixed + t_min.round() as u32,
            scalable_cards: vec![ScalableCard {
                idx: 0,
                t,
                t_min,
                delta_ms: 0,
                mode: DurationMode::Auto,
            }],
        }
    }

    #[test]
    fn analyze_splits_fixed_and_scalable() {
        let script = parse_one("<bump>\n<card>\nhello there\n<pause=1200>\n<card 2000ms>\nbye\n");
        let timing = &script.timing;
        // Pause + abs card are fixed.
        assert_eq!(timing.fixed_ms, 1200 + 2000);
        assert_eq!(timing.scalable_cards.len(), 1);
        assert_eq!(timing.scalable_cards[0].idx, 0);
        assert_eq!(
            timing.estimated_ms,
            timing.fixed_ms + timing.scalable_orig_ms
        );
    }

    #[test]
    fn analyze_counts_delta_as_fixed_time() {
        let script = parse_one("<bump>\n<card +500>\nhello there\n");
        let timing = &script.timing;
        assert_eq!(timing.fixed_ms, 500);
        assert_eq!(timing.scalable_cards.len(), 1);
        assert_eq!(timing.scalable_cards[0].delta_ms, 500);
        assert_eq!(
            u32::try_from(timing.scalable_cards[0].t.round() as i64).unwrap(),
            script.cards[0].base_duration_ms()
        );
    }

    #[test]
    fn no_scaling_needed_returns_bases() {
        let timing = synthetic_timing(3000, 500);
        let fitted = fit_scalable_durations(&timing, 10_000, &fitter()).unwrap();
        assert_eq!(fitted[&0], 3000);
    }

    #[test]
    fn fit_sums_exactly_to_target() {
        // Scenario: [text auto, pause 1200, text auto], music 4000ms.
        let script = parse_one("<bump>\n<card>\nhello\n<pause=1200>\n<card>\nbye\n");
        let config = fitter();
        let fitted = fit_scalable_durations(&script.timing, 4000, &config).unwrap();
        let total: u32 = fitted.values().sum::<u32>() + script.timing.fixed_ms;
        assert_eq!(total, 4000);

        let materialized = materialize_for_music(&script, 4000, &config).unwrap();
        assert_eq!(materialized_total_ms(&materialized), 4000);
        // The pause stays untouched.
        let Card::Pause(pause) = &materialized.cards[1] else {
            panic!("expected pause");
        };
        assert_eq!(pause.duration_ms, 1200);
    }

    #[test]
    fn fit_respects_per_card_floor() {
        // One auto card of 5000ms base + 1000ms fixed, music 3000ms.
        let timing = synthetic_timing(5000, 1000);
        let config = fitter();
        let fitted = fit_scalable_durations(&timing, 3000, &config).unwrap();
        assert!(fitted[&0] >= 2000, "floor is 5000 * 0.40 = 2000");
        assert_eq!(fitted[&0] + timing.fixed_ms, 3000);
    }

    #[test]
    fn infeasible_when_minimum_exceeds_target() {
        let timing = synthetic_timing(5000, 1000);
        // min_possible = 1000 + 2000 = 3000 > 2500.
        assert!(fit_scalable_durations(&timing, 2500, &fitter()).is_none());
    }

    #[test]
    fn infeasible_when_fixed_exceeds_target() {
        let timing = synthetic_timing(1000, 10_000);
        assert!(fit_scalable_durations(&timing, 5000, &fitter()).is_none());
    }

    #[test]
    fn target_is_capped_at_bump_target() {
        let timing = synthetic_timing(5000, 1000);
        let config = fitter();
        // 60s music still fits to the template (no stretch beyond bases).
        let fitted = fit_scalable_durations(&timing, 60_000, &config).unwrap();
        assert_eq!(fitted[&0], 5000);
    }

    #[test]
    fn fitted_values_never_exceed_bases() {
        let script = parse_one(
            "<bump>\n<card>\nfirst card with some words\n<card>\nsecond card also with words\n<card>\nthird one\n",
        );
        let config = fitter();
        let fitted = fit_scalable_durations(&script.timing, 5000, &config).unwrap();
        for item in &script.timing.scalable_cards {
            let value = fitted[&item.idx];
            assert!(f64::from(value) <= item.t + 0.5);
            assert!(value >= item.t_min.round() as u32);
        }
        let total: u32 = fitted.values().sum::<u32>() + script.timing.fixed_ms;
        assert_eq!(total, 5000);
    }

    #[test]
    fn eligibility_overage_window() {
        // estimated 24000 vs music 15000: 24000 > 15000 * 1.2 -> ineligible.
        let timing = synthetic_timing(24_000, 0);
        let config = fitter();
        assert!(!is_music_eligible(&timing, 15_000, &config, None));
        // music 22000: 24000 <= 26400 and min 9600 <= 22000 -> eligible.
        assert!(is_music_eligible(&timing, 22_000, &config, None));
        assert!(fit_scalable_durations(&timing, 22_000, &config).is_some());
    }

    #[test]
    fn eligibility_is_monotonic_in_duration() {
        let timing = synthetic_timing(18_000, 2_000);
        let config = fitter();
        let mut was_eligible = false;
        for duration in (1..=29).map(|s| s * 1000) {
            let eligible = is_music_eligible(&timing, duration, &config, None);
            if was_eligible {
                assert!(eligible, "eligibility regressed at {duration}ms");
            }
            was_eligible = was_eligible || eligible;
        }
        assert!(was_eligible);
    }

    #[test]
    fn short_clip_gate_requires_fit_and_window() {
        let config = fitter();
        let eps = config.short_bump_overage_tolerance;
        // 16s estimate compresses fine into 15s.
        let timing = synthetic_timing(16_000, 0);
        assert!(can_fit_short_clip(&timing, 15_000, eps, &config));
        // 24s estimate exceeds the ~23s acceptance window.
        let timing = synthetic_timing(24_000, 0);
        assert!(!can_fit_short_clip(&timing, 15_000, eps, &config));
        // 20s estimate is inside the window but 14s fixed + 2.4s floor > 15s.
        let timing = synthetic_timing(6_000, 14_000);
        assert!(!can_fit_short_clip(&timing, 15_000, eps, &config));
    }

    #[test]
    fn equalized_exponent_spreads_reductions() {
        let mut config = fitter();
        config.normalization_exponent = 0.0;
        let t_long = 5000.0;
        let t_short = 2000.0;
        let timing = ScriptTiming {
            fixed_ms: 0,
            scalable_orig_ms: 7000,
            estimated_ms: 7000,
            min_possible_ms: 2800,
            scalable_cards: vec![
                ScalableCard {
                    idx: 0,
                    t: t_long,
                    t_min: t_long * 0.4,
                    delta_ms: 0,
                    mode: DurationMode::Auto,
                },
                ScalableCard {
                    idx: 1,
                    t: t_short,
                    t_min: t_short * 0.4,
                    delta_ms: 0,
                    mode: DurationMode::Auto,
                },
            ],
        };
        let fitted = fit_scalable_durations(&timing, 6000, &config).unwrap();
        assert_eq!(fitted[&0] + fitted[&1], 6000);
        // Both cards give something up and both stay above their floors.
        assert!(fitted[&0] < 5000 && fitted[&1] < 2000);
        assert!(fitted[&0] >= 2000 && fitted[&1] >= 800);
    }

    #[test]
    fn proportional_exponent_cuts_long_cards_more() {
        let config = fitter();
        let timing = ScriptTiming {
            fixed_ms: 0,
            scalable_orig_ms: 7000,
            estimated_ms: 7000,
            min_possible_ms: 2800,
            scalable_cards: vec![
                ScalableCard {
                    idx: 0,
                    t: 5000.0,
                    t_min: 2000.0,
                    delta_ms: 0,
                    mode: DurationMode::Auto,
                },
                ScalableCard {
                    idx: 1,
                    t: 2000.0,
                    t_min: 800.0,
                    delta_ms: 0,
                    mode: DurationMode::Auto,
                },
            ],
        };
        let fitted = fit_scalable_durations(&timing, 6000, &config).unwrap();
        let cut_long = 5000 - i64::from(fitted[&0]);
        let cut_short = 2000 - i64::from(fitted[&1]);
        assert!(cut_long > cut_short);
    }

    #[test]
    fn materialize_without_music_keeps_template_durations() {
        let script = parse_one("<bump video=clip.mp4>\n<card>\nover video\n<pause=900>\n");
        let materialized = materialize_without_music(&script);
        assert_eq!(
            materialized_total_ms(&materialized),
            script.cards[0].duration_ms() + 900
        );
    }

    #[test]
    fn materialize_applies_deltas_after_fitting() {
        let script = parse_one("<bump>\n<card +400>\nwith delta\n<card>\nplain\n");
        let config = fitter();
        let target = 4000;
        let materialized = materialize_for_music(&script, target, &config).unwrap();
        assert_eq!(materialized_total_ms(&materialized), target);
        // First card carries its +400 fixed adjustment on the fitted base.
        let fitted = fit_scalable_durations(&script.timing, target, &config).unwrap();
        assert_eq!(materialized.cards[0].duration_ms(), fitted[&0] + 400);
    }
}
