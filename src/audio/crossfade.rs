use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;

use crate::config::EngineConfig;

// ── Equal-power curve ───────────────────────────────────────────────────────

/// Gain for the outgoing side at fade progress `t` ∈ [0.0, 1.0].
///
/// `t = 0.0` → full volume; `t = 1.0` → silent.
pub fn fade_out_gain(t: f32) -> f32 {
    (t.clamp(0.0, 1.0) * FRAC_PI_2).cos()
}

/// Gain for the incoming side; `out² + in² = 1` across the fade.
pub fn fade_in_gain(t: f32) -> f32 {
    (t.clamp(0.0, 1.0) * FRAC_PI_2).sin()
}

/// Level of a ramp moving from `from` to `to` at progress `t`.
///
/// Duck, unduck and the safety fade all go through here.
pub fn ramp_level(from: f32, to: f32, t: f32) -> f32 {
    to + (from - to) * fade_out_gain(t)
}

// ── DeckId ────────────────────────────────────────────────────────────────────

/// Output channel identifier. Two music decks plus the narration channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeckId {
    DeckA,
    DeckB,
    Voice,
}

impl DeckId {
    /// The opposite music deck. `Voice` has no partner and maps to itself.
    pub fn other(self) -> DeckId {
        match self {
            DeckId::DeckA => DeckId::DeckB,
            DeckId::DeckB => DeckId::DeckA,
            DeckId::Voice => DeckId::Voice,
        }
    }
}

impl std::fmt::Display for DeckId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeckId::DeckA => write!(f, "deck_a"),
            DeckId::DeckB => write!(f, "deck_b"),
            DeckId::Voice => write!(f, "voice"),
        }
    }
}

// ── Ramps ─────────────────────────────────────────────────────────────────────

/// Ramp families. Starting a ramp cancels the in-flight ramp of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RampKind {
    Crossfade,
    Duck,
    SafetyFade,
}

/// Length of the fade used to switch tracks.
///
/// `since_last_start_ms` is the age of the outgoing track; a track that only
/// just started gets the compressed window.
pub fn switch_window_ms(cfg: &EngineConfig, crossfade: bool, since_last_start_ms: Option<u64>) -> u64 {
    if !crossfade {
        return cfg.cut_fade_ms;
    }
    match since_last_start_ms {
        Some(age) if age < cfg.rapid_window_ms => cfg.rapid_crossfade_ms,
        _ => cfg.crossfade_ms,
    }
}

// ── TrackTiming ───────────────────────────────────────────────────────────────

/// Timeline of one track on a deck, in ms from its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackTiming {
    /// Hard cap; "track ended" fires here at the latest.
    pub cap_ms: u64,
    /// Where the track is expected to stop: natural end or cap.
    pub end_ms: u64,
    /// Start of the safety fade. `None` when the track ends before its cap.
    pub safety_fade_at_ms: Option<u64>,
    pub ending_soon_at_ms: u64,
}

impl TrackTiming {
    pub fn plan(duration_ms: Option<u64>, feature: bool, cfg: &EngineConfig) -> Self {
        let cap_ms = if feature {
            cfg.max_feature_track_ms
        } else {
            cfg.max_track_ms
        };

        let (end_ms, over_cap) = match duration_ms {
            Some(d) if d > 0 && d <= cap_ms => (d, false),
            _ => (cap_ms, true),
        };

        let safety_fade_at_ms = over_cap.then(|| cap_ms.saturating_sub(cfg.safety_fade_ms));

        // Short tracks announce their end at the halfway mark.
        let ending_soon_at_ms = if end_ms / 2 < cfg.ending_soon_lead_ms {
            end_ms / 2
        } else {
            end_ms - cfg.ending_soon_lead_ms
        };

        Self {
            cap_ms,
            end_ms,
            safety_fade_at_ms,
            ending_soon_at_ms,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_power_gains_sum_to_unity() {
        for i in 0..=10 {
            let t = i as f32 / 10.0;
            let out = fade_out_gain(t);
            let inp = fade_in_gain(t);
            assert!(
                (out * out + inp * inp - 1.0).abs() < 1e-5,
                "out²+in² should be 1.0 at t={t}, got {}",
                out * out + inp * inp
            );
        }
    }

    #[test]
    fn gains_clamp_outside_range() {
        assert!((fade_out_gain(-0.5) - 1.0).abs() < 1e-6);
        assert!(fade_out_gain(1.5).abs() < 1e-6);
        assert!((fade_in_gain(1.5) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn ramp_level_hits_both_ends() {
        assert!((ramp_level(1.0, 0.25, 0.0) - 1.0).abs() < 1e-6);
        assert!((ramp_level(1.0, 0.25, 1.0) - 0.25).abs() < 1e-6);
        assert!((ramp_level(0.25, 1.0, 1.0) - 1.0).abs() < 1e-6);
        let mid = ramp_level(0.25, 1.0, 0.5);
        assert!(mid > 0.25 && mid < 1.0, "unduck midpoint out of range: {mid}");
    }

    #[test]
    fn deck_other_flips_music_decks() {
        assert_eq!(DeckId::DeckA.other(), DeckId::DeckB);
        assert_eq!(DeckId::DeckB.other(), DeckId::DeckA);
        assert_eq!(DeckId::Voice.other(), DeckId::Voice);
        assert_eq!(DeckId::Voice.to_string(), "voice");
    }

    #[test]
    fn switch_window_rapid_and_cut() {
        let cfg = EngineConfig::default();
        assert_eq!(switch_window_ms(&cfg, true, None), 5_000);
        assert_eq!(switch_window_ms(&cfg, true, Some(60_000)), 5_000);
        assert_eq!(switch_window_ms(&cfg, true, Some(3_000)), 1_200);
        assert_eq!(switch_window_ms(&cfg, false, Some(60_000)), 300);
    }

    #[test]
    fn timing_for_long_track_uses_cap_and_safety_fade() {
        let cfg = EngineConfig::default();
        let t = TrackTiming::plan(Some(400_000), false, &cfg);
        assert_eq!(t.cap_ms, 180_000);
        assert_eq!(t.end_ms, 180_000);
        assert_eq!(t.safety_fade_at_ms, Some(175_000));
        assert_eq!(t.ending_soon_at_ms, 165_000);
    }

    #[test]
    fn timing_for_unknown_length_is_capped() {
        let cfg = EngineConfig::default();
        let t = TrackTiming::plan(None, false, &cfg);
        assert_eq!(t.end_ms, 180_000);
        assert_eq!(t.safety_fade_at_ms, Some(175_000));
    }

    #[test]
    fn timing_for_feature_track_raises_cap() {
        let cfg = EngineConfig::default();
        let t = TrackTiming::plan(Some(1_200_000), true, &cfg);
        assert_eq!(t.cap_ms, 3_600_000);
        assert_eq!(t.end_ms, 1_200_000);
        assert_eq!(t.safety_fade_at_ms, None);
    }

    #[test]
    fn short_track_ends_soon_at_half() {
        let cfg = EngineConfig::default();
        let t = TrackTiming::plan(Some(20_000), false, &cfg);
        assert_eq!(t.ending_soon_at_ms, 10_000);
        let t = TrackTiming::plan(Some(120_000), false, &cfg);
        assert_eq!(t.ending_soon_at_ms, 105_000);
    }
}
