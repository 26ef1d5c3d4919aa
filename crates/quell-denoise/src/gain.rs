//! VAD-driven gain gating.
//!
//! Turns the denoiser's per-frame voice-activity scores into a smoothly
//! varying per-sample gain: asymmetric smoothing so speech onsets open the
//! gate quickly, a hangover so speech tails are not clipped, and an eased
//! fade toward the gate floor once the hangover runs out. Gain is applied
//! with per-sample interpolation so frame boundaries stay click-free.

use serde::{Deserialize, Serialize};

use crate::math::{clamp, lerp, soft_clip};

/// Fraction of the dry signal blended back in while attenuating, to keep
/// some room character under the gate.
pub const DEFAULT_BLEND_RATIO: f32 = 0.1;

/// Tuning for [`VadGainController`]. Pure configuration — never mutated
/// while processing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VadGainConfig {
    /// Smoothing coefficient for falling VAD (release side of the detector).
    pub vad_smoothing: f32,
    /// Smoothed-VAD level above which the gate is fully open.
    pub vad_threshold: f32,
    /// Frames the gate stays open after the smoothed VAD drops below the
    /// threshold.
    pub hangover_frames: u32,
    /// Gain floor while gated.
    pub min_gate_gain: f32,
    /// Smoothing coefficient used when VAD or gain is rising.
    pub attack_smoothing: f32,
    /// Smoothing coefficient used when gain is falling.
    pub release_smoothing: f32,
    /// Point in the hangover (as progress in [0, 1]) where the eased fade
    /// toward the floor begins; before it the gate holds at full gain.
    pub hangover_fade_start: f32,
}

impl Default for VadGainConfig {
    fn default() -> Self {
        Self {
            vad_smoothing: 0.08,
            vad_threshold: 0.30,
            hangover_frames: 45,
            min_gate_gain: 0.15,
            attack_smoothing: 0.15,
            release_smoothing: 0.03,
            hangover_fade_start: 0.6,
        }
    }
}

/// Partial update for [`VadGainController::configure`]; `None` fields are
/// left untouched.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VadGainUpdate {
    pub vad_smoothing: Option<f32>,
    pub vad_threshold: Option<f32>,
    pub hangover_frames: Option<u32>,
    pub min_gate_gain: Option<f32>,
    pub attack_smoothing: Option<f32>,
    pub release_smoothing: Option<f32>,
    pub hangover_fade_start: Option<f32>,
}

/// Converts a stream of per-frame VAD probabilities into a per-frame gain.
///
/// State machine per frame: smooth the VAD (fast up, slow down), reload or
/// decay the hangover counter, derive a target gain, then chase the target
/// with asymmetric smoothing. The returned gain always lies in
/// `[min_gate_gain, 1]`.
#[derive(Debug, Clone)]
pub struct VadGainController {
    config: VadGainConfig,
    smoothed_vad: f32,
    hangover: u32,
    previous_gain: f32,
    target_gain: f32,
}

impl VadGainController {
    pub fn new(config: VadGainConfig) -> Self {
        Self {
            config,
            smoothed_vad: 0.0,
            hangover: 0,
            previous_gain: 1.0,
            target_gain: 1.0,
        }
    }

    /// Advance the state machine by one frame and return the new gain.
    pub fn compute_gain(&mut self, vad: f32) -> f32 {
        let vad = clamp(vad, 0.0, 1.0);
        let cfg = &self.config;

        // fast attack, slow release on the detector itself
        let coef = if vad > self.smoothed_vad {
            cfg.attack_smoothing
        } else {
            cfg.vad_smoothing
        };
        self.smoothed_vad = lerp(self.smoothed_vad, vad, coef);

        if self.smoothed_vad > cfg.vad_threshold {
            self.hangover = cfg.hangover_frames;
        } else {
            self.hangover = self.hangover.saturating_sub(1);
        }

        self.target_gain = self.compute_target_gain();

        let coef = if self.target_gain > self.previous_gain {
            cfg.attack_smoothing
        } else {
            cfg.release_smoothing
        };
        let gain = lerp(self.previous_gain, self.target_gain, coef);
        self.previous_gain = gain;
        gain
    }

    fn compute_target_gain(&self) -> f32 {
        let cfg = &self.config;
        if self.smoothed_vad > cfg.vad_threshold {
            return 1.0;
        }
        if self.hangover > 0 && cfg.hangover_frames > 0 {
            #[allow(clippy::cast_precision_loss)]
            let progress = 1.0 - self.hangover as f32 / cfg.hangover_frames as f32;
            if progress < cfg.hangover_fade_start {
                return 1.0;
            }
            let fade = (progress - cfg.hangover_fade_start) / (1.0 - cfg.hangover_fade_start);
            let eased = 1.0 - (1.0 - fade).powi(3);
            return 1.0 - eased * (1.0 - 2.0 * cfg.min_gate_gain);
        }
        let v = clamp(self.smoothed_vad / cfg.vad_threshold, 0.0, 1.0);
        cfg.min_gate_gain + (1.0 - cfg.min_gate_gain) * v * v * v
    }

    /// Gain returned by the most recent [`compute_gain`](Self::compute_gain)
    /// call. This is the interpolation start point for the next frame.
    pub fn previous_gain(&self) -> f32 {
        self.previous_gain
    }

    pub fn config(&self) -> &VadGainConfig {
        &self.config
    }

    /// Return to the initial state (full gain, no hangover).
    pub fn reset(&mut self) {
        self.smoothed_vad = 0.0;
        self.hangover = 0;
        self.previous_gain = 1.0;
        self.target_gain = 1.0;
    }

    /// Replace the scalars named in `update`; the rest keep their values.
    pub fn configure(&mut self, update: VadGainUpdate) {
        let cfg = &mut self.config;
        if let Some(v) = update.vad_smoothing {
            cfg.vad_smoothing = v;
        }
        if let Some(v) = update.vad_threshold {
            cfg.vad_threshold = v;
        }
        if let Some(v) = update.hangover_frames {
            cfg.hangover_frames = v;
        }
        if let Some(v) = update.min_gate_gain {
            cfg.min_gate_gain = v;
        }
        if let Some(v) = update.attack_smoothing {
            cfg.attack_smoothing = v;
        }
        if let Some(v) = update.release_smoothing {
            cfg.release_smoothing = v;
        }
        if let Some(v) = update.hangover_fade_start {
            cfg.hangover_fade_start = v;
        }
    }
}

/// Scalar gain over a whole buffer.
pub fn apply_gain(buf: &mut [f32], gain: f32) {
    for s in buf.iter_mut() {
        *s *= gain;
    }
}

/// Per-sample linearly interpolated gain from `start` to `end` across the
/// buffer. With `start == end` this is sample-exact equal to
/// [`apply_gain`], so frame boundaries never click.
pub fn apply_gain_interpolated(buf: &mut [f32], start: f32, end: f32) {
    if buf.is_empty() {
        return;
    }
    #[allow(clippy::cast_precision_loss)]
    let len = buf.len() as f32;
    for (i, s) in buf.iter_mut().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let t = i as f32 / len;
        *s *= lerp(start, end, t);
    }
}

/// Interpolated gain on `out`, plus a small blend of `original` while
/// attenuating. The blend weight `max(0, 1 − g)·blend_ratio·g` vanishes at
/// both full gain and full gate, so it only colors the transition region.
pub fn apply_gain_with_blend(
    out: &mut [f32],
    original: &[f32],
    start: f32,
    end: f32,
    blend_ratio: f32,
) {
    if out.is_empty() {
        return;
    }
    #[allow(clippy::cast_precision_loss)]
    let len = out.len() as f32;
    for (i, s) in out.iter_mut().enumerate() {
        #[allow(clippy::cast_precision_loss)]
        let t = i as f32 / len;
        let g = lerp(start, end, t);
        let blend = (1.0 - g).max(0.0) * blend_ratio * g;
        let dry = original.get(i).copied().unwrap_or(0.0);
        *s = *s * g + dry * blend;
    }
}

/// Per-sample cubic soft clip at ±1.
pub fn apply_soft_clipping(buf: &mut [f32]) {
    for s in buf.iter_mut() {
        *s = soft_clip(*s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_stays_in_range() {
        let cfg = VadGainConfig::default();
        let mut ctl = VadGainController::new(cfg);
        for i in 0..2_000 {
            #[allow(clippy::cast_precision_loss)]
            let vad = ((i as f32) * 0.37).sin().abs();
            let g = ctl.compute_gain(vad);
            assert!(
                (cfg.min_gate_gain..=1.0).contains(&g),
                "gain {g} left [{}, 1]",
                cfg.min_gate_gain
            );
        }
    }

    #[test]
    fn test_sustained_speech_reaches_full_gain() {
        let cfg = VadGainConfig::default();
        let mut ctl = VadGainController::new(cfg);
        // drive the gate closed first
        for _ in 0..300 {
            ctl.compute_gain(0.0);
        }
        assert!(ctl.previous_gain() < 0.5);
        // then sustained speech: gain must converge back to ~1 within a few
        // attack time constants
        let mut g = 0.0;
        for _ in 0..200 {
            g = ctl.compute_gain(1.0);
        }
        assert!(g > 0.99, "gain only reached {g}");
    }

    #[test]
    fn test_silence_settles_at_gate_floor() {
        let cfg = VadGainConfig::default();
        let mut ctl = VadGainController::new(cfg);
        let mut g = 1.0;
        for _ in 0..1_000 {
            g = ctl.compute_gain(0.0);
        }
        assert!((g - cfg.min_gate_gain).abs() < 0.01, "settled at {g}");
    }

    #[test]
    fn test_hangover_holds_gate_open() {
        let cfg = VadGainConfig::default();
        let mut ctl = VadGainController::new(cfg);
        for _ in 0..100 {
            ctl.compute_gain(1.0);
        }
        // speech stops; during the pre-fade part of the hangover the gain
        // must stay at full
        let hold_frames =
            (f64::from(cfg.hangover_frames) * f64::from(cfg.hangover_fade_start)) as u32;
        for _ in 0..hold_frames.saturating_sub(1) {
            let g = ctl.compute_gain(0.0);
            assert!(g > 0.95, "gate dropped to {g} during hangover hold");
        }
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut ctl = VadGainController::new(VadGainConfig::default());
        for _ in 0..500 {
            ctl.compute_gain(0.0);
        }
        ctl.reset();
        assert!((ctl.previous_gain() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_configure_partial_update() {
        let mut ctl = VadGainController::new(VadGainConfig::default());
        ctl.configure(VadGainUpdate {
            min_gate_gain: Some(0.25),
            ..VadGainUpdate::default()
        });
        assert!((ctl.config().min_gate_gain - 0.25).abs() < f32::EPSILON);
        // untouched field keeps its default
        assert!((ctl.config().vad_threshold - 0.30).abs() < f32::EPSILON);
    }

    #[test]
    fn test_interpolated_gain_matches_scalar_when_flat() {
        let mut a = vec![0.5f32; 480];
        let mut b = a.clone();
        apply_gain(&mut a, 0.37);
        apply_gain_interpolated(&mut b, 0.37, 0.37);
        assert_eq!(a, b);
    }

    #[test]
    fn test_interpolated_gain_ramps() {
        let mut buf = vec![1.0f32; 100];
        apply_gain_interpolated(&mut buf, 0.0, 1.0);
        assert_eq!(buf[0], 0.0);
        assert!(buf[99] > 0.98);
        assert!(buf.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_blend_vanishes_at_full_gain() {
        let original = vec![0.8f32; 64];
        let mut out = vec![0.5f32; 64];
        apply_gain_with_blend(&mut out, &original, 1.0, 1.0, DEFAULT_BLEND_RATIO);
        // g == 1 → blend weight 0 → pure wet
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_blend_adds_dry_under_attenuation() {
        let original = vec![1.0f32; 64];
        let mut out = vec![0.0f32; 64];
        apply_gain_with_blend(&mut out, &original, 0.5, 0.5, DEFAULT_BLEND_RATIO);
        // wet is silent, so the output is exactly the blend term
        let expected = 0.5 * DEFAULT_BLEND_RATIO * 0.5;
        assert!(out.iter().all(|&s| (s - expected).abs() < 1e-6));
    }

    #[test]
    fn test_soft_clipping_bounds() {
        let mut buf = vec![-3.0, -1.0, -0.5, 0.0, 0.5, 1.0, 3.0];
        apply_soft_clipping(&mut buf);
        assert!(buf.iter().all(|&s| (-1.0..=1.0).contains(&s)));
        assert_eq!(buf[0], -1.0);
        assert_eq!(buf[6], 1.0);
    }
}
