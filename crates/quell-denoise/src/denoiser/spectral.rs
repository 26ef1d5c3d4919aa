//! Recurrent spectral denoiser (RNNoise family) with built-in VAD.
//!
//! The kernel works on int16-magnitude floats, so every frame is scaled by
//! ×32767 on the way in and back down on the way out. On top of the
//! kernel's own suppression, an always-on adaptive post-gain rides the VAD
//! to pull residual noise down between utterances; the external
//! [`VadGainController`](crate::gain::VadGainController) is a separate,
//! opt-in overlay with its own tuning.

use async_trait::async_trait;
use nnnoiseless::DenoiseState;
use serde::{Deserialize, Serialize};

use crate::denoiser::{DenoiseEngine, DenoiserKind};
use crate::error::DenoiseError;
use crate::loader::{self, KernelFlavor};
use crate::math::lerp;

/// Frame size the spectral kernel operates on (10 ms at 48 kHz).
pub const SPECTRAL_FRAME_SIZE: usize = DenoiseState::FRAME_SIZE;

/// The kernel expects samples at int16 magnitude.
const INT16_SCALE: f32 = 32767.0;

// Internal post-gain tuning. Deliberately separate from the external VAD
// gain controller's coefficients.
const POST_GAIN_ATTACK: f32 = 0.3;
const POST_GAIN_RELEASE: f32 = 0.05;
const POST_GAIN_FLOOR: f32 = 0.1;
/// Smoothed VAD at or above this keeps full gain.
const POST_VAD_FULL: f32 = 0.5;
/// Smoothed VAD at or below this sits at the gain floor.
const POST_VAD_FLOOR: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectralConfig {
    /// Use the SIMD kernel build when the CPU supports it.
    pub prefer_simd: bool,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self { prefer_simd: true }
    }
}

/// RNNoise-backed [`DenoiseEngine`].
pub struct SpectralEngine {
    config: SpectralConfig,
    kernel: Option<Box<DenoiseState<'static>>>,
    flavor: Option<KernelFlavor>,
    /// Input scratch, kernel scale.
    scaled: Vec<f32>,
    /// Output scratch, kernel scale.
    denoised: Vec<f32>,
    smoothed_vad: f32,
    post_gain: f32,
}

impl SpectralEngine {
    pub fn new(config: SpectralConfig) -> Self {
        Self {
            config,
            kernel: None,
            flavor: None,
            scaled: Vec::new(),
            denoised: Vec::new(),
            smoothed_vad: 0.0,
            post_gain: 1.0,
        }
    }

    /// Kernel build selected at initialization.
    pub fn kernel_flavor(&self) -> Option<KernelFlavor> {
        self.flavor
    }

    fn update_post_gain(&mut self, vad: f32) -> f32 {
        let coef = if vad > self.smoothed_vad {
            POST_GAIN_ATTACK
        } else {
            POST_GAIN_RELEASE
        };
        self.smoothed_vad = lerp(self.smoothed_vad, vad, coef);

        let target = if self.smoothed_vad >= POST_VAD_FULL {
            1.0
        } else if self.smoothed_vad <= POST_VAD_FLOOR {
            POST_GAIN_FLOOR
        } else {
            let ramp = (self.smoothed_vad - POST_VAD_FLOOR) / (POST_VAD_FULL - POST_VAD_FLOOR);
            POST_GAIN_FLOOR + (1.0 - POST_GAIN_FLOOR) * ramp
        };

        let coef = if target > self.post_gain {
            POST_GAIN_ATTACK
        } else {
            POST_GAIN_RELEASE
        };
        self.post_gain = lerp(self.post_gain, target, coef).max(POST_GAIN_FLOOR);
        self.post_gain
    }
}

#[async_trait]
impl DenoiseEngine for SpectralEngine {
    fn kind(&self) -> DenoiserKind {
        DenoiserKind::Spectral
    }

    fn frame_size(&self) -> usize {
        SPECTRAL_FRAME_SIZE
    }

    async fn do_initialize(&mut self) -> Result<(), DenoiseError> {
        let flavor = loader::spectral_kernel_loader(self.config.prefer_simd)
            .load()
            .await?;
        self.flavor = Some(flavor);
        self.kernel = Some(DenoiseState::new());
        self.scaled = vec![0.0; SPECTRAL_FRAME_SIZE];
        self.denoised = vec![0.0; SPECTRAL_FRAME_SIZE];
        self.smoothed_vad = 0.0;
        self.post_gain = 1.0;
        Ok(())
    }

    fn do_process_frame(&mut self, frame: &mut [f32]) -> Result<f32, DenoiseError> {
        let kernel = self.kernel.as_mut().ok_or(DenoiseError::NotInitialized)?;

        for (dst, &src) in self.scaled.iter_mut().zip(frame.iter()) {
            *dst = src * INT16_SCALE;
        }
        let vad = kernel.process_frame(&mut self.denoised, &self.scaled);
        for (dst, &src) in frame.iter_mut().zip(self.denoised.iter()) {
            *dst = src / INT16_SCALE;
        }

        let gain = self.update_post_gain(vad);
        for s in frame.iter_mut() {
            *s *= gain;
        }
        Ok(vad)
    }

    fn do_destroy(&mut self) {
        self.kernel = None;
        self.flavor = None;
        self.scaled = Vec::new();
        self.denoised = Vec::new();
        self.smoothed_vad = 0.0;
        self.post_gain = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denoiser::Denoiser;

    #[tokio::test]
    async fn test_silence_stays_silent() {
        let mut d = Denoiser::new(Box::new(SpectralEngine::new(SpectralConfig::default())));
        d.initialize().await.unwrap();
        assert_eq!(d.frame_size(), SPECTRAL_FRAME_SIZE);

        let mut frame = vec![0.0f32; SPECTRAL_FRAME_SIZE];
        for _ in 0..20 {
            let vad = d.process_frame(&mut frame).unwrap();
            assert!((0.0..=1.0).contains(&vad));
        }
        assert!(frame.iter().all(|&s| s.abs() <= 1e-6));
    }

    #[tokio::test]
    async fn test_output_is_normalized() {
        let mut d = Denoiser::new(Box::new(SpectralEngine::new(SpectralConfig::default())));
        d.initialize().await.unwrap();

        #[allow(clippy::cast_precision_loss)]
        let mut frame: Vec<f32> = (0..SPECTRAL_FRAME_SIZE)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 48_000.0).sin() * 0.3)
            .collect();
        d.process_frame(&mut frame).unwrap();
        assert!(frame.iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }

    #[tokio::test]
    async fn test_portable_flavor_when_simd_disabled() {
        let mut engine = SpectralEngine::new(SpectralConfig { prefer_simd: false });
        engine.do_initialize().await.unwrap();
        assert_eq!(engine.kernel_flavor(), Some(KernelFlavor::Portable));
    }

    #[test]
    fn test_post_gain_gates_on_low_vad() {
        let mut engine = SpectralEngine::new(SpectralConfig::default());
        let mut gain = 1.0;
        for _ in 0..300 {
            gain = engine.update_post_gain(0.0);
        }
        assert!((gain - POST_GAIN_FLOOR).abs() < 0.01, "settled at {gain}");
    }

    #[test]
    fn test_post_gain_opens_on_speech() {
        let mut engine = SpectralEngine::new(SpectralConfig::default());
        for _ in 0..300 {
            engine.update_post_gain(0.0);
        }
        let mut gain = 0.0;
        for _ in 0..60 {
            gain = engine.update_post_gain(0.95);
        }
        assert!(gain > 0.95, "only reached {gain}");
    }

    #[test]
    fn test_post_gain_never_below_floor() {
        let mut engine = SpectralEngine::new(SpectralConfig::default());
        for i in 0..500 {
            #[allow(clippy::cast_precision_loss)]
            let vad = ((i as f32) * 0.13).sin().abs() * 0.4;
            let gain = engine.update_post_gain(vad);
            assert!((POST_GAIN_FLOOR..=1.0).contains(&gain));
        }
    }
}
