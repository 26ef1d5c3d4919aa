//! Track processor: glues an inbound frame stream to a denoiser.
//!
//! Inbound frames arrive in whatever block size the media runtime uses;
//! the processor re-blocks them to the denoiser's fixed frame size, runs
//! the denoiser, optionally overlays VAD gain, applies the start-of-stream
//! fade-in and hard clamp, and emits reconstructed frames with derived
//! timestamps. One session at a time; stopping is cooperative and observed
//! at frame boundaries.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::denoiser::{Denoiser, DenoiserKind};
use crate::error::DenoiseError;
use crate::frame::{duration_us, AudioFrame, SampleFormat};
use crate::gain::{self, VadGainConfig, VadGainController};
use crate::math::smoothstep;
use crate::registry;

/// Samples faded in at session start (~20 ms at 48 kHz).
pub const FADE_IN_SAMPLES: usize = 960;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackProcessorConfig {
    /// Algorithm to use; `None` picks the best available from the registry.
    pub denoiser: Option<DenoiserKind>,
    pub denoiser_config: registry::DenoiserConfig,
    pub vad_gain: VadGainConfig,
    /// Overlay the VAD gain controller on the denoised signal. Only takes
    /// effect on the spectral path — the neural denoiser reports no VAD
    /// and already bounds its own attenuation.
    pub apply_vad_gain: bool,
    /// Outbound frame channel depth (~2 s of audio at 10 ms frames).
    pub channel_capacity: usize,
}

impl Default for TrackProcessorConfig {
    fn default() -> Self {
        Self {
            denoiser: None,
            denoiser_config: registry::DenoiserConfig::default(),
            vad_gain: VadGainConfig::default(),
            apply_vad_gain: false,
            channel_capacity: 200,
        }
    }
}

/// Frame counters for one processing session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Inbound frames received from the source track.
    pub frames_in: u64,
    /// Fixed-size blocks run through the denoiser.
    pub frames_processed: u64,
    /// Frames delivered downstream.
    pub frames_emitted: u64,
}

struct Session {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<SessionStats>,
}

/// Owns one denoiser instance and one processing session at a time.
pub struct TrackProcessor {
    config: TrackProcessorConfig,
    session: Option<Session>,
}

impl TrackProcessor {
    pub fn new(config: TrackProcessorConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub fn config(&self) -> &TrackProcessorConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Start a processing session on `source`, creating and initializing
    /// the configured denoiser via the registry. Returns the processed
    /// track. A session already running is stopped first.
    pub async fn start(
        &mut self,
        source: mpsc::Receiver<AudioFrame>,
    ) -> Result<mpsc::Receiver<AudioFrame>, DenoiseError> {
        let registry = registry::global();
        let kind = match self.config.denoiser {
            Some(kind) => kind,
            None => registry
                .best_available(None)
                .ok_or(DenoiseError::NoSupportedDenoiser)?,
        };
        let mut denoiser = registry.create(kind, Some(&self.config.denoiser_config))?;
        denoiser.initialize().await?;
        self.start_with_denoiser(denoiser, source).await
    }

    /// Start a processing session with a caller-provided denoiser, which
    /// must already be initialized.
    pub async fn start_with_denoiser(
        &mut self,
        denoiser: Denoiser,
        source: mpsc::Receiver<AudioFrame>,
    ) -> Result<mpsc::Receiver<AudioFrame>, DenoiseError> {
        if !denoiser.is_initialized() {
            return Err(DenoiseError::NotInitialized);
        }
        if self.session.is_some() {
            self.stop().await;
        }

        let (out_tx, out_rx) = mpsc::channel(self.config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let frame_size = denoiser.frame_size();
        let pipeline = Pipeline {
            denoiser,
            gain: VadGainController::new(self.config.vad_gain),
            apply_vad_gain: self.config.apply_vad_gain,
            source,
            sink: out_tx,
            shutdown_rx,
            frame_size,
            input_buf: vec![0.0; frame_size],
            original_buf: vec![0.0; frame_size],
            output_buf: vec![0.0; frame_size],
            buffered: 0,
            next_timestamp_us: 0,
            sample_rate_hz: 48_000,
            fade_in_remaining: FADE_IN_SAMPLES,
            stats: SessionStats::default(),
        };
        let handle = tokio::spawn(pipeline.run());
        self.session = Some(Session {
            shutdown_tx,
            handle,
        });
        Ok(out_rx)
    }

    /// Stop the current session, if any, and return its counters. The
    /// pipeline observes the signal at the next frame boundary; downstream
    /// then sees end-of-stream.
    pub async fn stop(&mut self) -> Option<SessionStats> {
        let session = self.session.take()?;
        let _ = session.shutdown_tx.send(true);
        match session.handle.await {
            Ok(stats) => Some(stats),
            Err(err) => {
                tracing::warn!(error = %err, "processing task did not shut down cleanly");
                None
            }
        }
    }
}

/// Per-session pipeline state. Runs as one task; all frame work is serial.
struct Pipeline {
    denoiser: Denoiser,
    gain: VadGainController,
    apply_vad_gain: bool,
    source: mpsc::Receiver<AudioFrame>,
    sink: mpsc::Sender<AudioFrame>,
    shutdown_rx: watch::Receiver<bool>,
    frame_size: usize,
    input_buf: Vec<f32>,
    original_buf: Vec<f32>,
    output_buf: Vec<f32>,
    /// Samples currently accumulated in `input_buf`/`original_buf`.
    buffered: usize,
    next_timestamp_us: u64,
    sample_rate_hz: u32,
    fade_in_remaining: usize,
    stats: SessionStats,
}

impl Pipeline {
    async fn run(mut self) -> SessionStats {
        tracing::info!(
            kind = %self.denoiser.kind(),
            frame_size = self.frame_size,
            vad_gain = self.apply_vad_gain,
            "track processing session started"
        );
        loop {
            tokio::select! {
                biased;
                changed = self.shutdown_rx.changed() => {
                    // stop requested, or the processor itself went away
                    let _ = changed;
                    tracing::debug!("processing session stop requested");
                    break;
                }
                maybe = self.source.recv() => {
                    let Some(frame) = maybe else {
                        tracing::debug!("inbound track ended");
                        break;
                    };
                    match self.ingest(frame).await {
                        Ok(()) => {}
                        Err(DenoiseError::Aborted) => {
                            tracing::debug!("processing session aborted");
                            break;
                        }
                        Err(DenoiseError::DownstreamClosed) => {
                            tracing::debug!("downstream track closed — stopping session");
                            break;
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "fatal pipeline error — ending session");
                            break;
                        }
                    }
                }
            }
        }
        self.finish()
    }

    /// Re-block one inbound frame and emit every completed fixed-size
    /// block.
    async fn ingest(&mut self, frame: AudioFrame) -> Result<(), DenoiseError> {
        self.stats.frames_in += 1;
        if frame.channel_count != 1 {
            return Err(DenoiseError::UnsupportedFormat(format!(
                "expected mono input, got {} channels",
                frame.channel_count
            )));
        }
        if frame.format != SampleFormat::F32Planar {
            return Err(DenoiseError::UnsupportedFormat(format!(
                "expected f32 planar input, got {:?}",
                frame.format
            )));
        }

        if self.buffered == 0 {
            // re-anchor on the inbound clock whenever the buffer is empty
            self.next_timestamp_us = frame.timestamp_us;
        }
        self.sample_rate_hz = frame.sample_rate_hz;

        let samples = frame.samples;
        let mut offset = 0;
        while offset < samples.len() {
            let take = (self.frame_size - self.buffered).min(samples.len() - offset);
            let chunk = &samples[offset..offset + take];
            self.input_buf[self.buffered..self.buffered + take].copy_from_slice(chunk);
            self.original_buf[self.buffered..self.buffered + take].copy_from_slice(chunk);
            self.buffered += take;
            offset += take;

            if self.buffered == self.frame_size {
                self.emit_block().await?;
                self.buffered = 0;
                self.next_timestamp_us = frame.timestamp_us
                    + frame.duration_us * offset as u64 / frame.frame_count.max(1) as u64;
            }
        }
        Ok(())
    }

    /// Denoise and deliver one completed block.
    async fn emit_block(&mut self) -> Result<(), DenoiseError> {
        self.output_buf.copy_from_slice(&self.input_buf);
        let vad = self.denoiser.process_frame(&mut self.output_buf)?;
        self.stats.frames_processed += 1;

        if self.fade_in_remaining > 0 {
            let faded = self.fade_in_remaining.min(self.frame_size);
            let remaining = self.fade_in_remaining;
            #[allow(clippy::cast_precision_loss)]
            let total = FADE_IN_SAMPLES as f32;
            for (i, s) in self.output_buf.iter_mut().take(faded).enumerate() {
                #[allow(clippy::cast_precision_loss)]
                let p = 1.0 - (remaining - i) as f32 / total;
                *s *= smoothstep(p);
            }
            self.fade_in_remaining -= faded;
        }

        for s in &mut self.output_buf {
            *s = s.clamp(-1.0, 1.0);
        }

        // The neural path reports vad == 0 and handles attenuation itself;
        // the overlay only ever engages on the spectral path.
        if self.apply_vad_gain && self.denoiser.kind() == DenoiserKind::Spectral && vad > 0.0 {
            let start = self.gain.previous_gain();
            let end = self.gain.compute_gain(vad);
            gain::apply_gain_with_blend(
                &mut self.output_buf,
                &self.original_buf,
                start,
                end,
                gain::DEFAULT_BLEND_RATIO,
            );
        }

        if self.sink.is_closed() {
            return Err(DenoiseError::DownstreamClosed);
        }
        let out = AudioFrame {
            format: SampleFormat::F32Planar,
            sample_rate_hz: self.sample_rate_hz,
            channel_count: 1,
            frame_count: self.frame_size,
            timestamp_us: self.next_timestamp_us,
            duration_us: duration_us(self.frame_size, self.sample_rate_hz),
            samples: self.output_buf.clone(),
        };
        tokio::select! {
            biased;
            _ = self.shutdown_rx.changed() => return Err(DenoiseError::Aborted),
            sent = self.sink.send(out) => {
                sent.map_err(|_| DenoiseError::DownstreamClosed)?;
            }
        }
        self.stats.frames_emitted += 1;
        Ok(())
    }

    fn finish(mut self) -> SessionStats {
        tracing::info!(
            frames_in = self.stats.frames_in,
            frames_processed = self.stats.frames_processed,
            frames_emitted = self.stats.frames_emitted,
            "track processing session ended"
        );
        self.gain.reset();
        self.denoiser.destroy();
        self.stats
    }
}
