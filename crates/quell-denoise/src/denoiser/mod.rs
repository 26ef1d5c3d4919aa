//! Denoiser abstraction: a pluggable interface over the concrete noise
//! suppression algorithms.
//!
//! [`DenoiseEngine`] is the algorithm-only surface implemented per backend;
//! [`Denoiser`] wraps an engine and enforces everything the algorithms
//! should not have to care about — the lifecycle state machine, the
//! frame-length precondition, VAD clamping and observability, idempotent
//! teardown.

pub mod neural;
pub mod spectral;

use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DenoiseError;

/// Closed set of denoiser algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DenoiserKind {
    /// Recurrent spectral denoiser with built-in VAD (RNNoise family).
    Spectral,
    /// Neural enhancement model without VAD (DeepFilterNet family).
    Neural,
}

impl fmt::Display for DenoiserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenoiserKind::Spectral => write!(f, "spectral"),
            DenoiserKind::Neural => write!(f, "neural"),
        }
    }
}

/// Runtime-adjustable engine parameters; `None` fields are left untouched.
/// Only the neural engine reacts to these today.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EngineTuning {
    /// Upper bound on suppression, in dB.
    pub atten_limit_db: Option<f32>,
    /// Speech post-filter strength; 0 disables.
    pub post_filter_beta: Option<f32>,
}

/// Algorithm hooks implemented by each denoiser backend.
///
/// Implementations hold the kernel state and scratch buffers; the wrapper
/// guarantees `do_process_frame` is only called between a successful
/// `do_initialize` and `do_destroy`, with a slice of exactly
/// [`frame_size`](Self::frame_size) samples.
#[async_trait]
pub trait DenoiseEngine: Send {
    fn kind(&self) -> DenoiserKind;

    /// Fixed frame size in samples. Before initialization this reports the
    /// algorithm's default; afterwards, the kernel's actual frame size.
    fn frame_size(&self) -> usize;

    /// Acquire kernel state and scratch buffers. May await the module
    /// loader; called at most once per lifecycle.
    async fn do_initialize(&mut self) -> Result<(), DenoiseError>;

    /// Denoise one frame in place; returns the VAD probability, or 0 when
    /// the algorithm has none. Synchronous — no I/O, no yielding.
    fn do_process_frame(&mut self, frame: &mut [f32]) -> Result<f32, DenoiseError>;

    /// Release kernel state and scratch buffers. Must tolerate being
    /// called without a prior initialize.
    fn do_destroy(&mut self);

    /// Apply runtime tuning. Default: ignored.
    fn do_configure(&mut self, _tuning: &EngineTuning) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Ready,
    Destroyed,
}

/// A denoiser instance: one engine plus the lifecycle guard rails.
///
/// Instances are never shared between concurrent callers; the track
/// processor owns one for the life of a session.
pub struct Denoiser {
    engine: Box<dyn DenoiseEngine>,
    lifecycle: Lifecycle,
    frame_size: usize,
    last_vad: f32,
    vad_logging: bool,
    session_id: Option<String>,
}

impl Denoiser {
    pub fn new(engine: Box<dyn DenoiseEngine>) -> Self {
        let frame_size = engine.frame_size();
        Self {
            engine,
            lifecycle: Lifecycle::Uninitialized,
            frame_size,
            last_vad: 0.0,
            vad_logging: false,
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn kind(&self) -> DenoiserKind {
        self.engine.kind()
    }

    /// Fixed frame size; the algorithm default until initialized.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle == Lifecycle::Ready
    }

    /// One-shot asynchronous setup. Must complete before any
    /// [`process_frame`](Self::process_frame). Calling again on an
    /// initialized instance logs a warning and is a no-op; on failure the
    /// instance stays uninitialized (and destroyable).
    pub async fn initialize(&mut self) -> Result<(), DenoiseError> {
        if self.lifecycle == Lifecycle::Ready {
            tracing::warn!(
                kind = %self.kind(),
                session = self.session_id.as_deref().unwrap_or(""),
                "denoiser already initialized — ignoring"
            );
            return Ok(());
        }
        let started = Instant::now();
        self.engine.do_initialize().await?;
        self.frame_size = self.engine.frame_size();
        self.lifecycle = Lifecycle::Ready;
        tracing::debug!(
            kind = %self.kind(),
            session = self.session_id.as_deref().unwrap_or(""),
            frame_size = self.frame_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "denoiser initialized"
        );
        Ok(())
    }

    /// Denoise `frame` in place and return the VAD probability in [0, 1]
    /// (0 when the algorithm has none).
    ///
    /// Fails without touching any state when the instance is not
    /// initialized or the slice length differs from
    /// [`frame_size`](Self::frame_size).
    pub fn process_frame(&mut self, frame: &mut [f32]) -> Result<f32, DenoiseError> {
        if self.lifecycle != Lifecycle::Ready {
            return Err(DenoiseError::NotInitialized);
        }
        if frame.len() != self.frame_size {
            return Err(DenoiseError::FrameSizeMismatch {
                expected: self.frame_size,
                actual: frame.len(),
            });
        }
        let vad = self.engine.do_process_frame(frame)?.clamp(0.0, 1.0);
        self.last_vad = vad;
        if self.vad_logging {
            tracing::trace!(
                kind = %self.kind(),
                session = self.session_id.as_deref().unwrap_or(""),
                vad,
                "frame processed"
            );
        }
        Ok(vad)
    }

    /// Tear down kernel state and scratch buffers. Idempotent; also runs
    /// on drop.
    pub fn destroy(&mut self) {
        if self.lifecycle == Lifecycle::Destroyed {
            return;
        }
        self.engine.do_destroy();
        self.lifecycle = Lifecycle::Destroyed;
    }

    /// VAD score of the most recently processed frame.
    pub fn last_vad_score(&self) -> f32 {
        self.last_vad
    }

    /// Enable per-frame VAD trace logging.
    pub fn set_vad_logging(&mut self, enabled: bool) {
        self.vad_logging = enabled;
    }

    /// Apply runtime tuning to the engine.
    pub fn configure(&mut self, tuning: EngineTuning) {
        self.engine.do_configure(&tuning);
    }
}

impl Drop for Denoiser {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Denoiser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Denoiser")
            .field("kind", &self.engine.kind())
            .field("lifecycle", &self.lifecycle)
            .field("frame_size", &self.frame_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal engine: passthrough with a canned VAD score.
    struct FakeEngine {
        kind: DenoiserKind,
        vad: f32,
        fail_init: bool,
    }

    impl FakeEngine {
        fn new(kind: DenoiserKind, vad: f32) -> Self {
            Self {
                kind,
                vad,
                fail_init: false,
            }
        }
    }

    #[async_trait]
    impl DenoiseEngine for FakeEngine {
        fn kind(&self) -> DenoiserKind {
            self.kind
        }

        fn frame_size(&self) -> usize {
            480
        }

        async fn do_initialize(&mut self) -> Result<(), DenoiseError> {
            if self.fail_init {
                return Err(DenoiseError::KernelAllocation("injected".into()));
            }
            Ok(())
        }

        fn do_process_frame(&mut self, _frame: &mut [f32]) -> Result<f32, DenoiseError> {
            Ok(self.vad)
        }

        fn do_destroy(&mut self) {}
    }

    #[tokio::test]
    async fn test_process_requires_initialize() {
        let mut d = Denoiser::new(Box::new(FakeEngine::new(DenoiserKind::Spectral, 0.5)));
        let mut buf = vec![0.0; 480];
        assert!(matches!(
            d.process_frame(&mut buf),
            Err(DenoiseError::NotInitialized)
        ));

        d.initialize().await.unwrap();
        assert_eq!(d.process_frame(&mut buf).unwrap(), 0.5);
    }

    #[tokio::test]
    async fn test_frame_size_mismatch_rejected() {
        let mut d = Denoiser::new(Box::new(FakeEngine::new(DenoiserKind::Spectral, 0.5)));
        d.initialize().await.unwrap();
        let mut short = vec![0.0; 479];
        match d.process_frame(&mut short) {
            Err(DenoiseError::FrameSizeMismatch { expected, actual }) => {
                assert_eq!(expected, 480);
                assert_eq!(actual, 479);
            }
            other => panic!("expected frame size mismatch, got {other:?}"),
        }
        // the failed call must not have advanced observable state
        assert_eq!(d.last_vad_score(), 0.0);
    }

    #[tokio::test]
    async fn test_double_initialize_is_noop() {
        let mut d = Denoiser::new(Box::new(FakeEngine::new(DenoiserKind::Spectral, 0.5)));
        d.initialize().await.unwrap();
        d.initialize().await.unwrap();
        assert!(d.is_initialized());
    }

    #[tokio::test]
    async fn test_failed_initialize_leaves_uninitialized() {
        let mut engine = FakeEngine::new(DenoiserKind::Neural, 0.0);
        engine.fail_init = true;
        let mut d = Denoiser::new(Box::new(engine));
        assert!(d.initialize().await.is_err());
        assert!(!d.is_initialized());
        // still destroyable
        d.destroy();
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let mut d = Denoiser::new(Box::new(FakeEngine::new(DenoiserKind::Spectral, 0.5)));
        d.initialize().await.unwrap();
        d.destroy();
        d.destroy();
        let mut buf = vec![0.0; 480];
        assert!(matches!(
            d.process_frame(&mut buf),
            Err(DenoiseError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_vad_is_clamped_and_remembered() {
        let mut d = Denoiser::new(Box::new(FakeEngine::new(DenoiserKind::Spectral, 1.7)));
        d.initialize().await.unwrap();
        let mut buf = vec![0.0; 480];
        assert_eq!(d.process_frame(&mut buf).unwrap(), 1.0);
        assert_eq!(d.last_vad_score(), 1.0);
    }
}
