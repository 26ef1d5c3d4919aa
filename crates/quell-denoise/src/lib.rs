//! Real-time single-channel noise suppression pipeline for the Quell voice
//! client.
//!
//! Raw microphone audio arrives as a stream of planar f32 frames (48 kHz
//! mono); the pipeline emits a parallel stream of same-format frames with
//! non-speech energy attenuated, plus a per-frame voice-activity score
//! where the algorithm provides one.
//!
//! ```text
//! inbound frames ──▶ TrackProcessor (re-block to frame size)
//!                        │
//!                        ▼
//!              Denoiser (Spectral = RNNoise+VAD, Neural = ONNX model)
//!                        │
//!                        ▼
//!          optional VadGainController overlay (spectral only)
//!                        │
//!                        ▼
//!            fade-in + clamp ──▶ outbound frames (derived timestamps)
//! ```
//!
//! Denoisers are selected through the [`registry`] and materialize their
//! kernels through the single-flight [`loader`]; each
//! [`TrackProcessor`] session owns its denoiser, gain controller, and
//! scratch buffers outright, so no locks guard the per-frame path.

pub mod denoiser;
pub mod error;
pub mod frame;
pub mod gain;
pub mod loader;
pub mod math;
pub mod processor;
pub mod registry;

pub use denoiser::neural::{NeuralConfig, NeuralEngine};
pub use denoiser::spectral::{SpectralConfig, SpectralEngine};
pub use denoiser::{DenoiseEngine, Denoiser, DenoiserKind, EngineTuning};
pub use error::{Artifact, DenoiseError, LoadError};
pub use frame::{AudioFrame, SampleFormat};
pub use gain::{VadGainConfig, VadGainController, VadGainUpdate};
pub use loader::{AssetFetcher, AssetSource, KernelFlavor, LoadStatus, NeuralModelLoader};
pub use processor::{SessionStats, TrackProcessor, TrackProcessorConfig, FADE_IN_SAMPLES};
pub use registry::{DenoiserConfig, Registry, RegistryEntry};
