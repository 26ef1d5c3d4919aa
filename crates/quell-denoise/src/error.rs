use std::fmt;

use thiserror::Error;

use crate::denoiser::DenoiserKind;

/// Which binary artifact a loader was acquiring when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    SpectralKernel,
    NeuralModel,
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::SpectralKernel => write!(f, "spectral kernel"),
            Artifact::NeuralModel => write!(f, "neural model"),
        }
    }
}

/// Artifact acquisition failure.
///
/// `Clone` because the single-flight loader fans the same failure out to
/// every concurrent waiter.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("fetching {artifact} from {source_desc}: {reason}")]
    Fetch {
        artifact: Artifact,
        source_desc: String,
        reason: String,
    },

    #[error("{artifact} fetch returned HTTP {status}")]
    HttpStatus { artifact: Artifact, status: u16 },

    #[error("re-compressing {artifact}: {reason}")]
    Recompress { artifact: Artifact, reason: String },

    #[error("instantiating {artifact}: {reason}")]
    Kernel { artifact: Artifact, reason: String },

    #[error("{artifact} load was interrupted")]
    Interrupted { artifact: Artifact },
}

#[derive(Debug, Error)]
pub enum DenoiseError {
    #[error("denoiser has not been initialized")]
    NotInitialized,

    #[error("frame size mismatch: expected {expected} samples, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("denoiser kind {0} is not registered")]
    UnknownKind(DenoiserKind),

    #[error("denoiser kind {0} is not supported in this environment")]
    Unsupported(DenoiserKind),

    #[error("no supported denoiser is registered")]
    NoSupportedDenoiser,

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("kernel allocation failed: {0}")]
    KernelAllocation(String),

    #[error("denoise kernel failed: {0}")]
    Kernel(String),

    #[error("processing session aborted")]
    Aborted,

    #[error("downstream track closed")]
    DownstreamClosed,
}
