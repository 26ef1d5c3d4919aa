//! Neural denoiser (DeepFilterNet family) over an ONNX enhancement model.
//!
//! The model blob travels gzip-framed; `create` gunzips it, parses the
//! graph with tract and reads the fixed frame length from the model's input
//! shape. The kernel has no VAD — `do_process_frame` always reports 0, and
//! the track processor therefore never layers external VAD gain on top.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tract_onnx::prelude::*;

use crate::denoiser::{DenoiseEngine, DenoiserKind, EngineTuning};
use crate::error::{Artifact, DenoiseError, LoadError};
use crate::loader::{
    self, gunzip, AssetSource, NeuralModelLoader, DEFAULT_MODEL_FILE, DEFAULT_NEURAL_ASSETS,
    GZIP_MAGIC,
};

/// Default suppression bound. Tuned for natural speech; higher is more
/// aggressive.
pub const DEFAULT_ATTEN_LIMIT_DB: f32 = 18.0;

/// Default speech post-filter strength; 0 disables.
pub const DEFAULT_POST_FILTER_BETA: f32 = 0.03;

/// Frame size assumed when the model does not declare a static input shape.
pub const NEURAL_DEFAULT_FRAME_SIZE: usize = 480;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuralConfig {
    /// Where the model artifact is served from.
    pub assets: AssetSource,
    pub model_file: String,
    pub atten_limit_db: f32,
    pub post_filter_beta: f32,
}

impl Default for NeuralConfig {
    fn default() -> Self {
        Self {
            assets: AssetSource::Dir(DEFAULT_NEURAL_ASSETS.into()),
            model_file: DEFAULT_MODEL_FILE.to_string(),
            atten_limit_db: DEFAULT_ATTEN_LIMIT_DB,
            post_filter_beta: DEFAULT_POST_FILTER_BETA,
        }
    }
}

/// Linear floor on the dry signal implied by an attenuation limit in dB.
fn attenuation_floor(db: f32) -> f32 {
    10f32.powf(-db / 20.0)
}

/// Valin-style speech post-filter: slightly over-attenuate samples the
/// model already judged noisy. `g' = g·sin(π/2·g)^β`; identity at full
/// gain and for `β = 0`.
fn post_filter(limited: f32, dry: f32, beta: f32) -> f32 {
    if beta <= 0.0 {
        return limited;
    }
    let dry_mag = dry.abs();
    if dry_mag <= f32::EPSILON {
        return limited;
    }
    let g = (limited.abs() / dry_mag).min(1.0);
    limited * (std::f32::consts::FRAC_PI_2 * g).sin().powf(beta)
}

type NeuralPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Opaque inference context: the parsed model plus its runtime parameters.
pub(crate) struct NeuralKernel {
    plan: NeuralPlan,
    frame_len: usize,
    atten_limit_db: f32,
    post_filter_beta: f32,
}

impl NeuralKernel {
    fn kernel_err(reason: impl ToString) -> LoadError {
        LoadError::Kernel {
            artifact: Artifact::NeuralModel,
            reason: reason.to_string(),
        }
    }

    /// Build the inference context from the gzip-framed model blob.
    pub(crate) fn create(blob: &[u8], atten_limit_db: f32) -> Result<Self, LoadError> {
        if blob.len() < 2 || blob[..2] != GZIP_MAGIC {
            return Err(Self::kernel_err("model blob is not gzip-framed"));
        }
        let raw = gunzip(blob)?;

        let model = tract_onnx::onnx()
            .model_for_read(&mut Cursor::new(&raw))
            .map_err(Self::kernel_err)?;
        // prefer the model's own static input shape; pin the default frame
        // when the graph leaves the dimension symbolic
        let typed = match model.clone().into_optimized() {
            Ok(typed) => typed,
            Err(_) => model
                .with_input_fact(0, f32::fact([1, NEURAL_DEFAULT_FRAME_SIZE]).into())
                .map_err(Self::kernel_err)?
                .into_optimized()
                .map_err(Self::kernel_err)?,
        };
        let frame_len = typed
            .input_fact(0)
            .ok()
            .and_then(|fact| fact.shape.as_concrete())
            .map(|dims| dims.iter().product::<usize>())
            .filter(|&len| len > 0)
            .unwrap_or(NEURAL_DEFAULT_FRAME_SIZE);
        let plan = typed.into_runnable().map_err(Self::kernel_err)?;

        Ok(Self {
            plan,
            frame_len,
            atten_limit_db,
            post_filter_beta: DEFAULT_POST_FILTER_BETA,
        })
    }

    fn set_atten_limit(&mut self, db: f32) {
        self.atten_limit_db = db.max(0.0);
    }

    fn set_post_filter_beta(&mut self, beta: f32) {
        self.post_filter_beta = beta.max(0.0);
    }

    /// Run the model on `dry` and write the enhanced frame into `out`.
    fn process(&self, dry: &[f32], out: &mut [f32]) -> Result<(), DenoiseError> {
        let n = dry.len();
        let input = tract_ndarray::Array2::from_shape_vec((1, n), dry.to_vec())
            .map_err(|e| DenoiseError::Kernel(e.to_string()))?;
        let tensor: Tensor = input.into();
        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| DenoiseError::Kernel(e.to_string()))?;
        let wet = outputs[0]
            .as_slice::<f32>()
            .map_err(|e| DenoiseError::Kernel(e.to_string()))?;
        if wet.len() != n {
            return Err(DenoiseError::Kernel(format!(
                "kernel returned {} samples for a {n}-sample frame",
                wet.len()
            )));
        }

        let floor = attenuation_floor(self.atten_limit_db);
        for ((y, &w), &d) in out.iter_mut().zip(wet.iter()).zip(dry.iter()) {
            let limited = w + (d - w) * floor;
            *y = post_filter(limited, d, self.post_filter_beta);
        }
        Ok(())
    }
}

/// ONNX-backed [`DenoiseEngine`].
pub struct NeuralEngine {
    config: NeuralConfig,
    loader: Arc<NeuralModelLoader>,
    kernel: Option<NeuralKernel>,
    /// Copy of the dry frame handed to the kernel.
    staging: Vec<f32>,
    diagnostics_done: bool,
}

impl NeuralEngine {
    pub fn new(config: NeuralConfig) -> Self {
        let loader = loader::neural_model_loader(&config.assets, &config.model_file);
        Self::with_loader(config, loader)
    }

    /// Build with an explicit model loader (test stubs, shared loaders).
    pub fn with_loader(config: NeuralConfig, loader: Arc<NeuralModelLoader>) -> Self {
        Self {
            config,
            loader,
            kernel: None,
            staging: Vec::new(),
            diagnostics_done: false,
        }
    }

    pub fn atten_limit_db(&self) -> f32 {
        self.config.atten_limit_db
    }

    pub fn post_filter_beta(&self) -> f32 {
        self.config.post_filter_beta
    }
}

#[async_trait]
impl DenoiseEngine for NeuralEngine {
    fn kind(&self) -> DenoiserKind {
        DenoiserKind::Neural
    }

    fn frame_size(&self) -> usize {
        self.kernel
            .as_ref()
            .map_or(NEURAL_DEFAULT_FRAME_SIZE, |k| k.frame_len)
    }

    async fn do_initialize(&mut self) -> Result<(), DenoiseError> {
        let blob = self.loader.load().await?;
        let mut kernel = NeuralKernel::create(&blob, self.config.atten_limit_db)?;
        kernel.set_post_filter_beta(self.config.post_filter_beta);
        self.staging = vec![0.0; kernel.frame_len];
        self.kernel = Some(kernel);
        self.diagnostics_done = false;
        Ok(())
    }

    fn do_process_frame(&mut self, frame: &mut [f32]) -> Result<f32, DenoiseError> {
        let kernel = self.kernel.as_ref().ok_or(DenoiseError::NotInitialized)?;
        self.staging.copy_from_slice(frame);
        kernel.process(&self.staging, frame)?;

        if !self.diagnostics_done {
            self.diagnostics_done = true;
            let (in_min, in_max, in_rms) = signal_stats(&self.staging);
            let (out_min, out_max, out_rms) = signal_stats(frame);
            tracing::debug!(
                in_min,
                in_max,
                in_rms,
                out_min,
                out_max,
                out_rms,
                "first neural frame signal check"
            );
        }
        // no VAD from this algorithm
        Ok(0.0)
    }

    fn do_destroy(&mut self) {
        self.kernel = None;
        self.staging = Vec::new();
        self.diagnostics_done = false;
    }

    fn do_configure(&mut self, tuning: &EngineTuning) {
        if let Some(db) = tuning.atten_limit_db {
            self.config.atten_limit_db = db;
            if let Some(kernel) = self.kernel.as_mut() {
                kernel.set_atten_limit(db);
            }
        }
        if let Some(beta) = tuning.post_filter_beta {
            self.config.post_filter_beta = beta;
            if let Some(kernel) = self.kernel.as_mut() {
                kernel.set_post_filter_beta(beta);
            }
        }
    }
}

fn signal_stats(buf: &[f32]) -> (f32, f32, f32) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut sum_sq = 0.0f32;
    for &s in buf {
        min = min.min(s);
        max = max.max(s);
        sum_sq += s * s;
    }
    #[allow(clippy::cast_precision_loss)]
    let rms = if buf.is_empty() {
        0.0
    } else {
        (sum_sq / buf.len() as f32).sqrt()
    };
    (min, max, rms)
}
