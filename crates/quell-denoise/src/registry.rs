//! Denoiser registry and factory.
//!
//! Maps [`DenoiserKind`] tags to constructors plus capability predicates,
//! so callers can instantiate by tag or ask for the best algorithm the
//! current configuration supports. The process-wide instance is populated
//! with the built-ins on first touch and is immutable afterwards; tests
//! build private registries instead of resetting the global one.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::denoiser::neural::{NeuralConfig, NeuralEngine};
use crate::denoiser::spectral::{SpectralConfig, SpectralEngine};
use crate::denoiser::{DenoiseEngine, Denoiser, DenoiserKind};
use crate::error::DenoiseError;

/// Selection order used by [`Registry::best_available`] when the caller
/// has no preference.
pub const DEFAULT_PRIORITY: [DenoiserKind; 2] = [DenoiserKind::Neural, DenoiserKind::Spectral];

/// Factory configuration covering both denoiser kinds.
///
/// Callers override individual fields with struct-update syntax
/// (`..DenoiserConfig::default()`); passing `None` to
/// [`Registry::create`] uses the entry's registered defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DenoiserConfig {
    /// Attached to log records emitted by the instance.
    pub session_id: Option<String>,
    /// Enables per-frame VAD trace logging.
    pub debug: bool,
    pub spectral: SpectralConfig,
    pub neural: NeuralConfig,
}

pub type ConstructorFn = fn(&DenoiserConfig) -> Box<dyn DenoiseEngine>;
pub type CapabilityFn = fn(&DenoiserConfig) -> bool;

pub struct RegistryEntry {
    pub kind: DenoiserKind,
    pub constructor: ConstructorFn,
    pub supported: CapabilityFn,
    pub default_config: DenoiserConfig,
}

#[derive(Default)]
pub struct Registry {
    entries: BTreeMap<DenoiserKind, RegistryEntry>,
}

impl Registry {
    /// Empty registry, for tests and embedders with custom entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with the built-in spectral and neural entries.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(RegistryEntry {
            kind: DenoiserKind::Spectral,
            constructor: spectral_constructor,
            supported: spectral_supported,
            default_config: DenoiserConfig::default(),
        });
        registry.register(RegistryEntry {
            kind: DenoiserKind::Neural,
            constructor: neural_constructor,
            supported: neural_supported,
            default_config: DenoiserConfig::default(),
        });
        registry
    }

    /// Add or replace an entry. Replacing logs a warning.
    pub fn register(&mut self, entry: RegistryEntry) {
        let kind = entry.kind;
        if self.entries.insert(kind, entry).is_some() {
            tracing::warn!(kind = %kind, "overwriting existing denoiser registration");
        }
    }

    /// Instantiate a denoiser by tag. `None` config uses the entry's
    /// registered defaults.
    pub fn create(
        &self,
        kind: DenoiserKind,
        config: Option<&DenoiserConfig>,
    ) -> Result<Denoiser, DenoiseError> {
        let entry = self
            .entries
            .get(&kind)
            .ok_or(DenoiseError::UnknownKind(kind))?;
        let config = config.unwrap_or(&entry.default_config);
        if !(entry.supported)(config) {
            return Err(DenoiseError::Unsupported(kind));
        }
        let mut denoiser =
            Denoiser::new((entry.constructor)(config)).with_session_id(config.session_id.clone());
        if config.debug {
            denoiser.set_vad_logging(true);
        }
        Ok(denoiser)
    }

    pub fn is_supported(&self, kind: DenoiserKind) -> bool {
        self.entries
            .get(&kind)
            .is_some_and(|entry| (entry.supported)(&entry.default_config))
    }

    pub fn supported_kinds(&self) -> Vec<DenoiserKind> {
        self.entries
            .keys()
            .copied()
            .filter(|&kind| self.is_supported(kind))
            .collect()
    }

    /// First supported kind from `priority` (default
    /// [`DEFAULT_PRIORITY`]), falling back to any registered-and-supported
    /// entry.
    pub fn best_available(&self, priority: Option<&[DenoiserKind]>) -> Option<DenoiserKind> {
        let priority = priority.unwrap_or(&DEFAULT_PRIORITY);
        priority
            .iter()
            .copied()
            .find(|&kind| self.is_supported(kind))
            .or_else(|| self.entries.keys().copied().find(|&k| self.is_supported(k)))
    }
}

fn spectral_constructor(config: &DenoiserConfig) -> Box<dyn DenoiseEngine> {
    Box::new(SpectralEngine::new(config.spectral))
}

fn neural_constructor(config: &DenoiserConfig) -> Box<dyn DenoiseEngine> {
    Box::new(NeuralEngine::new(config.neural.clone()))
}

/// The spectral kernel is linked into the binary — always available.
fn spectral_supported(_config: &DenoiserConfig) -> bool {
    true
}

/// The neural kernel additionally needs a configured model asset.
fn neural_supported(config: &DenoiserConfig) -> bool {
    config.neural.assets.is_configured() && !config.neural.model_file.is_empty()
}

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::with_builtins);

/// Process-wide registry with the built-ins registered.
pub fn global() -> &'static Registry {
    &GLOBAL
}
