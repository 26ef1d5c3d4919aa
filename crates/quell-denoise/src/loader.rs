//! Lazy, single-flight acquisition of denoiser kernels and model blobs.
//!
//! Each loader performs its underlying fetch-and-materialize at most once
//! per configuration, no matter how many callers race on it. Failures are
//! fanned out to every concurrent waiter and nothing is cached, so the next
//! call retries from scratch.

use std::collections::HashMap;
use std::future::Future;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Artifact, LoadError};

/// First two bytes of any gzip stream.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Default neural model artifact name at the asset source.
pub const DEFAULT_MODEL_FILE: &str = "deepfilternet3.onnx.gz";

/// Default neural asset directory, relative to the working directory.
pub const DEFAULT_NEURAL_ASSETS: &str = "./deepfilternet";

/// Observable loader state.
///
/// A failed load reports [`LoadStatus::NotLoaded`] again (retry is always
/// possible); the failure itself is kept in [`ArtifactLoader::last_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    NotLoaded,
    Loading,
    Loaded,
}

type LoadResult<T> = Result<Arc<T>, LoadError>;
type CompletionRx<T> = watch::Receiver<Option<LoadResult<T>>>;

enum State<T> {
    Idle,
    Loading(CompletionRx<T>),
    Ready(Arc<T>),
}

struct LoaderInner<T> {
    artifact: Artifact,
    state: Mutex<State<T>>,
    last_error: Mutex<Option<LoadError>>,
    fetches: AtomicU64,
}

/// Single-flight memoizing loader for one artifact configuration.
///
/// The first caller kicks off the fetch on a background task; every caller
/// (including the first) then awaits the shared completion handle. Running
/// the fetch on its own task means a caller cancelling mid-await cannot
/// strand the other waiters.
pub struct ArtifactLoader<T> {
    inner: Arc<LoaderInner<T>>,
}

impl<T: Send + Sync + 'static> ArtifactLoader<T> {
    pub fn new(artifact: Artifact) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                artifact,
                state: Mutex::new(State::Idle),
                last_error: Mutex::new(None),
                fetches: AtomicU64::new(0),
            }),
        }
    }

    pub fn status(&self) -> LoadStatus {
        match &*self.inner.state.lock() {
            State::Idle => LoadStatus::NotLoaded,
            State::Loading(_) => LoadStatus::Loading,
            State::Ready(_) => LoadStatus::Loaded,
        }
    }

    /// Failure of the most recent load attempt, if it failed.
    pub fn last_error(&self) -> Option<LoadError> {
        self.inner.last_error.lock().clone()
    }

    /// Number of times the underlying fetch actually ran.
    pub fn fetch_invocations(&self) -> u64 {
        self.inner.fetches.load(Ordering::Relaxed)
    }

    /// Drop the cached artifact so the next `load` re-fetches.
    ///
    /// Not permitted while a load is in flight; returns `false` in that
    /// case and leaves the state untouched.
    pub fn reset(&self) -> bool {
        let mut state = self.inner.state.lock();
        if matches!(*state, State::Loading(_)) {
            tracing::warn!(artifact = %self.inner.artifact, "reset ignored while load in flight");
            return false;
        }
        *state = State::Idle;
        *self.inner.last_error.lock() = None;
        true
    }

    /// Load the artifact, coalescing with any load already in flight.
    ///
    /// `fetch` is only invoked by the caller that wins the race; everyone
    /// else awaits the same outcome.
    pub async fn load<F, Fut>(&self, fetch: F) -> LoadResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, LoadError>> + Send + 'static,
    {
        let mut rx = {
            let mut state = self.inner.state.lock();
            match &*state {
                State::Ready(value) => return Ok(Arc::clone(value)),
                State::Loading(rx) => rx.clone(),
                State::Idle => {
                    let (tx, rx) = watch::channel(None);
                    *state = State::Loading(rx.clone());
                    self.inner.fetches.fetch_add(1, Ordering::Relaxed);
                    let inner = Arc::clone(&self.inner);
                    let fut = fetch();
                    tokio::spawn(async move {
                        let result = fut.await.map(Arc::new);
                        {
                            let mut state = inner.state.lock();
                            match &result {
                                Ok(value) => *state = State::Ready(Arc::clone(value)),
                                Err(err) => {
                                    tracing::warn!(
                                        artifact = %inner.artifact,
                                        error = %err,
                                        "artifact load failed"
                                    );
                                    *state = State::Idle;
                                    *inner.last_error.lock() = Some(err.clone());
                                }
                            }
                        }
                        let _ = tx.send(Some(result));
                    });
                    rx
                }
            }
        };

        loop {
            let outcome = rx.borrow_and_update().clone();
            if let Some(result) = outcome {
                return result;
            }
            if rx.changed().await.is_err() {
                // fetch task died without reporting (runtime shutdown or panic)
                return Err(LoadError::Interrupted {
                    artifact: self.inner.artifact,
                });
            }
        }
    }
}

// ── Asset sources ───────────────────────────────────────────────────────

/// Where denoiser assets are served from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetSource {
    /// Base URL fetched with GET.
    Http(String),
    /// Local directory read from disk.
    Dir(PathBuf),
}

impl AssetSource {
    pub fn describe(&self) -> String {
        match self {
            AssetSource::Http(base) => base.clone(),
            AssetSource::Dir(dir) => dir.display().to_string(),
        }
    }

    /// True when the source actually points somewhere.
    pub fn is_configured(&self) -> bool {
        match self {
            AssetSource::Http(base) => !base.is_empty(),
            AssetSource::Dir(dir) => !dir.as_os_str().is_empty(),
        }
    }

    pub fn fetcher(&self) -> Arc<dyn AssetFetcher> {
        match self {
            AssetSource::Http(base) => Arc::new(HttpAssetFetcher::new(base.clone())),
            AssetSource::Dir(dir) => Arc::new(DirAssetFetcher::new(dir.clone())),
        }
    }
}

/// Transport used to materialize an asset's bytes.
///
/// Public so tests and embedders can substitute their own transport (e.g. a
/// counting stub, or an app-bundled resource store).
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, file_name: &str, artifact: Artifact) -> Result<Bytes, LoadError>;

    /// Human-readable source description for error context.
    fn describe(&self) -> String;
}

pub struct HttpAssetFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAssetFetcher {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, file_name: &str, artifact: Artifact) -> Result<Bytes, LoadError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), file_name);
        // ask for the raw artifact — middleware that decompresses anyway is
        // handled by the gzip re-framing step
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT_ENCODING, "identity")
            .send()
            .await
            .map_err(|e| LoadError::Fetch {
                artifact,
                source_desc: url.clone(),
                reason: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::HttpStatus {
                artifact,
                status: status.as_u16(),
            });
        }
        response.bytes().await.map_err(|e| LoadError::Fetch {
            artifact,
            source_desc: url,
            reason: e.to_string(),
        })
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

pub struct DirAssetFetcher {
    dir: PathBuf,
}

impl DirAssetFetcher {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl AssetFetcher for DirAssetFetcher {
    async fn fetch(&self, file_name: &str, artifact: Artifact) -> Result<Bytes, LoadError> {
        let path = self.dir.join(file_name);
        let data = tokio::fs::read(&path).await.map_err(|e| LoadError::Fetch {
            artifact,
            source_desc: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Bytes::from(data))
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}

// ── Neural model loader ─────────────────────────────────────────────────

/// Guarantee the model blob is gzip-framed, re-compressing if some
/// middleware transparently decompressed it in transit. The neural kernel
/// consumes the framed form; handing it a bare payload is undefined.
fn ensure_gzip_framed(raw: Bytes) -> Result<Bytes, LoadError> {
    if raw.len() >= 2 && raw[..2] == GZIP_MAGIC {
        return Ok(raw);
    }
    tracing::debug!(
        bytes = raw.len(),
        "model payload arrived decompressed — re-framing as gzip"
    );
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .and_then(|()| encoder.finish())
        .map(Bytes::from)
        .map_err(|e| LoadError::Recompress {
            artifact: Artifact::NeuralModel,
            reason: e.to_string(),
        })
}

/// Decode a gzip-framed blob back to its raw payload.
pub(crate) fn gunzip(blob: &[u8]) -> Result<Vec<u8>, LoadError> {
    let mut decoder = flate2::read::GzDecoder::new(blob);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| LoadError::Kernel {
            artifact: Artifact::NeuralModel,
            reason: format!("gzip decode: {e}"),
        })?;
    Ok(raw)
}

/// Fetches and caches the gzip-framed neural model blob, once per process
/// and configuration.
pub struct NeuralModelLoader {
    fetcher: Arc<dyn AssetFetcher>,
    file_name: String,
    inner: ArtifactLoader<Bytes>,
}

impl NeuralModelLoader {
    pub fn new(source: &AssetSource, file_name: &str) -> Self {
        Self::with_fetcher(source.fetcher(), file_name)
    }

    /// Build with an explicit transport (test stubs, embedder resources).
    pub fn with_fetcher(fetcher: Arc<dyn AssetFetcher>, file_name: &str) -> Self {
        Self {
            fetcher,
            file_name: file_name.to_string(),
            inner: ArtifactLoader::new(Artifact::NeuralModel),
        }
    }

    /// Fetch, validate, and cache the model blob (single-flight).
    pub async fn load(&self) -> Result<Arc<Bytes>, LoadError> {
        let fetcher = Arc::clone(&self.fetcher);
        let file_name = self.file_name.clone();
        self.inner
            .load(move || async move {
                let raw = fetcher.fetch(&file_name, Artifact::NeuralModel).await?;
                let blob = ensure_gzip_framed(raw)?;
                tracing::debug!(file = %file_name, bytes = blob.len(), "neural model blob cached");
                Ok(blob)
            })
            .await
    }

    pub fn status(&self) -> LoadStatus {
        self.inner.status()
    }

    pub fn last_error(&self) -> Option<LoadError> {
        self.inner.last_error()
    }

    pub fn fetch_invocations(&self) -> u64 {
        self.inner.fetch_invocations()
    }

    pub fn reset(&self) -> bool {
        self.inner.reset()
    }
}

// ── Spectral kernel loader ──────────────────────────────────────────────

/// Which build of the spectral kernel is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFlavor {
    Simd,
    Portable,
}

/// Probe the CPU for the SIMD level the spectral kernel's fast path wants.
#[cfg(target_arch = "x86_64")]
pub fn probe_simd_support() -> bool {
    std::arch::is_x86_feature_detected!("avx2")
}

#[cfg(target_arch = "aarch64")]
pub fn probe_simd_support() -> bool {
    // NEON is baseline on aarch64
    true
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn probe_simd_support() -> bool {
    false
}

/// Materializes the spectral kernel flavor once per process and
/// configuration: probes SIMD capability and honors `prefer_simd`.
pub struct SpectralKernelLoader {
    prefer_simd: bool,
    inner: ArtifactLoader<KernelFlavor>,
}

impl SpectralKernelLoader {
    pub fn new(prefer_simd: bool) -> Self {
        Self {
            prefer_simd,
            inner: ArtifactLoader::new(Artifact::SpectralKernel),
        }
    }

    pub async fn load(&self) -> Result<KernelFlavor, LoadError> {
        let prefer_simd = self.prefer_simd;
        let flavor = self
            .inner
            .load(move || async move {
                let flavor = if prefer_simd && probe_simd_support() {
                    KernelFlavor::Simd
                } else {
                    KernelFlavor::Portable
                };
                tracing::debug!(?flavor, prefer_simd, "spectral kernel selected");
                Ok(flavor)
            })
            .await?;
        Ok(*flavor)
    }

    pub fn status(&self) -> LoadStatus {
        self.inner.status()
    }

    pub fn reset(&self) -> bool {
        self.inner.reset()
    }
}

// ── Per-configuration loader cache ──────────────────────────────────────

static NEURAL_LOADERS: Lazy<Mutex<HashMap<(String, String), Arc<NeuralModelLoader>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static SPECTRAL_LOADERS: Lazy<Mutex<HashMap<bool, Arc<SpectralKernelLoader>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Process-wide neural model loader for `(source, file_name)`. Distinct
/// configurations get distinct loaders, so changing either key naturally
/// invalidates the cache.
pub fn neural_model_loader(source: &AssetSource, file_name: &str) -> Arc<NeuralModelLoader> {
    let key = (source.describe(), file_name.to_string());
    let mut loaders = NEURAL_LOADERS.lock();
    Arc::clone(
        loaders
            .entry(key)
            .or_insert_with(|| Arc::new(NeuralModelLoader::new(source, file_name))),
    )
}

/// Process-wide spectral kernel loader for the given flavor preference.
pub fn spectral_kernel_loader(prefer_simd: bool) -> Arc<SpectralKernelLoader> {
    let mut loaders = SPECTRAL_LOADERS.lock();
    Arc::clone(
        loaders
            .entry(prefer_simd)
            .or_insert_with(|| Arc::new(SpectralKernelLoader::new(prefer_simd))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Stub transport: counts fetches, optionally fails the first N.
    struct StubFetcher {
        payload: Bytes,
        calls: AtomicU32,
        fail_first: u32,
    }

    impl StubFetcher {
        fn new(payload: impl Into<Bytes>) -> Self {
            Self {
                payload: payload.into(),
                calls: AtomicU32::new(0),
                fail_first: 0,
            }
        }

        fn failing_first(payload: impl Into<Bytes>, fail_first: u32) -> Self {
            Self {
                fail_first,
                ..Self::new(payload)
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AssetFetcher for StubFetcher {
        async fn fetch(&self, _file_name: &str, artifact: Artifact) -> Result<Bytes, LoadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            // let concurrent callers pile up on the in-flight load
            tokio::time::sleep(Duration::from_millis(10)).await;
            if call < self.fail_first {
                return Err(LoadError::Fetch {
                    artifact,
                    source_desc: "stub".into(),
                    reason: "injected failure".into(),
                });
            }
            Ok(self.payload.clone())
        }

        fn describe(&self) -> String {
            "stub".into()
        }
    }

    fn gzipped(payload: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(payload).unwrap();
        enc.finish().unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_loads_fetch_once() {
        let fetcher = Arc::new(StubFetcher::new(gzipped(b"model")));
        let loader = Arc::new(NeuralModelLoader::with_fetcher(
            Arc::clone(&fetcher) as Arc<dyn AssetFetcher>,
            DEFAULT_MODEL_FILE,
        ));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let loader = Arc::clone(&loader);
                tokio::spawn(async move { loader.load().await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(loader.fetch_invocations(), 1);
        assert_eq!(loader.status(), LoadStatus::Loaded);
    }

    #[tokio::test]
    async fn test_failed_load_resets_and_retries() {
        let fetcher = Arc::new(StubFetcher::failing_first(gzipped(b"model"), 1));
        let loader = NeuralModelLoader::with_fetcher(
            Arc::clone(&fetcher) as Arc<dyn AssetFetcher>,
            DEFAULT_MODEL_FILE,
        );

        assert!(loader.load().await.is_err());
        assert_eq!(loader.status(), LoadStatus::NotLoaded);
        assert!(loader.last_error().is_some());

        // retry re-invokes the fetch and succeeds
        assert!(loader.load().await.is_ok());
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(loader.status(), LoadStatus::Loaded);
    }

    #[tokio::test]
    async fn test_loaded_result_is_memoized() {
        let fetcher = Arc::new(StubFetcher::new(gzipped(b"model")));
        let loader = NeuralModelLoader::with_fetcher(
            Arc::clone(&fetcher) as Arc<dyn AssetFetcher>,
            DEFAULT_MODEL_FILE,
        );

        loader.load().await.unwrap();
        loader.load().await.unwrap();
        loader.load().await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_reset_drops_cache() {
        let fetcher = Arc::new(StubFetcher::new(gzipped(b"model")));
        let loader = NeuralModelLoader::with_fetcher(
            Arc::clone(&fetcher) as Arc<dyn AssetFetcher>,
            DEFAULT_MODEL_FILE,
        );

        loader.load().await.unwrap();
        assert!(loader.reset());
        assert_eq!(loader.status(), LoadStatus::NotLoaded);
        loader.load().await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_decompressed_payload_is_reframed_as_gzip() {
        // middleware stripped the gzip framing; the cached blob must get it back
        let fetcher = Arc::new(StubFetcher::new(&b"raw onnx bytes"[..]));
        let loader = NeuralModelLoader::with_fetcher(
            Arc::clone(&fetcher) as Arc<dyn AssetFetcher>,
            DEFAULT_MODEL_FILE,
        );

        let blob = loader.load().await.unwrap();
        assert_eq!(&blob[..2], &GZIP_MAGIC);
        assert_eq!(gunzip(&blob).unwrap(), b"raw onnx bytes");
    }

    #[tokio::test]
    async fn test_gzipped_payload_kept_verbatim() {
        let framed = gzipped(b"model");
        let fetcher = Arc::new(StubFetcher::new(framed.clone()));
        let loader = NeuralModelLoader::with_fetcher(
            Arc::clone(&fetcher) as Arc<dyn AssetFetcher>,
            DEFAULT_MODEL_FILE,
        );

        let blob = loader.load().await.unwrap();
        assert_eq!(blob.as_ref(), framed.as_slice());
    }

    #[tokio::test]
    async fn test_dir_fetcher_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gz");
        std::fs::write(&path, gzipped(b"disk model")).unwrap();

        let source = AssetSource::Dir(dir.path().to_path_buf());
        let loader = NeuralModelLoader::new(&source, "model.gz");
        let blob = loader.load().await.unwrap();
        assert_eq!(gunzip(&blob).unwrap(), b"disk model");
    }

    #[tokio::test]
    async fn test_missing_file_surfaces_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = AssetSource::Dir(dir.path().to_path_buf());
        let loader = NeuralModelLoader::new(&source, "absent.gz");
        match loader.load().await {
            Err(LoadError::Fetch { artifact, .. }) => {
                assert_eq!(artifact, Artifact::NeuralModel);
            }
            other => panic!("expected fetch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spectral_loader_is_single_flight() {
        let loader = SpectralKernelLoader::new(true);
        let flavor = loader.load().await.unwrap();
        assert_eq!(loader.load().await.unwrap(), flavor);
        assert_eq!(loader.status(), LoadStatus::Loaded);
    }

    #[tokio::test]
    async fn test_spectral_prefer_simd_false_forces_portable() {
        let loader = SpectralKernelLoader::new(false);
        assert_eq!(loader.load().await.unwrap(), KernelFlavor::Portable);
    }

    #[test]
    fn test_asset_source_is_configured() {
        assert!(AssetSource::Http("http://localhost/models".into()).is_configured());
        assert!(!AssetSource::Http(String::new()).is_configured());
        assert!(AssetSource::Dir(PathBuf::from("./deepfilternet")).is_configured());
        assert!(!AssetSource::Dir(PathBuf::new()).is_configured());
    }
}
