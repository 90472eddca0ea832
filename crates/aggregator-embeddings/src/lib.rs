//! Embedding generation, the on-disk content-addressed cache, and cache GC.
//!
//! Model execution itself is delegated to an external inference runtime;
//! this crate owns normalisation, caching, and the lazy singleton that
//! coalesces concurrent first-callers into one model load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

pub use aggregator_core::generate_server_hash;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding model initialisation failed: {0}")]
    Init(String),
    #[error("embedding generation failed: {0}")]
    Generation(String),
    #[error("cache io error: {0}")]
    CacheIo(#[from] std::io::Error),
    #[error("cache file did not parse as JSON: {0}")]
    CacheParse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Dimension used when no backend is compiled in: `all-MiniLM-L6-v2`'s
/// native output size, matching `MCP_EMBEDDING_MODEL`'s default.
pub const DEFAULT_DIMENSION: usize = 384;

/// A pluggable text-to-vector backend. Implementations need not normalise
/// their output; normalisation happens once in [`EmbeddingService`].
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Lazily-initialised, process-wide embedding pipeline with an on-disk
/// per-server cache.
pub struct EmbeddingService {
    backend_init: Arc<dyn Fn() -> BackendFuture + Send + Sync>,
    backend: OnceCell<Arc<dyn EmbeddingBackend>>,
    cache_dir: PathBuf,
}

type BackendFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Arc<dyn EmbeddingBackend>>> + Send>>;

impl EmbeddingService {
    /// `init` is invoked at most once; concurrent callers before it
    /// resolves share the same in-flight attempt, and a failed attempt
    /// resets the slot so a later caller may retry (`OnceCell::get_or_try_init`).
    pub fn new<F, Fut>(cache_dir: impl Into<PathBuf>, init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Arc<dyn EmbeddingBackend>>> + Send + 'static,
    {
        EmbeddingService {
            backend_init: Arc::new(move || Box::pin(init())),
            backend: OnceCell::new(),
            cache_dir: cache_dir.into(),
        }
    }

    async fn backend(&self) -> Result<&Arc<dyn EmbeddingBackend>> {
        self.backend
            .get_or_try_init(|| (self.backend_init)())
            .await
    }

    /// Generate an L2-normalised embedding for `text`.
    pub async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let backend = self.backend().await?;
        let raw = backend.embed(text).await?;
        Ok(l2_normalize(raw))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Read `<cache_dir>/<hash>.json`; `None` on a missing or unparseable file.
    pub async fn get_cached_embeddings(&self, hash: &str) -> Option<HashMap<String, Vec<f32>>> {
        let path = self.cache_dir.join(format!("{hash}.json"));
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(map) => Some(map),
            Err(err) => {
                warn!("embedding cache file {:?} did not parse: {}", path, err);
                None
            }
        }
    }

    /// Write `map` to `<cache_dir>/<hash>.json`, flushing in ~1 MiB chunks
    /// rather than serialising the whole map up front.
    pub async fn save_embeddings_to_cache(
        &self,
        hash: &str,
        map: &HashMap<String, Vec<f32>>,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let path = self.cache_dir.join(format!("{hash}.json"));
        let tmp_path = self.cache_dir.join(format!("{hash}.json.tmp"));

        const FLUSH_THRESHOLD: usize = 1024 * 1024;
        let mut buffer = String::with_capacity(FLUSH_THRESHOLD + 4096);
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        buffer.push('{');
        for (idx, (name, vector)) in map.iter().enumerate() {
            if idx > 0 {
                buffer.push(',');
            }
            buffer.push_str(&serde_json::to_string(name)?);
            buffer.push(':');
            buffer.push('[');
            for (i, v) in vector.iter().enumerate() {
                if i > 0 {
                    buffer.push(',');
                }
                buffer.push_str(&v.to_string());
            }
            buffer.push(']');

            if buffer.len() >= FLUSH_THRESHOLD {
                use tokio::io::AsyncWriteExt;
                file.write_all(buffer.as_bytes()).await?;
                buffer.clear();
            }
        }
        buffer.push('}');
        {
            use tokio::io::AsyncWriteExt;
            file.write_all(buffer.as_bytes()).await?;
            file.flush().await?;
        }
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// Delete every `<cache_dir>/*.json` file whose stem is not in
    /// `active_hashes`. Non-JSON files are left untouched. A missing
    /// directory is not an error.
    pub async fn cleanup_unused_cache(&self, active_hashes: &[String]) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            if !active_hashes.iter().any(|h| h == stem) {
                debug!("removing orphaned embedding cache file: {:?}", path);
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
    vector
}

/// Approximate resident size of a cached-embeddings map: 2 bytes per
/// character of each key plus 8 bytes per stored double.
pub fn calculate_memory_usage(map: &HashMap<String, Vec<f32>>) -> usize {
    map.iter()
        .map(|(key, vector)| key.chars().count() * 2 + vector.len() * 8)
        .sum()
}

#[cfg(feature = "local-embeddings")]
pub mod fastembed_backend {
    use super::*;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use tokio::sync::Mutex;

    /// `fastembed`-backed implementation, gated behind the
    /// `local-embeddings` feature. Model id comes from `MCP_EMBEDDING_MODEL`
    /// at the call site; this wrapper is agnostic of env vars.
    pub struct FastEmbedBackend {
        model: Mutex<TextEmbedding>,
    }

    impl FastEmbedBackend {
        pub fn new(model_name: EmbeddingModel) -> Result<Self> {
            let model = TextEmbedding::try_new(InitOptions::new(model_name))
                .map_err(|e| EmbeddingError::Init(e.to_string()))?;
            Ok(FastEmbedBackend {
                model: Mutex::new(model),
            })
        }
    }

    #[async_trait]
    impl EmbeddingBackend for FastEmbedBackend {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut model = self.model.lock().await;
            let embeddings = model
                .embed(vec![text.to_string()], None)
                .map_err(|e| EmbeddingError::Generation(e.to_string()))?;
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| EmbeddingError::Generation("empty embedding batch".to_string()))
        }
    }
}
