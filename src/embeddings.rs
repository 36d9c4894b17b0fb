//! Text embedding backends.
//!
//! Everything downstream (taxonomy labels, title classification, candidate
//! scoring) talks to the [`Embedder`] capability and relies on one promise:
//! every returned vector has unit L2 norm, so a dot product is a cosine.

use fastembed::{InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::Mutex;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Anything that turns a batch of texts into unit-norm vectors.
///
/// Implementations must be deterministic for a given model and always
/// return vectors of `dimensions()` length, one per input, in input order.
pub trait Embedder: Send + Sync {
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Canonical model key, part of the label embedding cache identity.
    fn model_key(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// SHA256 of the model key.
    fn model_id_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.model_key().as_bytes());
        hasher.finalize().into()
    }

    /// Convenience for a single text.
    fn encode_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.encode(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}

/// Named embedding backends selectable from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    MiniLm,
    MultiMiniLm,
    MultilingualE5Base,
    MultilingualE5Large,
    BgeSmall,
    BgeBase,
}

impl EmbeddingBackend {
    pub fn parse(key: &str) -> Result<Self, EmbeddingError> {
        match key.trim().to_lowercase().as_str() {
            "minilm" | "all-minilm-l6-v2" => Ok(Self::MiniLm),
            "multiminilm" | "paraphrase-multilingual-minilm-l12-v2" => Ok(Self::MultiMiniLm),
            "me5" | "multilingual-e5-base" => Ok(Self::MultilingualE5Base),
            "me5large" | "multilingual-e5-large" => Ok(Self::MultilingualE5Large),
            "bge-small" | "bge-small-en-v1.5" => Ok(Self::BgeSmall),
            "bge-base" | "bge-base-en-v1.5" => Ok(Self::BgeBase),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: minilm, multiminilm, me5, me5large, bge-small, bge-base",
                key
            ))),
        }
    }

    /// Canonical key; aliases collapse onto it.
    pub fn key(&self) -> &'static str {
        match self {
            Self::MiniLm => "minilm",
            Self::MultiMiniLm => "multiminilm",
            Self::MultilingualE5Base => "me5",
            Self::MultilingualE5Large => "me5large",
            Self::BgeSmall => "bge-small",
            Self::BgeBase => "bge-base",
        }
    }

    fn fastembed_model(&self) -> fastembed::EmbeddingModel {
        match self {
            Self::MiniLm => fastembed::EmbeddingModel::AllMiniLML6V2,
            Self::MultiMiniLm => fastembed::EmbeddingModel::ParaphraseMLMiniLML12V2,
            Self::MultilingualE5Base => fastembed::EmbeddingModel::MultilingualE5Base,
            Self::MultilingualE5Large => fastembed::EmbeddingModel::MultilingualE5Large,
            Self::BgeSmall => fastembed::EmbeddingModel::BGESmallENV15,
            Self::BgeBase => fastembed::EmbeddingModel::BGEBaseENV15,
        }
    }
}

/// Local ONNX embedder backed by fastembed.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
    backend: EmbeddingBackend,
    dimensions: usize,
}

impl FastEmbedder {
    /// Load (downloading on first use) the model for `backend`.
    /// Model files are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(backend: EmbeddingBackend, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(backend.fastembed_model())
            .with_cache_dir(models_dir)
            .with_show_download_progress(false);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::detect_dimensions(&mut model)?;
        log::info!(
            "loaded embedding model '{}' ({} dims)",
            backend.key(),
            dimensions
        );

        Ok(Self {
            model: Mutex::new(model),
            backend,
            dimensions,
        })
    }

    fn detect_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to detect dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl Embedder for FastEmbedder {
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let raw = model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if raw.len() != texts.len() {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                raw.len()
            )));
        }

        Ok(raw.into_iter().map(normalize).collect())
    }

    fn model_key(&self) -> &str {
        self.backend.key()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Scale to unit length. Zero (or non-finite norm) vectors are returned unchanged.
pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm <= 1e-9 {
        return v;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    v
}
