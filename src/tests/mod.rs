//! Cross-module tests. Everything here runs offline: embeddings come from a
//! keyword embedder and network/database collaborators are in-memory fakes.

mod recommend;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::embeddings::{normalize, Embedder, EmbeddingError};
use crate::taxonomy::TaxonomyIndex;

pub const TAXONOMY_YAML: &str = r#"
t0:
  - id: science
    en: Science
    desc: physics biology
    t1:
      - id: physics
        en: Physics
        desc: quantum particles
      - id: biology
        en: Biology
        desc: cells genes
  - id: art
    en: Art
    desc: painting music
    t1:
      - id: painting
        en: Painting
        desc: canvas museum
      - id: music
        en: Music
        desc: songs concert
"#;

const VOCABULARY: [&str; 14] = [
    "science", "physics", "quantum", "particles", "biology", "cells", "genes", "art", "painting",
    "canvas", "museum", "music", "songs", "concert",
];

/// Bag-of-words over a fixed vocabulary, plus one slot for "anything else".
/// Counts `encode` calls.
#[derive(Default)]
pub struct KeywordEmbedder {
    calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0; VOCABULARY.len() + 1];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            if let Some(i) = VOCABULARY.iter().position(|w| *w == token) {
                v[i] += 1.0;
            }
        }
        if v.iter().all(|x| *x == 0.0) {
            v[VOCABULARY.len()] = 1.0;
        }
        normalize(v)
    }
}

impl Embedder for KeywordEmbedder {
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    fn model_key(&self) -> &str {
        "keyword"
    }

    fn dimensions(&self) -> usize {
        VOCABULARY.len() + 1
    }
}

/// Keyword embedder that fails instead of encoding. With a trigger it fails
/// only for batches containing a text with that (lowercase) substring.
pub struct FailingEmbedder {
    inner: KeywordEmbedder,
    trigger: Option<&'static str>,
}

impl FailingEmbedder {
    pub fn always() -> Self {
        Self {
            inner: KeywordEmbedder::default(),
            trigger: None,
        }
    }

    pub fn when_text_contains(trigger: &'static str) -> Self {
        Self {
            inner: KeywordEmbedder::default(),
            trigger: Some(trigger),
        }
    }
}

impl Embedder for FailingEmbedder {
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let fails = match self.trigger {
            None => true,
            Some(trigger) => texts.iter().any(|t| t.to_lowercase().contains(trigger)),
        };
        if fails {
            return Err(EmbeddingError::EmbeddingFailed("backend unavailable".to_string()));
        }
        self.inner.encode(texts)
    }

    fn model_key(&self) -> &str {
        self.inner.model_key()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

pub fn write_taxonomy(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("taxonomy.yaml");
    std::fs::write(&path, TAXONOMY_YAML).unwrap();
    path
}

pub fn open_index(dir: &Path, embedder: &dyn Embedder) -> Arc<TaxonomyIndex> {
    let path = write_taxonomy(dir);
    Arc::new(TaxonomyIndex::open(&path, embedder, &dir.join("cache")).unwrap())
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
