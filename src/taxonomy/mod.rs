//! Two-level label hierarchy and its cached label embeddings.
//!
//! # Architecture
//!
//! - `Taxonomy`: parents (T0) each owning an ordered list of children (T1),
//!   immutable once loaded
//! - `TaxonomyIndex`: a taxonomy plus unit-norm label vectors for both levels
//! - `cache`: binary persistence of label vectors keyed by
//!   (taxonomy fingerprint, model id)

mod cache;

pub use cache::{LabelCacheError, LabelCacheStorage};

use crate::embeddings::{EmbeddingError, Embedder};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// File name of the label embedding cache inside the cache directory
pub const LABEL_CACHE_FILE: &str = "label_embeddings.bin";

#[derive(Debug, thiserror::Error)]
pub enum TaxonomyLoadError {
    #[error("failed to read taxonomy at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse taxonomy: {0}")]
    Parse(String),

    #[error("malformed taxonomy: {0}")]
    Malformed(String),

    #[error("taxonomy has no parent labels")]
    Empty,
}

#[derive(Debug, thiserror::Error)]
pub enum TaxonomyError {
    #[error(transparent)]
    Load(#[from] TaxonomyLoadError),

    #[error("label embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelNode {
    pub id: String,
    pub text: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParentLabel {
    pub node: LabelNode,
    /// Indices into `Taxonomy::children`, in declaration order
    pub children: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct ChildLabel {
    pub node: LabelNode,
    /// Index into `Taxonomy::parents`
    pub parent: usize,
}

#[derive(Debug, Clone)]
pub struct Taxonomy {
    parents: Vec<ParentLabel>,
    children: Vec<ChildLabel>,
    fingerprint: [u8; 32],
}

#[derive(Debug, Deserialize)]
struct RawTaxonomy {
    #[serde(default)]
    t0: Vec<RawParent>,
}

#[derive(Debug, Deserialize)]
struct RawParent {
    id: Option<String>,
    en: Option<String>,
    #[serde(default, alias = "description")]
    desc: Option<String>,
    #[serde(default)]
    t1: Vec<RawChild>,
}

#[derive(Debug, Deserialize)]
struct RawChild {
    id: Option<String>,
    en: Option<String>,
    #[serde(default, alias = "description")]
    desc: Option<String>,
}

impl Taxonomy {
    /// Load a taxonomy from a `.json` or `.yaml`/`.yml` file.
    pub fn load(path: &Path) -> Result<Self, TaxonomyLoadError> {
        let bytes = std::fs::read(path).map_err(|source| TaxonomyLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Self::from_bytes(&bytes, is_json)
    }

    /// Parse taxonomy content. YAML parsing also accepts JSON input.
    pub fn from_bytes(bytes: &[u8], is_json: bool) -> Result<Self, TaxonomyLoadError> {
        let raw: RawTaxonomy = if is_json {
            serde_json::from_slice(bytes).map_err(|e| TaxonomyLoadError::Parse(e.to_string()))?
        } else {
            let content = std::str::from_utf8(bytes)
                .map_err(|e| TaxonomyLoadError::Parse(format!("taxonomy is not valid utf8: {e}")))?;
            serde_yml::from_str(content).map_err(|e| TaxonomyLoadError::Parse(e.to_string()))?
        };

        Self::from_raw(raw, fingerprint(bytes))
    }

    fn from_raw(raw: RawTaxonomy, fingerprint: [u8; 32]) -> Result<Self, TaxonomyLoadError> {
        let mut parents: Vec<ParentLabel> = Vec::with_capacity(raw.t0.len());
        let mut children: Vec<ChildLabel> = Vec::new();
        let mut parent_ids = HashSet::new();
        let mut child_ids = HashSet::new();

        for (p_pos, raw_parent) in raw.t0.into_iter().enumerate() {
            let node = label_node(raw_parent.id, raw_parent.en, raw_parent.desc)
                .ok_or_else(|| {
                    TaxonomyLoadError::Malformed(format!(
                        "parent #{} is missing `id` or `en`",
                        p_pos + 1
                    ))
                })?;

            if !parent_ids.insert(node.id.clone()) {
                log::warn!("duplicate parent id '{}' ignored, keeping first", node.id);
                continue;
            }

            let parent_index = parents.len();
            let mut child_indices = Vec::with_capacity(raw_parent.t1.len());

            for (c_pos, raw_child) in raw_parent.t1.into_iter().enumerate() {
                let child = label_node(raw_child.id, raw_child.en, raw_child.desc)
                    .ok_or_else(|| {
                        TaxonomyLoadError::Malformed(format!(
                            "child #{} of parent '{}' is missing `id` or `en`",
                            c_pos + 1,
                            node.id
                        ))
                    })?;

                if !child_ids.insert(child.id.clone()) {
                    log::warn!("duplicate child id '{}' ignored, keeping first", child.id);
                    continue;
                }

                child_indices.push(children.len());
                children.push(ChildLabel {
                    node: child,
                    parent: parent_index,
                });
            }

            parents.push(ParentLabel {
                node,
                children: child_indices,
            });
        }

        if parents.is_empty() {
            return Err(TaxonomyLoadError::Empty);
        }

        Ok(Self {
            parents,
            children,
            fingerprint,
        })
    }

    pub fn parents(&self) -> &[ParentLabel] {
        &self.parents
    }

    pub fn children(&self) -> &[ChildLabel] {
        &self.children
    }

    /// SHA256 of the source file bytes.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }

    /// Child index → parent index, aligned with `children()`.
    pub fn child_parent_index(&self) -> Vec<usize> {
        self.children.iter().map(|c| c.parent).collect()
    }

    /// Find a parent by id or display text, case-insensitively.
    pub fn find_parent(&self, key: &str) -> Option<usize> {
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            return None;
        }
        self.parents.iter().position(|p| {
            p.node.id.to_lowercase() == key || p.node.text.to_lowercase() == key
        })
    }

    /// Texts embedded for parent labels.
    pub fn parent_label_texts(&self) -> Vec<String> {
        self.parents
            .iter()
            .map(|p| match &p.node.description {
                Some(desc) => format!("{}: {}", p.node.text, desc),
                None => p.node.text.clone(),
            })
            .collect()
    }

    /// Texts embedded for child labels; the parent name is prefixed so
    /// same-named children under different parents stay distinguishable.
    pub fn child_label_texts(&self) -> Vec<String> {
        self.children
            .iter()
            .map(|c| {
                let parent = &self.parents[c.parent].node.text;
                match &c.node.description {
                    Some(desc) => format!("{} > {}: {}", parent, c.node.text, desc),
                    None => format!("{} > {}", parent, c.node.text),
                }
            })
            .collect()
    }
}

fn label_node(id: Option<String>, en: Option<String>, desc: Option<String>) -> Option<LabelNode> {
    let id = id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())?;
    let text = en.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())?;
    let description = desc.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    Some(LabelNode {
        id,
        text,
        description,
    })
}

fn fingerprint(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Unit-norm label vectors for both levels.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelEmbeddings {
    pub dimensions: usize,
    /// P rows
    pub parents: Vec<Vec<f32>>,
    /// C rows
    pub children: Vec<Vec<f32>>,
    /// child index → parent index
    pub child_parent: Vec<usize>,
}

impl LabelEmbeddings {
    /// Return cached label vectors for `taxonomy` under `embedder`'s model,
    /// embedding and persisting them when the cache is missing or stale.
    pub fn load_or_build(
        taxonomy: &Taxonomy,
        embedder: &dyn Embedder,
        cache_dir: &Path,
    ) -> Result<Self, EmbeddingError> {
        let storage = LabelCacheStorage::new(cache_dir.join(LABEL_CACHE_FILE));
        let fingerprint = taxonomy.fingerprint();
        let model_id = embedder.model_id_hash();

        if storage.exists() {
            match storage.load(&fingerprint, &model_id, embedder.dimensions()) {
                Ok(cached)
                    if cached.parents.len() == taxonomy.parents().len()
                        && cached.child_parent == taxonomy.child_parent_index() =>
                {
                    log::info!(
                        "loaded {} parent and {} child label vectors from cache",
                        cached.parents.len(),
                        cached.children.len()
                    );
                    return Ok(cached);
                }
                Ok(_) => log::warn!("label cache does not match taxonomy shape, rebuilding"),
                Err(LabelCacheError::FingerprintMismatch) => {
                    log::info!("taxonomy changed, rebuilding label vectors")
                }
                Err(LabelCacheError::ModelMismatch) => {
                    log::info!("model changed, rebuilding label vectors")
                }
                Err(e) => log::warn!("label cache unusable ({e}), rebuilding"),
            }
        }

        let built = Self::build(taxonomy, embedder)?;

        if let Err(e) = std::fs::create_dir_all(cache_dir)
            .map_err(LabelCacheError::from)
            .and_then(|_| storage.save(&built, &fingerprint, &model_id))
        {
            log::warn!("failed to persist label vectors: {e}");
        }

        Ok(built)
    }

    /// Embed every label without consulting the cache.
    pub fn build(taxonomy: &Taxonomy, embedder: &dyn Embedder) -> Result<Self, EmbeddingError> {
        let parent_texts = taxonomy.parent_label_texts();
        let child_texts = taxonomy.child_label_texts();

        let parents = embedder.encode(&parent_texts)?;
        let children = embedder.encode(&child_texts)?;

        if parents.len() != parent_texts.len() || children.len() != child_texts.len() {
            return Err(EmbeddingError::EmbeddingFailed(
                "embedder returned a different number of label vectors".to_string(),
            ));
        }

        Ok(Self {
            dimensions: embedder.dimensions(),
            parents,
            children,
            child_parent: taxonomy.child_parent_index(),
        })
    }
}

/// A loaded taxonomy together with its label vectors.
pub struct TaxonomyIndex {
    taxonomy: Taxonomy,
    embeddings: LabelEmbeddings,
}

impl TaxonomyIndex {
    /// Load the taxonomy file and its label vectors. Any failure here is
    /// fatal for classification.
    pub fn open(
        taxonomy_path: &Path,
        embedder: &dyn Embedder,
        cache_dir: &Path,
    ) -> Result<Self, TaxonomyError> {
        let taxonomy = Taxonomy::load(taxonomy_path)?;
        Self::from_taxonomy(taxonomy, embedder, cache_dir)
    }

    pub fn from_taxonomy(
        taxonomy: Taxonomy,
        embedder: &dyn Embedder,
        cache_dir: &Path,
    ) -> Result<Self, TaxonomyError> {
        let embeddings = LabelEmbeddings::load_or_build(&taxonomy, embedder, cache_dir)?;
        Ok(Self {
            taxonomy,
            embeddings,
        })
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn embeddings(&self) -> &LabelEmbeddings {
        &self.embeddings
    }
}
