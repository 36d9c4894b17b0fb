//! Batch classification of titles into (parent, child) taxonomy pairs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embeddings::{dot, Embedder, EmbeddingError};
use crate::taxonomy::{LabelEmbeddings, TaxonomyIndex};

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("no titles to classify")]
    EmptyBatch,

    #[error("too many titles: {got} (max {max})")]
    TooManyTitles { got: usize, max: usize },

    #[error("alpha must be within [0, 1], got {0}")]
    InvalidAlpha(f32),

    #[error("topk_parent must be at least 1")]
    InvalidTopK,

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("embedder returned {got} vectors for {expected} titles")]
    VectorCountMismatch { expected: usize, got: usize },
}

/// Result for one classified item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub parent: usize,
    pub child: Option<usize>,
}

/// Index of the maximal value; the lowest index wins ties.
fn argmax(values: impl Iterator<Item = (usize, f32)>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, value) in values {
        match best {
            Some((_, b)) if value <= b => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Indices of the `k` highest scores, ties broken by lower index.
fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    order.truncate(k);
    order
}

/// Assign each unit vector to a parent and, when possible, a child.
///
/// `combined = (1 - alpha) * child_score + alpha * parent_score[parent_of(child)]`.
/// With `0 < topk_parent < P` only children under the item's top-K parents
/// compete; if that leaves none the item gets a parent-only assignment.
pub fn assign(
    vectors: &[Vec<f32>],
    labels: &LabelEmbeddings,
    alpha: f32,
    topk_parent: Option<usize>,
) -> Vec<Assignment> {
    let parent_count = labels.parents.len();
    let mask_k = topk_parent.filter(|&k| k > 0 && k < parent_count);

    vectors
        .iter()
        .map(|v| {
            let parent_scores: Vec<f32> = labels.parents.iter().map(|p| dot(v, p)).collect();
            let best_parent = argmax(parent_scores.iter().copied().enumerate()).unwrap_or(0);

            if labels.children.is_empty() {
                return Assignment {
                    parent: best_parent,
                    child: None,
                };
            }

            let combined: Vec<f32> = labels
                .children
                .iter()
                .zip(labels.child_parent.iter())
                .map(|(c, &p)| (1.0 - alpha) * dot(v, c) + alpha * parent_scores[p])
                .collect();

            let allowed: Option<Vec<bool>> = mask_k.map(|k| {
                let mut keep = vec![false; parent_count];
                for p in top_k_indices(&parent_scores, k) {
                    keep[p] = true;
                }
                keep
            });

            let best_child = argmax(
                combined
                    .iter()
                    .copied()
                    .enumerate()
                    .filter(|(c, _)| match &allowed {
                        Some(keep) => keep[labels.child_parent[*c]],
                        None => true,
                    }),
            );

            match best_child {
                Some(c) => Assignment {
                    parent: labels.child_parent[c],
                    child: Some(c),
                },
                None => Assignment {
                    parent: best_parent,
                    child: None,
                },
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParentBucket {
    pub total: usize,
    pub children: BTreeMap<String, usize>,
}

/// Aggregated classification of a title batch. Same shape as the profile file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileHistogram {
    pub user_id: String,
    pub total_titles: usize,
    pub tags_histogram: BTreeMap<String, ParentBucket>,
    pub flat_subfield_histogram: BTreeMap<String, usize>,
    pub t0_ranked: Vec<(String, usize)>,
    pub t1_ranked: Vec<(String, usize)>,
}

/// Sort by (count desc, label asc).
pub fn rank(counts: &HashMap<String, usize>) -> Vec<(String, usize)> {
    let mut ranked: Vec<(String, usize)> =
        counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

#[derive(Debug, Clone, Copy)]
pub struct AnalyzeOptions {
    pub alpha: f32,
    pub topk_parent: Option<usize>,
    pub max_titles: usize,
    pub max_title_chars: usize,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            alpha: 0.30,
            topk_parent: Some(8),
            max_titles: 500,
            max_title_chars: 300,
        }
    }
}

pub struct HierarchicalClassifier {
    index: Arc<TaxonomyIndex>,
    embedder: Arc<dyn Embedder>,
}

impl HierarchicalClassifier {
    pub fn new(index: Arc<TaxonomyIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self { index, embedder }
    }

    pub fn classify(
        &self,
        texts: &[String],
        alpha: f32,
        topk_parent: Option<usize>,
    ) -> Result<Vec<Assignment>, ClassifyError> {
        if texts.is_empty() {
            return Err(ClassifyError::EmptyBatch);
        }
        if !(0.0..=1.0).contains(&alpha) {
            return Err(ClassifyError::InvalidAlpha(alpha));
        }
        if topk_parent == Some(0) {
            return Err(ClassifyError::InvalidTopK);
        }

        let vectors = self.embedder.encode(texts)?;
        if vectors.len() != texts.len() {
            return Err(ClassifyError::VectorCountMismatch {
                expected: texts.len(),
                got: vectors.len(),
            });
        }

        Ok(assign(&vectors, self.index.embeddings(), alpha, topk_parent))
    }

    /// Classify a user's titles and aggregate them into histograms.
    ///
    /// Blank titles are not classified but still count toward
    /// `total_titles`, which reports the submitted batch size.
    pub fn analyze(
        &self,
        user_id: &str,
        titles: &[String],
        options: &AnalyzeOptions,
    ) -> Result<ProfileHistogram, ClassifyError> {
        if titles.len() > options.max_titles {
            return Err(ClassifyError::TooManyTitles {
                got: titles.len(),
                max: options.max_titles,
            });
        }

        let cleaned: Vec<String> = titles
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| t.chars().take(options.max_title_chars).collect())
            .collect();
        if cleaned.is_empty() {
            return Err(ClassifyError::EmptyBatch);
        }

        let assignments = self.classify(&cleaned, options.alpha, options.topk_parent)?;
        let mut histogram = self.aggregate(user_id, &assignments);
        histogram.total_titles = titles.len();

        log::info!(
            "classified {} titles for user '{}' into {} parents",
            histogram.total_titles,
            user_id,
            histogram.tags_histogram.len()
        );

        Ok(histogram)
    }

    pub fn aggregate(&self, user_id: &str, assignments: &[Assignment]) -> ProfileHistogram {
        let taxonomy = self.index.taxonomy();
        let mut tags_histogram: BTreeMap<String, ParentBucket> = BTreeMap::new();
        let mut parent_counts: HashMap<String, usize> = HashMap::new();
        let mut child_counts: HashMap<String, usize> = HashMap::new();

        for a in assignments {
            let parent = taxonomy.parents()[a.parent].node.text.clone();
            let bucket = tags_histogram.entry(parent.clone()).or_default();
            bucket.total += 1;
            *parent_counts.entry(parent.clone()).or_default() += 1;

            if let Some(c) = a.child {
                let child = &taxonomy.children()[c].node.text;
                *bucket.children.entry(child.clone()).or_default() += 1;
                *child_counts
                    .entry(format!("{} > {}", parent, child))
                    .or_default() += 1;
            }
        }

        ProfileHistogram {
            user_id: user_id.to_string(),
            total_titles: assignments.len(),
            tags_histogram,
            flat_subfield_histogram: child_counts.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            t0_ranked: rank(&parent_counts),
            t1_ranked: rank(&child_counts),
        }
    }
}
