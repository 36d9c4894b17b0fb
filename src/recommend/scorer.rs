use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::candidate::Candidate;
use crate::embeddings::{dot, Embedder, EmbeddingError};

const LEXICAL_WEIGHT: f32 = 0.5;
const SEMANTIC_WEIGHT: f32 = 0.2;
const DOMAIN_WEIGHT: f32 = 0.2;
const RECENCY_WEIGHT: f32 = 0.1;

/// Recency reaches its floor after three years.
const RECENCY_HORIZON_DAYS: f32 = 365.0 * 3.0;
const RECENCY_FLOOR: f32 = 0.2;
const RECENCY_UNKNOWN: f32 = 0.5;

/// Scores resolved web candidates against a label set. Every term is in
/// [0, 1] and so is the weighted sum.
#[derive(Debug, Clone)]
pub struct CandidateScorer {
    domain_quality: HashMap<String, f32>,
    default_quality: f32,
}

impl CandidateScorer {
    pub fn new(domain_quality: HashMap<String, f32>, default_quality: f32) -> Self {
        Self {
            domain_quality,
            default_quality: default_quality.clamp(0.0, 1.0),
        }
    }

    /// Text embedded once per request to represent the label set.
    pub fn label_text(labels: &[String]) -> String {
        labels.join(", ")
    }

    /// Embed the candidate and score it against a precomputed label vector.
    pub fn score(
        &self,
        embedder: &dyn Embedder,
        labels: &[String],
        label_vector: &[f32],
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<f32, EmbeddingError> {
        let candidate_vector = embedder.encode_one(&candidate.scoring_text())?;
        Ok(self.score_with_vector(labels, label_vector, candidate, &candidate_vector, now))
    }

    pub fn score_with_vector(
        &self,
        labels: &[String],
        label_vector: &[f32],
        candidate: &Candidate,
        candidate_vector: &[f32],
        now: DateTime<Utc>,
    ) -> f32 {
        let lexical = lexical_overlap(labels, &candidate.title);
        let semantic = ((dot(label_vector, candidate_vector) + 1.0) / 2.0).clamp(0.0, 1.0);
        let quality = self.domain_quality(&candidate.domain);
        let recency = recency(candidate.published, now);

        let score = LEXICAL_WEIGHT * lexical
            + SEMANTIC_WEIGHT * semantic
            + DOMAIN_WEIGHT * quality
            + RECENCY_WEIGHT * recency;

        log::debug!(
            "scored {} lexical={lexical:.3} semantic={semantic:.3} quality={quality:.2} recency={recency:.3} total={score:.4}",
            candidate.url
        );

        score.clamp(0.0, 1.0)
    }

    pub fn domain_quality(&self, domain: &str) -> f32 {
        self.domain_quality
            .get(domain)
            .copied()
            .unwrap_or(self.default_quality)
            .clamp(0.0, 1.0)
    }
}

/// Fraction of labels found (case-insensitively) inside the title.
pub fn lexical_overlap(labels: &[String], title: &str) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let title = title.to_lowercase();
    let hits = labels
        .iter()
        .filter(|l| title.contains(&l.to_lowercase()))
        .count();
    hits as f32 / labels.len() as f32
}

/// 1.0 for today, falling linearly to 0.2 at three years; 0.5 when unknown.
pub fn recency(published: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f32 {
    let Some(published) = published else {
        return RECENCY_UNKNOWN;
    };
    let days = (now.date_naive() - published.date_naive()).num_days() as f32;
    if days <= 0.0 {
        1.0
    } else if days >= RECENCY_HORIZON_DAYS {
        RECENCY_FLOOR
    } else {
        (1.0 - (days / RECENCY_HORIZON_DAYS) * (1.0 - RECENCY_FLOOR)).clamp(0.0, 1.0)
    }
}

/// (score desc, domain asc, title asc)
pub fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.domain.cmp(&b.domain))
        .then_with(|| a.title.cmp(&b.title))
}
