use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::store::{CandidateStore, StoredArticle};
use super::{RecommendRequest, Recommendation, Strategy};
use crate::profile::ProfileStore;

/// Weights and limits of the stored-article ranking.
#[derive(Debug, Clone)]
pub struct SqlSettings {
    pub limit: i64,
    pub decay_days: f64,
    pub tag_weight: f64,
    pub recency_weight: f64,
    pub default_source: String,
}

impl Default for SqlSettings {
    fn default() -> Self {
        Self {
            limit: 200,
            decay_days: 90.0,
            tag_weight: 0.7,
            recency_weight: 0.3,
            default_source: "New York Times".to_string(),
        }
    }
}

/// Number of labels used per attempt.
const ATTEMPT_LABELS: usize = 3;

/// exp(-age_days / decay_days); 0 for an unknown date.
pub fn recency(pub_date: Option<DateTime<Utc>>, now: DateTime<Utc>, decay_days: f64) -> f64 {
    let Some(pub_date) = pub_date else {
        return 0.0;
    };
    let days = (now - pub_date).num_days().max(0) as f64;
    (-days / decay_days.max(1e-6)).exp()
}

/// Sum of confidences of the labels matching `labels_lower`.
pub fn tag_score(article: &StoredArticle, labels_lower: &[String]) -> f64 {
    article
        .labels
        .iter()
        .filter(|l| labels_lower.contains(&l.tag.to_lowercase()))
        .map(|l| l.score.unwrap_or(0.0))
        .sum()
}

/// Highest-scoring article and its score. Earlier articles win ties, so
/// fetch order (newest first) decides between equal scores.
pub fn pick_best<'a>(
    articles: &'a [StoredArticle],
    labels_lower: &[String],
    now: DateTime<Utc>,
    settings: &SqlSettings,
) -> Option<(&'a StoredArticle, f64)> {
    let mut scored: Vec<(&StoredArticle, f64, f64, f64)> = articles
        .iter()
        .map(|a| {
            let tags = tag_score(a, labels_lower);
            let rec = recency(a.pub_date, now, settings.decay_days);
            (a, settings.tag_weight * tags + settings.recency_weight * rec, tags, rec)
        })
        .collect();

    let mut best: Option<(&StoredArticle, f64)> = None;
    for &(article, score, _, _) in &scored {
        match best {
            Some((_, b)) if score <= b => {}
            _ => best = Some((article, score)),
        }
    }

    if log::log_enabled!(log::Level::Debug) {
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (article, score, tags, rec) in scored.iter().take(5) {
            log::debug!(
                "sql: cand title='{}' score={score:.4} tag={tags:.4} rec={rec:.4}",
                article.title.as_deref().unwrap_or_default()
            );
        }
    }

    best
}

/// Map a stored article to the recommendation payload.
pub fn to_recommendation(
    article: &StoredArticle,
    now: DateTime<Utc>,
    default_source: &str,
) -> Recommendation {
    let byline = article
        .byline
        .as_deref()
        .unwrap_or_default()
        .replace("By ", "")
        .trim()
        .to_string();

    Recommendation {
        title: article
            .title
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        source: if byline.is_empty() {
            default_source.to_string()
        } else {
            byline
        },
        url: article.web_url.clone().unwrap_or_default(),
        image_url: article.image_url.clone(),
        date: Some(article.pub_date.unwrap_or(now).format("%Y/%m/%d").to_string()),
    }
}

/// Recommends from the persisted article store. With `use_profile`, the
/// user's top profile labels are tried before the request labels.
pub struct SqlRecommender {
    store: Arc<dyn CandidateStore>,
    profile: Arc<ProfileStore>,
    settings: SqlSettings,
    /// Explicit on/off; `None` checks the store on each request
    enabled: Option<bool>,
}

impl SqlRecommender {
    pub fn new(
        store: Arc<dyn CandidateStore>,
        profile: Arc<ProfileStore>,
        settings: SqlSettings,
        enabled: Option<bool>,
    ) -> Self {
        Self {
            store,
            profile,
            settings,
            enabled,
        }
    }

    /// Label sets to try, in order.
    pub fn attempts(&self, request: &RecommendRequest) -> Vec<Vec<String>> {
        let mut attempts = Vec::new();

        if request.use_profile {
            match self.profile.top_child_labels(ATTEMPT_LABELS) {
                Ok(labels) if !labels.is_empty() => {
                    log::info!("sql: profile labels {:?}", labels);
                    attempts.push(labels);
                }
                Ok(_) => log::info!("sql: profile has no ranked child labels"),
                Err(e) => log::warn!("sql: failed to load profile: {e}"),
            }
        }

        let base: Vec<String> = request
            .labels
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .take(ATTEMPT_LABELS)
            .map(str::to_string)
            .collect();
        if !base.is_empty() {
            attempts.push(base);
        }

        attempts
    }
}

#[async_trait::async_trait]
impl Strategy for SqlRecommender {
    fn name(&self) -> &'static str {
        "sql"
    }

    async fn enabled(&self) -> bool {
        match self.enabled {
            Some(flag) => flag,
            None => match self.store.ping().await {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("sql: store check failed: {e:#}");
                    false
                }
            },
        }
    }

    async fn attempt(&self, request: &RecommendRequest) -> anyhow::Result<Option<Recommendation>> {
        let attempts = self.attempts(request);
        if attempts.is_empty() {
            log::info!("sql: no labels provided or derived");
            return Ok(None);
        }

        let mut last_error: Option<String> = None;

        for (idx, labels) in attempts.iter().enumerate() {
            let labels_lower: Vec<String> = labels.iter().map(|l| l.to_lowercase()).collect();
            log::info!("sql: attempt {} using {:?}", idx + 1, labels_lower);

            let articles = match self
                .store
                .fetch_by_labels(&labels_lower, self.settings.limit)
                .await
            {
                Ok(articles) => articles,
                Err(e) => {
                    log::warn!("sql: fetch failed on attempt {}: {e:#}", idx + 1);
                    last_error = Some(format!("{e:#}"));
                    continue;
                }
            };

            let now = Utc::now();
            if let Some((best, score)) = pick_best(&articles, &labels_lower, now, &self.settings) {
                log::info!("sql: picked article {} (score {score:.4})", best.id);
                return Ok(Some(to_recommendation(
                    best,
                    now,
                    &self.settings.default_source,
                )));
            }
        }

        match last_error {
            Some(e) => log::info!(
                "sql: no pick after {} attempts (last error: {e})",
                attempts.len()
            ),
            None => log::info!("sql: 0 candidates across {} attempts", attempts.len()),
        }
        Ok(None)
    }
}
