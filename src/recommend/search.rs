use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use super::cache::{cache_key, RecommendationCache};
use super::candidate::Candidate;
use super::normalize::{domain_of, normalize_url};
use super::providers::{MetadataResolver, SearchProvider};
use super::scorer::{compare, CandidateScorer};
use super::{RecommendRequest, Recommendation, Strategy};
use crate::embeddings::Embedder;

/// Query strings for a label set: one per label, then cross-label
/// templates, deduplicated in first-seen order.
pub fn expand_queries(labels: &[String], max_queries: usize) -> Vec<String> {
    let mut queries: Vec<String> = labels
        .iter()
        .map(|l| format!("longform deep dive {l}"))
        .collect();

    if let (Some(a), Some(b)) = (labels.first(), labels.get(1)) {
        queries.push(format!("{a} {b} analysis essay"));
    }
    if let (Some(b), Some(c)) = (labels.get(1), labels.get(2)) {
        queries.push(format!("{b} {c} investigative piece"));
    }
    if let (Some(a), Some(c)) = (labels.first(), labels.get(2)) {
        queries.push(format!("best article {a} {c}"));
    }

    let mut seen = HashSet::new();
    queries.retain(|q| seen.insert(q.clone()));
    queries.truncate(max_queries);
    queries
}

/// Web search → metadata → scoring, with a daily cache in front.
pub struct SearchRecommender {
    provider: Arc<dyn SearchProvider>,
    resolver: Arc<dyn MetadataResolver>,
    embedder: Arc<dyn Embedder>,
    scorer: CandidateScorer,
    cache: Arc<RecommendationCache>,
    /// Empty allows every domain
    allowlist: HashSet<String>,
    results_per_query: usize,
    max_queries: usize,
}

impl SearchRecommender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        resolver: Arc<dyn MetadataResolver>,
        embedder: Arc<dyn Embedder>,
        scorer: CandidateScorer,
        cache: Arc<RecommendationCache>,
        allowlist: HashSet<String>,
        results_per_query: usize,
        max_queries: usize,
    ) -> Self {
        Self {
            provider,
            resolver,
            embedder,
            scorer,
            cache,
            allowlist,
            results_per_query,
            max_queries,
        }
    }

    fn allowed(&self, domain: &str) -> bool {
        self.allowlist.is_empty() || self.allowlist.contains(domain)
    }

    async fn collect_urls(&self, queries: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();

        for query in queries {
            let links = match self.provider.search(query, self.results_per_query).await {
                Ok(links) => links,
                Err(e) => {
                    log::warn!("search query '{query}' failed: {e}");
                    continue;
                }
            };
            log::debug!("query '{query}' returned {} links", links.len());

            for link in links {
                let normalized = normalize_url(&link);
                if seen.insert(normalized.clone()) {
                    urls.push(normalized);
                }
            }
        }

        urls
    }

    async fn resolve_all(&self, urls: &[String]) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for url in urls {
            let Some(domain) = domain_of(url) else {
                continue;
            };
            if !self.allowed(&domain) {
                log::debug!("{url}: domain not allow-listed");
                continue;
            }
            match self.resolver.resolve(url).await {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => log::debug!("{url}: no metadata"),
                Err(e) => log::debug!("{url}: resolve failed: {e}"),
            }
        }
        candidates
    }
}

#[async_trait::async_trait]
impl Strategy for SearchRecommender {
    fn name(&self) -> &'static str {
        "search"
    }

    async fn attempt(&self, request: &RecommendRequest) -> anyhow::Result<Option<Recommendation>> {
        let labels = &request.labels;
        let key = cache_key(labels, Utc::now().date_naive());

        if let Some(hit) = self.cache.get(&key) {
            log::info!("search: cache hit for {:?}", labels);
            return Ok(Some(hit));
        }

        if !self.provider.is_configured() {
            log::info!("search: provider '{}' not configured", self.provider.name());
            return Ok(None);
        }

        let queries = expand_queries(labels, self.max_queries);
        let urls = self.collect_urls(&queries).await;
        let candidates = self.resolve_all(&urls).await;

        log::info!(
            "search: {} queries, {} unique urls, {} resolved",
            queries.len(),
            urls.len(),
            candidates.len()
        );

        if candidates.is_empty() {
            return Ok(None);
        }

        let label_vector = self
            .embedder
            .encode_one(&CandidateScorer::label_text(labels))?;
        let now = Utc::now();

        let mut scored = Vec::with_capacity(candidates.len());
        for mut candidate in candidates {
            match self
                .scorer
                .score(self.embedder.as_ref(), labels, &label_vector, &candidate, now)
            {
                Ok(score) => {
                    candidate.score = score;
                    scored.push(candidate);
                }
                Err(e) => log::warn!("{}: scoring failed, skipping: {e}", candidate.url),
            }
        }

        scored.sort_by(compare);
        let Some(best) = scored.into_iter().next() else {
            return Ok(None);
        };

        log::info!("search: picked {} (score {:.4})", best.url, best.score);

        let picked = best.into_recommendation();
        self.cache.put(&key, picked.clone()).await;
        Ok(Some(picked))
    }
}
