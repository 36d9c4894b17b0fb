use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use homedir::my_home;
use serde::Serialize;

use crate::classify::{AnalyzeOptions, HierarchicalClassifier};
use crate::config::Config;
use crate::embeddings::{Embedder, EmbeddingBackend, FastEmbedder};
use crate::ingest::{ChildLabeler, Ingestor, LabelerSettings, NytClient};
use crate::profile::ProfileStore;
use crate::recommend::cache::RecommendationCache;
use crate::recommend::orchestrator::{RecommendationOrchestrator, StaticFallback};
use crate::recommend::providers::{http_client, HtmlMetadataResolver, SearchProvider, SerpApiSearch};
use crate::recommend::scorer::CandidateScorer;
use crate::recommend::search::SearchRecommender;
use crate::recommend::sql::{SqlRecommender, SqlSettings};
use crate::recommend::store::{PgStore, StoreStatus};
use crate::recommend::Strategy;
use crate::taxonomy::TaxonomyIndex;

/// Resolve the base directory: `THYSELF_BASE_PATH` or `~/.local/share/thyself`.
pub fn base_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("THYSELF_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/thyself"))
}

/// Load config from the base directory and apply environment overrides.
pub fn load_config() -> Result<Config> {
    let base = base_path()?;
    std::fs::create_dir_all(&base).context("failed to create application base directory")?;
    let config = Config::load_with(&base).context("failed to load config")?;
    Ok(config.with_env(|k| std::env::var(k).ok()))
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchReadiness {
    pub provider: String,
    pub has_key: bool,
    pub allowlist_size: usize,
}

/// Snapshot reported by the `ready` command.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub model: String,
    pub parent_count: usize,
    pub child_count: usize,
    pub stages: Vec<&'static str>,
    pub search: SearchReadiness,
    pub store: StoreStatus,
}

/// Process-wide services, built once at startup.
pub struct AppContext {
    config: Config,
    embedder: Arc<dyn Embedder>,
    index: Arc<TaxonomyIndex>,
    classifier: HierarchicalClassifier,
    store: Arc<PgStore>,
    orchestrator: RecommendationOrchestrator,
}

impl AppContext {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn classifier(&self) -> &HierarchicalClassifier {
        &self.classifier
    }

    pub fn orchestrator(&self) -> &RecommendationOrchestrator {
        &self.orchestrator
    }

    pub fn analyze_options(&self) -> AnalyzeOptions {
        let c = &self.config.classifier;
        AnalyzeOptions {
            alpha: c.alpha,
            topk_parent: Some(c.topk_parent),
            max_titles: c.max_titles,
            max_title_chars: c.max_title_chars,
        }
    }

    pub fn ingestor(&self) -> Ingestor {
        let labeler = ChildLabeler::new(
            self.index.clone(),
            self.embedder.clone(),
            LabelerSettings::from(&self.config.ingest),
        );
        Ingestor::new(
            self.store.clone(),
            labeler,
            Duration::from_secs(self.config.ingest.page_delay_secs),
        )
    }

    pub fn nyt_client(&self) -> Result<NytClient> {
        NytClient::new(&self.config.ingest)
    }

    pub async fn readiness(&self) -> Readiness {
        let s = &self.config.search;
        Readiness {
            model: self.embedder.model_key().to_string(),
            parent_count: self.index.taxonomy().parents().len(),
            child_count: self.index.taxonomy().children().len(),
            stages: self.orchestrator.stage_names(),
            search: SearchReadiness {
                provider: s.provider.clone(),
                has_key: !s.serpapi_key.is_empty(),
                allowlist_size: s.allowlist.len(),
            },
            store: self.store.status().await,
        }
    }

    pub async fn shutdown(&self) {
        log::info!("shutting down");
        self.store.close().await;
    }
}

/// Builder for [`AppContext`]. Unset parts are created from the config.
#[derive(Default)]
pub struct AppContextBuilder {
    config: Option<Config>,
    embedder: Option<Arc<dyn Embedder>>,
    search_provider: Option<Arc<dyn SearchProvider>>,
}

impl AppContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn search_provider(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.search_provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<AppContext> {
        let config = self.config.context("config is required")?;
        let cache_dir = config.cache_dir();
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("failed to create cache dir {}", cache_dir.display()))?;

        let embedder: Arc<dyn Embedder> = match self.embedder {
            Some(e) => e,
            None => {
                let backend = EmbeddingBackend::parse(&config.classifier.model)?;
                Arc::new(FastEmbedder::new(backend, cache_dir.clone())?)
            }
        };

        let index = Arc::new(
            TaxonomyIndex::open(&config.taxonomy_path(), embedder.as_ref(), &cache_dir)
                .context("failed to open taxonomy")?,
        );
        let classifier = HierarchicalClassifier::new(index.clone(), embedder.clone());

        let s = &config.search;
        let client = http_client(Duration::from_secs(s.request_timeout_secs))?;
        let provider: Arc<dyn SearchProvider> = match self.search_provider {
            Some(p) => p,
            None => {
                if s.provider != "serpapi" {
                    log::warn!("unknown search provider '{}', using serpapi", s.provider);
                }
                Arc::new(SerpApiSearch::new(client.clone(), s.serpapi_key.clone()))
            }
        };
        let scorer = CandidateScorer::new(
            s.domain_quality.iter().map(|(d, q)| (d.clone(), *q)).collect(),
            s.default_domain_quality,
        );
        let search = SearchRecommender::new(
            provider,
            Arc::new(HtmlMetadataResolver::new(client)),
            embedder.clone(),
            scorer,
            Arc::new(RecommendationCache::new(&cache_dir)),
            s.allowlist.iter().cloned().collect::<HashSet<_>>(),
            s.results_per_query,
            s.max_queries,
        );

        let q = &config.sql;
        let store = Arc::new(
            PgStore::new(q.database_url.clone())
                .with_statement_timeout(Duration::from_secs(q.statement_timeout_secs))
                .with_tls_verify(q.tls_verify),
        );
        let sql = SqlRecommender::new(
            store.clone(),
            Arc::new(ProfileStore::new(config.profile_path())),
            SqlSettings {
                limit: q.limit,
                decay_days: q.decay_days,
                tag_weight: q.tag_weight,
                recency_weight: q.recency_weight,
                default_source: q.default_source.clone(),
            },
            q.enabled,
        );

        let strategies: Vec<Arc<dyn Strategy>> = vec![Arc::new(sql), Arc::new(search)];
        let orchestrator =
            RecommendationOrchestrator::new(strategies, StaticFallback::new(config.fallback.clone()));

        log::info!(
            "ready: model={} parents={} children={}",
            embedder.model_key(),
            index.taxonomy().parents().len(),
            index.taxonomy().children().len()
        );

        Ok(AppContext {
            config,
            embedder,
            index,
            classifier,
            store,
            orchestrator,
        })
    }
}
