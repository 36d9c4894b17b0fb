use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{strings, FailingEmbedder, KeywordEmbedder};
use crate::embeddings::Embedder;
use crate::profile::ProfileStore;
use crate::recommend::cache::RecommendationCache;
use crate::recommend::candidate::Candidate;
use crate::recommend::normalize::domain_of;
use crate::recommend::orchestrator::{RecommendationOrchestrator, StaticFallback};
use crate::recommend::providers::{MetadataResolver, SearchProvider};
use crate::recommend::scorer::CandidateScorer;
use crate::recommend::search::SearchRecommender;
use crate::recommend::sql::{SqlRecommender, SqlSettings};
use crate::recommend::store::{CandidateStore, StoredArticle, StoredLabel};
use crate::recommend::{RecommendRequest, Recommendation, StageStatus, Strategy};

const PHYSICS_URL: &str = "https://aeon.co/essays/quantum-physics";
const PAINTING_URL: &str = "https://example.com/painting";

struct FakeSearch {
    configured: bool,
    calls: AtomicUsize,
    failing_query: Option<&'static str>,
}

impl FakeSearch {
    fn new(configured: bool) -> Self {
        Self {
            configured,
            calls: AtomicUsize::new(0),
            failing_query: None,
        }
    }

    fn failing_on(query: &'static str) -> Self {
        Self {
            failing_query: Some(query),
            ..Self::new(true)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SearchProvider for FakeSearch {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn search(&self, query: &str, top_k: usize) -> anyhow::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_query == Some(query) {
            anyhow::bail!("quota exceeded");
        }
        Ok(vec![
            format!("{PAINTING_URL}?utm_source=feed"),
            PHYSICS_URL.to_string(),
        ]
        .into_iter()
        .take(top_k)
        .collect())
    }
}

#[derive(Default)]
struct FakeResolver {
    resolved: Mutex<Vec<String>>,
    failing: Option<&'static str>,
}

#[async_trait::async_trait]
impl MetadataResolver for FakeResolver {
    async fn resolve(&self, url: &str) -> anyhow::Result<Option<Candidate>> {
        self.resolved.lock().unwrap().push(url.to_string());
        if self.failing == Some(url) {
            anyhow::bail!("connection reset");
        }
        let title = if url == PHYSICS_URL {
            "Quantum physics and particles"
        } else {
            "Painting on canvas"
        };
        Ok(Some(Candidate {
            url: url.to_string(),
            domain: domain_of(url).unwrap_or_default(),
            title: title.to_string(),
            ..Default::default()
        }))
    }
}

fn search_recommender(
    cache_dir: &std::path::Path,
    provider: Arc<FakeSearch>,
    resolver: Arc<FakeResolver>,
    allowlist: &[&str],
) -> SearchRecommender {
    search_recommender_with(
        cache_dir,
        provider,
        resolver,
        allowlist,
        Arc::new(KeywordEmbedder::default()),
    )
}

fn search_recommender_with(
    cache_dir: &std::path::Path,
    provider: Arc<FakeSearch>,
    resolver: Arc<FakeResolver>,
    allowlist: &[&str],
    embedder: Arc<dyn Embedder>,
) -> SearchRecommender {
    SearchRecommender::new(
        provider,
        resolver,
        embedder,
        CandidateScorer::new(Default::default(), 0.6),
        Arc::new(RecommendationCache::new(cache_dir)),
        allowlist.iter().map(|d| d.to_string()).collect::<HashSet<_>>(),
        2,
        6,
    )
}

fn request(labels: &[&str], use_profile: bool) -> RecommendRequest {
    RecommendRequest {
        labels: strings(labels),
        use_profile,
    }
}

#[tokio::test]
async fn test_search_picks_best_candidate_and_caches_it() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FakeSearch::new(true));
    let resolver = Arc::new(FakeResolver::default());
    let search = search_recommender(dir.path(), provider.clone(), resolver.clone(), &[]);
    let req = request(&["physics", "quantum", "particles"], false);

    let picked = search.attempt(&req).await.unwrap().unwrap();
    assert_eq!(picked.url, PHYSICS_URL);
    assert_eq!(picked.source, "aeon.co");

    // the tracking parameter was stripped before dedup and resolution
    let resolved = resolver.resolved.lock().unwrap().clone();
    assert_eq!(resolved, vec![PAINTING_URL.to_string(), PHYSICS_URL.to_string()]);

    let calls = provider.calls();
    assert!(calls > 0);
    let again = search.attempt(&req).await.unwrap().unwrap();
    assert_eq!(again, picked);
    assert_eq!(provider.calls(), calls);

    // a fresh process reads the same answer from disk
    let other_provider = Arc::new(FakeSearch::new(true));
    let reopened = search_recommender(
        dir.path(),
        other_provider.clone(),
        Arc::new(FakeResolver::default()),
        &[],
    );
    let reordered = request(&["particles", "physics", "quantum"], false);
    assert_eq!(reopened.attempt(&reordered).await.unwrap(), Some(picked));
    assert_eq!(other_provider.calls(), 0);
}

#[tokio::test]
async fn test_search_allowlist_and_resolve_failures() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = Arc::new(FakeResolver::default());
    let search = search_recommender(
        dir.path(),
        Arc::new(FakeSearch::new(true)),
        resolver.clone(),
        &["example.com"],
    );

    let picked = search
        .attempt(&request(&["physics", "quantum", "particles"], false))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(picked.url, PAINTING_URL);
    assert_eq!(resolver.resolved.lock().unwrap().len(), 1);

    let failing = Arc::new(FakeResolver {
        failing: Some(PHYSICS_URL),
        ..Default::default()
    });
    let other_dir = tempfile::tempdir().unwrap();
    let search = search_recommender(other_dir.path(), Arc::new(FakeSearch::new(true)), failing, &[]);
    let picked = search
        .attempt(&request(&["physics", "quantum", "particles"], false))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(picked.url, PAINTING_URL);
}

#[tokio::test]
async fn test_unconfigured_search_yields_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FakeSearch::new(false));
    let search = search_recommender(dir.path(), provider.clone(), Arc::new(FakeResolver::default()), &[]);

    assert_eq!(search.attempt(&request(&["a", "b", "c"], false)).await.unwrap(), None);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_failed_query_does_not_stop_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FakeSearch::failing_on("longform deep dive physics"));
    let resolver = Arc::new(FakeResolver::default());
    let search = search_recommender(dir.path(), provider.clone(), resolver.clone(), &[]);

    let picked = search
        .attempt(&request(&["physics", "quantum", "particles"], false))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(picked.url, PHYSICS_URL);
    assert_eq!(provider.calls(), 6);

    let resolved = resolver.resolved.lock().unwrap().clone();
    assert_eq!(resolved, vec![PAINTING_URL.to_string(), PHYSICS_URL.to_string()]);
}

#[tokio::test]
async fn test_unscorable_candidate_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let search = search_recommender_with(
        dir.path(),
        Arc::new(FakeSearch::new(true)),
        Arc::new(FakeResolver::default()),
        &[],
        Arc::new(FailingEmbedder::when_text_contains("on canvas")),
    );

    // the painting candidate would win on these labels, but cannot be embedded
    let picked = search
        .attempt(&request(&["painting", "canvas", "museum"], false))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(picked.url, PHYSICS_URL);
}

#[tokio::test]
async fn test_label_vector_failure_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let search = search_recommender_with(
        dir.path(),
        Arc::new(FakeSearch::new(true)),
        Arc::new(FakeResolver::default()),
        &[],
        Arc::new(FailingEmbedder::always()),
    );

    assert!(search
        .attempt(&request(&["physics", "quantum", "particles"], false))
        .await
        .is_err());
}

/// Returns one article for label sets containing `hit_label`.
struct FakeStore {
    hit_label: &'static str,
    fail_first: bool,
    calls: Mutex<Vec<Vec<String>>>,
    reachable: bool,
}

impl FakeStore {
    fn new(hit_label: &'static str) -> Self {
        Self {
            hit_label,
            fail_first: false,
            calls: Mutex::new(vec![]),
            reachable: true,
        }
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CandidateStore for FakeStore {
    async fn fetch_by_labels(
        &self,
        labels_lower: &[String],
        _limit: i64,
    ) -> anyhow::Result<Vec<StoredArticle>> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(labels_lower.to_vec());
            calls.len()
        };
        if self.fail_first && attempt == 1 {
            anyhow::bail!("relation \"articles\" does not exist");
        }
        if !labels_lower.iter().any(|l| l == self.hit_label) {
            return Ok(vec![]);
        }
        Ok(vec![StoredArticle {
            id: "42".to_string(),
            title: Some(format!("All about {}", self.hit_label)),
            web_url: Some("https://www.nytimes.com/42".to_string()),
            byline: Some("By A. Writer".to_string()),
            section_name: None,
            news_desk: None,
            pub_date: None,
            image_url: String::new(),
            labels: vec![StoredLabel {
                tag: self.hit_label.to_string(),
                score: Some(0.9),
                parent_t0: None,
            }],
        }])
    }

    async fn ping(&self) -> anyhow::Result<()> {
        if self.reachable {
            Ok(())
        } else {
            anyhow::bail!("connection refused")
        }
    }
}

fn write_profile(dir: &std::path::Path) -> Arc<ProfileStore> {
    let path = dir.join("profile.json");
    let profile = serde_json::json!({
        "t1_ranked": [
            ["Science > Physics", 3],
            ["Science > Biology", 2],
            ["Art > Music", 1]
        ]
    });
    std::fs::write(&path, profile.to_string()).unwrap();
    Arc::new(ProfileStore::new(path))
}

#[tokio::test]
async fn test_sql_tries_profile_labels_then_request_labels() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FakeStore::new("painting"));
    let sql = SqlRecommender::new(store.clone(), write_profile(dir.path()), SqlSettings::default(), Some(true));

    let picked = sql
        .attempt(&request(&["Painting", "Canvas", "Museum"], true))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        store.calls(),
        vec![
            strings(&["physics", "biology", "music"]),
            strings(&["painting", "canvas", "museum"])
        ]
    );
    assert_eq!(picked.title, "All about painting");
    assert_eq!(picked.source, "A. Writer");
    assert!(picked.date.is_some());
}

#[tokio::test]
async fn test_sql_profile_hit_wins_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FakeStore::new("physics"));
    let sql = SqlRecommender::new(store.clone(), write_profile(dir.path()), SqlSettings::default(), Some(true));

    let picked = sql.attempt(&request(&["a", "b", "c"], true)).await.unwrap();
    assert!(picked.is_some());
    assert_eq!(store.calls().len(), 1);
}

#[tokio::test]
async fn test_sql_absorbs_fetch_errors_and_missing_profile() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FakeStore {
        fail_first: true,
        ..FakeStore::new("painting")
    });
    let sql = SqlRecommender::new(store.clone(), write_profile(dir.path()), SqlSettings::default(), Some(true));
    let picked = sql
        .attempt(&request(&["painting", "x", "y"], true))
        .await
        .unwrap();
    assert!(picked.is_some());
    assert_eq!(store.calls().len(), 2);

    // no profile file: only the request labels are tried
    let store = Arc::new(FakeStore::new("nothing"));
    let missing = Arc::new(ProfileStore::new(dir.path().join("missing.json")));
    let sql = SqlRecommender::new(store.clone(), missing, SqlSettings::default(), Some(true));
    assert_eq!(sql.attempt(&request(&["a", "b", "c"], true)).await.unwrap(), None);
    assert_eq!(store.calls(), vec![strings(&["a", "b", "c"])]);
}

#[tokio::test]
async fn test_sql_enabled_flag_and_reachability_check() {
    let dir = tempfile::tempdir().unwrap();
    let profile = write_profile(dir.path());

    let off = SqlRecommender::new(Arc::new(FakeStore::new("x")), profile.clone(), SqlSettings::default(), Some(false));
    assert!(!off.enabled().await);

    let checked = SqlRecommender::new(Arc::new(FakeStore::new("x")), profile.clone(), SqlSettings::default(), None);
    assert!(checked.enabled().await);

    let unreachable = Arc::new(FakeStore {
        reachable: false,
        ..FakeStore::new("x")
    });
    let checked = SqlRecommender::new(unreachable, profile, SqlSettings::default(), None);
    assert!(!checked.enabled().await);
}

struct FixedStrategy {
    name: &'static str,
    outcome: Result<Option<&'static str>, &'static str>,
    calls: AtomicUsize,
}

impl FixedStrategy {
    fn new(name: &'static str, outcome: Result<Option<&'static str>, &'static str>) -> Arc<Self> {
        Arc::new(Self {
            name,
            outcome,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl Strategy for FixedStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn attempt(&self, _request: &RecommendRequest) -> anyhow::Result<Option<Recommendation>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.outcome {
            Ok(Some(title)) => Ok(Some(Recommendation {
                title: title.to_string(),
                source: "src".to_string(),
                url: format!("https://example.com/{title}"),
                image_url: String::new(),
                date: None,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(anyhow::anyhow!(e)),
        }
    }
}

#[tokio::test]
async fn test_orchestrator_reports_every_stage_before_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let failing = FixedStrategy::new("broken", Err("boom"));
    let sql = SqlRecommender::new(
        Arc::new(FakeStore::new("x")),
        write_profile(dir.path()),
        SqlSettings::default(),
        Some(false),
    );
    let search = search_recommender(
        dir.path(),
        Arc::new(FakeSearch::new(false)),
        Arc::new(FakeResolver::default()),
        &[],
    );

    let strategies: Vec<Arc<dyn Strategy>> = vec![failing, Arc::new(sql), Arc::new(search)];
    let orchestrator = RecommendationOrchestrator::new(strategies, StaticFallback::new(vec![]));
    assert_eq!(orchestrator.stage_names(), vec!["broken", "sql", "search", "fallback"]);

    let (piece, report) = orchestrator
        .recommend("u7", strings(&["a", "b", "c"]), false)
        .await
        .unwrap();

    assert_eq!(piece.user_id, "u7");
    assert_eq!(piece.title, "No Result");
    assert!(!piece.date.is_empty());

    let statuses: Vec<(&str, &StageStatus)> = report
        .stages
        .iter()
        .map(|s| (s.name.as_str(), &s.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("broken", &StageStatus::Error("boom".to_string())),
            ("sql", &StageStatus::Skip),
            ("search", &StageStatus::Miss),
            ("fallback", &StageStatus::Hit),
        ]
    );
    assert_eq!(report.winner.as_deref(), Some("fallback"));
}

#[tokio::test]
async fn test_orchestrator_stops_at_first_hit() {
    let first = FixedStrategy::new("first", Ok(None));
    let second = FixedStrategy::new("second", Ok(Some("found")));
    let third = FixedStrategy::new("third", Ok(Some("later")));

    let strategies: Vec<Arc<dyn Strategy>> = vec![first.clone(), second.clone(), third.clone()];
    let orchestrator = RecommendationOrchestrator::new(strategies, StaticFallback::default());
    let (piece, report) = orchestrator
        .recommend("", strings(&["a", "b", "c"]), false)
        .await
        .unwrap();

    assert_eq!(piece.title, "found");
    assert_eq!(report.winner.as_deref(), Some("second"));
    assert_eq!(report.stages.len(), 2);
    assert_eq!(third.calls.load(Ordering::SeqCst), 0);
    assert_eq!(first.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fallback_is_stable_across_calls() {
    let items: Vec<Recommendation> = (0..5)
        .map(|i| Recommendation {
            title: format!("item {i}"),
            source: "s".to_string(),
            url: format!("https://example.com/{i}"),
            image_url: String::new(),
            date: None,
        })
        .collect();
    let orchestrator = RecommendationOrchestrator::new(vec![], StaticFallback::new(items));

    let labels = strings(&["x", "y", "z"]);
    let (first, _) = orchestrator.recommend("", labels.clone(), false).await.unwrap();
    for _ in 0..3 {
        let (again, _) = orchestrator.recommend("", labels.clone(), false).await.unwrap();
        assert_eq!(again.url, first.url);
    }
}
