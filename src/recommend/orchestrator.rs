use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::Instrument;

use super::{
    RecommendRequest, Recommendation, RecommendationReport, StageReport, StageStatus, Strategy,
};

/// Number of labels a recommend request must carry.
pub const REQUIRED_LABELS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum RecommendError {
    #[error("exactly {REQUIRED_LABELS} labels are required, got {0}")]
    InvalidLabels(usize),
}

/// The final answer handed to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Piece {
    pub user_id: String,
    pub title: String,
    pub source: String,
    pub url: String,
    pub date: String,
    pub image_url: String,
}

impl Piece {
    pub fn from_recommendation(user_id: &str, item: Recommendation, today: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            title: Some(item.title)
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Untitled".to_string()),
            source: item.source,
            url: item.url,
            date: item
                .date
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| today.to_string()),
            image_url: item.image_url,
        }
    }
}

/// Last link of the chain: a fixed list indexed by a stable hash of the labels.
pub struct StaticFallback {
    items: Vec<Recommendation>,
}

impl StaticFallback {
    /// An empty list is replaced by the single "No Result" entry.
    pub fn new(items: Vec<Recommendation>) -> Self {
        if items.is_empty() {
            return Self::default();
        }
        Self { items }
    }

    pub fn pick(&self, labels: &[String]) -> Recommendation {
        let digest = Sha256::digest(labels.join("|").as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let idx = (u64::from_be_bytes(prefix) % self.items.len() as u64) as usize;
        self.items[idx].clone()
    }
}

impl Default for StaticFallback {
    fn default() -> Self {
        Self {
            items: vec![no_result()],
        }
    }
}

pub fn no_result() -> Recommendation {
    Recommendation {
        title: "No Result".to_string(),
        source: "No Result".to_string(),
        url: "No Result".to_string(),
        image_url: String::new(),
        date: None,
    }
}

#[async_trait::async_trait]
impl Strategy for StaticFallback {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn attempt(&self, request: &RecommendRequest) -> anyhow::Result<Option<Recommendation>> {
        Ok(Some(self.pick(&request.labels)))
    }
}

/// Tries each strategy in order and falls back to the static list.
pub struct RecommendationOrchestrator {
    strategies: Vec<Arc<dyn Strategy>>,
    fallback: StaticFallback,
}

impl RecommendationOrchestrator {
    pub fn new(strategies: Vec<Arc<dyn Strategy>>, fallback: StaticFallback) -> Self {
        Self {
            strategies,
            fallback,
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.strategies
            .iter()
            .map(|s| s.name())
            .chain(std::iter::once(self.fallback.name()))
            .collect()
    }

    /// Always yields a recommendation; stage failures end up in the report.
    pub async fn run(&self, request: &RecommendRequest) -> (Recommendation, RecommendationReport) {
        let started = Instant::now();
        let mut report = RecommendationReport::default();

        for strategy in &self.strategies {
            let name = strategy.name();
            let stage_started = Instant::now();

            let span = tracing::info_span!("stage", name);
            let outcome = async {
                if !strategy.enabled().await {
                    return (StageStatus::Skip, None);
                }
                match strategy.attempt(request).await {
                    Ok(Some(item)) => (StageStatus::Hit, Some(item)),
                    Ok(None) => (StageStatus::Miss, None),
                    Err(e) => (StageStatus::Error(format!("{e:#}")), None),
                }
            }
            .instrument(span)
            .await;

            let (status, item) = outcome;
            match &status {
                StageStatus::Error(e) => log::warn!("stage={name} outcome=error err={e}"),
                other => log::info!("stage={name} outcome={}", other.as_str()),
            }

            report.stages.push(StageReport {
                name: name.to_string(),
                status,
                duration_ms: stage_started.elapsed().as_millis() as u64,
            });

            if let Some(item) = item {
                report.winner = Some(name.to_string());
                report.duration_ms = started.elapsed().as_millis() as u64;
                return (item, report);
            }
        }

        let item = self.fallback.pick(&request.labels);
        log::info!("stage={} outcome=hit", self.fallback.name());
        report.stages.push(StageReport {
            name: self.fallback.name().to_string(),
            status: StageStatus::Hit,
            duration_ms: 0,
        });
        report.winner = Some(self.fallback.name().to_string());
        report.duration_ms = started.elapsed().as_millis() as u64;
        (item, report)
    }

    /// Validate the request, run the chain and shape the result for `user_id`.
    pub async fn recommend(
        &self,
        user_id: &str,
        labels: Vec<String>,
        use_profile: bool,
    ) -> Result<(Piece, RecommendationReport), RecommendError> {
        if labels.len() != REQUIRED_LABELS {
            return Err(RecommendError::InvalidLabels(labels.len()));
        }

        log::info!("recommend: labels={:?} use_profile={use_profile}", labels);
        let request = RecommendRequest {
            labels,
            use_profile,
        };
        let (item, report) = self.run(&request).await;
        let today = Utc::now().format("%Y/%m/%d").to_string();

        Ok((Piece::from_recommendation(user_id, item, &today), report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    fn item(title: &str) -> Recommendation {
        Recommendation {
            title: title.to_string(),
            source: "s".to_string(),
            url: format!("https://x/{title}"),
            image_url: String::new(),
            date: None,
        }
    }

    #[test]
    fn test_fallback_pick_is_deterministic() {
        let fallback = StaticFallback::new(vec![item("one"), item("two"), item("three")]);
        let first = fallback.pick(&labels());
        for _ in 0..5 {
            assert_eq!(fallback.pick(&labels()), first);
        }
    }

    #[test]
    fn test_empty_fallback_list_uses_no_result() {
        let fallback = StaticFallback::new(vec![]);
        assert_eq!(fallback.pick(&labels()), no_result());
    }

    #[test]
    fn test_piece_defaults() {
        let mut untitled = item("");
        untitled.date = None;
        let piece = Piece::from_recommendation("u1", untitled, "2025/01/02");
        assert_eq!(piece.title, "Untitled");
        assert_eq!(piece.date, "2025/01/02");
        assert_eq!(piece.user_id, "u1");

        let mut dated = item("t");
        dated.date = Some("2020/10/10".into());
        assert_eq!(
            Piece::from_recommendation("", dated, "2025/01/02").date,
            "2020/10/10"
        );
    }

    #[tokio::test]
    async fn test_label_count_validated() {
        let orchestrator = RecommendationOrchestrator::new(vec![], StaticFallback::default());
        let err = orchestrator
            .recommend("u", vec!["a".into(), "b".into()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, RecommendError::InvalidLabels(2)));
    }

    #[tokio::test]
    async fn test_no_strategies_falls_back() {
        let orchestrator = RecommendationOrchestrator::new(vec![], StaticFallback::default());
        let (piece, report) = orchestrator.recommend("u", labels(), false).await.unwrap();
        assert_eq!(piece.title, "No Result");
        assert_eq!(report.winner.as_deref(), Some("fallback"));
        assert_eq!(orchestrator.stage_names(), vec!["fallback"]);
    }
}
