//! Picking one content item for a set of target labels.
//!
//! # Architecture
//!
//! Recommendation is a chain of [`Strategy`] objects tried in order by the
//! [`orchestrator::RecommendationOrchestrator`]:
//!
//! - `sql`: persisted article store, profile-first when requested
//! - `search`: web search, metadata resolution, candidate scoring, daily cache
//! - `fallback`: deterministic pick from a static list, always succeeds
//!
//! Each attempt is recorded in a [`RecommendationReport`].

pub mod cache;
pub mod candidate;
pub mod normalize;
pub mod orchestrator;
pub mod providers;
pub mod scorer;
pub mod search;
pub mod sql;
pub mod store;

use serde::{Deserialize, Serialize};

/// Labels the caller wants a piece for.
#[derive(Debug, Clone, Default)]
pub struct RecommendRequest {
    pub labels: Vec<String>,
    /// Try the user's profile labels before `labels` (persisted store only)
    pub use_profile: bool,
}

/// A chosen item. Also the payload of the recommendation cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    pub source: String,
    pub url: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// One link of the recommendation chain.
#[async_trait::async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the strategy should run for this process. Checked per request.
    async fn enabled(&self) -> bool {
        true
    }

    /// `Ok(None)` means the strategy ran and found nothing.
    async fn attempt(&self, request: &RecommendRequest) -> anyhow::Result<Option<Recommendation>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecommendationReport {
    pub stages: Vec<StageReport>,
    pub winner: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail")]
pub enum StageStatus {
    Hit,
    Miss,
    Skip,
    Error(String),
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Hit => "hit",
            StageStatus::Miss => "miss",
            StageStatus::Skip => "skip",
            StageStatus::Error(_) => "error",
        }
    }
}
