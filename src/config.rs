use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::recommend::Recommendation;

pub const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_MODEL: &str = "minilm";
const DEFAULT_TAXONOMY: &str = "taxonomy.yaml";
const DEFAULT_ALPHA: f32 = 0.30;
const DEFAULT_TOPK_PARENT: usize = 8;

/// Seed allowlist; `DOMAIN_ALLOWLIST` extends it.
const SEED_ALLOWLIST: [(&str, f32); 9] = [
    ("www.theatlantic.com", 0.9),
    ("www.noahpinion.blog", 0.7),
    ("hbr.org", 0.85),
    ("aeon.co", 0.75),
    ("www.nytimes.com", 0.9),
    ("www.newyorker.com", 0.9),
    ("www.bbc.com", 0.85),
    ("www.ft.com", 0.9),
    ("www.economist.com", 0.9),
];

const NYT_ENDPOINT: &str = "https://api.nytimes.com/svc/search/v2/articlesearch.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config is malformed: {0}")]
    Parse(#[from] serde_yml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Embedding backend key (minilm, multiminilm, me5, me5large, bge-small, bge-base)
    #[serde(default = "default_model")]
    pub model: String,

    /// Relative paths are resolved against the base directory
    #[serde(default = "default_taxonomy_path")]
    pub taxonomy_path: PathBuf,

    /// Weight of the parent score in the combined child score [0.0, 1.0]
    #[serde(default = "default_alpha")]
    pub alpha: f32,

    /// Only children of the top-K parents compete
    #[serde(default = "default_topk_parent")]
    pub topk_parent: usize,

    #[serde(default = "default_max_titles")]
    pub max_titles: usize,

    #[serde(default = "default_max_title_chars")]
    pub max_title_chars: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            taxonomy_path: default_taxonomy_path(),
            alpha: DEFAULT_ALPHA,
            topk_parent: DEFAULT_TOPK_PARENT,
            max_titles: default_max_titles(),
            max_title_chars: default_max_title_chars(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_taxonomy_path() -> PathBuf {
    PathBuf::from(DEFAULT_TAXONOMY)
}

fn default_alpha() -> f32 {
    DEFAULT_ALPHA
}

fn default_topk_parent() -> usize {
    DEFAULT_TOPK_PARENT
}

fn default_max_titles() -> usize {
    500
}

fn default_max_title_chars() -> usize {
    300
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Overridden by `SERPAPI_KEY`
    #[serde(default)]
    pub serpapi_key: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_results_per_query")]
    pub results_per_query: usize,

    #[serde(default = "default_max_queries")]
    pub max_queries: usize,

    /// Empty list allows every domain
    #[serde(default = "default_allowlist")]
    pub allowlist: Vec<String>,

    #[serde(default = "default_domain_quality")]
    pub domain_quality: BTreeMap<String, f32>,

    #[serde(default = "default_domain_quality_fallback")]
    pub default_domain_quality: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            serpapi_key: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            results_per_query: default_results_per_query(),
            max_queries: default_max_queries(),
            allowlist: default_allowlist(),
            domain_quality: default_domain_quality(),
            default_domain_quality: default_domain_quality_fallback(),
        }
    }
}

fn default_provider() -> String {
    "serpapi".to_string()
}

fn default_request_timeout_secs() -> u64 {
    8
}

fn default_results_per_query() -> usize {
    5
}

fn default_max_queries() -> usize {
    6
}

fn default_allowlist() -> Vec<String> {
    SEED_ALLOWLIST.iter().map(|(d, _)| d.to_string()).collect()
}

fn default_domain_quality() -> BTreeMap<String, f32> {
    SEED_ALLOWLIST
        .iter()
        .map(|(d, q)| (d.to_string(), *q))
        .collect()
}

fn default_domain_quality_fallback() -> f32 {
    0.6
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SqlConfig {
    /// Absent means check the store on each request. Overridden by `USE_SQL_RECO`
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Overridden by `DATABASE_URL`
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_sql_limit")]
    pub limit: i64,

    #[serde(default = "default_decay_days")]
    pub decay_days: f64,

    #[serde(default = "default_tag_weight")]
    pub tag_weight: f64,

    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,

    #[serde(default = "default_source")]
    pub default_source: String,

    /// Upper bound for each statement; a statement that runs longer drops the connection
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,

    /// Verify the server certificate and host name when TLS is negotiated.
    /// Off by default, like libpq's `sslmode=require`
    #[serde(default)]
    pub tls_verify: bool,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            database_url: None,
            limit: default_sql_limit(),
            decay_days: default_decay_days(),
            tag_weight: default_tag_weight(),
            recency_weight: default_recency_weight(),
            default_source: default_source(),
            statement_timeout_secs: default_statement_timeout_secs(),
            tls_verify: false,
        }
    }
}

fn default_sql_limit() -> i64 {
    200
}

fn default_decay_days() -> f64 {
    90.0
}

fn default_tag_weight() -> f64 {
    0.7
}

fn default_recency_weight() -> f64 {
    0.3
}

fn default_source() -> String {
    "New York Times".to_string()
}

fn default_statement_timeout_secs() -> u64 {
    10
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Overridden by `NYT_API_KEY`
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_nyt_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_ingest_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_page_delay_secs")]
    pub page_delay_secs: u64,

    #[serde(default = "default_backoff_initial_secs")]
    pub backoff_initial_secs: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Similarity bonus for children of the chosen parent
    #[serde(default = "default_smoothing")]
    pub alpha_smooth: f32,

    #[serde(default = "default_smoothing")]
    pub temperature: f32,

    #[serde(default = "default_topk_inside")]
    pub topk_inside: usize,

    #[serde(default = "default_topk_outside")]
    pub topk_outside: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: default_nyt_endpoint(),
            request_timeout_secs: default_ingest_timeout_secs(),
            page_delay_secs: default_page_delay_secs(),
            backoff_initial_secs: default_backoff_initial_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            alpha_smooth: default_smoothing(),
            temperature: default_smoothing(),
            topk_inside: default_topk_inside(),
            topk_outside: default_topk_outside(),
        }
    }
}

fn default_nyt_endpoint() -> String {
    NYT_ENDPOINT.to_string()
}

fn default_ingest_timeout_secs() -> u64 {
    20
}

fn default_page_delay_secs() -> u64 {
    6
}

fn default_backoff_initial_secs() -> u64 {
    2
}

fn default_backoff_max_secs() -> u64 {
    64
}

fn default_smoothing() -> f32 {
    0.08
}

fn default_topk_inside() -> usize {
    3
}

fn default_topk_outside() -> usize {
    2
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Defaults to `<base>/cache`
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Defaults to `<base>/profile.json`
    #[serde(default)]
    pub profile_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub sql: SqlConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Static last-resort recommendations
    #[serde(default)]
    pub fallback: Vec<Recommendation>,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.classifier;
        if !(0.0..=1.0).contains(&c.alpha) {
            return Err(ConfigError::Invalid(format!(
                "classifier.alpha must be between 0.0 and 1.0, got {}",
                c.alpha
            )));
        }
        if c.topk_parent == 0 {
            return Err(ConfigError::Invalid(
                "classifier.topk_parent must be at least 1".to_string(),
            ));
        }
        if c.max_titles == 0 || c.max_title_chars == 0 {
            return Err(ConfigError::Invalid(
                "classifier.max_titles and classifier.max_title_chars must be greater than 0"
                    .to_string(),
            ));
        }
        crate::embeddings::EmbeddingBackend::parse(&c.model)
            .map_err(|e| ConfigError::Invalid(format!("classifier.model: {e}")))?;

        let s = &self.search;
        if s.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "search.request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if s.results_per_query == 0 || s.max_queries == 0 {
            return Err(ConfigError::Invalid(
                "search.results_per_query and search.max_queries must be greater than 0"
                    .to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&s.default_domain_quality)
            || s.domain_quality.values().any(|q| !(0.0..=1.0).contains(q))
        {
            return Err(ConfigError::Invalid(
                "search domain quality values must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.sql.limit <= 0 || self.sql.decay_days <= 0.0 {
            return Err(ConfigError::Invalid(
                "sql.limit and sql.decay_days must be greater than 0".to_string(),
            ));
        }
        if self.sql.statement_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sql.statement_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let i = &self.ingest;
        if i.temperature <= 0.0 {
            return Err(ConfigError::Invalid(
                "ingest.temperature must be greater than 0".to_string(),
            ));
        }
        if i.backoff_initial_secs == 0 || i.backoff_max_secs < i.backoff_initial_secs {
            return Err(ConfigError::Invalid(
                "ingest backoff must start above 0 and not exceed backoff_max_secs".to_string(),
            ));
        }

        Ok(())
    }

    /// Read `config.yaml` from `base_path`, creating it with defaults if
    /// missing and re-saving it when new fields were filled in.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        let path = base_path.join(CONFIG_FILE);
        let io_err = |source| ConfigError::Io {
            path: path.clone(),
            source,
        };

        if !path.exists() {
            std::fs::create_dir_all(base_path).map_err(io_err)?;
            std::fs::write(&path, serde_yml::to_string(&Self::default())?).map_err(io_err)?;
        }

        let config_str = std::fs::read_to_string(&path).map_err(io_err)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;
        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.base_path.join(CONFIG_FILE);
        std::fs::write(&path, serde_yml::to_string(&self)?)
            .map_err(|source| ConfigError::Io { path, source })
    }

    /// Apply environment overrides. Overridden values are never saved back.
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(key) = env("SERPAPI_KEY") {
            self.search.serpapi_key = key.trim().to_string();
        }
        if let Some(extra) = env("DOMAIN_ALLOWLIST") {
            for domain in extra.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                if !self.search.allowlist.iter().any(|d| d == domain) {
                    self.search.allowlist.push(domain.to_string());
                }
            }
        }
        if let Some(flag) = env("USE_SQL_RECO") {
            self.sql.enabled = Some(parse_flag(&flag));
        }
        if let Some(url) = env("DATABASE_URL") {
            self.sql.database_url = Some(url);
        }
        if let Some(key) = env("NYT_API_KEY") {
            self.ingest.api_key = key.trim().to_string();
        }
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    pub fn taxonomy_path(&self) -> PathBuf {
        self.resolve(&self.classifier.taxonomy_path)
    }

    pub fn cache_dir(&self) -> PathBuf {
        match &self.paths.cache_dir {
            Some(p) => self.resolve(p),
            None => self.base_path.join("cache"),
        }
    }

    pub fn profile_path(&self) -> PathBuf {
        match &self.paths.profile_path {
            Some(p) => self.resolve(p),
            None => self.base_path.join("profile.json"),
        }
    }
}
