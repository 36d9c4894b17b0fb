//! Bulk ingestion of NYT Article Search results into the article store.
//!
//! Each article is labeled with the chosen parent (confidence 1.0) and a
//! handful of child labels scored by embedding similarity, so the SQL
//! strategy has something to match request labels against.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::IngestConfig;
use crate::embeddings::{dot, normalize, Embedder, EmbeddingError};
use crate::recommend::store::{ArticleRecord, ArticleSink, LabelLevel, LabelRow, LabeledArticle};
use crate::taxonomy::{Taxonomy, TaxonomyIndex};

const NYT_BASE_URL: &str = "https://www.nytimes.com/";

const TITLE_WEIGHT: f32 = 0.7;
const ABSTRACT_WEIGHT: f32 = 0.3;

/// Filter matching a section or desk with a minimum word count.
pub fn build_filter_query(section: &str, min_word_count: u32) -> String {
    let escaped = section.replace('"', "\\\"");
    format!(
        "(section.name:(\"{escaped}\") OR desk:(\"{escaped}\")) AND Article.wordCount:[{min_word_count} TO *]"
    )
}

/// Exponential delay: doubles on every call, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max,
        }
    }

    /// Delay to wait now; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

#[derive(Debug, Clone)]
pub struct PageQuery {
    pub filter: String,
    /// YYYYMMDD
    pub begin: Option<String>,
    /// YYYYMMDD
    pub end: Option<String>,
}

pub struct NytClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl NytClient {
    pub fn new(settings: &IngestConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!settings.api_key.is_empty(), "NYT_API_KEY not set");
        let client = reqwest::Client::builder()
            .user_agent(crate::recommend::providers::USER_AGENT)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone(),
            backoff_initial: Duration::from_secs(settings.backoff_initial_secs),
            backoff_max: Duration::from_secs(settings.backoff_max_secs),
        })
    }

    /// Fetch one result page. Rate-limited responses (429) are retried
    /// indefinitely with backoff; any other failure is returned.
    pub async fn fetch_page(&self, page: u32, query: &PageQuery) -> anyhow::Result<Value> {
        let mut params: Vec<(&str, String)> = vec![
            ("api-key", self.api_key.clone()),
            ("fq", query.filter.clone()),
            ("page", page.to_string()),
        ];
        if let Some(begin) = &query.begin {
            params.push(("begin_date", begin.clone()));
        }
        if let Some(end) = &query.end {
            params.push(("end_date", end.clone()));
        }

        let mut backoff = Backoff::new(self.backoff_initial, self.backoff_max);
        loop {
            let response = self.client.get(&self.endpoint).query(&params).send().await?;
            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let delay = backoff.next_delay();
                log::warn!("rate limited on page {page}, retrying in {}s", delay.as_secs());
                tokio::time::sleep(delay).await;
                continue;
            }
            return Ok(response.error_for_status()?.json().await?);
        }
    }
}

fn as_width(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Widest image among legacy `{url, width}` entries and `default` /
/// `thumbnail` crops. Relative paths are made absolute.
pub fn pick_image_url(multimedia: &Value) -> Option<String> {
    let items: Vec<&Value> = match multimedia {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![multimedia],
        _ => return None,
    };

    let mut best: Option<&str> = None;
    let mut best_width = -1i64;

    for item in items {
        let mut candidates: Vec<(Option<&str>, i64)> = Vec::new();
        match item {
            Value::String(url) => candidates.push((Some(url.as_str()), 0)),
            Value::Object(m) => {
                if let Some(url) = m.get("url").and_then(Value::as_str) {
                    candidates.push((Some(url), as_width(m.get("width"))));
                }
                for crop in ["default", "thumbnail"] {
                    if let Some(Value::Object(c)) = m.get(crop) {
                        candidates.push((c.get("url").and_then(Value::as_str), as_width(c.get("width"))));
                    }
                }
            }
            _ => continue,
        }

        for (url, width) in candidates {
            let Some(url) = url.filter(|u| !u.is_empty()) else {
                continue;
            };
            if width > best_width {
                best_width = width;
                best = Some(url);
            }
        }
    }

    let best = best?;
    if best.starts_with("http") {
        Some(best.to_string())
    } else {
        Some(format!("{NYT_BASE_URL}{}", best.trim_start_matches('/')))
    }
}

/// NYT timestamps look like `2024-01-02T03:04:05+0000`.
pub fn parse_pub_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Map an Article Search document to a store record. `external_id` and
/// `web_url` are empty when the document lacks them.
pub fn parse_doc(doc: &Value, t0: &str) -> ArticleRecord {
    let empty = Value::Null;
    let headline = doc.get("headline").unwrap_or(&empty);
    let byline = doc.get("byline").unwrap_or(&empty);

    let authors: Vec<Value> = byline
        .get("person")
        .and_then(Value::as_array)
        .map(|people| {
            people
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "firstname": p.get("firstname"),
                        "middlename": p.get("middlename"),
                        "lastname": p.get("lastname"),
                        "role": p.get("role"),
                        "organization": p.get("organization"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let keywords: Vec<Value> = doc
        .get("keywords")
        .and_then(Value::as_array)
        .map(|kws| {
            kws.iter()
                .map(|k| match k {
                    Value::Object(_) => {
                        serde_json::json!({"name": k.get("name"), "value": k.get("value")})
                    }
                    Value::String(s) => serde_json::json!({"value": s}),
                    other => serde_json::json!({"value": other.to_string()}),
                })
                .collect()
        })
        .unwrap_or_default();

    let section_name = str_field(doc, "section_name").or_else(|| {
        let section = doc.get("section")?;
        str_field(section, "name").or_else(|| str_field(section, "displayName"))
    });

    ArticleRecord {
        external_id: str_field(doc, "_id")
            .or_else(|| str_field(doc, "uri"))
            .unwrap_or_default(),
        web_url: str_field(doc, "web_url").unwrap_or_default(),
        title: str_field(headline, "main"),
        abstract_text: str_field(doc, "abstract"),
        byline: str_field(byline, "original"),
        author_list: Value::Array(authors),
        pub_date: str_field(doc, "pub_date").and_then(|d| parse_pub_date(&d)),
        section_name,
        news_desk: str_field(doc, "news_desk").or_else(|| str_field(doc, "desk")),
        word_count: doc.get("word_count").and_then(Value::as_i64),
        image_url: doc.get("multimedia").and_then(pick_image_url),
        source_tags: Value::Array(keywords),
        t0_tag: t0.to_string(),
        raw: doc.clone(),
    }
}

/// Parent for a user-supplied key: exact id or label, then prefix match.
pub fn resolve_parent(taxonomy: &Taxonomy, key: &str) -> Option<usize> {
    if let Some(idx) = taxonomy.find_parent(key) {
        return Some(idx);
    }
    let key = key.trim().to_lowercase();
    if key.is_empty() {
        return None;
    }
    taxonomy.parents().iter().position(|p| {
        p.node.id.to_lowercase().starts_with(&key) || p.node.text.to_lowercase().starts_with(&key)
    })
}

fn softmax(values: &[f32], temperature: f32) -> Vec<f32> {
    if values.is_empty() {
        return vec![];
    }
    let t = temperature.max(1e-6);
    let max = values.iter().map(|v| v / t).fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = values.iter().map(|v| (v / t - max).exp()).collect();
    let sum: f32 = exp.iter().sum::<f32>() + 1e-12;
    exp.into_iter().map(|e| e / sum).collect()
}

fn min_max(values: Vec<f32>) -> Vec<f32> {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = (max - min).max(1e-6);
    values.into_iter().map(|v| (v - min) / range).collect()
}

/// Child picks for one article: top `topk_inside` under the chosen parent
/// plus top `topk_outside` elsewhere, spreading those over distinct parents
/// first.
pub fn select_children(
    scores: &[f32],
    child_parent: &[usize],
    chosen_parent: usize,
    topk_inside: usize,
    topk_outside: usize,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });

    let (inside, outside): (Vec<usize>, Vec<usize>) =
        order.into_iter().partition(|&c| child_parent[c] == chosen_parent);

    let mut picks: Vec<usize> = inside.into_iter().take(topk_inside).collect();

    let mut top_out: Vec<usize> = Vec::new();
    let mut used_parents: Vec<usize> = Vec::new();
    for &c in &outside {
        if top_out.len() >= topk_outside {
            break;
        }
        let parent = child_parent[c];
        if used_parents.contains(&parent) {
            continue;
        }
        top_out.push(c);
        used_parents.push(parent);
    }
    for &c in &outside {
        if top_out.len() >= topk_outside {
            break;
        }
        if !top_out.contains(&c) {
            top_out.push(c);
        }
    }

    picks.extend(top_out);
    picks
}

#[derive(Debug, Clone)]
pub struct LabelerSettings {
    pub alpha_smooth: f32,
    pub temperature: f32,
    pub topk_inside: usize,
    pub topk_outside: usize,
}

impl From<&IngestConfig> for LabelerSettings {
    fn from(c: &IngestConfig) -> Self {
        Self {
            alpha_smooth: c.alpha_smooth,
            temperature: c.temperature,
            topk_inside: c.topk_inside,
            topk_outside: c.topk_outside,
        }
    }
}

/// Scores child labels for articles against the taxonomy's label vectors.
pub struct ChildLabeler {
    index: Arc<TaxonomyIndex>,
    embedder: Arc<dyn Embedder>,
    settings: LabelerSettings,
}

impl ChildLabeler {
    pub fn new(index: Arc<TaxonomyIndex>, embedder: Arc<dyn Embedder>, settings: LabelerSettings) -> Self {
        Self {
            index,
            embedder,
            settings,
        }
    }

    fn article_vector(&self, title: &str, abstract_text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let title = title.trim();
        let abstract_text = abstract_text.trim();

        let vector = match (title.is_empty(), abstract_text.is_empty()) {
            (false, false) => {
                let vs = self
                    .embedder
                    .encode(&[title.to_string(), abstract_text.to_string()])?;
                let (t, a) = match vs.as_slice() {
                    [t, a] => (t, a),
                    _ => {
                        return Err(EmbeddingError::EmbeddingFailed(
                            "expected two article vectors".to_string(),
                        ))
                    }
                };
                t.iter()
                    .zip(a.iter())
                    .map(|(t, a)| TITLE_WEIGHT * t + ABSTRACT_WEIGHT * a)
                    .collect()
            }
            (false, true) => self.embedder.encode_one(title)?,
            (true, false) => self.embedder.encode_one(abstract_text)?,
            (true, true) => vec![0.0; self.embedder.dimensions()],
        };
        Ok(normalize(vector))
    }

    /// Child label rows for an article under `chosen_parent`.
    pub fn label(
        &self,
        title: &str,
        abstract_text: &str,
        chosen_parent: usize,
    ) -> Result<Vec<LabelRow>, EmbeddingError> {
        let labels = self.index.embeddings();
        if labels.children.is_empty() {
            return Ok(vec![]);
        }

        let v = self.article_vector(title, abstract_text)?;
        let sims: Vec<f32> = labels
            .children
            .iter()
            .zip(labels.child_parent.iter())
            .map(|(c, &p)| {
                let bonus = if p == chosen_parent {
                    self.settings.alpha_smooth
                } else {
                    0.0
                };
                dot(&v, c) + bonus
            })
            .collect();

        let scores = min_max(softmax(&sims, self.settings.temperature));
        let picks = select_children(
            &scores,
            &labels.child_parent,
            chosen_parent,
            self.settings.topk_inside,
            self.settings.topk_outside,
        );

        let taxonomy = self.index.taxonomy();
        let method = format!(
            "embed+smooth:{}:alpha={}:temp={}",
            self.embedder.model_key(),
            self.settings.alpha_smooth,
            self.settings.temperature
        );

        Ok(picks
            .into_iter()
            .map(|c| {
                let child = &taxonomy.children()[c];
                LabelRow {
                    level: LabelLevel::Child,
                    tag: child.node.id.clone(),
                    parent_tag: Some(taxonomy.parents()[child.parent].node.id.clone()),
                    score: scores[c] as f64,
                    method: method.clone(),
                }
            })
            .collect())
    }

    /// The parent label row, always at full confidence.
    pub fn anchor(&self, parent: usize) -> LabelRow {
        LabelRow {
            level: LabelLevel::Parent,
            tag: self.index.taxonomy().parents()[parent].node.id.clone(),
            parent_tag: None,
            score: 1.0,
            method: format!("anchor:{}", self.embedder.model_key()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestArgs {
    pub section: String,
    pub min_word_count: u32,
    pub begin: Option<String>,
    pub end: Option<String>,
    pub max_pages: u32,
}

pub struct Ingestor {
    sink: Arc<dyn ArticleSink>,
    labeler: ChildLabeler,
    page_delay: Duration,
}

impl Ingestor {
    pub fn new(sink: Arc<dyn ArticleSink>, labeler: ChildLabeler, page_delay: Duration) -> Self {
        Self {
            sink,
            labeler,
            page_delay,
        }
    }

    /// Label the documents of one page and upsert them as a single unit.
    /// Returns how many were stored.
    pub async fn ingest_docs(&self, docs: &[Value], t0: &str, parent: usize) -> anyhow::Result<usize> {
        let mut page = Vec::with_capacity(docs.len());
        for doc in docs {
            let record = parse_doc(doc, t0);
            if record.external_id.is_empty() || record.web_url.is_empty() {
                log::debug!("skipping document without id or url");
                continue;
            }

            let mut labels = vec![self.labeler.anchor(parent)];
            labels.extend(self.labeler.label(
                record.title.as_deref().unwrap_or_default(),
                record.abstract_text.as_deref().unwrap_or_default(),
                parent,
            )?);
            page.push(LabeledArticle { record, labels });
        }

        self.sink.upsert_page(&page).await
    }

    pub async fn run(&self, client: &NytClient, args: &IngestArgs) -> anyhow::Result<usize> {
        let taxonomy = self.labeler.index.taxonomy();
        let parent = resolve_parent(taxonomy, &args.section)
            .with_context(|| format!("unknown parent label '{}'", args.section))?;

        let query = PageQuery {
            filter: build_filter_query(&args.section, args.min_word_count),
            begin: args.begin.clone(),
            end: args.end.clone(),
        };

        let mut total = 0;
        for page in 0..args.max_pages {
            let data = client.fetch_page(page, &query).await?;
            let docs = data
                .get("response")
                .and_then(|r| r.get("docs"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            let stored = self.ingest_docs(&docs, &args.section, parent).await?;
            total += stored;
            log::info!("page {page}: upserted {stored} articles");

            if page + 1 < args.max_pages {
                tokio::time::sleep(self.page_delay).await;
            }
        }

        log::info!("ingestion completed: {total} articles");
        Ok(total)
    }
}
