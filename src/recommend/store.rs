//! Persisted article store backed by Postgres.
//!
//! Tables `articles` and `article_labels` are provisioned outside this
//! crate. One lazily opened connection is shared by the process; every
//! statement holds the connection lock, so commands never interleave.
//! A statement that outlives its timeout drops the connection and the next
//! call reconnects.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use tokio::time::error::Elapsed;
use tokio_postgres::{Client, Row};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(10);

const FETCH_BY_LABELS_SQL: &str = "\
SELECT a.id::text AS id, a.title, a.web_url, a.byline, a.section_name, a.news_desk, a.pub_date,
       COALESCE(a.image_url, '') AS image_url,
       json_agg(json_build_object('tag', l.tag, 'score', l.score, 'parent_t0', l.parent_t0)) AS labels
FROM articles a
JOIN article_labels l ON l.article_id = a.id AND l.level = 'T1'
WHERE lower(l.tag) = ANY($1::text[])
GROUP BY a.id
ORDER BY a.pub_date DESC NULLS LAST
LIMIT $2::bigint";

const UPSERT_ARTICLE_SQL: &str = "\
INSERT INTO articles (
  nyt_id, web_url, title, abstract, byline, author_list, pub_date, section_name,
  news_desk, word_count, image_url, source_tags, t0_tag, raw
) VALUES (
  $1::text, $2::text, $3::text, $4::text, $5::text, $6::jsonb, $7::timestamptz, $8::text,
  $9::text, $10::bigint, $11::text, $12::jsonb, $13::text, $14::jsonb
)
ON CONFLICT (nyt_id) DO UPDATE SET
  web_url = EXCLUDED.web_url,
  title = EXCLUDED.title,
  abstract = EXCLUDED.abstract,
  byline = EXCLUDED.byline,
  author_list = EXCLUDED.author_list,
  pub_date = EXCLUDED.pub_date,
  section_name = EXCLUDED.section_name,
  news_desk = EXCLUDED.news_desk,
  word_count = EXCLUDED.word_count,
  image_url = EXCLUDED.image_url,
  source_tags = EXCLUDED.source_tags,
  t0_tag = EXCLUDED.t0_tag,
  raw = EXCLUDED.raw,
  updated_at = NOW()
RETURNING id::text";

const UPSERT_LABEL_SQL: &str = "\
INSERT INTO article_labels (article_id, level, tag, parent_t0, score, method)
VALUES ($1::text::uuid, $2::text, $3::text, $4::text, $5::float8, $6::text)
ON CONFLICT (article_id, level, tag) DO UPDATE SET
  score = EXCLUDED.score,
  method = EXCLUDED.method";

/// One label attached to a stored article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLabel {
    pub tag: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub parent_t0: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredArticle {
    pub id: String,
    pub title: Option<String>,
    pub web_url: Option<String>,
    pub byline: Option<String>,
    pub section_name: Option<String>,
    pub news_desk: Option<String>,
    pub pub_date: Option<DateTime<Utc>>,
    pub image_url: String,
    /// Child-level labels only
    pub labels: Vec<StoredLabel>,
}

impl StoredArticle {
    fn from_row(row: &Row) -> anyhow::Result<Self> {
        let labels: Option<serde_json::Value> = row.try_get("labels")?;
        let labels = match labels {
            Some(serde_json::Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect(),
            _ => vec![],
        };

        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            web_url: row.try_get("web_url")?,
            byline: row.try_get("byline")?,
            section_name: row.try_get("section_name")?,
            news_desk: row.try_get("news_desk")?,
            pub_date: row.try_get("pub_date")?,
            image_url: row.try_get("image_url")?,
            labels,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelLevel {
    Parent,
    Child,
}

impl LabelLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelLevel::Parent => "T0",
            LabelLevel::Child => "T1",
        }
    }
}

/// A label row to upsert, keyed by (article, level, tag).
#[derive(Debug, Clone, PartialEq)]
pub struct LabelRow {
    pub level: LabelLevel,
    pub tag: String,
    pub parent_tag: Option<String>,
    pub score: f64,
    pub method: String,
}

/// An article as produced by ingestion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArticleRecord {
    pub external_id: String,
    pub web_url: String,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub byline: Option<String>,
    pub author_list: serde_json::Value,
    pub pub_date: Option<DateTime<Utc>>,
    pub section_name: Option<String>,
    pub news_desk: Option<String>,
    pub word_count: Option<i64>,
    pub image_url: Option<String>,
    pub source_tags: serde_json::Value,
    pub t0_tag: String,
    pub raw: serde_json::Value,
}

/// Read side used by the SQL strategy.
#[async_trait::async_trait]
pub trait CandidateStore: Send + Sync {
    /// Articles having a child label whose lowercase tag is in `labels_lower`,
    /// newest first (undated last), at most `limit`.
    async fn fetch_by_labels(
        &self,
        labels_lower: &[String],
        limit: i64,
    ) -> anyhow::Result<Vec<StoredArticle>>;

    async fn ping(&self) -> anyhow::Result<()>;
}

/// An article together with the label rows stored for it.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledArticle {
    pub record: ArticleRecord,
    pub labels: Vec<LabelRow>,
}

/// Write side used by ingestion.
#[async_trait::async_trait]
pub trait ArticleSink: Send + Sync {
    /// Upserts a page of articles and their labels as one unit: either every
    /// row is written or none is. Returns the number of articles written.
    async fn upsert_page(&self, page: &[LabeledArticle]) -> anyhow::Result<usize>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStatus {
    pub configured: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct PgStore {
    database_url: Option<String>,
    statement_timeout: Duration,
    tls_verify: bool,
    client: tokio::sync::Mutex<Option<Client>>,
}

impl PgStore {
    pub fn new(database_url: Option<String>) -> Self {
        Self {
            database_url: database_url.filter(|u| !u.trim().is_empty()),
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            tls_verify: false,
            client: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn with_tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.database_url.is_some()
    }

    async fn connect(url: &str, verify: bool) -> anyhow::Result<Client> {
        let (url, verify) = tls_mode(url, verify);
        let tls = tls_connector(verify)?;
        let (client, connection) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_postgres::connect(&url, tls))
            .await
            .context("timed out connecting to Postgres")?
            .context("failed to connect to Postgres")?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                log::warn!("postgres connection error: {err}");
            }
        });
        log::info!("connected to Postgres (tls_verify={verify})");
        Ok(client)
    }

    /// Lock the shared connection, opening or reopening it as needed.
    async fn connected(&self) -> anyhow::Result<tokio::sync::MutexGuard<'_, Option<Client>>> {
        let url = self
            .database_url
            .as_deref()
            .context("database url not configured")?;

        let mut guard = self.client.lock().await;
        let stale = guard.as_ref().map(|c| c.is_closed()).unwrap_or(true);
        if stale {
            *guard = Some(Self::connect(url, self.tls_verify).await?);
        }
        Ok(guard)
    }

    pub async fn status(&self) -> StoreStatus {
        if !self.is_configured() {
            return StoreStatus {
                error: Some("database url not configured".to_string()),
                ..Default::default()
            };
        }
        match self.ping().await {
            Ok(()) => StoreStatus {
                configured: true,
                connected: true,
                error: None,
            },
            Err(e) => StoreStatus {
                configured: true,
                connected: false,
                error: Some(format!("{e:#}")),
            },
        }
    }

    /// Drop the shared connection.
    pub async fn close(&self) {
        self.client.lock().await.take();
    }
}

/// TLS is offered on every connection; the server and the url's `sslmode`
/// decide whether it is used. tokio-postgres only knows `disable`, `prefer`
/// and `require`, so `verify-ca` and `verify-full` become `require` with
/// certificate verification switched on.
fn tls_mode(url: &str, verify: bool) -> (String, bool) {
    const KEY: &str = "sslmode=";
    let Some(start) = url.find(KEY).map(|i| i + KEY.len()) else {
        return (url.to_string(), verify);
    };
    let end = url[start..]
        .find(|c: char| c == '&' || c.is_whitespace())
        .map(|i| start + i)
        .unwrap_or(url.len());

    match &url[start..end] {
        "verify-ca" | "verify-full" => (format!("{}require{}", &url[..start], &url[end..]), true),
        _ => (url.to_string(), verify),
    }
}

fn tls_connector(verify: bool) -> anyhow::Result<MakeTlsConnector> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!verify)
        .danger_accept_invalid_hostnames(!verify)
        .build()
        .context("failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Unwraps a timed statement. On timeout the connection in `slot` is
/// dropped, since the server may still be executing it.
fn settle<T, C>(
    slot: &mut Option<C>,
    outcome: Result<Result<T, tokio_postgres::Error>, Elapsed>,
    what: &str,
) -> anyhow::Result<T> {
    match outcome {
        Ok(result) => result.with_context(|| format!("failed to {what}")),
        Err(_) => {
            slot.take();
            log::warn!("postgres statement timed out: {what}");
            anyhow::bail!("timed out waiting to {what}")
        }
    }
}

#[async_trait::async_trait]
impl CandidateStore for PgStore {
    async fn fetch_by_labels(
        &self,
        labels_lower: &[String],
        limit: i64,
    ) -> anyhow::Result<Vec<StoredArticle>> {
        if labels_lower.is_empty() {
            return Ok(vec![]);
        }
        let mut guard = self.connected().await?;
        let client = guard.as_ref().context("no postgres client")?;

        let outcome = tokio::time::timeout(
            self.statement_timeout,
            client.query(FETCH_BY_LABELS_SQL, &[&labels_lower, &limit]),
        )
        .await;
        let rows = settle(&mut *guard, outcome, "fetch articles by labels")?;

        log::debug!("fetched {} candidates for {:?}", rows.len(), labels_lower);
        rows.iter().map(StoredArticle::from_row).collect()
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let mut guard = self.connected().await?;
        let client = guard.as_ref().context("no postgres client")?;
        let outcome = tokio::time::timeout(self.statement_timeout, client.execute("SELECT 1", &[])).await;
        settle(&mut *guard, outcome, "ping postgres")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ArticleSink for PgStore {
    async fn upsert_page(&self, page: &[LabeledArticle]) -> anyhow::Result<usize> {
        if page.is_empty() {
            return Ok(0);
        }
        // begin + commit + one statement per article and per label
        let statements = 2 + page.iter().map(|a| 1 + a.labels.len()).sum::<usize>();
        let budget = self
            .statement_timeout
            .saturating_mul(u32::try_from(statements).unwrap_or(u32::MAX));

        let mut guard = self.connected().await?;
        let client = guard.as_mut().context("no postgres client")?;

        let outcome = tokio::time::timeout(budget, async move {
            let tx = client.transaction().await?;
            for item in page {
                let r = &item.record;
                let row = tx
                    .query_one(
                        UPSERT_ARTICLE_SQL,
                        &[
                            &r.external_id,
                            &r.web_url,
                            &r.title,
                            &r.abstract_text,
                            &r.byline,
                            &r.author_list,
                            &r.pub_date,
                            &r.section_name,
                            &r.news_desk,
                            &r.word_count,
                            &r.image_url,
                            &r.source_tags,
                            &r.t0_tag,
                            &r.raw,
                        ],
                    )
                    .await?;
                let article_id: String = row.try_get(0)?;

                for label in &item.labels {
                    tx.execute(
                        UPSERT_LABEL_SQL,
                        &[
                            &article_id,
                            &label.level.as_str(),
                            &label.tag,
                            &label.parent_tag,
                            &label.score,
                            &label.method,
                        ],
                    )
                    .await?;
                }
            }
            tx.commit().await?;
            Ok::<_, tokio_postgres::Error>(page.len())
        })
        .await;

        settle(&mut *guard, outcome, "upsert page of articles")
    }
}
