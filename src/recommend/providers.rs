//! Web collaborators of the search strategy: a search engine returning
//! result URLs and a resolver turning a URL into a [`Candidate`].

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use scraper::{Html, Selector};

use super::candidate::Candidate;
use super::normalize::{domain_of, normalize_url};

pub const USER_AGENT: &str = "thyself/1.0";

const SERPAPI_ENDPOINT: &str = "https://serpapi.com/search.json";

/// Domains whose articles sit behind a paywall.
const PAYWALLED: [&str; 3] = ["www.ft.com", "www.economist.com", "www.nytimes.com"];

pub fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// False when credentials are missing; `search` then returns nothing.
    fn is_configured(&self) -> bool;

    /// Ordered result URLs, at most `top_k`.
    async fn search(&self, query: &str, top_k: usize) -> anyhow::Result<Vec<String>>;
}

#[async_trait::async_trait]
pub trait MetadataResolver: Send + Sync {
    /// `Ok(None)` when the page is unavailable or empty.
    async fn resolve(&self, url: &str) -> anyhow::Result<Option<Candidate>>;
}

pub struct SerpApiSearch {
    client: reqwest::Client,
    api_key: String,
}

impl SerpApiSearch {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self { client, api_key }
    }
}

#[async_trait::async_trait]
impl SearchProvider for SerpApiSearch {
    fn name(&self) -> &'static str {
        "serpapi"
    }

    fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    async fn search(&self, query: &str, top_k: usize) -> anyhow::Result<Vec<String>> {
        if !self.is_configured() {
            return Ok(vec![]);
        }

        let num = top_k.to_string();
        let body: serde_json::Value = self
            .client
            .get(SERPAPI_ENDPOINT)
            .query(&[("q", query), ("num", num.as_str()), ("api_key", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(organic_links(&body, top_k))
    }
}

/// `organic_results[].link` of a SerpAPI response.
pub fn organic_links(body: &serde_json::Value, top_k: usize) -> Vec<String> {
    body.get("organic_results")
        .and_then(|v| v.as_array())
        .map(|results| {
            results
                .iter()
                .take(top_k)
                .filter_map(|r| r.get("link").and_then(|l| l.as_str()))
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub struct HtmlMetadataResolver {
    client: reqwest::Client,
}

impl HtmlMetadataResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl MetadataResolver for HtmlMetadataResolver {
    async fn resolve(&self, url: &str) -> anyhow::Result<Option<Candidate>> {
        let url = normalize_url(url);
        let Some(domain) = domain_of(&url) else {
            return Ok(None);
        };

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            log::debug!("{url}: status {status}");
            return Ok(None);
        }

        let html = response.text().await?;
        if html.trim().is_empty() {
            return Ok(None);
        }

        Ok(Some(parse_page(&html, &url, &domain)))
    }
}

fn meta_content(document: &Html, key: &str) -> Option<String> {
    let selector =
        Selector::parse(&format!(r#"meta[property="{key}"], meta[name="{key}"]"#)).ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn first_meta(document: &Html, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| meta_content(document, k))
}

/// Compile the title selector once
static TITLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("title").expect("Failed to compile title selector"));

fn title_tag(document: &Html) -> Option<String> {
    document
        .select(&TITLE_SELECTOR)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Build a candidate from page HTML. `url` must already be normalized.
pub fn parse_page(html: &str, url: &str, domain: &str) -> Candidate {
    let document = Html::parse_document(html);

    let site = first_meta(&document, &["og:site_name", "twitter:site"])
        .unwrap_or_else(|| domain.to_string());
    let title = first_meta(&document, &["og:title", "twitter:title"])
        .or_else(|| title_tag(&document))
        .unwrap_or_else(|| site.clone());

    Candidate {
        url: url.to_string(),
        domain: domain.to_string(),
        title,
        source: site,
        author: first_meta(&document, &["author", "article:author"]).unwrap_or_default(),
        description: first_meta(&document, &["og:description", "description"])
            .unwrap_or_default(),
        published: first_meta(&document, &["article:published_time", "date"])
            .and_then(|s| parse_published(&s)),
        paywall: PAYWALLED.contains(&domain).then_some(true),
        image_url: first_meta(&document, &["og:image", "twitter:image"]).unwrap_or_default(),
        score: 0.0,
    }
}

/// RFC 3339, naive ISO datetime (taken as UTC), or a bare date.
pub fn parse_published(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const PAGE: &str = r#"
<html><head>
  <title>  Fallback Title </title>
  <meta property="og:title" content="The Real Title">
  <meta property="og:site_name" content="Aeon">
  <meta name="author" content="Jane Doe">
  <meta name="description" content="plain description">
  <meta property="og:description" content="og description">
  <meta name="twitter:image" content="https://img/twitter.jpg">
  <meta property="article:published_time" content="2024-05-06T07:08:09Z">
</head><body></body></html>"#;

    #[test]
    fn test_parse_page_prefers_og_fields() {
        let c = parse_page(PAGE, "https://aeon.co/essays/x", "aeon.co");
        assert_eq!(c.title, "The Real Title");
        assert_eq!(c.source, "Aeon");
        assert_eq!(c.author, "Jane Doe");
        assert_eq!(c.description, "og description");
        assert_eq!(c.image_url, "https://img/twitter.jpg");
        assert_eq!(c.paywall, None);
        let published = c.published.unwrap();
        assert_eq!((published.year(), published.month(), published.hour()), (2024, 5, 7));
    }

    #[test]
    fn test_parse_page_fallbacks() {
        let html = "<html><head><title>Only Title</title></head></html>";
        let c = parse_page(html, "https://www.ft.com/x", "www.ft.com");
        assert_eq!(c.title, "Only Title");
        assert_eq!(c.source, "www.ft.com");
        assert_eq!(c.paywall, Some(true));
        assert!(c.published.is_none());

        let bare = parse_page("<html></html>", "https://hbr.org/x", "hbr.org");
        assert_eq!(bare.title, "hbr.org");
    }

    #[test]
    fn test_parse_published_formats() {
        assert!(parse_published("2024-01-02T03:04:05+02:00").is_some());
        assert!(parse_published("2024-01-02T03:04:05").is_some());
        assert_eq!(parse_published("2024-01-02").unwrap().day(), 2);
        assert!(parse_published("last tuesday").is_none());
    }

    #[test]
    fn test_organic_links() {
        let body = serde_json::json!({
            "organic_results": [
                {"link": "https://a"},
                {"title": "no link"},
                {"link": "https://b"},
                {"link": "https://c"}
            ]
        });
        assert_eq!(organic_links(&body, 3), vec!["https://a", "https://b"]);
        assert!(organic_links(&serde_json::json!({}), 5).is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_serpapi_returns_nothing() {
        let client = http_client(Duration::from_secs(1)).unwrap();
        let search = SerpApiSearch::new(client, String::new());
        assert!(!search.is_configured());
        assert!(search.search("anything", 5).await.unwrap().is_empty());
    }
}
