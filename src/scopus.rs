//! Scopus Search API client.
//!
//! Issues one search request per call and normalizes the returned entries into
//! [`Record`]s. Pagination uses result offsets (`start`), which the client hands
//! back as the page's continuation token.
//!
//! API details:
//! - `GET /content/search/scopus?query=..&start=..&count=..`
//! - API key in the `X-ELS-APIKey` header
//! - 429 when throttled, 401/403 for invalid or unauthorized keys
//! - An empty result set comes back as a single entry carrying only an `error` field

use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use crate::planner::Query;
use crate::record::{Page, Record};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// One page request against the search API.
#[derive(Debug, Clone, Copy)]
pub struct SearchRequest<'a> {
    pub query: &'a Query,
    /// Zero-based result offset
    pub start: u64,
    pub count: u32,
}

/// The remote search service, one request per call.
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn search(&self, request: SearchRequest<'_>) -> Result<Page>;
}

#[async_trait]
impl<T: SearchApi + ?Sized> SearchApi for std::sync::Arc<T> {
    async fn search(&self, request: SearchRequest<'_>) -> Result<Page> {
        (**self).search(request).await
    }
}

/// Scopus Search API client
pub struct ScopusClient {
    client: Client,
    base_url: String,
    api_key: String,
    view: String,
    include_raw: bool,
}

impl ScopusClient {
    /// Create a client against `base_url` authenticated with `api_key`.
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("scopus-harvester/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HarvestError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            api_key,
            view: "STANDARD".to_string(),
            include_raw: true,
        })
    }

    pub fn from_config(config: &HarvestConfig, api_key: String) -> Result<Self> {
        Ok(Self::new(&config.api.base_url, api_key)?
            .with_view(&config.api.view)
            .with_raw(config.output.include_raw))
    }

    pub fn with_view(mut self, view: &str) -> Self {
        self.view = view.to_string();
        self
    }

    /// Whether records keep the untouched entry JSON.
    pub fn with_raw(mut self, include_raw: bool) -> Self {
        self.include_raw = include_raw;
        self
    }
}

#[async_trait]
impl SearchApi for ScopusClient {
    async fn search(&self, request: SearchRequest<'_>) -> Result<Page> {
        debug!(
            query_id = %request.query.id,
            start = request.start,
            count = request.count,
            "Requesting Scopus page"
        );

        let start = request.start.to_string();
        let count = request.count.to_string();
        let response = self
            .client
            .get(&self.base_url)
            .header("X-ELS-APIKey", &self.api_key)
            .header(ACCEPT, "application/json")
            .query(&[
                ("query", request.query.expression.as_str()),
                ("start", start.as_str()),
                ("count", count.as_str()),
                ("view", self.view.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body = response.text().await?;
            return parse_response(&body, request, self.include_raw);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body, retry_after))
    }
}

/// Map a non-success response onto the error taxonomy.
fn status_error(status: StatusCode, body: &str, retry_after: Option<u64>) -> HarvestError {
    let code = status.as_u16();
    let message = error_message(body).unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::TOO_MANY_REQUESTS => HarvestError::RateLimited(retry_after),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HarvestError::Auth { code, message },
        s if s.is_server_error() => HarvestError::Server { code, message },
        _ => HarvestError::Api { code, message },
    }
}

/// Pull the human-readable message out of a Scopus error body.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["/service-error/status/statusText", "/error-response/error-message"]
        .iter()
        .find_map(|ptr| value.pointer(ptr).and_then(Value::as_str))
        .map(str::to_string)
}

// === Scopus API Response Types ===

#[derive(Debug, Deserialize)]
struct ScopusResponse {
    #[serde(rename = "search-results")]
    results: SearchResults,
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    #[serde(rename = "opensearch:totalResults", default)]
    total: Option<Value>,
    #[serde(default)]
    link: Vec<ScopusLink>,
    #[serde(default)]
    entry: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ScopusLink {
    #[serde(rename = "@ref", default)]
    rel: String,
    #[serde(rename = "@href", default)]
    href: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScopusEntry {
    eid: Option<String>,
    #[serde(rename = "dc:title")]
    title: Option<String>,
    #[serde(rename = "dc:creator")]
    creator: Option<String>,
    #[serde(rename = "prism:publicationName")]
    publication_name: Option<String>,
    #[serde(rename = "prism:coverDate")]
    cover_date: Option<String>,
    #[serde(rename = "prism:doi")]
    doi: Option<String>,
    #[serde(rename = "citedby-count")]
    cited_by: Option<Value>,
    subtype: Option<String>,
    #[serde(rename = "dc:description")]
    description: Option<String>,
    authkeywords: Option<String>,
    author: Vec<ScopusAuthor>,
    link: Vec<ScopusLink>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScopusAuthor {
    authname: Option<String>,
}

/// Parse a search response body into a page of records.
pub fn parse_response(body: &str, request: SearchRequest<'_>, include_raw: bool) -> Result<Page> {
    let response: ScopusResponse = serde_json::from_str(body)
        .map_err(|e| HarvestError::Parse(format!("Failed to parse Scopus response: {}", e)))?;
    let results = response.results;

    let total_hint = results.total.as_ref().and_then(as_u64).unwrap_or(0);
    let returned = results.entry.len() as u64;
    let has_next = results.link.iter().any(|l| l.rel == "next");

    let mut records = Vec::with_capacity(results.entry.len());
    for raw in results.entry {
        let entry: ScopusEntry = serde_json::from_value(raw.clone())
            .map_err(|e| HarvestError::Parse(format!("Malformed Scopus entry: {}", e)))?;
        if let Some(record) = normalize(entry, request.query, include_raw.then_some(raw)) {
            records.push(record);
        }
    }

    let next_token = (has_next && returned > 0).then(|| (request.start + returned).to_string());

    Ok(Page {
        records,
        next_token,
        total_hint,
    })
}

fn normalize(entry: ScopusEntry, query: &Query, raw: Option<Value>) -> Option<Record> {
    let id = entry.eid.map(|e| e.trim().to_string()).filter(|e| !e.is_empty())?;

    let mut authors: Vec<String> = entry
        .author
        .into_iter()
        .filter_map(|a| a.authname)
        .filter(|a| !a.trim().is_empty())
        .collect();
    if authors.is_empty() {
        authors.extend(entry.creator.filter(|c| !c.trim().is_empty()));
    }

    let year = entry
        .cover_date
        .as_deref()
        .and_then(|d| d.get(..4))
        .and_then(|y| y.parse().ok());

    let keywords = entry
        .authkeywords
        .map(|k| {
            k.split('|')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let link = entry
        .link
        .into_iter()
        .find(|l| l.rel == "scopus")
        .map(|l| l.href);

    Some(Record {
        id,
        doi: entry.doi.filter(|d| !d.is_empty()),
        title: entry.title.unwrap_or_default(),
        authors,
        venue: entry.publication_name.unwrap_or_default(),
        date: entry.cover_date,
        year,
        cited_by: entry.cited_by.as_ref().and_then(as_u64),
        document_type: entry.subtype,
        abstract_text: entry.description.filter(|d| !d.is_empty()),
        keywords,
        link,
        query_id: query.id.clone(),
        raw,
    })
}

/// Scopus encodes counts as strings; accept numbers too.
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
