//! Normalized publication records and result pages.

use serde::{Deserialize, Serialize};

/// A normalized publication metadata entry.
///
/// `id` is the Scopus EID, which is stable across searches and is the key used
/// for deduplication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    /// Journal or source title
    #[serde(default)]
    pub venue: String,
    /// Cover date (YYYY-MM-DD)
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub cited_by: Option<u64>,
    /// Document subtype code (ar, re, cp, ...)
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub link: Option<String>,
    /// Query that first produced this record
    #[serde(default)]
    pub query_id: String,
    /// Untouched API entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// One batch of results for a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<Record>,
    /// Token for the following page, `None` once the result set is exhausted
    pub next_token: Option<String>,
    /// Total result count reported by the API
    pub total_hint: u64,
}

impl Page {
    pub fn is_last(&self) -> bool {
        self.next_token.is_none()
    }
}
