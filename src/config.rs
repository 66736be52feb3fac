//! Harvest configuration.
//!
//! The configuration is a JSON document loaded once at startup. Unknown keys are
//! ignored; missing required keys (`term_groups`, `output.path`) and violated
//! invariants are reported as [`HarvestError::Config`].

use crate::error::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Scopus Search API endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.elsevier.com/content/search/scopus";

/// Scopus refuses offsets beyond this for a single search
pub const DEFAULT_MAX_RESULTS_PER_QUERY: u64 = 5000;

/// Largest `count` the Search API accepts per page
pub const MAX_RESULTS_PER_PAGE: u32 = 200;

/// Publication years accepted in `date_range`
pub const YEAR_BOUNDS: std::ops::RangeInclusive<i32> = 1000..=9999;

/// Complete, validated harvest configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Identifier recorded in the run summary
    #[serde(default = "default_harvest_id")]
    pub harvest_id: String,
    /// Ordered search-term groups
    pub term_groups: Vec<TermGroup>,
    /// Combine one term per group (product) instead of searching every term alone
    #[serde(default = "default_true")]
    pub compound_terms: bool,
    /// Inclusive publication-year range
    #[serde(default)]
    pub date_range: Option<YearRange>,
    /// Fixed width (in years) of each date slice
    #[serde(default)]
    pub slice_years: Option<u32>,
    /// Planning estimate used to size slices against the per-query ceiling
    #[serde(default)]
    pub expected_results_per_year: Option<u64>,
    #[serde(default = "default_results_per_page")]
    pub results_per_page: u32,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    /// Count each query's hits without its query-side filters (one extra request per query)
    #[serde(default = "default_true")]
    pub report_unfiltered_hits: bool,
    pub output: OutputConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Continue from an existing checkpoint and output instead of starting over
    #[serde(default = "default_true")]
    pub resume: bool,
}

/// A Scopus field code plus the alternative terms searched in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermGroup {
    /// Field code, e.g. `TITLE-ABS-KEY` or `REFTITLE`
    #[serde(default = "default_field")]
    pub field: String,
    pub terms: Vec<String>,
}

/// Inclusive range of publication years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct YearRange {
    pub start: i32,
    pub end: i32,
}

impl YearRange {
    pub fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    /// Number of years covered.
    pub fn len(&self) -> u32 {
        (self.end - self.start + 1).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, year: i32) -> bool {
        (self.start..=self.end).contains(&year)
    }
}

impl std::fmt::Display for YearRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Proactive request pacing: at most `requests_per_window` requests per `window_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub requests_per_window: u32,
    pub window_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 9,
            window_secs: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Scopus response view; `COMPLETE` adds abstracts and author keywords
    pub view: String,
    /// Per-request deadline
    pub timeout_secs: u64,
    /// Results reachable through one query before the API stops paginating
    pub max_results_per_query: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key_env: "SCOPUS_API_KEY".to_string(),
            view: "STANDARD".to_string(),
            timeout_secs: 30,
            max_results_per_query: DEFAULT_MAX_RESULTS_PER_QUERY,
        }
    }
}

/// Record filters. The first three are folded into the query expression, the
/// last two are applied to fetched records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Scopus subject area codes, e.g. `SOCI`
    pub subject_areas: Vec<String>,
    /// Document subtype codes, e.g. `ar`
    pub document_types: Vec<String>,
    pub languages: Vec<String>,
    /// Keep a record only if one of these occurs in its abstract or keywords
    pub methodologies: Vec<String>,
    pub exclude_dois: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One JSON object per line
    #[default]
    Jsonl,
    Csv,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub format: OutputFormat,
    /// Carry the untouched API entry alongside the normalized fields
    #[serde(default = "default_true")]
    pub include_raw: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Defaults to `<output>.checkpoint.json`
    pub path: Option<PathBuf>,
    /// Keep the checkpoint after a fully successful run
    pub retain_on_success: bool,
}

fn default_harvest_id() -> String {
    "harvest".to_string()
}

fn default_field() -> String {
    "TITLE-ABS-KEY".to_string()
}

fn default_results_per_page() -> u32 {
    25
}

fn default_true() -> bool {
    true
}

impl HarvestConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&content)?;
        debug!(path = %path.display(), groups = config.term_groups.len(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate a configuration document.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| HarvestError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.term_groups.is_empty() {
            return invalid("term_groups must not be empty");
        }
        for (idx, group) in self.term_groups.iter().enumerate() {
            if !is_field_code(&group.field) {
                return invalid(format!("term_groups[{}]: invalid field code {:?}", idx, group.field));
            }
            if group.terms.is_empty() {
                return invalid(format!("term_groups[{}]: terms must not be empty", idx));
            }
            if group.terms.iter().any(|t| t.trim().is_empty()) {
                return invalid(format!("term_groups[{}]: blank term", idx));
            }
        }

        if let Some(range) = self.date_range {
            if !YEAR_BOUNDS.contains(&range.start) || !YEAR_BOUNDS.contains(&range.end) {
                return invalid(format!(
                    "date_range years must lie within {}..={}",
                    YEAR_BOUNDS.start(),
                    YEAR_BOUNDS.end()
                ));
            }
            if range.start > range.end {
                return invalid(format!(
                    "date_range start {} is after end {}",
                    range.start, range.end
                ));
            }
        }

        positive("slice_years", self.slice_years.unwrap_or(1) as u64)?;
        positive(
            "expected_results_per_year",
            self.expected_results_per_year.unwrap_or(1),
        )?;
        positive("results_per_page", self.results_per_page as u64)?;
        if self.results_per_page > MAX_RESULTS_PER_PAGE {
            return invalid(format!(
                "results_per_page must be at most {}",
                MAX_RESULTS_PER_PAGE
            ));
        }
        positive("pacing.requests_per_window", self.pacing.requests_per_window as u64)?;
        positive("pacing.window_secs", self.pacing.window_secs)?;
        positive("retry.base_delay_ms", self.retry.base_delay_ms)?;
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max_delay_ms must not be below retry.base_delay_ms");
        }
        positive("api.timeout_secs", self.api.timeout_secs)?;
        positive("api.max_results_per_query", self.api.max_results_per_query)?;

        url::Url::parse(&self.api.base_url)
            .map_err(|e| HarvestError::Config(format!("api.base_url: {}", e)))?;
        if self.api.api_key_env.trim().is_empty() {
            return invalid("api.api_key_env must not be empty");
        }
        if !matches!(self.api.view.as_str(), "STANDARD" | "COMPLETE") {
            return invalid(format!("api.view must be STANDARD or COMPLETE, got {:?}", self.api.view));
        }
        // Abstracts and author keywords only come back in the COMPLETE view.
        if self.filters.methodologies.iter().any(|m| !m.trim().is_empty()) && self.api.view != "COMPLETE" {
            return invalid("filters.methodologies requires api.view = \"COMPLETE\"");
        }

        if self.output.path.as_os_str().is_empty() {
            return invalid("output.path must not be empty");
        }

        Ok(())
    }

    /// Where progress is checkpointed.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint
            .path
            .clone()
            .unwrap_or_else(|| sibling(&self.output.path, ".checkpoint.json"))
    }

    /// Where the run summary is written.
    pub fn summary_path(&self) -> PathBuf {
        sibling(&self.output.path, ".summary.json")
    }

    /// Where the configuration used for a run is copied.
    pub fn snapshot_path(&self) -> PathBuf {
        sibling(&self.output.path, ".config.json")
    }
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn is_field_code(field: &str) -> bool {
    !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
}

fn positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return invalid(format!("{} must be a positive integer", name));
    }
    Ok(())
}

fn invalid<T>(msg: impl Into<String>) -> Result<T> {
    Err(HarvestError::Config(msg.into()))
}
