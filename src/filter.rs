//! Client-side record filters.
//!
//! Subject areas, document types and languages are part of the query string.
//! The two filters here cannot be expressed that way: a DOI exclusion list and
//! a required-methodology check against the abstract and author keywords.

use crate::config::FilterConfig;
use crate::error::{HarvestError, Result};
use crate::record::Record;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::HashSet;

/// Why a record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    ExcludedDoi,
    NoMethodology,
}

/// Per-reason rejection counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterCounts {
    pub excluded_doi: u64,
    pub no_methodology: u64,
}

impl FilterCounts {
    pub fn record(&mut self, rejection: Rejection) {
        match rejection {
            Rejection::ExcludedDoi => self.excluded_doi += 1,
            Rejection::NoMethodology => self.no_methodology += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.excluded_doi + self.no_methodology
    }

    pub fn merge(&mut self, other: &FilterCounts) {
        self.excluded_doi += other.excluded_doi;
        self.no_methodology += other.no_methodology;
    }
}

#[derive(Debug, Default)]
pub struct RecordFilter {
    excluded_dois: HashSet<String>,
    methodology: Option<Regex>,
}

impl RecordFilter {
    pub fn new(filters: &FilterConfig) -> Result<Self> {
        let excluded_dois = filters
            .exclude_dois
            .iter()
            .map(|d| normalize_doi(d))
            .filter(|d| !d.is_empty())
            .collect();

        let terms: Vec<String> = filters
            .methodologies
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .map(regex::escape)
            .collect();
        let methodology = if terms.is_empty() {
            None
        } else {
            let pattern = format!(r"(?:^|\W)(?:{})(?:\W|$)", terms.join("|"));
            let re = RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| HarvestError::Config(format!("filters.methodologies: {}", e)))?;
            Some(re)
        };

        Ok(Self {
            excluded_dois,
            methodology,
        })
    }

    /// Check `record` against every filter.
    pub fn check(&self, record: &Record) -> std::result::Result<(), Rejection> {
        if let Some(doi) = &record.doi {
            if self.excluded_dois.contains(&normalize_doi(doi)) {
                return Err(Rejection::ExcludedDoi);
            }
        }

        if let Some(re) = &self.methodology {
            let in_abstract = record
                .abstract_text
                .as_deref()
                .is_some_and(|a| re.is_match(a));
            let in_keywords = record.keywords.iter().any(|k| re.is_match(k));
            if !in_abstract && !in_keywords {
                return Err(Rejection::NoMethodology);
            }
        }

        Ok(())
    }
}

/// Lowercase, without any resolver prefix.
fn normalize_doi(doi: &str) -> String {
    let doi = doi.trim().to_lowercase();
    ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "doi:"]
        .iter()
        .find_map(|prefix| doi.strip_prefix(prefix))
        .map(str::to_string)
        .unwrap_or(doi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(doi: Option<&str>, abstract_text: Option<&str>, keywords: &[&str]) -> Record {
        Record {
            id: "2-s2.0-1".into(),
            doi: doi.map(str::to_string),
            abstract_text: abstract_text.map(str::to_string),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_filters_accepts_everything() -> Result<()> {
        let filter = RecordFilter::new(&FilterConfig::default())?;
        assert_eq!(filter.check(&record(None, None, &[])), Ok(()));
        Ok(())
    }

    #[test]
    fn test_excluded_doi_case_and_prefix_insensitive() -> Result<()> {
        let filter = RecordFilter::new(&FilterConfig {
            exclude_dois: vec!["https://doi.org/10.1000/ABC".into()],
            ..Default::default()
        })?;
        assert_eq!(
            filter.check(&record(Some("10.1000/abc"), None, &[])),
            Err(Rejection::ExcludedDoi)
        );
        assert_eq!(filter.check(&record(Some("10.1000/abd"), None, &[])), Ok(()));
        assert_eq!(filter.check(&record(None, None, &[])), Ok(()));
        Ok(())
    }

    #[test]
    fn test_methodology_matches_whole_words() -> Result<()> {
        let filter = RecordFilter::new(&FilterConfig {
            methodologies: vec!["survey".into(), "case study".into()],
            ..Default::default()
        })?;
        assert_eq!(
            filter.check(&record(None, Some("A national Survey of trust."), &[])),
            Ok(())
        );
        assert_eq!(filter.check(&record(None, None, &["Case Study"])), Ok(()));
        assert_eq!(
            filter.check(&record(None, Some("We surveyed nobody."), &["theory"])),
            Err(Rejection::NoMethodology)
        );
        assert_eq!(
            filter.check(&record(None, None, &[])),
            Err(Rejection::NoMethodology)
        );
        Ok(())
    }

    #[test]
    fn test_methodology_terms_are_literal() -> Result<()> {
        let filter = RecordFilter::new(&FilterConfig {
            methodologies: vec!["q-sort (PCA)".into()],
            ..Default::default()
        })?;
        assert_eq!(filter.check(&record(None, Some("using q-sort (PCA)."), &[])), Ok(()));
        assert_eq!(
            filter.check(&record(None, Some("using q-sort PCA"), &[])),
            Err(Rejection::NoMethodology)
        );
        Ok(())
    }

    #[test]
    fn test_methodology_needs_complete_view_fields() -> Result<()> {
        use crate::planner::Query;
        use crate::scopus::{parse_response, SearchRequest};

        let filter = RecordFilter::new(&FilterConfig {
            methodologies: vec!["survey".into()],
            ..Default::default()
        })?;
        let query = Query::new(r#"TITLE-ABS-KEY("trust")"#.to_string(), None);
        let request = SearchRequest { query: &query, start: 0, count: 25 };

        // STANDARD entries carry the title only.
        let standard = r#"{ "search-results": { "opensearch:totalResults": "1",
            "entry": [{ "eid": "2-s2.0-1", "dc:title": "A survey of trust" }] } }"#;
        let page = parse_response(standard, request, false)?;
        assert_eq!(filter.check(&page.records[0]), Err(Rejection::NoMethodology));

        let complete = r#"{ "search-results": { "opensearch:totalResults": "1",
            "entry": [{ "eid": "2-s2.0-1", "dc:title": "A survey of trust",
                        "dc:description": "We report a national survey.",
                        "authkeywords": "trust | survey" }] } }"#;
        let page = parse_response(complete, request, false)?;
        assert_eq!(filter.check(&page.records[0]), Ok(()));
        Ok(())
    }

    #[test]
    fn test_counts() {
        let mut counts = FilterCounts::default();
        counts.record(Rejection::ExcludedDoi);
        counts.record(Rejection::NoMethodology);
        counts.record(Rejection::NoMethodology);
        let mut total = FilterCounts::default();
        total.merge(&counts);
        assert_eq!(total.total(), 3);
        assert_eq!(total.no_methodology, 2);
    }
}
