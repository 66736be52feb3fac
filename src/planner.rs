//! Query planning.
//!
//! Expands a [`HarvestConfig`] into the ordered list of concrete Scopus queries
//! a run will execute. Term groups are combined (or flattened), query-side
//! filters are appended, and the publication-year range is cut into slices small
//! enough that each query's expected hit count stays under the API's per-query
//! ceiling.
//!
//! Planning is deterministic: the same configuration always yields the same
//! queries in the same order, and every query carries an id derived from its
//! content so checkpoints survive edits to the configuration.

use crate::config::{FilterConfig, HarvestConfig, TermGroup, YearRange};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{info, warn};

/// One concrete search sent to the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Query {
    /// Content hash of `expression` and `years`
    pub id: String,
    /// Full Scopus query string, year clause included
    pub expression: String,
    pub years: Option<YearRange>,
    /// `expression` without the subject-area, document-type and language clauses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unfiltered: Option<String>,
}

impl Query {
    pub fn new(expression: String, years: Option<YearRange>) -> Self {
        let id = query_id(&expression, years);
        Self {
            id,
            expression,
            years,
            unfiltered: None,
        }
    }

    /// The same search without query-side filters, if any were applied.
    pub fn unfiltered_query(&self) -> Option<Query> {
        self.unfiltered
            .as_ref()
            .map(|expression| Query::new(expression.clone(), self.years))
    }
}

/// A slice whose estimated hit count still exceeds the per-query ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanningWarning {
    pub query_id: String,
    pub expression: String,
    pub expected: u64,
    pub ceiling: u64,
}

impl std::fmt::Display for PlanningWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "query {} expects ~{} results but only {} are retrievable; results will be truncated",
            self.query_id, self.expected, self.ceiling
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub queries: Vec<Query>,
    pub warnings: Vec<PlanningWarning>,
}

pub struct QueryPlanner {
    ceiling: u64,
}

impl QueryPlanner {
    /// Create a planner for an API that returns at most `ceiling` results per query.
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling: ceiling.max(1),
        }
    }

    pub fn from_config(config: &HarvestConfig) -> Self {
        Self::new(config.api.max_results_per_query)
    }

    /// Expand `config` into its ordered query list.
    pub fn plan(&self, config: &HarvestConfig) -> Plan {
        let terms = term_expressions(&config.term_groups, config.compound_terms);
        let filters = filter_clauses(&config.filters);

        let slices: Vec<Option<YearRange>> = match config.date_range {
            Some(range) => slice_range(range, self.slice_width(config, range))
                .into_iter()
                .map(Some)
                .collect(),
            None => vec![None],
        };

        let mut plan = Plan::default();
        let mut seen = HashSet::new();

        for term in &terms {
            for years in &slices {
                let mut clauses = Vec::with_capacity(filters.len() + 2);
                clauses.push(term.clone());
                clauses.extend(filters.iter().cloned());
                if let Some(range) = years {
                    clauses.push(year_clause(*range));
                }

                let mut query = Query::new(clauses.join(" AND "), *years);
                if !filters.is_empty() {
                    query.unfiltered = Some(match years {
                        Some(range) => format!("{} AND {}", term, year_clause(*range)),
                        None => term.clone(),
                    });
                }
                if !seen.insert(query.id.clone()) {
                    continue;
                }

                if let (Some(per_year), Some(range)) = (config.expected_results_per_year, years) {
                    let expected = per_year.saturating_mul(range.len() as u64);
                    if expected > self.ceiling {
                        let warning = PlanningWarning {
                            query_id: query.id.clone(),
                            expression: query.expression.clone(),
                            expected,
                            ceiling: self.ceiling,
                        };
                        warn!(query_id = %query.id, expected, ceiling = self.ceiling, "Query slice exceeds result ceiling");
                        plan.warnings.push(warning);
                    }
                }

                plan.queries.push(query);
            }
        }

        info!(
            queries = plan.queries.len(),
            term_combinations = terms.len(),
            slices = slices.len(),
            warnings = plan.warnings.len(),
            "Planned harvest"
        );
        plan
    }

    fn slice_width(&self, config: &HarvestConfig, range: YearRange) -> u32 {
        if let Some(width) = config.slice_years {
            return width.max(1);
        }
        match config.expected_results_per_year {
            Some(per_year) => (self.ceiling / per_year.max(1)).clamp(1, u32::MAX as u64) as u32,
            None => range.len().max(1),
        }
    }
}

/// Render every term combination as a query fragment, in configuration order.
fn term_expressions(groups: &[TermGroup], compound: bool) -> Vec<String> {
    if !compound {
        return groups
            .iter()
            .flat_map(|g| g.terms.iter().map(move |t| term_clause(&g.field, t)))
            .collect();
    }

    let mut combos: Vec<Vec<String>> = vec![Vec::new()];
    for group in groups {
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                group.terms.iter().map(move |term| {
                    let mut combo = prefix.clone();
                    combo.push(term_clause(&group.field, term));
                    combo
                })
            })
            .collect();
    }
    combos.into_iter().map(|c| c.join(" AND ")).collect()
}

/// Embedded quotes are dropped: Scopus phrase matching ignores punctuation and
/// a stray quote would end the phrase early.
fn term_clause(field: &str, term: &str) -> String {
    format!("{}(\"{}\")", field, term.trim().replace('"', ""))
}

fn filter_clauses(filters: &FilterConfig) -> Vec<String> {
    [
        ("SUBJAREA", &filters.subject_areas),
        ("DOCTYPE", &filters.document_types),
        ("LANGUAGE", &filters.languages),
    ]
    .into_iter()
    .filter(|(_, values)| !values.is_empty())
    .map(|(field, values)| {
        let values: Vec<&str> = values.iter().map(|v| v.trim()).collect();
        format!("{}({})", field, values.join(" OR "))
    })
    .collect()
}

fn year_clause(range: YearRange) -> String {
    format!("PUBYEAR > {} AND PUBYEAR < {}", range.start - 1, range.end + 1)
}

/// Cut `range` into contiguous slices of at most `width` years.
fn slice_range(range: YearRange, width: u32) -> Vec<YearRange> {
    let width = i64::from(width.max(1));
    let end = i64::from(range.end);
    let mut slices = Vec::new();
    let mut start = i64::from(range.start);
    while start <= end {
        let slice_end = (start + width - 1).min(end);
        slices.push(YearRange::new(start as i32, slice_end as i32));
        start = slice_end + 1;
    }
    slices
}

fn query_id(expression: &str, years: Option<YearRange>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(expression.as_bytes());
    hasher.update(b"\n");
    if let Some(range) = years {
        hasher.update(format!("{}:{}", range.start, range.end).as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}
