//! Harvest orchestration.
//!
//! [`Harvester::run`] plans the queries, then works through them one at a time.
//! Each page is filtered, deduplicated and appended to the output before the
//! checkpoint moves past it, so a crash at any point costs at most a re-fetch
//! of pages whose records the deduplicator will then suppress.

use crate::checkpoint::{write_atomic, CheckpointStore};
use crate::config::{HarvestConfig, YearRange};
use crate::dedup::Deduplicator;
use crate::error::{HarvestError, Result};
use crate::fetcher::PaginatedFetcher;
use crate::filter::{FilterCounts, RecordFilter};
use crate::output::OutputWriter;
use crate::planner::{Query, QueryPlanner};
use crate::scopus::SearchApi;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Pending,
    Fetching,
    Completed,
    Failed,
    /// Already complete according to the checkpoint
    Skipped,
}

/// What happened to one query during a run.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub query_id: String,
    pub expression: String,
    pub years: Option<YearRange>,
    pub status: QueryStatus,
    /// Result count reported by the API
    pub total_hint: u64,
    /// Result count without subject-area, document-type and language clauses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unfiltered_hits: Option<u64>,
    pub fetched: u64,
    pub filtered: FilterCounts,
    pub duplicates: u64,
    pub written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryOutcome {
    fn new(query: &Query) -> Self {
        Self {
            query_id: query.id.clone(),
            expression: query.expression.clone(),
            years: query.years,
            status: QueryStatus::Pending,
            total_hint: 0,
            unfiltered_hits: None,
            fetched: 0,
            filtered: FilterCounts::default(),
            duplicates: 0,
            written: 0,
            error: None,
        }
    }
}

/// Run report, also written next to the output.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub harvest_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub planned: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Sum of `unfiltered_hits` over queries where it was counted
    pub unfiltered_hits: u64,
    /// Sum of the API's result counts
    pub total_hits: u64,
    pub records_fetched: u64,
    pub records_written: u64,
    pub duplicates: u64,
    pub filtered: FilterCounts,
    pub warnings: Vec<String>,
    pub interrupted: bool,
    /// Set when a fatal error aborted the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    pub queries: Vec<QueryOutcome>,
}

impl HarvestSummary {
    pub(crate) fn new(harvest_id: &str) -> Self {
        Self {
            harvest_id: harvest_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            planned: 0,
            completed: 0,
            skipped: 0,
            failed: 0,
            unfiltered_hits: 0,
            total_hits: 0,
            records_fetched: 0,
            records_written: 0,
            duplicates: 0,
            filtered: FilterCounts::default(),
            warnings: Vec::new(),
            interrupted: false,
            fatal_error: None,
            queries: Vec::new(),
        }
    }

    /// Every planned query finished and nothing was interrupted.
    pub fn is_success(&self) -> bool {
        self.failed == 0
            && !self.interrupted
            && self.fatal_error.is_none()
            && self.completed + self.skipped == self.planned
    }

    fn add(&mut self, outcome: QueryOutcome) {
        match outcome.status {
            QueryStatus::Completed => self.completed += 1,
            QueryStatus::Skipped => self.skipped += 1,
            QueryStatus::Failed => self.failed += 1,
            QueryStatus::Pending | QueryStatus::Fetching => {}
        }
        self.unfiltered_hits += outcome.unfiltered_hits.unwrap_or(0);
        self.total_hits += outcome.total_hint;
        self.records_fetched += outcome.fetched;
        self.records_written += outcome.written;
        self.duplicates += outcome.duplicates;
        self.filtered.merge(&outcome.filtered);
        self.queries.push(outcome);
    }
}

/// How a query's pagination ended without an error.
enum QueryEnd {
    Exhausted,
    Cancelled,
}

/// State shared by every query of one run.
struct RunState {
    filter: RecordFilter,
    dedup: Deduplicator,
    output: OutputWriter,
    checkpoint: CheckpointStore,
}

pub struct Harvester<A> {
    config: HarvestConfig,
    fetcher: PaginatedFetcher<A>,
    cancel: CancellationToken,
}

impl<A: SearchApi> Harvester<A> {
    pub fn new(config: HarvestConfig, fetcher: PaginatedFetcher<A>) -> Self {
        Self {
            config,
            fetcher,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop at the next page boundary once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Run the whole harvest.
    ///
    /// Query failures are recorded and the run continues. Authentication and
    /// storage failures abort it with [`HarvestError::Aborted`], which carries
    /// the summary up to that point; written output and checkpoint stay intact.
    pub async fn run(&self) -> Result<HarvestSummary> {
        let config = &self.config;
        let mut summary = HarvestSummary::new(&config.harvest_id);

        let plan = QueryPlanner::from_config(config).plan(config);
        summary.warnings = plan.warnings.iter().map(ToString::to_string).collect();
        summary.planned = plan.queries.len();

        let mut queries = plan.queries.iter();
        let result = self.execute(&mut queries, &mut summary).await;
        for query in queries {
            summary.add(QueryOutcome::new(query));
        }
        summary.finished_at = Some(Utc::now());

        let mut state = match result {
            Ok(state) => state,
            Err(e) => {
                error!(harvest_id = %summary.harvest_id, error = %e, "Aborting harvest");
                summary.fatal_error = Some(e.to_string());
                if let Err(report) = self.write_summary(&summary) {
                    warn!(error = %report, "Could not write summary of aborted harvest");
                }
                return Err(HarvestError::Aborted {
                    summary: Box::new(summary),
                    source: Box::new(e),
                });
            }
        };

        if summary.is_success() && !config.checkpoint.retain_on_success {
            state.checkpoint.clear()?;
        }
        let summary_path = self.write_summary(&summary)?;
        info!(
            harvest_id = %summary.harvest_id,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            written = summary.records_written,
            duplicates = summary.duplicates,
            interrupted = summary.interrupted,
            summary = %summary_path.display(),
            "Harvest finished"
        );
        Ok(summary)
    }

    /// Work through `queries`, adding one outcome per query taken from the iterator.
    async fn execute(
        &self,
        queries: &mut std::slice::Iter<'_, Query>,
        summary: &mut HarvestSummary,
    ) -> Result<RunState> {
        let config = &self.config;
        let mut state = self.prepare()?;
        write_atomic(&config.snapshot_path(), &serde_json::to_vec_pretty(config)?)?;
        info!(
            harvest_id = %config.harvest_id,
            queries = summary.planned,
            known_records = state.dedup.len(),
            "Starting harvest"
        );

        for query in queries.by_ref() {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                summary.add(QueryOutcome::new(query));
                break;
            }

            let mut outcome = QueryOutcome::new(query);
            if state.checkpoint.state().is_complete(&query.id) {
                info!(query_id = %query.id, "Already complete, skipping");
                outcome.status = QueryStatus::Skipped;
                summary.add(outcome);
                continue;
            }

            outcome.status = QueryStatus::Fetching;
            info!(query_id = %query.id, expression = %query.expression, "Fetching query");

            let result = match self.count_unfiltered(query, &mut outcome).await {
                Ok(()) => self.run_query(query, &mut state, &mut outcome).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(QueryEnd::Exhausted) => {
                    outcome.status = QueryStatus::Completed;
                    info!(
                        query_id = %query.id,
                        fetched = outcome.fetched,
                        written = outcome.written,
                        duplicates = outcome.duplicates,
                        filtered = outcome.filtered.total(),
                        "Query complete"
                    );
                }
                Ok(QueryEnd::Cancelled) => {
                    warn!(query_id = %query.id, "Harvest interrupted");
                    summary.interrupted = true;
                    summary.add(outcome);
                    break;
                }
                Err(e @ HarvestError::Fetch { .. }) => {
                    error!(query_id = %query.id, error = %e, "Query failed");
                    state.checkpoint.record_failure(&query.id, &e.to_string())?;
                    outcome.status = QueryStatus::Failed;
                    outcome.error = Some(e.to_string());
                }
                Err(e) => {
                    outcome.status = QueryStatus::Failed;
                    outcome.error = Some(e.to_string());
                    summary.add(outcome);
                    return Err(e);
                }
            }
            summary.add(outcome);
        }
        Ok(state)
    }

    /// Record how many hits the query has before query-side filters.
    async fn count_unfiltered(&self, query: &Query, outcome: &mut QueryOutcome) -> Result<()> {
        if !self.config.report_unfiltered_hits {
            return Ok(());
        }
        let Some(unfiltered) = query.unfiltered_query() else {
            return Ok(());
        };
        match self.fetcher.total_hits(&unfiltered).await {
            Ok(hits) => {
                outcome.unfiltered_hits = Some(hits);
                Ok(())
            }
            Err(e @ HarvestError::Fetch { .. }) => {
                warn!(query_id = %query.id, error = %e, "Could not count unfiltered hits");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn write_summary(&self, summary: &HarvestSummary) -> Result<std::path::PathBuf> {
        let path = self.config.summary_path();
        write_atomic(&path, &serde_json::to_vec_pretty(summary)?)?;
        Ok(path)
    }

    /// Load or reset checkpoint and output, and seed the deduplicator.
    fn prepare(&self) -> Result<RunState> {
        let config = &self.config;
        let filter = RecordFilter::new(&config.filters)?;

        let mut checkpoint = CheckpointStore::new(config.checkpoint_path());
        if config.resume {
            checkpoint.load()?;
        } else {
            checkpoint.clear()?;
        }

        let output = OutputWriter::open(
            &config.output.path,
            config.output.format,
            config.output.include_raw,
            !config.resume,
        )?;
        let dedup = Deduplicator::from_ids(OutputWriter::scan_ids(
            &config.output.path,
            config.output.format,
        )?);

        Ok(RunState {
            filter,
            dedup,
            output,
            checkpoint,
        })
    }

    async fn run_query(
        &self,
        query: &Query,
        state: &mut RunState,
        outcome: &mut QueryOutcome,
    ) -> Result<QueryEnd> {
        let resume_token = state
            .checkpoint
            .state()
            .resume_token(&query.id)
            .map(str::to_string);
        let mut total_written = state.checkpoint.state().records_so_far(&query.id);
        if let Some(token) = &resume_token {
            info!(query_id = %query.id, token = %token, "Resuming query");
        }

        let pages = self.fetcher.fetch(query, resume_token.as_deref());
        futures::pin_mut!(pages);

        loop {
            // Only between pages: a request in flight is allowed to finish.
            if self.cancel.is_cancelled() {
                return Ok(QueryEnd::Cancelled);
            }
            let Some(page) = pages.next().await else {
                // Nothing left to request, e.g. resumed at the ceiling.
                state.checkpoint.record_complete(&query.id, total_written)?;
                return Ok(QueryEnd::Exhausted);
            };
            let page = page?;

            outcome.total_hint = page.total_hint;
            outcome.fetched += page.records.len() as u64;

            let mut fresh = Vec::with_capacity(page.records.len());
            for mut record in page.records {
                if let Err(rejection) = state.filter.check(&record) {
                    outcome.filtered.record(rejection);
                    continue;
                }
                if !state.dedup.is_new(&record.id) {
                    outcome.duplicates += 1;
                    continue;
                }
                record.query_id.clone_from(&query.id);
                fresh.push(record);
            }

            let written = state.output.write(&fresh)? as u64;
            outcome.written += written;
            total_written += written;

            match page.next_token {
                Some(token) => {
                    state
                        .checkpoint
                        .record_progress(&query.id, &token, total_written)?;
                }
                None => {
                    state.checkpoint.record_complete(&query.id, total_written)?;
                    return Ok(QueryEnd::Exhausted);
                }
            }
        }
    }
}
