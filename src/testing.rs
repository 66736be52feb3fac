//! In-memory search API for unit tests.

use crate::error::{HarvestError, Result};
use crate::record::{Page, Record};
use crate::scopus::{SearchApi, SearchRequest};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Serves fixed record ids per query id, paginated by offset, with injectable failures.
#[derive(Default)]
pub(crate) struct FakeApi {
    results: HashMap<String, Vec<String>>,
    failures: Mutex<HashMap<(String, u64), VecDeque<HarvestError>>>,
    calls: Mutex<Vec<(String, u64)>>,
    latency: Option<Duration>,
}

impl FakeApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_results(mut self, query_id: &str, ids: &[&str]) -> Self {
        self.results.insert(
            query_id.to_string(),
            ids.iter().map(|id| id.to_string()).collect(),
        );
        self
    }

    /// Make every request take `latency`.
    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next requests for `(query_id, start)` with `errors`, in order.
    pub(crate) fn fail(&self, query_id: &str, start: u64, errors: Vec<HarvestError>) {
        let mut failures = self.failures.lock().expect("failures lock");
        failures
            .entry((query_id.to_string(), start))
            .or_default()
            .extend(errors);
    }

    pub(crate) fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn calls_for(&self, query_id: &str) -> usize {
        self.calls().iter().filter(|(q, _)| q == query_id).count()
    }
}

#[async_trait]
impl SearchApi for FakeApi {
    async fn search(&self, request: SearchRequest<'_>) -> Result<Page> {
        let key = (request.query.id.clone(), request.start);
        self.calls.lock().expect("calls lock").push(key.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = self
            .failures
            .lock()
            .expect("failures lock")
            .get_mut(&key)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }

        let ids = self
            .results
            .get(&request.query.id)
            .cloned()
            .unwrap_or_default();
        let start = (request.start as usize).min(ids.len());
        let end = (start + request.count as usize).min(ids.len());

        let records = ids[start..end]
            .iter()
            .map(|id| Record {
                id: id.clone(),
                title: format!("Paper {}", id),
                query_id: request.query.id.clone(),
                ..Default::default()
            })
            .collect();

        Ok(Page {
            records,
            next_token: (end < ids.len()).then(|| end.to_string()),
            total_hint: ids.len() as u64,
        })
    }
}
