//! # scopus-harvester
//!
//! Resumable bibliographic metadata harvesting from the Scopus Search API.
//!
//! ## Modules
//!
//! - [`config`] - Harvest configuration file
//! - [`planner`] - Expands term groups and date slices into concrete queries
//! - [`scopus`] - Scopus Search API client
//! - [`pacing`] - Sliding-window request pacing
//! - [`fetcher`] - Paginated fetching with retries and backoff
//! - [`filter`] - Client-side DOI and methodology filters
//! - [`dedup`] - Run-wide duplicate suppression
//! - [`checkpoint`] - Atomic progress checkpoints
//! - [`output`] - JSON Lines / CSV record output
//! - [`orchestrator`] - Drives a full harvest run
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use scopus_harvester::{HarvestConfig, Harvester, PaginatedFetcher, ScopusClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HarvestConfig::load("harvest.json".as_ref())?;
//!     let client = ScopusClient::from_config(&config, std::env::var("SCOPUS_API_KEY")?)?;
//!     let fetcher = PaginatedFetcher::from_config(client, &config);
//!     let summary = Harvester::new(config, fetcher).run().await?;
//!     println!("Wrote {} records", summary.records_written);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod orchestrator;
pub mod output;
pub mod pacing;
pub mod planner;
pub mod record;
pub mod scopus;

#[cfg(test)]
pub(crate) mod testing;

pub use config::HarvestConfig;
pub use error::{HarvestError, Result};
pub use fetcher::{PaginatedFetcher, RetryPolicy};
pub use orchestrator::{HarvestSummary, Harvester};
pub use record::{Page, Record};
pub use scopus::{ScopusClient, SearchApi};
