use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::archive::{ArchiveTransfer, NoPostProcess, PostProcess};
use crate::client::CatalogClient;
use crate::config::ResolvedConfig;
use crate::discover::{self, DiscoveryOutcome};
use crate::download::{self, ScrapeOutcome, ServiceOutcome};
use crate::error::HarvestError;
use crate::matcher::{self, CheckOutcome};
use crate::retry::run_with_retry;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default)]
pub struct ScrapeOptions {
    /// Run a single pass instead of retrying until every layer is finished.
    pub once: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExploreResult {
    pub started_at: String,
    pub finished_at: String,
    #[serde(flatten)]
    pub outcome: DiscoveryOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeResult {
    pub started_at: String,
    pub finished_at: String,
    pub attempts: u32,
    pub services: Vec<ServiceOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub started_at: String,
    pub finished_at: String,
    pub matches_path: String,
    pub need_to_check_path: String,
    #[serde(flatten)]
    pub outcome: CheckOutcome,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

/// Run-scoped progress reporting handed to every component.
pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<C: CatalogClient> {
    store: Store,
    config: ResolvedConfig,
    client: C,
}

impl<C: CatalogClient> App<C> {
    pub fn new(config: ResolvedConfig, client: C) -> Self {
        let store = Store::new(config.data_root.clone(), config.analysis_root.clone());
        Self {
            store,
            config,
            client,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn explore(&self, sink: &dyn ProgressSink) -> Result<ExploreResult, HarvestError> {
        let started_at = iso_timestamp();
        let start = Instant::now();
        let outcome = discover::discover(&self.client, &self.store, &self.config, sink)?;
        sink.event(ProgressEvent {
            message: format!("phase=Done; {} layers in catalog", outcome.total_entries),
            elapsed: Some(start.elapsed()),
        });
        Ok(ExploreResult {
            started_at,
            finished_at: iso_timestamp(),
            outcome,
        })
    }

    /// Archive upload when configured, otherwise downloads are final.
    pub fn post_processor(&self) -> Box<dyn PostProcess> {
        match &self.config.archive {
            Some(settings) => Box::new(ArchiveTransfer::new(&self.config.data_root, settings)),
            None => Box::new(NoPostProcess),
        }
    }

    pub fn scrape(
        &self,
        options: ScrapeOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ScrapeResult, HarvestError> {
        let post = self.post_processor();
        self.scrape_with(post.as_ref(), options, sink)
    }

    pub fn scrape_with(
        &self,
        post: &dyn PostProcess,
        options: ScrapeOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ScrapeResult, HarvestError> {
        let started_at = iso_timestamp();
        let start = Instant::now();

        let (attempts, outcome) = if options.once {
            let outcome = download::scrape(&self.client, &self.store, &self.config, post, sink)?;
            (1, outcome)
        } else {
            let mut last = ScrapeOutcome::default();
            let attempts = run_with_retry(self.config.retry, |attempt| {
                sink.event(ProgressEvent {
                    message: format!("phase=Scrape; attempt {attempt}"),
                    elapsed: Some(start.elapsed()),
                });
                last = download::scrape(&self.client, &self.store, &self.config, post, sink)?;
                Ok(true)
            });
            (attempts, last)
        };

        info!(attempts, services = outcome.services.len(), "scrape finished");
        sink.event(ProgressEvent {
            message: format!("phase=Done; {} services handled", outcome.services.len()),
            elapsed: Some(start.elapsed()),
        });
        Ok(ScrapeResult {
            started_at,
            finished_at: iso_timestamp(),
            attempts,
            services: outcome.services,
        })
    }

    pub fn check(&self, sink: &dyn ProgressSink) -> Result<CheckResult, HarvestError> {
        let started_at = iso_timestamp();
        let accepted = matcher::accepted_statuses(self.config.archive.is_some());
        let outcome = matcher::check(
            &self.store,
            &self.config.match_ignore,
            &self.config.known_matches,
            &accepted,
            sink,
        )?;
        Ok(CheckResult {
            started_at,
            finished_at: iso_timestamp(),
            matches_path: self.store.matches_path().to_string(),
            need_to_check_path: self.store.need_to_check_path().to_string(),
            outcome,
        })
    }
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
