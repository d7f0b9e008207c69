use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{CheckResult, ExploreResult, ProgressEvent, ProgressSink, ScrapeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_explore(result: &ExploreResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_scrape(result: &ScrapeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_check(result: &CheckResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// JSON mode keeps stdout for the result document only.
impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(secs = elapsed.as_secs_f64(), "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}

pub fn print_explore_summary(result: &ExploreResult) {
    let outcome = &result.outcome;
    println!("explore summary");
    println!("  folders visited:     {}", outcome.folders_visited);
    println!("  services seen:       {}", outcome.services_seen);
    println!("  services enumerated: {}", outcome.services_enumerated);
    println!(
        "  catalog entries:     {} ({} new)",
        outcome.total_entries, outcome.new_entries
    );
}

pub fn print_scrape_summary(result: &ScrapeResult) {
    println!("scrape summary ({} attempts)", result.attempts);
    for service in &result.services {
        println!(
            "  {}: {} downloaded ({} records), {} already complete, {} filtered, {} not layers, {} ignored",
            service.service,
            service.downloaded,
            service.records,
            service.already_complete,
            service.filtered,
            service.not_layer,
            service.ignored,
        );
    }
}

pub fn print_check_summary(result: &CheckResult) {
    let outcome = &result.outcome;
    println!("check summary");
    println!("  catalog entries: {}", outcome.catalog_entries);
    println!("  finished layers: {}", outcome.done_layers);
    println!("  missing layers:  {}", outcome.missing);
    println!("  matched:         {} -> {}", outcome.matched, result.matches_path);
    println!(
        "  need to check:   {} -> {}",
        outcome.need_to_check, result.need_to_check_path
    );
}
