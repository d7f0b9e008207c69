//! Best-guess equivalence between catalog layers that were never downloaded
//! and layers that were.
//!
//! Many catalogs publish the same layer under several services. A missing
//! layer is taken to be a copy of a finished one when the finished layer's
//! name, cut at any `/`, is a suffix of the missing layer's name and both
//! report the same record count. The longest suffix wins.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{CatalogEntry, LayerKey, LayerStatus, ServiceDeny};
use crate::error::HarvestError;
use crate::store::{Catalog, Store};

/// Missing layer (lowercase full name) to the finished layer judged equivalent.
pub type MatchReport = BTreeMap<String, LayerKey>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub catalog_entries: usize,
    pub done_layers: usize,
    pub missing: usize,
    pub matched: usize,
    pub need_to_check: usize,
}

const STATUS_NAME_PATTERN: &str = r"^(.*)_([0-9]+)\.geojsonl\.status$";

/// Statuses that count as finished for matching.
pub fn accepted_statuses(archive_configured: bool) -> Vec<LayerStatus> {
    if archive_configured {
        vec![LayerStatus::Done]
    } else {
        vec![
            LayerStatus::Downloaded,
            LayerStatus::Compressed,
            LayerStatus::Done,
        ]
    }
}

/// Finished layers found below the data root, sorted.
pub fn done_layers(store: &Store, accepted: &[LayerStatus]) -> Result<Vec<LayerKey>, HarvestError> {
    let pattern =
        Regex::new(STATUS_NAME_PATTERN).map_err(|err| HarvestError::StatusFileName(err.to_string()))?;
    let mut done = BTreeSet::new();
    for path in store.status_files()? {
        let Some(status) = Store::read_status(&path)? else {
            continue;
        };
        if status == LayerStatus::Wip || status.is_skipped_layer() {
            continue;
        }
        if !accepted.contains(&status) {
            warn!(path = %path, status = %status, "layer not finished, leaving it out");
            continue;
        }
        let relative = path
            .strip_prefix(store.data_root())
            .map_err(|_| HarvestError::StatusFileName(path.to_string()))?;
        done.insert(parse_status_name(&pattern, relative.as_str())?);
    }
    Ok(done.into_iter().collect())
}

fn parse_status_name(pattern: &Regex, relative: &str) -> Result<LayerKey, HarvestError> {
    let captures = pattern
        .captures(relative)
        .ok_or_else(|| HarvestError::StatusFileName(relative.to_string()))?;
    let id = captures[2]
        .parse::<i64>()
        .map_err(|_| HarvestError::StatusFileName(relative.to_string()))?;
    Ok(LayerKey::new(&captures[1], id))
}

/// Every `/`-aligned suffix of `name`, longest first.
pub fn suffixes(name: &str) -> Vec<String> {
    let parts: Vec<&str> = name.split('/').collect();
    (0..parts.len()).map(|i| parts[i..].join("/")).collect()
}

/// Catalog entries neither finished nor excluded by the ignore rules.
pub fn missing_layers(
    catalog: &Catalog,
    done: &BTreeSet<LayerKey>,
    ignore: &BTreeMap<String, ServiceDeny>,
) -> Vec<CatalogEntry> {
    catalog
        .entries()
        .iter()
        .filter(|entry| !done.contains(&entry.key()))
        .filter(|entry| match ignore.get(&entry.service) {
            None => true,
            Some(deny) => {
                let path = entry.layer_path();
                !(deny.denies(path) || deny.denies(&format!("{path}_{}", entry.layer_id)))
            }
        })
        .cloned()
        .collect()
}

pub fn match_layers(
    catalog: &Catalog,
    done: &[LayerKey],
    ignore: &BTreeMap<String, ServiceDeny>,
    known: &BTreeMap<String, Vec<String>>,
) -> Result<(MatchReport, Vec<CatalogEntry>), HarvestError> {
    let done_set: BTreeSet<LayerKey> = done.iter().cloned().collect();
    let missing = missing_layers(catalog, &done_set, ignore);
    let mut best: BTreeMap<String, (LayerKey, usize)> = BTreeMap::new();

    for layer in &done_set {
        let done_count = catalog
            .get(layer)
            .ok_or_else(|| HarvestError::MissingCatalogEntry {
                name: layer.name().to_string(),
                id: layer.id(),
            })?
            .record_count;
        debug!(layer = %layer, count = %done_count, "matching done layer");

        for suffix in suffixes(layer.name()) {
            for entry in &missing {
                let name = entry.full_name.to_lowercase();
                if !name.ends_with(&suffix) {
                    continue;
                }
                if entry.record_count != done_count {
                    debug!(
                        done = %layer,
                        done_count = %done_count,
                        missing = %name,
                        missing_count = %entry.record_count,
                        "record counts differ"
                    );
                    continue;
                }
                let longer = best
                    .get(&name)
                    .is_none_or(|(_, len)| suffix.len() > *len);
                if longer {
                    best.insert(name, (layer.clone(), suffix.len()));
                }
            }
        }
    }

    let matches: MatchReport = best
        .into_iter()
        .map(|(name, (layer, _))| (name, layer))
        .collect();
    let residual = missing
        .into_iter()
        .filter(|entry| !matches.contains_key(&entry.full_name.to_lowercase()))
        .filter(|entry| !known.contains_key(&entry.full_name))
        .collect();
    Ok((matches, residual))
}

/// Recomputes both reports from the catalog and the data root and writes them.
pub fn check(
    store: &Store,
    ignore: &BTreeMap<String, ServiceDeny>,
    known: &BTreeMap<String, Vec<String>>,
    accepted: &[LayerStatus],
    sink: &dyn ProgressSink,
) -> Result<CheckOutcome, HarvestError> {
    sink.event(ProgressEvent {
        message: "phase=Check; reading layer catalog".to_string(),
        elapsed: None,
    });
    let catalog = store.read_catalog()?;

    sink.event(ProgressEvent {
        message: "phase=Check; collecting finished layers".to_string(),
        elapsed: None,
    });
    let done = done_layers(store, accepted)?;
    let done_set: BTreeSet<LayerKey> = done.iter().cloned().collect();
    let missing = missing_layers(&catalog, &done_set, ignore).len();

    sink.event(ProgressEvent {
        message: format!("phase=Check; matching {} finished layers", done.len()),
        elapsed: None,
    });
    let (matches, residual) = match_layers(&catalog, &done, ignore, known)?;

    Store::write_report(&store.matches_path(), &matches)?;
    info!(count = matches.len(), path = %store.matches_path(), "wrote matches");
    Store::write_report(&store.need_to_check_path(), &residual)?;
    info!(count = residual.len(), path = %store.need_to_check_path(), "wrote unmatched layers");

    Ok(CheckOutcome {
        catalog_entries: catalog.len(),
        done_layers: done.len(),
        missing,
        matched: matches.len(),
        need_to_check: residual.len(),
    })
}
