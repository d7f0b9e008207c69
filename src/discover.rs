//! Folder walk and per-service layer enumeration.
//!
//! Discovery is restartable: the catalog is appended one entry at a time and
//! a service is only recorded as enumerated once every leaf layer in it has
//! an entry. A rerun skips enumerated services and known layers, so it only
//! repeats the remote calls for whatever was in flight when it stopped.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::client::CatalogClient;
use crate::config::ResolvedConfig;
use crate::domain::{CatalogEntry, LayerKey, LayerTree, RecordCount};
use crate::error::HarvestError;
use crate::store::{CatalogWriter, Store};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryOutcome {
    pub folders_visited: usize,
    pub services_seen: usize,
    pub services_enumerated: usize,
    pub new_entries: usize,
    pub total_entries: usize,
}

/// Services reachable from the root folder, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderWalk {
    pub folders_visited: usize,
    pub services: Vec<String>,
}

pub fn discover<C>(
    client: &C,
    store: &Store,
    config: &ResolvedConfig,
    sink: &dyn ProgressSink,
) -> Result<DiscoveryOutcome, HarvestError>
where
    C: CatalogClient + ?Sized,
{
    let mut marked = store.read_enumerated_services()?;
    if !marked.is_empty() {
        info!(count = marked.len(), path = %store.services_path(), "found enumerated services");
    }

    let walk = walk_folders(client, config, sink)?;
    let mut writer = store.open_catalog_writer()?;
    let before = writer.catalog().len();
    let mut enumerated = 0usize;

    for service in &walk.services {
        if marked.iter().any(|done| done == service) {
            continue;
        }
        if config.is_service_denied(service) {
            continue;
        }
        let added = enumerate_service(client, config, &mut writer, service, sink)?;
        info!(service = %service, added, "service enumerated");
        marked.push(service.clone());
        store.write_enumerated_services(&marked)?;
        enumerated += 1;
    }

    let total_entries = writer.catalog().len();
    info!(layer_count = total_entries, "discovery finished");
    Ok(DiscoveryOutcome {
        folders_visited: walk.folders_visited,
        services_seen: walk.services.len(),
        services_enumerated: enumerated,
        new_entries: total_entries - before,
        total_entries,
    })
}

/// Drains a frontier of unvisited folders pass by pass until no pass adds a new one.
pub fn walk_folders<C>(
    client: &C,
    config: &ResolvedConfig,
    sink: &dyn ProgressSink,
) -> Result<FolderWalk, HarvestError>
where
    C: CatalogClient + ?Sized,
{
    let mut seen_folders: HashSet<String> = HashSet::from([String::new()]);
    let mut frontier = vec![String::new()];
    let mut seen_services = HashSet::new();
    let mut walk = FolderWalk::default();

    while !frontier.is_empty() {
        let pass = std::mem::take(&mut frontier);
        for folder in pass {
            sink.event(ProgressEvent {
                message: format!("phase=Discover; querying folder '{folder}'"),
                elapsed: None,
            });
            let info = client.folder_info(&folder)?;
            walk.folders_visited += 1;
            if let Some(error) = info.error {
                warn!(folder = %folder, message = %error.message, "folder listing returned an error");
                continue;
            }

            for child in info.folders {
                let path = format!("{folder}/{child}");
                let path = path.trim_start_matches('/').to_string();
                if config.folder_blacklist.contains(&path) {
                    debug!(folder = %path, "folder denied");
                    continue;
                }
                if seen_folders.insert(path.clone()) {
                    frontier.push(path);
                }
            }

            for service in info.services {
                if !config
                    .interested_service_types
                    .contains(&service.service_type)
                {
                    continue;
                }
                let path = service.path();
                if config.is_service_denied(&path) {
                    debug!(service = %path, "service denied");
                    continue;
                }
                if seen_services.insert(path.clone()) {
                    walk.services.push(path);
                }
            }
        }
    }

    Ok(walk)
}

fn enumerate_service<C>(
    client: &C,
    config: &ResolvedConfig,
    writer: &mut CatalogWriter,
    service: &str,
    sink: &dyn ProgressSink,
) -> Result<usize, HarvestError>
where
    C: CatalogClient + ?Sized,
{
    sink.event(ProgressEvent {
        message: format!("phase=Enumerate; service {service}"),
        elapsed: None,
    });
    let deny = config.service_deny(service);
    let tree = LayerTree::new(service, client.service_layers(service)?);
    let mut added = 0usize;

    for leaf in tree.leaves() {
        let path = tree.path(leaf.id)?;
        if deny.denies(&format!("{path}_{}", leaf.id)) {
            continue;
        }
        let full_name = format!("{service}/{path}");
        if writer.contains(&LayerKey::new(&full_name, leaf.id)) {
            continue;
        }

        info!(layer = %full_name, id = leaf.id, "getting record count");
        let metadata = client.layer_metadata(service, leaf.id, &config.base_params)?;
        let record_count = client.record_count(service, leaf.id, &config.base_params)?;
        if record_count == RecordCount::Unknown {
            info!(layer = %full_name, id = leaf.id, "record count not supported");
        }

        let appended = writer.append(CatalogEntry {
            full_name,
            layer_id: leaf.id,
            service: service.to_string(),
            record_count,
            field_names: metadata.field_names,
        })?;
        if appended {
            added += 1;
        }
    }

    Ok(added)
}
