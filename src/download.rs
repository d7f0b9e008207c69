//! Per-layer download lifecycle.
//!
//! Each layer owns three files next to each other below the data root:
//! `<name>.geojsonl` (records, one JSON object per line), `<name>.geojsonl.status`
//! (a single lifecycle token) and `<name>.geojsonl.state` (the resume cursor,
//! only present while a download is unfinished).

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::time::Instant;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::archive::PostProcess;
use crate::client::{CatalogClient, RecordStream};
use crate::config::{ResolvedConfig, ServiceRequest};
use crate::domain::{Cursor, LayerInfo, LayerStatus, LayerTree, QueryParams, ServiceDeny};
use crate::error::HarvestError;
use crate::store::{Checkpoint, Store, ensure_parent, fs_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum LayerOutcome {
    Filtered,
    AlreadyComplete,
    NotLayer,
    Ignored,
    Downloaded { records: u64, resumed: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceOutcome {
    pub service: String,
    pub layers: usize,
    pub downloaded: usize,
    pub records: u64,
    pub already_complete: usize,
    pub filtered: usize,
    pub not_layer: usize,
    pub ignored: usize,
}

impl ServiceOutcome {
    fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            ..Self::default()
        }
    }

    fn tally(&mut self, outcome: LayerOutcome) {
        self.layers += 1;
        match outcome {
            LayerOutcome::Filtered => self.filtered += 1,
            LayerOutcome::AlreadyComplete => self.already_complete += 1,
            LayerOutcome::NotLayer => self.not_layer += 1,
            LayerOutcome::Ignored => self.ignored += 1,
            LayerOutcome::Downloaded { records, .. } => {
                self.downloaded += 1;
                self.records += records;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScrapeOutcome {
    pub services: Vec<ServiceOutcome>,
}

/// Downloads every layer of one service.
pub struct ServiceScraper<'a, C: ?Sized, P: ?Sized> {
    pub client: &'a C,
    pub store: &'a Store,
    pub service: &'a str,
    pub params: QueryParams,
    pub layer_params: &'a BTreeMap<String, QueryParams>,
    pub whitelist: &'a BTreeSet<String>,
    pub deny: ServiceDeny,
    pub ignore_layer_types: &'a BTreeSet<String>,
    pub post_process: &'a P,
    pub sink: &'a dyn ProgressSink,
}

impl<'a, C, P> ServiceScraper<'a, C, P>
where
    C: CatalogClient + ?Sized,
    P: PostProcess + ?Sized,
{
    pub fn run(&self) -> Result<ServiceOutcome, HarvestError> {
        info!(service = self.service, "handling service");
        let tree = LayerTree::new(self.service, self.layer_list()?);
        let mut outcome = ServiceOutcome::new(self.service);
        for layer in tree.layers() {
            outcome.tally(self.download_layer(&tree, layer)?);
        }
        Ok(outcome)
    }

    /// Layer listing, cached in the service directory after the first fetch.
    pub fn layer_list(&self) -> Result<Vec<LayerInfo>, HarvestError> {
        if let Some(layers) = self.store.read_layer_list(self.service)? {
            return Ok(layers);
        }
        let layers = self.client.service_layers(self.service)?;
        self.store.write_layer_list(self.service, &layers)?;
        Ok(layers)
    }

    pub fn download_layer(
        &self,
        tree: &LayerTree,
        layer: &LayerInfo,
    ) -> Result<LayerOutcome, HarvestError> {
        let name = tree.qualified_path(layer.id)?;
        if self.deny.denies(&name) {
            return Ok(LayerOutcome::Filtered);
        }
        if !self.whitelist.is_empty() && !self.whitelist.contains(&name) {
            return Ok(LayerOutcome::Filtered);
        }

        let artifact = self.store.artifact_path(self.service, &name);
        let status = Store::status_path(&artifact);
        ensure_parent(&artifact)?;
        info!(layer = %name, id = layer.id, path = %artifact, "handling layer");

        match Store::read_status(&status)? {
            None => Store::write_status(&status, LayerStatus::Wip)?,
            Some(_) => {
                if self.post_process.post_process(&artifact, &status)? {
                    return Ok(LayerOutcome::AlreadyComplete);
                }
            }
        }

        let mut params = self.params.clone();
        if let Some(overrides) = self.layer_params.get(&name) {
            params.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let metadata = self.client.layer_metadata(self.service, layer.id, &params)?;
        if !metadata.sub_layer_ids.is_empty() {
            Store::write_status(&status, LayerStatus::NotLayer)?;
            return Ok(LayerOutcome::NotLayer);
        }

        let layer_type = layer.layer_type.as_ref().or(metadata.layer_type.as_ref());
        if layer_type.is_some_and(|kind| self.ignore_layer_types.contains(kind)) {
            Store::write_status(&status, LayerStatus::Ignore)?;
            return Ok(LayerOutcome::Ignored);
        }

        self.sink.event(ProgressEvent {
            message: format!("phase=Download; {}/{name}", self.service),
            elapsed: None,
        });
        let start = Instant::now();
        let (records, resumed) = self.fetch_records(layer.id, &params, &artifact)?;
        Store::write_status(&status, LayerStatus::Downloaded)?;
        Store::clear_cursor(&Store::cursor_path(&artifact))?;
        self.sink.event(ProgressEvent {
            message: format!("phase=Download; {}/{name} records={records}", self.service),
            elapsed: Some(start.elapsed()),
        });

        self.post_process.post_process(&artifact, &status)?;
        Ok(LayerOutcome::Downloaded { records, resumed })
    }

    /// Streams records into the artifact. On failure the cursor of the last
    /// flushed record is saved, together with the artifact length it matches,
    /// before the error is returned.
    fn fetch_records(
        &self,
        layer_id: i64,
        params: &QueryParams,
        artifact: &Utf8Path,
    ) -> Result<(u64, bool), HarvestError> {
        let cursor_path = Store::cursor_path(artifact);
        let previous = Store::read_checkpoint(&cursor_path)?;
        let (file, previous) = open_artifact(artifact, previous)?;
        let resumed = previous.is_some();
        if let Some(cursor) = &previous {
            info!(cursor = %cursor, "resuming from saved cursor");
        }

        let mut writer = BufWriter::new(file);
        let mut checkpoint = previous.clone();
        let mut written = 0u64;

        let result = self
            .client
            .records(self.service, layer_id, params, previous)
            .and_then(|mut stream| {
                pump_records(stream.as_mut(), &mut writer, &mut checkpoint, &mut written)
            });

        match result {
            Ok(()) => {
                writer.flush().map_err(|err| fs_error(artifact, err))?;
                Ok((written, resumed))
            }
            Err(err) => {
                if let Err(flush_err) = writer.flush() {
                    error!(error = %flush_err, "could not flush records; cursor not saved");
                    return Err(err);
                }
                match checkpoint {
                    Some(cursor) => {
                        let artifact_len = writer
                            .get_ref()
                            .metadata()
                            .map_err(|err| fs_error(artifact, err))?
                            .len();
                        info!(cursor = %cursor, bytes = artifact_len, "saving cursor");
                        Store::write_checkpoint(
                            &cursor_path,
                            &Checkpoint {
                                cursor,
                                artifact_len: Some(artifact_len),
                            },
                        )?;
                    }
                    None => warn!("no records fetched; nothing to resume from"),
                }
                Err(err)
            }
        }
    }
}

fn pump_records<S: RecordStream + ?Sized>(
    stream: &mut S,
    writer: &mut BufWriter<File>,
    checkpoint: &mut Option<Cursor>,
    written: &mut u64,
) -> Result<(), HarvestError> {
    while let Some(record) = stream.next() {
        let record = record?;
        let mut line =
            serde_json::to_string(&record).map_err(|err| HarvestError::Json(err.to_string()))?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        *written += 1;
        *checkpoint = stream.cursor();
    }
    Ok(())
}

/// Opens the artifact for writing and returns the cursor to resume from.
///
/// Without a checkpoint nothing in an existing artifact can be trusted, so it
/// is truncated. With one, bytes past the checkpointed length were written by a
/// run that stopped before saving a newer cursor and are cut off. An artifact
/// shorter than the checkpoint cannot be resumed and starts over.
fn open_artifact(
    path: &Utf8Path,
    checkpoint: Option<Checkpoint>,
) -> Result<(File, Option<Cursor>), HarvestError> {
    if let Some(Checkpoint {
        cursor,
        artifact_len,
    }) = checkpoint
    {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(|err| fs_error(path, err))?;
        let len = file.metadata().map_err(|err| fs_error(path, err))?.len();
        match artifact_len {
            None => return Ok((file, Some(cursor))),
            Some(saved) if len >= saved => {
                if len > saved {
                    warn!(path = %path, saved, len, "dropping records written after the last cursor");
                    file.set_len(saved).map_err(|err| fs_error(path, err))?;
                }
                return Ok((file, Some(cursor)));
            }
            Some(saved) => {
                warn!(path = %path, saved, len, "artifact shorter than its cursor, starting over");
            }
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path.as_std_path())
        .map_err(|err| fs_error(path, err))?;
    Ok((file, None))
}

/// Downloads every configured service, or every enumerated service when none
/// is configured.
pub fn scrape<C, P>(
    client: &C,
    store: &Store,
    config: &ResolvedConfig,
    post_process: &P,
    sink: &dyn ProgressSink,
) -> Result<ScrapeOutcome, HarvestError>
where
    C: CatalogClient + ?Sized,
    P: PostProcess + ?Sized,
{
    let requests = if config.services.is_empty() {
        store
            .read_enumerated_services()?
            .iter()
            .map(|name| ServiceRequest::unrestricted(name))
            .collect()
    } else {
        config.services.clone()
    };

    let mut outcome = ScrapeOutcome::default();
    for request in &requests {
        if config.is_service_denied(&request.name) {
            info!(service = %request.name, "service denied, skipping");
            continue;
        }
        let mut params = config.base_params.clone();
        params.extend(request.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        let scraper = ServiceScraper {
            client,
            store,
            service: &request.name,
            params,
            layer_params: &request.layer_params,
            whitelist: &request.whitelist,
            deny: config.service_deny(&request.name),
            ignore_layer_types: &config.ignore_layer_types,
            post_process,
            sink,
        };
        outcome.services.push(scraper.run()?);
    }
    Ok(outcome)
}
