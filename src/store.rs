use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::Builder;

use crate::domain::{CatalogEntry, Cursor, LayerInfo, LayerKey, LayerStatus};
use crate::error::HarvestError;

pub const CATALOG_FILE: &str = "all_layer_list.jsonl";
pub const SERVICES_FILE: &str = "full_services_list.txt";
pub const MATCHES_FILE: &str = "matches.json";
pub const NEED_TO_CHECK_FILE: &str = "need_to_check.json";
pub const LAYERS_LIST_FILE: &str = "layers_list.json";
pub const ARTIFACT_EXT: &str = "geojsonl";
pub const STATUS_SUFFIX: &str = ".geojsonl.status";

/// Resume point of an unfinished layer download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub cursor: Cursor,
    pub artifact_len: Option<u64>,
}

/// On-disk layout: layer artifacts under `data_root`, catalog and reports under `analysis_root`.
#[derive(Debug, Clone)]
pub struct Store {
    data_root: Utf8PathBuf,
    analysis_root: Utf8PathBuf,
}

impl Store {
    pub fn new(data_root: Utf8PathBuf, analysis_root: Utf8PathBuf) -> Self {
        Self {
            data_root,
            analysis_root,
        }
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn analysis_root(&self) -> &Utf8Path {
        &self.analysis_root
    }

    pub fn catalog_path(&self) -> Utf8PathBuf {
        self.analysis_root.join(CATALOG_FILE)
    }

    pub fn services_path(&self) -> Utf8PathBuf {
        self.analysis_root.join(SERVICES_FILE)
    }

    pub fn matches_path(&self) -> Utf8PathBuf {
        self.analysis_root.join(MATCHES_FILE)
    }

    pub fn need_to_check_path(&self) -> Utf8PathBuf {
        self.analysis_root.join(NEED_TO_CHECK_FILE)
    }

    pub fn service_dir(&self, service: &str) -> Utf8PathBuf {
        self.data_root.join(service)
    }

    pub fn layers_list_path(&self, service: &str) -> Utf8PathBuf {
        self.service_dir(service).join(LAYERS_LIST_FILE)
    }

    /// `<data>/<service>/<path>_<id>.geojsonl`
    pub fn artifact_path(&self, service: &str, qualified_path: &str) -> Utf8PathBuf {
        self.service_dir(service)
            .join(format!("{qualified_path}.{ARTIFACT_EXT}"))
    }

    pub fn status_path(artifact: &Utf8Path) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{artifact}.status"))
    }

    pub fn cursor_path(artifact: &Utf8Path) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{artifact}.state"))
    }

    pub fn read_catalog(&self) -> Result<Catalog, HarvestError> {
        Catalog::load(&self.catalog_path())
    }

    pub fn open_catalog_writer(&self) -> Result<CatalogWriter, HarvestError> {
        let catalog = self.read_catalog()?;
        let path = self.catalog_path();
        ensure_parent(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(|err| fs_error(&path, err))?;
        Ok(CatalogWriter { file, catalog })
    }

    /// Services already fully enumerated, in file order.
    pub fn read_enumerated_services(&self) -> Result<Vec<String>, HarvestError> {
        let path = self.services_path();
        if !path.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| fs_error(&path, err))?;
        let mut seen = HashSet::new();
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| seen.insert(line.to_string()))
            .map(str::to_string)
            .collect())
    }

    pub fn write_enumerated_services(&self, services: &[String]) -> Result<(), HarvestError> {
        let mut content = String::new();
        for service in services {
            content.push_str(service);
            content.push('\n');
        }
        Self::write_bytes_atomic(&self.services_path(), content.as_bytes())
    }

    pub fn read_layer_list(&self, service: &str) -> Result<Option<Vec<LayerInfo>>, HarvestError> {
        let path = self.layers_list_path(service);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| fs_error(&path, err))?;
        let layers = serde_json::from_str(&content)
            .map_err(|err| HarvestError::Json(format!("{path}: {err}")))?;
        Ok(Some(layers))
    }

    pub fn write_layer_list(&self, service: &str, layers: &[LayerInfo]) -> Result<(), HarvestError> {
        let content =
            serde_json::to_vec(layers).map_err(|err| HarvestError::Json(err.to_string()))?;
        Self::write_bytes_atomic(&self.layers_list_path(service), &content)
    }

    pub fn read_status(path: &Utf8Path) -> Result<Option<LayerStatus>, HarvestError> {
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let token = fs::read_to_string(path.as_std_path()).map_err(|err| fs_error(path, err))?;
        LayerStatus::from_token(&token)
            .map(Some)
            .ok_or_else(|| HarvestError::InvalidStatus {
                token: token.trim().to_string(),
                path: path.to_string(),
            })
    }

    /// Replaces the status token; refuses to move a layer backwards in its lifecycle.
    pub fn write_status(path: &Utf8Path, status: LayerStatus) -> Result<(), HarvestError> {
        if let Some(current) = Self::read_status(path)? {
            if !current.can_advance_to(status) {
                return Err(HarvestError::StatusRegression {
                    path: path.to_string(),
                    from: current.to_string(),
                    to: status.to_string(),
                });
            }
        }
        Self::write_bytes_atomic(path, status.as_str().as_bytes())
    }

    pub fn read_cursor(path: &Utf8Path) -> Result<Option<Cursor>, HarvestError> {
        Ok(Self::read_checkpoint(path)?.map(|checkpoint| checkpoint.cursor))
    }

    pub fn write_cursor(path: &Utf8Path, cursor: &Cursor) -> Result<(), HarvestError> {
        Self::write_bytes_atomic(path, cursor.as_str().as_bytes())
    }

    /// The `.state` file: the cursor on the first line, optionally followed by
    /// the artifact length in bytes at the time the cursor was taken.
    pub fn read_checkpoint(path: &Utf8Path) -> Result<Option<Checkpoint>, HarvestError> {
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path.as_std_path()).map_err(|err| fs_error(path, err))?;
        let mut lines = text.lines();
        let cursor = Cursor::decode(lines.next().unwrap_or_default())?;
        let artifact_len = match lines.next().map(str::trim) {
            None | Some("") => None,
            Some(len) => Some(
                len.parse::<u64>()
                    .map_err(|_| HarvestError::InvalidCursor(text.trim().to_string()))?,
            ),
        };
        Ok(Some(Checkpoint {
            cursor,
            artifact_len,
        }))
    }

    pub fn write_checkpoint(path: &Utf8Path, checkpoint: &Checkpoint) -> Result<(), HarvestError> {
        let mut content = checkpoint.cursor.as_str().to_string();
        if let Some(len) = checkpoint.artifact_len {
            content.push_str(&format!("\n{len}"));
        }
        Self::write_bytes_atomic(path, content.as_bytes())
    }

    pub fn clear_cursor(path: &Utf8Path) -> Result<(), HarvestError> {
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path()).map_err(|err| fs_error(path, err))?;
        }
        Ok(())
    }

    /// Every `*.geojsonl.status` below the data root, sorted.
    pub fn status_files(&self) -> Result<Vec<Utf8PathBuf>, HarvestError> {
        if !self.data_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut files = walk_dir(self.data_root.as_std_path())?
            .into_iter()
            .filter(|path| path.is_file())
            .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
            .filter(|path| path.as_str().ends_with(STATUS_SUFFIX))
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }

    pub fn write_report<T: Serialize>(path: &Utf8Path, report: &T) -> Result<(), HarvestError> {
        let content = serde_json::to_vec_pretty(report)
            .map_err(|err| HarvestError::Json(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
        let parent = ensure_parent(path)?;
        let mut temp = Builder::new()
            .prefix(".esri-harvest")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| fs_error(path, err))?;
        temp.write_all(content).map_err(|err| fs_error(path, err))?;
        temp.persist(path.as_std_path())
            .map_err(|err| fs_error(path, err.error))?;
        Ok(())
    }
}

/// In-memory view of the persisted layer catalog.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    index: HashMap<LayerKey, usize>,
}

impl Catalog {
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        let mut catalog = Catalog::default();
        for entry in entries {
            catalog.insert(entry);
        }
        catalog
    }

    pub fn load(path: &Utf8Path) -> Result<Self, HarvestError> {
        if !path.as_std_path().exists() {
            return Ok(Catalog::default());
        }
        let file = File::open(path.as_std_path()).map_err(|err| fs_error(path, err))?;
        let mut catalog = Catalog::default();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| fs_error(path, err))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: CatalogEntry = serde_json::from_str(&line)
                .map_err(|err| HarvestError::Json(format!("{path}:{}: {err}", number + 1)))?;
            catalog.insert(entry);
        }
        Ok(catalog)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &LayerKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &LayerKey) -> Option<&CatalogEntry> {
        self.index.get(key).map(|idx| &self.entries[*idx])
    }

    fn insert(&mut self, entry: CatalogEntry) {
        let key = entry.key();
        if self.index.contains_key(&key) {
            return;
        }
        self.index.insert(key, self.entries.len());
        self.entries.push(entry);
    }
}

/// Appends catalog entries one line at a time, flushing after each.
pub struct CatalogWriter {
    file: File,
    catalog: Catalog,
}

impl CatalogWriter {
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn contains(&self, key: &LayerKey) -> bool {
        self.catalog.contains(key)
    }

    /// Returns `false` when the key is already recorded.
    pub fn append(&mut self, entry: CatalogEntry) -> Result<bool, HarvestError> {
        if self.catalog.contains(&entry.key()) {
            return Ok(false);
        }
        let mut line =
            serde_json::to_string(&entry).map_err(|err| HarvestError::Json(err.to_string()))?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        self.catalog.insert(entry);
        Ok(true)
    }

    pub fn into_catalog(self) -> Catalog {
        self.catalog
    }
}

pub(crate) fn ensure_parent(path: &Utf8Path) -> Result<Utf8PathBuf, HarvestError> {
    let parent = path
        .parent()
        .map(Utf8Path::to_path_buf)
        .unwrap_or_else(|| Utf8PathBuf::from("."));
    let parent = if parent.as_str().is_empty() {
        Utf8PathBuf::from(".")
    } else {
        parent
    };
    fs::create_dir_all(parent.as_std_path()).map_err(|err| fs_error(&parent, err))?;
    Ok(parent)
}

pub(crate) fn fs_error(path: &Utf8Path, err: std::io::Error) -> HarvestError {
    HarvestError::Filesystem(format!("{path}: {err}"))
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, HarvestError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            if file_type.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::RecordCount;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Store::new(root.join("data"), root.join("analysis"));
        (temp, store)
    }

    #[test]
    fn layout_paths() {
        let store = Store::new("data".into(), "analysis".into());
        let artifact = store.artifact_path("A/B/MapServer", "Group/Roads_4");
        assert_eq!(artifact, "data/A/B/MapServer/Group/Roads_4.geojsonl");
        assert_eq!(
            Store::status_path(&artifact),
            "data/A/B/MapServer/Group/Roads_4.geojsonl.status"
        );
        assert_eq!(
            Store::cursor_path(&artifact),
            "data/A/B/MapServer/Group/Roads_4.geojsonl.state"
        );
        assert!(store.catalog_path().ends_with("all_layer_list.jsonl"));
    }

    #[test]
    fn status_refuses_regression() {
        let (_temp, store) = temp_store();
        let status = Store::status_path(&store.artifact_path("S/MapServer", "L_1"));
        Store::write_status(&status, LayerStatus::Wip).unwrap();
        Store::write_status(&status, LayerStatus::Downloaded).unwrap();
        Store::write_status(&status, LayerStatus::Done).unwrap();
        assert_matches!(
            Store::write_status(&status, LayerStatus::Wip),
            Err(HarvestError::StatusRegression { .. })
        );
        assert_eq!(Store::read_status(&status).unwrap(), Some(LayerStatus::Done));
    }

    #[test]
    fn unknown_status_token_is_an_error() {
        let (_temp, store) = temp_store();
        let status = Store::status_path(&store.artifact_path("S/MapServer", "L_1"));
        Store::write_bytes_atomic(&status, b"halfway").unwrap();
        assert_matches!(
            Store::read_status(&status),
            Err(HarvestError::InvalidStatus { .. })
        );
    }

    #[test]
    fn catalog_writer_skips_known_keys() {
        let (_temp, store) = temp_store();
        let entry = CatalogEntry {
            full_name: "S/MapServer/Roads".to_string(),
            layer_id: 1,
            service: "S/MapServer".to_string(),
            record_count: RecordCount::Known(3),
            field_names: vec!["OBJECTID".to_string()],
        };
        let mut writer = store.open_catalog_writer().unwrap();
        assert!(writer.append(entry.clone()).unwrap());
        let mut shouty = entry.clone();
        shouty.full_name = "S/MapServer/ROADS".to_string();
        assert!(!writer.append(shouty).unwrap());
        drop(writer);

        let catalog = store.read_catalog().unwrap();
        assert_eq!(catalog.entries(), &[entry]);
    }
}
