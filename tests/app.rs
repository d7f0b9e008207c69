use std::collections::HashMap;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use serde_json::{Value, json};

use esri_harvest::app::{App, ScrapeOptions};
use esri_harvest::client::{
    CatalogClient, FolderInfo, LayerMetadata, RecordStream, ServiceRef, decode_offset,
    encode_offset,
};
use esri_harvest::config::{Config, ConfigLoader, RetryEntry, ServiceEntry};
use esri_harvest::domain::{Cursor, LayerInfo, LayerStatus, QueryParams, RecordCount};
use esri_harvest::error::HarvestError;
use esri_harvest::output::JsonOutput;
use esri_harvest::store::Store;

struct PageStream {
    records: Vec<Value>,
    next: usize,
    fail_at: Option<usize>,
}

impl Iterator for PageStream {
    type Item = Result<Value, HarvestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fail_at.take_if(|at| *at == self.next).is_some() {
            return Some(Err(HarvestError::HttpStatus {
                status: 503,
                message: "busy".to_string(),
            }));
        }
        let record = self.records.get(self.next)?.clone();
        self.next += 1;
        Some(Ok(record))
    }
}

impl RecordStream for PageStream {
    fn cursor(&self) -> Option<Cursor> {
        Some(encode_offset(self.next as u64))
    }
}

#[derive(Default)]
struct MockCatalog {
    records: HashMap<String, Vec<Value>>,
    fail_first_stream_at: Mutex<Option<usize>>,
}

impl CatalogClient for MockCatalog {
    fn folder_info(&self, folder: &str) -> Result<FolderInfo, HarvestError> {
        if !folder.is_empty() {
            return Ok(FolderInfo::default());
        }
        Ok(FolderInfo {
            folders: vec![],
            services: vec![
                ServiceRef {
                    name: "svcA".to_string(),
                    service_type: "MapServer".to_string(),
                },
                ServiceRef {
                    name: "svcB".to_string(),
                    service_type: "MapServer".to_string(),
                },
            ],
            error: None,
        })
    }

    fn service_layers(&self, service: &str) -> Result<Vec<LayerInfo>, HarvestError> {
        let id = if service.starts_with("svcA") { 5 } else { 7 };
        Ok(vec![LayerInfo {
            id,
            name: "Layer1".to_string(),
            parent_layer_id: Some(-1),
            sub_layer_ids: None,
            layer_type: Some("Feature Layer".to_string()),
        }])
    }

    fn layer_metadata(
        &self,
        _service: &str,
        _layer_id: i64,
        _params: &QueryParams,
    ) -> Result<LayerMetadata, HarvestError> {
        Ok(LayerMetadata::default())
    }

    fn record_count(
        &self,
        service: &str,
        _layer_id: i64,
        _params: &QueryParams,
    ) -> Result<RecordCount, HarvestError> {
        let count = self.records.get(service).map(Vec::len).unwrap_or(0);
        Ok(RecordCount::Known(count as u64))
    }

    fn records<'a>(
        &'a self,
        service: &str,
        _layer_id: i64,
        _params: &QueryParams,
        cursor: Option<Cursor>,
    ) -> Result<Box<dyn RecordStream + 'a>, HarvestError> {
        let next = match cursor {
            Some(cursor) => decode_offset(&cursor)? as usize,
            None => 0,
        };
        Ok(Box::new(PageStream {
            records: self.records.get(service).cloned().unwrap_or_default(),
            next,
            fail_at: self.fail_first_stream_at.lock().unwrap().take(),
        }))
    }
}

fn mock() -> MockCatalog {
    let mut mock = MockCatalog::default();
    mock.records.insert(
        "svcA/MapServer".to_string(),
        vec![json!({"id": 1}), json!({"id": 2})],
    );
    mock.records.insert(
        "svcB/MapServer".to_string(),
        vec![json!({"id": 3}), json!({"id": 4})],
    );
    mock
}

fn app(root: &Utf8PathBuf, mock: MockCatalog) -> App<MockCatalog> {
    let mut config = Config {
        base_url: "https://gis.example.org/server/rest/services".to_string(),
        data_folder: Some(root.join("data").to_string()),
        analysis_folder: Some(root.join("analysis").to_string()),
        retry: Some(RetryEntry {
            delay_secs: Some(0),
            max_delay_secs: Some(0),
        }),
        ..Config::default()
    };
    config
        .services
        .insert("svcA/MapServer".to_string(), ServiceEntry::default());
    App::new(ConfigLoader::resolve_config(config).unwrap(), mock)
}

#[test]
fn explore_scrape_check_round() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let app = app(&root, mock());

    let explored = app.explore(&JsonOutput).unwrap();
    assert_eq!(explored.outcome.total_entries, 2);

    let scraped = app
        .scrape(ScrapeOptions { once: true }, &JsonOutput)
        .unwrap();
    assert_eq!(scraped.attempts, 1);
    assert_eq!(scraped.services.len(), 1);
    assert_eq!(scraped.services[0].records, 2);

    let artifact = app.store().artifact_path("svcA/MapServer", "Layer1_5");
    assert_eq!(
        Store::read_status(&Store::status_path(&artifact)).unwrap(),
        Some(LayerStatus::Downloaded)
    );

    let checked = app.check(&JsonOutput).unwrap();
    assert_eq!(checked.outcome.done_layers, 1);
    assert_eq!(checked.outcome.matched, 1);
    assert_eq!(checked.outcome.need_to_check, 0);

    let matches: Value = serde_json::from_str(
        &std::fs::read_to_string(app.store().matches_path().as_std_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(
        matches,
        json!({"svcb/mapserver/layer1": ["svca/mapserver/layer1", 5]})
    );

    let report = serde_json::to_value(&checked).unwrap();
    assert_eq!(report["matched"], 1);
    assert!(report["started_at"].is_string());
}

#[test]
fn scrape_retries_until_finished() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let mock = mock();
    *mock.fail_first_stream_at.lock().unwrap() = Some(1);
    let app = app(&root, mock);

    let scraped = app
        .scrape(ScrapeOptions { once: false }, &JsonOutput)
        .unwrap();
    assert_eq!(scraped.attempts, 2);
    assert_eq!(scraped.services[0].downloaded, 1);
    assert_eq!(scraped.services[0].records, 1);

    let artifact = app.store().artifact_path("svcA/MapServer", "Layer1_5");
    let lines = std::fs::read_to_string(artifact.as_std_path()).unwrap();
    assert_eq!(lines, "{\"id\":1}\n{\"id\":2}\n");
}

#[test]
fn single_pass_surfaces_errors() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let mock = mock();
    *mock.fail_first_stream_at.lock().unwrap() = Some(0);
    let app = app(&root, mock);

    let err = app
        .scrape(ScrapeOptions { once: true }, &JsonOutput)
        .unwrap_err();
    assert!(err.is_remote());
}
