use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use esri_harvest::domain::{CatalogEntry, Cursor, LayerInfo, LayerKey, LayerStatus, RecordCount};
use esri_harvest::error::HarvestError;
use esri_harvest::store::{Catalog, Checkpoint, Store};

fn temp_store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Store::new(root.join("data"), root.join("analysis"));
    (temp, store)
}

fn entry(name: &str, id: i64) -> CatalogEntry {
    CatalogEntry {
        full_name: name.to_string(),
        layer_id: id,
        service: "S/MapServer".to_string(),
        record_count: RecordCount::Known(1),
        field_names: vec![],
    }
}

#[test]
fn catalog_survives_reopen_and_keeps_first_entry() {
    let (_temp, store) = temp_store();
    let mut writer = store.open_catalog_writer().unwrap();
    assert!(writer.append(entry("S/MapServer/Roads", 1)).unwrap());
    assert!(writer.append(entry("S/MapServer/Roads", 2)).unwrap());
    drop(writer);

    let mut writer = store.open_catalog_writer().unwrap();
    assert!(writer.contains(&LayerKey::new("s/mapserver/roads", 1)));
    assert!(!writer.append(entry("S/MapServer/roads", 1)).unwrap());
    let catalog = writer.into_catalog();
    assert_eq!(catalog.len(), 2);
    assert_eq!(
        catalog
            .get(&LayerKey::new("S/MAPSERVER/ROADS", 2))
            .map(|e| e.layer_id),
        Some(2)
    );
}

#[test]
fn missing_catalog_is_empty() {
    let (_temp, store) = temp_store();
    assert!(store.read_catalog().unwrap().is_empty());
    assert!(store.read_enumerated_services().unwrap().is_empty());
    assert!(store.status_files().unwrap().is_empty());
}

#[test]
fn corrupt_catalog_line_is_reported() {
    let (_temp, store) = temp_store();
    std::fs::create_dir_all(store.analysis_root().as_std_path()).unwrap();
    std::fs::write(store.catalog_path().as_std_path(), "{\"name\": 1}\n").unwrap();
    assert_matches!(
        Catalog::load(&store.catalog_path()),
        Err(HarvestError::Json(_))
    );
}

#[test]
fn enumerated_services_are_deduplicated() {
    let (_temp, store) = temp_store();
    store
        .write_enumerated_services(&[
            "A/MapServer".to_string(),
            "B/FeatureServer".to_string(),
            "A/MapServer".to_string(),
        ])
        .unwrap();
    assert_eq!(
        store.read_enumerated_services().unwrap(),
        vec!["A/MapServer", "B/FeatureServer"]
    );
}

#[test]
fn layer_list_is_cached_per_service() {
    let (_temp, store) = temp_store();
    assert_eq!(store.read_layer_list("S/MapServer").unwrap(), None);
    let layers = vec![LayerInfo {
        id: 3,
        name: "Roads".to_string(),
        parent_layer_id: Some(-1),
        sub_layer_ids: None,
        layer_type: Some("Feature Layer".to_string()),
    }];
    store.write_layer_list("S/MapServer", &layers).unwrap();
    assert_eq!(store.read_layer_list("S/MapServer").unwrap(), Some(layers));
    assert!(
        store
            .layers_list_path("S/MapServer")
            .starts_with(store.data_root())
    );
}

#[test]
fn cursor_lifecycle() {
    let (_temp, store) = temp_store();
    let artifact = store.artifact_path("S/MapServer", "Roads_3");
    let cursor_path = Store::cursor_path(&artifact);
    assert_eq!(Store::read_cursor(&cursor_path).unwrap(), None);

    Store::write_cursor(&cursor_path, &Cursor::new("offset:2000")).unwrap();
    assert_eq!(
        Store::read_cursor(&cursor_path).unwrap(),
        Some(Cursor::new("offset:2000"))
    );
    Store::clear_cursor(&cursor_path).unwrap();
    Store::clear_cursor(&cursor_path).unwrap();
    assert_eq!(Store::read_cursor(&cursor_path).unwrap(), None);
}

#[test]
fn status_files_are_found_recursively() {
    let (_temp, store) = temp_store();
    for path in ["Deep/Group/Roads_3", "Rivers_1"] {
        let artifact = store.artifact_path("S/MapServer", path);
        Store::write_status(&Store::status_path(&artifact), LayerStatus::Wip).unwrap();
    }
    std::fs::write(
        store.data_root().join("S/MapServer/Rivers_1.geojsonl").as_std_path(),
        "",
    )
    .unwrap();

    let files = store.status_files().unwrap();
    assert_eq!(files.len(), 2);
    assert!(files[0].as_str().ends_with("Deep/Group/Roads_3.geojsonl.status"));
    assert!(files[1].as_str().ends_with("Rivers_1.geojsonl.status"));
}

#[test]
fn checkpoint_keeps_artifact_length() {
    let (_temp, store) = temp_store();
    let cursor_path = Store::cursor_path(&store.artifact_path("S/MapServer", "Roads_3"));
    let checkpoint = Checkpoint {
        cursor: Cursor::new("offset:2"),
        artifact_len: Some(84),
    };
    Store::write_checkpoint(&cursor_path, &checkpoint).unwrap();
    assert_eq!(Store::read_checkpoint(&cursor_path).unwrap(), Some(checkpoint));
    assert_eq!(
        Store::read_cursor(&cursor_path).unwrap(),
        Some(Cursor::new("offset:2"))
    );

    Store::write_cursor(&cursor_path, &Cursor::new("offset:5")).unwrap();
    assert_eq!(
        Store::read_checkpoint(&cursor_path).unwrap(),
        Some(Checkpoint {
            cursor: Cursor::new("offset:5"),
            artifact_len: None,
        })
    );

    Store::write_bytes_atomic(&cursor_path, b"offset:5\nlots").unwrap();
    assert_matches!(
        Store::read_checkpoint(&cursor_path),
        Err(HarvestError::InvalidCursor(_))
    );
}

#[test]
fn terminal_statuses_do_not_replace_each_other() {
    let (_temp, store) = temp_store();
    let status = Store::status_path(&store.artifact_path("S/MapServer", "Elevation_4"));
    Store::write_status(&status, LayerStatus::Wip).unwrap();
    Store::write_status(&status, LayerStatus::Ignore).unwrap();
    Store::write_status(&status, LayerStatus::Ignore).unwrap();
    assert_matches!(
        Store::write_status(&status, LayerStatus::Downloaded),
        Err(HarvestError::StatusRegression { .. })
    );
    assert_eq!(Store::read_status(&status).unwrap(), Some(LayerStatus::Ignore));
}

#[cfg(unix)]
#[test]
fn status_walk_does_not_follow_directory_links() {
    let (_temp, store) = temp_store();
    let artifact = store.artifact_path("S/MapServer", "Rivers_1");
    Store::write_status(&Store::status_path(&artifact), LayerStatus::Done).unwrap();
    let service_dir = store.data_root().join("S/MapServer");
    std::os::unix::fs::symlink(
        store.data_root().as_std_path(),
        service_dir.join("loop").as_std_path(),
    )
    .unwrap();

    let files = store.status_files().unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].as_str().ends_with("S/MapServer/Rivers_1.geojsonl.status"));
}
