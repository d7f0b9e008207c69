use std::collections::BTreeMap;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::json;

use esri_harvest::app::{ProgressEvent, ProgressSink};
use esri_harvest::domain::{CatalogEntry, LayerKey, LayerStatus, RecordCount, ServiceDeny};
use esri_harvest::error::HarvestError;
use esri_harvest::matcher::{accepted_statuses, check, done_layers, match_layers};
use esri_harvest::store::{Catalog, Store};

struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

fn entry(name: &str, id: i64, service: &str, count: u64) -> CatalogEntry {
    CatalogEntry {
        full_name: name.to_string(),
        layer_id: id,
        service: service.to_string(),
        record_count: RecordCount::Known(count),
        field_names: Vec::new(),
    }
}

fn no_rules() -> (BTreeMap<String, ServiceDeny>, BTreeMap<String, Vec<String>>) {
    (BTreeMap::new(), BTreeMap::new())
}

#[test]
fn copy_in_another_service_is_matched() {
    let catalog = Catalog::from_entries(vec![
        entry("svcA/Layer1", 5, "svcA", 10),
        entry("svcB/Layer1", 7, "svcB", 10),
    ]);
    let done = vec![LayerKey::new("svca/layer1", 5)];
    let (ignore, known) = no_rules();

    let (matches, residual) = match_layers(&catalog, &done, &ignore, &known).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches["svcb/layer1"], LayerKey::new("svca/layer1", 5));
    assert!(residual.is_empty());
}

#[test]
fn longest_suffix_wins() {
    let catalog = Catalog::from_entries(vec![
        entry("A/MapServer/Group/Roads", 1, "A/MapServer", 10),
        entry("B/MapServer/Roads", 2, "B/MapServer", 10),
        entry("C/MapServer/Group/Roads", 3, "C/MapServer", 10),
    ]);
    let done = vec![
        LayerKey::new("b/mapserver/roads", 2),
        LayerKey::new("a/mapserver/group/roads", 1),
    ];
    let (ignore, known) = no_rules();

    let (matches, _) = match_layers(&catalog, &done, &ignore, &known).unwrap();
    assert_eq!(
        matches["c/mapserver/group/roads"],
        LayerKey::new("a/mapserver/group/roads", 1)
    );
}

#[test]
fn equal_suffixes_keep_first_done_layer() {
    let catalog = Catalog::from_entries(vec![
        entry("A/MapServer/Roads", 1, "A/MapServer", 4),
        entry("B/MapServer/Roads", 2, "B/MapServer", 4),
        entry("C/MapServer/Roads", 3, "C/MapServer", 4),
    ]);
    let done = vec![
        LayerKey::new("b/mapserver/roads", 2),
        LayerKey::new("a/mapserver/roads", 1),
    ];
    let (ignore, known) = no_rules();

    let (matches, _) = match_layers(&catalog, &done, &ignore, &known).unwrap();
    assert_eq!(
        matches["c/mapserver/roads"],
        LayerKey::new("a/mapserver/roads", 1)
    );
}

#[test]
fn count_mismatch_is_not_a_match() {
    let catalog = Catalog::from_entries(vec![
        entry("svcA/Layer1", 5, "svcA", 10),
        entry("svcB/Layer1", 7, "svcB", 11),
    ]);
    let done = vec![LayerKey::new("svca/layer1", 5)];
    let (ignore, known) = no_rules();

    let (matches, residual) = match_layers(&catalog, &done, &ignore, &known).unwrap();
    assert!(matches.is_empty());
    assert_eq!(residual, vec![entry("svcB/Layer1", 7, "svcB", 11)]);
}

#[test]
fn unknown_counts_only_match_unknown() {
    let mut unknown = entry("svcA/Layer1", 5, "svcA", 0);
    unknown.record_count = RecordCount::Unknown;
    let catalog = Catalog::from_entries(vec![unknown, entry("svcB/Layer1", 7, "svcB", 0)]);
    let done = vec![LayerKey::new("svca/layer1", 5)];
    let (ignore, known) = no_rules();

    let (matches, residual) = match_layers(&catalog, &done, &ignore, &known).unwrap();
    assert!(matches.is_empty());
    assert_eq!(residual.len(), 1);
}

#[test]
fn ignore_rules_and_known_matches_prune_residual() {
    let catalog = Catalog::from_entries(vec![
        entry("X/MapServer/Parcels", 1, "X/MapServer", 3),
        entry("Y/MapServer/Roads", 3, "Y/MapServer", 8),
        entry("Y/MapServer/Rivers", 4, "Y/MapServer", 9),
        entry("Z/MapServer/Lakes", 2, "Z/MapServer", 5),
        entry("Z/MapServer/Wells", 6, "Z/MapServer", 5),
    ]);
    let mut ignore = BTreeMap::new();
    ignore.insert("X/MapServer".to_string(), ServiceDeny::All);
    ignore.insert(
        "Y/MapServer".to_string(),
        ServiceDeny::Layers(["Roads_3".to_string()].into()),
    );
    let mut known = BTreeMap::new();
    known.insert(
        "Z/MapServer/Lakes".to_string(),
        vec!["W/MapServer/Lakes_1".to_string()],
    );

    let (matches, residual) = match_layers(&catalog, &[], &ignore, &known).unwrap();
    assert!(matches.is_empty());
    let names: Vec<&str> = residual.iter().map(|e| e.full_name.as_str()).collect();
    assert_eq!(names, vec!["Y/MapServer/Rivers", "Z/MapServer/Wells"]);
}

#[test]
fn done_layer_outside_catalog_is_an_error() {
    let catalog = Catalog::from_entries(vec![entry("svcA/Layer1", 5, "svcA", 10)]);
    let done = vec![LayerKey::new("svcq/ghost", 9)];
    let (ignore, known) = no_rules();
    assert_matches!(
        match_layers(&catalog, &done, &ignore, &known),
        Err(HarvestError::MissingCatalogEntry { id: 9, .. })
    );
}

fn temp_store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, Store::new(root.join("data"), root.join("analysis")))
}

fn mark(store: &Store, service: &str, path: &str, status: LayerStatus) {
    let artifact = store.artifact_path(service, path);
    Store::write_status(&Store::status_path(&artifact), status).unwrap();
}

#[test]
fn done_set_follows_accepted_statuses() {
    let (_temp, store) = temp_store();
    mark(&store, "svcA", "Layer1_5", LayerStatus::Downloaded);
    mark(&store, "svcA", "Group/Layer2_6", LayerStatus::Done);
    mark(&store, "svcA", "Group_4", LayerStatus::NotLayer);
    mark(&store, "svcB", "Layer3_1", LayerStatus::Wip);

    let done = done_layers(&store, &accepted_statuses(false)).unwrap();
    assert_eq!(
        done,
        vec![
            LayerKey::new("svca/group/layer2", 6),
            LayerKey::new("svca/layer1", 5),
        ]
    );

    let archived = done_layers(&store, &accepted_statuses(true)).unwrap();
    assert_eq!(archived, vec![LayerKey::new("svca/group/layer2", 6)]);
}

#[test]
fn malformed_status_name_is_an_error() {
    let (_temp, store) = temp_store();
    let status = store.data_root().join("svcA/Layer1.geojsonl.status");
    Store::write_status(&status, LayerStatus::Done).unwrap();
    assert_matches!(
        done_layers(&store, &accepted_statuses(false)),
        Err(HarvestError::StatusFileName(_))
    );
}

#[test]
fn check_writes_both_reports() {
    let (_temp, store) = temp_store();
    let mut writer = store.open_catalog_writer().unwrap();
    writer.append(entry("svcA/Layer1", 5, "svcA", 10)).unwrap();
    writer.append(entry("svcB/Layer1", 7, "svcB", 10)).unwrap();
    writer.append(entry("svcB/Layer2", 8, "svcB", 2)).unwrap();
    drop(writer);
    mark(&store, "svcA", "Layer1_5", LayerStatus::Done);

    let (ignore, known) = no_rules();
    let outcome = check(&store, &ignore, &known, &accepted_statuses(true), &NullSink).unwrap();
    assert_eq!(outcome.catalog_entries, 3);
    assert_eq!(outcome.done_layers, 1);
    assert_eq!(outcome.missing, 2);
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.need_to_check, 1);

    let matches: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(store.matches_path().as_std_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(matches, json!({"svcb/layer1": ["svca/layer1", 5]}));

    let residual: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(store.need_to_check_path().as_std_path()).unwrap(),
    )
    .unwrap();
    assert_eq!(
        residual,
        json!([{"name": "svcB/Layer2", "id": 8, "service": "svcB", "fcount": 2, "fnames": []}])
    );
}
