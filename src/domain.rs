use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Extra query arguments sent with layer metadata, count and record requests.
pub type QueryParams = BTreeMap<String, String>;

/// Persisted lifecycle marker of a single layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    Wip,
    NotLayer,
    RasterLayer,
    Ignore,
    Downloaded,
    Compressed,
    Done,
}

impl LayerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerStatus::Wip => "wip",
            LayerStatus::NotLayer => "not_layer",
            LayerStatus::RasterLayer => "raster_layer",
            LayerStatus::Ignore => "ignore",
            LayerStatus::Downloaded => "downloaded",
            LayerStatus::Compressed => "compressed",
            LayerStatus::Done => "done",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "wip" => Some(LayerStatus::Wip),
            "not_layer" => Some(LayerStatus::NotLayer),
            "raster_layer" => Some(LayerStatus::RasterLayer),
            "ignore" => Some(LayerStatus::Ignore),
            "downloaded" => Some(LayerStatus::Downloaded),
            "compressed" => Some(LayerStatus::Compressed),
            "done" => Some(LayerStatus::Done),
            _ => None,
        }
    }

    /// Position in `wip -> {not_layer|raster_layer|ignore|downloaded} -> compressed -> done`.
    pub fn rank(&self) -> u8 {
        match self {
            LayerStatus::Wip => 0,
            LayerStatus::NotLayer
            | LayerStatus::RasterLayer
            | LayerStatus::Ignore
            | LayerStatus::Downloaded => 1,
            LayerStatus::Compressed => 2,
            LayerStatus::Done => 3,
        }
    }

    /// Forward moves only. The terminal statuses of rank 1 are alternatives,
    /// not steps, so none of them may replace another.
    pub fn can_advance_to(&self, next: LayerStatus) -> bool {
        match next.rank().cmp(&self.rank()) {
            Ordering::Greater => true,
            Ordering::Equal => *self == next,
            Ordering::Less => false,
        }
    }

    /// States that will never produce records.
    pub fn is_skipped_layer(&self) -> bool {
        matches!(
            self,
            LayerStatus::NotLayer | LayerStatus::RasterLayer | LayerStatus::Ignore
        )
    }
}

impl fmt::Display for LayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Number of records a layer reports, `-1` on disk when the service refuses to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum RecordCount {
    Known(u64),
    Unknown,
}

impl From<i64> for RecordCount {
    fn from(value: i64) -> Self {
        if value < 0 {
            RecordCount::Unknown
        } else {
            RecordCount::Known(value as u64)
        }
    }
}

impl From<RecordCount> for i64 {
    fn from(value: RecordCount) -> Self {
        match value {
            RecordCount::Known(count) => count as i64,
            RecordCount::Unknown => -1,
        }
    }
}

impl fmt::Display for RecordCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", i64::from(*self))
    }
}

/// Opaque resumable position inside a layer's record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn decode(text: &str) -> Result<Self, HarvestError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(HarvestError::InvalidCursor("empty cursor".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(lowercase full name, layer id)`, the identity of a catalog layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerKey(pub String, pub i64);

impl LayerKey {
    pub fn new(name: &str, id: i64) -> Self {
        Self(name.to_lowercase(), id)
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> i64 {
        self.1
    }
}

impl fmt::Display for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "name")]
    pub full_name: String,
    #[serde(rename = "id")]
    pub layer_id: i64,
    pub service: String,
    #[serde(rename = "fcount")]
    pub record_count: RecordCount,
    #[serde(rename = "fnames", default)]
    pub field_names: Vec<String>,
}

impl CatalogEntry {
    pub fn key(&self) -> LayerKey {
        LayerKey::new(&self.full_name, self.layer_id)
    }

    /// Layer path below the service, e.g. `Group/Layer` for `A/MapServer/Group/Layer`.
    pub fn layer_path(&self) -> &str {
        self.full_name
            .strip_prefix(self.service.as_str())
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(&self.full_name)
    }
}

/// Per-service deny rule: every layer, or the listed `<path>_<id>` names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceDeny {
    All,
    Layers(BTreeSet<String>),
}

impl ServiceDeny {
    pub fn denies_all(&self) -> bool {
        matches!(self, ServiceDeny::All)
    }

    pub fn denies(&self, name: &str) -> bool {
        match self {
            ServiceDeny::All => true,
            ServiceDeny::Layers(names) => names.contains(name),
        }
    }
}

/// A layer definition as listed by its service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub id: i64,
    pub name: String,
    #[serde(rename = "parentLayerId", default)]
    pub parent_layer_id: Option<i64>,
    #[serde(rename = "subLayerIds", default)]
    pub sub_layer_ids: Option<Vec<i64>>,
    #[serde(rename = "type", default)]
    pub layer_type: Option<String>,
}

impl LayerInfo {
    pub fn is_leaf(&self) -> bool {
        self.sub_layer_ids
            .as_ref()
            .map(|ids| ids.is_empty())
            .unwrap_or(true)
    }

    fn parent(&self) -> Option<i64> {
        self.parent_layer_id.filter(|id| *id != -1)
    }
}

/// Node table over a service's layers, keyed by layer id.
#[derive(Debug, Clone)]
pub struct LayerTree {
    service: String,
    order: Vec<i64>,
    nodes: HashMap<i64, LayerInfo>,
}

impl LayerTree {
    pub fn new(service: &str, layers: Vec<LayerInfo>) -> Self {
        let order = layers.iter().map(|layer| layer.id).collect();
        let nodes = layers.into_iter().map(|layer| (layer.id, layer)).collect();
        Self {
            service: service.to_string(),
            order,
            nodes,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn layers(&self) -> impl Iterator<Item = &LayerInfo> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn leaves(&self) -> impl Iterator<Item = &LayerInfo> {
        self.layers().filter(|layer| layer.is_leaf())
    }

    pub fn get(&self, id: i64) -> Option<&LayerInfo> {
        self.nodes.get(&id)
    }

    /// `/`-joined names from the service root down to `id`.
    pub fn path(&self, id: i64) -> Result<String, HarvestError> {
        let mut parts = Vec::new();
        let mut current = self.node(id)?;
        loop {
            parts.push(current.name.as_str());
            if parts.len() > self.nodes.len() {
                return Err(self.broken(format!("parent cycle at layer {id}")));
            }
            match current.parent() {
                Some(parent) => current = self.node(parent)?,
                None => break,
            }
        }
        parts.reverse();
        Ok(parts.join("/"))
    }

    /// Like [`LayerTree::path`], with `_<id>` appended to the last segment.
    pub fn qualified_path(&self, id: i64) -> Result<String, HarvestError> {
        Ok(format!("{}_{id}", self.path(id)?))
    }

    fn node(&self, id: i64) -> Result<&LayerInfo, HarvestError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| self.broken(format!("unknown layer id {id}")))
    }

    fn broken(&self, reason: String) -> HarvestError {
        HarvestError::LayerTree {
            service: self.service.clone(),
            reason,
        }
    }
}
