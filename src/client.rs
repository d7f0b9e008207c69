use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::{Cursor, LayerInfo, QueryParams, RecordCount};
use crate::error::HarvestError;

/// Count errors some servers return instead of a row count.
pub const COUNT_NOT_SUPPORTED: [&str; 2] = [
    "Could not retrieve row count: Invalid or missing input parameters. ",
    "Could not retrieve row count: Requested operation is not supported by this service. The requested capability is not supported.",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
}

impl ServiceRef {
    /// `<name>/<type>`, the path used everywhere else for a service.
    pub fn path(&self) -> String {
        format!("{}/{}", self.name, self.service_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

impl RemoteErrorBody {
    fn describe(&self) -> String {
        format!("{} {}", self.message, self.details.join(", "))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderInfo {
    pub folders: Vec<String>,
    pub services: Vec<ServiceRef>,
    pub error: Option<RemoteErrorBody>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerMetadata {
    pub field_names: Vec<String>,
    pub sub_layer_ids: Vec<i64>,
    pub layer_type: Option<String>,
}

/// Lazy record sequence that can report where to resume.
pub trait RecordStream: Iterator<Item = Result<Value, HarvestError>> {
    /// Position just after the last record yielded so far.
    fn cursor(&self) -> Option<Cursor>;
}

pub trait CatalogClient: Send + Sync {
    fn folder_info(&self, folder: &str) -> Result<FolderInfo, HarvestError>;
    fn service_layers(&self, service: &str) -> Result<Vec<LayerInfo>, HarvestError>;
    fn layer_metadata(
        &self,
        service: &str,
        layer_id: i64,
        params: &QueryParams,
    ) -> Result<LayerMetadata, HarvestError>;
    fn record_count(
        &self,
        service: &str,
        layer_id: i64,
        params: &QueryParams,
    ) -> Result<RecordCount, HarvestError>;
    fn records<'a>(
        &'a self,
        service: &str,
        layer_id: i64,
        params: &QueryParams,
        cursor: Option<Cursor>,
    ) -> Result<Box<dyn RecordStream + 'a>, HarvestError>;
}

#[derive(Clone)]
pub struct EsriHttpClient {
    client: Client,
    base_url: String,
    page_size: u32,
}

impl EsriHttpClient {
    pub fn new(base_url: &str, page_size: u32) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("esri-harvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| HarvestError::Http(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size,
        })
    }

    fn url(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<Value, HarvestError> {
        debug!(url, "GET");
        let response = self.send_with_retries(|| self.client.get(url).query(query))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "catalog request failed".to_string());
            return Err(HarvestError::HttpStatus { status, message });
        }
        let text = response
            .text()
            .map_err(|err| HarvestError::Http(err.to_string()))?;
        serde_json::from_str(&text).map_err(|err| HarvestError::MalformedResponse {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, HarvestError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(HarvestError::Http(err.to_string()));
                }
            }
        }
    }

    fn layer_query(&self, params: &QueryParams, extra: &[(&str, String)]) -> Vec<(String, String)> {
        let mut query = QueryParams::new();
        query.insert("where".to_string(), "1=1".to_string());
        query.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (key, value) in extra {
            query.insert(key.to_string(), value.clone());
        }
        query.into_iter().collect()
    }
}

impl CatalogClient for EsriHttpClient {
    fn folder_info(&self, folder: &str) -> Result<FolderInfo, HarvestError> {
        let url = self.url(folder);
        let value = self.get_json(&url, &[("f".to_string(), "json".to_string())])?;
        parse_folder_info(&url, value)
    }

    fn service_layers(&self, service: &str) -> Result<Vec<LayerInfo>, HarvestError> {
        let url = self.url(service);
        let value = self.get_json(&url, &[("f".to_string(), "json".to_string())])?;
        let value = check_remote_error(value, "Could not retrieve service info")?;
        match value.get("layers") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(layers) => serde_json::from_value(layers.clone()).map_err(|err| {
                HarvestError::MalformedResponse {
                    url,
                    reason: err.to_string(),
                }
            }),
        }
    }

    fn layer_metadata(
        &self,
        service: &str,
        layer_id: i64,
        params: &QueryParams,
    ) -> Result<LayerMetadata, HarvestError> {
        let url = self.url(&format!("{service}/{layer_id}"));
        let mut query: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        query.push(("f".to_string(), "json".to_string()));
        let value = self.get_json(&url, &query)?;
        let value = check_remote_error(value, "Could not retrieve layer metadata")?;
        Ok(parse_layer_metadata(&value))
    }

    fn record_count(
        &self,
        service: &str,
        layer_id: i64,
        params: &QueryParams,
    ) -> Result<RecordCount, HarvestError> {
        let url = self.url(&format!("{service}/{layer_id}/query"));
        let query = self.layer_query(
            params,
            &[
                ("returnCountOnly", "true".to_string()),
                ("f", "json".to_string()),
            ],
        );
        let value = self.get_json(&url, &query)?;
        match check_remote_error(value, "Could not retrieve row count") {
            Ok(value) => value
                .get("count")
                .and_then(Value::as_u64)
                .map(RecordCount::Known)
                .ok_or_else(|| HarvestError::MalformedResponse {
                    url,
                    reason: "missing count".to_string(),
                }),
            Err(err) if is_count_not_supported(&err) => Ok(RecordCount::Unknown),
            Err(err) => Err(err),
        }
    }

    fn records<'a>(
        &'a self,
        service: &str,
        layer_id: i64,
        params: &QueryParams,
        cursor: Option<Cursor>,
    ) -> Result<Box<dyn RecordStream + 'a>, HarvestError> {
        let start = match cursor {
            Some(cursor) => decode_offset(&cursor)?,
            None => 0,
        };
        Ok(Box::new(OffsetRecordStream {
            client: self,
            url: self.url(&format!("{service}/{layer_id}/query")),
            params: params.clone(),
            next_offset: start,
            fetched: start,
            buffer: VecDeque::new(),
            finished: false,
        }))
    }
}

/// Pages through `query` with `resultOffset`, yielding GeoJSON features.
struct OffsetRecordStream<'a> {
    client: &'a EsriHttpClient,
    url: String,
    params: QueryParams,
    next_offset: u64,
    fetched: u64,
    buffer: VecDeque<Value>,
    finished: bool,
}

impl OffsetRecordStream<'_> {
    fn fetch_page(&mut self) -> Result<(), HarvestError> {
        let mut params = self.params.clone();
        params
            .entry("outSR".to_string())
            .or_insert_with(|| "4326".to_string());
        let query = self.client.layer_query(
            &params,
            &[
                ("outFields", "*".to_string()),
                ("returnGeometry", "true".to_string()),
                ("f", "geojson".to_string()),
                ("resultOffset", self.fetched.to_string()),
                ("resultRecordCount", self.client.page_size.to_string()),
            ],
        );
        let value = self.client.get_json(&self.url, &query)?;
        let value = check_remote_error(value, "Could not retrieve a section of features")?;
        let (features, more) = parse_feature_page(&self.url, value)?;
        if !more {
            self.finished = true;
        }
        self.fetched += features.len() as u64;
        self.buffer.extend(features);
        Ok(())
    }
}

/// Features of one query page and whether the server holds more.
///
/// A page is the last one unless it is flagged with `exceededTransferLimit`,
/// which GeoJSON responses carry under `properties`. Layers without pagination
/// support ignore `resultOffset` and never set the flag, so they end after one page.
pub fn parse_feature_page(url: &str, value: Value) -> Result<(Vec<Value>, bool), HarvestError> {
    let exceeded = value
        .get("exceededTransferLimit")
        .or_else(|| value.pointer("/properties/exceededTransferLimit"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    match value.get("features") {
        Some(Value::Array(features)) => {
            let more = exceeded && !features.is_empty();
            Ok((features.clone(), more))
        }
        _ => Err(HarvestError::MalformedResponse {
            url: url.to_string(),
            reason: "missing features".to_string(),
        }),
    }
}

impl Iterator for OffsetRecordStream<'_> {
    type Item = Result<Value, HarvestError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.is_empty() {
            if self.finished {
                return None;
            }
            if let Err(err) = self.fetch_page() {
                self.finished = true;
                return Some(Err(err));
            }
        }
        let record = self.buffer.pop_front()?;
        self.next_offset += 1;
        Some(Ok(record))
    }
}

impl RecordStream for OffsetRecordStream<'_> {
    fn cursor(&self) -> Option<Cursor> {
        Some(encode_offset(self.next_offset))
    }
}

pub fn encode_offset(offset: u64) -> Cursor {
    Cursor::new(format!("offset:{offset}"))
}

pub fn decode_offset(cursor: &Cursor) -> Result<u64, HarvestError> {
    cursor
        .as_str()
        .strip_prefix("offset:")
        .and_then(|rest| rest.parse().ok())
        .ok_or_else(|| HarvestError::InvalidCursor(cursor.to_string()))
}

fn check_remote_error(value: Value, context: &str) -> Result<Value, HarvestError> {
    match value.get("error") {
        None | Some(Value::Null) => Ok(value),
        Some(error) => {
            let body: RemoteErrorBody =
                serde_json::from_value(error.clone()).unwrap_or_else(|_| RemoteErrorBody {
                    code: None,
                    message: error.to_string(),
                    details: Vec::new(),
                });
            Err(HarvestError::Remote {
                context: context.to_string(),
                message: body.describe(),
            })
        }
    }
}

// Literal text match; servers give no structured code for this case.
fn is_count_not_supported(err: &HarvestError) -> bool {
    let text = err.to_string();
    matches!(err, HarvestError::Remote { .. })
        && COUNT_NOT_SUPPORTED.iter().any(|known| *known == text)
}

pub fn parse_folder_info(url: &str, value: Value) -> Result<FolderInfo, HarvestError> {
    if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
        let body = serde_json::from_value(error.clone()).unwrap_or(RemoteErrorBody {
            code: None,
            message: error.to_string(),
            details: Vec::new(),
        });
        return Ok(FolderInfo {
            error: Some(body),
            ..FolderInfo::default()
        });
    }
    if value.get("folders").is_none() && value.get("services").is_none() {
        return Err(HarvestError::MalformedResponse {
            url: url.to_string(),
            reason: "neither folders nor services listed".to_string(),
        });
    }
    let malformed = |err: serde_json::Error| HarvestError::MalformedResponse {
        url: url.to_string(),
        reason: err.to_string(),
    };
    let folders = match value.get("folders") {
        Some(folders) if !folders.is_null() => {
            serde_json::from_value(folders.clone()).map_err(malformed)?
        }
        _ => Vec::new(),
    };
    let services = match value.get("services") {
        Some(services) if !services.is_null() => {
            serde_json::from_value(services.clone()).map_err(malformed)?
        }
        _ => Vec::new(),
    };
    Ok(FolderInfo {
        folders,
        services,
        error: None,
    })
}

pub fn parse_layer_metadata(value: &Value) -> LayerMetadata {
    let field_names = value
        .get("fields")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(|field| field.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let sub_layer_ids = value
        .get("subLayers")
        .and_then(Value::as_array)
        .map(|subs| {
            subs.iter()
                .filter_map(|sub| sub.get("id").and_then(Value::as_i64))
                .collect()
        })
        .unwrap_or_default();
    let layer_type = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string);
    LayerMetadata {
        field_names,
        sub_layer_ids,
        layer_type,
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
