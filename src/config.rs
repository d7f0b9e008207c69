use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{QueryParams, ServiceDeny};
use crate::error::HarvestError;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "esri-harvest.json";
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub base_url: String,
    #[serde(default)]
    pub data_folder: Option<String>,
    #[serde(default)]
    pub analysis_folder: Option<String>,
    #[serde(default)]
    pub base_params: QueryParams,
    #[serde(default)]
    pub interested_service_types: Option<Vec<String>>,
    #[serde(default)]
    pub ignore_layer_types: Option<Vec<String>>,
    #[serde(default)]
    pub folder_blacklist: Vec<String>,
    #[serde(default)]
    pub blacklist: BTreeMap<String, Option<DenyEntry>>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceEntry>,
    #[serde(default)]
    pub retry: Option<RetryEntry>,
    #[serde(default)]
    pub match_ignore: BTreeMap<String, Option<DenyEntry>>,
    #[serde(default)]
    pub known_matches: BTreeMap<String, KnownMatch>,
    #[serde(default)]
    pub archive: Option<ArchiveEntry>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

/// `null`, `"all"` or a list of `<path>_<id>` layer names.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DenyEntry {
    Keyword(String),
    Layers(Vec<String>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum KnownMatch {
    Single(String),
    Many(Vec<String>),
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ServiceEntry {
    #[serde(default)]
    pub whitelist: Option<Vec<String>>,
    #[serde(default)]
    pub params: QueryParams,
    #[serde(default)]
    pub layer_params: BTreeMap<String, QueryParams>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub delay_secs: Option<u64>,
    #[serde(default)]
    pub max_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ArchiveEntry {
    pub bucket: String,
    #[serde(default)]
    pub compressor: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub name: String,
    pub whitelist: BTreeSet<String>,
    pub params: QueryParams,
    pub layer_params: BTreeMap<String, QueryParams>,
}

impl ServiceRequest {
    pub fn unrestricted(name: &str) -> Self {
        Self {
            name: name.to_string(),
            whitelist: BTreeSet::new(),
            params: QueryParams::new(),
            layer_params: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    pub bucket: String,
    pub compressor: String,
    pub uploader: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub base_url: String,
    pub data_root: Utf8PathBuf,
    pub analysis_root: Utf8PathBuf,
    pub base_params: QueryParams,
    pub interested_service_types: BTreeSet<String>,
    pub ignore_layer_types: BTreeSet<String>,
    pub folder_blacklist: BTreeSet<String>,
    pub blacklist: BTreeMap<String, ServiceDeny>,
    pub services: Vec<ServiceRequest>,
    pub retry: RetryPolicy,
    pub match_ignore: BTreeMap<String, ServiceDeny>,
    pub known_matches: BTreeMap<String, Vec<String>>,
    pub archive: Option<ArchiveSettings>,
    pub page_size: u32,
}

impl ResolvedConfig {
    pub fn service_deny(&self, service: &str) -> ServiceDeny {
        self.blacklist
            .get(service)
            .cloned()
            .unwrap_or_else(|| ServiceDeny::Layers(BTreeSet::new()))
    }

    pub fn is_service_denied(&self, service: &str) -> bool {
        self.blacklist
            .get(service)
            .map(ServiceDeny::denies_all)
            .unwrap_or(false)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(HarvestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let base_url = validate_base_url(&config.base_url)?;

        let page_size = config.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(HarvestError::ConfigInvalid(
                "page_size must be greater than zero".to_string(),
            ));
        }

        let retry_entry = config.retry.unwrap_or_default();
        let delay = retry_entry.delay_secs.unwrap_or(30);
        let max_delay = retry_entry.max_delay_secs.unwrap_or(600);
        if max_delay < delay {
            return Err(HarvestError::ConfigInvalid(format!(
                "retry.max_delay_secs ({max_delay}) is smaller than retry.delay_secs ({delay})"
            )));
        }

        let blacklist = resolve_deny_map("blacklist", config.blacklist)?;
        let match_ignore = resolve_deny_map("match_ignore", config.match_ignore)?;

        let services = config
            .services
            .into_iter()
            .map(|(name, entry)| ServiceRequest {
                name,
                whitelist: entry.whitelist.unwrap_or_default().into_iter().collect(),
                params: entry.params,
                layer_params: entry.layer_params,
            })
            .collect();

        let known_matches = config
            .known_matches
            .into_iter()
            .map(|(name, value)| {
                let targets = match value {
                    KnownMatch::Single(target) => vec![target],
                    KnownMatch::Many(targets) => targets,
                };
                (name, targets)
            })
            .collect();

        let archive = config
            .archive
            .map(|entry| {
                if entry.bucket.trim().is_empty() {
                    return Err(HarvestError::ConfigInvalid(
                        "archive.bucket must not be empty".to_string(),
                    ));
                }
                Ok(ArchiveSettings {
                    bucket: entry.bucket,
                    compressor: entry.compressor.unwrap_or_else(|| "7z".to_string()),
                    uploader: entry.uploader.unwrap_or_else(|| "gsutil".to_string()),
                })
            })
            .transpose()?;

        Ok(ResolvedConfig {
            base_url,
            data_root: Utf8PathBuf::from(config.data_folder.unwrap_or_else(|| "data".to_string())),
            analysis_root: Utf8PathBuf::from(
                config
                    .analysis_folder
                    .unwrap_or_else(|| "analysis".to_string()),
            ),
            base_params: config.base_params,
            interested_service_types: config
                .interested_service_types
                .unwrap_or_else(default_service_types)
                .into_iter()
                .collect(),
            ignore_layer_types: config
                .ignore_layer_types
                .unwrap_or_else(default_ignore_layer_types)
                .into_iter()
                .collect(),
            folder_blacklist: config.folder_blacklist.into_iter().collect(),
            blacklist,
            services,
            retry: RetryPolicy::new(Duration::from_secs(delay), Duration::from_secs(max_delay)),
            match_ignore,
            known_matches,
            archive,
            page_size,
        })
    }
}

pub fn default_service_types() -> Vec<String> {
    vec!["MapServer".to_string(), "FeatureServer".to_string()]
}

pub fn default_ignore_layer_types() -> Vec<String> {
    vec!["Raster Layer".to_string()]
}

fn validate_base_url(value: &str) -> Result<String, HarvestError> {
    let trimmed = value.trim().trim_end_matches('/');
    let url = reqwest::Url::parse(trimmed)
        .map_err(|err| HarvestError::ConfigInvalid(format!("base_url {value}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(HarvestError::ConfigInvalid(format!(
            "base_url must be http or https: {value}"
        )));
    }
    Ok(trimmed.to_string())
}

fn resolve_deny_map(
    field: &str,
    raw: BTreeMap<String, Option<DenyEntry>>,
) -> Result<BTreeMap<String, ServiceDeny>, HarvestError> {
    raw.into_iter()
        .map(|(service, entry)| {
            let deny = match entry {
                None => ServiceDeny::All,
                Some(DenyEntry::Keyword(keyword)) if keyword.eq_ignore_ascii_case("all") => {
                    ServiceDeny::All
                }
                Some(DenyEntry::Keyword(other)) => {
                    return Err(HarvestError::ConfigInvalid(format!(
                        "{field}.{service}: expected null, \"all\" or a list of layers, got \"{other}\""
                    )));
                }
                Some(DenyEntry::Layers(layers)) => ServiceDeny::Layers(layers.into_iter().collect()),
            };
            Ok((service, deny))
        })
        .collect()
}
