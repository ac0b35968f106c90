//! Execution sites discovered from a job configuration document.
//!
//! The document maps runner names to settings. Every runner whose name starts
//! with the configured prefix and which declares a broker URL becomes a polling
//! target; everything else is ignored.

use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use super::SiteSelection;

/// One polling target. Immutable once derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    pub name: String,
    pub broker_url: String,
    pub virtual_host: String,
}

impl SiteConfig {
    pub fn new(name: impl Into<String>, broker_url: impl Into<String>) -> Self {
        let broker_url = broker_url.into();
        let virtual_host = virtual_host_from_url(&broker_url);
        Self {
            name: name.into(),
            broker_url,
            virtual_host,
        }
    }
}

#[derive(Debug, Error)]
pub enum SiteRegistryError {
    #[error("job configuration `{}` not found or unreadable: {source}", .path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("job configuration is malformed: {reason}")]
    Malformed { reason: String },
}

impl SiteRegistryError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawJobConf {
    #[serde(default)]
    runners: Option<BTreeMap<String, YamlValue>>,
}

/// Site name to [`SiteConfig`], in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteRegistry {
    sites: BTreeMap<String, SiteConfig>,
}

impl SiteRegistry {
    pub fn from_path(
        path: impl AsRef<Path>,
        selection: &SiteSelection,
    ) -> Result<Self, SiteRegistryError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| match source.kind() {
            ErrorKind::InvalidData => {
                SiteRegistryError::malformed(format!("{} is not valid UTF-8", path.display()))
            }
            _ => SiteRegistryError::NotFound {
                path: path.to_path_buf(),
                source,
            },
        })?;
        Self::from_yaml_str(&contents, selection)
    }

    pub fn from_yaml_str(
        contents: &str,
        selection: &SiteSelection,
    ) -> Result<Self, SiteRegistryError> {
        let raw: RawJobConf = serde_yaml::from_str(contents)
            .map_err(|err| SiteRegistryError::malformed(err.to_string()))?;

        let runners = raw
            .runners
            .ok_or_else(|| SiteRegistryError::malformed("missing `runners` section"))?;

        let mut sites = BTreeMap::new();
        for (name, settings) in runners {
            if !name.starts_with(&selection.runner_prefix) {
                continue;
            }

            let Some(url) = broker_url(&settings, &selection.url_key) else {
                tracing::debug!(
                    target: "condor_monitor::sites",
                    runner = %name,
                    "runner declares no broker url; not a polling target"
                );
                continue;
            };

            sites.insert(name.clone(), SiteConfig::new(name, url));
        }

        Ok(Self { sites })
    }

    pub fn from_sites<I>(sites: I) -> Self
    where
        I: IntoIterator<Item = SiteConfig>,
    {
        Self {
            sites: sites
                .into_iter()
                .map(|site| (site.name.clone(), site))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SiteConfig> {
        self.sites.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites.values()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

fn broker_url(settings: &YamlValue, key: &str) -> Option<String> {
    let value = settings.as_mapping()?.get(key)?;
    let url = value.as_str()?.trim();
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

/// Final path segment of a broker URL, query string stripped. Strings that
/// do not parse as URLs are split on `/` directly.
pub fn virtual_host_from_url(url: &str) -> String {
    if let Ok(parsed) = Url::parse(url) {
        if let Some(last) = parsed.path_segments().and_then(|mut segments| segments.next_back()) {
            return last.to_string();
        }
    }
    let last = url.rsplit('/').next().unwrap_or(url);
    last.split('?').next().unwrap_or(last).to_string()
}
