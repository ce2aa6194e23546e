//! Site configurations scanned from JSON files in a directory.
//! A background task rescans on an interval while connected.

use crate::backend::ModelsBackend;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use variant_core::config::ModelsConfig;
use variant_core::types::{Site, ValidatedRequest};
use variant_core::{ExperimentError, ExperimentResult};

/// A file holds either one site or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum SiteDocument {
    One(Site),
    Many(Vec<Site>),
}

type SiteMap = HashMap<String, Site>;

pub struct DirectoryModels {
    directory: PathBuf,
    refresh_interval: Duration,
    sites: Arc<RwLock<SiteMap>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl DirectoryModels {
    pub fn new(config: &ModelsConfig) -> Self {
        Self {
            directory: PathBuf::from(&config.directory),
            refresh_interval: Duration::from_secs(config.refresh_interval_secs.max(1)),
            sites: Arc::new(RwLock::new(SiteMap::new())),
            refresher: Mutex::new(None),
        }
    }

    /// Rescans the directory and swaps in the result. Returns the site count.
    pub async fn reload(&self) -> ExperimentResult<usize> {
        let scanned = scan(&self.directory).await?;
        let count = scanned.len();
        *self.sites.write() = scanned;
        Ok(count)
    }

    pub fn site_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sites.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Reads every `*.json` file in name order. Unreadable files are skipped;
/// when two files define the same site the first one wins.
async fn scan(directory: &Path) -> ExperimentResult<SiteMap> {
    let mut entries = tokio::fs::read_dir(directory).await.map_err(|e| {
        ExperimentError::Config(format!(
            "cannot read models directory {}: {e}",
            directory.display()
        ))
    })?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut sites = SiteMap::new();
    for path in paths {
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable site file");
                continue;
            }
        };
        let document: SiteDocument = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping malformed site file");
                metrics::counter!("models.malformed_files").increment(1);
                continue;
            }
        };
        let found = match document {
            SiteDocument::One(site) => vec![site],
            SiteDocument::Many(list) => list,
        };
        for site in found {
            if sites.contains_key(&site.name) {
                warn!(site = %site.name, path = %path.display(), "Duplicate site ignored");
                continue;
            }
            sites.insert(site.name.clone(), site);
        }
    }
    debug!(directory = %directory.display(), count = sites.len(), "Scanned site models");
    Ok(sites)
}

#[async_trait]
impl ModelsBackend for DirectoryModels {
    async fn connect(&self) -> ExperimentResult<()> {
        let count = self.reload().await?;
        info!(directory = %self.directory.display(), sites = count, "Site models loaded");

        let mut refresher = self.refresher.lock();
        if refresher.is_none() {
            let directory = self.directory.clone();
            let sites = self.sites.clone();
            let period = self.refresh_interval;
            *refresher = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    match scan(&directory).await {
                        Ok(scanned) => {
                            *sites.write() = scanned;
                        }
                        Err(e) => warn!(error = %e, "Site model refresh failed, keeping previous"),
                    }
                }
            }));
        }
        Ok(())
    }

    async fn disconnect(&self) -> ExperimentResult<()> {
        if let Some(handle) = self.refresher.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.refresher.lock().is_some()
    }

    async fn get_site_config(&self, request: &ValidatedRequest) -> ExperimentResult<Option<Site>> {
        Ok(self.sites.read().get(&request.site_name).cloned())
    }
}

impl Drop for DirectoryModels {
    fn drop(&mut self) {
        if let Some(handle) = self.refresher.get_mut().take() {
            handle.abort();
        }
    }
}
