use async_trait::async_trait;
use dashmap::DashMap;
use variant_core::types::{Site, ValidatedRequest};
use variant_core::ExperimentResult;

/// Source of site configurations.
#[async_trait]
pub trait ModelsBackend: Send + Sync {
    async fn connect(&self) -> ExperimentResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> ExperimentResult<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    /// The configuration for the request's site, `None` if unknown.
    async fn get_site_config(&self, request: &ValidatedRequest) -> ExperimentResult<Option<Site>>;
}

/// Sites held in memory, registered by the embedding application.
#[derive(Default)]
pub struct StaticModels {
    sites: DashMap<String, Site>,
}

impl StaticModels {
    pub fn new(sites: impl IntoIterator<Item = Site>) -> Self {
        let models = Self::default();
        for site in sites {
            models.insert(site);
        }
        models
    }

    /// Registers a site unless one with the same name already exists.
    pub fn insert(&self, site: Site) -> bool {
        if self.sites.contains_key(&site.name) {
            return false;
        }
        self.sites.insert(site.name.clone(), site);
        true
    }
}

#[async_trait]
impl ModelsBackend for StaticModels {
    async fn get_site_config(&self, request: &ValidatedRequest) -> ExperimentResult<Option<Site>> {
        Ok(self
            .sites
            .get(&request.site_name)
            .map(|site| site.value().clone()))
    }
}
