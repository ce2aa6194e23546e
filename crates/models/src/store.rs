use crate::backend::ModelsBackend;
use std::sync::Arc;
use tracing::warn;
use variant_core::types::{Site, ValidatedRequest};
use variant_core::{ExperimentError, Outcome};

/// Hands out per-request copies of site configurations.
pub struct ModelStore {
    backend: Arc<dyn ModelsBackend>,
}

impl ModelStore {
    pub fn new(backend: Arc<dyn ModelsBackend>) -> Self {
        Self { backend }
    }

    /// The request's site, or the built-in default site when it is unknown
    /// or the backend fails. The returned value is owned by the caller.
    pub async fn get_site(&self, request: &ValidatedRequest) -> Outcome<Site> {
        match self.backend.get_site_config(request).await {
            Ok(Some(site)) => Outcome::Success(site),
            Ok(None) => {
                warn!(site = %request.site_name, "Unknown site, serving built-in default");
                metrics::counter!("models.unknown_site").increment(1);
                Outcome::degraded(
                    Site::builtin_default(),
                    ExperimentError::Config(format!("unknown site '{}'", request.site_name)),
                )
            }
            Err(e) => {
                warn!(site = %request.site_name, error = %e, "Site lookup failed, serving built-in default");
                Outcome::degraded(Site::builtin_default(), e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StaticModels;
    use variant_core::types::DEFAULT_SITE_NAME;

    fn shop() -> Site {
        Site {
            name: "shop".into(),
            select_override: None,
            experiments: vec![],
        }
    }

    #[tokio::test]
    async fn test_known_site_is_returned() {
        let store = ModelStore::new(Arc::new(StaticModels::new([shop()])));
        let outcome = store.get_site(&ValidatedRequest::for_site("shop")).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.value().unwrap().name, "shop");
    }

    #[tokio::test]
    async fn test_unknown_site_degrades_to_default() {
        let store = ModelStore::new(Arc::new(StaticModels::new([shop()])));
        let outcome = store.get_site(&ValidatedRequest::for_site("blog")).await;
        assert!(outcome.is_degraded());
        assert_eq!(outcome.value().unwrap().name, DEFAULT_SITE_NAME);
    }

    #[tokio::test]
    async fn test_copies_are_independent() {
        let models = Arc::new(StaticModels::new([shop()]));
        let store = ModelStore::new(models);
        let request = ValidatedRequest::for_site("shop");
        let mut first = store.get_site(&request).await.into_result().unwrap();
        first.experiments.push(variant_core::types::Experiment::builtin_default());
        let second = store.get_site(&request).await.into_result().unwrap();
        assert!(second.experiments.is_empty());
    }
}
