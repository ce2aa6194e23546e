//! Orchestration: site hydration, variant selection and metrics ingestion
//! over injected backends.

use crate::lifecycle::{ConnectionStatus, Lifecycle};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use variant_core::config::AppConfig;
use variant_core::types::{
    Experiment, MetricsBatch, SessionDescriptor, Site, ValidatedRequest, CONVERSION_METRIC,
    EXPOSURE_METRIC,
};
use variant_core::{ExperimentError, ExperimentResult, Outcome, RequestParts, RequestValidator};
use variant_models::{DirectoryModels, ModelStore, ModelsBackend};
use variant_probability::{bandit, p_value, Counts};
use variant_selection::{Selection, VariantSelector};
use variant_store::{
    IngestReport, KvStore, MemoryKv, MetricsStore, RedisKv, SessionStore, SiteMetrics,
};

/// A hydrated site plus the headers to send with it.
#[derive(Debug, Clone, Serialize)]
pub struct SiteResponse {
    pub site: Site,
    #[serde(skip)]
    pub headers: Vec<(String, String)>,
}

/// The backends a service talks to. Metrics and sessions may share one store.
#[derive(Clone)]
struct Backends {
    metrics_kv: Arc<dyn KvStore>,
    session_kv: Arc<dyn KvStore>,
    models: Arc<dyn ModelsBackend>,
}

impl Backends {
    fn shared_kv(&self) -> bool {
        Arc::ptr_eq(&self.metrics_kv, &self.session_kv)
    }

    async fn connect(self) -> ConnectionStatus {
        if let Err(e) = self.metrics_kv.connect().await {
            warn!(backend = self.metrics_kv.backend_name(), error = %e, "Metrics backend unavailable, running degraded");
        }
        if !self.shared_kv() {
            if let Err(e) = self.session_kv.connect().await {
                warn!(backend = self.session_kv.backend_name(), error = %e, "Session backend unavailable, running degraded");
            }
        }
        if let Err(e) = self.models.connect().await {
            warn!(error = %e, "Models backend unavailable");
        }
        let status = self.status();
        info!(
            metrics = status.metrics,
            sessions = status.sessions,
            models = status.models,
            "Backends initialised"
        );
        status
    }

    async fn disconnect(self) -> ConnectionStatus {
        if let Err(e) = self.metrics_kv.disconnect().await {
            warn!(error = %e, "Metrics backend disconnect failed");
        }
        if !self.shared_kv() {
            if let Err(e) = self.session_kv.disconnect().await {
                warn!(error = %e, "Session backend disconnect failed");
            }
        }
        if let Err(e) = self.models.disconnect().await {
            warn!(error = %e, "Models backend disconnect failed");
        }
        info!("Backends shut down");
        self.status()
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            metrics: self.metrics_kv.is_connected(),
            sessions: self.session_kv.is_connected(),
            models: self.models.is_connected(),
        }
    }
}

pub struct ExperimentService {
    config: Arc<AppConfig>,
    validator: RequestValidator,
    backends: Backends,
    models: ModelStore,
    metrics: Arc<MetricsStore>,
    sessions: Arc<SessionStore>,
    selector: VariantSelector,
    lifecycle: Lifecycle,
}

impl ExperimentService {
    pub fn builder(config: AppConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    /// Connects every backend once; concurrent callers share the attempt.
    pub async fn init(&self) -> ConnectionStatus {
        let backends = self.backends.clone();
        self.lifecycle
            .start(move || -> BoxFuture<'static, ConnectionStatus> { backends.connect().boxed() })
            .await
    }

    pub async fn shutdown(&self) {
        let backends = self.backends.clone();
        self.lifecycle
            .stop(move || -> BoxFuture<'static, ConnectionStatus> { backends.disconnect().boxed() })
            .await
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.backends.status()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status().all()
    }

    /// Origin allow-list and session id checks.
    pub fn validate(&self, parts: RequestParts) -> ExperimentResult<ValidatedRequest> {
        self.validator.validate(parts)
    }

    /// Loads the site and embeds bandit probabilities derived from its
    /// counters. Unknown sites and unreachable metrics degrade instead of
    /// failing.
    pub async fn get_site(&self, request: &ValidatedRequest) -> Outcome<SiteResponse> {
        metrics::counter!("service.site_requests").increment(1);
        let (mut site, mut degraded) = match self.models.get_site(request).await {
            Outcome::Success(site) => (site, None),
            Outcome::Degraded { value, reason } => (value, Some(reason)),
            Outcome::Fatal(e) => (Site::builtin_default(), Some(e)),
        };

        if self.metrics.is_connected() {
            let active: Vec<Experiment> = site
                .experiments
                .iter()
                .filter(|e| e.is_active())
                .cloned()
                .collect();
            match self.metrics.get_metrics_for_site(&site.name, &active).await {
                Ok(buckets) => self.embed_probabilities(&mut site, &buckets),
                Err(e) => {
                    warn!(site = %site.name, error = %e, "Metrics unavailable, serving declared weights");
                    degraded.get_or_insert(e);
                }
            }
        } else {
            debug!(site = %site.name, "Metrics backend not connected, skipping probabilities");
            degraded.get_or_insert(ExperimentError::NotConnected("metrics"));
        }

        let headers = self.response_headers(request, None);
        let response = SiteResponse { site, headers };
        match degraded {
            None => Outcome::Success(response),
            Some(reason) => Outcome::degraded(response, reason),
        }
    }

    fn embed_probabilities(&self, site: &mut Site, buckets: &SiteMetrics) {
        let epsilon = self.config.metrics.epsilon;
        for experiment in site.experiments.iter_mut().filter(|e| e.is_active()) {
            let Some(variant_buckets) = buckets.get(&experiment.id) else {
                continue;
            };

            let mut exposures = Counts::new();
            let mut conversions = Counts::new();
            let mut has_both = false;
            for (name, bucket) in variant_buckets {
                let exposure = bucket.get(EXPOSURE_METRIC);
                let conversion = bucket.get(CONVERSION_METRIC);
                has_both |= exposure.is_some() && conversion.is_some();
                exposures.insert(name.clone(), exposure.map_or(0.0, |v| v.as_f64()));
                conversions.insert(name.clone(), conversion.map_or(0.0, |v| v.as_f64()));
            }

            if has_both {
                let distribution = bandit(&exposures, &conversions, epsilon);
                for variant in &mut experiment.variants {
                    if let Some(p) = distribution.get(&variant.name) {
                        variant.probability = Some(*p);
                    }
                }
                experiment.p_value = p_value(&exposures, &conversions);
            }

            if self.config.metrics.debug {
                for variant in &mut experiment.variants {
                    variant.metrics = variant_buckets.get(&variant.name).cloned();
                }
            }
        }
    }

    /// Picks the variant to serve from an already hydrated site.
    pub async fn select_variant(
        &self,
        site: Site,
        request: &ValidatedRequest,
        explicit: Option<&str>,
    ) -> Outcome<Selection> {
        let session = match self.sessions.get_or_create_session(request).await {
            Ok(session) => Some(session),
            Err(e) => {
                debug!(error = %e, "Selecting without a session");
                None
            }
        };
        self.selector.select_variant(site, explicit, session).await
    }

    /// Hydrates the site and selects a variant in one call. The session
    /// cookie in the returned headers reflects the selection's session.
    pub async fn serve(
        &self,
        request: &ValidatedRequest,
        explicit: Option<&str>,
    ) -> Outcome<(SiteResponse, Selection)> {
        let (mut response, site_reason) = match self.get_site(request).await {
            Outcome::Success(response) => (response, None),
            Outcome::Degraded { value, reason } => (value, Some(reason)),
            Outcome::Fatal(e) => return Outcome::Fatal(e),
        };

        let (selection, selection_reason) = match self
            .select_variant(response.site.clone(), request, explicit)
            .await
        {
            Outcome::Success(selection) => (selection, None),
            Outcome::Degraded { value, reason } => (value, Some(reason)),
            Outcome::Fatal(e) => return Outcome::Fatal(e),
        };
        if let Some(session) = &selection.session {
            response.headers = self.response_headers(request, Some(session));
        }

        match selection_reason.or(site_reason) {
            Some(reason) => Outcome::degraded((response, selection), reason),
            None => Outcome::Success((response, selection)),
        }
    }

    /// Attributes a batch to the request's session and counts its samples.
    pub async fn ingest_metrics(
        &self,
        request: &ValidatedRequest,
        batch: &MetricsBatch,
    ) -> ExperimentResult<IngestReport> {
        metrics::counter!("service.metrics_batches").increment(1);
        if request.site_name.is_empty() {
            let scoped = ValidatedRequest {
                site_name: batch.site.clone(),
                ..request.clone()
            };
            return self.metrics.ingest_batch(&scoped, batch).await;
        }
        self.metrics.ingest_batch(request, batch).await
    }

    /// Caching, CORS and session cookie headers for a response.
    pub fn response_headers(
        &self,
        request: &ValidatedRequest,
        session: Option<&SessionDescriptor>,
    ) -> Vec<(String, String)> {
        let mut headers = vec![("Cache-Control".to_string(), "no-store".to_string())];
        if let Some(origin) = &request.origin {
            headers.push(("Access-Control-Allow-Origin".to_string(), origin.clone()));
            headers.push(("Access-Control-Allow-Credentials".to_string(), "true".to_string()));
            headers.push(("Vary".to_string(), "Origin".to_string()));
        }
        let session_id = session
            .map(|s| s.session_id.as_str())
            .unwrap_or(request.session_id.as_str());
        if !session_id.is_empty() {
            headers.push(("Set-Cookie".to_string(), self.session_cookie(session_id)));
        }
        headers
    }

    pub fn session_cookie(&self, session_id: &str) -> String {
        let sessions = &self.config.sessions;
        if sessions.cookie_settings.is_empty() {
            format!("{}={}", sessions.cookie_name, session_id)
        } else {
            format!(
                "{}={}; {}",
                sessions.cookie_name, session_id, sessions.cookie_settings
            )
        }
    }
}

/// Composition-root helper wiring backends into a service.
pub struct ServiceBuilder {
    config: AppConfig,
    metrics_kv: Option<Arc<dyn KvStore>>,
    session_kv: Option<Arc<dyn KvStore>>,
    models: Option<Arc<dyn ModelsBackend>>,
    seed: Option<u64>,
}

impl ServiceBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            metrics_kv: None,
            session_kv: None,
            models: None,
            seed: None,
        }
    }

    /// Uses one store for both metrics and sessions.
    pub fn kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.metrics_kv = Some(kv.clone());
        self.session_kv = Some(kv);
        self
    }

    pub fn metrics_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.metrics_kv = Some(kv);
        self
    }

    pub fn session_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.session_kv = Some(kv);
        self
    }

    pub fn models(mut self, models: Arc<dyn ModelsBackend>) -> Self {
        self.models = Some(models);
        self
    }

    /// Makes weighted draws reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Unset stores default to Redis when enabled in the config, otherwise
    /// to one in-memory store; unset models read the configured directory.
    pub fn build(self) -> ExperimentResult<ExperimentService> {
        let config = Arc::new(self.config);

        let default_kv = || -> ExperimentResult<Arc<dyn KvStore>> {
            if config.redis.enabled {
                Ok(Arc::new(RedisKv::new(&config.redis)?))
            } else {
                Ok(Arc::new(MemoryKv::new()))
            }
        };
        let (metrics_kv, session_kv) = match (self.metrics_kv, self.session_kv) {
            (Some(m), Some(s)) => (m, s),
            (Some(m), None) => (m.clone(), m),
            (None, Some(s)) => (s.clone(), s),
            (None, None) => {
                let kv = default_kv()?;
                (kv.clone(), kv)
            }
        };
        let models: Arc<dyn ModelsBackend> = match self.models {
            Some(models) => models,
            None => Arc::new(DirectoryModels::new(&config.models)),
        };

        let sessions = Arc::new(SessionStore::new(
            session_kv.clone(),
            config.redis.session_ttl_secs,
            config.metrics.max_key_length,
        ));
        let metrics = Arc::new(MetricsStore::new(
            metrics_kv.clone(),
            sessions.clone(),
            &config.metrics,
        ));
        let selector = match self.seed {
            Some(seed) => VariantSelector::with_seed(Some(sessions.clone()), seed),
            None => VariantSelector::new(Some(sessions.clone())),
        };

        Ok(ExperimentService {
            validator: RequestValidator::new(&config.validation),
            backends: Backends {
                metrics_kv,
                session_kv,
                models: models.clone(),
            },
            models: ModelStore::new(models),
            metrics,
            sessions,
            selector,
            lifecycle: Lifecycle::new(),
            config,
        })
    }
}
