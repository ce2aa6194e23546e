//! Metrics store: per-variant counters fed by client sample batches.

use crate::kv::{Increment, KvStore};
use crate::sessions::SessionStore;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, error, warn};
use variant_core::config::MetricsConfig;
use variant_core::key::metrics_key;
use variant_core::types::{
    Experiment, MetricValue, MetricsBatch, MetricsBucket, ValidatedRequest, DEFAULT_EXPERIMENT_ID,
    DEFAULT_VARIANT_NAME,
};
use variant_core::ExperimentResult;

/// Buckets for a site, keyed by experiment id then variant name.
pub type SiteMetrics = IndexMap<String, IndexMap<String, MetricsBucket>>;

/// What happened to one ingested batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub session_id: String,
    pub accepted: usize,
    pub missing_timestamp: usize,
    pub out_of_order: usize,
    pub oversized_payload: usize,
    /// False when the increment pipeline failed and the batch was dropped.
    pub applied: bool,
}

impl IngestReport {
    pub fn rejected(&self) -> usize {
        self.missing_timestamp + self.out_of_order + self.oversized_payload
    }
}

pub struct MetricsStore {
    kv: Arc<dyn KvStore>,
    sessions: Arc<SessionStore>,
    max_payload_length: usize,
    max_key_length: usize,
}

impl MetricsStore {
    pub fn new(kv: Arc<dyn KvStore>, sessions: Arc<SessionStore>, config: &MetricsConfig) -> Self {
        Self {
            kv,
            sessions,
            max_payload_length: config.max_payload_length,
            max_key_length: config.max_key_length,
        }
    }

    pub async fn connect(&self) -> ExperimentResult<()> {
        self.kv.connect().await
    }

    pub async fn disconnect(&self) -> ExperimentResult<()> {
        self.kv.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.kv.is_connected()
    }

    /// Attributes a batch to the request's session and applies its samples.
    ///
    /// Samples without a numeric timestamp, older than the previously
    /// accepted sample, or with an oversized payload are skipped. Accepted
    /// samples are applied in one atomic pipeline; if it fails the whole
    /// batch is dropped and logged.
    pub async fn ingest_batch(
        &self,
        request: &ValidatedRequest,
        batch: &MetricsBatch,
    ) -> ExperimentResult<IngestReport> {
        let key = metrics_key(
            &batch.site,
            &batch.experiment,
            &batch.variant,
            self.max_key_length,
        )?;

        let session = self.sessions.get_or_create_session(request).await?;
        let session = if batch.experiment == DEFAULT_EXPERIMENT_ID
            && batch.variant == DEFAULT_VARIANT_NAME
        {
            session
        } else {
            self.sessions
                .mark_variant_seen(session, &batch.site, &batch.experiment, &batch.variant)
                .await
        };

        let mut report = IngestReport {
            session_id: session.session_id,
            ..Default::default()
        };
        let mut increments = Vec::with_capacity(batch.entries.len());
        let mut last_ts: Option<i64> = None;

        for sample in &batch.entries {
            let Some(ts) = sample.timestamp() else {
                report.missing_timestamp += 1;
                continue;
            };
            if last_ts.is_some_and(|prev| ts < prev) {
                report.out_of_order += 1;
                continue;
            }
            if sample.payload_len() > self.max_payload_length {
                report.oversized_payload += 1;
                continue;
            }
            last_ts = Some(ts);
            let by = sample
                .weight
                .filter(|w| w.is_finite())
                .map(MetricValue::from_weight)
                .unwrap_or(MetricValue::Int(1));
            increments.push(Increment {
                key: key.clone(),
                field: sample.name.clone(),
                by,
            });
        }
        report.accepted = increments.len();

        if report.rejected() > 0 {
            debug!(
                key = %key,
                missing_timestamp = report.missing_timestamp,
                out_of_order = report.out_of_order,
                oversized_payload = report.oversized_payload,
                "Skipped metric samples"
            );
            metrics::counter!("metrics.samples_rejected").increment(report.rejected() as u64);
        }

        if increments.is_empty() {
            report.applied = true;
            return Ok(report);
        }

        match self.kv.increment_batch(&increments).await {
            Ok(()) => {
                metrics::counter!("metrics.samples_accepted").increment(report.accepted as u64);
                report.applied = true;
            }
            Err(e) => {
                metrics::counter!("metrics.batches_dropped").increment(1);
                error!(error = %e, key = %key, samples = report.accepted, "Dropping metrics batch");
            }
        }
        Ok(report)
    }

    /// Counters for one variant; an unknown key yields an empty bucket.
    pub async fn get_metrics_bucket(
        &self,
        site: &str,
        experiment_id: &str,
        variant: &str,
    ) -> ExperimentResult<MetricsBucket> {
        let key = metrics_key(site, experiment_id, variant, self.max_key_length)?;
        self.kv.get_counters(&key).await
    }

    /// Buckets for every variant of every given experiment.
    pub async fn get_metrics_for_site(
        &self,
        site: &str,
        experiments: &[Experiment],
    ) -> ExperimentResult<SiteMetrics> {
        let mut result = SiteMetrics::new();
        for experiment in experiments {
            let buckets = result.entry(experiment.id.clone()).or_default();
            for variant in &experiment.variants {
                if buckets.contains_key(&variant.name) {
                    warn!(experiment = %experiment.id, variant = %variant.name, "Duplicate variant name");
                    continue;
                }
                let bucket = self
                    .get_metrics_bucket(site, &experiment.id, &variant.name)
                    .await?;
                buckets.insert(variant.name.clone(), bucket);
            }
        }
        Ok(result)
    }
}
