//! End-to-end flow over in-memory backends: site hydration, selection,
//! session pinning and metrics ingestion.

use std::sync::Arc;
use variant_core::config::AppConfig;
use variant_core::types::{
    Experiment, MetricSample, MetricsBatch, Site, ValidatedRequest, Variant, CONVERSION_METRIC,
    DEFAULT_SITE_NAME, EXPOSURE_METRIC,
};
use variant_core::{ExperimentError, RequestParts};
use variant_models::StaticModels;
use variant_selection::SelectionSource;
use variant_service::{ExperimentService, ServiceBuilder};
use variant_store::{KvStore, MemoryKv};

fn shop() -> Site {
    Site {
        name: "shop".into(),
        select_override: None,
        experiments: vec![Experiment {
            id: "exp1".into(),
            inactive: false,
            variants: vec![Variant::new("A", Some(0.5)), Variant::new("B", Some(0.5))],
            p_value: None,
        }],
    }
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.redis.enabled = false;
    config.metrics.epsilon = 0.2;
    config
}

fn service_with(config: AppConfig, kv: Arc<MemoryKv>) -> ExperimentService {
    ServiceBuilder::new(config)
        .kv(kv)
        .models(Arc::new(StaticModels::new([shop()])))
        .seed(5)
        .build()
        .unwrap()
}

fn weighted(ts: i64, name: &str, weight: f64) -> MetricSample {
    MetricSample {
        weight: Some(weight),
        ..MetricSample::new(ts, name)
    }
}

fn batch(variant: &str, entries: Vec<MetricSample>) -> MetricsBatch {
    MetricsBatch {
        site: "shop".into(),
        experiment: "exp1".into(),
        variant: variant.into(),
        entries,
    }
}

async fn seed_counts(service: &ExperimentService) {
    let request = ValidatedRequest::for_site("shop");
    service
        .ingest_metrics(
            &request,
            &batch(
                "A",
                vec![
                    weighted(1, EXPOSURE_METRIC, 10.0),
                    weighted(2, CONVERSION_METRIC, 5.0),
                ],
            ),
        )
        .await
        .unwrap();
    service
        .ingest_metrics(
            &request,
            &batch(
                "B",
                vec![
                    weighted(1, EXPOSURE_METRIC, 10.0),
                    weighted(2, CONVERSION_METRIC, 1.0),
                ],
            ),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_site_carries_bandit_probabilities() {
    let service = service_with(config(), Arc::new(MemoryKv::new()));
    assert!(service.init().await.all());
    seed_counts(&service).await;

    let outcome = service.get_site(&ValidatedRequest::for_site("shop")).await;
    assert!(outcome.is_success());
    let response = outcome.into_result().unwrap();
    let experiment = &response.site.experiments[0];

    let a = experiment.variant("A").unwrap().probability.unwrap();
    let b = experiment.variant("B").unwrap().probability.unwrap();
    assert!((a - 0.8).abs() < 1e-9);
    assert!((b - 0.2).abs() < 1e-9);
    assert!(experiment.p_value.is_some());
    assert!(experiment.variants.iter().all(|v| v.metrics.is_none()));
    assert!(response
        .headers
        .iter()
        .any(|(k, v)| k == "Cache-Control" && v == "no-store"));

    service.shutdown().await;
}

#[tokio::test]
async fn test_debug_mode_embeds_counters() {
    let mut config = config();
    config.metrics.debug = true;
    let service = service_with(config, Arc::new(MemoryKv::new()));
    service.init().await;
    seed_counts(&service).await;

    let site = service
        .get_site(&ValidatedRequest::for_site("shop"))
        .await
        .into_result()
        .unwrap()
        .site;
    let bucket = site.experiments[0].variants[0].metrics.clone().unwrap();
    assert_eq!(bucket.get(EXPOSURE_METRIC).unwrap().as_f64(), 10.0);
    assert_eq!(bucket.get(CONVERSION_METRIC).unwrap().as_f64(), 5.0);
}

#[tokio::test]
async fn test_declared_weights_without_conversions() {
    let service = service_with(config(), Arc::new(MemoryKv::new()));
    service.init().await;
    service
        .ingest_metrics(
            &ValidatedRequest::for_site("shop"),
            &batch("A", vec![MetricSample::new(1, EXPOSURE_METRIC)]),
        )
        .await
        .unwrap();

    let site = service
        .get_site(&ValidatedRequest::for_site("shop"))
        .await
        .into_result()
        .unwrap()
        .site;
    assert_eq!(site.experiments[0].variants[0].probability, Some(0.5));
    assert_eq!(site.experiments[0].p_value, None);
}

#[tokio::test]
async fn test_unreachable_metrics_degrade_site() {
    let kv = Arc::new(MemoryKv::new());
    let service = service_with(config(), kv.clone());
    service.init().await;
    kv.disconnect().await.unwrap();

    let outcome = service.get_site(&ValidatedRequest::for_site("shop")).await;
    assert!(outcome.is_degraded());
    assert!(matches!(
        outcome.last_error(),
        Some(ExperimentError::NotConnected(_))
    ));
    let site = outcome.into_result().unwrap().site;
    assert_eq!(site.name, "shop");
    assert_eq!(site.experiments[0].variants[1].probability, Some(0.5));
}

#[tokio::test]
async fn test_unknown_site_serves_builtin_default() {
    let service = service_with(config(), Arc::new(MemoryKv::new()));
    service.init().await;

    let outcome = service.serve(&ValidatedRequest::for_site("nowhere"), None).await;
    assert!(outcome.is_degraded());
    let (response, selection) = outcome.into_result().unwrap();
    assert_eq!(response.site.name, DEFAULT_SITE_NAME);
    assert!(selection.session.unwrap().selections.is_empty());
}

#[tokio::test]
async fn test_session_pins_variant_across_requests() {
    let service = service_with(config(), Arc::new(MemoryKv::new()));
    service.init().await;

    let first = service.validate(RequestParts {
        origin: Some("https://shop.example".into()),
        session_id: None,
        site_name: Some("shop".into()),
    });
    let (response, selection) = service
        .serve(&first.unwrap(), None)
        .await
        .into_result()
        .unwrap();
    let session = selection.session.clone().unwrap();
    let cookie = response
        .headers
        .iter()
        .find(|(k, _)| k == "Set-Cookie")
        .map(|(_, v)| v.clone())
        .unwrap();
    assert!(cookie.starts_with(&format!("variant_session={}", session.session_id)));
    assert!(response
        .headers
        .iter()
        .any(|(k, v)| k == "Access-Control-Allow-Origin" && v == "https://shop.example"));

    for _ in 0..10 {
        let request = service
            .validate(RequestParts {
                origin: None,
                session_id: Some(session.session_id.clone()),
                site_name: Some("shop".into()),
            })
            .unwrap();
        let (_, again) = service
            .serve(&request, None)
            .await
            .into_result()
            .unwrap();
        assert_eq!(again.variant.name, selection.variant.name);
        assert_eq!(again.source, SelectionSource::SessionPinned);
        assert_eq!(again.session.unwrap().session_id, session.session_id);
    }
}

#[tokio::test]
async fn test_ingest_attributes_session_and_skips_out_of_order() {
    let service = service_with(config(), Arc::new(MemoryKv::new()));
    service.init().await;

    let anonymous = ValidatedRequest::default();
    let report = service
        .ingest_metrics(
            &anonymous,
            &batch(
                "B",
                vec![
                    MetricSample::new(2, EXPOSURE_METRIC),
                    MetricSample::new(3, EXPOSURE_METRIC),
                    MetricSample::new(1, EXPOSURE_METRIC),
                ],
            ),
        )
        .await
        .unwrap();
    assert_eq!(report.accepted, 2);
    assert_eq!(report.out_of_order, 1);
    assert!(report.applied);

    let stored = service
        .sessions()
        .load(&report.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.last_seen("shop", "exp1"), Some("B"));

    let bucket = service
        .metrics()
        .get_metrics_bucket("shop", "exp1", "B")
        .await
        .unwrap();
    assert_eq!(bucket.get(EXPOSURE_METRIC).unwrap().as_f64(), 2.0);
}

#[tokio::test]
async fn test_concurrent_init_is_shared() {
    let service = Arc::new(service_with(config(), Arc::new(MemoryKv::new())));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.init().await })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().all());
    }
    assert!(service.is_connected());
    service.shutdown().await;
    service.shutdown().await;
}
