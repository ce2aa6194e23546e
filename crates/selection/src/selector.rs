//! Selection with session side effects.

use crate::engine::{resolve, Resolved, SelectionSource};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{debug, warn};
use variant_core::types::{Experiment, SessionDescriptor, Site, Variant};
use variant_core::Outcome;
use variant_store::SessionStore;

/// What the collaborator serves for one request.
#[derive(Debug, Clone)]
pub struct Selection {
    pub site: Site,
    pub experiment: Experiment,
    pub variant: Variant,
    pub source: SelectionSource,
    /// The session after recording this selection.
    pub session: Option<SessionDescriptor>,
}

impl Selection {
    fn builtin_default(session: Option<SessionDescriptor>) -> Self {
        let resolved = Resolved::builtin_default();
        Self {
            site: Site::builtin_default(),
            experiment: resolved.experiment,
            variant: resolved.variant,
            source: resolved.source,
            session,
        }
    }
}

pub struct VariantSelector {
    sessions: Option<Arc<SessionStore>>,
    rng: Mutex<StdRng>,
}

impl VariantSelector {
    /// Without a session store, selections are only recorded on the
    /// in-memory session passed in.
    pub fn new(sessions: Option<Arc<SessionStore>>) -> Self {
        Self {
            sessions,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(sessions: Option<Arc<SessionStore>>, seed: u64) -> Self {
        Self {
            sessions,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Picks the variant to serve. Never fails: a malformed site resets
    /// to the built-in defaults and the cause is kept on the outcome.
    pub async fn select_variant(
        &self,
        site: Site,
        explicit: Option<&str>,
        session: Option<SessionDescriptor>,
    ) -> Outcome<Selection> {
        let resolved = {
            let mut rng = self.rng.lock();
            resolve(&site, explicit, session.as_ref(), &mut *rng)
        };

        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(site = %site.name, error = %e, "Selection failed, serving built-in defaults");
                metrics::counter!("selection.failures").increment(1);
                return Outcome::degraded(Selection::builtin_default(session), e);
            }
        };

        debug!(
            site = %site.name,
            experiment = %resolved.experiment.id,
            variant = %resolved.variant.name,
            source = ?resolved.source,
            "Variant selected"
        );

        let session = match session {
            Some(session) if !resolved.is_builtin_default() => Some(
                self.persist_variant(
                    session,
                    &site.name,
                    &resolved.experiment.id,
                    &resolved.variant.name,
                )
                .await,
            ),
            other => other,
        };

        Outcome::Success(Selection {
            site,
            experiment: resolved.experiment,
            variant: resolved.variant,
            source: resolved.source,
            session,
        })
    }

    /// Records `variant` as the latest shown for the (site, experiment).
    pub async fn persist_variant(
        &self,
        mut session: SessionDescriptor,
        site: &str,
        experiment_id: &str,
        variant: &str,
    ) -> SessionDescriptor {
        match &self.sessions {
            Some(store) => {
                store
                    .mark_variant_seen(session, site, experiment_id, variant)
                    .await
            }
            None => {
                session.mark_seen(site, experiment_id, variant);
                session
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use variant_core::types::{ValidatedRequest, DEFAULT_SITE_NAME};
    use variant_store::MemoryKv;

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

    fn selector() -> (Arc<SessionStore>, VariantSelector) {
        let sessions = Arc::new(SessionStore::new(Arc::new(MemoryKv::new()), 0, 256));
        (sessions.clone(), VariantSelector::with_seed(Some(sessions), 11))
    }

    #[tokio::test]
    async fn test_persisted_variant_pins_later_selections() {
        let (sessions, selector) = selector();
        let session = sessions
            .get_or_create_session(&ValidatedRequest::for_site("shop"))
            .await
            .unwrap();
        selector
            .persist_variant(session.clone(), "shop", "exp1", "B")
            .await;

        let stored = sessions.load(&session.session_id).await.unwrap();
        for _ in 0..20 {
            let selection = selector
                .select_variant(shop(), None, stored.clone())
                .await
                .into_result()
                .unwrap();
            assert_eq!(selection.variant.name, "B");
            assert_eq!(selection.source, SelectionSource::SessionPinned);
        }
    }

    #[tokio::test]
    async fn test_selection_is_recorded_in_session() {
        let (sessions, selector) = selector();
        let session = sessions
            .get_or_create_session(&ValidatedRequest::for_site("shop"))
            .await
            .unwrap();
        let selection = selector
            .select_variant(shop(), None, Some(session.clone()))
            .await
            .into_result()
            .unwrap();
        let stored = sessions.load(&session.session_id).await.unwrap().unwrap();
        assert_eq!(
            stored.last_seen("shop", "exp1"),
            Some(selection.variant.name.as_str())
        );
    }

    #[tokio::test]
    async fn test_defaults_are_not_recorded() {
        let (_sessions, selector) = selector();
        let empty = Site {
            name: "blank".into(),
            select_override: None,
            experiments: vec![],
        };
        let selection = selector
            .select_variant(empty, None, Some(SessionDescriptor::new("s1")))
            .await
            .into_result()
            .unwrap();
        assert!(selection.session.unwrap().selections.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_site_resets_to_defaults() {
        let selector = VariantSelector::new(None);
        let mut broken = shop();
        broken.experiments[0].id.clear();
        let outcome = selector.select_variant(broken, Some("A"), None).await;
        assert!(outcome.is_degraded());
        assert!(outcome.last_error().is_some());
        let selection = outcome.into_result().unwrap();
        assert_eq!(selection.site.name, DEFAULT_SITE_NAME);
        assert_eq!(selection.source, SelectionSource::DefaultFallback);
    }
}
