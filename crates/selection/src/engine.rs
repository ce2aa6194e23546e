//! Pure selection rules: which experiment is active and which variant wins.

use rand::Rng;
use serde::Serialize;
use variant_core::types::{
    Experiment, SessionDescriptor, Site, Variant, DEFAULT_EXPERIMENT_ID, DEFAULT_VARIANT_NAME,
};
use variant_core::{ExperimentError, ExperimentResult};
use variant_probability::select_with_probabilities;

/// How a selection was reached, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    Explicit,
    SessionPinned,
    Probabilistic,
    DefaultFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub experiment: Experiment,
    pub variant: Variant,
    pub source: SelectionSource,
}

impl Resolved {
    pub fn builtin_default() -> Self {
        Self {
            experiment: Experiment::builtin_default(),
            variant: Variant::builtin_default(),
            source: SelectionSource::DefaultFallback,
        }
    }

    /// Defaults are implicit and never recorded in a session.
    pub fn is_builtin_default(&self) -> bool {
        self.experiment.id == DEFAULT_EXPERIMENT_ID && self.variant.name == DEFAULT_VARIANT_NAME
    }
}

/// Rejects configurations that cannot be looked up deterministically.
pub fn validate_site(site: &Site) -> ExperimentResult<()> {
    if site.name.is_empty() {
        return Err(ExperimentError::Config("site has no name".to_string()));
    }
    for experiment in &site.experiments {
        if experiment.id.is_empty() {
            return Err(ExperimentError::Config(format!(
                "site '{}' has an experiment without an id",
                site.name
            )));
        }
        if experiment.variants.iter().any(|v| v.name.is_empty()) {
            return Err(ExperimentError::Config(format!(
                "experiment '{}' has a variant without a name",
                experiment.id
            )));
        }
    }
    Ok(())
}

/// First active experiment, restricted to those containing `variant_name`
/// when one is given. Falls back to a configured default experiment.
pub fn get_active_experiment<'a>(
    site: &'a Site,
    variant_name: Option<&str>,
) -> Option<&'a Experiment> {
    site.experiments
        .iter()
        .filter(|e| e.is_active())
        .find(|e| variant_name.map_or(true, |name| e.has_variant(name)))
        .or_else(|| site.experiment(DEFAULT_EXPERIMENT_ID))
}

/// Looks up `variant_name` in `experiment`, falling back first to a
/// site-configured default experiment (served with the built-in default
/// variant) and then to the fully built-in pair.
pub fn select_specific(site: &Site, experiment: &Experiment, variant_name: &str) -> Resolved {
    if let Some(variant) = experiment.variant(variant_name) {
        return Resolved {
            experiment: experiment.clone(),
            variant: variant.clone(),
            source: SelectionSource::Explicit,
        };
    }
    match site.experiment(DEFAULT_EXPERIMENT_ID) {
        Some(configured) if configured.has_variant(DEFAULT_VARIANT_NAME) => Resolved {
            experiment: configured.clone(),
            variant: Variant::builtin_default(),
            source: SelectionSource::DefaultFallback,
        },
        _ => Resolved::builtin_default(),
    }
}

/// The variant last shown to the session for this experiment, if it
/// still exists there.
pub fn pinned_variant<'a>(
    site: &Site,
    experiment: &'a Experiment,
    session: &SessionDescriptor,
) -> Option<&'a Variant> {
    let name = session.last_seen(&site.name, &experiment.id)?;
    experiment.variant(name)
}

/// Applies the precedence chain: explicit name, session pin, weighted
/// draw, built-in default.
pub fn resolve<R: Rng + ?Sized>(
    site: &Site,
    explicit: Option<&str>,
    session: Option<&SessionDescriptor>,
    rng: &mut R,
) -> ExperimentResult<Resolved> {
    validate_site(site)?;

    let explicit = explicit.or(site.select_override.as_deref());
    if let Some(name) = explicit {
        let builtin = Experiment::builtin_default();
        let experiment = get_active_experiment(site, Some(name)).unwrap_or(&builtin);
        return Ok(select_specific(site, experiment, name));
    }

    let Some(experiment) = get_active_experiment(site, None) else {
        return Ok(Resolved::builtin_default());
    };

    if let Some(variant) = session.and_then(|s| pinned_variant(site, experiment, s)) {
        return Ok(Resolved {
            experiment: experiment.clone(),
            variant: variant.clone(),
            source: SelectionSource::SessionPinned,
        });
    }

    if let Some(variant) = select_with_probabilities(experiment, rng) {
        return Ok(Resolved {
            experiment: experiment.clone(),
            variant: variant.clone(),
            source: SelectionSource::Probabilistic,
        });
    }

    Ok(Resolved::builtin_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn experiment(id: &str, inactive: bool, variants: &[(&str, Option<f64>)]) -> Experiment {
        Experiment {
            id: id.into(),
            inactive,
            variants: variants.iter().map(|(n, p)| Variant::new(*n, *p)).collect(),
            p_value: None,
        }
    }

    fn site(experiments: Vec<Experiment>) -> Site {
        Site {
            name: "shop".into(),
            select_override: None,
            experiments,
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(3)
    }

    #[test]
    fn test_active_experiment_skips_inactive() {
        let s = site(vec![
            experiment("old", true, &[("A", None)]),
            experiment("new", false, &[("A", None), ("B", None)]),
        ]);
        assert_eq!(get_active_experiment(&s, None).unwrap().id, "new");
        assert_eq!(get_active_experiment(&s, Some("B")).unwrap().id, "new");
        assert!(get_active_experiment(&s, Some("Z")).is_none());
    }

    #[test]
    fn test_active_experiment_falls_back_to_configured_default() {
        let s = site(vec![
            experiment("exp1", false, &[("A", None)]),
            experiment(DEFAULT_EXPERIMENT_ID, false, &[(DEFAULT_VARIANT_NAME, None)]),
        ]);
        assert_eq!(
            get_active_experiment(&s, Some("Z")).unwrap().id,
            DEFAULT_EXPERIMENT_ID
        );
    }

    #[test]
    fn test_duplicate_ids_take_first_match() {
        let s = site(vec![
            experiment("exp1", false, &[("A", None)]),
            experiment("exp1", false, &[("B", None)]),
        ]);
        assert!(s.experiment("exp1").unwrap().has_variant("A"));
        assert_eq!(get_active_experiment(&s, None).unwrap().variants[0].name, "A");
    }

    #[test]
    fn test_select_specific_three_tiers() {
        let exp = experiment("exp1", false, &[("A", None)]);

        let found = select_specific(&site(vec![exp.clone()]), &exp, "A");
        assert_eq!(found.variant.name, "A");
        assert_eq!(found.source, SelectionSource::Explicit);

        let mut configured_default = experiment(
            DEFAULT_EXPERIMENT_ID,
            false,
            &[(DEFAULT_VARIANT_NAME, Some(0.3))],
        );
        configured_default.variants[0]
            .properties
            .insert("color".into(), "red".into());
        let with_default = site(vec![exp.clone(), configured_default.clone()]);
        let fallback = select_specific(&with_default, &exp, "missing");
        assert_eq!(fallback.experiment, configured_default);
        assert_eq!(fallback.variant, Variant::builtin_default());

        let builtin = select_specific(&site(vec![exp.clone()]), &exp, "missing");
        assert_eq!(builtin, Resolved::builtin_default());
    }

    #[test]
    fn test_caller_name_beats_site_select() {
        let mut s = site(vec![experiment("exp1", false, &[("X", None), ("Y", None)])]);
        s.select_override = Some("X".into());

        let chosen = resolve(&s, Some("Y"), None, &mut rng()).unwrap();
        assert_eq!(chosen.variant.name, "Y");

        let chosen = resolve(&s, None, None, &mut rng()).unwrap();
        assert_eq!(chosen.variant.name, "X");
        assert_eq!(chosen.source, SelectionSource::Explicit);
    }

    #[test]
    fn test_explicit_beats_session_pin() {
        let s = site(vec![experiment("exp1", false, &[("A", None), ("B", None)])]);
        let mut session = SessionDescriptor::new("s1");
        session.mark_seen("shop", "exp1", "B");
        let chosen = resolve(&s, Some("A"), Some(&session), &mut rng()).unwrap();
        assert_eq!(chosen.variant.name, "A");
    }

    #[test]
    fn test_session_pin_is_used() {
        let s = site(vec![experiment(
            "exp1",
            false,
            &[("A", Some(1.0)), ("B", Some(0.0))],
        )]);
        let mut session = SessionDescriptor::new("s1");
        session.mark_seen("shop", "exp1", "B");

        let chosen = resolve(&s, None, Some(&session), &mut rng()).unwrap();
        assert_eq!(chosen.variant.name, "B");
        assert_eq!(chosen.source, SelectionSource::SessionPinned);
    }

    #[test]
    fn test_stale_pin_falls_through_to_draw() {
        let s = site(vec![experiment("exp1", false, &[("A", Some(1.0))])]);
        let mut session = SessionDescriptor::new("s1");
        session.mark_seen("shop", "exp1", "gone");

        let chosen = resolve(&s, None, Some(&session), &mut rng()).unwrap();
        assert_eq!(chosen.variant.name, "A");
        assert_eq!(chosen.source, SelectionSource::Probabilistic);
    }

    #[test]
    fn test_empty_site_uses_builtin_default() {
        let chosen = resolve(&site(vec![]), None, None, &mut rng()).unwrap();
        assert_eq!(chosen, Resolved::builtin_default());
        assert!(chosen.is_builtin_default());

        let chosen = resolve(
            &site(vec![experiment("exp1", false, &[])]),
            None,
            None,
            &mut rng(),
        )
        .unwrap();
        assert!(chosen.is_builtin_default());
    }

    #[test]
    fn test_malformed_site_is_an_error() {
        let mut s = site(vec![experiment("", false, &[("A", None)])]);
        assert!(resolve(&s, None, None, &mut rng()).is_err());
        s.experiments.clear();
        s.name.clear();
        assert!(matches!(
            resolve(&s, None, None, &mut rng()),
            Err(ExperimentError::Config(_))
        ));
    }
}
