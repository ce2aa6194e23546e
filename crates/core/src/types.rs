use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved id of the experiment every site implicitly carries.
pub const DEFAULT_EXPERIMENT_ID: &str = "default";

/// Reserved name of the variant inside the default experiment.
pub const DEFAULT_VARIANT_NAME: &str = "default";

/// Reserved name of the site served when a site is unknown.
pub const DEFAULT_SITE_NAME: &str = "default";

/// Metric name counted once per variant exposure.
pub const EXPOSURE_METRIC: &str = "exposure";

/// Metric name counted once per variant conversion.
pub const CONVERSION_METRIC: &str = "conversion";

/// A site and the experiments it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub name: String,
    /// Variant forced by the site configuration itself.
    #[serde(default, rename = "select", skip_serializing_if = "Option::is_none")]
    pub select_override: Option<String>,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
}

impl Site {
    /// The site served when no configuration exists for a name.
    pub fn builtin_default() -> Self {
        Self {
            name: DEFAULT_SITE_NAME.to_string(),
            select_override: None,
            experiments: vec![Experiment::builtin_default()],
        }
    }

    /// First experiment with the given id, in configuration order.
    pub fn experiment(&self, id: &str) -> Option<&Experiment> {
        self.experiments.iter().find(|e| e.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    #[serde(default)]
    pub inactive: bool,
    #[serde(default)]
    pub variants: Vec<Variant>,
    /// Significance of the observed differences between variants.
    /// Computed by the server, never read from configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
}

impl Experiment {
    pub fn builtin_default() -> Self {
        Self {
            id: DEFAULT_EXPERIMENT_ID.to_string(),
            inactive: false,
            variants: vec![Variant::builtin_default()],
            p_value: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.inactive
    }

    pub fn is_builtin_default(&self) -> bool {
        self.id == DEFAULT_EXPERIMENT_ID
    }

    /// First variant with the given name, in configuration order.
    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name == name)
    }

    pub fn has_variant(&self, name: &str) -> bool {
        self.variant(name).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, serde_json::Value>,
    /// Raw counters, only embedded in debug mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsBucket>,
}

impl Variant {
    pub fn new(name: impl Into<String>, probability: Option<f64>) -> Self {
        Self {
            name: name.into(),
            probability,
            properties: IndexMap::new(),
            metrics: None,
        }
    }

    pub fn builtin_default() -> Self {
        Self::new(DEFAULT_VARIANT_NAME, Some(1.0))
    }
}

/// A counter value. Integer until a fractional increment is applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    /// Builds the increment for a sample weight; whole weights stay integral.
    pub fn from_weight(weight: f64) -> Self {
        if weight.fract() == 0.0 && weight.abs() < i64::MAX as f64 {
            MetricValue::Int(weight as i64)
        } else {
            MetricValue::Float(weight)
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Int(v) => v as f64,
            MetricValue::Float(v) => v,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, MetricValue::Float(_))
    }

    /// Adds `delta`; once either side is fractional the result stays a float.
    pub fn add(self, delta: MetricValue) -> MetricValue {
        match (self, delta) {
            (MetricValue::Int(a), MetricValue::Int(b)) => MetricValue::Int(a.saturating_add(b)),
            (a, b) => MetricValue::Float(a.as_f64() + b.as_f64()),
        }
    }

    /// Parses a counter as stored by a key-value backend.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Ok(v) = raw.parse::<i64>() {
            return Some(MetricValue::Int(v));
        }
        raw.parse::<f64>().ok().map(MetricValue::Float)
    }
}

impl Default for MetricValue {
    fn default() -> Self {
        MetricValue::Int(0)
    }
}

/// Counters for one (site, experiment, variant), keyed by metric name.
pub type MetricsBucket = BTreeMap<String, MetricValue>;

/// Per-site, per-experiment log of the variants a session was shown.
pub type SelectionLog = IndexMap<String, IndexMap<String, Vec<String>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    #[serde(default)]
    pub selections: SelectionLog,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl SessionDescriptor {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            selections: IndexMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Appends `variant`, removing any earlier occurrence so it appears
    /// exactly once, at the end. Returns false if it was already last.
    pub fn mark_seen(&mut self, site: &str, experiment_id: &str, variant: &str) -> bool {
        let log = self
            .selections
            .entry(site.to_string())
            .or_default()
            .entry(experiment_id.to_string())
            .or_default();
        if log.last().map(String::as_str) == Some(variant) {
            return false;
        }
        log.retain(|v| v != variant);
        log.push(variant.to_string());
        true
    }

    /// Most recently shown variant for a (site, experiment) pair.
    pub fn last_seen(&self, site: &str, experiment_id: &str) -> Option<&str> {
        self.selections
            .get(site)?
            .get(experiment_id)?
            .last()
            .map(String::as_str)
    }
}

/// A batch of samples for one variant, as transmitted by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBatch {
    pub site: String,
    pub experiment: String,
    pub variant: String,
    #[serde(default)]
    pub entries: Vec<MetricSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Epoch milliseconds. Kept loose so a malformed entry rejects only itself.
    #[serde(default)]
    pub ts: serde_json::Value,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl MetricSample {
    pub fn new(ts: i64, name: impl Into<String>) -> Self {
        Self {
            ts: serde_json::Value::from(ts),
            name: name.into(),
            payload: None,
            weight: None,
        }
    }

    /// The timestamp, if it is numeric.
    pub fn timestamp(&self) -> Option<i64> {
        match &self.ts {
            serde_json::Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
            _ => None,
        }
    }

    /// Length of the payload as it would be stored.
    pub fn payload_len(&self) -> usize {
        match &self.payload {
            None | Some(serde_json::Value::Null) => 0,
            Some(serde_json::Value::String(s)) => s.chars().count(),
            Some(other) => other.to_string().len(),
        }
    }
}

/// A request that already passed origin and session checks.
#[derive(Debug, Clone, Default)]
pub struct ValidatedRequest {
    pub session_id: String,
    pub origin: Option<String>,
    pub site_name: String,
    pub session: Option<SessionDescriptor>,
}

impl ValidatedRequest {
    pub fn for_site(site_name: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
            ..Default::default()
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_seen_dedupes_and_moves_to_end() {
        let mut session = SessionDescriptor::new("s1");
        assert!(session.mark_seen("shop", "exp1", "A"));
        assert!(session.mark_seen("shop", "exp1", "B"));
        assert!(session.mark_seen("shop", "exp1", "A"));
        assert!(!session.mark_seen("shop", "exp1", "A"));

        assert_eq!(session.selections["shop"]["exp1"], vec!["B", "A"]);
        assert_eq!(session.last_seen("shop", "exp1"), Some("A"));
        assert_eq!(session.last_seen("shop", "exp2"), None);
    }

    #[test]
    fn test_metric_value_switches_to_float() {
        let v = MetricValue::Int(2).add(MetricValue::Int(3));
        assert_eq!(v, MetricValue::Int(5));
        let v = v.add(MetricValue::from_weight(0.5));
        assert_eq!(v, MetricValue::Float(5.5));
        assert_eq!(v.add(MetricValue::Int(1)), MetricValue::Float(6.5));
        assert_eq!(MetricValue::parse("7"), Some(MetricValue::Int(7)));
        assert_eq!(MetricValue::parse("1.25"), Some(MetricValue::Float(1.25)));
    }

    #[test]
    fn test_sample_timestamp_must_be_numeric() {
        let sample: MetricSample =
            serde_json::from_str(r#"{"ts":"soon","name":"click"}"#).unwrap();
        assert_eq!(sample.timestamp(), None);

        let sample: MetricSample = serde_json::from_str(r#"{"ts":12,"name":"click"}"#).unwrap();
        assert_eq!(sample.timestamp(), Some(12));
    }

    #[test]
    fn test_batch_wire_shape_is_preserved() {
        let raw = r#"{"site":"shop","experiment":"exp1","variant":"B","entries":[{"ts":1,"name":"exposure"},{"ts":2,"name":"click","payload":{"x":1}}]}"#;
        let batch: MetricsBatch = serde_json::from_str(raw).unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert_eq!(serde_json::to_string(&batch).unwrap(), raw);
    }

    #[test]
    fn test_site_parses_select_field() {
        let site: Site = serde_json::from_str(
            r#"{"name":"shop","select":"X","experiments":[{"id":"exp1","variants":[{"name":"X","probability":0.5}]}]}"#,
        )
        .unwrap();
        assert_eq!(site.select_override.as_deref(), Some("X"));
        assert!(site.experiments[0].is_active());
        assert!(site.experiment("exp1").unwrap().has_variant("X"));
    }
}
