//! Engine configuration.
//!
//! Every section is `#[serde(default)]`, so a TOML file only needs the keys
//! it overrides:
//!
//! ```toml
//! seed = 7
//!
//! [field]
//! base_radius = 0.5
//!
//! [emergence.idle]
//! idle_interval_ms = 60000
//!
//! [ensemble]
//! conflicts = [["deprecated", "recommended"]]
//! ```

use serde::{Deserialize, Serialize};

use crate::coords::SpaceBounds;
use crate::error::{FieldError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMemoryConfig {
    pub space: SpaceBounds,
    pub store: StoreConfig,
    pub field: FieldConfig,
    pub ensemble: EnsembleConfig,
    pub emergence: EmergenceConfig,
    pub adaptation: AdaptationConfig,
    pub query: QueryConfig,
    pub metrics: MetricsConfig,
    /// Seed for the engine's pseudo-random source. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl FieldMemoryConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| FieldError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| FieldError::Config(e.to_string()))
    }

    /// Reject settings that would break engine invariants.
    pub fn validate(&self) -> Result<()> {
        if !self.space.is_valid() {
            return Err(FieldError::Config(format!(
                "space bounds must be finite with min < max, got [{}, {}]",
                self.space.min, self.space.max
            )));
        }
        let f = &self.field;
        if !(f.min_radius > 0.0 && f.min_radius <= f.base_radius && f.base_radius <= f.max_radius) {
            return Err(FieldError::Config(
                "field radii must satisfy 0 < min_radius <= base_radius <= max_radius".into(),
            ));
        }
        if f.dominant_cap == 0 {
            return Err(FieldError::Config("field.dominant_cap must be at least 1".into()));
        }
        if self.ensemble.sigma_fraction <= 0.0 || self.ensemble.interference_radius <= 0.0 {
            return Err(FieldError::Config(
                "ensemble.sigma_fraction and ensemble.interference_radius must be positive".into(),
            ));
        }
        let a = &self.adaptation;
        for (name, v) in [
            ("success_increment", a.success_increment),
            ("uncertainty_decay", a.uncertainty_decay),
            ("hebbian_rate", a.hebbian_rate),
            ("resonance_decay", a.resonance_decay),
            ("confidence_floor", a.confidence_floor),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(FieldError::Config(format!("adaptation.{name} must be in [0, 1], got {v}")));
            }
        }
        if a.activation_cycle_ms == 0 {
            return Err(FieldError::Config("adaptation.activation_cycle_ms must be positive".into()));
        }
        if a.drift_step < 0.0 {
            return Err(FieldError::Config("adaptation.drift_step must not be negative".into()));
        }
        if self.store.access_history_len == 0 {
            return Err(FieldError::Config("store.access_history_len must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.metrics.ema_alpha) || self.metrics.ema_alpha == 0.0 {
            return Err(FieldError::Config("metrics.ema_alpha must be in (0, 1]".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Access timestamps kept per node.
    pub access_history_len: usize,
    /// Lowest starting confidence a derived record receives.
    pub initial_confidence_floor: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            access_history_len: crate::constants::ACCESS_HISTORY_LEN,
            initial_confidence_floor: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    pub base_radius: f64,
    pub min_radius: f64,
    pub max_radius: f64,
    /// Radius multiplier per unit of exploration.
    pub exploration_gain: f64,
    /// Fraction of the radius removed at full confidence.
    pub confidence_shrink: f64,
    /// Pull toward recent successful centers of the same category.
    pub context_pull: f64,
    /// Extra pull when the category is currently active.
    pub active_category_pull: f64,
    /// Maximum center displacement per morph step.
    pub morph_step: f64,
    /// Relative radius growth per morph step.
    pub morph_radius_growth: f64,
    /// Radius multiplier applied for precision-mode tie-breaking.
    pub precision_narrowing: f64,
    /// Maximum number of dominant candidates per ensemble.
    pub dominant_cap: usize,
    /// Spread of category anchor points as a fraction of the space half-width.
    pub category_spread: f64,
    /// Offset applied for signature strength/complexity around the anchor.
    pub signature_offset: f64,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            base_radius: 0.35,
            min_radius: 0.02,
            max_radius: 2.0,
            exploration_gain: 1.5,
            confidence_shrink: 0.6,
            context_pull: 0.15,
            active_category_pull: 0.05,
            morph_step: 0.05,
            morph_radius_growth: 0.05,
            precision_narrowing: 0.5,
            dominant_cap: 5,
            category_spread: 0.8,
            signature_offset: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Gaussian sigma as a fraction of the field radius.
    pub sigma_fraction: f64,
    pub base_weight: f64,
    pub confidence_weight: f64,
    pub resonance_weight: f64,
    /// Candidates closer than this interfere.
    pub interference_radius: f64,
    /// Category pairs that cancel each other when close.
    pub conflicts: Vec<[String; 2]>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            sigma_fraction: 0.5,
            base_weight: 0.4,
            confidence_weight: 0.3,
            resonance_weight: 0.3,
            interference_radius: 0.25,
            conflicts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergenceConfig {
    /// Summed reinforcing magnitude a group must exceed.
    pub group_threshold: f64,
    /// Threshold multiplier in hybrid mode.
    pub hybrid_threshold_factor: f64,
    pub hybrid_max_insights: usize,
    pub max_insights: usize,
    pub idle: IdlePolicyConfig,
    pub cascade: CascadePolicyConfig,
    pub uncertainty: UncertaintyPolicyConfig,
    pub synthesis: SynthesisPolicyConfig,
}

impl Default for EmergenceConfig {
    fn default() -> Self {
        Self {
            group_threshold: 0.5,
            hybrid_threshold_factor: 1.5,
            hybrid_max_insights: 3,
            max_insights: 8,
            idle: IdlePolicyConfig::default(),
            cascade: CascadePolicyConfig::default(),
            uncertainty: UncertaintyPolicyConfig::default(),
            synthesis: SynthesisPolicyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdlePolicyConfig {
    pub enabled: bool,
    pub idle_interval_ms: u64,
}

impl Default for IdlePolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_interval_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadePolicyConfig {
    pub enabled: bool,
    pub max_depth: usize,
    /// Minimum co-retrieval strength for a neighbor to join a cascade.
    pub min_correlation: f64,
}

impl Default for CascadePolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 2,
            min_correlation: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UncertaintyPolicyConfig {
    pub enabled: bool,
    /// Coherence below this fires the policy.
    pub threshold: f64,
    pub widen_factor: f64,
}

impl Default for UncertaintyPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.3,
            widen_factor: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisPolicyConfig {
    pub enabled: bool,
}

impl Default for SynthesisPolicyConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    pub success_increment: f64,
    pub uncertainty_decay: f64,
    pub confidence_floor: f64,
    /// Request confidence at or above which an outcome counts as relevant.
    pub success_confidence: f64,
    pub hebbian_rate: f64,
    pub resonance_decay: f64,
    /// Outcomes after which an unrefreshed pair starts weakening.
    pub decay_window: u64,
    pub drift_step: f64,
    /// Co-retrievals needed before a neighbor pulls a node's position.
    pub min_co_retrievals: u32,
    /// Elapsed time that counts as one activation leak cycle.
    pub activation_cycle_ms: u64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            success_increment: 0.05,
            uncertainty_decay: 0.02,
            confidence_floor: 0.0,
            success_confidence: 0.7,
            hebbian_rate: 0.1,
            resonance_decay: 0.01,
            decay_window: 50,
            drift_step: 0.02,
            min_co_retrievals: 2,
            activation_cycle_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_max_results: usize,
    /// Declared-precision requests below this confidence fall back to hybrid.
    pub precision_min_confidence: f64,
    /// Auto requests at or above this exploration run in discovery mode.
    pub discovery_exploration: f64,
    /// Auto requests at or above this confidence (and low exploration) run
    /// in precision mode.
    pub auto_precision_confidence: f64,
    pub hybrid_radius_factor: f64,
    pub hybrid_overfetch: usize,
    pub morph_steps: usize,
    /// Recent queries remembered by a context.
    pub context_history: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_max_results: 10,
            precision_min_confidence: 0.3,
            discovery_exploration: 0.6,
            auto_precision_confidence: 0.8,
            hybrid_radius_factor: 2.0,
            hybrid_overfetch: 3,
            morph_steps: 1,
            context_history: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Smoothing factor of the rolling averages.
    pub ema_alpha: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { ema_alpha: 0.1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        FieldMemoryConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_overrides() {
        let cfg = FieldMemoryConfig::from_toml_str(
            r#"
            seed = 7

            [field]
            base_radius = 0.5

            [emergence.idle]
            idle_interval_ms = 1000

            [ensemble]
            conflicts = [["deprecated", "recommended"]]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.seed, Some(7));
        assert_eq!(cfg.field.base_radius, 0.5);
        assert_eq!(cfg.field.dominant_cap, 5);
        assert_eq!(cfg.emergence.idle.idle_interval_ms, 1000);
        assert!(cfg.emergence.idle.enabled);
        assert_eq!(cfg.ensemble.conflicts.len(), 1);
    }

    #[test]
    fn test_invalid_radius_rejected() {
        let err = FieldMemoryConfig::from_toml_str("[field]\nmin_radius = 0.0\n").unwrap_err();
        assert!(matches!(err, FieldError::Config(_)));
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let err = FieldMemoryConfig::from_toml_str("[space]\nmin = 1.0\nmax = -1.0\n").unwrap_err();
        assert!(err.to_string().contains("space bounds"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let cfg = FieldMemoryConfig::default();
        let text = cfg.to_toml_string().unwrap();
        let back = FieldMemoryConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.adaptation.decay_window, cfg.adaptation.decay_window);
    }
}
