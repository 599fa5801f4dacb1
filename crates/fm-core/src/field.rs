//! Probability fields: the spatial region one query searches.
//!
//! A field is a center and a radius in coordinate space, optionally
//! stretched per axis. Discovery queries morph the field with a seeded
//! random walk; precision queries narrow it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::FieldConfig;
use crate::constants::FIELD_CUTOFF;
use crate::coords::{Coord3, SpaceBounds};
use crate::query::{QueryContext, QueryRequest};
use crate::record::Signature;

/// Per-axis stretch applied when measuring distance from the center.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub stretch: [f64; 3],
}

impl Distortion {
    /// Stretch factors must be positive and finite; anything else becomes 1.
    pub fn sanitized(self) -> Self {
        Self {
            stretch: self
                .stretch
                .map(|s| if s.is_finite() && s > 0.0 { s } else { 1.0 }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityField {
    pub center: Coord3,
    pub radius: f64,
    #[serde(default)]
    pub distortion: Option<Distortion>,
    pub dominant_cap: usize,
}

impl ProbabilityField {
    /// Distance from the center, honoring the distortion.
    pub fn distance_to(&self, p: Coord3) -> f64 {
        match self.distortion {
            Some(d) => self.center.stretched_distance(p, d.stretch),
            None => self.center.distance(p),
        }
    }

    /// Outer limit beyond which a point never joins an ensemble.
    pub fn cutoff(&self) -> f64 {
        self.radius * FIELD_CUTOFF
    }

    pub fn admits(&self, p: Coord3) -> bool {
        self.distance_to(p) <= self.cutoff()
    }
}

/// Deterministic position for a signature.
///
/// The category is hashed (UUIDv5) into an anchor point spread across the
/// space; strength and complexity offset the point slightly along x and y
/// so records of one category form a tight cluster around their anchor.
pub fn signature_anchor(signature: &Signature, bounds: &SpaceBounds, config: &FieldConfig) -> Coord3 {
    let anchor = category_anchor(&signature.category, bounds, config.category_spread);
    let half = (bounds.max - bounds.min) / 2.0;
    let offset = Coord3::new(
        config.signature_offset * (signature.strength - 0.5) * half,
        config.signature_offset * (signature.complexity - 0.5) * half,
        0.0,
    );
    bounds.clamp(anchor + offset)
}

fn category_anchor(category: &str, bounds: &SpaceBounds, spread: f64) -> Coord3 {
    let hash = Uuid::new_v5(&Uuid::NAMESPACE_OID, category.as_bytes());
    let b = hash.as_bytes();
    let unit = |i: usize| {
        let word = u32::from_be_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        word as f64 / u32::MAX as f64
    };
    let mid = (bounds.min + bounds.max) / 2.0;
    let half = (bounds.max - bounds.min) / 2.0;
    let spread = spread.clamp(0.0, 1.0);
    let axis = |u: f64| mid + (u * 2.0 - 1.0) * spread * half;
    Coord3::new(axis(unit(0)), axis(unit(4)), axis(unit(8)))
}

pub struct FieldGenerator {
    bounds: SpaceBounds,
    config: FieldConfig,
}

impl FieldGenerator {
    pub fn new(bounds: SpaceBounds, config: FieldConfig) -> Self {
        Self { bounds, config }
    }

    pub fn config(&self) -> &FieldConfig {
        &self.config
    }

    fn max_radius(&self) -> f64 {
        self.config.max_radius.min(self.bounds.diagonal())
    }

    fn clamp_radius(&self, r: f64) -> f64 {
        if !r.is_finite() {
            return self.config.base_radius;
        }
        r.clamp(self.config.min_radius, self.max_radius())
    }

    /// Build the field for `request`, nudged by `context`.
    pub fn generate_field(&self, request: &QueryRequest, context: &QueryContext) -> ProbabilityField {
        self.generate_field_around(request, context, self.base_center(request))
    }

    /// Like [`generate_field`](Self::generate_field), but starting from
    /// `base` instead of the request's own position.
    pub fn generate_field_around(
        &self,
        request: &QueryRequest,
        context: &QueryContext,
        base: Coord3,
    ) -> ProbabilityField {
        let category = request.effective_category();
        let mut center = base;

        if let Some(cat) = category
            && let Some(reinforced) = Coord3::centroid(&context.successful_centers(cat))
        {
            let mut pull = self.config.context_pull;
            if context.is_active(cat) {
                pull += self.config.active_category_pull;
            }
            center = center.lerp(reinforced, pull);
        }

        let radius = self.config.base_radius
            * (1.0 + self.config.exploration_gain * request.exploration)
            * (1.0 - self.config.confidence_shrink * request.confidence);

        ProbabilityField {
            center: self.bounds.clamp(center),
            radius: self.clamp_radius(radius),
            distortion: request.distortion.map(Distortion::sanitized),
            dominant_cap: self.config.dominant_cap,
        }
    }

    fn base_center(&self, request: &QueryRequest) -> Coord3 {
        if let Some(embedding) = request.embedding.as_deref().filter(|e| !e.is_empty()) {
            let mut v = [0.0; 3];
            for (slot, value) in v.iter_mut().zip(embedding) {
                *slot = *value;
            }
            let unit = Coord3::from_array(v).normalize();
            let mid = (self.bounds.min + self.bounds.max) / 2.0;
            let half = (self.bounds.max - self.bounds.min) / 2.0;
            return Coord3::new(mid, mid, mid) + unit * half;
        }
        if let Some(center) = request.center {
            return center;
        }
        let signature = match (&request.signature, request.effective_category()) {
            (Some(sig), _) => sig.clone().clamped(),
            (None, Some(cat)) => Signature::new(cat, 0.5, 0.5),
            (None, None) => {
                let mid = (self.bounds.min + self.bounds.max) / 2.0;
                return Coord3::new(mid, mid, mid);
            }
        };
        signature_anchor(&signature, &self.bounds, &self.config)
    }

    /// Random-walk the center by at most `step` and grow the radius.
    /// Repeated calls keep drifting from wherever the field currently is.
    pub fn morph_field(&self, field: &mut ProbabilityField, step: f64, rng: &mut impl Rng) {
        let delta = Coord3::random_step(step.max(0.0), rng);
        field.center = self.bounds.clamp(field.center + delta);
        field.radius = self.clamp_radius(field.radius * (1.0 + self.config.morph_radius_growth));
    }

    /// Shrink the radius by `factor` (precision mode).
    pub fn narrow(&self, field: &ProbabilityField, factor: f64) -> ProbabilityField {
        ProbabilityField {
            radius: self.clamp_radius(field.radius * factor.clamp(0.0, 1.0)),
            ..field.clone()
        }
    }

    /// Grow the radius by `factor` (uncertainty response, hybrid over-fetch).
    pub fn widen(&self, field: &ProbabilityField, factor: f64) -> ProbabilityField {
        ProbabilityField {
            radius: self.clamp_radius(field.radius * factor.max(1.0)),
            ..field.clone()
        }
    }
}
