/// Dimensionality of the coordinate space.
pub const DIMENSIONS: usize = 3;

/// Lower bound of every axis of the default coordinate space.
pub const SPACE_MIN: f64 = -1.0;

/// Upper bound of every axis of the default coordinate space.
pub const SPACE_MAX: f64 = 1.0;

/// Candidates farther than `radius * FIELD_CUTOFF` from a field center are
/// never part of an ensemble.
pub const FIELD_CUTOFF: f64 = 1.5;

/// Weight of internal agreement in the coherence level. External agreement
/// takes the remainder.
pub const INTERNAL_COHERENCE_WEIGHT: f64 = 0.6;

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-10;

/// Activation rises by this much on every access.
pub const ACCESS_BOOST: f64 = 0.35;

/// Fraction of the gap to resting level removed per update cycle.
pub const ACTIVATION_LEAK: f64 = 0.5;

/// Default resting activation for freshly stored nodes.
pub const RESTING_LEVEL: f64 = 0.1;

/// Default firing threshold for freshly stored nodes.
pub const FIRING_THRESHOLD: f64 = 0.8;

/// Number of access timestamps kept per node.
pub const ACCESS_HISTORY_LEN: usize = 32;
