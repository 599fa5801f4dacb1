use std::ops::{Add, Mul, Sub};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{EPSILON, SPACE_MAX, SPACE_MIN};

/// A point in the bounded 3-dimensional retrieval space.
///
/// Coordinates carry no unit; the only invariant is that stored positions
/// lie inside the configured [`SpaceBounds`].
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Coord3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl PartialEq for Coord3 {
    fn eq(&self, other: &Self) -> bool {
        (self.x - other.x).abs() < EPSILON
            && (self.y - other.y).abs() < EPSILON
            && (self.z - other.z).abs() < EPSILON
    }
}

impl Coord3 {
    pub const ORIGIN: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn from_array(a: [f64; 3]) -> Self {
        Self::new(a[0], a[1], a[2])
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn norm(self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Euclidean distance.
    pub fn distance(self, other: Self) -> f64 {
        (self - other).norm()
    }

    /// Distance with each axis scaled by `stretch` before measuring.
    /// A stretch above 1 makes the field narrower along that axis.
    pub fn stretched_distance(self, other: Self, stretch: [f64; 3]) -> f64 {
        let d = self - other;
        Self::new(d.x * stretch[0], d.y * stretch[1], d.z * stretch[2]).norm()
    }

    /// L2-normalize. Returns the origin for near-zero vectors.
    pub fn normalize(self) -> Self {
        let n = self.norm();
        if n < EPSILON {
            return Self::ORIGIN;
        }
        self * (1.0 / n)
    }

    /// Linear interpolation toward `other` by `t` in [0, 1].
    pub fn lerp(self, other: Self, t: f64) -> Self {
        let t = t.clamp(0.0, 1.0);
        self + (other - self) * t
    }

    /// Move toward `target` by at most `max_step`.
    pub fn step_toward(self, target: Self, max_step: f64) -> Self {
        let delta = target - self;
        let dist = delta.norm();
        if dist <= max_step || dist < EPSILON {
            return target;
        }
        self + delta * (max_step / dist)
    }

    /// Unweighted centroid. `None` for an empty slice.
    pub fn centroid(points: &[Self]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let sum = points.iter().fold(Self::ORIGIN, |acc, p| acc + *p);
        Some(sum * (1.0 / points.len() as f64))
    }

    /// Uniformly random direction scaled to a length in `[0, max_len]`.
    pub fn random_step(max_len: f64, rng: &mut impl Rng) -> Self {
        // Gaussian components give an isotropic direction.
        let dir = Self::new(gaussian(rng), gaussian(rng), gaussian(rng)).normalize();
        let len = max_len * rng.random::<f64>();
        dir * len
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Coord3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Coord3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Coord3 {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Axis-aligned bounds of the coordinate space. The same bounds apply to
/// every axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for SpaceBounds {
    fn default() -> Self {
        Self {
            min: SPACE_MIN,
            max: SPACE_MAX,
        }
    }
}

impl SpaceBounds {
    pub fn contains(&self, p: Coord3) -> bool {
        p.is_finite()
            && [p.x, p.y, p.z]
                .iter()
                .all(|v| *v >= self.min && *v <= self.max)
    }

    /// Clamp each axis into range. Non-finite components collapse to the
    /// midpoint of the axis.
    pub fn clamp(&self, p: Coord3) -> Coord3 {
        let mid = (self.min + self.max) / 2.0;
        let c = |v: f64| {
            if v.is_finite() {
                v.clamp(self.min, self.max)
            } else {
                mid
            }
        };
        Coord3::new(c(p.x), c(p.y), c(p.z))
    }

    /// Length of the space diagonal; the largest possible distance.
    pub fn diagonal(&self) -> f64 {
        (self.max - self.min) * (3.0f64).sqrt()
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min < self.max
    }
}

/// Box–Muller standard normal sample.
fn gaussian(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    #[test]
    fn test_distance() {
        let a = Coord3::new(0.0, 0.0, 0.0);
        let b = Coord3::new(1.0, 2.0, 2.0);
        assert_relative_eq!(a.distance(b), 3.0);
    }

    #[test]
    fn test_stretched_distance_weights_axes() {
        let a = Coord3::ORIGIN;
        let b = Coord3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(a.stretched_distance(b, [2.0, 1.0, 1.0]), 2.0);
        assert_relative_eq!(a.stretched_distance(b, [1.0, 5.0, 5.0]), 1.0);
    }

    #[test]
    fn test_normalize() {
        let v = Coord3::new(3.0, 0.0, 4.0).normalize();
        assert_relative_eq!(v.norm(), 1.0, epsilon = 1e-12);
        assert_eq!(Coord3::ORIGIN.normalize(), Coord3::ORIGIN);
    }

    #[test]
    fn test_step_toward_is_bounded() {
        let a = Coord3::ORIGIN;
        let b = Coord3::new(1.0, 0.0, 0.0);
        let moved = a.step_toward(b, 0.1);
        assert_relative_eq!(moved.x, 0.1, epsilon = 1e-12);
        // Close enough: lands exactly on target
        assert_eq!(a.step_toward(Coord3::new(0.05, 0.0, 0.0), 0.1), Coord3::new(0.05, 0.0, 0.0));
    }

    #[test]
    fn test_centroid() {
        let c = Coord3::centroid(&[Coord3::new(1.0, 0.0, 0.0), Coord3::new(-1.0, 2.0, 0.0)]).unwrap();
        assert_eq!(c, Coord3::new(0.0, 1.0, 0.0));
        assert!(Coord3::centroid(&[]).is_none());
    }

    #[test]
    fn test_random_step_within_length() {
        let mut rng = rng();
        for _ in 0..200 {
            let s = Coord3::random_step(0.25, &mut rng);
            assert!(s.norm() <= 0.25 + 1e-9, "step too long: {}", s.norm());
        }
    }

    #[test]
    fn test_bounds_clamp() {
        let bounds = SpaceBounds::default();
        let p = bounds.clamp(Coord3::new(2.0, -3.0, f64::NAN));
        assert_eq!(p, Coord3::new(1.0, -1.0, 0.0));
        assert!(bounds.contains(p));
        assert!(!bounds.contains(Coord3::new(1.5, 0.0, 0.0)));
    }

    #[test]
    fn test_diagonal() {
        let bounds = SpaceBounds::default();
        assert_relative_eq!(bounds.diagonal(), 2.0 * 3.0f64.sqrt());
    }
}
