//! Synthetic noise injection.
//!
//! A [`NoiseLevel`] is a small discrete label. Level `n` adds zero-mean
//! Gaussian noise with standard deviation `n * SIGMA_STEP` to every channel of
//! every pixel, so level 0 leaves the image untouched.

use std::fmt;

use ndarray::Array3;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standard deviation added per level, in normalized intensity units.
pub const SIGMA_STEP: f32 = 5.0 / 255.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NoiseError {
    #[error("noise level {0} is outside the supported range 0..={max}", max = NoiseLevel::MAX)]
    InvalidLevel(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct NoiseLevel(u8);

impl NoiseLevel {
    pub const MAX: u8 = 9;
    /// Number of distinct levels, which is also the classifier's output width.
    pub const COUNT: usize = Self::MAX as usize + 1;

    pub fn new(level: u8) -> Result<Self, NoiseError> {
        if level > Self::MAX {
            return Err(NoiseError::InvalidLevel(level));
        }
        Ok(Self(level))
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.random_range(0..=Self::MAX))
    }

    /// Every valid level in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..=Self::MAX).map(Self)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn sigma(self) -> f32 {
        self.0 as f32 * SIGMA_STEP
    }
}

impl TryFrom<u8> for NoiseLevel {
    type Error = NoiseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NoiseLevel> for u8 {
    fn from(level: NoiseLevel) -> Self {
        level.0
    }
}

impl fmt::Display for NoiseLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns a copy of `clean` corrupted at `level`.
///
/// The output has the same shape as the input and stays within `[0, 1]`.
pub fn synthesize<R: Rng + ?Sized>(clean: &Array3<f32>, level: NoiseLevel, rng: &mut R) -> Array3<f32> {
    if level.value() == 0 {
        return clean.clone();
    }

    // sigma is strictly positive here, so the distribution is always valid
    let normal = match Normal::new(0.0f32, level.sigma()) {
        Ok(normal) => normal,
        Err(_) => return clean.clone(),
    };

    clean.mapv(|pixel| (pixel + normal.sample(rng)).clamp(0.0, 1.0))
}

/// Like [`synthesize`] but takes a raw level, rejecting values out of range.
pub fn synthesize_raw<R: Rng + ?Sized>(
    clean: &Array3<f32>,
    level: u8,
    rng: &mut R,
) -> Result<Array3<f32>, NoiseError> {
    Ok(synthesize(clean, NoiseLevel::new(level)?, rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn gray(height: usize, width: usize) -> Array3<f32> {
        Array3::from_elem((height, width, 3), 0.5)
    }

    #[test]
    fn keeps_dimensions() {
        let mut rng = StdRng::seed_from_u64(7);
        let clean = gray(17, 23);

        for level in NoiseLevel::all() {
            let noised = synthesize(&clean, level, &mut rng);
            assert_eq!(noised.dim(), clean.dim());
        }
    }

    #[test]
    fn level_zero_is_identity() {
        let mut rng = StdRng::seed_from_u64(1);
        let clean = gray(8, 8);
        let level = NoiseLevel::new(0).unwrap();

        assert_eq!(synthesize(&clean, level, &mut rng), clean);
    }

    #[test]
    fn output_stays_in_unit_range() {
        let mut rng = StdRng::seed_from_u64(3);
        let clean = gray(32, 32);
        let noised = synthesize(&clean, NoiseLevel::new(9).unwrap(), &mut rng);

        assert!(noised.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(noised.iter().any(|v| (*v - 0.5).abs() > 1e-3));
    }

    #[test]
    fn higher_levels_spread_more() {
        let mut rng = StdRng::seed_from_u64(11);
        let clean = gray(64, 64);

        let spread = |level: u8, rng: &mut StdRng| {
            let noised = synthesize(&clean, NoiseLevel::new(level).unwrap(), rng);
            noised.iter().map(|v| (v - 0.5).powi(2)).sum::<f32>() / noised.len() as f32
        };

        let low = spread(1, &mut rng);
        let high = spread(8, &mut rng);
        assert!(high > low * 4.0, "low {low}, high {high}");
    }

    #[test]
    fn same_seed_same_noise() {
        let clean = gray(16, 16);
        let level = NoiseLevel::new(5).unwrap();

        let a = synthesize(&clean, level, &mut StdRng::seed_from_u64(42));
        let b = synthesize(&clean, level, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_invalid_level() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(NoiseLevel::new(10), Err(NoiseError::InvalidLevel(10)));
        assert!(synthesize_raw(&gray(4, 4), 200, &mut rng).is_err());
    }

    #[test]
    fn random_levels_are_in_range() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..1000 {
            assert!(NoiseLevel::random(&mut rng).value() <= NoiseLevel::MAX);
        }
    }
}
