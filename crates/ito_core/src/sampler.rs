//! Monte-Carlo draws of state values within bounds.

use crate::batch::Batch;
use crate::error::{EngineError, Result};
use crate::expr::Var;
use crate::model::Model;
use crate::traits::Operation;
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

/// Closed sampling interval `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    lo: f64,
    hi: f64,
}

impl Bounds {
    pub fn new(lo: f64, hi: f64) -> Result<Self> {
        if !lo.is_finite() || !hi.is_finite() {
            return Err(EngineError::Config(format!(
                "bounds must be finite, got [{lo}, {hi}]"
            )));
        }
        if lo >= hi {
            return Err(EngineError::Config(format!(
                "lower bound must be below upper bound, got [{lo}, {hi}]"
            )));
        }
        if !(hi - lo).is_finite() {
            return Err(EngineError::Config(format!(
                "width of bounds [{lo}, {hi}] overflows"
            )));
        }
        Ok(Self { lo, hi })
    }

    pub fn lo(&self) -> f64 {
        self.lo
    }

    pub fn hi(&self) -> f64 {
        self.hi
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lo && value <= self.hi
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.lo, self.hi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingDistribution {
    #[default]
    Uniform,
    /// Uniform in `ln x`. Needs a positive lower bound.
    LogUniform,
}

#[derive(Debug, Clone)]
pub struct Sampler {
    bounds: Vec<(Var, Bounds)>,
    distribution: SamplingDistribution,
}

impl Sampler {
    pub fn new<I>(bounds: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Var, [f64; 2])>,
    {
        let mut checked: Vec<(Var, Bounds)> = Vec::new();
        for (var, [lo, hi]) in bounds {
            if checked.iter().any(|(v, _)| *v == var) {
                return Err(EngineError::Config(format!("{var} has bounds declared twice")));
            }
            let bounds = Bounds::new(lo, hi)
                .map_err(|e| EngineError::Config(format!("{var}: {e}")))?;
            checked.push((var, bounds));
        }
        Ok(Self {
            bounds: checked,
            distribution: SamplingDistribution::default(),
        })
    }

    pub fn with_distribution(mut self, distribution: SamplingDistribution) -> Result<Self> {
        if distribution == SamplingDistribution::LogUniform {
            if let Some((var, b)) = self.bounds.iter().find(|(_, b)| b.lo <= 0.0) {
                return Err(EngineError::Config(format!(
                    "log-uniform sampling of {var} needs a positive lower bound, got {}",
                    b.lo
                )));
            }
            if let Some((var, b)) = self
                .bounds
                .iter()
                .find(|(_, b)| !(b.hi.ln() - b.lo.ln()).is_finite())
            {
                return Err(EngineError::Config(format!(
                    "log-uniform sampling of {var} has an unbounded log width on [{}, {}]",
                    b.lo, b.hi
                )));
            }
        }
        self.distribution = distribution;
        Ok(self)
    }

    pub fn bounds(&self) -> &[(Var, Bounds)] {
        &self.bounds
    }

    pub fn bounds_of(&self, var: Var) -> Option<Bounds> {
        self.bounds.iter().find(|(v, _)| *v == var).map(|(_, b)| *b)
    }

    pub fn distribution(&self) -> SamplingDistribution {
        self.distribution
    }

    /// Draws a full batch: bounded variables from their intervals, every shock
    /// from N(0, 1). Nothing is drawn unless all inputs are valid.
    pub(crate) fn draw<R: Rng>(
        &self,
        rng: &mut R,
        batch_size: usize,
        variables: usize,
        shocks: usize,
    ) -> Result<Batch> {
        if batch_size == 0 {
            return Err(EngineError::Config("batch size must be positive".to_string()));
        }
        if let Some((var, _)) = self.bounds.iter().find(|(v, _)| v.index() >= variables) {
            return Err(EngineError::UndeclaredVariable {
                index: var.index(),
                declared: variables,
            });
        }

        let mut values = vec![None; variables];
        for (var, bounds) in &self.bounds {
            let column: Vec<f64> = match self.distribution {
                SamplingDistribution::Uniform => {
                    let dist = Uniform::new_inclusive(bounds.lo, bounds.hi);
                    (0..batch_size)
                        .map(|_| bounds.clamp(dist.sample(rng)))
                        .collect()
                }
                SamplingDistribution::LogUniform => {
                    let dist = Uniform::new_inclusive(bounds.lo.ln(), bounds.hi.ln());
                    (0..batch_size)
                        .map(|_| bounds.clamp(dist.sample(rng).exp()))
                        .collect()
                }
            };
            values[var.index()] = Some(column);
        }

        let shocks = draw_shocks(rng, shocks, batch_size)?;
        Batch::from_parts(batch_size, values, shocks)
    }
}

/// Independent standard-normal draws, `size` per shock.
pub(crate) fn draw_shocks<R: Rng>(
    rng: &mut R,
    shocks: usize,
    size: usize,
) -> Result<Vec<Vec<f64>>> {
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| EngineError::Numerical(format!("standard normal: {e}")))?;
    Ok((0..shocks)
        .map(|_| (0..size).map(|_| normal.sample(rng)).collect())
        .collect())
}

impl Operation for Sampler {
    fn name(&self) -> &str {
        "sample"
    }

    fn run(&mut self, model: &mut Model) -> Result<()> {
        model.sample(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{Bounds, Sampler, SamplingDistribution};
    use crate::expr::{Shock, Var};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn rejects_degenerate_and_duplicate_bounds() {
        assert!(Bounds::new(1.0, 1.0).is_err());
        assert!(Bounds::new(2.0, 1.0).is_err());
        assert!(Bounds::new(f64::NEG_INFINITY, 1.0).is_err());
        assert!(Sampler::new([(Var(0), [0.0, 1.0]), (Var(0), [0.0, 2.0])]).is_err());
    }

    #[test]
    fn rejects_bounds_whose_width_overflows() {
        let wide = Bounds::new(-1e308, 1e308).expect_err("width overflows");
        assert!(format!("{wide}").contains("overflows"));
        assert!(Sampler::new([(Var(0), [-1e308, 1e308])]).is_err());

        let half = Sampler::new([(Var(0), [-1e308, 0.0])]).expect("finite width");
        let mut rng = StdRng::seed_from_u64(5);
        let batch = half.draw(&mut rng, 16, 1, 0).expect("draw");
        let x = batch.values(Var(0)).expect("sampled");
        assert!(x.iter().all(|v| (-1e308..=0.0).contains(v)));
    }

    #[test]
    fn draws_full_batches_within_bounds() {
        let sampler =
            Sampler::new([(Var(0), [1e-4, 100.0]), (Var(1), [-1.0, 1.0])]).expect("sampler");
        let mut rng = StdRng::seed_from_u64(3);
        for size in [1, 128, 10_000] {
            let batch = sampler.draw(&mut rng, size, 3, 2).expect("draw");
            assert_eq!(batch.size(), size);
            let x = batch.values(Var(0)).expect("x0 sampled");
            assert_eq!(x.len(), size);
            assert!(x.iter().all(|v| (1e-4..=100.0).contains(v)));
            assert!(batch.values(Var(2)).is_none());
            assert_eq!(batch.shock(Shock(1)).map(<[f64]>::len), Some(size));
        }
    }

    #[test]
    fn log_uniform_requires_positive_lower_bound() {
        let negative = Sampler::new([(Var(0), [-1.0, 1.0])]).expect("sampler");
        assert!(negative.with_distribution(SamplingDistribution::LogUniform).is_err());

        let sampler = Sampler::new([(Var(0), [1e-3, 1e3])])
            .and_then(|s| s.with_distribution(SamplingDistribution::LogUniform))
            .expect("sampler");
        let mut rng = StdRng::seed_from_u64(11);
        let batch = sampler.draw(&mut rng, 4000, 1, 0).expect("draw");
        let x = batch.values(Var(0)).expect("sampled");
        assert!(x.iter().all(|v| (1e-3..=1e3).contains(v)));
        // median of a log-uniform on [1e-3, 1e3] is 1
        let below = x.iter().filter(|v| **v < 1.0).count() as f64 / x.len() as f64;
        assert!((below - 0.5).abs() < 0.05);
    }

    #[test]
    fn zero_batch_size_and_undeclared_variable_fail_before_drawing() {
        let sampler = Sampler::new([(Var(4), [0.0, 1.0])]).expect("sampler");
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sampler.draw(&mut rng, 0, 5, 0).is_err());
        assert!(sampler.draw(&mut rng, 8, 2, 0).is_err());
    }
}
