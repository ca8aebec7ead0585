use crate::batch::Batch;
use crate::error::{EngineError, Result};
use crate::evaluator::Evaluator;
use crate::expr::{Expr, Var};
use crate::model::Model;
use crate::network::Network;
use crate::sampler::{Bounds, Sampler};
use crate::state_space::StateSpace;
use crate::traits::Operation;

/// Euler–Maruyama stepper over the current batch.
///
/// Every sampled variable moves by one discretized increment
/// `X + μ(X) dt + Σ_k b_k(X) √dt Z_k`, using the shock draws already in the
/// batch. The model then redraws the shocks for the next step.
/// Optional bounds clamp the stepped values back into the sampling domain.
#[derive(Debug, Clone, Default)]
pub struct EulerMaruyama {
    bounds: Vec<(Var, Bounds)>,
}

impl EulerMaruyama {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamps stepped values to the bounds of `sampler`.
    pub fn clamped_to(sampler: &Sampler) -> Self {
        Self {
            bounds: sampler.bounds().to_vec(),
        }
    }

    pub fn bounds(&self) -> &[(Var, Bounds)] {
        &self.bounds
    }

    /// Next values of every sampled variable. The batch is left untouched.
    pub(crate) fn advance(
        &self,
        space: &StateSpace,
        networks: &[Network],
        batch: &Batch,
        dt: f64,
    ) -> Result<Vec<Option<Vec<f64>>>> {
        if batch.is_empty() {
            return Err(EngineError::Config(
                "cannot step an empty batch; sample first".to_string(),
            ));
        }
        let increments: Vec<(Var, Expr)> = batch
            .sampled()
            .map(|var| space.increment(var, dt).map(|dx| (var, dx)))
            .collect::<Result<_>>()?;

        let mut ev = Evaluator::new(space, networks, batch);
        let mut next = vec![None; space.variable_count()];
        for (var, dx) in &increments {
            let step = ev.evaluate(dx)?;
            let bounds = self.bounds.iter().find(|(v, _)| v == var).map(|(_, b)| *b);
            let mut values = Vec::with_capacity(batch.size());
            for (element, (x, d)) in batch
                .values(*var)
                .unwrap_or_default()
                .iter()
                .zip(step.iter())
                .enumerate()
            {
                let moved = x + d;
                if !moved.is_finite() {
                    return Err(EngineError::Numerical(format!(
                        "Euler-Maruyama step of {var} is {moved} at batch element {element}"
                    )));
                }
                values.push(bounds.map_or(moved, |b| b.clamp(moved)));
            }
            next[var.index()] = Some(values);
        }
        Ok(next)
    }
}

impl Operation for EulerMaruyama {
    fn name(&self) -> &str {
        "euler_maruyama"
    }

    fn run(&mut self, model: &mut Model) -> Result<()> {
        model.simulate_step(self)
    }
}

#[cfg(test)]
mod tests {
    use super::EulerMaruyama;
    use crate::batch::Batch;
    use crate::expr::{Expr, Var};
    use crate::sampler::Sampler;
    use crate::state_space::StateSpace;

    fn space() -> (StateSpace, Var) {
        let mut space = StateSpace::new();
        let x = space.declare_variables(1).expect("declare")[0];
        let z = space.declare_shocks(1).expect("shocks")[0];
        space
            .assign_dynamics(x, Expr::constant(1.0), vec![(Expr::constant(2.0), z)])
            .expect("assign");
        (space, x)
    }

    #[test]
    fn steps_with_drift_dt_and_root_dt_shock() {
        let (space, x) = space();
        let batch = Batch::from_parts(2, vec![Some(vec![0.0, 1.0])], vec![vec![1.0, -0.5]])
            .expect("batch");
        let next = EulerMaruyama::new()
            .advance(&space, &[], &batch, 0.25)
            .expect("step");
        let values = next[x.index()].as_ref().expect("stepped");
        // 0 + 0.25 + 2 * 0.5 * 1.0, 1 + 0.25 + 2 * 0.5 * -0.5
        assert!((values[0] - 1.25).abs() < 1e-12);
        assert!((values[1] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn clamps_to_sampler_bounds() {
        let (space, x) = space();
        let sampler = Sampler::new([(x, [0.0, 1.0])]).expect("sampler");
        let batch = Batch::from_parts(1, vec![Some(vec![0.9])], vec![vec![3.0]]).expect("batch");
        let next = EulerMaruyama::clamped_to(&sampler)
            .advance(&space, &[], &batch, 1.0)
            .expect("step");
        assert_eq!(next[x.index()].as_deref(), Some(&[1.0][..]));
    }

    #[test]
    fn empty_batch_is_rejected() {
        let (space, _) = space();
        let batch = Batch::empty(1, 1);
        assert!(EulerMaruyama::new().advance(&space, &[], &batch, 0.1).is_err());
    }
}
