//! Registry of state variables and the shocks that drive them.
//!
//! Every variable is an Itô process `dX = μ dt + Σ_k b_k dZ_k`. Its drift `μ`
//! and the coefficients `b_k` are expressions over the other declared variables
//! (and possibly approximators). Dynamics are assigned exactly once.

use crate::error::{EngineError, Result};
use crate::expr::{Expr, Shock, Var};

/// One diffusion coefficient and the shock it loads on.
#[derive(Debug, Clone)]
pub struct DiffusionTerm {
    pub coefficient: Expr,
    pub shock: Shock,
}

#[derive(Debug, Clone)]
pub struct Dynamics {
    pub drift: Expr,
    pub diffusion: Vec<DiffusionTerm>,
}

#[derive(Debug, Default)]
pub struct StateSpace {
    dynamics: Vec<Option<Dynamics>>,
    shocks: usize,
    launched: bool,
}

impl StateSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_variables(&mut self, count: usize) -> Result<Vec<Var>> {
        if self.launched {
            return Err(EngineError::AlreadyLaunched("declare variables"));
        }
        let start = self.dynamics.len();
        self.dynamics.resize_with(start + count, || None);
        Ok((start..start + count).map(Var).collect())
    }

    pub fn declare_shocks(&mut self, count: usize) -> Result<Vec<Shock>> {
        if self.launched {
            return Err(EngineError::AlreadyLaunched("declare shocks"));
        }
        let start = self.shocks;
        self.shocks += count;
        Ok((start..self.shocks).map(Shock).collect())
    }

    pub fn variable_count(&self) -> usize {
        self.dynamics.len()
    }

    pub fn shock_count(&self) -> usize {
        self.shocks
    }

    pub fn variables(&self) -> impl Iterator<Item = Var> {
        (0..self.dynamics.len()).map(Var)
    }

    pub fn is_launched(&self) -> bool {
        self.launched
    }

    fn check_variable(&self, var: Var) -> Result<()> {
        if var.index() >= self.dynamics.len() {
            return Err(EngineError::UndeclaredVariable {
                index: var.index(),
                declared: self.dynamics.len(),
            });
        }
        Ok(())
    }

    fn check_shock(&self, shock: Shock) -> Result<()> {
        if shock.index() >= self.shocks {
            return Err(EngineError::ShockOutOfRange {
                index: shock.index(),
                declared: self.shocks,
            });
        }
        Ok(())
    }

    /// Every variable and shock referenced by `expr` is declared here.
    pub fn check_declared(&self, expr: &Expr) -> Result<()> {
        for var in expr.variables() {
            self.check_variable(var)?;
        }
        for shock in expr.shocks() {
            self.check_shock(shock)?;
        }
        Ok(())
    }

    /// Binds `dX = drift dt + Σ coefficient_k dZ_k`.
    pub fn assign_dynamics(
        &mut self,
        var: Var,
        drift: Expr,
        diffusion: Vec<(Expr, Shock)>,
    ) -> Result<()> {
        if self.launched {
            return Err(EngineError::AlreadyLaunched("assign dynamics"));
        }
        self.check_variable(var)?;
        if self.dynamics[var.index()].is_some() {
            return Err(EngineError::DuplicateDynamics(var.to_string()));
        }

        let parts = std::iter::once(&drift).chain(diffusion.iter().map(|(c, _)| c));
        for expr in parts {
            self.check_declared(expr)?;
            if !expr.shocks().is_empty() {
                return Err(EngineError::InvalidGraph(format!(
                    "dynamics of {var} reference a shock inside a coefficient: {expr}"
                )));
            }
            if expr.contains_operator() {
                return Err(EngineError::InvalidGraph(format!(
                    "dynamics of {var} contain a differential operator: {expr}"
                )));
            }
        }
        for (_, shock) in &diffusion {
            self.check_shock(*shock)?;
        }

        let diffusion = diffusion
            .into_iter()
            .map(|(coefficient, shock)| DiffusionTerm { coefficient, shock })
            .collect();
        self.dynamics[var.index()] = Some(Dynamics { drift, diffusion });
        Ok(())
    }

    pub fn dynamics(&self, var: Var) -> Result<&Dynamics> {
        self.check_variable(var)?;
        self.dynamics[var.index()]
            .as_ref()
            .ok_or_else(|| EngineError::UnassignedDynamics(var.to_string()))
    }

    /// Freezes declarations. Every declared variable must have dynamics.
    pub fn launch(&mut self) -> Result<()> {
        if self.launched {
            return Err(EngineError::AlreadyLaunched("launch again"));
        }
        if let Some(var) = self.variables().find(|v| self.dynamics[v.index()].is_none()) {
            return Err(EngineError::UnassignedDynamics(var.to_string()));
        }
        self.launched = true;
        Ok(())
    }

    /// Discretized increment `drift dt + Σ b_k √dt Z_k` with `Z_k ~ N(0, 1)`.
    pub fn increment(&self, var: Var, dt: f64) -> Result<Expr> {
        let dynamics = self.dynamics(var)?;
        let root_dt = dt.sqrt();
        let mut terms = vec![&dynamics.drift * dt];
        terms.extend(
            dynamics
                .diffusion
                .iter()
                .map(|term| &term.coefficient * root_dt * term.shock.expr()),
        );
        Ok(Expr::sum(terms))
    }
}

#[cfg(test)]
mod tests {
    use super::StateSpace;
    use crate::error::EngineError;
    use crate::expr::{Expr, Shock, Var};

    fn assert_err_contains<T: std::fmt::Debug>(result: crate::error::Result<T>, needle: &str) {
        let err = result.expect_err("expected an error");
        let message = err.to_string();
        assert!(message.contains(needle), "'{message}' does not contain '{needle}'");
    }

    #[test]
    fn handles_are_sequential_across_calls() {
        let mut space = StateSpace::new();
        let a = space.declare_variables(2).expect("declare");
        let b = space.declare_variables(1).expect("declare");
        assert_eq!(a, vec![Var(0), Var(1)]);
        assert_eq!(b, vec![Var(2)]);
        assert_eq!(space.declare_shocks(2).expect("shocks"), vec![Shock(0), Shock(1)]);
    }

    #[test]
    fn dynamics_are_single_shot() {
        let mut space = StateSpace::new();
        let x = space.declare_variables(1).expect("declare")[0];
        let z = space.declare_shocks(1).expect("shocks")[0];
        space
            .assign_dynamics(x, x * 0.02, vec![(x * 0.2, z)])
            .expect("first assignment");
        let second = space.assign_dynamics(x, Expr::constant(0.0), vec![]);
        assert!(matches!(second, Err(EngineError::DuplicateDynamics(_))));
    }

    #[test]
    fn rejects_out_of_range_shock_and_undeclared_variable() {
        let mut space = StateSpace::new();
        let x = space.declare_variables(1).expect("declare")[0];
        space.declare_shocks(1).expect("shocks");
        assert_err_contains(
            space.assign_dynamics(x, Expr::constant(0.0), vec![(Expr::constant(1.0), Shock(3))]),
            "shock index 3",
        );
        assert_err_contains(
            space.assign_dynamics(x, Var(5) * 1.0, vec![]),
            "variable index 5",
        );
        assert_err_contains(
            space.assign_dynamics(Var(9), Expr::constant(0.0), vec![]),
            "not declared",
        );
        assert!(space.dynamics(x).is_err());
    }

    #[test]
    fn launch_requires_dynamics_and_freezes_declarations() {
        let mut space = StateSpace::new();
        let vars = space.declare_variables(2).expect("declare");
        space
            .assign_dynamics(vars[0], Expr::constant(1.0), vec![])
            .expect("assign");
        assert_err_contains(space.launch(), "'x1' has no dynamics");
        space
            .assign_dynamics(vars[1], Expr::constant(0.0), vec![])
            .expect("assign");
        space.launch().expect("launch");
        assert!(space.is_launched());
        assert!(matches!(
            space.declare_variables(1),
            Err(EngineError::AlreadyLaunched(_))
        ));
    }

    #[test]
    fn increment_scales_drift_by_dt_and_shock_by_root_dt() {
        let mut space = StateSpace::new();
        let x = space.declare_variables(1).expect("declare")[0];
        let z = space.declare_shocks(1).expect("shocks")[0];
        space
            .assign_dynamics(x, Expr::constant(2.0), vec![(Expr::constant(3.0), z)])
            .expect("assign");
        let dx = space.increment(x, 0.25).expect("increment");
        assert_eq!(format!("{dx}"), "sum((2 * 0.25), ((3 * 0.5) * dZ0))");
    }
}
