//! Itô drift, variance and covariance of expressions over declared processes.
//!
//! For `f(X_1..X_n)` with `dX_i = μ_i dt + Σ_k L_ik dZ_k` and independent
//! shocks, `C_ij = Σ_k L_ik L_jk` and
//!
//!   drift(f)    = Σ_i ∂_i f μ_i + ½ Σ_ij ∂_ij f C_ij
//!   covar(f, g) = Σ_ij ∂_i f ∂_j g C_ij = Σ_k (Σ_i ∂_i f L_ik)(Σ_j ∂_j g L_jk)
//!
//! Partials come from hyper-dual passes over the compiled graph, one per
//! unordered pair of variables for the Hessian and one per variable for the
//! gradient. Results are instantaneous rates; `dt` plays no part here.

use crate::autodiff::HyperDual;
use crate::error::{EngineError, Result};
use crate::evaluator::Evaluator;
use crate::expr::{Expr, Node, Var};
use crate::state_space::StateSpace;
use std::collections::HashMap;
use std::rc::Rc;

/// Checks that `f` can be differentiated under the declared dynamics.
pub(crate) fn check_differentiable(space: &StateSpace, f: &Expr) -> Result<()> {
    space.check_declared(f)?;
    if !f.shocks().is_empty() {
        return Err(EngineError::InvalidGraph(format!(
            "cannot differentiate an expression that references shocks: {f}"
        )));
    }
    if f.contains_operator() {
        return Err(EngineError::InvalidGraph(format!(
            "differential operators cannot be nested: {f}"
        )));
    }
    for var in f.variables() {
        space.dynamics(var)?;
    }
    Ok(())
}

pub(crate) fn drift(space: &StateSpace, f: &Expr) -> Result<Expr> {
    check_differentiable(space, f)?;
    Ok(Expr::from_node(Node::Drift(f.clone())))
}

pub(crate) fn variance(space: &StateSpace, f: &Expr) -> Result<Expr> {
    check_differentiable(space, f)?;
    Ok(Expr::from_node(Node::Variance(f.clone())))
}

pub(crate) fn covariance(space: &StateSpace, f: &Expr, g: &Expr) -> Result<Expr> {
    check_differentiable(space, f)?;
    check_differentiable(space, g)?;
    Ok(Expr::from_node(Node::Covariance(f.clone(), g.clone())))
}

/// Drift and shock loadings of a set of variables, evaluated on the batch.
struct ItoTerms {
    drift: Vec<Rc<Vec<f64>>>,
    /// `loadings[i][k][e]`: loading of variable `i` on shock `k` at element `e`.
    loadings: Vec<Vec<Vec<f64>>>,
}

impl ItoTerms {
    fn gather(ev: &mut Evaluator<'_>, vars: &[Var], with_drift: bool) -> Result<Self> {
        let space = ev.space();
        let n = ev.len();
        let mut drift = Vec::with_capacity(vars.len());
        let mut loadings = Vec::with_capacity(vars.len());
        for &var in vars {
            let dynamics = space.dynamics(var)?;
            if with_drift {
                drift.push(ev.evaluate(&dynamics.drift)?);
            }
            // Terms on the same shock add up.
            let mut per_shock = vec![vec![0.0; n]; space.shock_count()];
            for term in &dynamics.diffusion {
                let coefficient = ev.evaluate(&term.coefficient)?;
                if let Some(column) = per_shock.get_mut(term.shock.index()) {
                    for (acc, value) in column.iter_mut().zip(coefficient.iter()) {
                        *acc += value;
                    }
                }
            }
            loadings.push(per_shock);
        }
        Ok(Self { drift, loadings })
    }

    fn covariance(&self, i: usize, j: usize, element: usize) -> f64 {
        self.loadings[i]
            .iter()
            .zip(&self.loadings[j])
            .map(|(a, b)| a[element] * b[element])
            .sum()
    }
}

pub(crate) fn drift_column(ev: &mut Evaluator<'_>, f: &Expr) -> Result<Vec<f64>> {
    check_differentiable(ev.space(), f)?;
    let vars: Vec<Var> = f.variables().into_iter().collect();
    let terms = ItoTerms::gather(ev, &vars, true)?;
    let code = ev.compile(f, &HashMap::new())?;

    let mut out = Vec::with_capacity(ev.len());
    let mut stack = Vec::new();
    for element in 0..ev.len() {
        let mut point = ev.hyper_point(element);
        let mut total = 0.0;
        for (a, vi) in vars.iter().map(|v| v.index()).enumerate() {
            for (b, vj) in vars.iter().map(|v| v.index()).enumerate().skip(a) {
                let (xi, xj) = (point[vi].re, point[vj].re);
                if a == b {
                    point[vi] = HyperDual::seeded(xi, true, true);
                } else {
                    point[vi] = HyperDual::seeded(xi, true, false);
                    point[vj] = HyperDual::seeded(xj, false, true);
                }
                let d = ev.execute(&code, &point, &[], &[], &mut stack);
                point[vi] = HyperDual::constant(xi);
                point[vj] = HyperDual::constant(xj);

                let c = terms.covariance(a, b, element);
                if a == b {
                    total += d.e1 * terms.drift[a][element] + 0.5 * d.e12 * c;
                } else {
                    // off-diagonal Hessian entries appear twice in the full sum
                    total += d.e12 * c;
                }
            }
        }
        out.push(total);
    }
    Ok(out)
}

pub(crate) fn covariance_column(ev: &mut Evaluator<'_>, f: &Expr, g: &Expr) -> Result<Vec<f64>> {
    check_differentiable(ev.space(), f)?;
    check_differentiable(ev.space(), g)?;
    let vars: Vec<Var> = f.variables().union(&g.variables()).copied().collect();
    let terms = ItoTerms::gather(ev, &vars, false)?;
    let same = f.key() == g.key();
    let code_f = ev.compile(f, &HashMap::new())?;
    let code_g = if same {
        None
    } else {
        Some(ev.compile(g, &HashMap::new())?)
    };

    let shocks = ev.space().shock_count();
    let mut out = Vec::with_capacity(ev.len());
    let mut stack = Vec::new();
    for element in 0..ev.len() {
        let mut point = ev.hyper_point(element);
        let mut grad_f = Vec::with_capacity(vars.len());
        let mut grad_g = Vec::with_capacity(vars.len());
        for vi in vars.iter().map(|v| v.index()) {
            let x = point[vi].re;
            point[vi] = HyperDual::seeded(x, true, false);
            let df = ev.execute(&code_f, &point, &[], &[], &mut stack).e1;
            grad_f.push(df);
            grad_g.push(match &code_g {
                Some(code) => ev.execute(code, &point, &[], &[], &mut stack).e1,
                None => df,
            });
            point[vi] = HyperDual::constant(x);
        }

        let mut total = 0.0;
        for k in 0..shocks {
            let load = |grad: &[f64]| -> f64 {
                grad.iter()
                    .zip(&terms.loadings)
                    .map(|(d, l)| d * l[k][element])
                    .sum()
            };
            total += load(&grad_f) * load(&grad_g);
        }
        out.push(total);
    }
    Ok(out)
}
