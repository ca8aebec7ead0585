//! One optimizer step of an approximator toward a target expression.
//!
//! The target is evaluated fresh on every call from the current parameters
//! and then held fixed for the step: gradients flow only through the
//! network output, never through the target.

use crate::batch::Batch;
use crate::error::{EngineError, Result};
use crate::evaluator::Evaluator;
use crate::expr::{Expr, NetworkId, Node};
use crate::model::Model;
use crate::network::Network;
use crate::state_space::StateSpace;
use crate::traits::Operation;
use nalgebra::DMatrix;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitReport {
    /// Mean squared residual before the update.
    pub loss: f64,
    /// Optimizer step count after the update.
    pub step: u64,
}

/// Scheduler operation wrapping `Model::fit`.
pub struct Fit {
    output: Expr,
    target: Expr,
    name: String,
}

impl Fit {
    pub(crate) fn new(output: Expr, target: Expr, network_name: &str) -> Self {
        Self {
            output,
            target,
            name: format!("fit:{network_name}"),
        }
    }
}

impl Operation for Fit {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, model: &mut Model) -> Result<()> {
        model.fit(&self.output, &self.target).map(|_| ())
    }
}

/// The approximator an output expression applies.
pub(crate) fn network_of(output: &Expr, networks: &[Network]) -> Result<NetworkId> {
    match output.node() {
        Node::Network(id, _) if id.index() < networks.len() => Ok(*id),
        Node::Network(id, _) => Err(EngineError::InvalidGraph(format!(
            "network {} does not belong to this model",
            id.index()
        ))),
        _ => Err(EngineError::InvalidGraph(format!(
            "fit output must be an approximator application, got {output}"
        ))),
    }
}

fn check_finite(label: &str, values: &[f64]) -> Result<()> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(element) => Err(EngineError::Numerical(format!(
            "{label} is {} at batch element {element}",
            values[element]
        ))),
        None => Ok(()),
    }
}

pub(crate) fn fit_step(
    space: &StateSpace,
    networks: &mut [Network],
    batch: &Batch,
    output: &Expr,
    target: &Expr,
) -> Result<FitReport> {
    let id = network_of(output, networks)?;
    if batch.is_empty() {
        return Err(EngineError::Config(
            "cannot fit on an empty batch; sample first".to_string(),
        ));
    }

    let (features, target_values) = {
        let network = &networks[id.index()];
        let mut ev = Evaluator::new(space, networks, batch);
        let mut columns = Vec::with_capacity(network.inputs().len());
        for (i, input) in network.inputs().iter().enumerate() {
            let column = ev.evaluate(input)?;
            check_finite(&format!("input {i} of network '{}'", network.name()), &column)?;
            columns.push(column);
        }
        let target_values = ev.evaluate(target)?;
        check_finite(&format!("fit target of network '{}'", network.name()), &target_values)?;
        let features = DMatrix::from_fn(batch.size(), columns.len(), |r, c| columns[c][r]);
        (features, target_values.to_vec())
    };

    let network = &mut networks[id.index()];
    let loss = network.train_step(&features, &target_values)?;
    let step = network.optimizer_steps();
    debug!(network = network.name(), step, loss, "fit step");
    Ok(FitReport { loss, step })
}
