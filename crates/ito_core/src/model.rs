//! The `Model`: declarations, approximators, the current batch and the
//! global tick counter, plus the operations that act on them.

use crate::batch::Batch;
use crate::checkpoint::Checkpoint;
use crate::error::{EngineError, Result};
use crate::evaluator::Evaluator;
use crate::expr::{Expr, NetworkId, Node, Shock, Var};
use crate::fit::{self, Fit, FitReport};
use crate::network::{Activation, AdamSettings, Network};
use crate::operators;
use crate::sampler::{self, Sampler};
use crate::solvers::EulerMaruyama;
use crate::state_space::StateSpace;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Time step of the discretized increment and the Euler–Maruyama step.
    /// Drift and variance are instantaneous rates and do not depend on it.
    pub dt: f64,
    pub batch_size: usize,
    /// Seed for sampling and parameter initialization. `None` seeds from entropy.
    pub seed: Option<u64>,
    pub optimizer: AdamSettings,
    /// Default hidden-layer activation of new approximators.
    pub activation: Activation,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dt: 0.01,
            batch_size: 128,
            seed: None,
            optimizer: AdamSettings::default(),
            activation: Activation::default(),
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.dt > 0.0 && self.dt.is_finite()) {
            return Err(EngineError::Config(format!(
                "dt must be positive and finite, got {}",
                self.dt
            )));
        }
        if self.batch_size == 0 {
            return Err(EngineError::Config("batch size must be positive".to_string()));
        }
        self.optimizer.validate()
    }
}

#[derive(Debug)]
pub struct Model {
    settings: EngineSettings,
    space: StateSpace,
    networks: Vec<Network>,
    batch: Batch,
    rng: StdRng,
    ticks: u64,
}

impl Model {
    pub fn new(settings: EngineSettings) -> Result<Self> {
        settings.validate()?;
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            settings,
            space: StateSpace::new(),
            networks: Vec::new(),
            batch: Batch::default(),
            rng,
            ticks: 0,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn space(&self) -> &StateSpace {
        &self.space
    }

    pub fn dt(&self) -> f64 {
        self.settings.dt
    }

    pub fn declare_variables(&mut self, count: usize) -> Result<Vec<Var>> {
        self.space.declare_variables(count)
    }

    pub fn declare_shocks(&mut self, count: usize) -> Result<Vec<Shock>> {
        self.space.declare_shocks(count)
    }

    pub fn assign_dynamics(
        &mut self,
        var: Var,
        drift: impl Into<Expr>,
        diffusion: Vec<(Expr, Shock)>,
    ) -> Result<()> {
        let drift = drift.into();
        self.check_networks(&drift)?;
        for (coefficient, _) in &diffusion {
            self.check_networks(coefficient)?;
        }
        self.space.assign_dynamics(var, drift, diffusion)
    }

    /// Defines an approximator with the default activation and returns its
    /// application to `inputs`.
    pub fn network(&mut self, name: &str, inputs: &[Expr], hidden: &[usize]) -> Result<Expr> {
        let activation = self.settings.activation;
        self.network_with(name, inputs, hidden, activation)
    }

    pub fn network_with(
        &mut self,
        name: &str,
        inputs: &[Expr],
        hidden: &[usize],
        activation: Activation,
    ) -> Result<Expr> {
        if self.space.is_launched() {
            return Err(EngineError::AlreadyLaunched("define networks"));
        }
        if self.networks.iter().any(|n| n.name() == name) {
            return Err(EngineError::DuplicateNetwork(name.to_string()));
        }
        for input in inputs {
            self.check_expr(input)?;
            if input.contains_operator() || !input.shocks().is_empty() {
                return Err(EngineError::InvalidGraph(format!(
                    "input of network '{name}' must not contain shocks or differential operators: {input}"
                )));
            }
        }

        let network = Network::new(
            name,
            inputs.to_vec(),
            hidden,
            activation,
            self.settings.optimizer,
            &mut self.rng,
        )?;
        let id = NetworkId(self.networks.len());
        debug!(
            network = name,
            inputs = inputs.len(),
            parameters = network.parameter_count(),
            "Network defined"
        );
        self.networks.push(network);
        Ok(Expr::from_node(Node::Network(id, inputs.to_vec())))
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    pub fn network_by_name(&self, name: &str) -> Option<&Network> {
        self.networks.iter().find(|n| n.name() == name)
    }

    /// Freezes declarations; every variable must have dynamics.
    pub fn launch(&mut self) -> Result<()> {
        self.space.launch()?;
        info!(
            variables = self.space.variable_count(),
            shocks = self.space.shock_count(),
            networks = self.networks.len(),
            "Model launched"
        );
        Ok(())
    }

    pub fn is_launched(&self) -> bool {
        self.space.is_launched()
    }

    fn check_networks(&self, expr: &Expr) -> Result<()> {
        match expr.networks().into_iter().find(|&id| id >= self.networks.len()) {
            Some(id) => Err(EngineError::InvalidGraph(format!(
                "network {id} does not belong to this model"
            ))),
            None => Ok(()),
        }
    }

    fn check_expr(&self, expr: &Expr) -> Result<()> {
        self.space.check_declared(expr)?;
        self.check_networks(expr)
    }

    /// Instantaneous Itô drift of `f`.
    pub fn drift(&self, f: &Expr) -> Result<Expr> {
        self.check_expr(f)?;
        operators::drift(&self.space, f)
    }

    /// Instantaneous Itô variance of `f`.
    pub fn var(&self, f: &Expr) -> Result<Expr> {
        self.check_expr(f)?;
        operators::variance(&self.space, f)
    }

    pub fn covar(&self, f: &Expr, g: &Expr) -> Result<Expr> {
        self.check_expr(f)?;
        self.check_expr(g)?;
        operators::covariance(&self.space, f, g)
    }

    /// Discretized increment of `var` over one `dt`.
    pub fn increment(&self, var: Var) -> Result<Expr> {
        self.space.increment(var, self.settings.dt)
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn batch_size(&self) -> usize {
        self.settings.batch_size
    }

    pub fn set_batch_size(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(EngineError::Config("batch size must be positive".to_string()));
        }
        self.settings.batch_size = size;
        Ok(())
    }

    /// Replaces the current batch with a fresh draw.
    pub fn sample(&mut self, sampler: &Sampler) -> Result<()> {
        let batch = sampler.draw(
            &mut self.rng,
            self.settings.batch_size,
            self.space.variable_count(),
            self.space.shock_count(),
        )?;
        debug!(size = batch.size(), "Batch sampled");
        self.batch = batch;
        Ok(())
    }

    /// Builds a batch from explicit values. Shocks are zero.
    pub fn feed<I>(&self, values: I) -> Result<Batch>
    where
        I: IntoIterator<Item = (Var, Vec<f64>)>,
    {
        let mut columns = vec![None; self.space.variable_count()];
        let mut size = None;
        for (var, column) in values {
            if var.index() >= columns.len() {
                return Err(EngineError::UndeclaredVariable {
                    index: var.index(),
                    declared: columns.len(),
                });
            }
            if columns[var.index()].is_some() {
                return Err(EngineError::Config(format!("{var} is fed twice")));
            }
            let expected = *size.get_or_insert(column.len());
            if column.len() != expected {
                return Err(EngineError::Config(format!(
                    "{var} is fed {} values, expected {expected}",
                    column.len()
                )));
            }
            columns[var.index()] = Some(column);
        }
        let size = match size {
            Some(size) if size > 0 => size,
            _ => return Err(EngineError::Config("feed must contain values".to_string())),
        };
        let shocks = vec![vec![0.0; size]; self.space.shock_count()];
        Batch::from_parts(size, columns, shocks)
    }

    pub fn eval(&self, expr: &Expr, batch: &Batch) -> Result<Vec<f64>> {
        self.check_expr(expr)?;
        let mut ev = Evaluator::new(&self.space, &self.networks, batch);
        Ok(ev.evaluate(expr)?.to_vec())
    }

    /// Evaluates several expressions against one batch, sharing common work.
    pub fn eval_many(&self, exprs: &[Expr], batch: &Batch) -> Result<Vec<Vec<f64>>> {
        for expr in exprs {
            self.check_expr(expr)?;
        }
        let mut ev = Evaluator::new(&self.space, &self.networks, batch);
        exprs
            .iter()
            .map(|expr| ev.evaluate(expr).map(|values| values.to_vec()))
            .collect()
    }

    pub fn eval_current(&self, expr: &Expr) -> Result<Vec<f64>> {
        self.eval(expr, &self.batch)
    }

    /// One optimizer step of the approximator applied in `output` toward `target`.
    pub fn fit(&mut self, output: &Expr, target: &Expr) -> Result<FitReport> {
        self.check_expr(target)?;
        fit::fit_step(&self.space, &mut self.networks, &self.batch, output, target)
    }

    /// A schedulable fit of `output` toward `target`.
    pub fn fit_op(&self, output: &Expr, target: &Expr) -> Result<Fit> {
        let id = fit::network_of(output, &self.networks)?;
        self.check_expr(target)?;
        Ok(Fit::new(
            output.clone(),
            target.clone(),
            self.networks[id.index()].name(),
        ))
    }

    /// Advances the current batch by one Euler–Maruyama step and redraws shocks.
    pub fn simulate_step(&mut self, stepper: &EulerMaruyama) -> Result<()> {
        let values = stepper.advance(&self.space, &self.networks, &self.batch, self.settings.dt)?;
        let size = self.batch.size();
        let shocks = sampler::draw_shocks(&mut self.rng, self.space.shock_count(), size)?;
        self.batch = Batch::from_parts(size, values, shocks)?;
        Ok(())
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub(crate) fn advance_tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(
            self.ticks,
            self.networks.iter().map(Network::snapshot).collect(),
        )
    }

    /// Restores approximators and the tick counter. Nothing changes unless
    /// every network in the checkpoint matches this model's architecture.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        if checkpoint.networks.len() != self.networks.len() {
            return Err(EngineError::Checkpoint(format!(
                "checkpoint has {} networks, model has {}",
                checkpoint.networks.len(),
                self.networks.len()
            )));
        }
        let names: HashSet<&str> = checkpoint.networks.iter().map(|n| n.name.as_str()).collect();
        if names.len() != checkpoint.networks.len() {
            return Err(EngineError::Checkpoint("duplicate network names".to_string()));
        }
        let mut restored = self.networks.clone();
        for (network, snapshot) in restored.iter_mut().zip(&checkpoint.networks) {
            network.restore(snapshot)?;
        }
        self.networks = restored;
        self.ticks = checkpoint.ticks;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineSettings, Model};
    use crate::checkpoint::CheckpointStore;
    use crate::error::EngineError;
    use crate::expr::{Expr, Var};
    use crate::network::{Activation, AdamSettings};
    use crate::sampler::Sampler;
    use crate::scheduler::{Budget, Diagnostic, Program, Scheduler, SchedulerState};
    use crate::solvers::EulerMaruyama;

    fn assert_err_contains<T: std::fmt::Debug>(result: crate::error::Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn seeded(seed: u64) -> EngineSettings {
        EngineSettings {
            seed: Some(seed),
            ..EngineSettings::default()
        }
    }

    /// Geometric Brownian motion `dX = μX dt + σX dZ`.
    fn gbm(mu: f64, sigma: f64, seed: u64) -> (Model, Var) {
        let mut model = Model::new(seeded(seed)).expect("model");
        let x = model.declare_variables(1).expect("declare")[0];
        let z = model.declare_shocks(1).expect("shocks")[0];
        model
            .assign_dynamics(x, x * mu, vec![(x * sigma, z)])
            .expect("assign");
        (model, x)
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let zero_dt = EngineSettings {
            dt: 0.0,
            ..EngineSettings::default()
        };
        assert!(Model::new(zero_dt).is_err());
        let zero_batch = EngineSettings {
            batch_size: 0,
            ..EngineSettings::default()
        };
        assert!(Model::new(zero_batch).is_err());
        let (mut model, _) = gbm(0.0, 0.1, 1);
        assert!(model.set_batch_size(0).is_err());
        model.set_batch_size(32).expect("batch size");
        assert_eq!(model.batch_size(), 32);
    }

    #[test]
    fn drift_and_variance_of_constant_dynamics() {
        let mut model = Model::new(seeded(4)).expect("model");
        let x = model.declare_variables(1).expect("declare")[0];
        let z = model.declare_shocks(1).expect("shocks")[0];
        model
            .assign_dynamics(x, 0.25, vec![(Expr::constant(-0.5), z)])
            .expect("assign");
        model.launch().expect("launch");

        let sampler = Sampler::new([(x, [-10.0, 10.0])]).expect("sampler");
        let drift = model.drift(&x.expr()).expect("drift");
        let var = model.var(&x.expr()).expect("var");
        for _ in 0..3 {
            model.sample(&sampler).expect("sample");
            let values = model
                .eval_many(&[drift.clone(), var.clone()], model.batch())
                .expect("eval");
            assert!(values[0].iter().all(|v| (v - 0.25).abs() < 1e-12));
            assert!(values[1].iter().all(|v| (v - 0.25).abs() < 1e-12));
        }
    }

    #[test]
    fn log_gbm_has_ito_corrected_drift() {
        let (mu, sigma) = (0.08, 0.3);
        let (mut model, x) = gbm(mu, sigma, 5);
        model.launch().expect("launch");
        let log_x = x.expr().ln();
        let drift = model.drift(&log_x).expect("drift");
        let var = model.var(&log_x).expect("var");

        model
            .sample(&Sampler::new([(x, [1e-4, 100.0])]).expect("sampler"))
            .expect("sample");
        let values = model.eval_many(&[drift, var], model.batch()).expect("eval");
        for (d, v) in values[0].iter().zip(&values[1]) {
            assert!((d - (mu - 0.5 * sigma * sigma)).abs() < 1e-10);
            assert!((v - sigma * sigma).abs() < 1e-10);
        }
    }

    #[test]
    fn network_drift_matches_finite_differences_at_zero_input() {
        for activation in [Activation::Tanh, Activation::Sigmoid, Activation::Softplus] {
            let mut model = Model::new(seeded(12)).expect("model");
            let x = model.declare_variables(1).expect("declare")[0];
            let z = model.declare_shocks(1).expect("shocks")[0];
            model
                .assign_dynamics(x, 1.0, vec![(Expr::constant(0.5), z)])
                .expect("assign");
            // Biases start at zero, so every first-layer pre-activation is 0 at x = 0.
            let j = model
                .network_with("J", &[x.expr()], &[8], activation)
                .expect("network");
            model.launch().expect("launch");
            let drift = model.drift(&j).expect("drift");

            let h = 1e-3;
            let at = |value: f64| {
                let batch = model.feed([(x, vec![value])]).expect("feed");
                model.eval(&j, &batch).expect("eval")[0]
            };
            let (down, mid, up) = (at(-h), at(0.0), at(h));
            let first = (up - down) / (2.0 * h);
            let second = (up - 2.0 * mid + down) / (h * h);
            let expected = first + 0.5 * 0.25 * second;

            let batch = model.feed([(x, vec![0.0])]).expect("feed");
            let actual = model.eval(&drift, &batch).expect("eval")[0];
            assert!(
                (actual - expected).abs() < 1e-5,
                "{activation:?}: drift {actual}, finite difference {expected}"
            );
        }
    }

    #[test]
    fn sample_respects_batch_size_and_bounds() {
        let (mut model, x) = gbm(0.0, 0.1, 6);
        let sampler = Sampler::new([(x, [1e-4, 100.0])]).expect("sampler");
        for size in [1, 128, 10_000] {
            model.set_batch_size(size).expect("batch size");
            model.sample(&sampler).expect("sample");
            let values = model.batch().values(x).expect("sampled");
            assert_eq!(values.len(), size);
            assert!(values.iter().all(|v| (1e-4..=100.0).contains(v)));
        }
    }

    #[test]
    fn structural_errors_surface_at_build_time() {
        let mut model = Model::new(seeded(7)).expect("model");
        let v = model.declare_variables(2).expect("declare");
        let z = model.declare_shocks(1).expect("shocks");
        model
            .assign_dynamics(v[0], 0.0, vec![(Expr::constant(1.0), z[0])])
            .expect("assign");

        assert!(matches!(
            model.assign_dynamics(v[0], 0.0, vec![]),
            Err(EngineError::DuplicateDynamics(_))
        ));
        assert!(matches!(
            model.assign_dynamics(v[1], 0.0, vec![(Expr::constant(1.0), crate::expr::Shock(2))]),
            Err(EngineError::ShockOutOfRange { index: 2, declared: 1 })
        ));
        assert!(matches!(
            model.drift(&(v[0] * v[1])),
            Err(EngineError::UnassignedDynamics(_))
        ));
        assert!(matches!(
            model.drift(&Var(9).expr()),
            Err(EngineError::UndeclaredVariable { index: 9, .. })
        ));
        let inner = model.drift(&v[0].expr()).expect("drift");
        assert_err_contains(model.drift(&inner), "cannot be nested");
        assert_err_contains(model.launch(), "'x1' has no dynamics");
    }

    #[test]
    fn networks_are_unique_and_frozen_after_launch() {
        let (mut model, x) = gbm(0.0, 0.1, 8);
        model.network("V", &[x.expr()], &[4]).expect("network");
        assert!(matches!(
            model.network("V", &[x.expr()], &[4]),
            Err(EngineError::DuplicateNetwork(_))
        ));
        let drift = model.drift(&x.expr()).expect("drift");
        assert!(model.network("W", &[drift], &[4]).is_err());

        // A second network of another model has an id this model never issued.
        let (mut other, y) = gbm(0.0, 0.1, 9);
        other.network("F", &[y.expr()], &[2]).expect("network");
        let foreign = other.network("G", &[y.expr()], &[2]).expect("network");
        assert_err_contains(model.drift(&foreign), "does not belong to this model");
        assert!(model.network_by_name("V").is_some());

        model.launch().expect("launch");
        assert!(matches!(
            model.network("U", &[x.expr()], &[4]),
            Err(EngineError::AlreadyLaunched(_))
        ));
    }

    #[test]
    fn feed_builds_batches_with_zero_shocks() {
        let (model, x) = gbm(0.1, 0.2, 10);
        let batch = model.feed([(x, vec![1.0, 2.0, 3.0])]).expect("feed");
        assert_eq!(batch.size(), 3);
        let dx = model.increment(x).expect("increment");
        // dt = 0.01 and zero shocks: the increment is the drift times dt
        let values = model.eval(&dx, &batch).expect("eval");
        for (v, x0) in values.iter().zip([1.0, 2.0, 3.0]) {
            assert!((v - 0.1 * x0 * 0.01).abs() < 1e-15);
        }
        assert!(model.feed(Vec::<(Var, Vec<f64>)>::new()).is_err());
        assert!(model.feed([(x, vec![1.0]), (x, vec![2.0])]).is_err());
        assert!(model.feed([(Var(3), vec![1.0])]).is_err());
    }

    #[test]
    fn fit_of_linear_model_converges_on_fixed_target() {
        let mut settings = seeded(11);
        settings.batch_size = 64;
        settings.optimizer = AdamSettings {
            learning_rate: 0.01,
            ..AdamSettings::default()
        };
        let mut model = Model::new(settings).expect("model");
        let x = model.declare_variables(1).expect("declare")[0];
        model.assign_dynamics(x, 0.0, vec![]).expect("assign");
        let v = model.network("lin", &[x.expr()], &[]).expect("network");
        model.launch().expect("launch");
        model
            .sample(&Sampler::new([(x, [-1.0, 1.0])]).expect("sampler"))
            .expect("sample");

        let target = x * 2.0 + 1.0;
        let losses: Vec<f64> = (0..3000)
            .map(|_| model.fit(&v, &target).expect("fit").loss)
            .collect();

        let window = 250;
        let averages: Vec<f64> = losses
            .chunks(window)
            .map(|c| c.iter().sum::<f64>() / c.len() as f64)
            .collect();
        for pair in averages.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-4, "window averages rose: {averages:?}");
        }
        assert!(losses[losses.len() - 1] < 1e-3);
        assert_eq!(model.networks()[0].optimizer_steps(), 3000);
    }

    #[test]
    fn fit_recomputes_moving_target_each_call() {
        let (mut model, x) = gbm(0.0, 0.1, 12);
        let v = model.network("V", &[x.expr()], &[4]).expect("network");
        model.launch().expect("launch");
        model
            .sample(&Sampler::new([(x, [0.5, 2.0])]).expect("sampler"))
            .expect("sample");
        let batch_before = model.batch().clone();

        // The residual V - (V + 1) is -1 whatever the parameters are, as long
        // as the target is evaluated with the current ones.
        let target = &v + 1.0;
        for _ in 0..5 {
            let report = model.fit(&v, &target).expect("fit");
            assert!((report.loss - 1.0).abs() < 1e-9);
        }
        assert_eq!(model.batch(), &batch_before);
    }

    #[test]
    fn fit_rejects_non_network_output_and_non_finite_target() {
        let (mut model, x) = gbm(0.0, 0.1, 13);
        let v = model.network("V", &[x.expr()], &[4]).expect("network");
        model.launch().expect("launch");
        assert_err_contains(model.fit(&v, &x.expr()), "empty batch");
        model
            .sample(&Sampler::new([(x, [0.0, 1.0])]).expect("sampler"))
            .expect("sample");
        assert_err_contains(model.fit(&x.expr(), &x.expr()), "approximator application");
        let err = model
            .fit(&v, &(x.expr().ln() / 0.0))
            .expect_err("non-finite target");
        assert!(matches!(err, EngineError::Numerical(_)));
    }

    #[test]
    fn checkpoint_round_trip_reproduces_outputs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path());
        let build = |seed: u64| {
            let (mut model, x) = gbm(0.02, 0.2, seed);
            let v = model.network("V", &[x.expr(), x.expr().ln()], &[8, 8]).expect("network");
            model.launch().expect("launch");
            (model, x, v)
        };

        let (mut trained, x, v) = build(21);
        let sampler = Sampler::new([(x, [0.5, 2.0])]).expect("sampler");
        let target = (x * 0.5).exp();
        let mut program = Program::new()
            .add(sampler, 1)
            .and_then(|p| p.add(trained.fit_op(&v, &target).expect("fit op"), 1))
            .expect("program");
        let mut scheduler = Scheduler::new();
        scheduler
            .run(&mut trained, &mut program, Budget::Ticks(25))
            .expect("run");
        scheduler.save(&trained, &store).expect("save");
        assert_eq!(scheduler.state(), SchedulerState::Checkpointed);

        let (mut resumed, x2, v2) = build(99);
        let probe = [0.5, 0.75, 1.1, 1.9];
        let before = resumed
            .eval(&v2, &resumed.feed([(x2, probe.to_vec())]).expect("feed"))
            .expect("eval");
        let ticks = store.load(&mut resumed).expect("load");
        assert_eq!(ticks, 25);
        assert_eq!(resumed.ticks(), 25);

        let expected = trained
            .eval(&v, &trained.feed([(x, probe.to_vec())]).expect("feed"))
            .expect("eval");
        let restored = resumed
            .eval(&v2, &resumed.feed([(x2, probe.to_vec())]).expect("feed"))
            .expect("eval");
        assert_eq!(expected, restored);
        assert_ne!(before, restored);
        assert_eq!(trained.checkpoint(), resumed.checkpoint());
    }

    #[test]
    fn restore_rejects_mismatched_architecture() {
        let (mut a, x) = gbm(0.0, 0.1, 30);
        a.network("V", &[x.expr()], &[4]).expect("network");
        let (mut b, y) = gbm(0.0, 0.1, 31);
        b.network("V", &[y.expr()], &[5]).expect("network");
        let checkpoint = a.checkpoint();
        let before = b.checkpoint();
        assert!(b.restore(&checkpoint).is_err());
        assert_eq!(b.checkpoint(), before);
    }

    #[test]
    fn euler_maruyama_step_replaces_batch() {
        let (mut model, x) = gbm(0.05, 0.2, 40);
        model.launch().expect("launch");
        let sampler = Sampler::new([(x, [1.0, 2.0])]).expect("sampler");
        model.sample(&sampler).expect("sample");
        let before = model.batch().values(x).expect("sampled").to_vec();
        model
            .simulate_step(&EulerMaruyama::clamped_to(&sampler))
            .expect("step");
        let after = model.batch().values(x).expect("stepped");
        assert_eq!(after.len(), before.len());
        assert_ne!(after, before.as_slice());
        assert!(after.iter().all(|v| (1.0..=2.0).contains(v)));
    }

    /// Two-tree Lucas economy: two dividend trees following independent GBMs,
    /// the first tree's price-dividend ratio approximated as a function of its
    /// dividend share and fitted to a Bellman-style target.
    #[test]
    fn two_trees_smoke_run() {
        let (mu, sigma, rho) = (0.02, 0.1, 0.04);
        let mut model = Model::new(EngineSettings {
            batch_size: 32,
            ..seeded(50)
        })
        .expect("model");
        let d = model.declare_variables(2).expect("declare");
        let z = model.declare_shocks(2).expect("shocks");
        for (dv, zv) in d.iter().zip(&z) {
            model
                .assign_dynamics(*dv, *dv * mu, vec![(*dv * sigma, *zv)])
                .expect("assign");
        }
        let total: Expr = d.iter().map(|v| v.expr()).sum();
        let share = d[0] / &total;
        let pd = model.network("PD", &[share.clone()], &[8]).expect("network");
        // price P = pd * D0 must satisfy rho P = D0 + drift(P)
        let price = &pd * d[0];
        let drift = model.drift(&price).expect("drift");
        let variance = model.var(&price).expect("var");
        let target = (d[0] + drift) / rho / d[0];
        let relative_vol = (variance / price.pow(2.0)).pow(0.5);
        model.launch().expect("launch");

        let sampler = Sampler::new([(d[0], [0.1, 1.0]), (d[1], [0.1, 1.0])]).expect("sampler");
        let fit = model.fit_op(&pd, &target).expect("fit op");
        let feed = model
            .feed([(d[0], vec![0.2, 0.5, 0.8]), (d[1], vec![0.8, 0.5, 0.2])])
            .expect("feed");
        let probe = relative_vol.clone();
        let diagnostic = Diagnostic::new("relative volatility", move |m: &Model| {
            let values = m.eval(&probe, &feed)?;
            anyhow::ensure!(values.iter().all(|v| v.is_finite()), "non-finite volatility");
            Ok(())
        });
        let mut program = Program::new()
            .add(sampler, 1)
            .and_then(|p| p.add(fit, 1))
            .and_then(|p| p.add(diagnostic, 10))
            .expect("program");

        let report = Scheduler::new()
            .run(&mut model, &mut program, Budget::Ticks(30))
            .expect("run");
        assert_eq!(report.fired("sample"), 30);
        assert_eq!(report.fired("fit:PD"), 30);
        assert_eq!(report.fired("relative volatility"), 3);
        assert_eq!(report.diagnostic_failures, 0);
        let loss = model.network_by_name("PD").and_then(|n| n.last_loss());
        assert!(loss.is_some_and(f64::is_finite));
    }
}
