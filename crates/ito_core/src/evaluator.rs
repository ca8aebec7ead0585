//! Batch evaluation of expression graphs.
//!
//! Differential-operator nodes are resolved first into per-element columns;
//! the remaining graph is compiled once and run through the VM for every batch
//! element. Results are memoized per node for the lifetime of the evaluator,
//! so a sub-expression shared between several outputs is computed once.

use crate::autodiff::HyperDual;
use crate::batch::Batch;
use crate::equation_engine::{Bytecode, Compiler, Sources, VM};
use crate::error::Result;
use crate::expr::{Expr, Node, Var};
use crate::network::Network;
use crate::operators;
use crate::state_space::StateSpace;
use crate::traits::Scalar;
use std::collections::HashMap;
use std::rc::Rc;

pub(crate) struct Evaluator<'a> {
    space: &'a StateSpace,
    networks: &'a [Network],
    batch: &'a Batch,
    slots: HashMap<Var, usize>,
    /// The `Expr` is kept alongside so its node key cannot be reused.
    cache: HashMap<usize, (Expr, Rc<Vec<f64>>)>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(space: &'a StateSpace, networks: &'a [Network], batch: &'a Batch) -> Self {
        // Slot of a variable is its index, so a batch row can be used as-is.
        let slots = batch.sampled().map(|var| (var, var.index())).collect();
        Self {
            space,
            networks,
            batch,
            slots,
            cache: HashMap::new(),
        }
    }

    pub(crate) fn space(&self) -> &'a StateSpace {
        self.space
    }

    pub(crate) fn len(&self) -> usize {
        self.batch.size()
    }

    pub(crate) fn compile(&self, expr: &Expr, columns: &HashMap<usize, usize>) -> Result<Bytecode> {
        let compiler = Compiler {
            var_slots: &self.slots,
            columns,
            shock_count: self.space.shock_count(),
            network_count: self.networks.len(),
        };
        compiler.compile(expr)
    }

    pub(crate) fn execute<T: Scalar>(
        &self,
        code: &Bytecode,
        vars: &[T],
        shocks: &[f64],
        columns: &[f64],
        stack: &mut Vec<T>,
    ) -> T {
        let sources = Sources {
            shocks,
            columns,
            networks: self.networks,
        };
        VM::execute(code, vars, &sources, stack)
    }

    /// Variable values at `element` as hyper-dual constants, ready for seeding.
    pub(crate) fn hyper_point(&self, element: usize) -> Vec<HyperDual> {
        self.batch
            .variable_row(element)
            .into_iter()
            .map(HyperDual::constant)
            .collect()
    }

    /// Values of `expr` for every batch element.
    pub(crate) fn evaluate(&mut self, expr: &Expr) -> Result<Rc<Vec<f64>>> {
        if let Some((_, values)) = self.cache.get(&expr.key()) {
            return Ok(Rc::clone(values));
        }

        let operators = expr.outer_operators();
        let mut columns = HashMap::with_capacity(operators.len());
        let mut resolved = Vec::with_capacity(operators.len());
        for op in &operators {
            columns.insert(op.key(), resolved.len());
            resolved.push(self.operator_column(op)?);
        }
        let code = self.compile(expr, &columns)?;

        let mut out = Vec::with_capacity(self.len());
        let mut stack = Vec::new();
        let mut row = vec![0.0; resolved.len()];
        for element in 0..self.len() {
            for (slot, column) in row.iter_mut().zip(&resolved) {
                *slot = column[element];
            }
            let vars = self.batch.variable_row(element);
            let shocks = self.batch.shock_row(element);
            out.push(self.execute(&code, &vars, &shocks, &row, &mut stack));
        }

        let out = Rc::new(out);
        self.cache.insert(expr.key(), (expr.clone(), Rc::clone(&out)));
        Ok(out)
    }

    fn operator_column(&mut self, op: &Expr) -> Result<Rc<Vec<f64>>> {
        if let Some((_, values)) = self.cache.get(&op.key()) {
            return Ok(Rc::clone(values));
        }
        let values = match op.node() {
            Node::Drift(f) => operators::drift_column(self, f)?,
            Node::Variance(f) => operators::covariance_column(self, f, f)?,
            Node::Covariance(f, g) => operators::covariance_column(self, f, g)?,
            _ => return self.evaluate(op),
        };
        let values = Rc::new(values);
        self.cache.insert(op.key(), (op.clone(), Rc::clone(&values)));
        Ok(values)
    }
}
