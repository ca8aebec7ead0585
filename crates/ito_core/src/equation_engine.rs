use crate::error::{EngineError, Result};
use crate::expr::{BinaryOp, Expr, Node, UnaryOp, Var};
use crate::network::Network;
use crate::traits::{lift, Scalar};
use std::collections::HashMap;

/// OpCodes for the stack-based virtual machine.
/// The VM operates on a stack of `Scalar` values (f64 or HyperDual).
#[derive(Debug, Clone, Copy)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value in a variable slot onto the stack.
    /// Slots are assigned by the `Compiler`, not by variable index.
    LoadVar(usize),
    /// Pushes the current draw of a shock (by shock index) onto the stack.
    LoadShock(usize),
    /// Pushes a precomputed per-element column (drift/variance results).
    LoadColumn(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes ln(a).
    Ln,
    /// Pops top value (a), pushes exp(a).
    Exp,
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops `n` values, pushes their sum.
    Sum(usize),
    /// Pops `arity` inputs, pushes the output of network `index`.
    Network { index: usize, arity: usize },
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }
}

/// Read-only inputs of one batch element besides the variable slots.
pub struct Sources<'a> {
    pub shocks: &'a [f64],
    pub columns: &'a [f64],
    pub networks: &'a [Network],
}

/// Stack-based virtual machine for evaluating compiled expressions.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: instructions to run.
/// - `vars`: values of the variable slots (read-only).
/// - `sources`: shocks, precomputed columns and networks (read-only).
/// - `stack`: a mutable buffer for intermediate computations.
///
/// Returns the value left on the stack. Malformed bytecode yields NaN, which
/// the finiteness checks of the caller turn into an error.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        vars: &[T],
        sources: &Sources<'_>,
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(lift(val)),
                OpCode::LoadVar(slot) => stack.push(vars.get(slot).copied().unwrap_or_else(T::nan)),
                OpCode::LoadShock(idx) => {
                    stack.push(lift(sources.shocks.get(idx).copied().unwrap_or(f64::NAN)))
                }
                OpCode::LoadColumn(idx) => {
                    stack.push(lift(sources.columns.get(idx).copied().unwrap_or(f64::NAN)))
                }
                OpCode::Add => binary(stack, |a, b| a + b),
                OpCode::Sub => binary(stack, |a, b| a - b),
                OpCode::Mul => binary(stack, |a, b| a * b),
                OpCode::Div => binary(stack, |a, b| a / b),
                OpCode::Pow => binary(stack, |a, b| a.powf(b)),
                OpCode::Ln => unary(stack, |a| a.ln()),
                OpCode::Exp => unary(stack, |a| a.exp()),
                OpCode::Neg => unary(stack, |a| -a),
                OpCode::Sum(n) => {
                    let start = stack.len().saturating_sub(n);
                    let total = stack.drain(start..).fold(T::zero(), |acc, v| acc + v);
                    stack.push(total);
                }
                OpCode::Network { index, arity } => {
                    let start = stack.len().saturating_sub(arity);
                    let inputs = stack.split_off(start);
                    let output = match sources.networks.get(index) {
                        Some(network) => network.forward(&inputs),
                        None => T::nan(),
                    };
                    stack.push(output);
                }
            }
        }

        stack.pop().unwrap_or_else(T::nan)
    }
}

fn unary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T) -> T) {
    let a = stack.pop().unwrap_or_else(T::nan);
    stack.push(f(a));
}

fn binary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T, T) -> T) {
    let b = stack.pop().unwrap_or_else(T::nan);
    let a = stack.pop().unwrap_or_else(T::nan);
    stack.push(f(a, b));
}

/// Compiles an expression graph into `Bytecode`.
///
/// Resolves variables to slots and differential-operator nodes to column
/// indices. Shared sub-expressions are emitted once per use; the VM is cheap
/// enough that this beats bookkeeping registers.
pub struct Compiler<'a> {
    pub var_slots: &'a HashMap<Var, usize>,
    pub columns: &'a HashMap<usize, usize>,
    pub shock_count: usize,
    pub network_count: usize,
}

impl<'a> Compiler<'a> {
    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr.node() {
            Node::Constant(v) => ops.push(OpCode::LoadConst(*v)),
            Node::Variable(var) => {
                let slot = self
                    .var_slots
                    .get(var)
                    .ok_or_else(|| EngineError::MissingValues(var.to_string()))?;
                ops.push(OpCode::LoadVar(*slot));
            }
            Node::Shock(shock) => {
                if shock.index() >= self.shock_count {
                    return Err(EngineError::ShockOutOfRange {
                        index: shock.index(),
                        declared: self.shock_count,
                    });
                }
                ops.push(OpCode::LoadShock(shock.index()));
            }
            Node::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(match op {
                    UnaryOp::Neg => OpCode::Neg,
                    UnaryOp::Ln => OpCode::Ln,
                    UnaryOp::Exp => OpCode::Exp,
                });
            }
            Node::Binary(op, left, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Pow => OpCode::Pow,
                });
            }
            Node::Sum(terms) => {
                for term in terms {
                    self.compile_recursive(term, ops)?;
                }
                ops.push(OpCode::Sum(terms.len()));
            }
            Node::Network(id, inputs) => {
                if id.index() >= self.network_count {
                    return Err(EngineError::InvalidGraph(format!(
                        "network {} does not belong to this model",
                        id.index()
                    )));
                }
                for input in inputs {
                    self.compile_recursive(input, ops)?;
                }
                ops.push(OpCode::Network {
                    index: id.index(),
                    arity: inputs.len(),
                });
            }
            Node::Drift(_) | Node::Variance(_) | Node::Covariance(_, _) => {
                let column = self.columns.get(&expr.key()).ok_or_else(|| {
                    EngineError::InvalidGraph(
                        "differential operators cannot be nested inside a differentiated expression"
                            .to_string(),
                    )
                })?;
                ops.push(OpCode::LoadColumn(*column));
            }
        }
        Ok(())
    }
}
