//! Expression graph.
//!
//! Expressions are immutable, reference-counted DAG nodes. Arithmetic on an
//! `Expr` (or a `Var`, or an `f64` mixed with either) builds a new node and
//! leaves its operands untouched, so sub-expressions can be shared freely:
//!
//! ```ignore
//! let c: Expr = d.iter().map(|v| v.expr()).sum();
//! let m = c.pow(-1.0);
//! let p = &j / &m;
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

/// Handle to a declared state variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Var(pub(crate) usize);

impl Var {
    /// Builds a handle from a raw index. Handles normally come from
    /// `Model::declare_variables`; a forged index is rejected when used.
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }

    pub fn expr(self) -> Expr {
        Expr::from_node(Node::Variable(self))
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// Handle to an independent standard Brownian shock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Shock(pub(crate) usize);

impl Shock {
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }

    pub fn expr(self) -> Expr {
        Expr::from_node(Node::Shock(self))
    }
}

impl fmt::Display for Shock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dZ{}", self.0)
    }
}

/// Handle to a function approximator owned by a `Model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkId(pub(crate) usize);

impl NetworkId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Ln,
    Exp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug)]
pub enum Node {
    Constant(f64),
    Variable(Var),
    Shock(Shock),
    Unary(UnaryOp, Expr),
    Binary(BinaryOp, Expr, Expr),
    Sum(Vec<Expr>),
    /// Application of a function approximator to its input expressions.
    Network(NetworkId, Vec<Expr>),
    Drift(Expr),
    Variance(Expr),
    Covariance(Expr, Expr),
}

impl Node {
    pub(crate) fn children(&self) -> Vec<&Expr> {
        match self {
            Node::Constant(_) | Node::Variable(_) | Node::Shock(_) => Vec::new(),
            Node::Unary(_, a) | Node::Drift(a) | Node::Variance(a) => vec![a],
            Node::Binary(_, a, b) | Node::Covariance(a, b) => vec![a, b],
            Node::Sum(terms) | Node::Network(_, terms) => terms.iter().collect(),
        }
    }

    pub fn is_operator(&self) -> bool {
        matches!(
            self,
            Node::Drift(_) | Node::Variance(_) | Node::Covariance(_, _)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Expr(Rc<Node>);

impl Expr {
    pub(crate) fn from_node(node: Node) -> Self {
        Self(Rc::new(node))
    }

    pub fn constant(value: f64) -> Self {
        Self::from_node(Node::Constant(value))
    }

    pub fn node(&self) -> &Node {
        &self.0
    }

    /// Identity of the node, stable for as long as any handle to it is alive.
    pub(crate) fn key(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn as_constant(&self) -> Option<f64> {
        match self.node() {
            Node::Constant(v) => Some(*v),
            _ => None,
        }
    }

    fn unary(op: UnaryOp, operand: Expr) -> Self {
        Self::from_node(Node::Unary(op, operand))
    }

    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Self::from_node(Node::Binary(op, lhs, rhs))
    }

    pub fn ln(&self) -> Self {
        Self::unary(UnaryOp::Ln, self.clone())
    }

    pub fn exp(&self) -> Self {
        Self::unary(UnaryOp::Exp, self.clone())
    }

    pub fn pow(&self, exponent: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Pow, self.clone(), exponent.into())
    }

    pub fn recip(&self) -> Self {
        self.pow(-1.0)
    }

    /// Sum-reduction over a set of expressions. An empty set sums to zero.
    pub fn sum<I>(terms: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Expr>,
    {
        let terms: Vec<Expr> = terms.into_iter().map(Into::into).collect();
        if terms.is_empty() {
            return Self::constant(0.0);
        }
        Self::from_node(Node::Sum(terms))
    }

    /// Visits every distinct node reachable from `self` exactly once.
    pub(crate) fn walk(&self, mut visit: impl FnMut(&Expr)) {
        let mut seen = HashSet::new();
        let mut pending = vec![self];
        while let Some(expr) = pending.pop() {
            if !seen.insert(expr.key()) {
                continue;
            }
            visit(expr);
            pending.extend(expr.node().children());
        }
    }

    /// State variables referenced anywhere in the graph.
    pub fn variables(&self) -> BTreeSet<Var> {
        let mut vars = BTreeSet::new();
        self.walk(|e| {
            if let Node::Variable(v) = e.node() {
                vars.insert(*v);
            }
        });
        vars
    }

    pub fn shocks(&self) -> BTreeSet<Shock> {
        let mut shocks = BTreeSet::new();
        self.walk(|e| {
            if let Node::Shock(s) = e.node() {
                shocks.insert(*s);
            }
        });
        shocks
    }

    pub fn networks(&self) -> BTreeSet<usize> {
        let mut networks = BTreeSet::new();
        self.walk(|e| {
            if let Node::Network(id, _) = e.node() {
                networks.insert(id.0);
            }
        });
        networks
    }

    pub fn contains_operator(&self) -> bool {
        let mut found = false;
        self.walk(|e| found |= e.node().is_operator());
        found
    }

    /// Operator nodes reachable without passing through another operator.
    pub(crate) fn outer_operators(&self) -> Vec<Expr> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = vec![self];
        while let Some(expr) = pending.pop() {
            if !seen.insert(expr.key()) {
                continue;
            }
            if expr.node().is_operator() {
                found.push(expr.clone());
            } else {
                pending.extend(expr.node().children());
            }
        }
        found
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }

        match self.node() {
            Node::Constant(v) => write!(f, "{v}"),
            Node::Variable(v) => write!(f, "{v}"),
            Node::Shock(s) => write!(f, "{s}"),
            Node::Unary(UnaryOp::Neg, a) => write!(f, "-{a}"),
            Node::Unary(UnaryOp::Ln, a) => write!(f, "ln({a})"),
            Node::Unary(UnaryOp::Exp, a) => write!(f, "exp({a})"),
            Node::Binary(op, a, b) => {
                let symbol = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Pow => "^",
                };
                write!(f, "({a} {symbol} {b})")
            }
            Node::Sum(terms) => {
                write!(f, "sum(")?;
                list(f, terms)?;
                write!(f, ")")
            }
            Node::Network(id, inputs) => {
                write!(f, "net{}(", id.0)?;
                list(f, inputs)?;
                write!(f, ")")
            }
            Node::Drift(a) => write!(f, "drift({a})"),
            Node::Variance(a) => write!(f, "var({a})"),
            Node::Covariance(a, b) => write!(f, "covar({a}, {b})"),
        }
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::constant(value)
    }
}

impl From<Var> for Expr {
    fn from(var: Var) -> Self {
        var.expr()
    }
}

impl From<Shock> for Expr {
    fn from(shock: Shock) -> Self {
        shock.expr()
    }
}

impl From<&Expr> for Expr {
    fn from(expr: &Expr) -> Self {
        expr.clone()
    }
}

impl Sum for Expr {
    fn sum<I: Iterator<Item = Expr>>(iter: I) -> Self {
        Expr::sum(iter)
    }
}

impl<'a> Sum<&'a Expr> for Expr {
    fn sum<I: Iterator<Item = &'a Expr>>(iter: I) -> Self {
        Expr::sum(iter.cloned())
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl_binary_op!(@owned $trait, $method, $op, Expr, Expr);
        impl_binary_op!(@owned $trait, $method, $op, Expr, f64);
        impl_binary_op!(@owned $trait, $method, $op, f64, Expr);
        impl_binary_op!(@owned $trait, $method, $op, Expr, Var);
        impl_binary_op!(@owned $trait, $method, $op, Var, Expr);
        impl_binary_op!(@owned $trait, $method, $op, Var, Var);
        impl_binary_op!(@owned $trait, $method, $op, Var, f64);
        impl_binary_op!(@owned $trait, $method, $op, f64, Var);

        impl<'a> $trait<&'a Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: &'a Expr) -> Expr {
                Expr::binary($op, self, rhs.clone())
            }
        }
        impl<'a> $trait<Expr> for &'a Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self.clone(), rhs)
            }
        }
        impl<'a, 'b> $trait<&'b Expr> for &'a Expr {
            type Output = Expr;
            fn $method(self, rhs: &'b Expr) -> Expr {
                Expr::binary($op, self.clone(), rhs.clone())
            }
        }
        impl<'a> $trait<f64> for &'a Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                Expr::binary($op, self.clone(), Expr::constant(rhs))
            }
        }
        impl<'a> $trait<&'a Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: &'a Expr) -> Expr {
                Expr::binary($op, Expr::constant(self), rhs.clone())
            }
        }
        impl<'a> $trait<&'a Expr> for Var {
            type Output = Expr;
            fn $method(self, rhs: &'a Expr) -> Expr {
                Expr::binary($op, self.expr(), rhs.clone())
            }
        }
        impl<'a> $trait<Var> for &'a Expr {
            type Output = Expr;
            fn $method(self, rhs: Var) -> Expr {
                Expr::binary($op, self.clone(), rhs.expr())
            }
        }
    };
    (@owned $trait:ident, $method:ident, $op:expr, $lhs:ty, $rhs:ty) => {
        impl $trait<$rhs> for $lhs {
            type Output = Expr;
            fn $method(self, rhs: $rhs) -> Expr {
                Expr::binary($op, Expr::from(self), Expr::from(rhs))
            }
        }
    };
}

impl_binary_op!(Add, add, BinaryOp::Add);
impl_binary_op!(Sub, sub, BinaryOp::Sub);
impl_binary_op!(Mul, mul, BinaryOp::Mul);
impl_binary_op!(Div, div, BinaryOp::Div);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::unary(UnaryOp::Neg, self)
    }
}

impl<'a> Neg for &'a Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::unary(UnaryOp::Neg, self.clone())
    }
}

impl Neg for Var {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::unary(UnaryOp::Neg, self.expr())
    }
}
