//! Symbolic expression graph, differentiation, and compilation to numeric tapes.
//!
//! This module is the algebra substrate for the filter designer. Expressions are
//! nodes in an append-only arena ([`ExprGraph`]) identified by [`ExprId`]; the
//! arena hash-conses nodes and constant-folds at construction time, so trivial
//! terms (`x + 0`, `1 * x`, `cos(0)`) never materialize. Matrices of expressions
//! are represented by [`SymMatrix`], which tags a row-major entry buffer with a
//! shape and tracks *structural zeros* (`None` entries) so that downstream
//! Jacobians can expose their sparsity pattern and be densified on demand.
//!
//! # Tracing
//!
//! Symbolic construction happens inside [`trace`], which installs a fresh graph
//! in thread-local storage and returns it, together with the closure's result,
//! once the closure finishes:
//!
//! ```rust
//! use eskf_designer::expr::{trace, SymMatrix, Function};
//! use nalgebra::DMatrix;
//!
//! let (mut graph, (x, y)) = trace(|| {
//!     let x = SymMatrix::sym("x", 2, 1);
//!     let y = &x.transpose() * &x; // 1x1: squared norm
//!     (x, y)
//! });
//! let jac = graph.jacobian(&y, &x).unwrap();
//! let func = Function::compile(&graph, "dy_dx", &[x], &[jac]).unwrap();
//! let out = func.call(&[DMatrix::from_row_slice(2, 1, &[3.0, 4.0])]);
//! assert_eq!(out[0][(0, 0)], 6.0);
//! assert_eq!(out[0][(0, 1)], 8.0);
//! ```
//!
//! The thread-local indirection keeps operator syntax (`&a + &b`, `&r * &v`)
//! available to model code without threading a graph handle through every
//! signature. After the trace, the owning code (the designer) holds the graph
//! and performs differentiation, densification, and compilation on it directly.
//!
//! # Numeric boundary
//!
//! Compiled [`Function`]s evaluate over [`nalgebra::DMatrix<f64>`], the same
//! numeric types the downstream filter runtimes use.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::Write as _;
use std::ops::{Add, Mul, Neg, Sub};

use nalgebra::DMatrix;
use thiserror::Error;

/// Errors produced by differentiation and compilation.
#[derive(Debug, Error)]
pub enum ExprError {
    /// A differentiation denominator or function input entry is not a plain variable.
    #[error("expression is not a variable: {0}")]
    NotAVariable(String),
    /// The same variable appears twice in a differentiation denominator.
    #[error("duplicate differentiation variable: {0}")]
    DuplicateVariable(String),
    /// A compiled function references a variable not bound by any input.
    #[error("free variable not bound by any input of `{function}`: {variable}")]
    FreeVariable { function: String, variable: String },
    /// An operand shape is incompatible with the requested operation.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
}

/// Handle to a scalar expression node inside an [`ExprGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(u32);

impl ExprId {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Scalar expression node. Constants store their bit pattern so the node can be
/// hashed for interning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Node {
    Const(u64),
    Var(u32),
    Add(ExprId, ExprId),
    Sub(ExprId, ExprId),
    Mul(ExprId, ExprId),
    Div(ExprId, ExprId),
    Neg(ExprId),
    Sin(ExprId),
    Cos(ExprId),
    Sqrt(ExprId),
}

/// Append-only arena of scalar expression nodes with hash-consing and
/// construction-time constant folding.
#[derive(Debug, Default)]
pub struct ExprGraph {
    nodes: Vec<Node>,
    interned: HashMap<Node, ExprId>,
    vars: Vec<String>,
}

impl ExprGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes currently in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn intern(&mut self, node: Node) -> ExprId {
        if let Some(&id) = self.interned.get(&node) {
            return id;
        }
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.interned.insert(node, id);
        id
    }

    /// Intern a floating-point constant. `-0.0` is canonicalized to `0.0` so
    /// structural-zero detection stays consistent.
    pub fn constant(&mut self, value: f64) -> ExprId {
        let value = if value == 0.0 { 0.0 } else { value };
        self.intern(Node::Const(value.to_bits()))
    }

    /// Create a fresh named variable. Each call creates a distinct variable,
    /// even for a repeated name.
    pub fn variable(&mut self, name: impl Into<String>) -> ExprId {
        let slot = self.vars.len() as u32;
        self.vars.push(name.into());
        self.intern(Node::Var(slot))
    }

    fn const_value(&self, id: ExprId) -> Option<f64> {
        match self.nodes[id.idx()] {
            Node::Const(bits) => Some(f64::from_bits(bits)),
            _ => None,
        }
    }

    /// Whether `id` is the literal constant zero.
    pub fn is_zero(&self, id: ExprId) -> bool {
        self.const_value(id) == Some(0.0)
    }

    fn is_one(&self, id: ExprId) -> bool {
        self.const_value(id) == Some(1.0)
    }

    /// Whether `id` is a plain variable node.
    pub fn is_variable(&self, id: ExprId) -> bool {
        matches!(self.nodes[id.idx()], Node::Var(_))
    }

    fn var_slot(&self, id: ExprId) -> Option<u32> {
        match self.nodes[id.idx()] {
            Node::Var(slot) => Some(slot),
            _ => None,
        }
    }

    pub fn add(&mut self, a: ExprId, b: ExprId) -> ExprId {
        if let (Some(x), Some(y)) = (self.const_value(a), self.const_value(b)) {
            return self.constant(x + y);
        }
        if self.is_zero(a) {
            return b;
        }
        if self.is_zero(b) {
            return a;
        }
        self.intern(Node::Add(a, b))
    }

    pub fn sub(&mut self, a: ExprId, b: ExprId) -> ExprId {
        if a == b {
            return self.constant(0.0);
        }
        if let (Some(x), Some(y)) = (self.const_value(a), self.const_value(b)) {
            return self.constant(x - y);
        }
        if self.is_zero(b) {
            return a;
        }
        if self.is_zero(a) {
            return self.neg(b);
        }
        self.intern(Node::Sub(a, b))
    }

    pub fn mul(&mut self, a: ExprId, b: ExprId) -> ExprId {
        if let (Some(x), Some(y)) = (self.const_value(a), self.const_value(b)) {
            return self.constant(x * y);
        }
        if self.is_zero(a) || self.is_zero(b) {
            return self.constant(0.0);
        }
        if self.is_one(a) {
            return b;
        }
        if self.is_one(b) {
            return a;
        }
        self.intern(Node::Mul(a, b))
    }

    pub fn div(&mut self, a: ExprId, b: ExprId) -> ExprId {
        if let (Some(x), Some(y)) = (self.const_value(a), self.const_value(b)) {
            return self.constant(x / y);
        }
        if self.is_zero(a) {
            return self.constant(0.0);
        }
        if self.is_one(b) {
            return a;
        }
        self.intern(Node::Div(a, b))
    }

    pub fn neg(&mut self, a: ExprId) -> ExprId {
        if let Some(x) = self.const_value(a) {
            return self.constant(-x);
        }
        if let Node::Neg(inner) = self.nodes[a.idx()] {
            return inner;
        }
        self.intern(Node::Neg(a))
    }

    pub fn sin(&mut self, a: ExprId) -> ExprId {
        if let Some(x) = self.const_value(a) {
            return self.constant(x.sin());
        }
        self.intern(Node::Sin(a))
    }

    pub fn cos(&mut self, a: ExprId) -> ExprId {
        if let Some(x) = self.const_value(a) {
            return self.constant(x.cos());
        }
        self.intern(Node::Cos(a))
    }

    pub fn sqrt(&mut self, a: ExprId) -> ExprId {
        if let Some(x) = self.const_value(a) {
            return self.constant(x.sqrt());
        }
        self.intern(Node::Sqrt(a))
    }

    /// Forward-mode derivative of `expr` with respect to the variable `var`.
    pub fn diff(&mut self, expr: ExprId, var: ExprId) -> Result<ExprId, ExprError> {
        let slot = match self.var_slot(var) {
            Some(slot) => slot,
            None => return Err(ExprError::NotAVariable(self.display(var).to_string())),
        };
        Ok(self.diff_slot(expr, slot))
    }

    /// Derivative sweep over the arena prefix reachable from `expr`. Children
    /// always precede parents in the arena, so a single in-order pass suffices;
    /// derivative nodes appended during the pass land past the snapshot bound
    /// and are never revisited.
    fn diff_slot(&mut self, expr: ExprId, slot: u32) -> ExprId {
        let zero = self.constant(0.0);
        let one = self.constant(1.0);
        let two = self.constant(2.0);
        let bound = expr.idx() + 1;
        let mut d = vec![zero; bound];
        for i in 0..bound {
            let node = self.nodes[i];
            d[i] = match node {
                Node::Const(_) => zero,
                Node::Var(s) => {
                    if s == slot {
                        one
                    } else {
                        zero
                    }
                }
                Node::Add(a, b) => {
                    let (da, db) = (d[a.idx()], d[b.idx()]);
                    self.add(da, db)
                }
                Node::Sub(a, b) => {
                    let (da, db) = (d[a.idx()], d[b.idx()]);
                    self.sub(da, db)
                }
                Node::Mul(a, b) => {
                    let (da, db) = (d[a.idx()], d[b.idx()]);
                    let t1 = self.mul(da, b);
                    let t2 = self.mul(a, db);
                    self.add(t1, t2)
                }
                Node::Div(a, b) => {
                    let (da, db) = (d[a.idx()], d[b.idx()]);
                    let t1 = self.mul(da, b);
                    let t2 = self.mul(a, db);
                    let num = self.sub(t1, t2);
                    let den = self.mul(b, b);
                    self.div(num, den)
                }
                Node::Neg(a) => {
                    let da = d[a.idx()];
                    self.neg(da)
                }
                Node::Sin(a) => {
                    let da = d[a.idx()];
                    let c = self.cos(a);
                    self.mul(c, da)
                }
                Node::Cos(a) => {
                    let da = d[a.idx()];
                    let s = self.sin(a);
                    let t = self.mul(s, da);
                    self.neg(t)
                }
                Node::Sqrt(a) => {
                    let da = d[a.idx()];
                    let r = self.sqrt(a);
                    let den = self.mul(two, r);
                    self.div(da, den)
                }
            };
        }
        d[expr.idx()]
    }

    /// Jacobian ∂`expr`/∂`wrt` of a column expression with respect to a column
    /// of distinct variables. Derivative entries that fold to zero become
    /// structural zeros of the result, so the Jacobian carries its sparsity
    /// pattern. A zero-row `wrt` yields an empty-column matrix, not an error.
    pub fn jacobian(&mut self, expr: &SymMatrix, wrt: &SymMatrix) -> Result<SymMatrix, ExprError> {
        if expr.cols != 1 {
            return Err(ExprError::ShapeMismatch {
                expected: "column vector numerator".into(),
                actual: format!("{}x{}", expr.rows, expr.cols),
            });
        }
        if wrt.cols != 1 {
            return Err(ExprError::ShapeMismatch {
                expected: "column vector denominator".into(),
                actual: format!("{}x{}", wrt.rows, wrt.cols),
            });
        }
        let mut slots = Vec::with_capacity(wrt.rows);
        let mut seen = HashSet::new();
        for r in 0..wrt.rows {
            let id = wrt.data[r]
                .ok_or_else(|| ExprError::NotAVariable("structural zero entry".into()))?;
            let slot = self
                .var_slot(id)
                .ok_or_else(|| ExprError::NotAVariable(self.display(id).to_string()))?;
            if !seen.insert(slot) {
                return Err(ExprError::DuplicateVariable(
                    self.vars[slot as usize].clone(),
                ));
            }
            slots.push(slot);
        }
        let mut data = Vec::with_capacity(expr.rows * slots.len());
        for r in 0..expr.rows {
            match expr.data[r] {
                None => data.extend(std::iter::repeat_n(None, slots.len())),
                Some(e) => {
                    for &slot in &slots {
                        let d = self.diff_slot(e, slot);
                        data.push(if self.is_zero(d) { None } else { Some(d) });
                    }
                }
            }
        }
        Ok(SymMatrix {
            rows: expr.rows,
            cols: slots.len(),
            data,
        })
    }

    /// Human-readable rendering of a scalar expression.
    pub fn display(&self, id: ExprId) -> ExprDisplay<'_> {
        ExprDisplay { graph: self, id }
    }

    /// Render a symbolic matrix, one row per line, structural zeros as `0`.
    pub fn format_matrix(&self, m: &SymMatrix) -> String {
        let mut s = String::from("[");
        for r in 0..m.rows {
            if r > 0 {
                s.push_str(";\n ");
            }
            for c in 0..m.cols {
                if c > 0 {
                    s.push_str(", ");
                }
                match m.entry(r, c) {
                    None => s.push('0'),
                    Some(id) => {
                        let _ = write!(s, "{}", self.display(id));
                    }
                }
            }
        }
        s.push(']');
        s
    }

    // Precedence tiers: additive 1, multiplicative 2, unary 3, atoms 4.
    fn fmt_expr(&self, f: &mut fmt::Formatter<'_>, id: ExprId, min_prec: u8) -> fmt::Result {
        let node = self.nodes[id.idx()];
        let prec = match node {
            Node::Add(..) | Node::Sub(..) => 1,
            Node::Mul(..) | Node::Div(..) => 2,
            Node::Neg(..) => 3,
            _ => 4,
        };
        if prec < min_prec {
            write!(f, "(")?;
            self.fmt_expr(f, id, 0)?;
            return write!(f, ")");
        }
        match node {
            Node::Const(bits) => write!(f, "{:?}", f64::from_bits(bits)),
            Node::Var(slot) => write!(f, "{}", self.vars[slot as usize]),
            Node::Add(a, b) => {
                self.fmt_expr(f, a, 1)?;
                write!(f, " + ")?;
                self.fmt_expr(f, b, 1)
            }
            Node::Sub(a, b) => {
                self.fmt_expr(f, a, 1)?;
                write!(f, " - ")?;
                self.fmt_expr(f, b, 2)
            }
            Node::Mul(a, b) => {
                self.fmt_expr(f, a, 2)?;
                write!(f, "*")?;
                self.fmt_expr(f, b, 2)
            }
            Node::Div(a, b) => {
                self.fmt_expr(f, a, 2)?;
                write!(f, "/")?;
                self.fmt_expr(f, b, 3)
            }
            Node::Neg(a) => {
                write!(f, "-")?;
                self.fmt_expr(f, a, 3)
            }
            Node::Sin(a) => {
                write!(f, "sin(")?;
                self.fmt_expr(f, a, 0)?;
                write!(f, ")")
            }
            Node::Cos(a) => {
                write!(f, "cos(")?;
                self.fmt_expr(f, a, 0)?;
                write!(f, ")")
            }
            Node::Sqrt(a) => {
                write!(f, "sqrt(")?;
                self.fmt_expr(f, a, 0)?;
                write!(f, ")")
            }
        }
    }
}

/// Borrowing [`fmt::Display`] adapter returned by [`ExprGraph::display`].
pub struct ExprDisplay<'a> {
    graph: &'a ExprGraph,
    id: ExprId,
}

impl fmt::Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.graph.fmt_expr(f, self.id, 0)
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<ExprGraph>> = const { RefCell::new(None) };
}

/// Run `f` with a fresh thread-local expression graph installed, and return
/// the graph together with the closure's result. All [`SymMatrix`] operator
/// syntax must run inside a trace.
pub fn trace<R>(f: impl FnOnce() -> R) -> (ExprGraph, R) {
    let prev = ACTIVE.with(|g| g.borrow_mut().replace(ExprGraph::new()));
    let result = f();
    let graph = ACTIVE.with(|g| {
        let mut slot = g.borrow_mut();
        let graph = slot.take().expect("trace graph vanished");
        *slot = prev;
        graph
    });
    (graph, result)
}

fn with_graph<R>(f: impl FnOnce(&mut ExprGraph) -> R) -> R {
    ACTIVE.with(|g| {
        let mut slot = g.borrow_mut();
        let graph = slot
            .as_mut()
            .expect("symbolic matrix operations require an active trace(..)");
        f(graph)
    })
}

/// Shape-tagged matrix of scalar expressions, row-major, with `None` marking a
/// structural zero. Equality compares shapes and entry identities, which makes
/// it usable to assert that two constructions produced the very same graph
/// nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct SymMatrix {
    rows: usize,
    cols: usize,
    data: Vec<Option<ExprId>>,
}

impl SymMatrix {
    pub(crate) fn from_data(rows: usize, cols: usize, data: Vec<Option<ExprId>>) -> Self {
        assert_eq!(data.len(), rows * cols, "entry buffer does not match shape");
        Self { rows, cols, data }
    }

    /// Matrix of fresh named variables. A 1x1 symbol keeps the bare name, a
    /// column gets `name_r`, a general matrix `name_r_c`.
    pub fn sym(name: &str, rows: usize, cols: usize) -> Self {
        with_graph(|g| {
            let mut data = Vec::with_capacity(rows * cols);
            for r in 0..rows {
                for c in 0..cols {
                    let vname = if rows == 1 && cols == 1 {
                        name.to_string()
                    } else if cols == 1 {
                        format!("{name}_{r}")
                    } else {
                        format!("{name}_{r}_{c}")
                    };
                    data.push(Some(g.variable(vname)));
                }
            }
            Self { rows, cols, data }
        })
    }

    /// All-structural-zero matrix. Does not touch the graph, so it is usable
    /// outside a trace.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![None; rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let one = with_graph(|g| g.constant(1.0));
        let mut data = vec![None; n * n];
        for i in 0..n {
            data[i * n + i] = Some(one);
        }
        Self {
            rows: n,
            cols: n,
            data,
        }
    }

    /// 1x1 constant.
    pub fn scalar(value: f64) -> Self {
        if value == 0.0 {
            return Self::zeros(1, 1);
        }
        let id = with_graph(|g| g.constant(value));
        Self {
            rows: 1,
            cols: 1,
            data: vec![Some(id)],
        }
    }

    /// Constant column vector; zero entries become structural zeros.
    pub fn from_column_slice(values: &[f64]) -> Self {
        with_graph(|g| {
            let data = values
                .iter()
                .map(|&v| if v == 0.0 { None } else { Some(g.constant(v)) })
                .collect();
            Self {
                rows: values.len(),
                cols: 1,
                data,
            }
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn is_scalar(&self) -> bool {
        self.rows == 1 && self.cols == 1
    }

    /// Raw entry handle; `None` is a structural zero.
    pub fn entry(&self, r: usize, c: usize) -> Option<ExprId> {
        self.data[r * self.cols + c]
    }

    /// Single entry as a 1x1 matrix.
    pub fn element(&self, r: usize, c: usize) -> SymMatrix {
        SymMatrix {
            rows: 1,
            cols: 1,
            data: vec![self.entry(r, c)],
        }
    }

    pub fn transpose(&self) -> SymMatrix {
        let mut data = Vec::with_capacity(self.rows * self.cols);
        for c in 0..self.cols {
            for r in 0..self.rows {
                data.push(self.entry(r, c));
            }
        }
        SymMatrix {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Shorthand for [`SymMatrix::transpose`].
    pub fn t(&self) -> SymMatrix {
        self.transpose()
    }

    /// Whether every entry is explicitly populated (no structural zeros).
    pub fn is_dense(&self) -> bool {
        self.data.iter().all(Option::is_some)
    }

    /// Replace structural zeros with the literal zero constant, yielding an
    /// unconditionally fully-populated representation. Idempotent.
    pub fn densify(&self, graph: &mut ExprGraph) -> SymMatrix {
        let zero = graph.constant(0.0);
        SymMatrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|e| Some(e.unwrap_or(zero))).collect(),
        }
    }

    fn map_scalar(&self, mut f: impl FnMut(&mut ExprGraph, ExprId) -> ExprId) -> SymMatrix {
        with_graph(|g| {
            let zero = g.constant(0.0);
            let data = self
                .data
                .iter()
                .map(|e| {
                    let r = f(g, e.unwrap_or(zero));
                    if g.is_zero(r) { None } else { Some(r) }
                })
                .collect();
            SymMatrix {
                rows: self.rows,
                cols: self.cols,
                data,
            }
        })
    }

    /// Elementwise sine.
    pub fn sin(&self) -> SymMatrix {
        self.map_scalar(|g, e| g.sin(e))
    }

    /// Elementwise cosine. Note `cos(0) = 1`, so structural zeros densify.
    pub fn cos(&self) -> SymMatrix {
        self.map_scalar(|g, e| g.cos(e))
    }

    /// Euclidean (Frobenius) norm as a 1x1 matrix.
    pub fn norm2(&self) -> SymMatrix {
        let id = with_graph(|g| {
            let mut acc = g.constant(0.0);
            for e in self.data.iter().flatten() {
                let sq = g.mul(*e, *e);
                acc = g.add(acc, sq);
            }
            g.sqrt(acc)
        });
        SymMatrix {
            rows: 1,
            cols: 1,
            data: vec![Some(id)],
        }
    }

    fn scale(scalar: Option<ExprId>, m: &SymMatrix) -> SymMatrix {
        match scalar {
            None => SymMatrix::zeros(m.rows, m.cols),
            Some(s) => with_graph(|g| {
                let data = m
                    .data
                    .iter()
                    .map(|e| {
                        e.and_then(|id| {
                            let r = g.mul(s, id);
                            if g.is_zero(r) { None } else { Some(r) }
                        })
                    })
                    .collect();
                SymMatrix {
                    rows: m.rows,
                    cols: m.cols,
                    data,
                }
            }),
        }
    }

    fn matmul(&self, rhs: &SymMatrix) -> SymMatrix {
        assert_eq!(
            self.cols, rhs.rows,
            "matrix product shape mismatch: {}x{} * {}x{}",
            self.rows, self.cols, rhs.rows, rhs.cols
        );
        with_graph(|g| {
            let mut data = Vec::with_capacity(self.rows * rhs.cols);
            for r in 0..self.rows {
                for c in 0..rhs.cols {
                    let mut acc: Option<ExprId> = None;
                    for k in 0..self.cols {
                        if let (Some(a), Some(b)) = (self.entry(r, k), rhs.entry(k, c)) {
                            let t = g.mul(a, b);
                            acc = Some(match acc {
                                None => t,
                                Some(prev) => g.add(prev, t),
                            });
                        }
                    }
                    data.push(acc.filter(|&id| !g.is_zero(id)));
                }
            }
            SymMatrix {
                rows: self.rows,
                cols: rhs.cols,
                data,
            }
        })
    }
}

/// Stack matrices with equal column counts on top of each other. This is the
/// assembly step that turns a model's perturbation/noise symbol lists into the
/// single column vector the Jacobian operator differentiates against.
pub fn vertcat(parts: &[SymMatrix]) -> SymMatrix {
    let cols = parts.first().map_or(1, SymMatrix::cols);
    let mut rows = 0;
    let mut data = Vec::new();
    for part in parts {
        assert_eq!(
            part.cols, cols,
            "vertcat requires equal column counts, got {} and {}",
            cols, part.cols
        );
        rows += part.rows;
        data.extend_from_slice(&part.data);
    }
    SymMatrix { rows, cols, data }
}

/// Concatenate matrices with equal row counts side by side.
pub fn horzcat(parts: &[SymMatrix]) -> SymMatrix {
    let rows = parts.first().map_or(1, SymMatrix::rows);
    let mut cols = 0;
    for part in parts {
        assert_eq!(
            part.rows, rows,
            "horzcat requires equal row counts, got {} and {}",
            rows, part.rows
        );
        cols += part.cols;
    }
    let mut data = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for part in parts {
            for c in 0..part.cols {
                data.push(part.entry(r, c));
            }
        }
    }
    SymMatrix { rows, cols, data }
}

impl Add for &SymMatrix {
    type Output = SymMatrix;

    fn add(self, rhs: &SymMatrix) -> SymMatrix {
        assert_eq!(
            self.shape(),
            rhs.shape(),
            "matrix addition shape mismatch: {}x{} + {}x{}",
            self.rows,
            self.cols,
            rhs.rows,
            rhs.cols
        );
        with_graph(|g| {
            let data = self
                .data
                .iter()
                .zip(&rhs.data)
                .map(|(a, b)| match (a, b) {
                    (None, None) => None,
                    (Some(x), None) => Some(*x),
                    (None, Some(y)) => Some(*y),
                    (Some(x), Some(y)) => {
                        let r = g.add(*x, *y);
                        if g.is_zero(r) { None } else { Some(r) }
                    }
                })
                .collect();
            SymMatrix {
                rows: self.rows,
                cols: self.cols,
                data,
            }
        })
    }
}

impl Add for SymMatrix {
    type Output = SymMatrix;

    fn add(self, rhs: SymMatrix) -> SymMatrix {
        &self + &rhs
    }
}

impl Sub for &SymMatrix {
    type Output = SymMatrix;

    fn sub(self, rhs: &SymMatrix) -> SymMatrix {
        assert_eq!(
            self.shape(),
            rhs.shape(),
            "matrix subtraction shape mismatch: {}x{} - {}x{}",
            self.rows,
            self.cols,
            rhs.rows,
            rhs.cols
        );
        with_graph(|g| {
            let data = self
                .data
                .iter()
                .zip(&rhs.data)
                .map(|(a, b)| match (a, b) {
                    (None, None) => None,
                    (Some(x), None) => Some(*x),
                    (None, Some(y)) => {
                        let r = g.neg(*y);
                        Some(r)
                    }
                    (Some(x), Some(y)) => {
                        let r = g.sub(*x, *y);
                        if g.is_zero(r) { None } else { Some(r) }
                    }
                })
                .collect();
            SymMatrix {
                rows: self.rows,
                cols: self.cols,
                data,
            }
        })
    }
}

impl Sub for SymMatrix {
    type Output = SymMatrix;

    fn sub(self, rhs: SymMatrix) -> SymMatrix {
        &self - &rhs
    }
}

impl Neg for &SymMatrix {
    type Output = SymMatrix;

    fn neg(self) -> SymMatrix {
        with_graph(|g| {
            let data = self.data.iter().map(|e| e.map(|id| g.neg(id))).collect();
            SymMatrix {
                rows: self.rows,
                cols: self.cols,
                data,
            }
        })
    }
}

impl Neg for SymMatrix {
    type Output = SymMatrix;

    fn neg(self) -> SymMatrix {
        -&self
    }
}

/// `*` is the matrix product; when either operand is 1x1 it acts as a scalar
/// scaling instead, mirroring how the models write `sin(angle) * hat(axis)`.
impl Mul for &SymMatrix {
    type Output = SymMatrix;

    fn mul(self, rhs: &SymMatrix) -> SymMatrix {
        if self.is_scalar() {
            SymMatrix::scale(self.data[0], rhs)
        } else if rhs.is_scalar() {
            SymMatrix::scale(rhs.data[0], self)
        } else {
            self.matmul(rhs)
        }
    }
}

impl Mul for SymMatrix {
    type Output = SymMatrix;

    fn mul(self, rhs: SymMatrix) -> SymMatrix {
        &self * &rhs
    }
}

/// One tape instruction of a compiled function. Registers index into a flat
/// work buffer; loads address input matrices by (argument, row, column).
#[derive(Debug, Clone, Copy)]
pub(crate) enum TapeOp {
    Load {
        dst: usize,
        arg: usize,
        row: usize,
        col: usize,
    },
    Const {
        dst: usize,
        value: f64,
    },
    Add {
        dst: usize,
        a: usize,
        b: usize,
    },
    Sub {
        dst: usize,
        a: usize,
        b: usize,
    },
    Mul {
        dst: usize,
        a: usize,
        b: usize,
    },
    Div {
        dst: usize,
        a: usize,
        b: usize,
    },
    Neg {
        dst: usize,
        a: usize,
    },
    Sin {
        dst: usize,
        a: usize,
    },
    Cos {
        dst: usize,
        a: usize,
    },
    Sqrt {
        dst: usize,
        a: usize,
    },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ArgShape {
    pub rows: usize,
    pub cols: usize,
}

/// One output matrix of a compiled function: shape plus, per row-major entry,
/// the register holding its value (`None` for structural zeros).
#[derive(Debug, Clone)]
pub(crate) struct OutSpec {
    pub rows: usize,
    pub cols: usize,
    pub regs: Vec<Option<usize>>,
}

/// A named, compiled numeric function: the reachable subgraph of its outputs
/// flattened into a straight-line evaluation tape over a register file.
#[derive(Debug, Clone)]
pub struct Function {
    pub(crate) name: String,
    pub(crate) args: Vec<ArgShape>,
    pub(crate) outs: Vec<OutSpec>,
    pub(crate) tape: Vec<TapeOp>,
    pub(crate) work: usize,
}

impl Function {
    /// Compile `outputs` into a tape, binding variables by position in
    /// `inputs`. Every input entry must be a plain variable; every variable
    /// reachable from the outputs must be bound by some input.
    pub fn compile(
        graph: &ExprGraph,
        name: &str,
        inputs: &[SymMatrix],
        outputs: &[SymMatrix],
    ) -> Result<Function, ExprError> {
        // Variable slot -> (argument, row, col).
        let mut binding: HashMap<u32, (usize, usize, usize)> = HashMap::new();
        for (ai, m) in inputs.iter().enumerate() {
            for r in 0..m.rows {
                for c in 0..m.cols {
                    let id = m.entry(r, c).ok_or_else(|| {
                        ExprError::NotAVariable(format!(
                            "input {ai} of `{name}` has a structural-zero entry"
                        ))
                    })?;
                    let slot = graph.var_slot(id).ok_or_else(|| {
                        ExprError::NotAVariable(format!(
                            "input {ai} of `{name}`: {}",
                            graph.display(id)
                        ))
                    })?;
                    binding.insert(slot, (ai, r, c));
                }
            }
        }

        // Mark nodes reachable from the outputs.
        let mut needed = vec![false; graph.nodes.len()];
        let mut stack: Vec<ExprId> = outputs
            .iter()
            .flat_map(|m| m.data.iter().copied().flatten())
            .collect();
        while let Some(id) = stack.pop() {
            if needed[id.idx()] {
                continue;
            }
            needed[id.idx()] = true;
            match graph.nodes[id.idx()] {
                Node::Add(a, b) | Node::Sub(a, b) | Node::Mul(a, b) | Node::Div(a, b) => {
                    stack.push(a);
                    stack.push(b);
                }
                Node::Neg(a) | Node::Sin(a) | Node::Cos(a) | Node::Sqrt(a) => stack.push(a),
                Node::Const(_) | Node::Var(_) => {}
            }
        }

        // Emit in arena order; children always come first.
        let mut reg_of: Vec<Option<usize>> = vec![None; graph.nodes.len()];
        let mut tape = Vec::new();
        let mut work = 0;
        let reg = |reg_of: &[Option<usize>], id: ExprId| -> usize {
            reg_of[id.idx()].expect("operand scheduled before use")
        };
        for i in 0..graph.nodes.len() {
            if !needed[i] {
                continue;
            }
            let dst = work;
            work += 1;
            reg_of[i] = Some(dst);
            match graph.nodes[i] {
                Node::Const(bits) => tape.push(TapeOp::Const {
                    dst,
                    value: f64::from_bits(bits),
                }),
                Node::Var(slot) => {
                    let &(arg, row, col) = binding.get(&slot).ok_or_else(|| {
                        ExprError::FreeVariable {
                            function: name.to_string(),
                            variable: graph.vars[slot as usize].clone(),
                        }
                    })?;
                    tape.push(TapeOp::Load { dst, arg, row, col });
                }
                Node::Add(a, b) => tape.push(TapeOp::Add {
                    dst,
                    a: reg(&reg_of, a),
                    b: reg(&reg_of, b),
                }),
                Node::Sub(a, b) => tape.push(TapeOp::Sub {
                    dst,
                    a: reg(&reg_of, a),
                    b: reg(&reg_of, b),
                }),
                Node::Mul(a, b) => tape.push(TapeOp::Mul {
                    dst,
                    a: reg(&reg_of, a),
                    b: reg(&reg_of, b),
                }),
                Node::Div(a, b) => tape.push(TapeOp::Div {
                    dst,
                    a: reg(&reg_of, a),
                    b: reg(&reg_of, b),
                }),
                Node::Neg(a) => tape.push(TapeOp::Neg {
                    dst,
                    a: reg(&reg_of, a),
                }),
                Node::Sin(a) => tape.push(TapeOp::Sin {
                    dst,
                    a: reg(&reg_of, a),
                }),
                Node::Cos(a) => tape.push(TapeOp::Cos {
                    dst,
                    a: reg(&reg_of, a),
                }),
                Node::Sqrt(a) => tape.push(TapeOp::Sqrt {
                    dst,
                    a: reg(&reg_of, a),
                }),
            }
        }

        let args = inputs
            .iter()
            .map(|m| ArgShape {
                rows: m.rows,
                cols: m.cols,
            })
            .collect();
        let outs = outputs
            .iter()
            .map(|m| OutSpec {
                rows: m.rows,
                cols: m.cols,
                regs: m.data.iter().map(|e| e.map(|id| reg(&reg_of, id))).collect(),
            })
            .collect();

        Ok(Function {
            name: name.to_string(),
            args,
            outs,
            tape,
            work,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_inputs(&self) -> usize {
        self.args.len()
    }

    pub fn n_outputs(&self) -> usize {
        self.outs.len()
    }

    /// Evaluate the tape. Panics if the argument count or any argument shape
    /// disagrees with the compiled signature.
    pub fn call(&self, args: &[DMatrix<f64>]) -> Vec<DMatrix<f64>> {
        assert_eq!(
            args.len(),
            self.args.len(),
            "`{}` expects {} arguments, got {}",
            self.name,
            self.args.len(),
            args.len()
        );
        for (i, (given, shape)) in args.iter().zip(&self.args).enumerate() {
            assert_eq!(
                (given.nrows(), given.ncols()),
                (shape.rows, shape.cols),
                "`{}` argument {} shape mismatch",
                self.name,
                i
            );
        }
        let mut w = vec![0.0f64; self.work];
        for op in &self.tape {
            match *op {
                TapeOp::Load { dst, arg, row, col } => w[dst] = args[arg][(row, col)],
                TapeOp::Const { dst, value } => w[dst] = value,
                TapeOp::Add { dst, a, b } => w[dst] = w[a] + w[b],
                TapeOp::Sub { dst, a, b } => w[dst] = w[a] - w[b],
                TapeOp::Mul { dst, a, b } => w[dst] = w[a] * w[b],
                TapeOp::Div { dst, a, b } => w[dst] = w[a] / w[b],
                TapeOp::Neg { dst, a } => w[dst] = -w[a],
                TapeOp::Sin { dst, a } => w[dst] = w[a].sin(),
                TapeOp::Cos { dst, a } => w[dst] = w[a].cos(),
                TapeOp::Sqrt { dst, a } => w[dst] = w[a].sqrt(),
            }
        }
        self.outs
            .iter()
            .map(|o| {
                DMatrix::from_fn(o.rows, o.cols, |r, c| {
                    o.regs[r * o.cols + c].map_or(0.0, |i| w[i])
                })
            })
            .collect()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:(", self.name)?;
        for (i, a) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}x{}", a.rows, a.cols)?;
        }
        write!(f, ") -> (")?;
        for (i, o) in self.outs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}x{}", o.rows, o.cols)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn constant_folding_collapses_trivial_terms() {
        let (mut graph, x) = trace(|| SymMatrix::sym("x", 1, 1));
        let xid = x.entry(0, 0).unwrap();
        let zero = graph.constant(0.0);
        let one = graph.constant(1.0);
        assert_eq!(graph.add(xid, zero), xid);
        assert_eq!(graph.mul(one, xid), xid);
        assert_eq!(graph.mul(zero, xid), zero);
        assert_eq!(graph.sub(xid, xid), zero);
        let neg = graph.neg(xid);
        assert_eq!(graph.neg(neg), xid);
        let two = graph.constant(2.0);
        let three = graph.constant(3.0);
        let five = graph.add(two, three);
        assert_eq!(graph.const_value(five), Some(5.0));
    }

    #[test]
    fn hash_consing_reuses_nodes() {
        let (mut graph, (a, b)) = trace(|| {
            let a = SymMatrix::sym("a", 1, 1);
            let b = SymMatrix::sym("b", 1, 1);
            (a, b)
        });
        let (a, b) = (a.entry(0, 0).unwrap(), b.entry(0, 0).unwrap());
        let s1 = graph.add(a, b);
        let s2 = graph.add(a, b);
        assert_eq!(s1, s2);
    }

    #[test]
    fn scalar_derivative_matches_closed_form() {
        // f(x) = x*x + sin(x), f'(x) = 2x + cos(x)
        let (mut graph, x) = trace(|| SymMatrix::sym("x", 1, 1));
        let xid = x.entry(0, 0).unwrap();
        let sq = graph.mul(xid, xid);
        let s = graph.sin(xid);
        let f_expr = graph.add(sq, s);
        let d = graph.diff(f_expr, xid).unwrap();

        let expr = SymMatrix::from_data(1, 1, vec![Some(d)]);
        let func = Function::compile(&graph, "df", &[x], &[expr]).unwrap();
        for &v in &[-1.3, 0.0, 0.4, 2.7] {
            let out = func.call(&[DMatrix::from_element(1, 1, v)]);
            assert_approx_eq!(out[0][(0, 0)], 2.0 * v + v.cos(), 1e-12);
        }
    }

    #[test]
    fn jacobian_matches_closed_form() {
        // f: R^3 -> R^2, f = [x*y^3 - sin(z), y*cos(x) - x^2]
        let (mut graph, (v, f_mat)) = trace(|| {
            let v = SymMatrix::sym("v", 3, 1);
            let (x, y, z) = (v.element(0, 0), v.element(1, 0), v.element(2, 0));
            let y3 = &(&y * &y) * &y;
            let f0 = &(&x * &y3) - &z.sin();
            let f1 = &(&y * &x.cos()) - &(&x * &x);
            let f_mat = vertcat(&[f0, f1]);
            (v, f_mat)
        });
        let jac = graph.jacobian(&f_mat, &v).unwrap();
        assert_eq!(jac.shape(), (2, 3));
        let func = Function::compile(&graph, "jac", &[v], &[jac]).unwrap();

        let (x, y, z) = (-0.5, 0.1, 1.2);
        let out = &func.call(&[DMatrix::from_column_slice(3, 1, &[x, y, z])])[0];
        let expected = [
            [y.powi(3), 3.0 * x * y * y, -z.cos()],
            [-y * x.sin() - 2.0 * x, x.cos(), 0.0],
        ];
        for r in 0..2 {
            for c in 0..3 {
                assert_approx_eq!(out[(r, c)], expected[r][c], 1e-12);
            }
        }
    }

    #[test]
    fn jacobian_tracks_structural_zeros() {
        let (mut graph, (v, f_mat)) = trace(|| {
            let v = SymMatrix::sym("v", 2, 1);
            // f = [v0; 3] -- second row does not depend on v at all.
            let f_mat = vertcat(&[v.element(0, 0), SymMatrix::scalar(3.0)]);
            (v, f_mat)
        });
        let jac = graph.jacobian(&f_mat, &v).unwrap();
        assert!(!jac.is_dense());
        assert!(jac.entry(0, 0).is_some());
        assert!(jac.entry(0, 1).is_none());
        assert!(jac.entry(1, 0).is_none());
        assert!(jac.entry(1, 1).is_none());
    }

    #[test]
    fn densify_is_idempotent() {
        let (mut graph, (v, f_mat)) = trace(|| {
            let v = SymMatrix::sym("v", 2, 1);
            let f_mat = vertcat(&[v.element(0, 0), SymMatrix::scalar(3.0)]);
            (v, f_mat)
        });
        let jac = graph.jacobian(&f_mat, &v).unwrap();
        let once = jac.densify(&mut graph);
        let twice = once.densify(&mut graph);
        assert!(once.is_dense());
        assert_eq!(once, twice);
    }

    #[test]
    fn jacobian_with_empty_denominator_is_empty_columns() {
        let (mut graph, (v, f_mat)) = trace(|| {
            let v = SymMatrix::sym("v", 2, 1);
            let f_mat = &v + &v;
            (v, f_mat)
        });
        let empty = SymMatrix::zeros(0, 1);
        let jac = graph.jacobian(&f_mat, &empty).unwrap();
        assert_eq!(jac.shape(), (2, 0));
        let _ = v;
    }

    #[test]
    fn jacobian_rejects_non_variable_denominator() {
        let (mut graph, (v, sum)) = trace(|| {
            let v = SymMatrix::sym("v", 2, 1);
            let sum = &v.element(0, 0) + &v.element(1, 0);
            (v, sum)
        });
        let err = graph.jacobian(&v.element(0, 0), &sum).unwrap_err();
        assert!(matches!(err, ExprError::NotAVariable(_)));
    }

    #[test]
    fn jacobian_rejects_duplicate_variables() {
        let (mut graph, v) = trace(|| SymMatrix::sym("v", 2, 1));
        let dup = vertcat(&[v.clone(), v.element(0, 0)]);
        let err = graph.jacobian(&v, &dup).unwrap_err();
        assert!(matches!(err, ExprError::DuplicateVariable(_)));
    }

    #[test]
    fn compile_rejects_free_variables() {
        let (graph, (x, y, sum)) = trace(|| {
            let x = SymMatrix::sym("x", 1, 1);
            let y = SymMatrix::sym("y", 1, 1);
            let sum = &x + &y;
            (x, y, sum)
        });
        let err = Function::compile(&graph, "f", &[x], &[sum]).unwrap_err();
        match err {
            ExprError::FreeVariable { variable, .. } => assert_eq!(variable, "y"),
            other => panic!("expected FreeVariable, got {other:?}"),
        }
        let _ = y;
    }

    #[test]
    fn matmul_and_transpose_evaluate_correctly() {
        let (graph, (a, b, prod)) = trace(|| {
            let a = SymMatrix::sym("a", 2, 3);
            let b = SymMatrix::sym("b", 3, 2);
            let prod = &a * &b;
            (a, b, prod)
        });
        let func = Function::compile(&graph, "prod", &[a, b], &[prod]).unwrap();
        let am = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let bm = DMatrix::from_row_slice(3, 2, &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let out = &func.call(&[am.clone(), bm.clone()])[0];
        let expected = &am * &bm;
        for r in 0..2 {
            for c in 0..2 {
                assert_approx_eq!(out[(r, c)], expected[(r, c)], 1e-12);
            }
        }
    }

    #[test]
    fn identity_product_is_a_no_op_on_the_graph() {
        // Multiplying by the symbolic identity must fold away entirely.
        let (_graph, (r, prod)) = trace(|| {
            let r = SymMatrix::sym("R", 3, 3);
            let prod = &r * &SymMatrix::identity(3);
            (r, prod)
        });
        assert_eq!(r, prod);
    }

    #[test]
    fn vertcat_stacks_row_major() {
        let (_graph, (a, b, stacked)) = trace(|| {
            let a = SymMatrix::sym("a", 2, 1);
            let b = SymMatrix::sym("b", 3, 1);
            let stacked = vertcat(&[a.clone(), b.clone()]);
            (a, b, stacked)
        });
        assert_eq!(stacked.shape(), (5, 1));
        assert_eq!(stacked.entry(0, 0), a.entry(0, 0));
        assert_eq!(stacked.entry(2, 0), b.entry(0, 0));
        assert_eq!(stacked.entry(4, 0), b.entry(2, 0));
    }

    #[test]
    fn multi_output_function_preserves_output_order() {
        let (graph, (x, f0, f1)) = trace(|| {
            let x = SymMatrix::sym("x", 1, 1);
            let f0 = &x + &x;
            let f1 = &x * &x;
            (x, f0, f1)
        });
        let func = Function::compile(&graph, "fs", &[x], &[f0, f1]).unwrap();
        let out = func.call(&[DMatrix::from_element(1, 1, 3.0)]);
        assert_approx_eq!(out[0][(0, 0)], 6.0, 1e-12);
        assert_approx_eq!(out[1][(0, 0)], 9.0, 1e-12);
    }

    #[test]
    fn norm2_matches_euclidean_norm() {
        let (graph, (v, n)) = trace(|| {
            let v = SymMatrix::sym("v", 3, 1);
            let n = v.norm2();
            (v, n)
        });
        let func = Function::compile(&graph, "norm", &[v], &[n]).unwrap();
        let out = func.call(&[DMatrix::from_column_slice(3, 1, &[3.0, 0.0, 4.0])]);
        assert_approx_eq!(out[0][(0, 0)], 5.0, 1e-12);
    }

    #[test]
    fn display_renders_expressions_readably() {
        let (graph, rendered) = trace(|| {
            let x = SymMatrix::sym("x", 1, 1);
            let y = SymMatrix::sym("y", 1, 1);
            let e = &(&x + &y) * &x.sin();
            e.entry(0, 0).unwrap()
        });
        let text = graph.display(rendered).to_string();
        assert_eq!(text, "(x + y)*sin(x)");
    }

    #[test]
    fn zero_sized_argument_is_accepted() {
        let (graph, (x, empty, f_mat)) = trace(|| {
            let x = SymMatrix::sym("x", 2, 1);
            let empty = SymMatrix::sym("e", 0, 1);
            let f_mat = &x + &x;
            (x, empty, f_mat)
        });
        let func = Function::compile(&graph, "f", &[x, empty], &[f_mat]).unwrap();
        let out = func.call(&[
            DMatrix::from_column_slice(2, 1, &[1.0, 2.0]),
            DMatrix::zeros(0, 1),
        ]);
        assert_approx_eq!(out[0][(0, 0)], 2.0, 1e-12);
        assert_approx_eq!(out[0][(1, 0)], 4.0, 1e-12);
    }
}
