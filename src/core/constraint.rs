//! Constraints `lower <= expr <= upper` and their attachment to nodes.
//!
//! Constraints are not nodes of the graph. Functions defined only on a part
//! of the real line (square root, logarithm, ...) attach the constraint
//! describing their domain to the node they create, and solvers collect all
//! constraints of a model through [`attached_constraints`].

use std::{collections::BTreeSet, rc::Rc};

use super::{
    base::Error,
    graph::{Expr, Graph},
    node::{FunctionBuilder, IntervalRule, NodeId, OrderRule},
    point::Point,
    value::{broadcast_to, Value},
};
use crate::{engine::Derivative, interval::Interval, ops::Term};

/// Kind of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Bound of a bare variable by constants.
    BoxBound,
    /// Any other constraint.
    General,
}

#[derive(Debug, Clone)]
pub(crate) struct ConstraintData {
    pub(crate) expr: NodeId,
    pub(crate) lower: Value,
    pub(crate) upper: Value,
    pub(crate) tol: f64,
    pub(crate) name: String,
    pub(crate) kind: ConstraintKind,
}

/// Constraint `lower <= expr <= upper`.
///
/// A positive tolerance relaxes the bounds when checking satisfaction. A
/// negative tolerance is a request for strict satisfaction which solvers may
/// honor; it does not tighten [`Constraint::is_satisfied`].
#[derive(Debug, Clone)]
pub struct Constraint<'g> {
    graph: &'g Graph,
    data: ConstraintData,
}

impl<'g> Constraint<'g> {
    fn new(expr: Expr<'g>, lower: Value, upper: Value, kind: ConstraintKind) -> Self {
        Self {
            graph: expr.graph(),
            data: ConstraintData {
                expr: expr.id(),
                lower,
                upper,
                tol: 0.0,
                name: format!("{}_constraint", expr.name()),
                kind,
            },
        }
    }

    pub(crate) fn from_data(graph: &'g Graph, data: ConstraintData) -> Self {
        Self { graph, data }
    }

    /// Constrained expression.
    pub fn expr(&self) -> Expr<'g> {
        self.graph.expr(self.data.expr)
    }

    /// Lower bound.
    pub fn lower(&self) -> &Value {
        &self.data.lower
    }

    /// Upper bound.
    pub fn upper(&self) -> &Value {
        &self.data.upper
    }

    /// Tolerance.
    pub fn tol(&self) -> f64 {
        self.data.tol
    }

    /// Name.
    pub fn name(&self) -> &str {
        &self.data.name
    }

    /// Kind.
    pub fn kind(&self) -> ConstraintKind {
        self.data.kind
    }

    /// Sets the tolerance.
    pub fn with_tol(mut self, tol: f64) -> Self {
        self.data.tol = tol;
        self
    }

    /// Sets the name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.data.name = name.into();
        self
    }

    fn bounds(&self, n: usize) -> Result<(Value, Value), Error> {
        Ok((
            broadcast_to("constraint", &self.data.lower, n)?,
            broadcast_to("constraint", &self.data.upper, n)?,
        ))
    }

    /// Returns `true` if every component of the expression lies within the
    /// bounds relaxed by the (nonnegative part of the) tolerance. `NaN`
    /// values never satisfy a constraint.
    pub fn is_satisfied(&self, point: &Point) -> Result<bool, Error> {
        let value = self.expr().eval(point)?;
        let (lower, upper) = self.bounds(value.len())?;
        let slack = self.data.tol.max(0.0);

        Ok(value
            .iter()
            .zip(lower.iter().zip(upper.iter()))
            .all(|(v, (lo, hi))| !v.is_nan() && *v >= lo - slack && *v <= hi + slack))
    }

    /// Largest distance of a component of the expression from its bounds,
    /// zero if the constraint is satisfied. `NaN` values are infinitely
    /// distant.
    pub fn violation(&self, point: &Point) -> Result<f64, Error> {
        let value = self.expr().eval(point)?;
        let (lower, upper) = self.bounds(value.len())?;

        Ok(value
            .iter()
            .zip(lower.iter().zip(upper.iter()))
            .map(|(v, (lo, hi))| {
                if v.is_nan() {
                    f64::INFINITY
                } else {
                    (lo - v).max(v - hi).max(0.0)
                }
            })
            .fold(0.0, f64::max))
    }

    /// Creates a discrete node evaluating to 1 for components satisfying the
    /// constraint and to 0 otherwise.
    pub fn indicator(&self) -> Expr<'g> {
        let expr = self.expr();
        let (lower, upper) = (self.data.lower.clone(), self.data.upper.clone());
        let slack = self.data.tol.max(0.0);

        let (lo, hi) = (lower.clone(), upper.clone());
        let forward = move |inputs: &[Value]| -> Result<Value, Error> {
            let value = &inputs[0];
            let lower = broadcast_to("constraint", &lo, value.len())?;
            let upper = broadcast_to("constraint", &hi, value.len())?;
            Ok(Value::from_iterator(
                value.len(),
                value.iter().zip(lower.iter().zip(upper.iter())).map(
                    |(v, (lo, hi))| {
                        if !v.is_nan() && *v >= lo - slack && *v <= hi + slack {
                            1.0
                        } else {
                            0.0
                        }
                    },
                ),
            ))
        };

        let kernel = move |inputs: &[Interval]| -> Result<Interval, Error> {
            let bounds = &inputs[0];
            let n = bounds.len();
            let lower = broadcast_to("constraint", &lower, n)?;
            let upper = broadcast_to("constraint", &upper, n)?;

            let mut mask_lower = Value::zeros(n);
            let mut mask_upper = Value::from_element(n, 1.0);
            for i in 0..n {
                let (lo, hi) = (lower[i] - slack, upper[i] + slack);
                if bounds.definite && bounds.lower[i] >= lo && bounds.upper[i] <= hi {
                    mask_lower[i] = 1.0;
                } else if bounds.upper[i] < lo || bounds.lower[i] > hi {
                    mask_upper[i] = 0.0;
                }
            }

            Ok(Interval::new(mask_lower, mask_upper))
        };

        let mut builder = FunctionBuilder::new(forward)
            .input(expr)
            .name(format!("{}_indicator", self.data.name))
            .interval(IntervalRule::Kernel(Rc::new(kernel)))
            .order(OrderRule::Constant)
            .discrete(true)
            .vectorized(true);
        if let Some(size) = expr.size() {
            builder = builder.size(size);
        }

        // The input belongs to the same graph, so building cannot fail.
        match self.graph.function(builder) {
            Ok(indicator) => indicator,
            Err(error) => panic!("{}", error),
        }
    }

    /// Constraints are not differentiable.
    pub fn diff(&self, _point: &Point) -> Result<Derivative, Error> {
        Err(Error::unsupported(format!(
            "differentiation of constraint `{}`",
            self.data.name
        )))
    }
}

impl<'g> Expr<'g> {
    fn compare(
        self,
        op: &'static str,
        rhs: Term<'g>,
        lower: bool,
        upper: bool,
    ) -> Result<Constraint<'g>, Error> {
        let (expr, bound, kind) = match rhs {
            Term::Const(value) => {
                if let Some(size) = self.size() {
                    broadcast_to(op, &value, size)?;
                }
                let kind = if self.is_var() {
                    ConstraintKind::BoxBound
                } else {
                    ConstraintKind::General
                };
                (self, value, kind)
            }
            Term::Expr(rhs) => (self.try_sub(rhs)?, Value::zeros(1), ConstraintKind::General),
        };

        let n = bound.len();
        let lower = if lower {
            bound.clone()
        } else {
            Value::from_element(n, f64::NEG_INFINITY)
        };
        let upper = if upper {
            bound
        } else {
            Value::from_element(n, f64::INFINITY)
        };

        Ok(Constraint::new(expr, lower, upper, kind))
    }

    /// Constraint `self > rhs`.
    ///
    /// Strict and non-strict comparisons build the same constraint, they
    /// differ only up to the tolerance. A negative tolerance (see
    /// [`Constraint::with_tol`]) asks a solver to keep a margin from the
    /// bound, [`Constraint::is_satisfied`] ignores it.
    pub fn gt(self, rhs: impl Into<Term<'g>>) -> Result<Constraint<'g>, Error> {
        self.compare("gt", rhs.into(), true, false)
    }

    /// Constraint `self >= rhs`. Same as [`Expr::gt`].
    pub fn ge(self, rhs: impl Into<Term<'g>>) -> Result<Constraint<'g>, Error> {
        self.compare("ge", rhs.into(), true, false)
    }

    /// Constraint `self < rhs`. Same as [`Expr::le`].
    pub fn lt(self, rhs: impl Into<Term<'g>>) -> Result<Constraint<'g>, Error> {
        self.compare("lt", rhs.into(), false, true)
    }

    /// Constraint `self <= rhs`.
    pub fn le(self, rhs: impl Into<Term<'g>>) -> Result<Constraint<'g>, Error> {
        self.compare("le", rhs.into(), false, true)
    }

    /// Constraint `self == rhs`.
    ///
    /// Fixing a bare variable to a constant is not a constraint; assign the
    /// value in the point instead.
    #[allow(clippy::should_implement_trait)]
    pub fn eq(self, rhs: impl Into<Term<'g>>) -> Result<Constraint<'g>, Error> {
        let rhs = rhs.into();
        if self.is_var() && matches!(rhs, Term::Const(_)) {
            return Err(Error::unsupported(format!(
                "equality of variable `{}` and a constant",
                self.name()
            )));
        }
        self.compare("eq", rhs, true, true)
    }

    /// Attaches a constraint to the node.
    pub fn attach(self, constraint: Constraint<'g>) -> Self {
        self.graph.attach(self.id, constraint.data);
        self
    }

    /// Removes the constraints attached directly to the node and returns
    /// them. Constraints of the node's inputs stay attached.
    pub fn detach(&self) -> Vec<Constraint<'g>> {
        self.graph
            .detach(self.id)
            .into_iter()
            .map(|data| Constraint::from_data(self.graph, data))
            .collect()
    }

    /// Constraints attached directly to the node.
    pub fn attached(&self) -> Vec<Constraint<'g>> {
        self.graph
            .attached_to(self.id)
            .into_iter()
            .map(|data| Constraint::from_data(self.graph, data))
            .collect()
    }
}

/// Collects the constraints attached to all nodes reachable from the roots,
/// including nodes of the attached constraints' own expressions. Every node
/// is visited once.
pub fn attached_constraints<'g>(roots: &[Expr<'g>]) -> Vec<Constraint<'g>> {
    let mut visited = BTreeSet::new();
    let mut stack = roots.iter().rev().copied().collect::<Vec<_>>();
    let mut constraints = Vec::new();

    while let Some(expr) = stack.pop() {
        if !visited.insert(expr.id()) {
            continue;
        }

        for constraint in expr.attached() {
            stack.push(constraint.expr());
            constraints.push(constraint);
        }

        if let Some(spec) = expr.node().spec() {
            let inputs = spec.node_inputs().collect::<Vec<_>>();
            stack.extend(inputs.into_iter().rev().map(|id| expr.graph().expr(id)));
        }
    }

    constraints
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Domain;

    use nalgebra::dvector;

    #[test]
    fn box_bounds() {
        let graph = Graph::new();
        let x = graph.var("x");
        let c = x.gt(1.0).unwrap();

        assert_eq!(c.kind(), ConstraintKind::BoxBound);
        assert_eq!(c.lower(), &dvector![1.0]);
        assert_eq!(c.upper(), &dvector![f64::INFINITY]);

        let inside = Point::builder().set(&x, 2.0).build();
        let outside = Point::builder().set(&x, 0.0).build();
        assert!(c.is_satisfied(&inside).unwrap());
        assert!(!c.is_satisfied(&outside).unwrap());
        assert_eq!(c.violation(&inside).unwrap(), 0.0);
        assert_eq!(c.violation(&outside).unwrap(), 1.0);
    }

    #[test]
    fn general_constraints() {
        let graph = Graph::new();
        let x = graph.var("x");
        let y = graph.var("y");

        let c = (x + y).le(3.0).unwrap().named("budget");
        assert_eq!(c.kind(), ConstraintKind::General);
        assert_eq!(c.name(), "budget");

        let p = Point::builder().set(&x, 1.0).set(&y, 2.5).build();
        assert!(!c.is_satisfied(&p).unwrap());
        assert_eq!(c.violation(&p).unwrap(), 0.5);

        let c = x.ge(y).unwrap();
        assert_eq!(c.lower(), &dvector![0.0]);
        assert!(!c.is_satisfied(&p).unwrap());
    }

    #[test]
    fn equality() {
        let graph = Graph::new();
        let x = graph.var("x");

        assert!(matches!(x.eq(1.0), Err(Error::Unsupported(_))));

        let c = (x * 2.0).eq(4.0).unwrap();
        assert_eq!(c.lower(), c.upper());
        assert!(c.is_satisfied(&Point::builder().set(&x, 2.0).build()).unwrap());
    }

    #[test]
    fn tolerance_and_nan() {
        let graph = Graph::new();
        let x = graph.var("x");

        let c = x.ge(1.0).unwrap().with_tol(0.1);
        assert!(c.is_satisfied(&Point::builder().set(&x, 0.95).build()).unwrap());

        let c = x.ge(1.0).unwrap().with_tol(-0.1);
        assert!(c.is_satisfied(&Point::builder().set(&x, 1.0).build()).unwrap());

        let c = x.sqrt().ge(0.0).unwrap();
        let p = Point::builder().set(&x, -1.0).build();
        assert!(!c.is_satisfied(&p).unwrap());
        assert_eq!(c.violation(&p).unwrap(), f64::INFINITY);
    }

    #[test]
    fn strict_and_non_strict_coincide() {
        let graph = Graph::new();
        let x = graph.var("x");
        let at_bound = Point::builder().set(&x, 1.0).build();

        let (gt, ge) = (x.gt(1.0).unwrap(), x.ge(1.0).unwrap());
        assert_eq!((gt.lower(), gt.upper()), (ge.lower(), ge.upper()));
        assert!(gt.is_satisfied(&at_bound).unwrap());

        let (lt, le) = (x.lt(1.0).unwrap(), x.le(1.0).unwrap());
        assert_eq!((lt.lower(), lt.upper()), (le.lower(), le.upper()));
        assert_eq!(lt.violation(&at_bound).unwrap(), 0.0);
    }

    #[test]
    fn vector_bounds() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 3);
        let c = x.le([1.0, 2.0, 3.0]).unwrap();

        let p = Point::builder().set(&x, [0.0, 2.5, 5.0]).build();
        assert_eq!(c.violation(&p).unwrap(), 2.0);
        assert!(x.le([1.0, 2.0]).is_err());
    }

    #[test]
    fn indicator() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 3);
        let mask = x.gt(0.0).unwrap().indicator();

        assert!(mask.is_discrete());
        let p = Point::builder().set(&x, [-1.0, 0.5, 2.0]).build();
        assert_eq!(mask.eval(&p).unwrap(), dvector![0.0, 1.0, 1.0]);

        let dom = Domain::builder()
            .bound(&x, [-2.0, -1.0, 1.0], [-1.0, 1.0, 2.0])
            .build();
        let bounds = mask.interval(&dom).unwrap();
        assert_eq!(bounds.lower, dvector![0.0, 0.0, 1.0]);
        assert_eq!(bounds.upper, dvector![0.0, 1.0, 1.0]);
    }

    #[test]
    fn not_differentiable() {
        let graph = Graph::new();
        let x = graph.var("x");
        let c = x.gt(0.0).unwrap();
        let p = Point::builder().set(&x, 1.0).build();
        assert!(matches!(c.diff(&p), Err(Error::Unsupported(_))));
    }

    #[test]
    fn collects_attached_constraints() {
        let graph = Graph::new();
        let x = graph.var("x");
        let y = graph.var("y");
        let z = graph.var("z");

        let f = x.sqrt() + y.ln() + x.sqrt();
        assert_eq!(attached_constraints(&[f]).len(), 3);

        let g = (x * y).attach(z.sqrt().gt(0.5).unwrap().named("custom"));
        let constraints = attached_constraints(&[g]);
        let names = constraints.iter().map(|c| c.name()).collect::<Vec<_>>();
        assert_eq!(constraints.len(), 2);
        assert!(names.contains(&"custom"));

        // Shared nodes are visited once.
        let s = x.sqrt();
        let h = s + s * 2.0;
        assert_eq!(attached_constraints(&[h, s]).len(), 1);
    }

    #[test]
    fn detach_removes_own_constraints() {
        let graph = Graph::new();
        let x = graph.var("x");

        let root = x.sqrt();
        let f = root.ln();
        assert_eq!(attached_constraints(&[f]).len(), 2);

        let removed = f.detach();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].expr(), root);
        assert!(f.attached().is_empty());
        assert!(f.detach().is_empty());

        let remaining = attached_constraints(&[f]);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].expr(), x);
    }
}
