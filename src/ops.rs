//! Operators and functions building expressions.
//!
//! Arithmetic operators are overloaded for expressions, `f64` scalars and
//! constant vectors. Like `nalgebra`, the operators panic on operands of
//! incompatible sizes; the `try_*` methods return an error instead.
//!
//! Elementwise operations broadcast operands of size one. Functions defined
//! only on a part of the real line attach the constraint describing their
//! domain to the created node (see [`attached_constraints`](crate::attached_constraints)).

mod arithmetic;
mod elementary;
mod reduce;

pub use reduce::{if_then_else, max_of, min_of, stack, sum_of};

use std::rc::Rc;

use crate::core::{
    broadcast_size, scalar, zip_map, Block, Constraint, Error, Expr, FunctionBuilder, Graph,
    IntoValue, LocalRule, Operand, Value,
};

/// Tolerance of the domain constraints attached by functions defined on a
/// part of the real line.
pub(crate) const DOMAIN_TOL: f64 = -1e-7;

/// Operand of an operation: an expression or a constant.
#[derive(Debug, Clone)]
pub enum Term<'g> {
    /// Expression.
    Expr(Expr<'g>),
    /// Constant value.
    Const(Value),
}

impl<'g> Term<'g> {
    /// Size if known without evaluation.
    pub fn size(&self) -> Option<usize> {
        match self {
            Term::Expr(expr) => expr.size(),
            Term::Const(value) => Some(value.len()),
        }
    }

    fn expr(&self) -> Option<Expr<'g>> {
        match self {
            Term::Expr(expr) => Some(*expr),
            Term::Const(_) => None,
        }
    }

    pub(crate) fn into_operand(self) -> Operand {
        match self {
            Term::Expr(expr) => Operand::Node(expr.id()),
            Term::Const(value) => Operand::Const(value),
        }
    }
}

impl<'g> From<Expr<'g>> for Term<'g> {
    fn from(expr: Expr<'g>) -> Self {
        Term::Expr(expr)
    }
}

impl<'g> From<&Expr<'g>> for Term<'g> {
    fn from(expr: &Expr<'g>) -> Self {
        Term::Expr(*expr)
    }
}

impl From<f64> for Term<'_> {
    fn from(value: f64) -> Self {
        Term::Const(scalar(value))
    }
}

impl From<Value> for Term<'_> {
    fn from(value: Value) -> Self {
        Term::Const(value)
    }
}

impl From<&Value> for Term<'_> {
    fn from(value: &Value) -> Self {
        Term::Const(value.clone())
    }
}

impl From<Vec<f64>> for Term<'_> {
    fn from(value: Vec<f64>) -> Self {
        Term::Const(value.into_value())
    }
}

impl<const N: usize> From<[f64; N]> for Term<'_> {
    fn from(value: [f64; N]) -> Self {
        Term::Const(value.into_value())
    }
}

/// Gets the graph of the first expression among the terms.
pub(crate) fn graph_of<'g>(op: &'static str, terms: &[&Term<'g>]) -> Result<&'g Graph, Error> {
    terms
        .iter()
        .find_map(|term| term.expr())
        .map(|expr| expr.graph())
        .ok_or_else(|| Error::InvalidArgument(format!("{}: no expression among operands", op)))
}

/// Size of the result of a broadcasting operation, if known without
/// evaluation. Incompatible known sizes fail immediately.
pub(crate) fn static_size<I>(op: &'static str, sizes: I) -> Result<Option<usize>, Error>
where
    I: IntoIterator<Item = Option<usize>>,
{
    let mut known = None;
    let mut complete = true;

    for size in sizes {
        match (size, known) {
            (Some(size), Some(current)) => known = Some(broadcast_size(op, current, size)?),
            (Some(size), None) => known = Some(size),
            (None, _) => complete = false,
        }
    }

    Ok(if complete { known } else { None })
}

/// A function is discrete if all its node inputs are.
pub(crate) fn all_discrete(graph: &Graph, inputs: &[Operand]) -> bool {
    inputs
        .iter()
        .filter_map(Operand::node)
        .all(|id| graph.node(id).is_discrete())
}

/// Jacobian block of an elementwise function with partial derivatives
/// `partial` (one per output component) with respect to an input of size
/// `in_len`. A scalar input broadcast to the output gets a column.
pub(crate) fn elementwise_block(partial: Value, in_len: usize) -> Block {
    if in_len == partial.len() {
        if in_len == 1 {
            Block::Scalar(partial[0])
        } else {
            Block::Diagonal(partial)
        }
    } else {
        Block::column(&partial)
    }
}

/// Per-input derivative rule of a broadcasting binary function.
pub(crate) fn binary_partial(
    op: &'static str,
    k: usize,
    d: fn(f64, f64) -> f64,
) -> Option<LocalRule> {
    Some(Rc::new(move |inputs: &[Value]| -> Result<Block, Error> {
        let partial = zip_map(op, &inputs[0], &inputs[1], d)?;
        Ok(elementwise_block(partial, inputs[k].len()))
    }))
}

/// Attaches a domain constraint of an argument to the created node.
///
/// # Panics
///
/// Domain constraints compare the argument with a scalar bound, which
/// broadcasts to an argument of any size, so building them never fails.
pub(crate) fn with_domain<'g>(
    node: Expr<'g>,
    constraint: Result<Constraint<'g>, Error>,
) -> Expr<'g> {
    match constraint {
        Ok(constraint) => node.attach(constraint.with_tol(DOMAIN_TOL)),
        Err(error) => panic!("{}", error),
    }
}

/// Pushes a function built from nodes of the graph.
///
/// # Panics
///
/// Builders of this module only reference existing nodes and supply one
/// derivative rule per input, so pushing never fails.
pub(crate) fn build<'g>(graph: &'g Graph, builder: FunctionBuilder) -> Expr<'g> {
    match graph.function(builder) {
        Ok(expr) => expr,
        Err(error) => panic!("{}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use nalgebra::dvector;

    #[test]
    fn static_sizes() {
        assert_eq!(static_size("add", [Some(3), Some(1)]), Ok(Some(3)));
        assert_eq!(static_size("add", [Some(1), None]), Ok(None));
        assert!(matches!(
            static_size("add", [Some(2), Some(3)]),
            Err(Error::ShapeMismatch { op: "add", .. })
        ));
        assert!(static_size("add", [None, Some(2), Some(3)]).is_err());
    }

    #[test]
    fn elementwise_blocks() {
        assert_eq!(elementwise_block(dvector![2.0], 1), Block::Scalar(2.0));
        assert_eq!(
            elementwise_block(dvector![1.0, 2.0], 2),
            Block::Diagonal(dvector![1.0, 2.0])
        );
        assert_eq!(
            elementwise_block(dvector![1.0, 2.0], 1),
            Block::column(&dvector![1.0, 2.0])
        );
    }

    #[test]
    fn terms() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 2);

        assert_eq!(Term::from(x).size(), Some(2));
        assert_eq!(Term::from([1.0, 2.0, 3.0]).size(), Some(3));
        assert_eq!(graph_of("op", &[&Term::from(1.0), &Term::from(x)]).unwrap().len(), 1);
        assert!(graph_of("op", &[&Term::from(1.0)]).is_err());
    }

    #[test]
    fn domain_constraints_of_any_argument() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 3);
        let unsized_arg = graph
            .function(FunctionBuilder::new(|inputs: &[Value]| Ok(inputs[0].clone())).input(x))
            .unwrap();

        for arg in [x, x * 2.0, unsized_arg] {
            let attached = arg.sqrt().attached();
            assert_eq!(attached.len(), 1);
            assert_eq!(attached[0].expr(), arg);
            assert_eq!(attached[0].tol(), DOMAIN_TOL);
            assert_eq!(arg.acos().attached().len(), 2);
        }
    }

    #[test]
    #[should_panic(expected = "unsupported")]
    fn failed_domain_constraint_is_not_dropped() {
        let graph = Graph::new();
        let x = graph.var("x");
        let _ = with_domain(x.exp(), Err(Error::unsupported("bound")));
    }
}
