//! Structural analyses of expression graphs.

use std::{
    collections::{BTreeMap, BTreeSet},
    rc::Rc,
};

use crate::{
    core::{Expr, Graph, NodeId, NodeKind, Operand, OrderRule},
    engine::VarSchedule,
};

/// Estimates magnitude of the variable given lower and upper bounds.
pub fn estimate_magnitude_from_bounds(lower: f64, upper: f64) -> f64 {
    let avg = 0.5 * (lower.abs() + upper.abs());
    let magnitude = 10f64.powf(avg.abs().log10().trunc());

    // For [0, 0] range, the computed magnitude is undefined. We allow such
    // ranges to support fixing a variable to a value with existing API.
    if magnitude.is_finite() && magnitude > 0.0 {
        magnitude
    } else {
        1.0
    }
}

/// Variables a node depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependencies {
    /// Variables in the order of their creation.
    pub vars: BTreeSet<NodeId>,
    /// `true` if no variable is reachable through two different paths, that
    /// is, the subgraph is a tree with respect to variables.
    pub uncycled: bool,
}

/// Computes (or gets from the cache) the dependencies of a node.
///
/// Graphs are append only, so the result is computed once per node.
pub fn dependencies(graph: &Graph, id: NodeId) -> Rc<Dependencies> {
    if let Some(deps) = graph.caches().borrow().deps.get(&id) {
        return Rc::clone(deps);
    }

    let node = graph.node(id);
    let deps = match &node.kind {
        NodeKind::Variable => Dependencies {
            vars: BTreeSet::from([id]),
            uncycled: true,
        },
        NodeKind::Constant(_) => Dependencies {
            vars: BTreeSet::new(),
            uncycled: true,
        },
        NodeKind::Function(spec) => {
            let mut vars = BTreeSet::new();
            let mut uncycled = true;
            let mut total = 0;

            for input in spec.node_inputs() {
                let child = dependencies(graph, input);
                uncycled &= child.uncycled;
                total += child.vars.len();
                vars.extend(child.vars.iter().copied());
            }

            Dependencies {
                uncycled: uncycled && total == vars.len(),
                vars,
            }
        }
    };

    let deps = Rc::new(deps);
    graph
        .caches()
        .borrow_mut()
        .deps
        .insert(id, Rc::clone(&deps));
    deps
}

/// Estimates the polynomial order of a node in free variables.
///
/// Nodes depending only on fixed variables have order zero. Nonpolynomial
/// functions of free variables have infinite order.
pub fn order(graph: &Graph, id: NodeId, schedule: &VarSchedule) -> f64 {
    order_memo(graph, id, schedule, &mut BTreeMap::new())
}

fn order_memo(
    graph: &Graph,
    id: NodeId,
    schedule: &VarSchedule,
    memo: &mut BTreeMap<NodeId, f64>,
) -> f64 {
    if let Some(order) = memo.get(&id) {
        return *order;
    }

    let deps = dependencies(graph, id);
    let node = graph.node(id);

    let order = match &node.kind {
        NodeKind::Constant(_) => 0.0,
        _ if schedule.is_fixed(&deps.vars) => 0.0,
        NodeKind::Variable => 1.0,
        NodeKind::Function(spec) => {
            let orders = spec
                .inputs
                .iter()
                .map(|input| match input {
                    Operand::Node(input) => order_memo(graph, *input, schedule, memo),
                    Operand::Const(_) => 0.0,
                })
                .collect::<Vec<_>>();

            match spec.order {
                OrderRule::Constant => 0.0,
                OrderRule::Max => orders.iter().copied().fold(0.0, f64::max),
                OrderRule::Product => orders.iter().sum(),
                OrderRule::Quotient => {
                    if orders.iter().skip(1).all(|o| *o == 0.0) {
                        orders.first().copied().unwrap_or(0.0)
                    } else {
                        f64::INFINITY
                    }
                }
                OrderRule::Power(p) => {
                    let base = orders.first().copied().unwrap_or(0.0);
                    if base == 0.0 {
                        0.0
                    } else if p >= 0.0 && p.fract() == 0.0 {
                        p * base
                    } else {
                        f64::INFINITY
                    }
                }
                OrderRule::Generic => {
                    if orders.iter().all(|o| *o == 0.0) {
                        0.0
                    } else {
                        f64::INFINITY
                    }
                }
            }
        }
    };

    memo.insert(id, order);
    order
}

impl<'g> Expr<'g> {
    /// Variables the expression depends on, in the order of their creation.
    pub fn dependencies(&self) -> Vec<Expr<'g>> {
        dependencies(self.graph, self.id)
            .vars
            .iter()
            .map(|id| self.graph.expr(*id))
            .collect()
    }

    /// Returns `true` if the expression depends on the variable.
    pub fn depends_on(&self, var: &Expr<'_>) -> bool {
        dependencies(self.graph, self.id).vars.contains(&var.id())
    }

    /// Returns `true` if every variable is reachable through a single path.
    pub fn is_uncycled(&self) -> bool {
        dependencies(self.graph, self.id).uncycled
    }

    /// Polynomial order of the expression.
    pub fn order(&self) -> f64 {
        self.order_with(&VarSchedule::default())
    }

    /// Polynomial order of the expression in the free variables of the
    /// schedule.
    pub fn order_with(&self, schedule: &VarSchedule) -> f64 {
        order(self.graph, self.id, schedule)
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn magnitude() {
        assert_eq!(estimate_magnitude_from_bounds(-1e10, 1e10).log10(), 10.0);
        assert_eq!(estimate_magnitude_from_bounds(-1e4, -1e2).log10(), 3.0);
        assert_eq!(
            estimate_magnitude_from_bounds(-6e-6, 9e-6).log10().trunc(),
            -5.0
        );

        assert_eq!(estimate_magnitude_from_bounds(-6e-6, 9e-6) / 1e-5, 1.0);
    }

    #[test]
    fn magnitude_when_bound_is_zero() {
        assert_eq!(estimate_magnitude_from_bounds(0.0, 1e2).log10(), 1.0);
        assert_eq!(estimate_magnitude_from_bounds(-1e2, 0.0).log10(), 1.0);
    }

    #[test]
    fn magnitude_when_range_is_zero() {
        assert_eq!(estimate_magnitude_from_bounds(0.0, 0.0), 1.0);
    }

    #[test]
    fn dependencies_are_unions() {
        let graph = Graph::new();
        let a = graph.var("a");
        let b = graph.var("b");
        let c = graph.var("c");
        let f = a * b + c.sin();

        assert_eq!(f.dependencies(), vec![a, b, c]);
        assert!(f.depends_on(&b));
        assert!(!(a * 2.0).depends_on(&b));
        assert!(graph.constant(1.0).dependencies().is_empty());
    }

    #[test]
    fn uncycled_detection() {
        let graph = Graph::new();
        let a = graph.var("a");
        let b = graph.var("b");

        assert!(a.is_uncycled());
        assert!((a * b).is_uncycled());
        assert!((a * b + 1.0).sin().is_uncycled());
        assert!(!(a * a).is_uncycled());
        assert!(!((a + b) * a).is_uncycled());
        assert!(!((a + b).sin() + (a * 3.0)).is_uncycled());
    }

    #[test]
    fn polynomial_orders() {
        let graph = Graph::new();
        let a = graph.var("a");
        let b = graph.var("b");
        let c = graph.constant(2.0);

        assert_eq!(a.order(), 1.0);
        assert_eq!(c.order(), 0.0);
        assert_eq!((a * b + 1.0).order(), 2.0);
        assert_eq!((a / 2.0).order(), 1.0);
        assert_eq!((a / b).order(), f64::INFINITY);
        assert_eq!(a.powi(3).order(), 3.0);
        assert_eq!(a.sin().order(), f64::INFINITY);
        assert_eq!(c.sin().order(), 0.0);
    }

    #[test]
    fn fixed_variables_have_zero_order() {
        let graph = Graph::new();
        let a = graph.var("a");
        let b = graph.var("b");
        let f = a * b.sin();

        let schedule = VarSchedule::new().with_fixed([b]);
        assert_eq!(f.order(), f64::INFINITY);
        assert_eq!(f.order_with(&schedule), 1.0);
    }
}
