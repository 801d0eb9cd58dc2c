use std::collections::BTreeSet;

use log::trace;

use crate::{
    analysis::dependencies,
    core::{scalar, Error, Expr, Graph, Node, NodeId, NodeKind, Operand, Point, Value},
};

use super::cache::{Entry, Snapshot, Stats};

/// Partition of variables into fixed and free ones.
///
/// A node whose dependencies are all fixed (or none of which is free) is
/// treated as constant: within a schedule with an explicit identifier, its
/// value is computed once and reused regardless of the point. Without an
/// identifier, fixed nodes are still excluded from differentiation but their
/// values are not reused across points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarSchedule {
    fixed: Option<BTreeSet<NodeId>>,
    free: Option<BTreeSet<NodeId>>,
    id: Option<u64>,
}

impl VarSchedule {
    /// Creates an empty schedule (all variables free).
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares fixed variables.
    pub fn with_fixed<'g, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = Expr<'g>>,
    {
        self.fixed = Some(vars.into_iter().map(|v| v.id()).collect());
        self
    }

    /// Declares free variables. All other variables are fixed.
    pub fn with_free<'g, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = Expr<'g>>,
    {
        self.free = Some(vars.into_iter().map(|v| v.id()).collect());
        self
    }

    /// Sets the identifier of the schedule.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Identifier of the schedule.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Fixed variables, if declared.
    pub fn fixed_vars(&self) -> Option<&BTreeSet<NodeId>> {
        self.fixed.as_ref()
    }

    /// Free variables, if declared.
    pub fn free_vars(&self) -> Option<&BTreeSet<NodeId>> {
        self.free.as_ref()
    }

    pub(crate) fn from_parts(
        fixed: Option<BTreeSet<NodeId>>,
        free: Option<BTreeSet<NodeId>>,
        id: Option<u64>,
    ) -> Self {
        Self { fixed, free, id }
    }

    /// Returns `true` if a node with given dependencies is constant under
    /// this schedule.
    pub fn is_fixed(&self, deps: &BTreeSet<NodeId>) -> bool {
        if let Some(fixed) = &self.fixed {
            if deps.is_subset(fixed) {
                return true;
            }
        }

        if let Some(free) = &self.free {
            if deps.is_disjoint(free) {
                return true;
            }
        }

        false
    }
}

impl<'g> Expr<'g> {
    /// Evaluates the expression at a point.
    pub fn eval(&self, point: &Point) -> Result<Value, Error> {
        self.eval_with(point, &VarSchedule::default())
    }

    /// Evaluates the expression at a point under given schedule.
    pub fn eval_with(&self, point: &Point, schedule: &VarSchedule) -> Result<Value, Error> {
        evaluate(self.graph, self.id, point, schedule)
    }

    /// Gets the instrumentation counters of the node.
    pub fn stats(&self) -> Stats {
        self.graph
            .caches()
            .borrow()
            .stats
            .get(&self.id)
            .copied()
            .unwrap_or_default()
    }
}

pub(crate) fn variable_value(graph: &Graph, node: &Node, point: &Point) -> Result<Value, Error> {
    let name = graph.name_of(node.id);
    let value = point
        .lookup(node.id, &name)
        .ok_or_else(|| Error::MissingValue { name: name.clone() })?;

    match (node.size, point.is_multi()) {
        (Some(size), false) if value.len() != size => Err(Error::ShapeMismatch {
            op: "variable",
            left: value.len(),
            right: size,
        }),
        (Some(size), true) if size != 1 => Err(Error::unsupported(format!(
            "vector variable `{}` in a multi-point",
            name
        ))),
        _ => Ok(value.clone()),
    }
}

pub(crate) fn snapshot(graph: &Graph, deps: &BTreeSet<NodeId>, point: &Point) -> Snapshot {
    deps.iter()
        .filter_map(|id| {
            point
                .lookup(*id, &graph.name_of(*id))
                .map(|value| (*id, value.clone()))
        })
        .collect()
}

pub(crate) fn evaluate(
    graph: &Graph,
    id: NodeId,
    point: &Point,
    schedule: &VarSchedule,
) -> Result<Value, Error> {
    let node = graph.node(id);
    let spec = match &node.kind {
        NodeKind::Variable => return variable_value(graph, &node, point),
        NodeKind::Constant(value) => return Ok(value.clone()),
        NodeKind::Function(spec) => spec,
    };

    let deps = dependencies(graph, id);
    let fixed = schedule.id.is_some() && schedule.is_fixed(&deps.vars);
    let snapshot = if spec.costly {
        Some(snapshot(graph, &deps.vars, point))
    } else {
        None
    };

    {
        let mut caches = graph.caches().borrow_mut();
        let cached = caches
            .values
            .get(&id)
            .filter(|entry| entry.is_valid(point, schedule.id, fixed, snapshot.as_ref()))
            .map(|entry| entry.value.clone());

        if let Some(value) = cached {
            caches.stats_mut(id).hits += 1;
            trace!("{}: value cache hit", graph.name_of(id));
            return Ok(value);
        }
    }

    let inputs = spec
        .inputs
        .iter()
        .map(|input| match input {
            Operand::Node(input) => evaluate(graph, *input, point, schedule),
            Operand::Const(value) => Ok(value.clone()),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let value = match point.samples() {
        Some(samples) if !spec.vectorized => {
            let mut stacked = Vec::new();
            for j in 0..samples {
                let sample = inputs
                    .iter()
                    .map(|input| {
                        if input.len() == samples {
                            Ok(scalar(input[j]))
                        } else if input.len() == 1 {
                            Ok(input.clone())
                        } else {
                            Err(Error::ShapeMismatch {
                                op: "multi-point",
                                left: input.len(),
                                right: samples,
                            })
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                stacked.extend((spec.forward)(&sample)?.iter().copied());
            }
            Value::from_vec(stacked)
        }
        _ => (spec.forward)(&inputs)?,
    };

    if let (Some(size), false) = (node.size, point.is_multi()) {
        if value.len() != size {
            return Err(Error::ShapeMismatch {
                op: "forward",
                left: value.len(),
                right: size,
            });
        }
    }

    trace!("{}: evaluated at point {}", graph.name_of(id), point.id());

    let mut caches = graph.caches().borrow_mut();
    caches.stats_mut(id).evals += 1;
    if !point.is_multi() || spec.costly || fixed {
        caches.values.insert(
            id,
            Entry {
                point: point.id(),
                value: value.clone(),
                snapshot,
                schedule: schedule.id,
                fixed,
            },
        );
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FunctionBuilder, Graph};

    use std::{cell::Cell, rc::Rc};

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;

    fn counted<'g>(graph: &'g Graph, x: Expr<'g>, calls: Rc<Cell<usize>>) -> Expr<'g> {
        let builder = FunctionBuilder::new(move |inputs: &[Value]| {
            calls.set(calls.get() + 1);
            Ok(inputs[0].map(|v| v * v))
        })
        .input(x);
        graph.function(builder).unwrap()
    }

    #[test]
    fn concrete_scenario_value() {
        let graph = Graph::new();
        let a = graph.var("a");
        let b = graph.var("b");
        let f = a * b + a.sin();

        let p = Point::builder().set(&a, 2.0).set(&b, 3.0).build();
        assert_abs_diff_eq!(f.eval(&p).unwrap()[0], 6.909297, epsilon = 1e-6);
    }

    #[test]
    fn same_point_uses_cache() {
        let graph = Graph::new();
        let x = graph.var("x");
        let calls = Rc::new(Cell::new(0));
        let f = counted(&graph, x, Rc::clone(&calls));

        let p = Point::builder().set(&x, 3.0).build();
        let first = f.eval(&p).unwrap();
        let second = f.eval(&p).unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
        assert_eq!(f.stats().evals, 1);
        assert_eq!(f.stats().hits, 1);

        let q = Point::builder().set(&x, 3.0).build();
        f.eval(&q).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn costly_node_compares_values() {
        let graph = Graph::new();
        let x = graph.var("x");
        let calls = Rc::new(Cell::new(0));
        let inner = Rc::clone(&calls);
        let builder = FunctionBuilder::new(move |inputs: &[Value]| {
            inner.set(inner.get() + 1);
            Ok(inputs[0].map(f64::exp))
        })
        .input(x)
        .costly(true);
        let f = graph.function(builder).unwrap();

        f.eval(&Point::builder().set(&x, 1.0).build()).unwrap();
        f.eval(&Point::builder().set(&x, 1.0).build()).unwrap();
        assert_eq!(calls.get(), 1);

        f.eval(&Point::builder().set(&x, 2.0).build()).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn fixed_nodes_reused_within_schedule() {
        let graph = Graph::new();
        let a = graph.var("a");
        let b = graph.var("b");
        let calls = Rc::new(Cell::new(0));
        let g = counted(&graph, a, Rc::clone(&calls));
        let f = g + b;

        let schedule = VarSchedule::new().with_fixed([a]).with_id(7);
        let p1 = Point::builder().set(&a, 2.0).set(&b, 1.0).build();
        let p2 = Point::builder().set(&a, 5.0).set(&b, 3.0).build();

        assert_eq!(f.eval_with(&p1, &schedule).unwrap(), dvector![5.0]);
        assert_eq!(f.eval_with(&p2, &schedule).unwrap(), dvector![7.0]);
        assert_eq!(calls.get(), 1);

        // Another schedule invalidates the fixed value.
        let other = VarSchedule::new().with_fixed([a]).with_id(8);
        assert_eq!(f.eval_with(&p2, &other).unwrap(), dvector![28.0]);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn missing_value_names_variable() {
        let graph = Graph::new();
        let x = graph.var("x");
        let y = graph.var("velocity");
        let f = x + y;

        let p = Point::builder().set(&x, 1.0).build();
        assert_eq!(
            f.eval(&p),
            Err(Error::MissingValue {
                name: "velocity".to_string()
            })
        );
    }

    #[test]
    fn lookup_by_name() {
        let graph = Graph::new();
        let x = graph.var("x");
        let f = x * 2.0;

        let p = Point::builder().set_named("x", 4.0).build();
        assert_eq!(f.eval(&p).unwrap(), dvector![8.0]);
    }

    #[test]
    fn multi_point_stacks_samples() {
        let graph = Graph::new();
        let x = graph.var("x");
        let y = graph.var("y");
        let calls = Rc::new(Cell::new(0));
        let g = counted(&graph, x, Rc::clone(&calls));
        let f = g + y;

        let p = Point::multi(3)
            .set(&x, [1.0, 2.0, 3.0])
            .set(&y, [0.5, 0.5, 1.0])
            .build();

        assert_eq!(f.eval(&p).unwrap(), dvector![1.5, 4.5, 10.0]);
        assert_eq!(calls.get(), 3);

        // Batches are not cached by identity.
        f.eval(&p).unwrap();
        assert_eq!(calls.get(), 6);
    }

    #[test]
    fn forward_size_is_checked() {
        let graph = Graph::new();
        let x = graph.var("x");
        let builder = FunctionBuilder::new(|_: &[Value]| Ok(dvector![1.0, 2.0]))
            .input(x)
            .size(3);
        let f = graph.function(builder).unwrap();

        let p = Point::builder().set(&x, 1.0).build();
        assert!(matches!(
            f.eval(&p),
            Err(Error::ShapeMismatch { op: "forward", .. })
        ));
    }
}
