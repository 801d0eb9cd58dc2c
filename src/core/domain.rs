//! Boxes of variable bounds used for interval evaluation.

use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};

use super::{
    graph::Expr,
    node::NodeId,
    point::{next_id, Point, PointBuilder},
    value::{IntoValue, Value},
};
use crate::{analysis::estimate_magnitude_from_bounds, interval::Interval};

/// Intervals of the terms of one sum node together with their total.
#[derive(Debug, Clone)]
pub(crate) struct SumState {
    pub(crate) terms: Vec<Interval>,
    pub(crate) total: Interval,
}

pub(crate) type SumStore = BTreeMap<NodeId, SumState>;

/// Box mapping variables to their lower and upper bounds.
///
/// A domain is immutable. Narrowing the bounds of a variable (as done when
/// branching in a global solver) creates a child domain through
/// [`Domain::refine`], which allows sums to update their bounds incrementally
/// from the parent's partial results.
#[derive(Debug)]
pub struct Domain {
    id: u64,
    by_id: BTreeMap<NodeId, (Value, Value)>,
    by_name: BTreeMap<String, (Value, Value)>,
    modified: Option<NodeId>,
    parent_sums: Option<Rc<RefCell<SumStore>>>,
    sums: Rc<RefCell<SumStore>>,
    memo: RefCell<BTreeMap<NodeId, Interval>>,
}

impl Domain {
    /// Starts building a domain.
    pub fn builder() -> DomainBuilder {
        DomainBuilder::default()
    }

    /// Identity of the domain.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Gets the bounds of a variable.
    pub fn get(&self, var: &Expr<'_>) -> Option<Interval> {
        self.lookup(var.id(), &var.name())
    }

    pub(crate) fn lookup(&self, id: NodeId, name: &str) -> Option<Interval> {
        self.by_id
            .get(&id)
            .or_else(|| self.by_name.get(name))
            .map(|(lower, upper)| Interval::new(lower.clone(), upper.clone()))
    }

    /// Variable in which this domain differs from its parent.
    pub fn modified(&self) -> Option<NodeId> {
        self.modified
    }

    /// Creates a child domain with new bounds of a single variable.
    ///
    /// # Panics
    ///
    /// The variable must be bounded in this domain and the new bounds must
    /// have the same size as the old ones.
    pub fn refine(&self, var: &Expr<'_>, lower: impl IntoValue, upper: impl IntoValue) -> Domain {
        let (lower, upper) = (lower.into_value(), upper.into_value());
        let name = var.name();

        let current = match self.get(var) {
            Some(current) => current,
            None => panic!("refined variable is not in the domain"),
        };
        assert!(
            current.len() == lower.len() && current.len() == upper.len(),
            "refined bounds have invalid size"
        );
        assert_valid(&lower, &upper);

        let mut by_id = self.by_id.clone();
        by_id.insert(var.id(), (lower, upper));
        let mut by_name = self.by_name.clone();
        by_name.remove(&name);

        Domain {
            id: next_id(),
            by_id,
            by_name,
            modified: Some(var.id()),
            parent_sums: Some(Rc::clone(&self.sums)),
            sums: Rc::new(RefCell::new(SumStore::new())),
            memo: RefCell::new(BTreeMap::new()),
        }
    }

    /// Splits the box in the middle of component `i` of a variable.
    pub fn bisect(&self, var: &Expr<'_>, i: usize) -> (Domain, Domain) {
        let current = match self.get(var) {
            Some(current) => current,
            None => panic!("bisected variable is not in the domain"),
        };
        let mid = midpoint(current.lower[i], current.upper[i]);

        let mut left_upper = current.upper.clone();
        left_upper[i] = mid;
        let mut right_lower = current.lower.clone();
        right_lower[i] = mid;

        (
            self.refine(var, current.lower.clone(), left_upper),
            self.refine(var, right_lower, current.upper),
        )
    }

    /// Returns `true` if all values of the point assigned to the variables of
    /// this domain lie within the bounds.
    pub fn contains(&self, point: &Point, vars: &[Expr<'_>]) -> bool {
        vars.iter().all(|var| {
            match (self.get(var), point.get(var)) {
                (Some(bounds), Some(value)) => bounds.contains(value, 0.0),
                _ => false,
            }
        })
    }

    /// Samples a point in the domain.
    ///
    /// Finite bounds are sampled uniformly. For infinite bounds, a normally
    /// distributed value scaled by the estimated magnitude of the variable is
    /// reflected into the feasible half-line.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Point {
        let sample = |lower: &Value, upper: &Value, rng: &mut R| -> Value {
            Value::from_iterator(
                lower.len(),
                lower.iter().zip(upper.iter()).map(|(&li, &ui)| {
                    if li.is_finite() && ui.is_finite() {
                        if li < ui {
                            Uniform::new_inclusive(li, ui).sample(rng)
                        } else {
                            li
                        }
                    } else {
                        let magnitude = estimate_magnitude_from_bounds(li, ui);
                        let z: f64 = StandardNormal.sample(rng);
                        let random = magnitude * z;

                        if li.is_finite() || ui.is_finite() {
                            let clamped = random.max(li).min(ui);
                            let delta = clamped - random;
                            clamped + delta
                        } else {
                            random
                        }
                    }
                }),
            )
        };

        let mut builder = PointBuilder::default();
        for (id, (lower, upper)) in self.by_id.iter() {
            builder = builder.set_id(*id, sample(lower, upper, rng));
        }
        for (name, (lower, upper)) in self.by_name.iter() {
            builder = builder.set_named(name.clone(), sample(lower, upper, rng));
        }
        builder.build()
    }

    pub(crate) fn memo(&self) -> &RefCell<BTreeMap<NodeId, Interval>> {
        &self.memo
    }

    pub(crate) fn sums(&self) -> &RefCell<SumStore> {
        &self.sums
    }

    pub(crate) fn parent_sums(&self) -> Option<&RefCell<SumStore>> {
        self.parent_sums.as_deref()
    }
}

fn assert_valid(lower: &Value, upper: &Value) {
    assert_eq!(lower.len(), upper.len(), "lower and upper have different size");
    assert!(
        lower.iter().zip(upper.iter()).all(|(l, u)| l <= u),
        "lower bound is greater than upper bound"
    );
}

fn midpoint(lower: f64, upper: f64) -> f64 {
    match (lower.is_finite(), upper.is_finite()) {
        (true, true) => 0.5 * (lower + upper),
        (true, false) => lower + estimate_magnitude_from_bounds(lower, lower),
        (false, true) => upper - estimate_magnitude_from_bounds(upper, upper),
        (false, false) => 0.0,
    }
}

/// Builder of a [`Domain`].
#[derive(Debug, Clone, Default)]
pub struct DomainBuilder {
    by_id: BTreeMap<NodeId, (Value, Value)>,
    by_name: BTreeMap<String, (Value, Value)>,
}

impl DomainBuilder {
    /// Bounds a variable.
    ///
    /// Positive and negative infinity can be used to indicate value unbounded
    /// in that direction.
    pub fn bound(mut self, var: &Expr<'_>, lower: impl IntoValue, upper: impl IntoValue) -> Self {
        let (lower, upper) = (lower.into_value(), upper.into_value());
        assert_valid(&lower, &upper);
        self.by_id.insert(var.id(), (lower, upper));
        self
    }

    /// Bounds a variable given by name.
    pub fn bound_named(
        mut self,
        name: impl Into<String>,
        lower: impl IntoValue,
        upper: impl IntoValue,
    ) -> Self {
        let (lower, upper) = (lower.into_value(), upper.into_value());
        assert_valid(&lower, &upper);
        self.by_name.insert(name.into(), (lower, upper));
        self
    }

    /// Finishes the domain.
    pub fn build(self) -> Domain {
        Domain {
            id: next_id(),
            by_id: self.by_id,
            by_name: self.by_name,
            modified: None,
            parent_sums: None,
            sums: Rc::new(RefCell::new(SumStore::new())),
            memo: RefCell::new(BTreeMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Graph;

    use nalgebra::dvector;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn refine_changes_single_variable() {
        let graph = Graph::new();
        let x = graph.var("x");
        let y = graph.var("y");

        let dom = Domain::builder()
            .bound(&x, -1.0, 1.0)
            .bound_named("y", 0.0, 2.0)
            .build();
        let child = dom.refine(&x, 0.0, 0.5);

        assert_ne!(dom.id(), child.id());
        assert_eq!(child.modified(), Some(x.id()));
        assert_eq!(child.get(&x), Some(Interval::scalar(0.0, 0.5)));
        assert_eq!(child.get(&y), Some(Interval::scalar(0.0, 2.0)));
        assert_eq!(dom.get(&x), Some(Interval::scalar(-1.0, 1.0)));
    }

    #[test]
    fn bisect_splits_component() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 2);

        let dom = Domain::builder()
            .bound(&x, [0.0, 0.0], [2.0, 4.0])
            .build();
        let (left, right) = dom.bisect(&x, 1);

        assert_eq!(
            left.get(&x),
            Some(Interval::new(dvector![0.0, 0.0], dvector![2.0, 2.0]))
        );
        assert_eq!(
            right.get(&x),
            Some(Interval::new(dvector![0.0, 2.0], dvector![2.0, 4.0]))
        );
    }

    #[test]
    fn samples_are_inside() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 3);
        let y = graph.var("y");

        let dom = Domain::builder()
            .bound(&x, [-1.0, 0.0, 5.0], [1.0, 0.0, 6.0])
            .bound(&y, 1.0, f64::INFINITY)
            .build();

        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let p = dom.sample(&mut rng);
            assert!(dom.contains(&p, &[x, y]));
        }
    }

    #[test]
    #[should_panic(expected = "lower bound is greater than upper bound")]
    fn invalid_bounds() {
        let graph = Graph::new();
        let x = graph.var("x");
        Domain::builder().bound(&x, 1.0, -1.0);
    }
}
