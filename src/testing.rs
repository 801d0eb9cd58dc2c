//! Graph fixtures and checks for tests and benchmarks.
//!
//! Each fixture builds a sum of squared residuals over scalar variables
//! `x0, x1, ...`, so its value, Jacobian and bounds are easy to reason about.
//! [`Sphere`] is a bare sum of squares. [`ExtendedRosenbrock`] and
//! [`ExtendedPowell`] nest products and powers of neighbouring variables, and
//! [`Exponential`] routes every variable through one shared [`sum_of`] node
//! into `exp(cos(..))`, which is the case incremental interval sums are
//! built for.
//!
//! The checks compare the engine with itself: analytic derivatives against
//! finite differences ([`check_derivatives`]) and interval bounds against
//! sampled values ([`check_soundness`]).

#![allow(unused)]

use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::{
    core::{Domain, Error, Expr, Graph, Point, Value},
    derivatives::check_derivative,
    interval::Interval,
    ops::sum_of,
};

/// Variables and objective of a reference model built in a graph.
#[derive(Debug, Clone)]
pub struct Model<'g> {
    /// Scalar variables `x0, x1, ...`.
    pub vars: Vec<Expr<'g>>,
    /// Sum of squared residuals.
    pub objective: Expr<'g>,
}

impl<'g> Model<'g> {
    fn new<F>(graph: &'g Graph, n: usize, residuals: F) -> Self
    where
        F: FnOnce(&[Expr<'g>]) -> Vec<Expr<'g>>,
    {
        let vars = (0..n)
            .map(|i| graph.var(&format!("x{}", i)))
            .collect::<Vec<_>>();
        let squares = residuals(&vars)
            .into_iter()
            .map(|r| r.powi(2))
            .collect::<Vec<_>>();

        // Residuals always contain a variable, so the sum has a graph.
        let objective = match sum_of(squares) {
            Ok(objective) => objective,
            Err(error) => panic!("{}", error),
        };

        Self { vars, objective }
    }

    /// Point assigning the components of `x` to the variables.
    pub fn point(&self, x: &Value) -> Point {
        assert_eq!(x.len(), self.vars.len(), "point has wrong dimension");
        self.vars
            .iter()
            .zip(x.iter())
            .fold(Point::builder(), |builder, (var, xi)| builder.set(var, *xi))
            .build()
    }

    /// Box with the same bounds for all variables.
    pub fn domain(&self, lower: f64, upper: f64) -> Domain {
        self.vars
            .iter()
            .fold(Domain::builder(), |builder, var| {
                builder.bound(var, lower, upper)
            })
            .build()
    }
}

/// Fixture with known starting points and zeros of the objective.
pub trait TestModel {
    /// Number of variables.
    fn dim(&self) -> usize;

    /// Builds the variables and the objective in the graph.
    fn build<'g>(&self, graph: &'g Graph) -> Model<'g>;

    /// Points to evaluate and differentiate at, away from the optima.
    fn initials(&self) -> Vec<Value>;

    /// Points where the objective is zero, if known.
    fn optima(&self) -> Vec<Value> {
        Vec::new()
    }
}

/// Value of size `n` repeating `pattern`.
fn repeated(n: usize, pattern: &[f64]) -> Value {
    Value::from_fn(n, |i, _| pattern[i % pattern.len()])
}

/// Rosenbrock residuals `10 (x2 / a - (a x1)^2)` and `1 - a x1` over
/// consecutive pairs of variables.
///
/// The squared product makes the derivative of the first residual depend on
/// its own variable, and the objective vanishes at `(1/a, a)` pairs. Larger
/// scaling `a` stretches the valley around them.
#[derive(Debug, Clone, Copy)]
pub struct ExtendedRosenbrock {
    n: usize,
    alpha: f64,
}

impl ExtendedRosenbrock {
    /// Fixture over `n` variables without scaling.
    ///
    /// # Panics
    ///
    /// If `n` is zero or odd.
    pub fn new(n: usize) -> Self {
        Self::with_scaling(n, 1.0)
    }

    /// Fixture over `n` variables with scaling `alpha`.
    ///
    /// # Panics
    ///
    /// If `n` is zero or odd or `alpha` is not positive.
    pub fn with_scaling(n: usize, alpha: f64) -> Self {
        assert!(n > 0 && n % 2 == 0, "variables must come in pairs");
        assert!(alpha > 0.0, "scaling must be positive");
        Self { n, alpha }
    }
}

impl Default for ExtendedRosenbrock {
    fn default() -> Self {
        Self::new(2)
    }
}

impl TestModel for ExtendedRosenbrock {
    fn dim(&self) -> usize {
        self.n
    }

    fn build<'g>(&self, graph: &'g Graph) -> Model<'g> {
        let alpha = self.alpha;
        Model::new(graph, self.n, |x| {
            x.chunks(2)
                .flat_map(|pair| {
                    let x1 = pair[0] * alpha;
                    let x2 = pair[1] / alpha;
                    [(x2 - x1 * x1) * 10.0, 1.0 - x1]
                })
                .collect()
        })
    }

    fn initials(&self) -> Vec<Value> {
        vec![
            repeated(self.n, &[-1.2, 1.0]),
            repeated(self.n, &[6.39, -0.221]),
        ]
    }

    fn optima(&self) -> Vec<Value> {
        vec![repeated(self.n, &[1.0 / self.alpha, self.alpha])]
    }
}

/// Powell residuals over consecutive quadruples of variables: two linear
/// ones and two squared differences.
///
/// At the zero optimum the squared residuals have zero derivatives, so the
/// Jacobian of the residuals loses rank there.
#[derive(Debug, Clone, Copy)]
pub struct ExtendedPowell {
    n: usize,
}

impl ExtendedPowell {
    /// Fixture over `n` variables.
    ///
    /// # Panics
    ///
    /// If `n` is zero or not a multiple of 4.
    pub fn new(n: usize) -> Self {
        assert!(n > 0 && n % 4 == 0, "variables must come in quadruples");
        Self { n }
    }
}

impl Default for ExtendedPowell {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TestModel for ExtendedPowell {
    fn dim(&self) -> usize {
        self.n
    }

    fn build<'g>(&self, graph: &'g Graph) -> Model<'g> {
        Model::new(graph, self.n, |x| {
            x.chunks(4)
                .flat_map(|x| {
                    [
                        x[0] + x[1] * 10.0,
                        (x[2] - x[3]) * 5f64.sqrt(),
                        (x[1] - x[2] * 2.0).powi(2),
                        (x[0] - x[3]).powi(2) * 10f64.sqrt(),
                    ]
                })
                .collect()
        })
    }

    fn initials(&self) -> Vec<Value> {
        vec![repeated(self.n, &[3.0, -1.0, 0.0, 1.0])]
    }

    fn optima(&self) -> Vec<Value> {
        vec![Value::zeros(self.n)]
    }
}

/// Sum of squares of the variables themselves.
///
/// Every derivative is diagonal and every bound is exact, which makes it the
/// first fixture to try when something looks wrong.
#[derive(Debug, Clone, Copy)]
pub struct Sphere {
    n: usize,
}

impl Sphere {
    /// Fixture over `n` variables.
    ///
    /// # Panics
    ///
    /// If `n` is zero.
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "at least one variable is needed");
        Self { n }
    }
}

impl Default for Sphere {
    fn default() -> Self {
        Self::new(2)
    }
}

impl TestModel for Sphere {
    fn dim(&self) -> usize {
        self.n
    }

    fn build<'g>(&self, graph: &'g Graph) -> Model<'g> {
        Model::new(graph, self.n, |x| x.to_vec())
    }

    fn initials(&self) -> Vec<Value> {
        vec![repeated(self.n, &[10.0, -10.0])]
    }

    fn optima(&self) -> Vec<Value> {
        vec![Value::zeros(self.n)]
    }
}

/// Residuals `x_i - exp(cos(i * sum(x)))` sharing one sum node.
///
/// Every residual depends on all variables, so the Jacobian of the residuals
/// is dense even though each residual is built from a few nodes.
#[derive(Debug, Clone, Copy)]
pub struct Exponential {
    n: usize,
}

impl Exponential {
    /// Fixture over `n` variables.
    ///
    /// # Panics
    ///
    /// If `n` is zero.
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "at least one variable is needed");
        Self { n }
    }
}

impl Default for Exponential {
    fn default() -> Self {
        Self::new(2)
    }
}

impl TestModel for Exponential {
    fn dim(&self) -> usize {
        self.n
    }

    fn build<'g>(&self, graph: &'g Graph) -> Model<'g> {
        Model::new(graph, self.n, |x| {
            let total = match sum_of(x.to_vec()) {
                Ok(total) => total,
                Err(error) => panic!("{}", error),
            };

            x.iter()
                .enumerate()
                .map(|(i, xi)| *xi - (total * ((i + 1) as f64)).cos().exp())
                .collect()
        })
    }

    fn initials(&self) -> Vec<Value> {
        vec![Value::zeros(self.n)]
    }
}

/// Failure of a testing check.
#[derive(Debug, thiserror::Error)]
pub enum TestingError {
    /// Error of the engine.
    #[error("{0}")]
    Inner(#[from] Error),
    /// Analytic derivative differs from finite differences.
    #[error("derivative w.r.t. `{name}` differs from finite differences by {violation:e}")]
    Derivative {
        /// Name of the variable.
        name: String,
        /// Largest relative difference.
        violation: f64,
    },
    /// Value at a point of the domain lies outside the computed bounds.
    #[error("value {value} at sample {sample} outside [{lower}, {upper}]")]
    Unsound {
        /// Index of the sample.
        sample: usize,
        /// Offending value.
        value: f64,
        /// Lower bound.
        lower: f64,
        /// Upper bound.
        upper: f64,
    },
}

/// Checks analytic derivatives against finite differences with the tolerance
/// of the graph options.
pub fn check_derivatives(expr: &Expr<'_>, point: &Point) -> Result<(), TestingError> {
    let max_violation = expr.graph().options().max_violation();

    match check_derivative(expr, point)?
        .into_iter()
        .find(|check| !check.passed(max_violation))
    {
        Some(check) => Err(TestingError::Derivative {
            name: check.name,
            violation: check.violation,
        }),
        None => Ok(()),
    }
}

/// Samples a random sub-box of `[lower, upper]` for every component of
/// every variable.
pub fn random_sub_domain<R: Rng>(vars: &[Expr<'_>], lower: f64, upper: f64, rng: &mut R) -> Domain {
    let uniform = Uniform::new_inclusive(lower, upper);

    vars.iter()
        .fold(Domain::builder(), |builder, var| {
            let (lo, hi): (Vec<f64>, Vec<f64>) = (0..var.size().unwrap_or(1))
                .map(|_| {
                    let (a, b) = (uniform.sample(rng), uniform.sample(rng));
                    (a.min(b), a.max(b))
                })
                .unzip();
            builder.bound(var, Value::from_vec(lo), Value::from_vec(hi))
        })
        .build()
}

/// Samples a point with every component of every variable drawn from
/// `[lower, upper]`.
pub fn random_point<R: Rng>(vars: &[Expr<'_>], lower: f64, upper: f64, rng: &mut R) -> Point {
    let uniform = Uniform::new_inclusive(lower, upper);

    vars.iter()
        .fold(Point::builder(), |builder, var| {
            let n = var.size().unwrap_or(1);
            builder.set(var, Value::from_fn(n, |_, _| uniform.sample(rng)))
        })
        .build()
}

/// Samples points of the domain and checks that the values of the
/// expression lie within its bounds. Undefined values are skipped.
pub fn check_soundness<R: Rng>(
    expr: &Expr<'_>,
    domain: &Domain,
    samples: usize,
    rng: &mut R,
) -> Result<Interval, TestingError> {
    let bounds = expr.interval(domain)?;

    for sample in 0..samples {
        let point = domain.sample(rng);
        let value = expr.eval(&point)?;

        for (i, v) in value.iter().enumerate() {
            let (lower, upper) = (bounds.lower[i], bounds.upper[i]);
            let tol = 1e-9 * (1.0 + v.abs());
            if !v.is_nan() && (*v < lower - tol || *v > upper + tol) {
                return Err(TestingError::Unsound {
                    sample,
                    value: *v,
                    lower,
                    upper,
                });
            }
        }
    }

    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::{rngs::StdRng, SeedableRng};

    fn models() -> Vec<Box<dyn TestModel>> {
        vec![
            Box::new(ExtendedRosenbrock::with_scaling(4, 2.0)),
            Box::new(ExtendedPowell::default()),
            Box::new(Sphere::new(3)),
            Box::new(Exponential::new(3)),
        ]
    }

    #[test]
    fn optima_are_zeros() {
        for model in models() {
            let graph = Graph::new();
            let built = model.build(&graph);
            for optimum in model.optima() {
                let value = built.objective.eval(&built.point(&optimum)).unwrap();
                assert!(value[0].abs() < 1e-12, "{}", value[0]);
            }
        }
    }

    #[test]
    fn derivatives_at_initials() {
        for model in models() {
            let graph = Graph::new();
            let built = model.build(&graph);
            for init in model.initials() {
                check_derivatives(&built.objective, &built.point(&init)).unwrap();
            }
        }
    }

    #[test]
    fn bounds_of_sub_boxes() {
        let mut rng = StdRng::seed_from_u64(3);
        for model in models() {
            let graph = Graph::new();
            let built = model.build(&graph);
            for _ in 0..50 {
                let domain = random_sub_domain(&built.vars, -2.0, 2.0, &mut rng);
                check_soundness(&built.objective, &domain, 10, &mut rng).unwrap();
            }
        }
    }

    #[test]
    fn samplers_cover_vector_variables() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 3);
        let s = graph.var("s");
        let mut rng = StdRng::seed_from_u64(8);

        let domain = random_sub_domain(&[x, s], -1.0, 1.0, &mut rng);
        let bounds = x.interval(&domain).unwrap();
        assert_eq!(bounds.len(), 3);
        assert!(bounds.lower.iter().all(|lo| *lo >= -1.0));
        assert!(bounds.upper.iter().all(|hi| *hi <= 1.0));

        let point = random_point(&[x, s], 2.0, 3.0, &mut rng);
        assert_eq!(point.get(&x).map(|v| v.len()), Some(3));
        assert!(point.get(&s).unwrap()[0] >= 2.0);
        assert!((x * s).eval(&point).is_ok());
    }
}
