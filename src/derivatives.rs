//! Finite difference approximations and checks of analytic derivatives.

use log::debug;
use nalgebra::DMatrix;

use crate::{
    core::{Block, Error, Expr, Forward, Point, Value},
    engine::DiffOptions,
};

/// Square root of double precision machine epsilon. This value is a standard
/// constant for epsilons in approximating first-order derivate-based concepts.
pub const EPSILON_SQRT: f64 = 0.000000014901161193847656;

/// Cubic root of double precision machine epsilon. This value is a standard
/// constant for epsilons in approximating second-order derivate-based concepts.
pub const EPSILON_CBRT: f64 = 0.0000060554544523933395;

/// Finite difference stencil.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stencil {
    /// `(f(x + h) - f(x)) / h`.
    Forward,
    /// `(f(x + h) - f(x - h)) / 2h`.
    Central,
    /// Fourth order five-point stencil.
    FivePoint,
}

impl Stencil {
    /// Relative step used when no explicit step is configured.
    pub fn default_step(&self) -> f64 {
        match self {
            Stencil::Forward => EPSILON_SQRT,
            Stencil::Central | Stencil::FivePoint => EPSILON_CBRT,
        }
    }
}

impl Default for Stencil {
    fn default() -> Self {
        Stencil::Central
    }
}

fn step_size(xj: f64, eps: f64) -> f64 {
    // Scale the step by the value itself, falling back to the unit magnitude
    // near zero, so that the perturbation is neither lost in rounding nor too
    // coarse.
    let step = eps * xj.abs().max(1.0) * xj.signum();
    if step == 0.0 {
        eps
    } else {
        step
    }
}

/// Approximates the Jacobian block of a forward map with respect to its
/// `k`-th input. The result is a dense matrix of shape (output size, input
/// size).
pub fn numeric_block(
    forward: &Forward,
    inputs: &[Value],
    k: usize,
    stencil: Stencil,
    step: Option<f64>,
) -> Result<Block, Error> {
    let eps = step.unwrap_or_else(|| stencil.default_step());
    let fx = forward(inputs)?;
    let n = inputs[k].len();

    debug!(
        "approximating {}x{} block of input {} by {:?} differences",
        fx.len(),
        n,
        k,
        stencil
    );

    let mut shifted = inputs.to_vec();
    let mut eval_at = |j: usize, delta: f64| -> Result<Value, Error> {
        shifted[k][j] = inputs[k][j] + delta;
        let value = forward(&shifted)?;
        shifted[k][j] = inputs[k][j];

        if value.len() != fx.len() {
            return Err(Error::ShapeMismatch {
                op: "finite difference",
                left: value.len(),
                right: fx.len(),
            });
        }

        Ok(value)
    };

    let mut jac = DMatrix::zeros(fx.len(), n);
    for j in 0..n {
        let h = step_size(inputs[k][j], eps);

        let col = match stencil {
            Stencil::Forward => (eval_at(j, h)? - &fx) / h,
            Stencil::Central => (eval_at(j, h)? - eval_at(j, -h)?) / (2.0 * h),
            Stencil::FivePoint => {
                let f2 = eval_at(j, 2.0 * h)?;
                let f1 = eval_at(j, h)?;
                let b1 = eval_at(j, -h)?;
                let b2 = eval_at(j, -2.0 * h)?;
                (b2 - f2 + (f1 - b1) * 8.0) / (12.0 * h)
            }
        };

        jac.set_column(j, &col);
    }

    Ok(Block::Dense(jac))
}

/// Approximates the Jacobian of an expression with respect to one variable
/// by perturbing the variable in the point.
pub fn numeric_jacobian(
    expr: &Expr<'_>,
    point: &Point,
    var: &Expr<'_>,
) -> Result<DMatrix<f64>, Error> {
    let options = expr.graph().options();
    let x = point
        .get(var)
        .ok_or_else(|| Error::MissingValue { name: var.name() })?
        .clone();

    let forward = |value: &Value| expr.eval(&point.with_value(var, value.clone()));
    let fx = forward(&x)?;

    let stencil = options.stencil();
    let eps = options.diff_step().unwrap_or_else(|| stencil.default_step());

    let mut jac = DMatrix::zeros(fx.len(), x.len());
    let mut shifted = x.clone();
    for j in 0..x.len() {
        let h = step_size(x[j], eps);
        let mut eval_at = |delta: f64| -> Result<Value, Error> {
            shifted[j] = x[j] + delta;
            let value = forward(&shifted);
            shifted[j] = x[j];
            value
        };

        let col = match stencil {
            Stencil::Forward => (eval_at(h)? - &fx) / h,
            Stencil::Central => (eval_at(h)? - eval_at(-h)?) / (2.0 * h),
            Stencil::FivePoint => {
                let f2 = eval_at(2.0 * h)?;
                let f1 = eval_at(h)?;
                let b1 = eval_at(-h)?;
                let b2 = eval_at(-2.0 * h)?;
                (b2 - f2 + (f1 - b1) * 8.0) / (12.0 * h)
            }
        };

        jac.set_column(j, &col);
    }

    Ok(jac)
}

/// Comparison of the analytic and numeric derivative with respect to one
/// variable.
#[derive(Debug, Clone)]
pub struct DerivativeCheck {
    /// Name of the variable.
    pub name: String,
    /// Analytic derivative.
    pub analytic: DMatrix<f64>,
    /// Finite difference approximation.
    pub numeric: DMatrix<f64>,
    /// Largest relative difference `|a - n| / (1 + |n|)` over all entries.
    pub violation: f64,
}

impl DerivativeCheck {
    /// Returns `true` if the violation does not exceed the tolerance.
    pub fn passed(&self, max_violation: f64) -> bool {
        self.violation <= max_violation
    }
}

/// Compares analytic derivatives of an expression with central differences
/// for every variable the expression depends on.
///
/// Variables are reported in the order of their creation. Use
/// [`EngineOptions::max_violation`](crate::EngineOptions::max_violation) as
/// the usual tolerance for [`DerivativeCheck::passed`].
pub fn check_derivative(expr: &Expr<'_>, point: &Point) -> Result<Vec<DerivativeCheck>, Error> {
    let derivative = expr.diff_with(point, &DiffOptions::new().with_exact_shape(true))?;

    expr.dependencies()
        .into_iter()
        .map(|var| {
            let numeric = numeric_jacobian(expr, point, &var)?;
            let analytic = match derivative.get(&var) {
                Some(block) => block.to_dense(),
                None => DMatrix::zeros(numeric.nrows(), numeric.ncols()),
            };

            let violation = analytic
                .iter()
                .zip(numeric.iter())
                .map(|(a, n)| (a - n).abs() / (1.0 + n.abs()))
                .fold(0.0, f64::max);

            if violation > expr.graph().options().max_violation() {
                debug!(
                    "derivative of {} w.r.t. {} differs by {:e}",
                    expr.name(),
                    var.name(),
                    violation
                );
            }

            Ok(DerivativeCheck {
                name: var.name(),
                analytic,
                numeric,
                violation,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FunctionBuilder, Graph};

    use std::rc::Rc;

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;

    fn cubic() -> Forward {
        Rc::new(|inputs: &[Value]| Ok(inputs[0].map(|v| v.powi(3)) + &inputs[1]))
    }

    #[test]
    fn stencils_approximate_cubic() {
        let inputs = vec![dvector![2.0, -1.0], dvector![1.0, 1.0]];

        for stencil in [Stencil::Forward, Stencil::Central, Stencil::FivePoint] {
            let jac = numeric_block(&cubic(), &inputs, 0, stencil, None)
                .unwrap()
                .to_dense();
            assert_abs_diff_eq!(jac[(0, 0)], 12.0, epsilon = 1e-5);
            assert_abs_diff_eq!(jac[(1, 1)], 3.0, epsilon = 1e-5);
            assert_abs_diff_eq!(jac[(0, 1)], 0.0, epsilon = 1e-5);
        }

        let jac = numeric_block(&cubic(), &inputs, 1, Stencil::Central, None)
            .unwrap()
            .to_dense();
        assert_abs_diff_eq!(jac[(0, 0)], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(jac[(1, 0)], 0.0, epsilon = 1e-8);
    }

    #[test]
    fn step_near_zero() {
        assert_eq!(step_size(0.0, EPSILON_SQRT), EPSILON_SQRT);
        assert_eq!(step_size(-100.0, 1e-3), -0.1);
    }

    #[test]
    fn numeric_jacobian_of_graph() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 2);
        let f = (x * x).sum();

        let p = Point::builder().set(&x, [1.0, -3.0]).build();
        let jac = numeric_jacobian(&f, &p, &x).unwrap();
        assert_abs_diff_eq!(jac[(0, 0)], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(jac[(0, 1)], -6.0, epsilon = 1e-6);
    }

    #[test]
    fn check_passes_for_exact_rules() {
        let graph = Graph::new();
        let a = graph.var("a");
        let b = graph.var("b");
        let f = a * b + a.sin();

        let p = Point::builder().set(&a, 2.0).set(&b, 3.0).build();
        let checks = check_derivative(&f, &p).unwrap();

        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].name, "a");
        assert!(checks
            .iter()
            .all(|check| check.passed(graph.options().max_violation())));
    }

    #[test]
    fn check_detects_wrong_rule() {
        let graph = Graph::new();
        let x = graph.var("x");
        let builder = FunctionBuilder::new(|inputs: &[Value]| Ok(inputs[0].map(f64::exp)))
            .input(x)
            .joint_derivative(|inputs: &[Value]| Ok(Block::Scalar(2.0 * inputs[0][0])));
        let f = graph.function(builder).unwrap();

        let p = Point::builder().set(&x, 1.0).build();
        let checks = check_derivative(&f, &p).unwrap();
        assert!(!checks[0].passed(1e-2));
    }
}
