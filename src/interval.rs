//! Interval arithmetic kernels used for bound propagation.
//!
//! All kernels compute sound outer approximations: every value the function
//! attains for arguments inside the input intervals lies inside the output
//! interval. Indeterminate forms are resolved conservatively, `0 * inf` is
//! zero (the zero is exact) and `inf - inf` widens to the whole real line.
//!
//! Alongside the bounds, an interval carries a `definite` flag which is
//! cleared whenever some argument inside the box lies outside the domain of
//! the function (e.g. logarithm of a nonpositive number).

use std::f64::consts::{FRAC_PI_2, PI};

use crate::core::{broadcast_size, broadcast_to, Error, Value};

/// Lower and upper bounds of a vector valued function over a box.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    /// Lower bounds.
    pub lower: Value,
    /// Upper bounds.
    pub upper: Value,
    /// `false` if the function is not defined everywhere in the box.
    pub definite: bool,
}

impl Interval {
    /// Creates an interval with given bounds.
    pub fn new(lower: Value, upper: Value) -> Self {
        assert_eq!(lower.len(), upper.len(), "bounds have different size");
        Self {
            lower,
            upper,
            definite: true,
        }
    }

    /// Creates a one-dimensional interval.
    pub fn scalar(lower: f64, upper: f64) -> Self {
        Self::new(Value::from_element(1, lower), Value::from_element(1, upper))
    }

    /// Creates a degenerate interval containing a single value.
    pub fn point(value: Value) -> Self {
        Self::new(value.clone(), value)
    }

    /// Interval containing all reals.
    pub fn unbounded(n: usize) -> Self {
        Self::new(
            Value::from_element(n, f64::NEG_INFINITY),
            Value::from_element(n, f64::INFINITY),
        )
    }

    /// Sets the definite flag.
    pub fn with_definite(mut self, definite: bool) -> Self {
        self.definite = definite;
        self
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.lower.len()
    }

    /// Returns `true` if the interval has no components.
    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    /// Returns `true` if all bounds are finite.
    pub fn is_finite(&self) -> bool {
        self.lower.iter().chain(self.upper.iter()).all(|v| v.is_finite())
    }

    /// Returns `true` if every component of `value` lies inside the bounds
    /// (enlarged by `tol`).
    pub fn contains(&self, value: &Value, tol: f64) -> bool {
        value.len() == self.len()
            && value
                .iter()
                .zip(self.lower.iter().zip(self.upper.iter()))
                .all(|(v, (lo, hi))| *v >= lo - tol && *v <= hi + tol)
    }

    /// Interval of component `i`.
    pub fn component(&self, i: usize) -> Interval {
        Interval::scalar(self.lower[i], self.upper[i]).with_definite(self.definite)
    }

    /// Components `start..end`.
    pub fn rows(&self, start: usize, end: usize) -> Interval {
        Interval::new(
            self.lower.rows(start, end - start).into_owned(),
            self.upper.rows(start, end - start).into_owned(),
        )
        .with_definite(self.definite)
    }

    /// Broadcasts a one-dimensional interval to `n` components.
    pub fn broadcast(&self, op: &'static str, n: usize) -> Result<Interval, Error> {
        if self.len() == n {
            Ok(self.clone())
        } else if self.len() == 1 {
            Ok(Interval::new(
                Value::from_element(n, self.lower[0]),
                Value::from_element(n, self.upper[0]),
            )
            .with_definite(self.definite))
        } else {
            Err(Error::ShapeMismatch {
                op,
                left: self.len(),
                right: n,
            })
        }
    }

    /// Smallest interval containing both intervals.
    pub fn hull(&self, other: &Interval) -> Result<Interval, Error> {
        let (a, b) = pair("hull", self, other)?;
        Ok(Interval::new(
            a.lower.zip_map(&b.lower, f64::min),
            a.upper.zip_map(&b.upper, f64::max),
        )
        .with_definite(a.definite && b.definite))
    }

    /// Concatenates intervals.
    pub fn stack(parts: &[Interval]) -> Interval {
        let lower = parts.iter().flat_map(|p| p.lower.iter().copied());
        let upper = parts.iter().flat_map(|p| p.upper.iter().copied());
        let n = parts.iter().map(Interval::len).sum();
        Interval::new(Value::from_iterator(n, lower), Value::from_iterator(n, upper))
            .with_definite(parts.iter().all(|p| p.definite))
    }

    fn sanitized(mut self) -> Self {
        self.lower.iter_mut().for_each(|v| {
            if v.is_nan() {
                *v = f64::NEG_INFINITY;
            }
        });
        self.upper.iter_mut().for_each(|v| {
            if v.is_nan() {
                *v = f64::INFINITY;
            }
        });
        self
    }

    fn map_bounds<F>(&self, f: F) -> Interval
    where
        F: Fn(f64, f64) -> (f64, f64),
    {
        let mut lower = self.lower.clone();
        let mut upper = self.upper.clone();
        lower
            .iter_mut()
            .zip(upper.iter_mut())
            .for_each(|(lo, hi)| {
                let (l, u) = f(*lo, *hi);
                *lo = l;
                *hi = u;
            });
        Interval::new(lower, upper)
            .with_definite(self.definite)
            .sanitized()
    }
}

fn pair(op: &'static str, a: &Interval, b: &Interval) -> Result<(Interval, Interval), Error> {
    let n = broadcast_size(op, a.len(), b.len())?;
    Ok((a.broadcast(op, n)?, b.broadcast(op, n)?))
}

fn mul0(a: f64, b: f64) -> f64 {
    if a == 0.0 || b == 0.0 {
        0.0
    } else {
        a * b
    }
}

/// Sum of intervals.
pub fn add(a: &Interval, b: &Interval) -> Result<Interval, Error> {
    let (a, b) = pair("add", a, b)?;
    Ok(Interval::new(&a.lower + &b.lower, &a.upper + &b.upper)
        .with_definite(a.definite && b.definite)
        .sanitized())
}

/// Negation.
pub fn neg(a: &Interval) -> Interval {
    Interval::new(-&a.upper, -&a.lower).with_definite(a.definite)
}

/// Difference of intervals.
pub fn sub(a: &Interval, b: &Interval) -> Result<Interval, Error> {
    add(a, &neg(b))
}

/// Product of intervals.
pub fn mul(a: &Interval, b: &Interval) -> Result<Interval, Error> {
    let (a, b) = pair("mul", a, b)?;
    let n = a.len();
    let mut lower = Value::zeros(n);
    let mut upper = Value::zeros(n);

    for i in 0..n {
        let corners = [
            mul0(a.lower[i], b.lower[i]),
            mul0(a.lower[i], b.upper[i]),
            mul0(a.upper[i], b.lower[i]),
            mul0(a.upper[i], b.upper[i]),
        ];
        lower[i] = corners.iter().copied().fold(f64::INFINITY, f64::min);
        upper[i] = corners.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    }

    Ok(Interval::new(lower, upper)
        .with_definite(a.definite && b.definite)
        .sanitized())
}

/// Square of an interval, used when both factors of a product are the same
/// expression.
pub fn square(a: &Interval) -> Interval {
    powi(a, 2)
}

/// Reciprocal.
pub fn recip(a: &Interval) -> Interval {
    let mut definite = a.definite;
    let mut lower = a.lower.clone();
    let mut upper = a.upper.clone();

    for i in 0..a.len() {
        let (lo, hi) = (a.lower[i], a.upper[i]);
        let (l, u) = if lo > 0.0 || hi < 0.0 {
            (1.0 / hi, 1.0 / lo)
        } else if lo == 0.0 && hi > 0.0 {
            definite = false;
            (1.0 / hi, f64::INFINITY)
        } else if hi == 0.0 && lo < 0.0 {
            definite = false;
            (f64::NEG_INFINITY, 1.0 / lo)
        } else {
            definite = false;
            (f64::NEG_INFINITY, f64::INFINITY)
        };
        lower[i] = l;
        upper[i] = u;
    }

    Interval::new(lower, upper).with_definite(definite)
}

/// Quotient of intervals. A denominator containing zero makes the result
/// indefinite and unbounded on the corresponding side(s).
pub fn div(a: &Interval, b: &Interval) -> Result<Interval, Error> {
    mul(a, &recip(b))
}

/// Integer power.
pub fn powi(a: &Interval, n: i32) -> Interval {
    if n < 0 {
        powu(&recip(a), n.unsigned_abs())
    } else {
        powu(a, n.unsigned_abs())
    }
}

fn powu(a: &Interval, n: u32) -> Interval {
    // `i32::MIN` has no positive counterpart.
    let f = move |x: f64| match i32::try_from(n) {
        Ok(n) => x.powi(n),
        Err(_) => x.powf(f64::from(n)),
    };

    if n == 0 {
        Interval::point(Value::from_element(a.len(), 1.0)).with_definite(a.definite)
    } else if n % 2 == 0 {
        a.map_bounds(|lo, hi| {
            if lo >= 0.0 {
                (f(lo), f(hi))
            } else if hi <= 0.0 {
                (f(hi), f(lo))
            } else {
                (0.0, f(lo).max(f(hi)))
            }
        })
    } else {
        a.map_bounds(|lo, hi| (f(lo), f(hi)))
    }
}

/// Real power with constant exponent. Negative bases are outside the domain
/// for non-integer exponents.
pub fn powf(a: &Interval, p: f64) -> Interval {
    if p.fract() == 0.0 && p >= f64::from(i32::MIN) && p <= f64::from(i32::MAX) {
        return powi(a, p as i32);
    }

    let definite = a.definite && a.lower.iter().all(|lo| *lo >= 0.0);
    a.map_bounds(|lo, hi| {
        let (lo, hi) = (lo.max(0.0), hi.max(0.0));
        if p > 0.0 {
            (lo.powf(p), hi.powf(p))
        } else {
            (hi.powf(p), lo.powf(p))
        }
    })
    .with_definite(definite)
}

/// Power with a constant exponent per component, broadcast against the
/// base. Components with an integer exponent keep negative bases.
pub fn powf_each(a: &Interval, exponents: &Value) -> Result<Interval, Error> {
    let n = broadcast_size("pow", a.len(), exponents.len())?;
    let base = a.broadcast("pow", n)?;
    let exponents = broadcast_to("pow", exponents, n)?;
    let parts = (0..n)
        .map(|i| powf(&base.component(i), exponents[i]))
        .collect::<Vec<_>>();
    Ok(Interval::stack(&parts))
}

/// Power with both base and exponent varying. Computed as `exp(b * ln(a))`
/// with the base restricted to nonnegative values.
pub fn pow(a: &Interval, b: &Interval) -> Result<Interval, Error> {
    let definite = a.definite && a.lower.iter().all(|lo| *lo >= 0.0);
    let base = a.map_bounds(|lo, hi| (lo.max(0.0), hi.max(0.0)));
    let log = monotone(&base, f64::ln, true);
    let product = mul(b, &log)?;
    Ok(monotone(&product, f64::exp, true).with_definite(definite && b.definite))
}

/// Applies a monotone function to the bounds.
pub fn monotone<F>(a: &Interval, f: F, increasing: bool) -> Interval
where
    F: Fn(f64) -> f64,
{
    if increasing {
        a.map_bounds(|lo, hi| (f(lo), f(hi)))
    } else {
        a.map_bounds(|lo, hi| (f(hi), f(lo)))
    }
}

/// Evaluates a unary function at the bounds and at its critical points
/// lying strictly inside them. If any evaluation is undefined, the result is
/// the whole real line.
pub fn with_critical_points<F, C>(a: &Interval, f: F, critical: C) -> Interval
where
    F: Fn(f64) -> f64,
    C: Fn(f64, f64) -> Vec<f64>,
{
    a.map_bounds(|lo, hi| {
        let candidates = [lo, hi]
            .into_iter()
            .chain(critical(lo, hi).into_iter().filter(|c| *c > lo && *c < hi))
            .map(&f)
            .collect::<Vec<_>>();

        if candidates.iter().any(|v| v.is_nan()) {
            (f64::NEG_INFINITY, f64::INFINITY)
        } else {
            (
                candidates.iter().copied().fold(f64::INFINITY, f64::min),
                candidates.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            )
        }
    })
}

/// Critical points `offset + k * period` inside `[lower, upper]`.
pub fn periodic_points(lower: f64, upper: f64, offset: f64, period: f64) -> Vec<f64> {
    if !lower.is_finite() || !upper.is_finite() {
        return Vec::new();
    }

    let first = ((lower - offset) / period).ceil() as i64;
    let last = ((upper - offset) / period).floor() as i64;
    (first..=last).map(|k| offset + k as f64 * period).collect()
}

fn trig(a: &Interval, f: fn(f64) -> f64, offset: f64) -> Interval {
    a.map_bounds(|lo, hi| {
        if !lo.is_finite() || !hi.is_finite() || hi - lo >= 2.0 * PI {
            return (-1.0, 1.0);
        }

        let values = [lo, hi]
            .into_iter()
            .chain(periodic_points(lo, hi, offset, PI))
            .map(f);
        let (l, u) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(l, u), v| {
            (l.min(v), u.max(v))
        });
        (l.max(-1.0), u.min(1.0))
    })
}

/// Sine.
pub fn sin(a: &Interval) -> Interval {
    trig(a, f64::sin, FRAC_PI_2)
}

/// Cosine.
pub fn cos(a: &Interval) -> Interval {
    trig(a, f64::cos, 0.0)
}

/// Tangent. Unbounded if the interval contains a pole.
pub fn tan(a: &Interval) -> Interval {
    a.map_bounds(|lo, hi| {
        let pole = !lo.is_finite()
            || !hi.is_finite()
            || hi - lo >= PI
            || !periodic_points(lo, hi, FRAC_PI_2, PI).is_empty();
        if pole {
            (f64::NEG_INFINITY, f64::INFINITY)
        } else {
            (lo.tan(), hi.tan())
        }
    })
}

/// Function with a single minimum at zero (`|x|`, `cosh`).
pub fn even<F>(a: &Interval, f: F) -> Interval
where
    F: Fn(f64) -> f64,
{
    with_critical_points(a, f, |_, _| vec![0.0])
}

fn restricted<F>(a: &Interval, lower: f64, upper: f64, f: F, increasing: bool) -> Interval
where
    F: Fn(f64) -> f64,
{
    let definite = a
        .lower
        .iter()
        .zip(a.upper.iter())
        .all(|(lo, hi)| *lo >= lower && *hi <= upper);
    let clipped = a.map_bounds(|lo, hi| {
        (
            lo.max(lower).min(upper),
            hi.min(upper).max(lower),
        )
    });
    monotone(&clipped, f, increasing).with_definite(a.definite && definite)
}

/// Square root.
pub fn sqrt(a: &Interval) -> Interval {
    restricted(a, 0.0, f64::INFINITY, f64::sqrt, true)
}

/// Inverse hyperbolic cosine.
pub fn acosh(a: &Interval) -> Interval {
    restricted(a, 1.0, f64::INFINITY, f64::acosh, true)
}

/// Arcsine.
pub fn asin(a: &Interval) -> Interval {
    restricted(a, -1.0, 1.0, f64::asin, true)
}

/// Arccosine.
pub fn acos(a: &Interval) -> Interval {
    restricted(a, -1.0, 1.0, f64::acos, false)
}

/// Inverse hyperbolic tangent.
pub fn atanh(a: &Interval) -> Interval {
    restricted(a, -1.0, 1.0, f64::atanh, true)
}

/// Logarithm with given monotone increasing implementation. A nonpositive
/// lower bound makes the result indefinite and unbounded from below.
pub fn log<F>(a: &Interval, f: F) -> Interval
where
    F: Fn(f64) -> f64,
{
    let definite = a.definite && a.lower.iter().all(|lo| *lo > 0.0);
    a.map_bounds(|lo, hi| {
        let lower = if lo > 0.0 { f(lo) } else { f64::NEG_INFINITY };
        let upper = if hi > 0.0 { f(hi) } else { f64::NEG_INFINITY };
        (lower, upper)
    })
    .with_definite(definite)
}

/// Elementwise minimum of two intervals.
pub fn minimum(a: &Interval, b: &Interval) -> Result<Interval, Error> {
    let (a, b) = pair("min", a, b)?;
    Ok(Interval::new(
        a.lower.zip_map(&b.lower, f64::min),
        a.upper.zip_map(&b.upper, f64::min),
    )
    .with_definite(a.definite && b.definite))
}

/// Elementwise maximum of two intervals.
pub fn maximum(a: &Interval, b: &Interval) -> Result<Interval, Error> {
    let (a, b) = pair("max", a, b)?;
    Ok(Interval::new(
        a.lower.zip_map(&b.lower, f64::max),
        a.upper.zip_map(&b.upper, f64::max),
    )
    .with_definite(a.definite && b.definite))
}

/// Sum of all components.
pub fn sum(a: &Interval) -> Interval {
    Interval::scalar(a.lower.sum(), a.upper.sum())
        .with_definite(a.definite)
        .sanitized()
}

/// Product of all components.
pub fn prod(a: &Interval) -> Result<Interval, Error> {
    (0..a.len()).try_fold(
        Interval::scalar(1.0, 1.0).with_definite(a.definite),
        |acc, i| mul(&acc, &a.component(i)),
    )
}

/// Smallest component.
pub fn min_element(a: &Interval) -> Interval {
    Interval::scalar(a.lower.min(), a.upper.min()).with_definite(a.definite)
}

/// Largest component.
pub fn max_element(a: &Interval) -> Interval {
    Interval::scalar(a.lower.max(), a.upper.max()).with_definite(a.definite)
}

/// Dot product.
pub fn dot(a: &Interval, b: &Interval) -> Result<Interval, Error> {
    Ok(sum(&mul(a, b)?))
}

/// Euclidean norm.
pub fn norm(a: &Interval) -> Interval {
    sqrt(&sum(&square(a))).with_definite(a.definite)
}

/// Cross product of three-dimensional intervals.
pub fn cross(a: &Interval, b: &Interval) -> Result<Interval, Error> {
    if a.len() != 3 || b.len() != 3 {
        return Err(Error::ShapeMismatch {
            op: "cross",
            left: a.len(),
            right: b.len(),
        });
    }

    let part = |i: usize, j: usize| -> Result<Interval, Error> {
        sub(
            &mul(&a.component(i), &b.component(j))?,
            &mul(&a.component(j), &b.component(i))?,
        )
    };

    Ok(Interval::stack(&[part(1, 2)?, part(2, 0)?, part(0, 1)?]))
}
