use std::{
    f64::consts::{LN_10, LN_2},
    rc::Rc,
};

use crate::{
    core::{
        Block, DerivativeRule, Error, Expr, FunctionBuilder, IntervalRule, LocalRule, OrderRule,
        Value,
    },
    interval::{self, Interval},
};

use super::{build, elementwise_block, with_domain};

/// Smallest argument of logarithms considered inside their domain.
const LOG_FLOOR: f64 = 1e-300;

/// Elementwise function of one argument with its derivative and interval
/// kernel.
struct Elementary {
    forward: fn(f64) -> f64,
    derivative: fn(f64) -> f64,
    kernel: fn(&Interval) -> Interval,
    discrete: bool,
}

impl<'g> Expr<'g> {
    fn elementary(self, spec: Elementary) -> Expr<'g> {
        let Elementary {
            forward,
            derivative,
            kernel,
            discrete,
        } = spec;

        let rule: LocalRule = Rc::new(move |inputs: &[Value]| -> Result<Block, Error> {
            Ok(elementwise_block(inputs[0].map(derivative), inputs[0].len()))
        });

        let builder = FunctionBuilder::new(move |inputs: &[Value]| Ok(inputs[0].map(forward)))
            .input(self)
            .derivative(DerivativeRule::PerInput(vec![Some(rule)]))
            .interval(IntervalRule::Kernel(Rc::new(
                move |inputs: &[Interval]| -> Result<Interval, Error> { Ok(kernel(&inputs[0])) },
            )))
            .order(OrderRule::Generic);

        let builder = self.unary(builder);
        let builder = if discrete {
            builder.discrete(true)
        } else {
            builder
        };

        build(self.graph, builder)
    }

    fn smooth(
        self,
        forward: fn(f64) -> f64,
        derivative: fn(f64) -> f64,
        kernel: fn(&Interval) -> Interval,
    ) -> Expr<'g> {
        self.elementary(Elementary {
            forward,
            derivative,
            kernel,
            discrete: false,
        })
    }

    /// Sine.
    pub fn sin(self) -> Expr<'g> {
        self.smooth(f64::sin, f64::cos, interval::sin)
    }

    /// Cosine.
    pub fn cos(self) -> Expr<'g> {
        self.smooth(f64::cos, |x| -x.sin(), interval::cos)
    }

    /// Tangent.
    pub fn tan(self) -> Expr<'g> {
        self.smooth(f64::tan, |x| 1.0 + x.tan().powi(2), interval::tan)
    }

    /// Arcsine. Attaches `-1 < self < 1`.
    pub fn asin(self) -> Expr<'g> {
        let node = self.smooth(f64::asin, |x| 1.0 / (1.0 - x * x).sqrt(), interval::asin);
        attach_unit_bounds(node, self)
    }

    /// Arccosine. Attaches `-1 < self < 1`.
    pub fn acos(self) -> Expr<'g> {
        let node = self.smooth(f64::acos, |x| -1.0 / (1.0 - x * x).sqrt(), interval::acos);
        attach_unit_bounds(node, self)
    }

    /// Arctangent.
    pub fn atan(self) -> Expr<'g> {
        self.smooth(f64::atan, |x| 1.0 / (1.0 + x * x), |a| {
            interval::monotone(a, f64::atan, true)
        })
    }

    /// Hyperbolic sine.
    pub fn sinh(self) -> Expr<'g> {
        self.smooth(f64::sinh, f64::cosh, |a| interval::monotone(a, f64::sinh, true))
    }

    /// Hyperbolic cosine.
    pub fn cosh(self) -> Expr<'g> {
        self.smooth(f64::cosh, f64::sinh, |a| interval::even(a, f64::cosh))
    }

    /// Hyperbolic tangent.
    pub fn tanh(self) -> Expr<'g> {
        self.smooth(f64::tanh, |x| 1.0 - x.tanh().powi(2), |a| {
            interval::monotone(a, f64::tanh, true)
        })
    }

    /// Inverse hyperbolic sine.
    pub fn asinh(self) -> Expr<'g> {
        self.smooth(f64::asinh, |x| 1.0 / (x * x + 1.0).sqrt(), |a| {
            interval::monotone(a, f64::asinh, true)
        })
    }

    /// Inverse hyperbolic cosine.
    pub fn acosh(self) -> Expr<'g> {
        self.smooth(f64::acosh, |x| 1.0 / (x * x - 1.0).sqrt(), interval::acosh)
    }

    /// Inverse hyperbolic tangent.
    pub fn atanh(self) -> Expr<'g> {
        self.smooth(f64::atanh, |x| 1.0 / (1.0 - x * x), interval::atanh)
    }

    /// Exponential.
    pub fn exp(self) -> Expr<'g> {
        self.smooth(f64::exp, f64::exp, |a| interval::monotone(a, f64::exp, true))
    }

    /// Square root. Attaches `self > 0`; negative arguments evaluate to `NaN`.
    pub fn sqrt(self) -> Expr<'g> {
        let node = self.smooth(f64::sqrt, |x| 0.5 / x.sqrt(), interval::sqrt);
        attach_lower(node, self, 0.0)
    }

    /// Absolute value. The derivative at zero is zero.
    pub fn abs(self) -> Expr<'g> {
        self.smooth(f64::abs, sign, |a| interval::even(a, f64::abs))
    }

    /// Natural logarithm. Attaches `self > 1e-300`.
    pub fn ln(self) -> Expr<'g> {
        let node = self.smooth(f64::ln, |x| 1.0 / x, |a| interval::log(a, f64::ln));
        attach_lower(node, self, LOG_FLOOR)
    }

    /// Binary logarithm. Attaches `self > 1e-300`.
    pub fn log2(self) -> Expr<'g> {
        let node = self.smooth(f64::log2, |x| 1.0 / (x * LN_2), |a| {
            interval::log(a, f64::log2)
        });
        attach_lower(node, self, LOG_FLOOR)
    }

    /// Decimal logarithm. Attaches `self > 1e-300`.
    pub fn log10(self) -> Expr<'g> {
        let node = self.smooth(f64::log10, |x| 1.0 / (x * LN_10), |a| {
            interval::log(a, f64::log10)
        });
        attach_lower(node, self, LOG_FLOOR)
    }

    /// Smallest integer greater than or equal to each component. Discrete.
    pub fn ceil(self) -> Expr<'g> {
        self.elementary(Elementary {
            forward: f64::ceil,
            derivative: |_| 0.0,
            kernel: |a| interval::monotone(a, f64::ceil, true),
            discrete: true,
        })
    }

    /// Largest integer less than or equal to each component. Discrete.
    pub fn floor(self) -> Expr<'g> {
        self.elementary(Elementary {
            forward: f64::floor,
            derivative: |_| 0.0,
            kernel: |a| interval::monotone(a, f64::floor, true),
            discrete: true,
        })
    }
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn attach_lower<'g>(node: Expr<'g>, arg: Expr<'g>, bound: f64) -> Expr<'g> {
    with_domain(node, arg.gt(bound))
}

fn attach_unit_bounds<'g>(node: Expr<'g>, arg: Expr<'g>) -> Expr<'g> {
    let node = with_domain(node, arg.gt(-1.0));
    with_domain(node, arg.lt(1.0))
}
