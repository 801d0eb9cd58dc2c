use std::{
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
};

use crate::{
    core::{
        scalar, zip_map, Block, DerivativeRule, Error, Expr, FunctionBuilder, IntervalKernel,
        IntervalRule, LocalRule, OrderRule, Value,
    },
    interval::{self, Interval},
};

use super::{
    all_discrete, binary_partial, build, elementwise_block, graph_of, static_size, with_domain,
    Term,
};

struct Binary {
    op: &'static str,
    forward: fn(f64, f64) -> f64,
    d_lhs: fn(f64, f64) -> f64,
    d_rhs: fn(f64, f64) -> f64,
    order: OrderRule,
}

fn binary<'g>(
    spec: Binary,
    lhs: Term<'g>,
    rhs: Term<'g>,
    kernel: IntervalKernel,
) -> Result<Expr<'g>, Error> {
    let Binary {
        op,
        forward,
        d_lhs,
        d_rhs,
        order,
    } = spec;

    let graph = graph_of(op, &[&lhs, &rhs])?;
    let size = static_size(op, [lhs.size(), rhs.size()])?;
    let inputs = vec![lhs.into_operand(), rhs.into_operand()];
    let discrete = all_discrete(graph, &inputs);

    let mut builder =
        FunctionBuilder::new(move |inputs: &[Value]| zip_map(op, &inputs[0], &inputs[1], forward))
            .inputs(inputs)
            .derivative(DerivativeRule::PerInput(vec![
                binary_partial(op, 0, d_lhs),
                binary_partial(op, 1, d_rhs),
            ]))
            .interval(IntervalRule::Kernel(kernel))
            .order(order)
            .discrete(discrete)
            .vectorized(true);
    if let Some(size) = size {
        builder = builder.size(size);
    }

    Ok(build(graph, builder))
}

fn binary_kernel(f: fn(&Interval, &Interval) -> Result<Interval, Error>) -> IntervalKernel {
    Rc::new(move |inputs: &[Interval]| f(&inputs[0], &inputs[1]))
}

pub(super) fn add<'g>(lhs: Term<'g>, rhs: Term<'g>) -> Result<Expr<'g>, Error> {
    let spec = Binary {
        op: "add",
        forward: |a, b| a + b,
        d_lhs: |_, _| 1.0,
        d_rhs: |_, _| 1.0,
        order: OrderRule::Max,
    };
    binary(spec, lhs, rhs, binary_kernel(interval::add))
}

pub(super) fn sub<'g>(lhs: Term<'g>, rhs: Term<'g>) -> Result<Expr<'g>, Error> {
    let spec = Binary {
        op: "sub",
        forward: |a, b| a - b,
        d_lhs: |_, _| 1.0,
        d_rhs: |_, _| -1.0,
        order: OrderRule::Max,
    };
    binary(spec, lhs, rhs, binary_kernel(interval::sub))
}

pub(super) fn mul<'g>(lhs: Term<'g>, rhs: Term<'g>) -> Result<Expr<'g>, Error> {
    let same = matches!((&lhs, &rhs), (Term::Expr(a), Term::Expr(b)) if a == b);
    let kernel: IntervalKernel = if same {
        Rc::new(|inputs: &[Interval]| -> Result<Interval, Error> {
            Ok(interval::square(&inputs[0]))
        })
    } else {
        binary_kernel(interval::mul)
    };

    let spec = Binary {
        op: "mul",
        forward: |a, b| a * b,
        d_lhs: |_, b| b,
        d_rhs: |a, _| a,
        order: OrderRule::Product,
    };
    binary(spec, lhs, rhs, kernel)
}

pub(super) fn div<'g>(lhs: Term<'g>, rhs: Term<'g>) -> Result<Expr<'g>, Error> {
    let spec = Binary {
        op: "div",
        forward: |a, b| a / b,
        d_lhs: |_, b| 1.0 / b,
        d_rhs: |a, b| -a / (b * b),
        order: OrderRule::Quotient,
    };
    binary(spec, lhs, rhs, binary_kernel(interval::div))
}

fn attach_positive<'g>(node: Expr<'g>, base: Expr<'g>) -> Expr<'g> {
    with_domain(node, base.gt(0.0))
}

impl<'g> Expr<'g> {
    /// Sum with an expression or a constant.
    pub fn try_add(self, rhs: impl Into<Term<'g>>) -> Result<Expr<'g>, Error> {
        add(self.into(), rhs.into())
    }

    /// Difference with an expression or a constant.
    pub fn try_sub(self, rhs: impl Into<Term<'g>>) -> Result<Expr<'g>, Error> {
        sub(self.into(), rhs.into())
    }

    /// Elementwise product with an expression or a constant.
    pub fn try_mul(self, rhs: impl Into<Term<'g>>) -> Result<Expr<'g>, Error> {
        mul(self.into(), rhs.into())
    }

    /// Elementwise quotient with an expression or a constant.
    pub fn try_div(self, rhs: impl Into<Term<'g>>) -> Result<Expr<'g>, Error> {
        div(self.into(), rhs.into())
    }

    /// Integer power. Defined everywhere, no constraint is attached.
    pub fn powi(self, n: i32) -> Expr<'g> {
        let rule: LocalRule = Rc::new(move |inputs: &[Value]| -> Result<Block, Error> {
            let partial = match n.checked_sub(1) {
                Some(_) if n == 0 => inputs[0].map(|_| 0.0),
                Some(m) => inputs[0].map(|x| f64::from(n) * x.powi(m)),
                // `i32::MIN - 1`
                None => inputs[0].map(|x| f64::from(n) * x.powf(f64::from(n) - 1.0)),
            };
            Ok(elementwise_block(partial, inputs[0].len()))
        });

        let builder = FunctionBuilder::new(move |inputs: &[Value]| Ok(inputs[0].map(|x| x.powi(n))))
            .input(self)
            .derivative(DerivativeRule::PerInput(vec![Some(rule)]))
            .interval(IntervalRule::Kernel(Rc::new(
                move |inputs: &[Interval]| -> Result<Interval, Error> {
                    Ok(interval::powi(&inputs[0], n))
                },
            )))
            .order(OrderRule::Power(f64::from(n)));

        build(self.graph, self.unary(builder))
    }

    /// Real power. For a non-integer exponent, the constraint `self > 0` is
    /// attached.
    pub fn powf(self, p: f64) -> Expr<'g> {
        let rule: LocalRule = Rc::new(move |inputs: &[Value]| -> Result<Block, Error> {
            let partial = inputs[0].map(|x| if p == 0.0 { 0.0 } else { p * x.powf(p - 1.0) });
            Ok(elementwise_block(partial, inputs[0].len()))
        });

        let builder = FunctionBuilder::new(move |inputs: &[Value]| Ok(inputs[0].map(|x| x.powf(p))))
            .input(self)
            .derivative(DerivativeRule::PerInput(vec![Some(rule)]))
            .interval(IntervalRule::Kernel(Rc::new(
                move |inputs: &[Interval]| -> Result<Interval, Error> {
                    Ok(interval::powf(&inputs[0], p))
                },
            )))
            .order(OrderRule::Power(p));

        let node = build(self.graph, self.unary(builder));
        if p.fract() == 0.0 {
            node
        } else {
            attach_positive(node, self)
        }
    }

    /// Power with an expression (or constant vector) exponent. The constraint
    /// `self > 0` is attached unless the exponent is a constant integer.
    pub fn pow(self, exponent: impl Into<Term<'g>>) -> Result<Expr<'g>, Error> {
        let exponent = exponent.into();
        let (integer, kernel) = match &exponent {
            Term::Const(value) if value.len() == 1 => return Ok(self.powf(value[0])),
            Term::Const(value) => {
                let exponents = value.clone();
                let kernel: IntervalKernel =
                    Rc::new(move |inputs: &[Interval]| -> Result<Interval, Error> {
                        interval::powf_each(&inputs[0], &exponents)
                    });
                (value.iter().all(|p| p.fract() == 0.0), kernel)
            }
            Term::Expr(_) => (false, binary_kernel(interval::pow)),
        };

        let spec = Binary {
            op: "pow",
            forward: f64::powf,
            d_lhs: |x, y| if y == 0.0 { 0.0 } else { y * x.powf(y - 1.0) },
            d_rhs: |x, y| x.ln() * x.powf(y),
            order: OrderRule::Generic,
        };
        let node = binary(spec, self.into(), exponent, kernel)?;

        if integer {
            Ok(node)
        } else {
            Ok(attach_positive(node, self))
        }
    }

    /// Exponential `base^self` with a constant base.
    pub fn rpow(self, base: f64) -> Expr<'g> {
        let ln_base = base.ln();
        let rule: LocalRule = Rc::new(move |inputs: &[Value]| -> Result<Block, Error> {
            let partial = inputs[0].map(|x| ln_base * base.powf(x));
            Ok(elementwise_block(partial, inputs[0].len()))
        });

        let builder =
            FunctionBuilder::new(move |inputs: &[Value]| Ok(inputs[0].map(|x| base.powf(x))))
                .input(self)
                .derivative(DerivativeRule::PerInput(vec![Some(rule)]))
                .interval(IntervalRule::Kernel(Rc::new(
                    move |inputs: &[Interval]| -> Result<Interval, Error> {
                        Ok(interval::monotone(&inputs[0], |x| base.powf(x), base >= 1.0))
                    },
                )))
                .order(OrderRule::Generic);

        build(self.graph, self.unary(builder))
    }

    /// Sets the flags of an elementwise unary function of this expression.
    pub(crate) fn unary(&self, builder: FunctionBuilder) -> FunctionBuilder {
        let builder = builder.discrete(self.is_discrete()).vectorized(true);
        match self.size() {
            Some(size) => builder.size(size),
            None => builder,
        }
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:ident) => {
        impl<'g, T: Into<Term<'g>>> $trait<T> for Expr<'g> {
            type Output = Expr<'g>;

            fn $method(self, rhs: T) -> Expr<'g> {
                $op(self.into(), rhs.into()).unwrap_or_else(|error| panic!("{}", error))
            }
        }

        impl<'g> $trait<Expr<'g>> for f64 {
            type Output = Expr<'g>;

            fn $method(self, rhs: Expr<'g>) -> Expr<'g> {
                $op(Term::Const(scalar(self)), rhs.into())
                    .unwrap_or_else(|error| panic!("{}", error))
            }
        }

        impl<'g> $trait<Expr<'g>> for Value {
            type Output = Expr<'g>;

            fn $method(self, rhs: Expr<'g>) -> Expr<'g> {
                $op(Term::Const(self), rhs.into()).unwrap_or_else(|error| panic!("{}", error))
            }
        }
    };
}

impl_binary_op!(Add, add, add);
impl_binary_op!(Sub, sub, sub);
impl_binary_op!(Mul, mul, mul);
impl_binary_op!(Div, div, div);

impl<'g> Neg for Expr<'g> {
    type Output = Expr<'g>;

    fn neg(self) -> Expr<'g> {
        let rule: LocalRule = Rc::new(|inputs: &[Value]| -> Result<Block, Error> {
            Ok(elementwise_block(inputs[0].map(|_| -1.0), inputs[0].len()))
        });

        let builder = FunctionBuilder::new(|inputs: &[Value]| Ok(-&inputs[0]))
            .input(self)
            .derivative(DerivativeRule::PerInput(vec![Some(rule)]))
            .interval(IntervalRule::Kernel(Rc::new(
                |inputs: &[Interval]| -> Result<Interval, Error> { Ok(interval::neg(&inputs[0])) },
            )))
            .order(OrderRule::Max);

        build(self.graph, self.unary(builder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Domain, Graph, Point};

    use crate::testing::{check_derivatives, check_soundness, random_point, random_sub_domain};

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn operators_with_constants() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 2);
        let p = Point::builder().set(&x, [1.0, 2.0]).build();

        assert_eq!((x + 1.0).eval(&p).unwrap(), dvector![2.0, 3.0]);
        assert_eq!((1.0 - x).eval(&p).unwrap(), dvector![0.0, -1.0]);
        assert_eq!((x * dvector![3.0, 4.0]).eval(&p).unwrap(), dvector![3.0, 8.0]);
        assert_eq!((dvector![4.0, 4.0] / x).eval(&p).unwrap(), dvector![4.0, 2.0]);
        assert_eq!((-x).eval(&p).unwrap(), dvector![-1.0, -2.0]);
        assert_eq!((x / 2.0).size(), Some(2));
    }

    #[test]
    fn size_mismatch() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 2);
        let y = graph.var_sized("y", 3);

        assert_eq!(
            x.try_add(y),
            Err(Error::ShapeMismatch {
                op: "add",
                left: 2,
                right: 3
            })
        );
        assert!(x.try_mul([1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    #[should_panic(expected = "incompatible operand sizes")]
    fn operator_panics_on_mismatch() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 2);
        let y = graph.var_sized("y", 3);
        let _ = x * y;
    }

    #[test]
    fn dynamic_size_is_checked_at_evaluation() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 2);
        let f = graph
            .function(FunctionBuilder::new(|_: &[Value]| Ok(dvector![1.0, 2.0, 3.0])).input(x))
            .unwrap();
        let g = f + x;
        assert_eq!(g.size(), None);

        let p = Point::builder().set(&x, [0.0, 0.0]).build();
        assert!(matches!(
            g.eval(&p),
            Err(Error::ShapeMismatch { op: "add", .. })
        ));
    }

    #[test]
    fn quotient_derivatives() {
        let graph = Graph::new();
        let x = graph.var("x");
        let y = graph.var("y");
        let f = x / y;

        let p = Point::builder().set(&x, 3.0).set(&y, 2.0).build();
        let d = f.diff(&p).unwrap();
        assert_eq!(d.get(&x).unwrap().scalar_value(), Some(0.5));
        assert_eq!(d.get(&y).unwrap().scalar_value(), Some(-0.75));
    }

    #[test]
    fn integer_power_has_no_constraint() {
        let graph = Graph::new();
        let a = graph.var("a");
        let f = a.powi(2);

        assert!(f.attached().is_empty());
        assert!(a.powf(2.0).attached().is_empty());

        let p = Point::builder().set(&a, -3.0).build();
        assert_eq!(f.eval(&p).unwrap(), dvector![9.0]);
        assert_eq!(f.diff_wrt(&p, &a).unwrap().scalar_value(), Some(-6.0));
    }

    #[test]
    fn real_power_attaches_constraint() {
        let graph = Graph::new();
        let a = graph.var("a");
        let b = graph.var("b");

        let f = a.powf(0.5);
        let constraints = f.attached();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].expr(), a);
        assert_eq!(constraints[0].lower(), &dvector![0.0]);
        assert_eq!(constraints[0].tol(), -1e-7);

        let g = a.pow(b).unwrap();
        assert_eq!(g.attached().len(), 1);
        assert!(a.pow([2.0, 3.0]).unwrap().attached().is_empty());

        let p = Point::builder().set(&a, 4.0).set(&b, 0.5).build();
        assert_abs_diff_eq!(f.eval(&p).unwrap()[0], 2.0);
        let d = g.diff(&p).unwrap();
        assert_abs_diff_eq!(d.get(&a).unwrap().scalar_value().unwrap(), 0.25);
        assert_abs_diff_eq!(
            d.get(&b).unwrap().scalar_value().unwrap(),
            4f64.ln() * 2.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn reverse_power() {
        let graph = Graph::new();
        let x = graph.var("x");
        let f = x.rpow(2.0);

        let p = Point::builder().set(&x, 3.0).build();
        assert_eq!(f.eval(&p).unwrap(), dvector![8.0]);
        assert_abs_diff_eq!(
            f.diff_wrt(&p, &x).unwrap().scalar_value().unwrap(),
            8.0 * 2f64.ln(),
            epsilon = 1e-12
        );

        let dom = Domain::builder().bound(&x, -1.0, 2.0).build();
        assert_eq!(f.interval(&dom).unwrap(), Interval::scalar(0.5, 4.0));
    }

    #[test]
    fn constant_operands_are_discrete() {
        let graph = Graph::new();
        let c = graph.constant(2.0);
        let x = graph.var("x");

        assert!((c * 3.0).is_discrete());
        assert!(!(c * x).is_discrete());
        assert!(x.floor().try_add(c).unwrap().is_discrete());
    }

    #[test]
    fn broadcast_derivative_shapes() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 2);
        let s = graph.var("s");
        let f = x / s;

        let p = Point::builder().set(&x, [2.0, 4.0]).set(&s, 2.0).build();
        let d = f.diff(&p).unwrap();
        assert_eq!(d.get(&x).unwrap().to_dense(), dmatrix![0.5, 0.0; 0.0, 0.5]);
        assert_eq!(d.get(&s).unwrap().to_dense(), dmatrix![-0.5; -1.0]);
    }

    #[test]
    fn integer_vector_exponent_keeps_negative_bases() {
        let graph = Graph::new();
        let a = graph.var_sized("a", 2);
        let f = a.pow([3.0, 2.0]).unwrap();
        assert!(f.attached().is_empty());

        let dom = Domain::builder().bound(&a, [-2.0, -2.0], [-1.0, -1.0]).build();
        let bounds = f.interval(&dom).unwrap();
        assert_eq!(bounds, Interval::new(dvector![-8.0, 1.0], dvector![-1.0, 4.0]));

        let p = Point::builder().set(&a, [-1.5, -1.5]).build();
        let value = f.eval(&p).unwrap();
        assert_abs_diff_eq!(value, dvector![-3.375, 2.25], epsilon = 1e-12);
        assert!(bounds.contains(&value, 1e-12));
    }

    #[test]
    fn zero_exponent_has_zero_derivative() {
        let graph = Graph::new();
        let x = graph.var("x");
        let y = graph.var_sized("y", 2);
        let p = Point::builder().set(&x, 0.0).set(&y, [0.0, 2.0]).build();

        assert_eq!(x.powi(0).diff_wrt(&p, &x).unwrap().scalar_value(), Some(0.0));
        assert_eq!(x.powf(0.0).diff_wrt(&p, &x).unwrap().scalar_value(), Some(0.0));

        let d = y.pow([0.0, 1.0]).unwrap().diff_wrt(&p, &y).unwrap().to_dense();
        assert_eq!(d, dmatrix![0.0, 0.0; 0.0, 1.0]);
    }

    #[test]
    fn extreme_integer_exponent() {
        let graph = Graph::new();
        let x = graph.var("x");
        let dom = Domain::builder().bound(&x, 2.0, 3.0).build();

        let bounds = x.powi(i32::MIN).interval(&dom).unwrap();
        assert_eq!(bounds, Interval::scalar(0.0, 0.0));
    }

    fn operators<'g>(x: Expr<'g>, y: Expr<'g>, s: Expr<'g>) -> Vec<Expr<'g>> {
        vec![
            x + y,
            x - s,
            s - y,
            x * y,
            x * x,
            s * x,
            x / y,
            s / x,
            -x,
            x.powi(3),
            x.powi(2),
            x.powi(-2),
            x.powi(-3),
            x.powi(0),
            x.powf(1.5),
            x.powf(-0.5),
            x.pow(y).unwrap(),
            x.pow(s).unwrap(),
            x.pow([2.0, -1.0, 3.0]).unwrap(),
            x.pow([0.5, 2.0, 3.0]).unwrap(),
            x.rpow(2.0),
            x.rpow(0.5),
        ]
    }

    #[test]
    fn derivatives_at_random_points() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 3);
        let y = graph.var_sized("y", 3);
        let s = graph.var("s");

        let mut rng = StdRng::seed_from_u64(5);
        for f in operators(x, y, s) {
            for _ in 0..20 {
                let p = random_point(&[x, y, s], 0.5, 2.0, &mut rng);
                check_derivatives(&f, &p).unwrap();
            }
        }
    }

    #[test]
    fn bounds_of_random_sub_boxes() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 3);
        let y = graph.var_sized("y", 3);
        let s = graph.var("s");

        let mut rng = StdRng::seed_from_u64(9);
        for f in operators(x, y, s) {
            for _ in 0..300 {
                let dom = random_sub_domain(&[x, y, s], -3.0, 3.0, &mut rng);
                check_soundness(&f, &dom, 10, &mut rng).unwrap();
            }
        }
    }
}
