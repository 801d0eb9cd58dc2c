use std::rc::Rc;

use crate::{
    core::{
        broadcast_size, broadcast_to, scalar, zip_map, Block, Constraint, DerivativeRule, Error,
        Expr, FunctionBuilder, IntervalRule, LocalRule, Operand, OrderRule, SparseMatrix, Value,
    },
    interval::{self, Interval},
};

use super::{all_discrete, build, elementwise_block, graph_of, static_size, Term};

/// Row of partial derivatives of a reduction, or a scalar for an argument
/// of size one.
fn reduction_block(partial: Value) -> Block {
    if partial.len() == 1 {
        Block::Scalar(partial[0])
    } else {
        Block::row(&partial)
    }
}

/// Selection of components `start..end` of a vector of size `n`.
fn selection_block(start: usize, end: usize, n: usize) -> Block {
    if (start, end, n) == (0, 1, 1) {
        Block::Scalar(1.0)
    } else {
        Block::Sparse(SparseMatrix::from_triplets(
            end - start,
            n,
            (start..end).map(|j| (j - start, j, 1.0)),
        ))
    }
}

fn skew(v: &Value) -> Block {
    Block::Dense(nalgebra::dmatrix![
        0.0, -v[2], v[1];
        v[2], 0.0, -v[0];
        -v[1], v[0], 0.0
    ])
}

fn check_cross(size: Option<usize>) -> Result<(), Error> {
    match size {
        Some(size) if size != 3 => Err(Error::ShapeMismatch {
            op: "cross",
            left: size,
            right: 3,
        }),
        _ => Ok(()),
    }
}

fn out_of_range(op: &str, end: usize, size: usize) -> Error {
    Error::InvalidArgument(format!(
        "{}: range end {} exceeds size {}",
        op, end, size
    ))
}

impl<'g> Expr<'g> {
    /// Builds a reduction of this expression to a single component.
    fn reduction(
        self,
        forward: fn(&Value) -> f64,
        partial: fn(&Value) -> Value,
        kernel: fn(&Interval) -> Result<Interval, Error>,
        order: OrderRule,
    ) -> Expr<'g> {
        let rule: LocalRule = Rc::new(move |inputs: &[Value]| -> Result<Block, Error> {
            Ok(reduction_block(partial(&inputs[0])))
        });

        let builder = FunctionBuilder::new(move |inputs: &[Value]| Ok(scalar(forward(&inputs[0]))))
            .input(self)
            .derivative(DerivativeRule::PerInput(vec![Some(rule)]))
            .interval(IntervalRule::Kernel(Rc::new(
                move |inputs: &[Interval]| -> Result<Interval, Error> { kernel(&inputs[0]) },
            )))
            .order(order)
            .discrete(self.is_discrete())
            .size(1);

        build(self.graph, builder)
    }

    /// Sum of all components.
    pub fn sum(self) -> Expr<'g> {
        self.reduction(
            |x| x.sum(),
            |x| Value::from_element(x.len(), 1.0),
            |a| Ok(interval::sum(a)),
            OrderRule::Max,
        )
    }

    /// Product of all components.
    pub fn prod(self) -> Expr<'g> {
        let order = match self.size() {
            Some(n) => OrderRule::Power(n as f64),
            None => OrderRule::Generic,
        };

        self.reduction(
            |x| x.product(),
            |x| {
                // Prefix and suffix products avoid dividing by zero components.
                let n = x.len();
                let mut partial = Value::from_element(n, 1.0);
                let mut prefix = 1.0;
                for i in 0..n {
                    partial[i] = prefix;
                    prefix *= x[i];
                }
                let mut suffix = 1.0;
                for i in (0..n).rev() {
                    partial[i] *= suffix;
                    suffix *= x[i];
                }
                partial
            },
            interval::prod,
            order,
        )
    }

    /// Smallest component.
    pub fn min(self) -> Expr<'g> {
        self.reduction(
            |x| x.min(),
            |x| {
                let mut mask = Value::zeros(x.len());
                mask[x.imin()] = 1.0;
                mask
            },
            |a| Ok(interval::min_element(a)),
            OrderRule::Generic,
        )
    }

    /// Largest component.
    pub fn max(self) -> Expr<'g> {
        self.reduction(
            |x| x.max(),
            |x| {
                let mut mask = Value::zeros(x.len());
                mask[x.imax()] = 1.0;
                mask
            },
            |a| Ok(interval::max_element(a)),
            OrderRule::Generic,
        )
    }

    /// Euclidean norm. The derivative at zero is zero.
    pub fn norm(self) -> Expr<'g> {
        self.reduction(
            |x| x.norm(),
            |x| {
                let norm = x.norm();
                if norm > 0.0 {
                    x / norm
                } else {
                    Value::zeros(x.len())
                }
            },
            |a| Ok(interval::norm(a)),
            OrderRule::Generic,
        )
    }

    /// Dot product. A scalar operand is broadcast.
    pub fn dot(self, rhs: impl Into<Term<'g>>) -> Result<Expr<'g>, Error> {
        let rhs = rhs.into();
        static_size("dot", [self.size(), rhs.size()])?;
        let inputs = vec![Operand::Node(self.id()), rhs.into_operand()];
        let discrete = all_discrete(self.graph, &inputs);

        let rules = (0..2)
            .map(|k| {
                let rule: LocalRule = Rc::new(move |inputs: &[Value]| -> Result<Block, Error> {
                    let n = broadcast_size("dot", inputs[0].len(), inputs[1].len())?;
                    let other = broadcast_to("dot", &inputs[1 - k], n)?;
                    if inputs[k].len() == 1 {
                        Ok(Block::Scalar(other.sum()))
                    } else {
                        Ok(Block::row(&other))
                    }
                });
                Some(rule)
            })
            .collect();

        let builder = FunctionBuilder::new(|inputs: &[Value]| {
            let product = zip_map("dot", &inputs[0], &inputs[1], |a, b| a * b)?;
            Ok(scalar(product.sum()))
        })
        .inputs(inputs)
        .derivative(DerivativeRule::PerInput(rules))
        .interval(IntervalRule::Kernel(Rc::new(
            |inputs: &[Interval]| -> Result<Interval, Error> {
                interval::dot(&inputs[0], &inputs[1])
            },
        )))
        .order(OrderRule::Product)
        .discrete(discrete)
        .size(1);

        Ok(build(self.graph, builder))
    }

    /// Cross product of two vectors of size 3.
    pub fn cross(self, rhs: impl Into<Term<'g>>) -> Result<Expr<'g>, Error> {
        let rhs = rhs.into();
        check_cross(self.size())?;
        check_cross(rhs.size())?;
        let inputs = vec![Operand::Node(self.id()), rhs.into_operand()];
        let discrete = all_discrete(self.graph, &inputs);

        // d(a x b)/da = -[b]x, d(a x b)/db = [a]x
        let d_lhs: LocalRule = Rc::new(|inputs: &[Value]| -> Result<Block, Error> {
            Ok(skew(&inputs[1]).scale(-1.0))
        });
        let d_rhs: LocalRule =
            Rc::new(|inputs: &[Value]| -> Result<Block, Error> { Ok(skew(&inputs[0])) });

        let builder = FunctionBuilder::new(|inputs: &[Value]| {
            let (a, b) = (&inputs[0], &inputs[1]);
            check_cross(Some(a.len()))?;
            check_cross(Some(b.len()))?;
            Ok(a.cross(b))
        })
        .inputs(inputs)
        .derivative(DerivativeRule::PerInput(vec![Some(d_lhs), Some(d_rhs)]))
        .interval(IntervalRule::Kernel(Rc::new(
            |inputs: &[Interval]| -> Result<Interval, Error> {
                interval::cross(&inputs[0], &inputs[1])
            },
        )))
        .order(OrderRule::Product)
        .discrete(discrete)
        .size(3);

        Ok(build(self.graph, builder))
    }

    /// Angle between two vectors, `acos(x·y / (|x| |y|))`.
    pub fn angle(self, rhs: impl Into<Term<'g>>) -> Result<Expr<'g>, Error> {
        let rhs = match rhs.into() {
            Term::Expr(expr) => expr,
            Term::Const(value) => self.graph.constant(value),
        };
        let cosine = self.dot(rhs)?.try_div(self.norm() * rhs.norm())?;
        Ok(cosine.acos())
    }

    /// Component `i`.
    pub fn index(self, i: usize) -> Result<Expr<'g>, Error> {
        self.slice_named("index", i, i + 1)
    }

    /// Components `start..end`.
    pub fn slice(self, start: usize, end: usize) -> Result<Expr<'g>, Error> {
        if start >= end {
            return Err(Error::InvalidArgument(format!(
                "slice: empty range {}..{}",
                start, end
            )));
        }
        self.slice_named("slice", start, end)
    }

    fn slice_named(self, op: &'static str, start: usize, end: usize) -> Result<Expr<'g>, Error> {
        if let Some(size) = self.size() {
            if end > size {
                return Err(out_of_range(op, end, size));
            }
        }

        let rule: LocalRule = Rc::new(move |inputs: &[Value]| -> Result<Block, Error> {
            Ok(selection_block(start, end, inputs[0].len()))
        });

        let builder = FunctionBuilder::new(move |inputs: &[Value]| {
            let x = &inputs[0];
            if end > x.len() {
                return Err(out_of_range(op, end, x.len()));
            }
            Ok(x.rows(start, end - start).into_owned())
        })
        .input(self)
        .derivative(DerivativeRule::PerInput(vec![Some(rule)]))
        .interval(IntervalRule::Kernel(Rc::new(
            move |inputs: &[Interval]| -> Result<Interval, Error> {
                let a = &inputs[0];
                if end > a.len() {
                    return Err(out_of_range(op, end, a.len()));
                }
                Ok(a.rows(start, end))
            },
        )))
        .order(OrderRule::Max)
        .discrete(self.is_discrete())
        .size(end - start);

        Ok(build(self.graph, builder))
    }
}

/// Elementwise sum of expressions and constants, broadcasting scalars.
///
/// Unlike a chain of `+`, the bounds of the sum are updated incrementally
/// when a domain is refined in a single variable.
pub fn sum_of<'g, I, T>(terms: I) -> Result<Expr<'g>, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<Term<'g>>,
{
    let terms = terms.into_iter().map(Into::into).collect::<Vec<Term<'g>>>();
    let graph = graph_of("sum", &terms.iter().collect::<Vec<_>>())?;
    let size = static_size("sum", terms.iter().map(Term::size))?;
    let inputs = terms
        .into_iter()
        .map(Term::into_operand)
        .collect::<Vec<_>>();
    let discrete = all_discrete(graph, &inputs);

    let one: LocalRule = Rc::new(|_: &[Value]| -> Result<Block, Error> { Ok(Block::Scalar(1.0)) });
    let rules = inputs.iter().map(|_| Some(Rc::clone(&one))).collect();

    let mut builder = FunctionBuilder::new(|inputs: &[Value]| {
        inputs.iter().try_fold(scalar(0.0), |acc, input| {
            zip_map("sum", &acc, input, |a, b| a + b)
        })
    })
    .inputs(inputs)
    .derivative(DerivativeRule::PerInput(rules))
    .interval(IntervalRule::Sum)
    .order(OrderRule::Max)
    .discrete(discrete)
    .vectorized(true);
    if let Some(size) = size {
        builder = builder.size(size);
    }

    Ok(build(graph, builder))
}

/// Concatenates expressions and constants into one vector.
///
/// The derivative with respect to a variable of input `k` is placed on the
/// rows of that input's components.
pub fn stack<'g, I, T>(terms: I) -> Result<Expr<'g>, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<Term<'g>>,
{
    let terms = terms.into_iter().map(Into::into).collect::<Vec<Term<'g>>>();
    let graph = graph_of("stack", &terms.iter().collect::<Vec<_>>())?;
    let size = terms
        .iter()
        .map(Term::size)
        .sum::<Option<usize>>();
    let inputs = terms
        .into_iter()
        .map(Term::into_operand)
        .collect::<Vec<_>>();
    let discrete = all_discrete(graph, &inputs);

    let rules = (0..inputs.len())
        .map(|k| -> Option<LocalRule> {
            Some(Rc::new(move |inputs: &[Value]| -> Result<Block, Error> {
                let offset = inputs[..k].iter().map(Value::len).sum::<usize>();
                let total = inputs.iter().map(Value::len).sum::<usize>();
                Ok(selection_block(offset, offset + inputs[k].len(), total).transpose())
            }))
        })
        .collect();

    let mut builder = FunctionBuilder::new(|inputs: &[Value]| {
        let n = inputs.iter().map(Value::len).sum();
        Ok(Value::from_iterator(
            n,
            inputs.iter().flat_map(|input| input.iter().copied()),
        ))
    })
    .inputs(inputs)
    .derivative(DerivativeRule::PerInput(rules))
    .interval(IntervalRule::Kernel(Rc::new(
        |inputs: &[Interval]| -> Result<Interval, Error> { Ok(Interval::stack(inputs)) },
    )))
    .order(OrderRule::Max)
    .discrete(discrete);
    if let Some(size) = size {
        builder = builder.size(size);
    }

    Ok(build(graph, builder))
}

/// For every output component, the value and the index of the first input
/// preferred by `better`.
fn select(
    op: &'static str,
    inputs: &[Value],
    better: fn(f64, f64) -> bool,
) -> Result<(Value, Vec<usize>), Error> {
    let n = inputs
        .iter()
        .try_fold(1, |n, input| broadcast_size(op, n, input.len()))?;

    let mut value = Value::zeros(n);
    let mut winners = vec![0; n];
    for i in 0..n {
        let component = |k: usize| {
            let input = &inputs[k];
            input[if input.len() == 1 { 0 } else { i }]
        };

        let mut best = component(0);
        for k in 1..inputs.len() {
            let candidate = component(k);
            if better(candidate, best) {
                best = candidate;
                winners[i] = k;
            }
        }
        value[i] = best;
    }

    Ok((value, winners))
}

fn extreme_of<'g, I, T>(
    op: &'static str,
    terms: I,
    better: fn(f64, f64) -> bool,
    kernel: fn(&Interval, &Interval) -> Result<Interval, Error>,
) -> Result<Expr<'g>, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<Term<'g>>,
{
    let terms = terms.into_iter().map(Into::into).collect::<Vec<Term<'g>>>();
    let graph = graph_of(op, &terms.iter().collect::<Vec<_>>())?;
    let size = static_size(op, terms.iter().map(Term::size))?;
    let inputs = terms
        .into_iter()
        .map(Term::into_operand)
        .collect::<Vec<_>>();
    let discrete = all_discrete(graph, &inputs);

    let rules = (0..inputs.len())
        .map(|k| {
            let rule: LocalRule = Rc::new(move |inputs: &[Value]| -> Result<Block, Error> {
                let (_, winners) = select(op, inputs, better)?;
                let mask = Value::from_iterator(
                    winners.len(),
                    winners.iter().map(|w| if *w == k { 1.0 } else { 0.0 }),
                );
                Ok(elementwise_block(mask, inputs[k].len()))
            });
            Some(rule)
        })
        .collect();

    let mut builder =
        FunctionBuilder::new(move |inputs: &[Value]| Ok(select(op, inputs, better)?.0))
            .inputs(inputs)
            .derivative(DerivativeRule::PerInput(rules))
            .interval(IntervalRule::Kernel(Rc::new(
                move |inputs: &[Interval]| -> Result<Interval, Error> {
                    match inputs.split_first() {
                        Some((first, rest)) => rest
                            .iter()
                            .try_fold(first.clone(), |acc, input| kernel(&acc, input)),
                        None => Err(Error::InvalidArgument(format!("{}: no operands", op))),
                    }
                },
            )))
            .order(OrderRule::Generic)
            .discrete(discrete)
            .vectorized(true);
    if let Some(size) = size {
        builder = builder.size(size);
    }

    Ok(build(graph, builder))
}

/// Elementwise minimum over expressions and constants. The derivative is the
/// derivative of the first smallest operand.
pub fn min_of<'g, I, T>(terms: I) -> Result<Expr<'g>, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<Term<'g>>,
{
    extreme_of("min", terms, |candidate, best| candidate < best, interval::minimum)
}

/// Elementwise maximum over expressions and constants. The derivative is the
/// derivative of the first largest operand.
pub fn max_of<'g, I, T>(terms: I) -> Result<Expr<'g>, Error>
where
    I: IntoIterator<Item = T>,
    T: Into<Term<'g>>,
{
    extreme_of("max", terms, |candidate, best| candidate > best, interval::maximum)
}

/// Chooses `then` for components satisfying the condition and `otherwise` for
/// the rest.
pub fn if_then_else<'g>(
    condition: &Constraint<'g>,
    then: impl Into<Term<'g>>,
    otherwise: impl Into<Term<'g>>,
) -> Result<Expr<'g>, Error> {
    let mask = condition.indicator();
    let (then, otherwise) = (then.into(), otherwise.into());
    let size = static_size("if_then_else", [mask.size(), then.size(), otherwise.size()])?;
    let graph = mask.graph();
    let inputs = vec![
        Operand::Node(mask.id()),
        then.into_operand(),
        otherwise.into_operand(),
    ];
    let discrete = all_discrete(graph, &inputs);

    let branch = |k: usize| -> Option<LocalRule> {
        Some(Rc::new(move |inputs: &[Value]| -> Result<Block, Error> {
            let n = broadcast_size("if_then_else", inputs[0].len(), inputs[k].len())?;
            let chosen = broadcast_to("if_then_else", &inputs[0], n)?.map(|c| {
                let selected = c > 0.5;
                if selected == (k == 1) {
                    1.0
                } else {
                    0.0
                }
            });
            Ok(elementwise_block(chosen, inputs[k].len()))
        }))
    };
    let indicator: LocalRule = Rc::new(|inputs: &[Value]| -> Result<Block, Error> {
        Ok(Block::zeros(inputs[0].len(), inputs[0].len()))
    });

    let mut builder = FunctionBuilder::new(|inputs: &[Value]| {
        let n = inputs
            .iter()
            .try_fold(1, |n, input| broadcast_size("if_then_else", n, input.len()))?;
        let at = |v: &Value, i: usize| v[if v.len() == 1 { 0 } else { i }];
        Ok(Value::from_fn(n, |i, _| {
            if at(&inputs[0], i) > 0.5 {
                at(&inputs[1], i)
            } else {
                at(&inputs[2], i)
            }
        }))
    })
    .inputs(inputs)
    .derivative(DerivativeRule::PerInput(vec![
        Some(indicator),
        branch(1),
        branch(2),
    ]))
    .interval(IntervalRule::Kernel(Rc::new(
        |inputs: &[Interval]| -> Result<Interval, Error> {
            let n = inputs
                .iter()
                .try_fold(1, |n, input| broadcast_size("if_then_else", n, input.len()))?;
            let mask = inputs[0].broadcast("if_then_else", n)?;
            let then = inputs[1].broadcast("if_then_else", n)?;
            let otherwise = inputs[2].broadcast("if_then_else", n)?;

            let parts = (0..n)
                .map(|i| match (mask.upper[i] > 0.5, mask.lower[i] <= 0.5) {
                    (true, true) => then.component(i).hull(&otherwise.component(i)),
                    (true, false) => Ok(then.component(i)),
                    _ => Ok(otherwise.component(i)),
                })
                .collect::<Result<Vec<_>, Error>>()?;
            Ok(Interval::stack(&parts))
        },
    )))
    .order(OrderRule::Max)
    .discrete(discrete)
    .vectorized(true);
    if let Some(size) = size {
        builder = builder.size(size);
    }

    Ok(build(graph, builder))
}
