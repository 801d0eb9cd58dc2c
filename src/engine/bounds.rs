use log::{debug, trace};

use crate::{
    analysis::dependencies,
    core::{
        scalar, Domain, Error, Expr, FunctionSpec, Graph, IntervalRule, NodeId, NodeKind, Operand,
        SumState,
    },
    interval::{self, Interval},
};

impl<'g> Expr<'g> {
    /// Computes bounds of the expression over all points of the domain.
    ///
    /// The result is an outer approximation. Its `definite` flag is cleared if
    /// some function in the expression is not defined everywhere in the box.
    pub fn interval(&self, domain: &Domain) -> Result<Interval, Error> {
        bounds(self.graph, self.id, domain)
    }
}

fn operand_bounds(graph: &Graph, operand: &Operand, domain: &Domain) -> Result<Interval, Error> {
    match operand {
        Operand::Node(id) => bounds(graph, *id, domain),
        Operand::Const(value) => Ok(Interval::point(value.clone())),
    }
}

pub(crate) fn bounds(graph: &Graph, id: NodeId, domain: &Domain) -> Result<Interval, Error> {
    if let Some(cached) = domain.memo().borrow().get(&id) {
        return Ok(cached.clone());
    }

    let node = graph.node(id);
    let result = match &node.kind {
        NodeKind::Variable => {
            let name = graph.name_of(id);
            domain
                .lookup(id, &name)
                .ok_or(Error::MissingValue { name })?
        }
        NodeKind::Constant(value) => Interval::point(value.clone()),
        NodeKind::Function(spec) => match &spec.interval {
            IntervalRule::Sum => sum_bounds(graph, id, spec, domain)?,
            rule => {
                let inputs = spec
                    .inputs
                    .iter()
                    .map(|input| operand_bounds(graph, input, domain))
                    .collect::<Result<Vec<_>, _>>()?;

                let result = match rule {
                    IntervalRule::CriticalPoints(critical) => {
                        if inputs.len() != 1 {
                            return Err(Error::unsupported(format!(
                                "critical points of `{}` with {} inputs",
                                graph.name_of(id),
                                inputs.len()
                            )));
                        }

                        let forward = &spec.forward;
                        let f = |x: f64| match forward(&[scalar(x)]) {
                            Ok(value) if value.len() == 1 => value[0],
                            _ => f64::NAN,
                        };
                        interval::with_critical_points(&inputs[0], f, |lo, hi| critical(lo, hi))
                    }
                    IntervalRule::Kernel(kernel) => kernel(&inputs)?,
                    IntervalRule::Unsupported | IntervalRule::Sum => {
                        return Err(Error::unsupported(format!(
                            "interval of `{}`",
                            graph.name_of(id)
                        )))
                    }
                };

                let definite = result.definite && inputs.iter().all(|input| input.definite);
                result.with_definite(definite)
            }
        },
    };

    trace!("{}: interval computed for domain {}", graph.name_of(id), domain.id());

    domain.memo().borrow_mut().insert(id, result.clone());
    Ok(result)
}

fn total(terms: &[Interval]) -> Result<Interval, Error> {
    match terms.split_first() {
        Some((first, rest)) => rest
            .iter()
            .try_fold(first.clone(), |acc, term| interval::add(&acc, term)),
        None => Ok(Interval::scalar(0.0, 0.0)),
    }
}

fn sum_bounds(
    graph: &Graph,
    id: NodeId,
    spec: &FunctionSpec,
    domain: &Domain,
) -> Result<Interval, Error> {
    let parent = domain.modified().and_then(|var| {
        domain
            .parent_sums()
            .and_then(|sums| sums.borrow().get(&id).cloned())
            .map(|state| (var, state))
    });

    let state = match parent {
        Some((var, parent)) if parent.total.is_finite() && parent.total.definite => {
            let mut terms = parent.terms;
            let mut total_bounds = parent.total;
            let n = total_bounds.len();
            let mut updated = 0;

            for (k, input) in spec.inputs.iter().enumerate() {
                let depends = match input {
                    Operand::Node(input) => dependencies(graph, *input).vars.contains(&var),
                    Operand::Const(_) => false,
                };
                if !depends {
                    continue;
                }

                let term = operand_bounds(graph, input, domain)?;
                let old = terms[k].broadcast("sum", n)?;
                let new = term.broadcast("sum", n)?;
                total_bounds.lower += new.lower - old.lower;
                total_bounds.upper += new.upper - old.upper;
                terms[k] = term;
                updated += 1;
            }

            total_bounds.definite = terms.iter().all(|term| term.definite);
            if !total_bounds.is_finite() {
                total_bounds = total(&terms)?;
            }

            debug!(
                "{}: incremental sum updated {} of {} terms",
                graph.name_of(id),
                updated,
                terms.len()
            );

            SumState {
                terms,
                total: total_bounds,
            }
        }
        _ => {
            let terms = spec
                .inputs
                .iter()
                .map(|input| operand_bounds(graph, input, domain))
                .collect::<Result<Vec<_>, _>>()?;
            let total = total(&terms)?;
            SumState { terms, total }
        }
    };

    let result = state.total.clone();
    domain.sums().borrow_mut().insert(id, state);
    Ok(result)
}
