use std::{collections::BTreeMap, collections::BTreeSet, rc::Rc};

use log::{trace, warn};
use nalgebra::DMatrix;

use crate::{
    analysis::dependencies,
    core::{
        broadcast_to, Block, DerivativeRule, Error, Expr, Graph, NodeId, NodeKind, Operand, Point,
        SparsePolicy, Sparsity, Value,
    },
    derivatives::numeric_block,
};

use super::{
    cache::Entry,
    evaluate::{evaluate, snapshot, VarSchedule},
};

/// Filter and storage settings a derivative was computed with. Cached
/// derivatives are reused only for equal keys.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DiffKey {
    wrt: Option<BTreeSet<NodeId>>,
    fixed: Option<BTreeSet<NodeId>>,
    sparsity: Sparsity,
}

impl DiffKey {
    fn includes(&self, var: NodeId) -> bool {
        match (&self.wrt, &self.fixed) {
            (Some(wrt), _) => wrt.contains(&var),
            (None, Some(fixed)) => !fixed.contains(&var),
            (None, None) => true,
        }
    }
}

type Blocks = BTreeMap<NodeId, Block>;

pub(crate) type DiffValue = (DiffKey, Rc<Blocks>);

/// Options of differentiation.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    wrt: Option<BTreeSet<NodeId>>,
    fixed: Option<BTreeSet<NodeId>>,
    sparsity: Sparsity,
    exact_shape: bool,
    schedule: Option<u64>,
}

impl DiffOptions {
    /// Default options: all variables, dense results, 1x1 results as scalars.
    pub fn new() -> Self {
        Self::default()
    }

    /// Differentiates only with respect to given variables.
    pub fn with_wrt<'g, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = Expr<'g>>,
    {
        self.wrt = Some(vars.into_iter().map(|v| v.id()).collect());
        self
    }

    /// Treats given variables as constants.
    pub fn with_fixed<'g, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = Expr<'g>>,
    {
        self.fixed = Some(vars.into_iter().map(|v| v.id()).collect());
        self
    }

    /// Sets the storage of returned blocks.
    pub fn with_sparsity(mut self, sparsity: Sparsity) -> Self {
        self.sparsity = sparsity;
        self
    }

    /// If `true`, 1x1 derivatives are returned as dense matrices instead of
    /// scalars.
    pub fn with_exact_shape(mut self, exact_shape: bool) -> Self {
        self.exact_shape = exact_shape;
        self
    }

    /// Sets the identifier of the variable schedule. Nodes depending only on
    /// fixed variables are then evaluated once per schedule.
    pub fn with_schedule(mut self, id: u64) -> Self {
        self.schedule = Some(id);
        self
    }
}

/// Policy for variables missing in the deviations of
/// [`Expr::uncertainty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsentDeviations {
    /// Fail with [`Error::MissingValue`].
    Error,
    /// Ignore the variable.
    Skip,
    /// Ignore the variable and log a warning.
    Warn,
}

impl Default for AbsentDeviations {
    fn default() -> Self {
        AbsentDeviations::Error
    }
}

/// Derivative of an expression: Jacobian blocks keyed by variable.
///
/// Each block has as many rows as the expression output and as many columns
/// as the variable. Variables the expression does not depend on (or that
/// were excluded) are absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Derivative {
    blocks: Blocks,
}

impl Derivative {
    /// Gets the block of a variable.
    pub fn get(&self, var: &Expr<'_>) -> Option<&Block> {
        self.blocks.get(&var.id())
    }

    /// Gets the block of a variable given by id.
    pub fn get_id(&self, id: NodeId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    /// Returns `true` if the derivative has a block for the variable.
    pub fn contains(&self, var: &Expr<'_>) -> bool {
        self.blocks.contains_key(&var.id())
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns `true` if the expression does not depend on any included
    /// variable.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Iterates over the blocks in the order of variable creation.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Block)> {
        self.blocks.iter().map(|(id, block)| (*id, block))
    }
}

struct Context {
    key: DiffKey,
    schedule: VarSchedule,
    policy: SparsePolicy,
}

impl Context {
    fn has_included(&self, graph: &Graph, id: NodeId) -> bool {
        let deps = dependencies(graph, id);
        !self.schedule.is_fixed(&deps.vars) && deps.vars.iter().any(|v| self.key.includes(*v))
    }
}

impl<'g> Expr<'g> {
    /// Differentiates the expression at a point with respect to all
    /// variables it depends on.
    pub fn diff(&self, point: &Point) -> Result<Derivative, Error> {
        self.diff_with(point, &DiffOptions::default())
    }

    /// Differentiates the expression at a point with given options.
    pub fn diff_with(&self, point: &Point, options: &DiffOptions) -> Result<Derivative, Error> {
        if point.is_multi() {
            return Err(Error::unsupported("differentiation at a multi-point"));
        }

        if options.wrt.is_some() && options.fixed.is_some() {
            return Err(Error::InvalidArgument(
                "`wrt` and `fixed` cannot be used together".to_string(),
            ));
        }

        let ctx = Context {
            key: DiffKey {
                wrt: options.wrt.clone(),
                fixed: options.fixed.clone(),
                sparsity: options.sparsity,
            },
            schedule: VarSchedule::from_parts(options.fixed.clone(), None, options.schedule),
            policy: self.graph.sparse_policy(options.sparsity),
        };

        let blocks = derive(self.graph, self.id, point, &ctx)?;
        let blocks = blocks
            .iter()
            .map(|(var, block)| {
                let block = block.clone().resolve(&ctx.policy);
                let block = match (options.exact_shape, block.shape()) {
                    (false, (1, 1)) => Block::Scalar(block.scalar_value().unwrap_or_default()),
                    (true, (1, 1)) => Block::Dense(block.to_dense()),
                    _ => block,
                };
                (*var, block)
            })
            .collect();

        Ok(Derivative { blocks })
    }

    /// Differentiates the expression with respect to a single variable. If
    /// the expression does not depend on it, a zero block is returned.
    pub fn diff_wrt(&self, point: &Point, var: &Expr<'g>) -> Result<Block, Error> {
        let derivative = self.diff_with(point, &DiffOptions::new().with_wrt([*var]))?;

        match derivative.blocks.into_iter().next() {
            Some((_, block)) => Ok(block),
            None => {
                let rows = self.eval(point)?.len();
                let cols = var.size().unwrap_or(1);
                if (rows, cols) == (1, 1) {
                    Ok(Block::Scalar(0.0))
                } else {
                    Ok(Block::zeros(rows, cols))
                }
            }
        }
    }

    /// Second derivative blocks keyed by pairs of variables.
    ///
    /// Node rules only describe first derivatives, so this always fails with
    /// [`Error::Unsupported`].
    pub fn diff2(&self, _point: &Point) -> Result<BTreeMap<(NodeId, NodeId), Block>, Error> {
        Err(Error::unsupported(format!(
            "second derivative of `{}`",
            self.name()
        )))
    }

    /// Propagates standard deviations of variables to the output,
    /// `sqrt(Σ (J·σ)²)` per output entry.
    pub fn uncertainty(
        &self,
        point: &Point,
        deviations: &Point,
        on_absent: AbsentDeviations,
    ) -> Result<Value, Error> {
        let derivative = self.diff_with(point, &DiffOptions::new().with_exact_shape(true))?;
        let mut variance = Value::zeros(self.eval(point)?.len());

        for (var, block) in derivative.iter() {
            let name = self.graph.name_of(var);
            let sigma = match deviations.lookup(var, &name) {
                Some(sigma) => sigma,
                None => match on_absent {
                    AbsentDeviations::Error => return Err(Error::MissingValue { name }),
                    AbsentDeviations::Skip => continue,
                    AbsentDeviations::Warn => {
                        warn!("no deviation given for `{}`, ignored", name);
                        continue;
                    }
                },
            };

            let jac: DMatrix<f64> = block.to_dense();
            let sigma = broadcast_to("uncertainty", sigma, jac.ncols())?;
            for (i, row) in jac.row_iter().enumerate() {
                variance[i] += row
                    .iter()
                    .zip(sigma.iter())
                    .map(|(j, s)| (j * s).powi(2))
                    .sum::<f64>();
            }
        }

        Ok(variance.map(f64::sqrt))
    }
}

fn accumulate(blocks: &mut Blocks, var: NodeId, block: Block) -> Result<(), Error> {
    let sum = match blocks.remove(&var) {
        Some(existing) => existing.add(&block)?,
        None => block,
    };
    blocks.insert(var, sum);
    Ok(())
}

fn derive(graph: &Graph, id: NodeId, point: &Point, ctx: &Context) -> Result<Rc<Blocks>, Error> {
    let node = graph.node(id);
    let spec = match &node.kind {
        NodeKind::Variable => {
            let mut blocks = Blocks::new();
            if ctx.key.includes(id) && ctx.has_included(graph, id) {
                let size = evaluate(graph, id, point, &ctx.schedule)?.len();
                blocks.insert(id, Block::identity(size));
            }
            return Ok(Rc::new(blocks));
        }
        NodeKind::Constant(_) => return Ok(Rc::new(Blocks::new())),
        NodeKind::Function(spec) if spec.discrete => return Ok(Rc::new(Blocks::new())),
        NodeKind::Function(spec) => spec,
    };

    if !ctx.has_included(graph, id) {
        return Ok(Rc::new(Blocks::new()));
    }

    let deps = dependencies(graph, id);
    let snapshot = if spec.costly {
        Some(snapshot(graph, &deps.vars, point))
    } else {
        None
    };

    {
        let mut caches = graph.caches().borrow_mut();
        let cached = caches
            .derivatives
            .get(&id)
            .filter(|entry| {
                entry.value.0 == ctx.key
                    && entry.is_valid(point, ctx.schedule.id(), false, snapshot.as_ref())
            })
            .map(|entry| Rc::clone(&entry.value.1));

        if let Some(blocks) = cached {
            caches.stats_mut(id).diff_hits += 1;
            trace!("{}: derivative cache hit", graph.name_of(id));
            return Ok(blocks);
        }
    }

    let name = graph.name_of(id);
    let inputs = spec
        .inputs
        .iter()
        .map(|input| match input {
            Operand::Node(input) => evaluate(graph, *input, point, &ctx.schedule),
            Operand::Const(value) => Ok(value.clone()),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let out_len = evaluate(graph, id, point, &ctx.schedule)?.len();
    let total_len = inputs.iter().map(|input| input.len()).sum();

    let joint = match &spec.derivative {
        DerivativeRule::Joint(rule) => Some(rule(&inputs)?.reconcile(&name, out_len, total_len)?),
        _ => None,
    };

    let options = graph.options();
    let mut blocks = Blocks::new();
    let mut offset = 0;

    for (k, input) in spec.inputs.iter().enumerate() {
        let in_len = inputs[k].len();
        let start = offset;
        offset += in_len;

        let input_id = match input {
            Operand::Node(input_id) => *input_id,
            Operand::Const(_) => continue,
        };

        let input_node = graph.node(input_id);
        if input_node.is_discrete() || !ctx.has_included(graph, input_id) {
            continue;
        }

        let local = match (&spec.derivative, &joint) {
            (_, Some(joint)) => joint.columns(start, in_len, &ctx.policy),
            (DerivativeRule::PerInput(rules), _) => match &rules[k] {
                Some(rule) => rule(&inputs)?,
                None => numeric_block(
                    &spec.forward,
                    &inputs,
                    k,
                    options.stencil(),
                    options.diff_step(),
                )?,
            },
            _ => numeric_block(
                &spec.forward,
                &inputs,
                k,
                options.stencil(),
                options.diff_step(),
            )?,
        };

        let local = local.reconcile(&name, out_len, in_len)?;
        let local = if out_len == in_len {
            local
        } else {
            local.expand(out_len, in_len)
        };

        if input_node.is_var() {
            accumulate(&mut blocks, input_id, local.expand(out_len, in_len))?;
        } else {
            let inner = derive(graph, input_id, point, ctx)?;
            for (var, block) in inner.iter() {
                accumulate(&mut blocks, *var, local.mul(block, &ctx.policy)?)?;
            }
        }
    }

    trace!("{}: differentiated at point {}", name, point.id());

    let blocks = Rc::new(blocks);
    let mut caches = graph.caches().borrow_mut();
    caches.stats_mut(id).diff_evals += 1;
    caches.derivatives.insert(
        id,
        Entry {
            point: point.id(),
            value: (ctx.key.clone(), Rc::clone(&blocks)),
            snapshot,
            schedule: ctx.schedule.id(),
            fixed: false,
        },
    );

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{FunctionBuilder, LocalRule},
        derivatives::numeric_jacobian,
    };

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn concrete_scenario_derivative() {
        let graph = Graph::new();
        let a = graph.var("a");
        let b = graph.var("b");
        let f = a * b + a.sin();

        let p = Point::builder().set(&a, 2.0).set(&b, 3.0).build();
        let d = f.diff(&p).unwrap();

        assert_eq!(d.len(), 2);
        assert_abs_diff_eq!(
            d.get(&a).unwrap().scalar_value().unwrap(),
            2.58385,
            epsilon = 1e-5
        );
        assert_eq!(d.get(&b), Some(&Block::Scalar(2.0)));
    }

    #[test]
    fn second_derivatives_are_unsupported() {
        let graph = Graph::new();
        let x = graph.var("x");
        let p = Point::builder().set(&x, 1.0).build();

        assert!(matches!(
            (x * x).diff2(&p),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn repeated_operand_accumulates() {
        let graph = Graph::new();
        let x = graph.var("x");
        let f = x + x + x.sin();

        let p = Point::builder().set(&x, 0.5).build();
        let d = f.diff_wrt(&p, &x).unwrap();
        assert_abs_diff_eq!(d.scalar_value().unwrap(), 2.0 + 0.5f64.cos());
    }

    #[test]
    fn vector_chain_rule() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 3);
        let f = (x * x).sum();

        let p = Point::builder().set(&x, [1.0, 2.0, 3.0]).build();
        let d = f.diff_wrt(&p, &x).unwrap();
        assert_eq!(d.to_dense(), dmatrix![2.0, 4.0, 6.0]);
    }

    #[test]
    fn scalar_broadcast_against_vector() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 2);
        let s = graph.var("s");
        let f = x * s;

        let p = Point::builder().set(&x, [1.0, 2.0]).set(&s, 3.0).build();
        let d = f.diff(&p).unwrap();
        assert_eq!(d.get(&x).unwrap().to_dense(), dmatrix![3.0, 0.0; 0.0, 3.0]);
        assert_eq!(d.get(&s).unwrap().to_dense(), dmatrix![1.0; 2.0]);
    }

    #[test]
    fn filters_variables() {
        let graph = Graph::new();
        let a = graph.var("a");
        let b = graph.var("b");
        let f = a * b;

        let p = Point::builder().set(&a, 2.0).set(&b, 3.0).build();

        let d = f
            .diff_with(&p, &DiffOptions::new().with_fixed([b]))
            .unwrap();
        assert!(d.contains(&a));
        assert!(!d.contains(&b));

        let d = f.diff_with(&p, &DiffOptions::new().with_wrt([b])).unwrap();
        assert!(!d.contains(&a));
        assert_eq!(d.get(&b), Some(&Block::Scalar(2.0)));

        assert!(matches!(
            f.diff_with(&p, &DiffOptions::new().with_wrt([a]).with_fixed([b])),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn independent_variable_gives_zeros() {
        let graph = Graph::new();
        let a = graph.var("a");
        let b = graph.var_sized("b", 2);
        let f = a * 2.0;

        let p = Point::builder().set(&a, 1.0).set(&b, [0.0, 0.0]).build();
        assert_eq!(f.diff_wrt(&p, &b).unwrap(), Block::zeros(1, 2));
        assert!(f.diff(&p).unwrap().get(&b).is_none());
    }

    #[test]
    fn exact_shape() {
        let graph = Graph::new();
        let a = graph.var("a");
        let f = a * 3.0;

        let p = Point::builder().set(&a, 1.0).build();
        let d = f
            .diff_with(&p, &DiffOptions::new().with_exact_shape(true))
            .unwrap();
        assert_eq!(d.get(&a), Some(&Block::Dense(dmatrix![3.0])));
    }

    #[test]
    fn derivative_cache() {
        let graph = Graph::new();
        let a = graph.var("a");
        let f = a.exp() * 2.0;

        let p = Point::builder().set(&a, 1.0).build();
        f.diff(&p).unwrap();
        f.diff(&p).unwrap();
        assert_eq!(f.stats().diff_evals, 1);
        assert_eq!(f.stats().diff_hits, 1);

        f.diff_with(&p, &DiffOptions::new().with_sparsity(Sparsity::Always))
            .unwrap();
        assert_eq!(f.stats().diff_evals, 2);

        f.diff(&Point::builder().set(&a, 1.0).build()).unwrap();
        assert_eq!(f.stats().diff_evals, 3);
    }

    #[test]
    fn sparse_results() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 4);
        let f = x.sin();

        let p = Point::builder().set(&x, [0.0, 0.0, 0.0, 0.0]).build();
        let d = f
            .diff_with(&p, &DiffOptions::new().with_sparsity(Sparsity::Always))
            .unwrap();
        let block = d.get(&x).unwrap();
        assert!(block.is_sparse());
        assert_eq!(block.to_dense(), DMatrix::identity(4, 4));

        let d = f.diff(&p).unwrap();
        assert!(matches!(d.get(&x), Some(Block::Dense(_))));
    }

    #[test]
    fn numeric_fallback_matches_finite_differences() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 2);
        let builder = FunctionBuilder::new(|inputs: &[Value]| {
            Ok(dvector![
                inputs[0][0] * inputs[0][1].exp(),
                inputs[0][0].powi(2)
            ])
        })
        .input(x)
        .size(2);
        let f = graph.function(builder).unwrap().sin();

        let p = Point::builder().set(&x, [0.7, -0.3]).build();
        let analytic = f.diff_wrt(&p, &x).unwrap().to_dense();
        let numeric = numeric_jacobian(&f, &p, &x).unwrap();

        for (a, n) in analytic.iter().zip(numeric.iter()) {
            assert_abs_diff_eq!(*a, *n, epsilon = 1e-5 * (1.0 + n.abs()));
        }
    }

    #[test]
    fn joint_rule_is_split_and_reconciled() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 2);
        let y = graph.var("y");
        let builder = FunctionBuilder::new(|inputs: &[Value]| {
            Ok(dvector![inputs[0][0] + 2.0 * inputs[0][1] + 3.0 * inputs[1][0]])
        })
        .inputs([x, y])
        // A column instead of a row.
        .joint_derivative(|_: &[Value]| Ok(Block::Dense(dmatrix![1.0; 2.0; 3.0])));
        let f = graph.function(builder).unwrap();

        let p = Point::builder().set(&x, [0.0, 0.0]).set(&y, 0.0).build();
        let d = f.diff(&p).unwrap();
        assert_eq!(d.get(&x).unwrap().to_dense(), dmatrix![1.0, 2.0]);
        assert_eq!(d.get(&y), Some(&Block::Scalar(3.0)));
    }

    #[test]
    fn invalid_block_is_reported() {
        let graph = Graph::new();
        let x = graph.var_sized("x", 2);
        let rule: LocalRule = Rc::new(|_: &[Value]| Ok(Block::zeros(3, 3)));
        let builder = FunctionBuilder::new(|inputs: &[Value]| Ok(inputs[0].clone()))
            .input(x)
            .derivative(DerivativeRule::PerInput(vec![Some(rule)]))
            .name("broken");
        let f = graph.function(builder).unwrap();

        let p = Point::builder().set(&x, [1.0, 1.0]).build();
        assert_eq!(
            f.diff(&p),
            Err(Error::InvalidBlock {
                node: "broken".to_string(),
                rows: 3,
                cols: 3,
                exp_rows: 2,
                exp_cols: 2,
            })
        );
    }

    #[test]
    fn multi_point_is_unsupported() {
        let graph = Graph::new();
        let x = graph.var("x");
        let f = x.sin();

        let p = Point::multi(2).set(&x, [0.0, 1.0]).build();
        assert!(matches!(f.diff(&p), Err(Error::Unsupported(_))));
    }

    #[test]
    fn uncertainty_propagation() {
        let graph = Graph::new();
        let a = graph.var("a");
        let b = graph.var("b");
        let f = a * b;

        let p = Point::builder().set(&a, 2.0).set(&b, 3.0).build();
        let sigma = Point::builder().set(&a, 0.1).set(&b, 0.2).build();
        assert_abs_diff_eq!(
            f.uncertainty(&p, &sigma, AbsentDeviations::Error).unwrap()[0],
            0.5,
            epsilon = 1e-12
        );

        let partial = Point::builder().set(&a, 0.1).build();
        assert_eq!(
            f.uncertainty(&p, &partial, AbsentDeviations::Error),
            Err(Error::MissingValue {
                name: "b".to_string()
            })
        );
        assert_abs_diff_eq!(
            f.uncertainty(&p, &partial, AbsentDeviations::Skip).unwrap()[0],
            0.3,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            f.uncertainty(&p, &partial, AbsentDeviations::Warn).unwrap()[0],
            0.3,
            epsilon = 1e-12
        );
    }
}
