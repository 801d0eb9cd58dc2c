//! Graph nodes and their immutable configuration.
//!
//! A node is a variable, a constant or a function of other nodes. Everything
//! the engines need to know about a function (forward map, derivative rule,
//! interval rule, order estimator and flags) is fixed when the node is pushed
//! into the [`Graph`](super::Graph) and never changes afterwards.

use std::{fmt, rc::Rc};

use super::{
    base::Error,
    block::Block,
    value::{Operand, Value},
};
use crate::interval::Interval;

/// Identity of a node.
///
/// Ids are allocated in increasing order and equal the position of the node
/// in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Position of the node in its graph.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Forward map of a function node. Receives values of all inputs in order.
pub type Forward = Rc<dyn Fn(&[Value]) -> Result<Value, Error>>;

/// Local derivative rule. Receives values of all inputs in order and returns
/// the Jacobian block of the output with respect to one input (or, for a
/// joint rule, to all inputs with columns concatenated).
///
/// [`Block::Scalar`] is interpreted as a multiple of the identity.
pub type LocalRule = Rc<dyn Fn(&[Value]) -> Result<Block, Error>>;

/// Generator of critical points of a unary function inside `[lower, upper]`.
pub type CriticalPoints = Rc<dyn Fn(f64, f64) -> Vec<f64>>;

/// Interval kernel. Receives intervals of all inputs in order.
pub type IntervalKernel = Rc<dyn Fn(&[Interval]) -> Result<Interval, Error>>;

/// How the local Jacobian blocks of a function are obtained.
#[derive(Clone)]
pub enum DerivativeRule {
    /// One rule per input. `None` entries are approximated numerically.
    PerInput(Vec<Option<LocalRule>>),
    /// One rule for all inputs, columns concatenated in input order.
    Joint(LocalRule),
    /// Finite difference approximation for all inputs.
    Numeric,
}

/// How the interval of a function is obtained.
#[derive(Clone)]
pub enum IntervalRule {
    /// The function has no interval rule.
    Unsupported,
    /// Elementwise unary function evaluated at the bounds of its argument and
    /// at the critical points lying inside them.
    CriticalPoints(CriticalPoints),
    /// Dedicated interval kernel.
    Kernel(IntervalKernel),
    /// Elementwise sum of all inputs, with partial results stored in the
    /// domain for incremental updates.
    Sum,
}

/// Estimator of the polynomial order of a function given the orders of its
/// inputs. Constant inputs have order zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderRule {
    /// Order zero regardless of inputs.
    Constant,
    /// Maximum of input orders (sums, linear maps).
    Max,
    /// Sum of input orders (products).
    Product,
    /// Order of the numerator if the denominator is constant, infinity
    /// otherwise.
    Quotient,
    /// Input order multiplied by the exponent if it is a nonnegative integer,
    /// infinity otherwise.
    Power(f64),
    /// Zero if all inputs are constant, infinity otherwise.
    Generic,
}

/// Configuration of a function node.
#[derive(Clone)]
pub struct FunctionSpec {
    pub(crate) inputs: Vec<Operand>,
    pub(crate) forward: Forward,
    pub(crate) derivative: DerivativeRule,
    pub(crate) interval: IntervalRule,
    pub(crate) order: OrderRule,
    pub(crate) discrete: bool,
    pub(crate) costly: bool,
    pub(crate) vectorized: bool,
}

impl FunctionSpec {
    /// Inputs in the order they are passed to the forward map.
    pub fn inputs(&self) -> &[Operand] {
        &self.inputs
    }

    /// Node inputs (constants skipped).
    pub fn node_inputs(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.inputs.iter().filter_map(Operand::node)
    }
}

impl fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("inputs", &self.inputs)
            .field("order", &self.order)
            .field("discrete", &self.discrete)
            .field("costly", &self.costly)
            .field("vectorized", &self.vectorized)
            .finish()
    }
}

/// Kind of a node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Free variable looked up in the point.
    Variable,
    /// Constant value.
    Constant(Value),
    /// Function of other nodes.
    Function(FunctionSpec),
}

/// Node of the graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) size: Option<usize>,
}

impl Node {
    /// Identity of the node.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Kind of the node.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Output size if known without evaluation.
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// Returns `true` for variables.
    pub fn is_var(&self) -> bool {
        matches!(self.kind, NodeKind::Variable)
    }

    /// Returns `true` if the node has no derivative.
    pub fn is_discrete(&self) -> bool {
        match &self.kind {
            NodeKind::Variable => false,
            NodeKind::Constant(_) => true,
            NodeKind::Function(spec) => spec.discrete,
        }
    }

    /// Returns `true` if the node is worth memoizing by value comparison.
    pub fn is_costly(&self) -> bool {
        match &self.kind {
            NodeKind::Function(spec) => spec.costly,
            _ => false,
        }
    }

    /// Returns the function configuration, if the node is a function.
    pub fn spec(&self) -> Option<&FunctionSpec> {
        match &self.kind {
            NodeKind::Function(spec) => Some(spec),
            _ => None,
        }
    }
}

/// Builder of a user-defined function node.
///
/// By default the function is differentiated numerically, has no interval
/// rule and is neither costly nor vectorized.
#[derive(Clone)]
pub struct FunctionBuilder {
    pub(crate) name: Option<String>,
    pub(crate) size: Option<usize>,
    pub(crate) spec: FunctionSpec,
}

impl FunctionBuilder {
    /// Starts building a function with given forward map.
    pub fn new<F>(forward: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, Error> + 'static,
    {
        Self {
            name: None,
            size: None,
            spec: FunctionSpec {
                inputs: Vec::new(),
                forward: Rc::new(forward),
                derivative: DerivativeRule::Numeric,
                interval: IntervalRule::Unsupported,
                order: OrderRule::Generic,
                discrete: false,
                costly: false,
                vectorized: false,
            },
        }
    }

    /// Appends an input.
    pub fn input(mut self, input: impl Into<Operand>) -> Self {
        self.spec.inputs.push(input.into());
        self
    }

    /// Appends several inputs.
    pub fn inputs<I, O>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<Operand>,
    {
        self.spec.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Sets the name of the node.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declares the output size.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Sets the derivative rule.
    pub fn derivative(mut self, rule: DerivativeRule) -> Self {
        self.spec.derivative = rule;
        self
    }

    /// Sets a joint derivative rule for all inputs.
    pub fn joint_derivative<F>(self, rule: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Block, Error> + 'static,
    {
        self.derivative(DerivativeRule::Joint(Rc::new(rule)))
    }

    /// Sets the interval rule.
    pub fn interval(mut self, rule: IntervalRule) -> Self {
        self.spec.interval = rule;
        self
    }

    /// Sets critical points of an elementwise unary function.
    pub fn critical_points<F>(self, points: F) -> Self
    where
        F: Fn(f64, f64) -> Vec<f64> + 'static,
    {
        self.interval(IntervalRule::CriticalPoints(Rc::new(points)))
    }

    /// Sets the order estimator.
    pub fn order(mut self, rule: OrderRule) -> Self {
        self.spec.order = rule;
        self
    }

    /// Marks the function as not differentiable.
    pub fn discrete(mut self, discrete: bool) -> Self {
        self.spec.discrete = discrete;
        self
    }

    /// Marks the function as expensive to evaluate.
    pub fn costly(mut self, costly: bool) -> Self {
        self.spec.costly = costly;
        self
    }

    /// Declares that the forward map handles batched inputs itself.
    pub fn vectorized(mut self, vectorized: bool) -> Self {
        self.spec.vectorized = vectorized;
        self
    }
}
