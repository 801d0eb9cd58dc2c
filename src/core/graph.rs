//! Arena of nodes and the [`Expr`] handle used to build expressions.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt,
    rc::Rc,
};

use getset::{CopyGetters, Setters};

use super::{
    base::Error,
    block::{SparsePolicy, Sparsity},
    constraint::ConstraintData,
    node::{DerivativeRule, FunctionBuilder, Node, NodeId, NodeKind},
    value::{IntoValue, Operand},
};
use crate::{derivatives::Stencil, engine::Caches};

/// Options of the evaluation and derivative engines.
#[derive(Debug, Clone, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct EngineOptions {
    /// Minimal product of operand sizes for which a chain rule product of
    /// two dense blocks is computed in sparse storage. Default: `2^15`.
    sparse_size_threshold: usize,
    /// Maximal fraction of nonzeros of at least one dense operand for the
    /// sparse product. Default: `0.25`.
    sparse_density_threshold: f64,
    /// Minimal number of entries of a diagonal block to be returned in sparse
    /// storage when sparsity is automatic. Default: `150 * 150`.
    diagonal_sparse_threshold: usize,
    /// Step of finite differences. If `None`, the step is derived from the
    /// machine epsilon according to the stencil.
    diff_step: Option<f64>,
    /// Stencil of finite differences. Default: central.
    stencil: Stencil,
    /// Tolerance of derivative checks. Default: `1e-2`.
    max_violation: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            sparse_size_threshold: 1 << 15,
            sparse_density_threshold: 0.25,
            diagonal_sparse_threshold: 150 * 150,
            diff_step: None,
            stencil: Stencil::Central,
            max_violation: 1e-2,
        }
    }
}

/// Expression graph.
///
/// The graph owns all nodes and the caches of the engines. It is append only:
/// nodes are never modified or removed after they are created, so analyses
/// computed for a node stay valid for the lifetime of the graph.
pub struct Graph {
    nodes: RefCell<Vec<Rc<Node>>>,
    names: RefCell<Vec<String>>,
    attached: RefCell<BTreeMap<NodeId, Vec<ConstraintData>>>,
    caches: RefCell<Caches>,
    options: EngineOptions,
    unnamed: Cell<usize>,
}

impl Graph {
    /// Creates an empty graph with default options.
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    /// Creates an empty graph with given options.
    pub fn with_options(options: EngineOptions) -> Self {
        Self {
            nodes: RefCell::new(Vec::new()),
            names: RefCell::new(Vec::new()),
            attached: RefCell::new(BTreeMap::new()),
            caches: RefCell::new(Caches::default()),
            options,
            unnamed: Cell::new(0),
        }
    }

    /// Gets the engine options.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// Returns `true` if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    /// Creates a scalar variable.
    pub fn var(&self, name: &str) -> Expr<'_> {
        self.var_sized(name, 1)
    }

    /// Creates a vector variable of given size.
    pub fn var_sized(&self, name: &str, size: usize) -> Expr<'_> {
        assert!(size > 0, "empty variable");
        self.push(Some(name.to_string()), NodeKind::Variable, Some(size))
    }

    /// Creates a constant.
    pub fn constant(&self, value: impl IntoValue) -> Expr<'_> {
        let value = value.into_value();
        let size = value.len();
        self.push(None, NodeKind::Constant(value), Some(size))
    }

    /// Creates a function node.
    pub fn function(&self, builder: FunctionBuilder) -> Result<Expr<'_>, Error> {
        let FunctionBuilder { name, size, spec } = builder;

        let len = self.len();
        if let Some(id) = spec.node_inputs().find(|id| id.0 >= len) {
            return Err(Error::InvalidArgument(format!(
                "input {} does not belong to the graph",
                id
            )));
        }

        if let DerivativeRule::PerInput(rules) = &spec.derivative {
            if rules.len() != spec.inputs.len() {
                return Err(Error::InvalidArgument(format!(
                    "{} derivative rules given for {} inputs",
                    rules.len(),
                    spec.inputs.len()
                )));
            }
        }

        Ok(self.push(name, NodeKind::Function(spec), size))
    }

    fn push(&self, name: Option<String>, kind: NodeKind, size: Option<usize>) -> Expr<'_> {
        let name = name.unwrap_or_else(|| {
            let n = self.unnamed.get();
            self.unnamed.set(n + 1);
            format!("unnamed_{}", n)
        });

        let mut nodes = self.nodes.borrow_mut();
        let id = NodeId(nodes.len());
        nodes.push(Rc::new(Node { id, kind, size }));
        self.names.borrow_mut().push(name);

        Expr { graph: self, id }
    }

    /// Gets the expression handle of a node.
    ///
    /// # Panics
    ///
    /// The node must belong to this graph.
    pub fn expr(&self, id: NodeId) -> Expr<'_> {
        assert!(id.0 < self.len(), "node does not belong to the graph");
        Expr { graph: self, id }
    }

    /// Gets a node.
    pub fn node(&self, id: NodeId) -> Rc<Node> {
        Rc::clone(&self.nodes.borrow()[id.0])
    }

    pub(crate) fn name_of(&self, id: NodeId) -> String {
        self.names.borrow()[id.0].clone()
    }

    /// Drops all cached values and derivatives. Counters are kept.
    pub fn clear_caches(&self) {
        self.caches.borrow_mut().clear();
    }

    pub(crate) fn caches(&self) -> &RefCell<Caches> {
        &self.caches
    }

    pub(crate) fn sparse_policy(&self, sparsity: Sparsity) -> SparsePolicy {
        SparsePolicy {
            sparsity,
            size_threshold: self.options.sparse_size_threshold,
            density_threshold: self.options.sparse_density_threshold,
            diagonal_threshold: self.options.diagonal_sparse_threshold,
        }
    }

    pub(crate) fn attach(&self, id: NodeId, constraint: ConstraintData) {
        self.attached
            .borrow_mut()
            .entry(id)
            .or_default()
            .push(constraint);
    }

    pub(crate) fn detach(&self, id: NodeId) -> Vec<ConstraintData> {
        self.attached.borrow_mut().remove(&id).unwrap_or_default()
    }

    pub(crate) fn attached_to(&self, id: NodeId) -> Vec<ConstraintData> {
        self.attached
            .borrow()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.len())
            .field("options", &self.options)
            .finish()
    }
}

/// Handle of a node in a [`Graph`].
///
/// Expressions are built from variables with overloaded operators and the
/// functions of the [`ops`](crate::ops) module. Building never evaluates
/// anything.
#[derive(Clone, Copy)]
pub struct Expr<'g> {
    pub(crate) graph: &'g Graph,
    pub(crate) id: NodeId,
}

impl<'g> Expr<'g> {
    /// Identity of the node.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Graph the node belongs to.
    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Gets the node.
    pub fn node(&self) -> Rc<Node> {
        self.graph.node(self.id)
    }

    /// Name of the node.
    pub fn name(&self) -> String {
        self.graph.name_of(self.id)
    }

    /// Renames the node.
    pub fn named(self, name: impl Into<String>) -> Self {
        self.graph.names.borrow_mut()[self.id.0] = name.into();
        self
    }

    /// Output size if known without evaluation.
    pub fn size(&self) -> Option<usize> {
        self.node().size
    }

    /// Returns `true` for variables.
    pub fn is_var(&self) -> bool {
        self.node().is_var()
    }

    /// Returns `true` for nodes without derivative.
    pub fn is_discrete(&self) -> bool {
        self.node().is_discrete()
    }

    /// Returns `true` for constants.
    pub fn is_constant(&self) -> bool {
        matches!(self.node().kind, NodeKind::Constant(_))
    }
}

impl PartialEq for Expr<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.graph, other.graph) && self.id == other.id
    }
}

impl Eq for Expr<'_> {}

impl fmt::Debug for Expr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({}{})", self.name(), self.id)
    }
}

impl fmt::Display for Expr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl From<Expr<'_>> for Operand {
    fn from(expr: Expr<'_>) -> Self {
        Operand::Node(expr.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Block, LocalRule, Value};

    #[test]
    fn ids_are_arena_positions() {
        let graph = Graph::new();
        let x = graph.var("x");
        let c = graph.constant(2.0);
        let y = graph.var_sized("y", 3);

        assert_eq!(x.id().index(), 0);
        assert_eq!(c.id().index(), 1);
        assert_eq!(y.id().index(), 2);
        assert_eq!(graph.len(), 3);
        assert_eq!(y.size(), Some(3));
        assert!(x.is_var());
        assert!(c.is_constant());
        assert!(c.is_discrete());
    }

    #[test]
    fn unnamed_nodes_get_counter_names() {
        let graph = Graph::new();
        let a = graph.constant(1.0);
        let b = graph.constant(2.0);
        assert_eq!(a.name(), "unnamed_0");
        assert_eq!(b.name(), "unnamed_1");
        assert_eq!(b.named("two").name(), "two");
    }

    #[test]
    fn function_validates_rule_count() {
        let graph = Graph::new();
        let x = graph.var("x");

        let builder = FunctionBuilder::new(|inputs: &[Value]| Ok(inputs[0].clone()))
            .input(x)
            .derivative(DerivativeRule::PerInput(vec![None, None]));
        assert!(matches!(
            graph.function(builder),
            Err(Error::InvalidArgument(_))
        ));

        let other = Graph::new();
        let identity: LocalRule = Rc::new(|_: &[Value]| Ok(Block::Scalar(1.0)));
        let builder = FunctionBuilder::new(|inputs: &[Value]| Ok(inputs[0].clone()))
            .input(Operand::Node(NodeId(5)))
            .derivative(DerivativeRule::PerInput(vec![Some(identity)]));
        assert!(other.function(builder).is_err());
    }
}
