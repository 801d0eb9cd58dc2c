use thiserror::Error;

/// Error encountered while building or evaluating an expression graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Operand sizes are neither equal nor is one of them a scalar.
    #[error("{op}: incompatible operand sizes {left} and {right}")]
    ShapeMismatch {
        /// Name of the operation.
        op: &'static str,
        /// Size of the left operand.
        left: usize,
        /// Size of the right operand.
        right: usize,
    },
    /// The operation is not supported for given operands.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// The point (or domain) does not contain a value for a variable the
    /// expression depends on.
    #[error("no value for variable `{name}` in the point")]
    MissingValue {
        /// Name of the variable.
        name: String,
    },
    /// Invalid combination of arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A user-supplied rule produced a value of unexpected shape.
    #[error("{node}: derivative block has shape {rows}x{cols}, expected {exp_rows}x{exp_cols}")]
    InvalidBlock {
        /// Name of the node.
        node: String,
        /// Number of rows returned.
        rows: usize,
        /// Number of columns returned.
        cols: usize,
        /// Expected number of rows.
        exp_rows: usize,
        /// Expected number of columns.
        exp_cols: usize,
    },
}

impl Error {
    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}
