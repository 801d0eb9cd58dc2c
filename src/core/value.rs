//! Values flowing through the graph and the broadcasting rules between them.
//!
//! Every node produces a one-dimensional array ([`Value`]). Scalars are arrays
//! of size one and broadcast against arrays of any size. Two arrays of
//! different sizes, neither of them a scalar, are incompatible.

use nalgebra::DVector;

use super::{base::Error, node::NodeId};

/// Value of a node: a column of `f64`.
pub type Value = DVector<f64>;

/// Input of a function node: either a reference to another node or a literal
/// constant array.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Output of another node.
    Node(NodeId),
    /// Literal constant.
    Const(Value),
}

impl Operand {
    /// Returns the referenced node, if any.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Operand::Node(id) => Some(*id),
            Operand::Const(_) => None,
        }
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand::Const(scalar(value))
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Const(value)
    }
}

impl From<&[f64]> for Operand {
    fn from(value: &[f64]) -> Self {
        Operand::Const(Value::from_column_slice(value))
    }
}

impl From<Vec<f64>> for Operand {
    fn from(value: Vec<f64>) -> Self {
        Operand::Const(Value::from_vec(value))
    }
}

/// Conversion of plain numbers and arrays into a [`Value`].
pub trait IntoValue {
    /// Performs the conversion.
    fn into_value(self) -> Value;
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        scalar(self)
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for &Value {
    fn into_value(self) -> Value {
        self.clone()
    }
}

impl IntoValue for Vec<f64> {
    fn into_value(self) -> Value {
        Value::from_vec(self)
    }
}

impl IntoValue for &[f64] {
    fn into_value(self) -> Value {
        Value::from_column_slice(self)
    }
}

impl<const N: usize> IntoValue for [f64; N] {
    fn into_value(self) -> Value {
        Value::from_column_slice(&self)
    }
}

/// Creates a value of size one.
pub fn scalar(value: f64) -> Value {
    Value::from_element(1, value)
}

/// Size of the result of a broadcasting binary operation.
pub fn broadcast_size(op: &'static str, left: usize, right: usize) -> Result<usize, Error> {
    if left == right || right == 1 {
        Ok(left)
    } else if left == 1 {
        Ok(right)
    } else {
        Err(Error::ShapeMismatch { op, left, right })
    }
}

/// Applies `f` elementwise with scalar broadcasting.
pub fn zip_map<F>(op: &'static str, a: &Value, b: &Value, f: F) -> Result<Value, Error>
where
    F: Fn(f64, f64) -> f64,
{
    let n = broadcast_size(op, a.len(), b.len())?;
    let at = |v: &Value, i: usize| if v.len() == 1 { v[0] } else { v[i] };
    Ok(Value::from_iterator(n, (0..n).map(|i| f(at(a, i), at(b, i)))))
}

/// Broadcasts `v` to size `n` (a scalar is repeated, anything else must
/// already have size `n`).
pub fn broadcast_to(op: &'static str, v: &Value, n: usize) -> Result<Value, Error> {
    if v.len() == n {
        Ok(v.clone())
    } else if v.len() == 1 {
        Ok(Value::from_element(n, v[0]))
    } else {
        Err(Error::ShapeMismatch {
            op,
            left: v.len(),
            right: n,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn broadcasting_rules() {
        assert_eq!(broadcast_size("add", 3, 3), Ok(3));
        assert_eq!(broadcast_size("add", 1, 4), Ok(4));
        assert_eq!(broadcast_size("add", 4, 1), Ok(4));
        assert_eq!(
            broadcast_size("add", 2, 3),
            Err(Error::ShapeMismatch {
                op: "add",
                left: 2,
                right: 3
            })
        );
    }

    #[test]
    fn zip_map_broadcasts_scalar() {
        let a = dvector![1.0, 2.0, 3.0];
        let b = scalar(2.0);
        assert_eq!(
            zip_map("mul", &a, &b, |x, y| x * y).unwrap(),
            dvector![2.0, 4.0, 6.0]
        );
        assert_eq!(
            zip_map("sub", &b, &a, |x, y| x - y).unwrap(),
            dvector![1.0, 0.0, -1.0]
        );
    }

    #[test]
    fn zip_map_rejects_mismatch() {
        let a = dvector![1.0, 2.0];
        let b = dvector![1.0, 2.0, 3.0];
        assert!(zip_map("add", &a, &b, |x, y| x + y).is_err());
    }
}
