//! Points at which expressions are evaluated.
//!
//! A [`Point`] is immutable once built. Every point gets a unique identity
//! which lets nodes recognize that they were already evaluated at it.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use super::{
    graph::Expr,
    node::NodeId,
    value::{IntoValue, Value},
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Assignment of values to variables.
///
/// Values are looked up by variable identity first and by variable name as a
/// fallback. A *multi-point* carries a batch of samples for every (scalar)
/// variable and is evaluated for all samples at once.
#[derive(Debug, Clone)]
pub struct Point {
    id: u64,
    by_id: BTreeMap<NodeId, Value>,
    by_name: BTreeMap<String, Value>,
    samples: Option<usize>,
}

impl Point {
    /// Starts building a point.
    pub fn builder() -> PointBuilder {
        PointBuilder::default()
    }

    /// Starts building a multi-point with given number of samples.
    pub fn multi(samples: usize) -> PointBuilder {
        PointBuilder {
            samples: Some(samples),
            ..PointBuilder::default()
        }
    }

    /// Identity of the point.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` for a multi-point.
    pub fn is_multi(&self) -> bool {
        self.samples.is_some()
    }

    /// Number of samples of a multi-point.
    pub fn samples(&self) -> Option<usize> {
        self.samples
    }

    /// Gets the value of a variable.
    pub fn get(&self, var: &Expr<'_>) -> Option<&Value> {
        self.lookup(var.id(), &var.name())
    }

    pub(crate) fn lookup(&self, id: NodeId, name: &str) -> Option<&Value> {
        self.by_id.get(&id).or_else(|| self.by_name.get(name))
    }

    /// Creates a new point (with a new identity) which differs from this one
    /// in the value of a single variable.
    pub fn with_value(&self, var: &Expr<'_>, value: impl IntoValue) -> Point {
        let mut by_id = self.by_id.clone();
        by_id.insert(var.id(), value.into_value());

        let mut by_name = self.by_name.clone();
        by_name.remove(&var.name());

        Point {
            id: next_id(),
            by_id,
            by_name,
            samples: self.samples,
        }
    }

    /// Iterates over values assigned by variable identity.
    pub fn values(&self) -> impl Iterator<Item = (NodeId, &Value)> {
        self.by_id.iter().map(|(id, v)| (*id, v))
    }
}

/// Builder of a [`Point`].
#[derive(Debug, Clone, Default)]
pub struct PointBuilder {
    by_id: BTreeMap<NodeId, Value>,
    by_name: BTreeMap<String, Value>,
    samples: Option<usize>,
}

impl PointBuilder {
    /// Assigns a value to a variable.
    pub fn set(mut self, var: &Expr<'_>, value: impl IntoValue) -> Self {
        self.by_id.insert(var.id(), value.into_value());
        self
    }

    pub(crate) fn set_id(mut self, id: NodeId, value: Value) -> Self {
        self.by_id.insert(id, value);
        self
    }

    /// Assigns a value to a variable given by name.
    pub fn set_named(mut self, name: impl Into<String>, value: impl IntoValue) -> Self {
        self.by_name.insert(name.into(), value.into_value());
        self
    }

    /// Finishes the point.
    ///
    /// For a multi-point, every value must have one entry per sample.
    pub fn build(self) -> Point {
        if let Some(samples) = self.samples {
            assert!(samples > 0, "multi-point without samples");
            assert!(
                self.by_id
                    .values()
                    .chain(self.by_name.values())
                    .all(|v| v.len() == samples),
                "multi-point values must have one entry per sample"
            );
        }

        Point {
            id: next_id(),
            by_id: self.by_id,
            by_name: self.by_name,
            samples: self.samples,
        }
    }
}
