#![allow(clippy::many_single_char_names)]
#![allow(clippy::type_complexity)]
#![warn(missing_docs)]

//! # Funcdesign
//!
//! Lazily evaluated expression graphs over named variables, with exact
//! derivatives, interval bounds and evaluation caching. The crate is meant to
//! be the modeling kernel of optimization and equation solvers. It does not
//! solve anything itself.
//!
//! Expressions are values of [`Expr`] built from variables of a [`Graph`]
//! with overloaded operators and the functions of the [`ops`] module. Building
//! an expression never evaluates it. Given a [`Point`] assigning values to
//! variables, an expression can be
//!
//! * evaluated ([`Expr::eval`]), with results memoized per node,
//! * differentiated ([`Expr::diff`]), yielding one Jacobian [`Block`] per
//!   variable, dense, sparse or diagonal as appropriate,
//!
//! and given a [`Domain`] (a box of variable bounds) it can be bounded
//! ([`Expr::interval`]).
//!
//! ## Values
//!
//! Every node produces a one-dimensional array of `f64` ([`Value`]). Scalars
//! are arrays of size one and broadcast against arrays of any size. Operands
//! of incompatible sizes are rejected when the sizes are known at
//! construction, otherwise at evaluation.
//!
//! ## Example
//!
//! ```rust
//! use funcdesign::{Graph, Point};
//!
//! let graph = Graph::new();
//! let a = graph.var("a");
//! let b = graph.var("b");
//!
//! let f = a * b + a.sin();
//!
//! let point = Point::builder().set(&a, 1.0).set(&b, 2.0).build();
//! let value = f.eval(&point).unwrap();
//! assert!((value[0] - (2.0 + 1f64.sin())).abs() < 1e-12);
//!
//! // d/da = b + cos(a), d/db = a
//! let derivative = f.diff(&point).unwrap();
//! let da = derivative.get(&a).unwrap().to_dense();
//! assert!((da[(0, 0)] - (2.0 + 1f64.cos())).abs() < 1e-12);
//! ```
//!
//! ## Bounds
//!
//! Interval bounds are sound outer approximations. Repeated occurrences of
//! the same node are handled where it matters most, `x * x` is a square.
//!
//! ```rust
//! use funcdesign::{interval::Interval, Domain, Graph};
//!
//! let graph = Graph::new();
//! let x = graph.var("x");
//!
//! let domain = Domain::builder().bound(&x, -2.0, 3.0).build();
//! assert_eq!((x * x).interval(&domain).unwrap(), Interval::scalar(0.0, 9.0));
//! ```
//!
//! ## Constraints
//!
//! Comparisons of expressions build [`Constraint`]s. Functions defined only
//! on a part of the real line attach the constraint describing their domain
//! to the node they create, so that a solver can collect them with
//! [`attached_constraints`].
//!
//! ```rust
//! use funcdesign::{attached_constraints, Graph};
//!
//! let graph = Graph::new();
//! let x = graph.var("x");
//!
//! let f = x.sqrt() + x.powi(2);
//! assert_eq!(attached_constraints(&[f]).len(), 1);
//! ```
//!
//! ## License
//!
//! Licensed under MIT.

pub mod analysis;
mod core;
pub mod derivatives;
pub mod engine;
pub mod interval;
pub mod ops;

pub use core::*;
pub use engine::{AbsentDeviations, Derivative, DiffOptions, Stats, VarSchedule};

#[cfg(feature = "testing")]
pub mod testing;

#[cfg(not(feature = "testing"))]
pub(crate) mod testing;

pub use nalgebra;
