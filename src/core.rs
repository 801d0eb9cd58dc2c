//! Core abstractions and types.
//!
//! *Users* build expressions from variables of a [`Graph`] and evaluate,
//! differentiate and bound them at a [`Point`] or over a [`Domain`].
//!
//! Engine *developers* are interested in the node configuration
//! ([`FunctionBuilder`], [`DerivativeRule`], [`IntervalRule`]) and the
//! [`Block`] algebra used by the chain rule.

mod base;
mod block;
mod constraint;
mod domain;
mod graph;
mod node;
mod point;
mod sparse;
mod value;

pub use base::*;
pub use block::*;
pub use constraint::*;
pub use domain::*;
pub use graph::*;
pub use node::*;
pub use point::*;
pub use sparse::*;
pub use value::*;
