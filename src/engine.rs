//! Evaluation, differentiation and interval engines.
//!
//! The engines are implemented as methods of [`Expr`](crate::Expr). Their
//! memoized results live in side tables owned by the graph.

mod bounds;
mod cache;
mod differentiate;
mod evaluate;

pub(crate) use cache::Caches;
pub use cache::Stats;
pub use differentiate::{AbsentDeviations, Derivative, DiffOptions};
pub use evaluate::VarSchedule;
