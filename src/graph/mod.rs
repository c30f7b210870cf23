//! Graph builder.
//!
//! Turns a declaration set into a DAG of resource instance nodes: repeated
//! declarations are expanded, module calls are flattened, references and
//! explicit hints become edges, and cycles are rejected.

mod bound;
mod builder;
mod dag;

pub use bound::{
    BoundCondition, BoundExpr, BoundPredicate, Eval, EvalContext, Projected, Projections,
    evaluate_arguments,
};
pub use builder::GraphBuilder;
pub use dag::{BoundOutput, Graph, GraphNode, NodeId};

pub(crate) use dag::topological_sort;
