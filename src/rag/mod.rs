//! Query rewriting and decomposition helpers, shared by the query enhancer.

pub mod query_decomposer;
pub mod query_rewriter;

pub use query_decomposer::{
    decompose_query, merge_results, DecomposedQuery, DecompositionStrategy, HasIdAndScore,
};
pub use query_rewriter::{ConversationContext, QueryRewriter};
