pub mod ast;
pub mod compile;
pub mod error;
pub mod expr;
pub mod flatten;
pub mod history;
pub mod linear;
pub mod pipeline;
pub mod placement;
pub mod predmap;
pub mod predtree;
pub mod validate;
