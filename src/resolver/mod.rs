//! PRD-set dependency resolution (§4.G).

mod dag;

pub use dag::{DagError, PrdDag};
