//! The two external boundaries of an objective evaluation: editing the model
//! description and running the solver on it.

pub mod injector;
pub mod invoker;

pub use injector::*;
pub use invoker::*;
