pub mod extract;
pub mod experiment;
pub mod resample;
pub mod metric;
pub mod eval_log;
pub mod cache;

pub use extract::*;
pub use experiment::*;
pub use resample::*;
pub use metric::*;
pub use eval_log::*;
pub use cache::*;
