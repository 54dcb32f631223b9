pub mod errors;
pub mod params;
pub mod series;
pub mod evaluation;

pub use errors::*;
pub use params::*;
pub use series::*;
pub use evaluation::*;
