pub mod executor;
pub mod results;
pub mod walk_forward;

pub use executor::*;
pub use walk_forward::*;
