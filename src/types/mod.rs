pub mod observation;
pub mod regime;
pub mod allocation;

pub use observation::*;
pub use regime::*;
pub use allocation::*;
