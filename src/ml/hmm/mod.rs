pub mod alignment;
pub mod fitter;
pub mod gaussian_hmm;
pub mod scaler;

pub use alignment::StateRegistry;
pub use fitter::{FittedModel, GaussianHmmFitter, ModelFitter};
