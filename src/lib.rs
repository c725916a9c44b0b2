pub mod attacks;
pub mod dataset;
pub mod diagnostics;
pub mod error;
pub mod eval;
pub mod layers;
pub mod model;
pub mod optim;
pub mod train;
pub mod tutorial;

pub use error::{Error, Result};
