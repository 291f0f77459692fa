pub mod audit;
pub mod core;
pub mod ev;
pub mod gate;
pub mod manifest;
pub mod portfolio;
pub mod risk;
pub mod router;
pub mod utils;

pub use crate::core::{config::*, error::*, types::*};
pub use router::{DecisionRouter, RouterRuntime};
