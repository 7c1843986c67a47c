pub mod common;
pub mod error;
pub mod orders;

pub use common::*;
pub use error::{FleetError, Result};
pub use orders::OrderMatrix;
