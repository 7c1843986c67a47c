pub mod auction;
pub mod decision;

pub use decision::*;
