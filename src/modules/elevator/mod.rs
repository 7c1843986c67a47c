pub mod elevator;
pub mod requests;

pub use elevator::*;
