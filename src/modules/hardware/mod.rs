pub mod hardware;

pub use hardware::*;
