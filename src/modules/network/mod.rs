pub mod message;
pub mod network;

pub use message::*;
pub use network::*;
