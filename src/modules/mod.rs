pub mod common;
pub mod config;
pub mod cost;
pub mod decision;
pub mod elevator;
pub mod hardware;
pub mod network;
pub mod peers;
pub mod sync;
