//! Chat relay between a browser and a local llama.cpp server - library exports
//!
//! The server side lives in [`api`] and [`core`]; [`client`] is the consuming
//! end of the chat event stream.

pub mod api;
pub mod client;
pub mod config;
pub mod core;
pub mod event;
pub mod infrastructure;
pub mod lines;
