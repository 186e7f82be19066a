//! Side-effecting operations: configuration, filesystem, processes, network.

pub mod atomic;
pub mod config;
pub mod model;
pub mod process;
pub mod sandbox;
pub mod session_store;
pub mod settings;
pub mod web_search;
