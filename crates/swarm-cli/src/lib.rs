//! # swarm-cli
//!
//! Command-line interface for swarm mesh nodes.
//!
//! ## Commands
//!
//! - `swarm start`: Join the mesh and run a node
//! - `swarm status` / `peers` / `state`: Inspect a running node
//! - `swarm set` / `get`: Read and write shared state
//! - `swarm config`: Show the effective configuration

pub mod commands;

pub use commands::Cli;
