//! shellbox: provisions isolated containerized development workspaces and
//! bridges interactive shell sessions between browser clients and the
//! containers over WebSockets.
//!
//! The daemon is organized around five components:
//!
//! - [`runtime`]: thin adapter over the host container engine
//! - [`registry`]: durable record of every workspace's identity and state
//! - [`workspace`]: the lifecycle orchestrator (state machine, per-id locking)
//! - [`term`]: PTY session ownership and output fan-out
//! - [`server`]: REST control surface and the WebSocket terminal bridge

pub mod cli;
pub mod config;
pub mod error;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod term;
pub mod workspace;
