//! voxlink daemon library
//!
//! This module re-exports the daemon's modules for integration testing.

pub mod config;
pub mod daemon;
pub mod ipc;
pub mod pipeline;
pub mod socket_utils;

pub use config::DaemonConfig;
pub use daemon::{Daemon, Flow};
pub use ipc::{IpcCommand, IpcRequest, IpcServer};
