//! Docker engine client for dockscope
//!
//! This crate defines the container source and log source interfaces the
//! streaming core consumes, a bollard-backed implementation of both, and an
//! in-memory host used by tests and demos.

mod client;
mod error;
mod memory;
mod source;

pub use client::DockerHost;
pub use error::{Error, Result};
pub use memory::{InMemoryHost, LogEnd};
pub use source::{ContainerStore, LogClients, LogFrame, LogSource, LogStream};

// Re-export types that are used in our public API
pub use dockscope_types::{Container, StdType};
