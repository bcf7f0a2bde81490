//! # syncd - block-level synchronization controller and agent
//!
//! `syncd` is the Sync Subsystem of a webhook-driven deployment controller:
//! it maintains agent sessions over a mutually-authenticated TCP channel,
//! computes a block-level content index of a project directory, and fans
//! the resulting tree out to a set of remote sync nodes.
//!
//! The primary side (`controller`, `registry`, `taskstore`, `session`)
//! dispatches and serves; the agent side (`agent`) reconnects and
//! reconstructs. Both share the chunker, ignore matcher, and wire codec.
//!
//! ## Quick start (library use)
//!
//! ```rust,ignore
//! use syncd::controller::Controller;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = Controller::new(registry, task_store, pool, config_source, &primary_config);
//!     controller.trigger("my-project", "git-push").await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(dead_code)]

pub mod agent;
pub mod backoff;
pub mod blockstore;
pub mod chunker;
pub mod config;
pub mod controller;
pub(crate) mod durable;
pub mod error;
pub(crate) mod filelock;
pub mod ignore;
pub mod logging;
pub mod registry;
pub mod session;
pub mod taskstore;
pub mod tls;
pub mod watcher;
pub mod wire;

pub use error::SyncdError;
pub use taskstore::{Task, TaskState};
pub use wire::messages::FileIndexEntry;

// vim: ts=4
