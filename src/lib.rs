//! Vault deployer
//!
//! Mirrors a release host's published bundles into a local catalog, verifies and unpacks
//! them, and provisions storage instances on a compute platform from the result: payment,
//! creation, chunked module install, frontend upload and ownership hand-off. Completed
//! instances are later upgraded in place when their release selector moves on.

pub mod api;
pub mod chunk;
pub mod config;
pub mod db;
pub mod deploy;
pub mod download;
pub mod extract;
pub mod integrity;
pub mod metrics;
pub mod registry;
pub mod release;
pub mod scheduler;
pub mod service;
pub mod sim;

pub use config::DeployerConfig;
pub use service::{Deployer, TickReport};
