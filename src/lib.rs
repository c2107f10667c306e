//! # agent-azure
//!
//! Checkmk special agent for Microsoft Azure. Collects resources, metrics,
//! resource health, usage details and directory data of one tenant and
//! writes them as piggybacked agent sections to stdout.
//!
//! ## Modules
//!
//! - **config** – command line arguments
//! - **selector** – explicit and tag based resource selection
//! - **resource** – subscription and resource model, tag import
//! - **cache** – time-boxed JSON cache on disk
//! - **metrics** – metric catalogue and the batched, cached metric queries
//! - **processors** – type specific enrichment (VMs, gateways, load balancers, vaults)
//! - **health** / **usage** / **graph** – resource health, cost and Graph services
//! - **section** – output protocol and bailouts
//! - **agent** – run orchestration and connection test

pub mod error;
pub mod config;
pub mod resource;
pub mod selector;
pub mod section;
pub mod cache;
pub mod context;
pub mod metrics;
pub mod processors;
pub mod health;
pub mod usage;
pub mod graph;
pub mod agent;

pub use context::RunContext;
pub use error::{AgentError, AgentResult};
