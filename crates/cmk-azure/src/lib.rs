//! # cmk-azure
//!
//! Azure Resource Manager and Microsoft Graph REST layer for the Azure
//! monitoring agent.
//!
//! ## Features
//!
//! - **Authentication** – AAD client-credentials login against the global or China cloud
//! - **Requests** – bearer headers, 429 cool-off, remaining-reads tracking, pagination
//! - **Resources** – subscriptions, resources, resource groups, VM statuses, resource health
//! - **Networking** – application gateways, load balancers, public IPs, NIC configs, VPN gateways
//! - **Monitor** – batched `metrics:getBatch` queries with metric-name fallback
//! - **Recovery Services** – backup protected items
//! - **Cost Management** – daily usage query with throttling handling
//! - **Graph** – users count, organization, application registrations

pub mod types;
pub mod client;
pub mod auth;
pub mod resource_id;
pub mod resources;
pub mod networking;
pub mod monitor;
pub mod recovery;
pub mod cost;
pub mod graph;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{ApiCall, AzureClient, HttpTransport, Transport};
pub use types::{AzureError, AzureErrorKind, AzureResult};
