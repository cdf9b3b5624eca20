//! GCP provider adapter
//!
//! REST implementation of the provider contract for Compute Engine, Cloud
//! Storage and GKE.
//!
//! # Module Structure
//!
//! - [`auth`] - Token sources (Application Default Credentials, fixed tokens)
//! - [`client`] - [`GcpProvider`], the `ProviderClient` implementation
//! - [`dispatch`] - Operation to REST call mapping and response reshaping
//! - [`http`] - HTTP transport and error classification
//!
//! # Example
//!
//! ```ignore
//! use custodian::gcp::GcpProvider;
//! use custodian::provider::{ListQuery, ProviderClient, Scope};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let gcp = GcpProvider::new().await?;
//!     let scope = Scope::new("gcp", "my-project", "us-central1");
//!     let page = gcp.list("instance", &scope, &ListQuery::default()).await?;
//!     println!("{} instance(s)", page.items.len());
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod dispatch;
pub mod http;

pub use auth::{get_default_project, StaticToken, TokenSource};
pub use client::GcpProvider;
pub use dispatch::Endpoints;
