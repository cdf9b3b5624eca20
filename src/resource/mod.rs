//! Resource abstraction layer
//!
//! Resource types are data-driven: definitions are loaded from JSON files at
//! compile time, so a new type needs no code changes unless it brings a new
//! provider operation.
//!
//! # Architecture
//!
//! - [`model`] - Normalized resource and attribute path resolution
//! - [`registry`] - Loads resource definitions from embedded JSON
//! - [`resolver`] - Lists/describes resources through a provider client, cache first
//!
//! # Resource Definitions
//!
//! Resources are defined in JSON files under `src/resources/`:
//! - `aws.json` - EC2, EBS, VPC networking, KMS, EKS, ...
//! - `gcp.json` - Compute Engine, Cloud Storage, GKE
//!
//! # Example
//!
//! ```ignore
//! use custodian::resource::{get_resource, Resolver};
//!
//! async fn running(resolver: &Resolver, scope: &Scope) -> custodian::error::Result<usize> {
//!     let set = resolver.resolve("ec2", scope).await?;
//!     Ok(set.iter().filter(|r| r.get("State.Name").value() == Some(&"running".into())).count())
//! }
//! ```

pub mod model;
pub mod registry;
pub mod resolver;

pub use model::{AttrPath, Lookup, Resource};
pub use registry::*;
pub use resolver::{effective_scope, Resolver, GLOBAL_REGION};
