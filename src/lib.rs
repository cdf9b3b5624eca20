//! Custodian - policy engine for cloud governance
//!
//! Policies select cloud resources of one type, narrow them with a boolean
//! filter tree and apply remediation actions to the matches. Each
//! (policy, account, region) run walks a fixed state machine from
//! resolution through filtering and acting to reporting.
//!
//! # Module Structure
//!
//! - [`policy`] - Policy model, loader, run state machine and engine
//! - [`resource`] - Resource model, registry and cached resolver
//! - [`filters`] - Filter tree and the built-in filter types
//! - [`actions`] - Actions, batching executor and submission gate
//! - [`cache`] - Single-flight cache layer with optional persistence
//! - [`provider`] - Provider contract, in-memory and dry-run clients
//! - [`gcp`] - GCP REST adapter
//! - [`event`] - Trigger events for push-mode runs
//! - [`sink`] - Result sinks
//! - [`config`], [`retry`], [`cancel`], [`error`] - Run plumbing

pub mod actions;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod filters;
pub mod gcp;
pub mod policy;
pub mod provider;
pub mod resource;
pub mod retry;
pub mod sink;

pub use config::RunConfig;
pub use error::{CustodianError, Result};
pub use policy::{Engine, Policy, PolicyCollection, RunReport, RunState};
pub use provider::{ProviderClient, ProviderSet, Scope};

/// Version injected at compile time via CUSTODIAN_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("CUSTODIAN_VERSION") {
    Some(v) => v,
    None => "dev",
};
