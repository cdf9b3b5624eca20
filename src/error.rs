//! Error Taxonomy
//!
//! Typed errors for the policy engine. Fatal errors stop the state machine of
//! the scope they occur in; non-fatal errors are accumulated into the run
//! report.

use crate::provider::Scope;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Top-level error for the engine
#[derive(Debug, Error, Clone)]
pub enum CustodianError {
    /// Bad policy document or filter/action options (fatal, pre-execution)
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Provider listing/describe failure after retries (fatal to the scope)
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// A filter could not evaluate a resource (the resource fails the filter)
    #[error(transparent)]
    FilterEvaluation(#[from] FilterEvaluationError),

    /// A mutating call failed after retries (recorded per resource)
    #[error(transparent)]
    Action(#[from] ActionError),

    /// Operator abort or run timeout (fatal to the run)
    #[error(transparent)]
    Cancelled(#[from] CancellationError),
}

impl CustodianError {
    /// Whether this error stops the state machine of the current scope
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Resolution(_) | Self::Cancelled(_)
        )
    }

    /// Short machine-readable kind, used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Resolution(_) => "resolution",
            Self::FilterEvaluation(_) => "filter-evaluation",
            Self::Action(_) => "action",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

/// One offending field in a policy document or option block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Location of the field, e.g. `policies[0].filters[2].op`
    pub location: String,
    pub message: String,
}

impl ConfigIssue {
    pub fn new(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// Configuration error enumerating every offending field
#[derive(Debug, Clone, Error)]
#[error("invalid configuration ({} issue(s)):\n{}", .issues.len(), render_issues(.issues))]
pub struct ConfigurationError {
    pub issues: Vec<ConfigIssue>,
}

impl ConfigurationError {
    pub fn new(issues: Vec<ConfigIssue>) -> Self {
        Self { issues }
    }

    pub fn single(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![ConfigIssue::new(location, message)],
        }
    }
}

fn render_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("  - {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Listing/describe failure after retry exhaustion
#[derive(Debug, Clone, Error)]
#[error("failed to resolve {resource_type} in {scope} after {attempts} attempt(s): {source}")]
pub struct ResolutionError {
    pub scope: Scope,
    pub resource_type: String,
    pub attempts: u32,
    #[source]
    pub source: ProviderError,
}

/// A filter raised on malformed resource data
#[derive(Debug, Clone, Error)]
#[error("filter '{filter}' failed on resource {resource_id}: {message}")]
pub struct FilterEvaluationError {
    pub filter: String,
    pub resource_id: String,
    pub message: String,
}

/// Mutating call failure after retry
#[derive(Debug, Clone, Error)]
#[error("action '{action}' failed{}: {message}", on_target(.resource_id))]
pub struct ActionError {
    pub action: String,
    pub resource_id: Option<String>,
    pub message: String,
}

fn on_target(resource_id: &Option<String>) -> String {
    match resource_id {
        Some(id) => format!(" on {}", id),
        None => String::new(),
    }
}

/// The run was aborted
#[derive(Debug, Clone, Error)]
#[error("run cancelled during {stage}")]
pub struct CancellationError {
    pub stage: String,
}

impl CancellationError {
    pub fn during(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
        }
    }
}

/// Uniform classification of provider failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Rate limiting, throttling, 5xx - worth retrying
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Bad request, permission denied, unsupported operation
    #[error("provider error: {0}")]
    Permanent(String),

    /// The call did not complete within the configured timeout
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    /// The referenced resource does not exist
    #[error("not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Convenience alias used across the engine
pub type Result<T, E = CustodianError> = std::result::Result<T, E>;
