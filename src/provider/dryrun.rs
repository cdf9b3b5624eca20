//! Dry-run interception
//!
//! Wraps a provider client for the duration of an action call. Reads pass
//! through; the mutating entry point is intercepted, logged, and answered with
//! a simulated success for every target. Interception never fails.

use super::{ListQuery, MutationRequest, Page, ProviderClient, Scope, TargetOutcome};
use crate::error::ProviderError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Provider handle that suppresses mutating calls
pub struct DryRunClient {
    inner: Arc<dyn ProviderClient>,
    intercepted: Mutex<Vec<MutationRequest>>,
}

impl DryRunClient {
    pub fn new(inner: Arc<dyn ProviderClient>) -> Self {
        Self {
            inner,
            intercepted: Mutex::new(Vec::new()),
        }
    }

    /// Mutations that would have been issued
    pub fn intercepted(&self) -> Vec<MutationRequest> {
        self.intercepted.lock().clone()
    }
}

#[async_trait]
impl ProviderClient for DryRunClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn list(
        &self,
        resource_type: &str,
        scope: &Scope,
        query: &ListQuery,
    ) -> Result<Page, ProviderError> {
        self.inner.list(resource_type, scope, query).await
    }

    async fn describe(
        &self,
        resource_type: &str,
        scope: &Scope,
        id: &str,
    ) -> Result<Option<Value>, ProviderError> {
        self.inner.describe(resource_type, scope, id).await
    }

    async fn mutate(&self, request: &MutationRequest) -> Result<Vec<TargetOutcome>, ProviderError> {
        tracing::info!(
            "[dry-run] would call {} on {} {} target(s) in {}: {:?}",
            request.operation,
            request.targets.len(),
            request.resource_type,
            request.scope,
            request.targets
        );
        self.intercepted.lock().push(request.clone());
        Ok(request.targets.iter().map(|id| TargetOutcome::ok(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;
    use serde_json::json;

    #[tokio::test]
    async fn test_mutations_never_reach_inner_client() {
        let memory = Arc::new(MemoryProvider::new("aws"));
        memory.insert("ec2", json!({"InstanceId": "i-1", "State": {"Name": "running"}}));
        let client = DryRunClient::new(memory.clone());

        let request = MutationRequest {
            operation: "terminate".into(),
            resource_type: "ec2".into(),
            scope: Scope::new("aws", "123", "us-east-1"),
            targets: vec!["i-1".into()],
            params: Value::Null,
        };
        let outcomes = client.mutate(&request).await.unwrap();

        assert_eq!(outcomes, vec![TargetOutcome::ok("i-1")]);
        assert_eq!(memory.mutation_count(), 0);
        assert_eq!(client.intercepted(), vec![request]);
    }
}
