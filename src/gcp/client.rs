//! GCP Client
//!
//! [`GcpProvider`] implements the provider contract over the Compute Engine,
//! Cloud Storage and GKE REST APIs. The scope account is the project id;
//! zonal resources are listed per region through the aggregated endpoints.
//!
//! Mutating calls return long-running operations which are not awaited.

use super::auth::{GcpCredentials, StaticToken, TokenSource};
use super::dispatch::{self, ApiCall, Endpoints, Placement};
use super::http::GcpHttpClient;
use crate::error::ProviderError;
use crate::provider::{ListQuery, MutationRequest, Page, ProviderClient, Scope, TargetOutcome};
use crate::resource::registry::{get_registry, qualify_for, ResourceDef};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Provider name of this adapter
pub const PROVIDER: &str = "gcp";

/// Main GCP client
#[derive(Clone)]
pub struct GcpProvider {
    http: GcpHttpClient,
    tokens: Arc<dyn TokenSource>,
    endpoints: Endpoints,
}

impl GcpProvider {
    /// Client using `GOOGLE_OAUTH_ACCESS_TOKEN` when set, Application
    /// Default Credentials otherwise
    pub async fn new() -> Result<Self> {
        let tokens: Arc<dyn TokenSource> = match StaticToken::from_env() {
            Some(token) => Arc::new(token),
            None => Arc::new(
                GcpCredentials::new()
                    .await
                    .context("Failed to initialize GCP credentials")?,
            ),
        };
        Self::with_token_source(tokens, Endpoints::default())
    }

    pub fn with_token_source(tokens: Arc<dyn TokenSource>, endpoints: Endpoints) -> Result<Self> {
        Ok(Self {
            http: GcpHttpClient::new()?,
            tokens,
            endpoints,
        })
    }

    fn definition(resource_type: &str) -> Result<&'static ResourceDef, ProviderError> {
        let key = qualify_for(PROVIDER, resource_type);
        get_registry()
            .resources
            .get(&key)
            .filter(|def| def.provider == PROVIDER)
            .ok_or_else(|| ProviderError::Permanent(format!("unsupported resource type {}", key)))
    }

    async fn token(&self) -> Result<String, ProviderError> {
        self.tokens
            .token()
            .await
            .map_err(|e| ProviderError::Permanent(format!("authentication failed: {:#}", e)))
    }

    async fn call(&self, call: ApiCall) -> Result<Value, ProviderError> {
        let token = self.token().await?;
        self.http.send(call.method, &call.url, &token, call.body.as_ref()).await
    }

    async fn get(&self, url: &str) -> Result<Value, ProviderError> {
        let token = self.token().await?;
        self.http.get(url, &token).await
    }

    /// Current records of `names` in the zones of the scope region
    async fn find_zonal(
        &self,
        def: &ResourceDef,
        placement: Placement,
        scope: &Scope,
        names: &[String],
    ) -> Result<HashMap<String, Value>, ProviderError> {
        let mut found = HashMap::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = dispatch::list_url(
                &self.endpoints,
                placement,
                &scope.account,
                page_token.as_deref(),
                Some(names),
            );
            let response = self.get(&url).await?;
            for item in dispatch::extract_items(&response, placement, &def.response_path, &scope.region) {
                if let Some(name) = item.get(&def.id_field).and_then(|v| v.as_str()) {
                    found.insert(name.to_string(), item.clone());
                }
            }
            page_token = dispatch::next_page_token(&response);
            if page_token.is_none() {
                break;
            }
        }
        Ok(found)
    }

    /// Current records of the mutation targets, when the operation needs them
    async fn target_records(
        &self,
        def: &ResourceDef,
        placement: Placement,
        request: &MutationRequest,
    ) -> Result<HashMap<String, Value>, ProviderError> {
        if !placement.needs_record(&request.operation) {
            return Ok(HashMap::new());
        }
        if let Placement::Zonal(_) = placement {
            return self.find_zonal(def, placement, &request.scope, &request.targets).await;
        }
        let mut records = HashMap::new();
        for id in &request.targets {
            if let Some(record) = self.describe(&def.key, &request.scope, id).await? {
                records.insert(id.clone(), record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl ProviderClient for GcpProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list(&self, resource_type: &str, scope: &Scope, query: &ListQuery) -> Result<Page, ProviderError> {
        let def = Self::definition(resource_type)?;
        let placement = Placement::of(&def.sdk_method)?;
        let url = dispatch::list_url(
            &self.endpoints,
            placement,
            &scope.account,
            query.page_token.as_deref(),
            query.ids.as_deref(),
        );
        let response = self.get(&url).await?;
        Ok(Page {
            items: dispatch::extract_items(&response, placement, &def.response_path, &scope.region),
            next_token: dispatch::next_page_token(&response),
        })
    }

    async fn describe(&self, resource_type: &str, scope: &Scope, id: &str) -> Result<Option<Value>, ProviderError> {
        let def = Self::definition(resource_type)?;
        let placement = Placement::of(&def.sdk_method)?;
        let Some(url) = dispatch::describe_url(&self.endpoints, placement, &scope.account, id) else {
            let mut found = self.find_zonal(def, placement, scope, &[id.to_string()]).await?;
            return Ok(found.remove(id));
        };
        match self.get(&url).await {
            Ok(record) => Ok(Some(dispatch::enrich(record))),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn mutate(&self, request: &MutationRequest) -> Result<Vec<TargetOutcome>, ProviderError> {
        let def = Self::definition(&request.resource_type)?;
        let placement = Placement::of(&def.sdk_method)?;
        let records = self.target_records(def, placement, request).await?;

        let calls = request.targets.iter().map(|id| {
            let record = records.get(id);
            async move {
                if placement.needs_record(&request.operation) && record.is_none() {
                    return Err(ProviderError::NotFound(format!("{} not found in {}", id, request.scope)));
                }
                let call = dispatch::mutation_call(
                    &self.endpoints,
                    placement,
                    &request.scope.account,
                    &request.operation,
                    id,
                    record,
                    &request.params,
                )?;
                tracing::info!("{} {} {} in {}", request.operation, def.key, id, request.scope);
                self.call(call).await.map(|_| ())
            }
        });
        let results = join_all(calls).await;

        // A batch that failed entirely on a transient error is retried as a whole
        if results.iter().all(|r| r.is_err()) {
            if let Some(Err(e)) = results.iter().find(|r| matches!(r, Err(e) if e.is_transient())) {
                return Err(e.clone());
            }
        }

        Ok(request
            .targets
            .iter()
            .zip(results)
            .map(|(id, result)| match result {
                Ok(()) => TargetOutcome::ok(id),
                Err(e) => TargetOutcome::failed(id, e.to_string()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_lookup() {
        assert_eq!(GcpProvider::definition("instance").unwrap().key, "gcp.instance");
        assert_eq!(GcpProvider::definition("gcp.bucket").unwrap().key, "gcp.bucket");
        assert!(GcpProvider::definition("aws.ec2").is_err());
    }
}
