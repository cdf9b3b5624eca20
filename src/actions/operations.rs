//! Provider operations
//!
//! Resource types declare their operations in the registry JSON (`stop`,
//! `start`, `terminate`, `delete`, ...) with a batch size, whether later
//! actions may still run on a handled resource, and an optional state
//! pre-condition. Any of them can be used as an action by key.
//!
//! `invoke` hands batches of matched resources to an external function
//! through the same mutating entry point.

use super::{Action, ActionContext, Plan};
use crate::error::{ConfigIssue, ProviderError};
use crate::provider::TargetOutcome;
use crate::resource::model::{scalar_text, AttrPath, Resource};
use crate::resource::registry::{ActionDef, ResourceDef};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Operation declared by a resource type
#[derive(Debug)]
pub struct ProviderOperation {
    def: ActionDef,
    requires: Option<(AttrPath, Vec<String>)>,
    params: Value,
}

impl ProviderOperation {
    /// Remaining options (besides `type`) are passed to the provider as params
    pub fn from_def(
        def: &ActionDef,
        options: &Map<String, Value>,
        location: &str,
    ) -> Result<Self, Vec<ConfigIssue>> {
        let requires = match &def.requires {
            Some(req) => match AttrPath::parse(&req.path) {
                Ok(path) => Some((path, req.values.clone())),
                Err(e) => {
                    return Err(vec![ConfigIssue::new(
                        location,
                        format!("bad state path for {}: {}", def.key, e),
                    )])
                },
            },
            None => None,
        };
        let params: Map<String, Value> = options
            .iter()
            .filter(|(k, _)| k.as_str() != "type")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self {
            def: def.clone(),
            requires,
            params: Value::Object(params),
        })
    }
}

#[async_trait]
impl Action for ProviderOperation {
    fn type_name(&self) -> &str {
        &self.def.key
    }

    fn batch_size(&self) -> usize {
        self.def.batch_size
    }

    fn continuable(&self) -> bool {
        self.def.continuable
    }

    fn plan(&self, resource: &Resource, _ctx: &ActionContext) -> Plan {
        let Some((path, allowed)) = &self.requires else {
            return Plan::Apply;
        };
        let state = resource.lookup(path).value().map(scalar_text);
        match state {
            Some(state) if allowed.iter().any(|a| *a == state) => Plan::Apply,
            Some(state) => Plan::Skip(format!(
                "{} is '{}', {} requires one of {}",
                path,
                state,
                self.def.key,
                allowed.join(", ")
            )),
            None => Plan::Skip(format!("{} is absent", path)),
        }
    }

    async fn process(
        &self,
        batch: &[Arc<Resource>],
        ctx: &ActionContext,
    ) -> Result<Vec<TargetOutcome>, ProviderError> {
        ctx.mutate(ctx.request(&self.def.sdk_method, batch, self.params.clone()))
            .await
    }
}

// ============================================================================
// invoke
// ============================================================================

/// Hand matched resources to an external function
#[derive(Debug)]
pub struct InvokeAction {
    function: String,
    batch_size: usize,
    payload: Value,
}

impl InvokeAction {
    pub fn from_options(
        options: &Map<String, Value>,
        location: &str,
        _resource: &ResourceDef,
    ) -> Result<Self, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        let function = options.get("function").and_then(|v| v.as_str());
        if function.is_none() {
            issues.push(ConfigIssue::new(format!("{}.function", location), "missing required field"));
        }
        let batch_size = match options.get("batch_size") {
            None => 250,
            Some(v) => match v.as_u64() {
                Some(n) if n > 0 => n as usize,
                _ => {
                    issues.push(ConfigIssue::new(
                        format!("{}.batch_size", location),
                        format!("expected a positive integer, got {}", v),
                    ));
                    1
                },
            },
        };
        match (function, issues.is_empty()) {
            (Some(function), true) => Ok(Self {
                function: function.to_string(),
                batch_size,
                payload: options.get("payload").cloned().unwrap_or(Value::Null),
            }),
            _ => Err(issues),
        }
    }
}

#[async_trait]
impl Action for InvokeAction {
    fn type_name(&self) -> &str {
        "invoke"
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn process(
        &self,
        batch: &[Arc<Resource>],
        ctx: &ActionContext,
    ) -> Result<Vec<TargetOutcome>, ProviderError> {
        let params = json!({
            "function": self.function,
            "policy": ctx.policy,
            "payload": self.payload,
            "resources": batch.iter().map(|r| &r.data).collect::<Vec<_>>(),
        });
        ctx.mutate(ctx.request("invoke", batch, params)).await
    }
}
