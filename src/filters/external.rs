//! External data for value filters
//!
//! `value_from` loads a list of values from a file or URL and compares the
//! resource attribute against it:
//!
//! ```yaml
//! - type: value
//!   key: OwnerId
//!   op: not-in
//!   value_from:
//!     url: s3-approved-accounts.json
//!     format: json
//!     expr: accounts[].id
//! ```
//!
//! Tables are loaded once per run through the cache layer, before any
//! resource is evaluated. A load failure is a configuration error.

use super::FilterContext;
use crate::cache::{CacheKey, CacheValue};
use crate::error::{ConfigIssue, ConfigurationError, CustodianError};
use crate::provider::Scope;
use crate::resource::model::AttrPath;
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Format of an external table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Json,
    Yaml,
    /// Comma separated; `expr` is a column index or header name
    Csv,
    /// One value per line
    Text,
}

impl DataFormat {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "csv" => Some(Self::Csv),
            "txt" | "text" => Some(Self::Text),
            _ => None,
        }
    }

    fn from_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())?;
        Self::parse(&ext)
    }
}

/// `value_from` options
#[derive(Debug, Clone, PartialEq)]
pub struct ValueFrom {
    pub url: String,
    pub format: DataFormat,
    pub expr: Option<String>,
}

impl ValueFrom {
    pub fn from_value(spec: &Value, location: &str) -> Result<Self, Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        let Some(map) = spec.as_object() else {
            return Err(vec![ConfigIssue::new(location, "expected a mapping")]);
        };

        let url = map.get("url").and_then(|v| v.as_str()).map(|s| s.to_string());
        if url.is_none() {
            issues.push(ConfigIssue::new(format!("{}.url", location), "missing required field"));
        }

        let format = match map.get("format").and_then(|v| v.as_str()) {
            Some(name) => DataFormat::parse(name).or_else(|| {
                issues.push(ConfigIssue::new(
                    format!("{}.format", location),
                    format!("unknown format '{}' (expected json, yaml, csv or txt)", name),
                ));
                None
            }),
            None => url.as_deref().and_then(DataFormat::from_url).or_else(|| {
                if url.is_some() {
                    issues.push(ConfigIssue::new(
                        format!("{}.format", location),
                        "format cannot be inferred from the url",
                    ));
                }
                None
            }),
        };

        let expr = match map.get("expr") {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(other) => {
                issues.push(ConfigIssue::new(
                    format!("{}.expr", location),
                    format!("expected a string or column index, got {}", other),
                ));
                None
            },
        };

        match (url, format) {
            (Some(url), Some(format)) if issues.is_empty() => Ok(Self { url, format, expr }),
            _ => Err(issues),
        }
    }

    fn cache_key(&self) -> CacheKey {
        let scope = Scope::new("external", "", "");
        CacheKey::new(
            &scope,
            "value_from",
            format!("{:?}|{}|{}", self.format, self.url, self.expr.as_deref().unwrap_or("")),
        )
    }

    /// Turn raw content into the list of values
    pub fn parse(&self, content: &str) -> anyhow::Result<Value> {
        let values = match self.format {
            DataFormat::Json => {
                let doc: Value = serde_json::from_str(content).context("invalid JSON")?;
                self.select(doc)?
            },
            DataFormat::Yaml => {
                let doc: Value = serde_yaml::from_str(content).context("invalid YAML")?;
                self.select(doc)?
            },
            DataFormat::Csv => self.csv_column(content)?,
            DataFormat::Text => content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| Value::String(l.to_string()))
                .collect(),
        };
        Ok(Value::Array(values))
    }

    fn select(&self, doc: Value) -> anyhow::Result<Vec<Value>> {
        let selected = match &self.expr {
            Some(expr) => {
                let path = AttrPath::parse(expr).map_err(|e| anyhow::anyhow!(e))?;
                if path.is_projection() {
                    path.collect(&doc).into_iter().cloned().collect()
                } else {
                    match path.resolve(&doc).into_owned() {
                        Some(Value::Array(items)) => items,
                        Some(Value::Object(map)) => map.keys().map(|k| Value::String(k.clone())).collect(),
                        Some(other) => vec![other],
                        None => bail!("expression '{}' matched nothing", expr),
                    }
                }
            },
            None => match doc {
                Value::Array(items) => items,
                Value::Object(map) => map.into_iter().map(|(k, _)| Value::String(k)).collect(),
                other => vec![other],
            },
        };
        Ok(selected)
    }

    fn csv_column(&self, content: &str) -> anyhow::Result<Vec<Value>> {
        let mut rows = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(split_csv_line);

        let column = match self.expr.as_deref() {
            None => 0,
            Some(expr) => match expr.parse::<usize>() {
                Ok(idx) => idx,
                Err(_) => {
                    let header = rows.next().context("empty csv")?;
                    header
                        .iter()
                        .position(|h| h == expr)
                        .with_context(|| format!("csv has no column '{}'", expr))?
                },
            },
        };

        Ok(rows
            .filter_map(|row| row.into_iter().nth(column))
            .map(Value::String)
            .collect())
    }
}

fn split_csv_line(line: &str) -> Vec<String> {
    line.split(',')
        .map(|cell| cell.trim().trim_matches('"').to_string())
        .collect()
}

/// Loader for `value_from` URLs
#[async_trait]
pub trait ExternalDataSource: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<String>;
}

/// Reads local paths (`file://` or plain) and HTTP(S) URLs
#[derive(Debug, Clone, Default)]
pub struct DefaultDataSource {
    http: reqwest::Client,
}

impl DefaultDataSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExternalDataSource for DefaultDataSource {
    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        if url.starts_with("http://") || url.starts_with("https://") {
            tracing::debug!("GET {}", url);
            let response = self
                .http
                .get(url)
                .send()
                .await
                .with_context(|| format!("Failed to fetch {}", url))?;
            let status = response.status();
            if !status.is_success() {
                bail!("GET {} returned {}", url, status);
            }
            return response.text().await.context("Failed to read response body");
        }

        let path = url.strip_prefix("file://").unwrap_or(url);
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }
}

/// Load (or reuse) the table of a `value_from` spec
pub async fn load_external(
    value_from: &ValueFrom,
    ctx: &FilterContext,
) -> Result<Arc<CacheValue>, CustodianError> {
    let key = value_from.cache_key();
    ctx.resolver
        .cache()
        .get_or_fetch(&key, || async {
            let content = ctx
                .data_source
                .fetch(&value_from.url)
                .await
                .and_then(|content| value_from.parse(&content));
            match content {
                Ok(values) => {
                    tracing::debug!(
                        "Loaded {} external value(s) from {}",
                        values.as_array().map_or(0, |a| a.len()),
                        value_from.url
                    );
                    Ok(CacheValue::Blob(values))
                },
                Err(e) => Err(CustodianError::from(ConfigurationError::single(
                    "value_from.url",
                    format!("failed to load {}: {:#}", value_from.url, e),
                ))),
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(v: Value) -> ValueFrom {
        ValueFrom::from_value(&v, "value_from").unwrap()
    }

    #[test]
    fn test_format_inferred_from_url() {
        assert_eq!(spec(json!({"url": "accounts.json"})).format, DataFormat::Json);
        assert_eq!(spec(json!({"url": "https://x/list.txt?v=1"})).format, DataFormat::Text);
        let err = ValueFrom::from_value(&json!({"url": "noext"}), "f.value_from").unwrap_err();
        assert_eq!(err[0].location, "f.value_from.format");
    }

    #[test]
    fn test_parse_json_expr() {
        let vf = spec(json!({"url": "a.json", "expr": "accounts[].id"}));
        let parsed = vf
            .parse(r#"{"accounts": [{"id": "111"}, {"id": "222"}]}"#)
            .unwrap();
        assert_eq!(parsed, json!(["111", "222"]));

        let vf = spec(json!({"url": "a.yaml"}));
        assert_eq!(vf.parse("- a\n- b\n").unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn test_parse_csv_and_text() {
        let vf = spec(json!({"url": "a.csv", "expr": "owner"}));
        let parsed = vf.parse("id,owner\n1,alice\n2,\"bob\"\n").unwrap();
        assert_eq!(parsed, json!(["alice", "bob"]));

        let vf = spec(json!({"url": "a.csv", "expr": 0}));
        assert_eq!(vf.parse("x,1\ny,2").unwrap(), json!(["x", "y"]));

        let vf = spec(json!({"url": "a.txt"}));
        assert_eq!(vf.parse("one\n\n two \n").unwrap(), json!(["one", "two"]));
    }

    #[tokio::test]
    async fn test_default_source_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.txt");
        std::fs::write(&path, "i-1\ni-2\n").unwrap();

        let source = DefaultDataSource::new();
        let content = source.fetch(&format!("file://{}", path.display())).await.unwrap();
        assert_eq!(content, "i-1\ni-2\n");
        assert!(source.fetch("/definitely/not/here.txt").await.is_err());
    }
}
