use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cancel::CancellationToken;
use crate::domain::SourceKind;
use crate::error::IngestError;
use crate::registry::SessionEnv;
use crate::transport::{Clock, HttpBackend, RetryPolicy, RetrySettings};

pub const DEFAULT_CONFIG_FILE: &str = "indicator-ingest.json";
pub const HDR_API_KEY_ENV: &str = "HDR_API_KEY";

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub geo_tree_url: Option<String>,
    #[serde(default)]
    pub raw_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub output_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub sources: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub kind: SourceKind,
    pub policy: RetryPolicy,
    pub settings: Value,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub default_policy: RetryPolicy,
    pub geo_tree_url: Option<String>,
    pub raw_dir: Option<Utf8PathBuf>,
    pub output_dir: Option<Utf8PathBuf>,
    pub sources: Vec<ResolvedSource>,
    pub api_keys: BTreeMap<SourceKind, String>,
}

impl ResolvedConfig {
    pub fn restrict_to(&mut self, kinds: &[SourceKind]) -> Result<(), IngestError> {
        if kinds.is_empty() {
            return Ok(());
        }
        if let Some(missing) = kinds
            .iter()
            .find(|kind| !self.sources.iter().any(|source| source.kind == **kind))
        {
            return Err(IngestError::InvalidSourceSettings {
                source_name: missing.to_string(),
                message: "not configured".to_string(),
            });
        }
        self.sources.retain(|source| kinds.contains(&source.kind));
        Ok(())
    }

    pub fn session_env(
        &self,
        backend: Arc<dyn HttpBackend>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> SessionEnv {
        let mut env = SessionEnv::new(backend, clock, cancel);
        env.default_policy = self.default_policy.clone();
        env.source_policies = self
            .sources
            .iter()
            .map(|source| (source.kind, source.policy.clone()))
            .collect();
        env.api_keys = self.api_keys.clone();
        env
    }

    pub fn source_settings(&self) -> Vec<(SourceKind, Value)> {
        self.sources
            .iter()
            .map(|source| (source.kind, source.settings.clone()))
            .collect()
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(IngestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| IngestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, IngestError> {
        Self::resolve_config_with(config, |name| std::env::var(name).ok())
    }

    pub fn resolve_config_with(
        config: Config,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ResolvedConfig, IngestError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let default_policy = RetryPolicy::new(&config.retry)?;

        let mut sources: Vec<ResolvedSource> = Vec::new();
        let mut api_keys = BTreeMap::new();
        for (name, block) in config.sources {
            let kind: SourceKind = name.parse()?;
            if sources.iter().any(|source| source.kind == kind) {
                return Err(invalid(kind, "configured more than once"));
            }
            let Value::Object(mut block) = block else {
                return Err(invalid(kind, "source settings must be a JSON object"));
            };

            let policy = match block.remove("retry") {
                Some(overrides) => source_policy(kind, &config.retry, overrides)?,
                None => default_policy.clone(),
            };

            let api_key = match block.remove("api_key") {
                Some(Value::String(key)) if !key.trim().is_empty() => Some(key),
                Some(Value::Null) | Some(Value::String(_)) | None => None,
                Some(_) => return Err(invalid(kind, "api_key must be a string")),
            };
            if kind == SourceKind::Hdr {
                let key = api_key
                    .or_else(|| env(HDR_API_KEY_ENV))
                    .ok_or_else(|| IngestError::MissingApiKey(kind.to_string()))?;
                api_keys.insert(kind, key);
            }

            sources.push(ResolvedSource {
                kind,
                policy,
                settings: Value::Object(block),
            });
        }

        Ok(ResolvedConfig {
            schema_version,
            default_policy,
            geo_tree_url: config.geo_tree_url,
            raw_dir: config.raw_dir,
            output_dir: config.output_dir,
            sources,
            api_keys,
        })
    }
}

fn source_policy(
    kind: SourceKind,
    global: &RetrySettings,
    overrides: Value,
) -> Result<RetryPolicy, IngestError> {
    let Value::Object(overrides) = overrides else {
        return Err(invalid(kind, "retry must be a JSON object"));
    };
    let mut merged = match serde_json::to_value(global) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(err) => return Err(invalid(kind, err.to_string())),
    };
    merged.extend(overrides);
    let settings: RetrySettings =
        serde_json::from_value(Value::Object(merged)).map_err(|err| invalid(kind, err.to_string()))?;
    RetryPolicy::new(&settings)
}

fn invalid(kind: SourceKind, message: impl Into<String>) -> IngestError {
    IngestError::InvalidSourceSettings {
        source_name: kind.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn config(value: Value) -> Config {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn defaults_apply_without_retry_block() {
        let resolved = ConfigLoader::resolve_config_with(
            config(json!({"sources": {"owid": {"datasets": []}}})),
            |_| None,
        )
        .unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.default_policy, RetryPolicy::default());
        assert_eq!(resolved.sources.len(), 1);
        assert_eq!(resolved.sources[0].kind, SourceKind::Owid);
    }

    #[test]
    fn per_source_retry_overrides_global_fields() {
        let resolved = ConfigLoader::resolve_config_with(
            config(json!({
                "retry": {"max_retries": 3, "timeout": 30},
                "sources": {"unsdg": {"indicators": ["1.1.1"], "retry": {"timeout": 90}}}
            })),
            |_| None,
        )
        .unwrap();
        let policy = &resolved.sources[0].policy;
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.timeout(), Duration::from_secs(90));
        assert!(resolved.sources[0].settings.get("retry").is_none());
    }

    #[test]
    fn hdr_key_comes_from_environment_when_absent() {
        let resolved = ConfigLoader::resolve_config_with(
            config(json!({"sources": {"hdr": {"indicators": ["HDI"]}}})),
            |name| (name == HDR_API_KEY_ENV).then(|| "secret".to_string()),
        )
        .unwrap();
        assert_eq!(resolved.api_keys.get(&SourceKind::Hdr).map(String::as_str), Some("secret"));
    }

    #[test]
    fn hdr_without_key_fails() {
        let err = ConfigLoader::resolve_config_with(
            config(json!({"sources": {"hdr": {"indicators": ["HDI"]}}})),
            |_| None,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::MissingApiKey(_)));
    }
}
