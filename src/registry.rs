use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::domain::SourceKind;
use crate::error::IngestError;
use crate::sources::DataSource;
use crate::sources::hdr::HdrSource;
use crate::sources::nd_gain::NdGainSource;
use crate::sources::owid::OwidSource;
use crate::sources::un_sdg::UnSdgSource;
use crate::sources::world_bank::WorldBankSource;
use crate::transport::{Clock, HttpBackend, RetryPolicy, RetryingTransport};

#[derive(Clone)]
pub struct SessionEnv {
    pub backend: Arc<dyn HttpBackend>,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancellationToken,
    pub default_policy: RetryPolicy,
    pub source_policies: BTreeMap<SourceKind, RetryPolicy>,
    pub api_keys: BTreeMap<SourceKind, String>,
}

impl SessionEnv {
    pub fn new(backend: Arc<dyn HttpBackend>, clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Self {
            backend,
            clock,
            cancel,
            default_policy: RetryPolicy::default(),
            source_policies: BTreeMap::new(),
            api_keys: BTreeMap::new(),
        }
    }

    pub fn policy(&self, kind: SourceKind) -> &RetryPolicy {
        self.source_policies.get(&kind).unwrap_or(&self.default_policy)
    }

    pub fn api_key(&self, kind: SourceKind) -> Option<&str> {
        self.api_keys.get(&kind).map(String::as_str)
    }

    pub fn transport(&self, kind: SourceKind) -> RetryingTransport {
        RetryingTransport::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.clock),
            self.policy(kind).clone(),
            self.cancel.clone(),
        )
    }

    pub fn shared_transport(&self) -> RetryingTransport {
        RetryingTransport::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.clock),
            self.default_policy.clone(),
            self.cancel.clone(),
        )
    }
}

pub type SourceConstructor = fn(Value, &SessionEnv) -> Result<Box<dyn DataSource>, IngestError>;

pub struct SourceRegistry {
    constructors: BTreeMap<SourceKind, SourceConstructor>,
}

impl SourceRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(SourceKind::WorldBank, build_world_bank);
        registry.register(SourceKind::UnSdg, build_un_sdg);
        registry.register(SourceKind::NdGain, build_nd_gain);
        registry.register(SourceKind::Hdr, build_hdr);
        registry.register(SourceKind::Owid, build_owid);
        registry
    }

    pub fn register(&mut self, kind: SourceKind, constructor: SourceConstructor) {
        self.constructors.insert(kind, constructor);
    }

    pub fn kinds(&self) -> impl Iterator<Item = SourceKind> + '_ {
        self.constructors.keys().copied()
    }

    pub fn contains(&self, kind: SourceKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    pub fn build(
        &self,
        kind: SourceKind,
        settings: Value,
        env: &SessionEnv,
    ) -> Result<Box<dyn DataSource>, IngestError> {
        let constructor = self
            .constructors
            .get(&kind)
            .ok_or_else(|| IngestError::UnknownSource(kind.to_string()))?;
        constructor(settings, env)
    }

    /// Builds every configured source up front so that a bad entry fails the
    /// run before any request is made.
    pub fn build_all(
        &self,
        configured: Vec<(SourceKind, Value)>,
        env: &SessionEnv,
    ) -> Result<Vec<Box<dyn DataSource>>, IngestError> {
        configured
            .into_iter()
            .map(|(kind, settings)| self.build(kind, settings, env))
            .collect()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn build_world_bank(settings: Value, env: &SessionEnv) -> Result<Box<dyn DataSource>, IngestError> {
    let transport = env.transport(SourceKind::WorldBank);
    Ok(Box::new(WorldBankSource::from_value(settings, transport)?))
}

fn build_un_sdg(settings: Value, env: &SessionEnv) -> Result<Box<dyn DataSource>, IngestError> {
    let transport = env.transport(SourceKind::UnSdg);
    Ok(Box::new(UnSdgSource::from_value(settings, transport)?))
}

fn build_nd_gain(settings: Value, env: &SessionEnv) -> Result<Box<dyn DataSource>, IngestError> {
    let transport = env.transport(SourceKind::NdGain);
    Ok(Box::new(NdGainSource::from_value(settings, transport)?))
}

fn build_hdr(settings: Value, env: &SessionEnv) -> Result<Box<dyn DataSource>, IngestError> {
    let transport = env.transport(SourceKind::Hdr);
    let api_key = env.api_key(SourceKind::Hdr).map(str::to_string);
    Ok(Box::new(HdrSource::from_value(settings, api_key, transport)?))
}

fn build_owid(settings: Value, env: &SessionEnv) -> Result<Box<dyn DataSource>, IngestError> {
    let transport = env.transport(SourceKind::Owid);
    Ok(Box::new(OwidSource::from_value(settings, transport)?))
}
