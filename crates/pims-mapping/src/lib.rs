//! Metadata-driven schema mapping: resolves, per insurer and policy type,
//! the ordered field-mapping rules that turn source columns into canonical
//! fields. Dynamic (admin-edited) configuration wins over the static YAML
//! file; the pipeline never guesses field semantics.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use pims_core::FieldMapping;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "pims-mapping";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("insurer {0} has no mapping configuration")]
    UnknownInsurer(String),
    #[error("no field mappings for insurer {insurer_id}, policy type {policy_type}")]
    NoMappings {
        insurer_id: String,
        policy_type: String,
    },
}

#[derive(Debug, Error)]
#[error("mapping store unavailable: {0}")]
pub struct MappingStoreError(#[from] pub anyhow::Error);

/// Dynamic mapping configuration, persisted and admin-editable. A store
/// error is treated as "not configured there" by the resolver; the static
/// file remains the source of truth of last resort.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn mappings(
        &self,
        insurer_id: &str,
        policy_type: &str,
    ) -> Result<Option<Vec<FieldMapping>>, MappingStoreError>;

    /// Configured policy types for the insurer, in configuration order.
    async fn policy_types(&self, insurer_id: &str) -> Result<Vec<String>, MappingStoreError>;

    async fn insurer_ids(&self) -> Result<Vec<String>, MappingStoreError>;
}

#[derive(Debug, Clone, Deserialize)]
struct MappingConfigFile {
    #[serde(default)]
    insurers: Vec<InsurerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct InsurerEntry {
    insurer_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    insurer_name: Option<String>,
    #[serde(default)]
    policy_types: Vec<PolicyTypeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct PolicyTypeEntry {
    policy_type: String,
    #[serde(default)]
    field_mappings: Vec<FieldMapping>,
}

/// Static declarative mapping configuration loaded from YAML. Insurers and
/// policy types are lists, so "first configured" follows file order.
#[derive(Debug, Clone, Default)]
pub struct StaticMappingConfig {
    insurers: Vec<InsurerEntry>,
}

impl StaticMappingConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: MappingConfigFile =
            serde_yaml::from_str(text).context("parsing insurer field-mapping YAML")?;
        Ok(Self {
            insurers: file.insurers,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = Self::from_yaml(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        info!(
            insurers = config.insurers.len(),
            path = %path.display(),
            "loaded static mapping configuration"
        );
        Ok(config)
    }

    pub fn has_insurer(&self, insurer_id: &str) -> bool {
        self.insurers.iter().any(|i| i.insurer_id == insurer_id)
    }

    pub fn insurer_ids(&self) -> Vec<String> {
        self.insurers.iter().map(|i| i.insurer_id.clone()).collect()
    }

    pub fn policy_types(&self, insurer_id: &str) -> Vec<String> {
        self.insurers
            .iter()
            .filter(|i| i.insurer_id == insurer_id)
            .flat_map(|i| i.policy_types.iter().map(|p| p.policy_type.clone()))
            .collect()
    }

    pub fn mappings(&self, insurer_id: &str, policy_type: &str) -> Option<Vec<FieldMapping>> {
        self.insurers
            .iter()
            .find(|i| i.insurer_id == insurer_id)?
            .policy_types
            .iter()
            .find(|p| p.policy_type == policy_type)
            .map(|p| p.field_mappings.clone())
    }
}

/// Read-mostly lookup table combining the dynamic store and the static
/// file. Constructed explicitly and shared by reference; reloading the
/// static side is an explicit operation.
pub struct MappingResolver {
    store: Option<Arc<dyn MappingStore>>,
    static_config: RwLock<StaticMappingConfig>,
}

impl MappingResolver {
    pub fn new(static_config: StaticMappingConfig) -> Self {
        Self {
            store: None,
            static_config: RwLock::new(static_config),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MappingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Swap in a freshly parsed static configuration.
    pub fn reload_static(&self, config: StaticMappingConfig) {
        *self.static_config.write().expect("static config lock poisoned") = config;
    }

    /// Resolve the effective policy type for an upload. The hint wins when
    /// it is actually configured; otherwise the insurer's first configured
    /// policy type is used. An unconfigured insurer is an explicit error.
    pub async fn resolve_policy_type(
        &self,
        insurer_id: &str,
        hint: Option<&str>,
    ) -> Result<String, ConfigError> {
        let mut configured = Vec::new();
        if let Some(store) = &self.store {
            match store.policy_types(insurer_id).await {
                Ok(types) => configured.extend(types),
                Err(err) => debug!(insurer_id, %err, "dynamic store lookup failed, using static config"),
            }
        }
        {
            let config = self.static_config.read().expect("static config lock poisoned");
            for policy_type in config.policy_types(insurer_id) {
                if !configured.contains(&policy_type) {
                    configured.push(policy_type);
                }
            }
        }
        if configured.is_empty() {
            return Err(ConfigError::UnknownInsurer(insurer_id.to_string()));
        }
        if let Some(hint) = hint {
            let hint = hint.trim();
            if !hint.is_empty() && configured.iter().any(|t| t == hint) {
                return Ok(hint.to_string());
            }
        }
        Ok(configured.remove(0))
    }

    /// Ordered field mappings for (insurer, policy type): dynamic store
    /// first, static YAML as fallback. An empty result is terminal for the
    /// processing run.
    pub async fn resolve_mappings(
        &self,
        insurer_id: &str,
        policy_type: &str,
    ) -> Result<Vec<FieldMapping>, ConfigError> {
        if let Some(store) = &self.store {
            match store.mappings(insurer_id, policy_type).await {
                Ok(Some(mappings)) if !mappings.is_empty() => {
                    debug!(insurer_id, policy_type, rules = mappings.len(), "mappings from dynamic store");
                    return Ok(mappings);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(insurer_id, policy_type, %err, "dynamic store lookup failed, using static config")
                }
            }
        }
        let from_static = {
            let config = self.static_config.read().expect("static config lock poisoned");
            config.mappings(insurer_id, policy_type)
        };
        match from_static {
            Some(mappings) if !mappings.is_empty() => Ok(mappings),
            _ => Err(ConfigError::NoMappings {
                insurer_id: insurer_id.to_string(),
                policy_type: policy_type.to_string(),
            }),
        }
    }

    pub async fn list_insurer_ids(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();
        if let Some(store) = &self.store {
            if let Ok(from_store) = store.insurer_ids().await {
                ids.extend(from_store);
            }
        }
        let config = self.static_config.read().expect("static config lock poisoned");
        ids.extend(config.insurer_ids());
        ids.into_iter().collect()
    }
}
