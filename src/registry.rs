//! Static catalog of the models this host can serve.
//!
//! Each [`ModelSpec`] carries a pre-measured reserved memory budget which is
//! the only number admission arithmetic ever uses. The catalog is loaded once
//! at boot and never mutated afterwards.
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A model that can be loaded onto the GPU by a dedicated backend process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct ModelSpec {
    /// Unique name clients use to address the model.
    #[builder(into)]
    pub name: String,
    /// Reserved GPU memory for this model, in GB.
    pub required_memory_gb: f64,
    /// Key the artifact store uses to locate the weights (e.g. a HF repo id).
    #[builder(into)]
    pub artifact_key: String,
    /// Rough cold-start time, reported to clients for progress display.
    #[serde(default)]
    #[builder(default)]
    pub estimated_load_time_seconds: u64,
    #[serde(default)]
    #[builder(default, into)]
    pub description: String,
    /// Name of the backend process the controller manages. Defaults to `name`.
    #[serde(default)]
    #[builder(into)]
    pub container: Option<String>,
}

impl ModelSpec {
    /// The process name handed to the process controller.
    pub fn process_name(&self) -> &str {
        self.container.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("model name must not be empty")]
    EmptyName,

    #[error("duplicate model name: {0}")]
    DuplicateName(String),

    #[error("model {name} must reserve a positive amount of memory, got {required_memory_gb}GB")]
    InvalidMemory { name: String, required_memory_gb: f64 },

    #[error("model {0} has no artifact key")]
    MissingArtifact(String),
}

/// Immutable, validated set of [`ModelSpec`]s in configuration order.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    specs: Vec<ModelSpec>,
    by_name: HashMap<String, usize>,
    by_lower_name: HashMap<String, usize>,
}

impl ModelRegistry {
    pub fn new(specs: Vec<ModelSpec>) -> Result<Self, RegistryError> {
        let mut by_name = HashMap::with_capacity(specs.len());
        let mut by_lower_name = HashMap::with_capacity(specs.len());

        for (idx, spec) in specs.iter().enumerate() {
            if spec.name.trim().is_empty() {
                return Err(RegistryError::EmptyName);
            }
            // NaN fails this comparison too
            if !(spec.required_memory_gb > 0.0) {
                return Err(RegistryError::InvalidMemory {
                    name: spec.name.clone(),
                    required_memory_gb: spec.required_memory_gb,
                });
            }
            if spec.artifact_key.trim().is_empty() {
                return Err(RegistryError::MissingArtifact(spec.name.clone()));
            }
            if by_lower_name
                .insert(spec.name.to_lowercase(), idx)
                .is_some()
            {
                return Err(RegistryError::DuplicateName(spec.name.clone()));
            }
            by_name.insert(spec.name.clone(), idx);
        }

        Ok(Self {
            specs,
            by_name,
            by_lower_name,
        })
    }

    /// Look up a model by name, falling back to a case-insensitive match.
    pub fn resolve(&self, name: &str) -> Option<&ModelSpec> {
        self.by_name
            .get(name)
            .or_else(|| self.by_lower_name.get(&name.to_lowercase()))
            .map(|&idx| &self.specs[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelSpec> {
        self.specs.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    /// Reserved memory for a model, or zero if it is not registered.
    pub fn reserved_gb(&self, name: &str) -> f64 {
        self.by_name
            .get(name)
            .map(|&idx| self.specs[idx].required_memory_gb)
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
