//! Recipes: named workload templates and their resolution into concrete
//! submission specs.
//!
//! The scheduler never sees a recipe, only the [`ResolvedSpec`] produced by
//! merging a recipe with the caller's override.

pub mod catalog;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::ServiceKind;

pub use catalog::RecipeCatalog;

#[derive(Error, Debug)]
pub enum RecipeError {
    #[error("Recipe '{0}' not found")]
    NotFound(String),

    #[error("Invalid recipe '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("Failed to read recipe: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse recipe: {0}")]
    Parse(String),
}

/// Compute resources requested from the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Memory in scheduler notation (e.g. "64G")
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default)]
    pub gpu: u32,
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    /// Wall-clock limit in scheduler notation (e.g. "02:00:00")
    #[serde(default = "default_time_limit")]
    pub time_limit: String,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory: default_memory(),
            gpu: 0,
            nodes: default_nodes(),
            time_limit: default_time_limit(),
        }
    }
}

fn default_cpu() -> u32 {
    4
}

fn default_memory() -> String {
    "16G".to_string()
}

fn default_nodes() -> u32 {
    1
}

fn default_time_limit() -> String {
    "01:00:00".to_string()
}

/// Partial resource override supplied by a caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<String>,
}

/// Caller-supplied changes on top of a recipe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOverride {
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceOverride,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// A named workload template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    #[serde(default)]
    pub kind: ServiceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Shell command run inside the allocation; `$SERVICE_PORT` is exported
    pub command: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
}

/// Concrete submission payload, treated as opaque by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSpec {
    pub kind: ServiceKind,
    pub command: String,
    pub environment: BTreeMap<String, String>,
    pub resources: Resources,
}

/// Turns a recipe name plus override into a [`ResolvedSpec`]
pub trait RecipeResolver: Send + Sync {
    fn resolve(
        &self,
        name: &str,
        config_override: Option<&ConfigOverride>,
    ) -> Result<ResolvedSpec, RecipeError>;

    /// Names of all known recipes
    fn names(&self) -> Vec<String>;
}

// ============================================================================
// Pure merge and validation logic
// ============================================================================

fn time_limit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+-)?\d{1,2}(:\d{2}){0,2}$").expect("valid time limit pattern")
    })
}

fn memory_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+[KMGT]?$").expect("valid memory pattern"))
}

/// Merge a recipe with an optional override
pub fn merge(
    recipe: &Recipe,
    config_override: Option<&ConfigOverride>,
) -> Result<ResolvedSpec, RecipeError> {
    let mut spec = ResolvedSpec {
        kind: recipe.kind,
        command: recipe.command.clone(),
        environment: recipe.environment.clone(),
        resources: recipe.resources.clone(),
    };

    if let Some(ov) = config_override {
        spec.environment
            .extend(ov.environment.iter().map(|(k, v)| (k.clone(), v.clone())));

        let res = &ov.resources;
        if let Some(cpu) = res.cpu {
            spec.resources.cpu = cpu;
        }
        if let Some(memory) = &res.memory {
            spec.resources.memory = memory.clone();
        }
        if let Some(gpu) = res.gpu {
            spec.resources.gpu = gpu;
        }
        if let Some(nodes) = res.nodes {
            spec.resources.nodes = nodes;
        }
        if let Some(time_limit) = &res.time_limit {
            spec.resources.time_limit = time_limit.clone();
        }
        if let Some(command) = &ov.command {
            spec.command = command.clone();
        }
    }

    validate(&recipe.name, &spec)?;
    Ok(spec)
}

/// Sanity checks the scheduler would otherwise reject late
pub fn validate(name: &str, spec: &ResolvedSpec) -> Result<(), RecipeError> {
    let invalid = |reason: &str| RecipeError::Invalid {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if spec.command.trim().is_empty() {
        return Err(invalid("command must not be empty"));
    }
    if spec.resources.cpu == 0 {
        return Err(invalid("cpu must be at least 1"));
    }
    if spec.resources.nodes == 0 {
        return Err(invalid("nodes must be at least 1"));
    }
    if !memory_pattern().is_match(&spec.resources.memory) {
        return Err(invalid("memory must look like <number>[K|M|G|T]"));
    }
    if !time_limit_pattern().is_match(&spec.resources.time_limit) {
        return Err(invalid("time_limit must look like [D-]HH[:MM[:SS]]"));
    }
    if let Some(key) = spec
        .environment
        .keys()
        .find(|k| k.is_empty() || k.contains(|c: char| !(c.is_ascii_alphanumeric() || c == '_')))
    {
        return Err(invalid(&format!("invalid environment variable name '{}'", key)));
    }

    Ok(())
}
