//! The value threaded through every public operation, grounded on the teacher's
//! `TerraformService`/`DeploymentTarget` context objects (`environment/models/terraform_service.rs`)
//! which bundle a workspace path, credentials and logging/abort plumbing behind one struct.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::EnvConfig;
use crate::logger::LogLevel;

/// A reference to a Terraform module plus the parameters it is instantiated with.
#[derive(Debug, Clone)]
pub struct EnvRecipe {
    pub name: String,
    pub template_path: String,
    pub template_version: Option<String>,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub tls: Option<RecipeTls>,
}

#[derive(Debug, Clone)]
pub struct RecipeTls {
    pub ca_certificate_secret: String,
}

/// Identifies the concrete resource this invocation provisions or tears down.
#[derive(Debug, Clone)]
pub struct ResourceRecipe {
    pub resource_id: String,
    pub application_id: String,
    pub environment_id: String,
    pub connected_resources: Vec<String>,
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// A fully-resolved secret store entry, keyed by `storeId`.
#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    pub secret_type: String,
    pub data: BTreeMap<String, String>,
}

/// Everything one `Executor` operation needs, resolved up front so the executor itself never
/// talks to a secret store or config loader mid-flight.
pub struct RecipeInvocationContext {
    pub root_dir: PathBuf,
    pub env_recipe: EnvRecipe,
    pub resource_recipe: ResourceRecipe,
    pub env_config: EnvConfig,
    pub secrets: BTreeMap<String, ResolvedSecret>,
    pub log_level: LogLevel,
}

impl RecipeInvocationContext {
    pub fn validate(&self) -> Result<(), String> {
        if self.env_recipe.name.trim().is_empty() {
            return Err("env_recipe.name must not be empty".to_string());
        }
        if self.env_recipe.template_path.trim().is_empty() {
            return Err("env_recipe.template_path must not be empty".to_string());
        }
        if self.resource_recipe.resource_id.trim().is_empty() {
            return Err("resource_recipe.resource_id must not be empty".to_string());
        }
        if self.env_config.runtime.kubernetes.namespace.trim().is_empty() {
            return Err("runtime.kubernetes.namespace is required for the state backend".to_string());
        }

        Ok(())
    }

    pub fn secret(&self, store_id: &str) -> Option<&ResolvedSecret> {
        self.secrets.get(store_id)
    }

    /// Resolves a [`crate::config::SecretRef`] to its plain string value. An empty value is
    /// treated as unset (SPEC_FULL.md §4.6: "If a secret reference resolves to an empty value,
    /// treat the field as unset").
    pub fn resolve_secret_ref(&self, secret_ref: &crate::config::SecretRef) -> Option<String> {
        self.secret(&secret_ref.secret)
            .and_then(|resolved| resolved.data.get(&secret_ref.key))
            .filter(|value| !value.is_empty())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvConfig, KubernetesRuntime, Runtime, TerraformConfigSurface};

    fn base_ctx() -> RecipeInvocationContext {
        RecipeInvocationContext {
            root_dir: PathBuf::from("/tmp/does-not-matter"),
            env_recipe: EnvRecipe {
                name: "redis".to_string(),
                template_path: "./modules/redis".to_string(),
                template_version: None,
                parameters: BTreeMap::new(),
                tls: None,
            },
            resource_recipe: ResourceRecipe {
                resource_id: "res-1".to_string(),
                application_id: "app-1".to_string(),
                environment_id: "env-1".to_string(),
                connected_resources: vec![],
                parameters: BTreeMap::new(),
            },
            env_config: EnvConfig {
                runtime: Runtime { kubernetes: KubernetesRuntime { namespace: "app-ns".to_string() } },
                recipe_config: TerraformConfigSurface::default(),
            },
            secrets: BTreeMap::new(),
            log_level: LogLevel::default(),
        }
    }

    #[test]
    fn rejects_empty_recipe_name() {
        let mut ctx = base_ctx();
        ctx.env_recipe.name = String::new();
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn rejects_missing_namespace() {
        let mut ctx = base_ctx();
        ctx.env_config.runtime.kubernetes.namespace = String::new();
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_context() {
        assert!(base_ctx().validate().is_ok());
    }
}
