//! Config Synthesizer (C4): builds and writes `main.tf.json`, the root Terraform configuration,
//! grounded on `io_models::terraform_service`'s serde-derived config structs and the teacher's
//! atomic-write convention (see `fs::atomic_write`).

use std::collections::BTreeMap;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::context::RecipeInvocationContext;
use crate::errors::RecipeEngineError;
use crate::module_inspect::ModuleInspectResult;
use crate::provider::ProviderConfig;

/// In-memory mirror of `main.tf.json`. Field order matters for readability but not for
/// semantics — Terraform's JSON syntax is order-independent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerraformConfig {
    pub module: BTreeMap<String, ModuleBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terraform: Option<TerraformBlock>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub provider: BTreeMap<String, Vec<BTreeMap<String, serde_json::Value>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleBlock {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerraformBlock {
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub required_providers: BTreeMap<String, RequiredProviderBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredProviderBlock {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub configuration_aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendBlock {
    pub kubernetes: KubernetesBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesBackend {
    pub secret_suffix: String,
    pub namespace: String,
    pub in_cluster_config: bool,
}

/// Computes the deterministic `secret_suffix` for a `resource_id` (SPEC_FULL.md §4.4 / §8):
/// lowercase, strip a leading `/`, replace `/` with `.`, then the full 40-hex-char SHA-1 digest
/// of the result. 40 hex chars is well under the 63-char Kubernetes name limit (leaving room
/// for any caller-side prefix/suffix) while being collision-free for any practical resource-id
/// population — see DESIGN.md's Open Question decision.
pub fn secret_suffix(resource_id: &str) -> String {
    let canonical = resource_id.to_lowercase().trim_start_matches('/').replace('/', ".");

    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl TerraformConfig {
    /// Phase 1 (SPEC_FULL.md §4.4): the pre-download stub containing only the `module` entry.
    /// `context_value` is populated by the caller only when the module is later found (by C5)
    /// to declare a `context` variable — at stub-writing time we don't know that yet, so the
    /// executor writes the stub once, inspects, then re-synthesizes with [`enrich`].
    pub fn stub(ctx: &RecipeInvocationContext) -> Self {
        let mut parameters = ctx.env_recipe.parameters.clone();
        for (key, value) in &ctx.resource_recipe.parameters {
            parameters.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let module = ModuleBlock {
            source: ctx.env_recipe.template_path.clone(),
            version: ctx.env_recipe.template_version.clone(),
            parameters,
        };

        let mut modules = BTreeMap::new();
        modules.insert(ctx.env_recipe.name.clone(), module);

        TerraformConfig { module: modules, terraform: None, provider: BTreeMap::new() }
    }

    /// Phase 2: merges in everything that required inspecting the downloaded module plus the
    /// built provider configs. Consumes `self` so a stale pre-inspect config can never be
    /// written again by accident.
    pub fn enrich(
        mut self,
        ctx: &RecipeInvocationContext,
        inspect: &ModuleInspectResult,
        provider_configs: &BTreeMap<String, Vec<ProviderConfig>>,
    ) -> Self {
        if inspect.context_var_exists {
            if let Some(module) = self.module.get_mut(&ctx.env_recipe.name) {
                module.parameters.entry("context".to_string()).or_insert_with(|| recipe_context_value(ctx));
            }
        }

        let mut required_providers = BTreeMap::new();
        for (name, meta) in &inspect.required_providers {
            required_providers.insert(
                name.clone(),
                RequiredProviderBlock {
                    source: meta.source.clone(),
                    version: if meta.version_constraints.is_empty() { None } else { Some(meta.version_constraints.clone()) },
                    configuration_aliases: meta.aliases.iter().map(|alias| format!("{name}.{alias}")).collect(),
                },
            );
        }

        let secret_suffix = secret_suffix(&ctx.resource_recipe.resource_id);
        let backend = BackendBlock {
            kubernetes: KubernetesBackend {
                secret_suffix,
                namespace: ctx.env_config.runtime.kubernetes.namespace.clone(),
                in_cluster_config: true,
            },
        };

        let required_version =
            ctx.env_config.recipe_config.terraform.version.as_ref().map(|v| v.version.clone()).filter(|v| !v.is_empty());

        self.terraform = Some(TerraformBlock { required_providers, required_version, backend: Some(backend) });

        let mut provider = BTreeMap::new();
        for (name, blocks) in provider_configs {
            provider.insert(name.clone(), blocks.iter().map(|b| b.to_json_map()).collect());
        }
        self.provider = provider;

        self
    }

    pub fn to_json_pretty(&self) -> Result<String, RecipeEngineError> {
        serde_json::to_string_pretty(self).map_err(|e| RecipeEngineError::setup(format!("cannot serialize terraform config: {e}")))
    }

    /// Writes `main.tf.json` atomically in `working_dir`.
    pub fn write(&self, working_dir: &Path) -> Result<(), RecipeEngineError> {
        let body = self.to_json_pretty()?;
        crate::fs::atomic_write(&working_dir.join("main.tf.json"), body.as_bytes())
            .map_err(|e| RecipeEngineError::setup(format!("cannot write main.tf.json: {e}")))
    }
}

/// The recipe context variable's value, assembled from the fields `env_recipe`/`resource_recipe`
/// already carry (application/environment/resource ids and connected-resource ids).
fn recipe_context_value(ctx: &RecipeInvocationContext) -> serde_json::Value {
    serde_json::json!({
        "resource_id": ctx.resource_recipe.resource_id,
        "application_id": ctx.resource_recipe.application_id,
        "environment_id": ctx.resource_recipe.environment_id,
        "connected_resources": ctx.resource_recipe.connected_resources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvConfig, KubernetesRuntime, Runtime, TerraformConfigSurface};
    use crate::context::{EnvRecipe, ResourceRecipe};
    use crate::logger::LogLevel;
    use crate::module_inspect::RequiredProviderMeta;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn ctx() -> RecipeInvocationContext {
        RecipeInvocationContext {
            root_dir: PathBuf::from("/tmp/x"),
            env_recipe: EnvRecipe {
                name: "redis".to_string(),
                template_path: "./modules/redis".to_string(),
                template_version: Some("1.0.0".to_string()),
                parameters: BTreeMap::new(),
                tls: None,
            },
            resource_recipe: ResourceRecipe {
                resource_id: "Resources/redis-1".to_string(),
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
    fn stub_has_exactly_one_module_entry_named_after_the_recipe() {
        let stub = TerraformConfig::stub(&ctx());
        assert_eq!(stub.module.len(), 1);
        assert_eq!(stub.module["redis"].source, "./modules/redis");
        assert_eq!(stub.module["redis"].version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn secret_suffix_is_deterministic_and_case_insensitive() {
        let a = secret_suffix("Resources/redis-1");
        let b = secret_suffix("resources/redis-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn secret_suffix_differs_for_distinct_ids() {
        assert_ne!(secret_suffix("resources/redis-1"), secret_suffix("resources/redis-2"));
    }

    #[test]
    fn enrich_sets_backend_namespace_and_providers() {
        let mut required_providers = BTreeMap::new();
        required_providers.insert(
            "kubernetes".to_string(),
            RequiredProviderMeta { source: "hashicorp/kubernetes".to_string(), version_constraints: ">= 2.0".to_string(), aliases: BTreeSet::new() },
        );
        let inspect = ModuleInspectResult {
            context_var_exists: false,
            required_providers,
            result_output_exists: true,
            parameters: BTreeMap::new(),
        };

        let config = TerraformConfig::stub(&ctx()).enrich(&ctx(), &inspect, &BTreeMap::new());
        let terraform = config.terraform.unwrap();
        assert_eq!(terraform.backend.unwrap().kubernetes.namespace, "app-ns");
        assert!(terraform.required_providers.contains_key("kubernetes"));
    }

    #[test]
    fn enrich_populates_context_variable_when_module_declares_it() {
        let inspect = ModuleInspectResult {
            context_var_exists: true,
            required_providers: BTreeMap::new(),
            result_output_exists: false,
            parameters: BTreeMap::new(),
        };
        let config = TerraformConfig::stub(&ctx()).enrich(&ctx(), &inspect, &BTreeMap::new());
        assert!(config.module["redis"].parameters.contains_key("context"));
    }
}
