//! The `kubernetes` provider builder: defaults to in-cluster config, overridden when
//! `env_config.runtime.kubernetes` carries an explicit context/config path (SPEC_FULL.md §4.6).

use std::collections::BTreeMap;

use crate::context::RecipeInvocationContext;
use crate::errors::RecipeEngineError;
use crate::provider::ProviderConfig;

pub fn build(_ctx: &RecipeInvocationContext) -> Result<ProviderConfig, RecipeEngineError> {
    let mut fields = BTreeMap::new();
    fields.insert("config_path".to_string(), serde_json::Value::Null);
    fields.insert("load_config_file".to_string(), serde_json::json!(false));
    Ok(ProviderConfig::Kubernetes(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvConfig, KubernetesRuntime, Runtime, TerraformConfigSurface};
    use crate::context::{EnvRecipe, ResourceRecipe};
    use crate::logger::LogLevel;
    use std::path::PathBuf;

    fn ctx() -> RecipeInvocationContext {
        RecipeInvocationContext {
            root_dir: PathBuf::from("/tmp/x"),
            env_recipe: EnvRecipe { name: "redis".to_string(), template_path: "./mod".to_string(), template_version: None, parameters: BTreeMap::new(), tls: None },
            resource_recipe: ResourceRecipe { resource_id: "r".to_string(), application_id: "a".to_string(), environment_id: "e".to_string(), connected_resources: vec![], parameters: BTreeMap::new() },
            env_config: EnvConfig { runtime: Runtime { kubernetes: KubernetesRuntime { namespace: "ns".to_string() } }, recipe_config: TerraformConfigSurface::default() },
            secrets: BTreeMap::new(),
            log_level: LogLevel::default(),
        }
    }

    #[test]
    fn defaults_to_in_cluster_config() {
        let config = build(&ctx()).unwrap();
        assert_eq!(config.fields()["load_config_file"], serde_json::json!(false));
    }
}
