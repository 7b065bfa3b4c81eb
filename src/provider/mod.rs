//! Provider Config Builder (C6): produces per-provider configuration values, grounded on the
//! teacher's credential-selector enums (`infrastructure::models::cloud_provider::aws::AwsCredentials`)
//! adapted to this engine's `accesskey`/`irsa`/`serviceprincipal`/`workloadidentity` selectors,
//! and represented as the tagged variant SPEC_FULL.md §9 calls for so `features {}` participates
//! in a structural, not scalar, merge.

pub mod aws;
pub mod azure;
pub mod kubernetes;

use std::collections::BTreeMap;

use crate::config::TerraformConfigSurface;
use crate::context::RecipeInvocationContext;
use crate::errors::RecipeEngineError;
use crate::module_inspect::ModuleInspectResult;

/// One provider configuration block. `Generic` covers any provider the catalog doesn't have a
/// dedicated builder for (the module's `required_providers` entry still gets a provider block —
/// just with whatever `env_config.recipe_config.terraform.providers` supplies, and nothing
/// more).
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderConfig {
    Kubernetes(BTreeMap<String, serde_json::Value>),
    Azurerm(BTreeMap<String, serde_json::Value>),
    Aws(BTreeMap<String, serde_json::Value>),
    Generic(BTreeMap<String, serde_json::Value>),
}

impl ProviderConfig {
    pub fn fields(&self) -> &BTreeMap<String, serde_json::Value> {
        match self {
            ProviderConfig::Kubernetes(f) | ProviderConfig::Azurerm(f) | ProviderConfig::Aws(f) | ProviderConfig::Generic(f) => f,
        }
    }

    fn fields_mut(&mut self) -> &mut BTreeMap<String, serde_json::Value> {
        match self {
            ProviderConfig::Kubernetes(f) | ProviderConfig::Azurerm(f) | ProviderConfig::Aws(f) | ProviderConfig::Generic(f) => f,
        }
    }

    /// Merges `other` into `self`, `other` winning on scalar conflicts. `features` (azurerm's
    /// sub-record) is deep-merged instead of overwritten, per SPEC_FULL.md §4.6/§9.
    pub fn merge(mut self, other: &BTreeMap<String, serde_json::Value>) -> Self {
        for (key, value) in other {
            if key == "features" {
                let merged = deep_merge(self.fields().get("features").cloned().unwrap_or_else(|| serde_json::json!({})), value.clone());
                self.fields_mut().insert("features".to_string(), merged);
            } else {
                self.fields_mut().insert(key.clone(), value.clone());
            }
        }
        self
    }

    pub fn to_json_map(&self) -> BTreeMap<String, serde_json::Value> {
        self.fields().clone()
    }
}

fn deep_merge(base: serde_json::Value, overlay: serde_json::Value) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            serde_json::Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Builds one or more provider blocks per required provider. Each entry in the returned map
/// lists every alias/block for that provider name (SPEC_FULL.md §4.6: "if the environment's
/// recipe config names a matching provider entry (possibly multiple, each an alias), emit one
/// block per entry").
pub fn build_provider_configs(
    ctx: &RecipeInvocationContext,
    inspect: &ModuleInspectResult,
) -> Result<BTreeMap<String, Vec<ProviderConfig>>, RecipeEngineError> {
    let surface = &ctx.env_config.recipe_config;
    let mut out = BTreeMap::new();

    for name in inspect.required_providers.keys() {
        let blocks = build_blocks_for(name, ctx, surface)?;
        if !blocks.is_empty() {
            out.insert(name.clone(), blocks);
        }
    }

    Ok(out)
}

fn base_block_for(name: &str, ctx: &RecipeInvocationContext) -> Result<Option<ProviderConfig>, RecipeEngineError> {
    Ok(match name {
        "kubernetes" => Some(kubernetes::build(ctx)?),
        "azurerm" => azure::build(ctx)?,
        "aws" => aws::build(ctx)?,
        _ => Some(ProviderConfig::Generic(BTreeMap::new())),
    })
}

/// Builds the blocks for one required provider. When `env_config` lists additional-property
/// entries for the provider, one block is emitted per entry (each a separate alias), the
/// built-in credential fields merged under each; with no entries, the single built-in block is
/// used as-is.
fn build_blocks_for(
    name: &str,
    ctx: &RecipeInvocationContext,
    surface: &TerraformConfigSurface,
) -> Result<Vec<ProviderConfig>, RecipeEngineError> {
    let Some(base) = base_block_for(name, ctx)? else { return Ok(vec![]) };

    match surface.terraform.providers.get(name) {
        None => Ok(vec![base]),
        Some(extra_blocks) if extra_blocks.is_empty() => Ok(vec![base]),
        Some(extra_blocks) => Ok(extra_blocks.iter().map(|extra| base.clone().merge(extra)).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_deep_merges_features_block() {
        let base = ProviderConfig::Azurerm(BTreeMap::from([(
            "features".to_string(),
            serde_json::json!({"resource_group": {"prevent_deletion_if_contains_resources": false}}),
        )]));

        let mut overlay = BTreeMap::new();
        overlay.insert("subscription_id".to_string(), serde_json::json!("s"));
        overlay.insert("features".to_string(), serde_json::json!({"vm": {"skip_shutdown_and_force_delete": true}}));

        let merged = base.merge(&overlay);
        let features = &merged.fields()["features"];
        assert!(features["resource_group"]["prevent_deletion_if_contains_resources"].as_bool().unwrap() == false);
        assert!(features["vm"]["skip_shutdown_and_force_delete"].as_bool().unwrap());
        assert_eq!(merged.fields()["subscription_id"], serde_json::json!("s"));
    }

    #[test]
    fn merge_overwrites_plain_scalars() {
        let base = ProviderConfig::Generic(BTreeMap::from([("region".to_string(), serde_json::json!("old"))]));
        let overlay = BTreeMap::from([("region".to_string(), serde_json::json!("new"))]);
        let merged = base.merge(&overlay);
        assert_eq!(merged.fields()["region"], serde_json::json!("new"));
    }
}
