//! The `azurerm` provider builder (SPEC_FULL.md §4.6): service-principal (`client_secret`) or
//! OIDC/workload-identity (IRSA-analogue) credentials, always carrying a `features {}` block.

use std::collections::BTreeMap;

use crate::config::AzureCredentialSelector;
use crate::context::RecipeInvocationContext;
use crate::errors::RecipeEngineError;
use crate::provider::ProviderConfig;

const DEFAULT_OIDC_TOKEN_PATH: &str = "/var/run/secrets/azure/tokens/azure-identity-token";

pub fn build(ctx: &RecipeInvocationContext) -> Result<Option<ProviderConfig>, RecipeEngineError> {
    let Some(selector) = &ctx.env_config.recipe_config.providers.azure else {
        return Ok(None);
    };

    let mut fields = BTreeMap::new();
    fields.insert("features".to_string(), serde_json::json!({}));

    match selector {
        AzureCredentialSelector::ServicePrincipal { subscription_id, tenant_id, client_id, client_secret } => {
            fields.insert("subscription_id".to_string(), serde_json::json!(subscription_id));
            fields.insert("tenant_id".to_string(), serde_json::json!(tenant_id));
            fields.insert("client_id".to_string(), serde_json::json!(client_id));

            if let Some(secret) = ctx.resolve_secret_ref(client_secret) {
                fields.insert("client_secret".to_string(), serde_json::json!(secret));
            }
        }
        AzureCredentialSelector::WorkloadIdentity { subscription_id, tenant_id, client_id, oidc_token_file_path } => {
            fields.insert("subscription_id".to_string(), serde_json::json!(subscription_id));
            fields.insert("tenant_id".to_string(), serde_json::json!(tenant_id));
            fields.insert("client_id".to_string(), serde_json::json!(client_id));
            fields.insert("use_oidc".to_string(), serde_json::json!(true));
            fields.insert("use_cli".to_string(), serde_json::json!(false));
            fields.insert(
                "oidc_token_file_path".to_string(),
                serde_json::json!(oidc_token_file_path.clone().unwrap_or_else(|| DEFAULT_OIDC_TOKEN_PATH.to_string())),
            );
        }
    }

    Ok(Some(ProviderConfig::Azurerm(fields)))
}
