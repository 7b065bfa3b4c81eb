//! The `aws` provider builder (SPEC_FULL.md §4.6): static access-key credentials or IRSA
//! (`assume_role_with_web_identity`), grounded on the teacher's `AwsCredentials::Static`/`STS`
//! shape generalized to the recipe engine's `accesskey`/`irsa` selectors.

use std::collections::BTreeMap;

use crate::config::AwsCredentialSelector;
use crate::context::RecipeInvocationContext;
use crate::errors::RecipeEngineError;
use crate::provider::ProviderConfig;

const DEFAULT_WEB_IDENTITY_TOKEN_FILE: &str = "/var/run/secrets/eks.amazonaws.com/serviceaccount/token";

pub fn build(ctx: &RecipeInvocationContext) -> Result<Option<ProviderConfig>, RecipeEngineError> {
    let Some(selector) = &ctx.env_config.recipe_config.providers.aws else {
        return Ok(None);
    };

    let mut fields = BTreeMap::new();

    match selector {
        AwsCredentialSelector::AccessKey { region, access_key_id, secret_access_key, session_token } => {
            fields.insert("region".to_string(), serde_json::json!(region));

            if let Some(value) = ctx.resolve_secret_ref(access_key_id) {
                fields.insert("access_key".to_string(), serde_json::json!(value));
            }
            if let Some(value) = ctx.resolve_secret_ref(secret_access_key) {
                fields.insert("secret_key".to_string(), serde_json::json!(value));
            }
            if let Some(token_ref) = session_token {
                if let Some(value) = ctx.resolve_secret_ref(token_ref) {
                    fields.insert("token".to_string(), serde_json::json!(value));
                }
            }
        }
        AwsCredentialSelector::Irsa { region, role_arn, web_identity_token_file } => {
            fields.insert("region".to_string(), serde_json::json!(region));
            fields.insert(
                "assume_role_with_web_identity".to_string(),
                serde_json::json!({
                    "role_arn": role_arn,
                    "web_identity_token_file": web_identity_token_file.clone().unwrap_or_else(|| DEFAULT_WEB_IDENTITY_TOKEN_FILE.to_string()),
                }),
            );
        }
    }

    Ok(Some(ProviderConfig::Aws(fields)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CloudProviderSelectors, EnvConfig, KubernetesRuntime, Runtime, SecretRef, TerraformConfigSurface};
    use crate::context::{EnvRecipe, ResolvedSecret, ResourceRecipe};
    use crate::logger::LogLevel;
    use std::path::PathBuf;

    fn ctx_with(selector: AwsCredentialSelector, secrets: BTreeMap<String, ResolvedSecret>) -> RecipeInvocationContext {
        let mut recipe_config = TerraformConfigSurface::default();
        recipe_config.providers = CloudProviderSelectors { azure: None, aws: Some(selector) };

        RecipeInvocationContext {
            root_dir: PathBuf::from("/tmp/x"),
            env_recipe: EnvRecipe { name: "redis".to_string(), template_path: "./mod".to_string(), template_version: None, parameters: BTreeMap::new(), tls: None },
            resource_recipe: ResourceRecipe { resource_id: "r".to_string(), application_id: "a".to_string(), environment_id: "e".to_string(), connected_resources: vec![], parameters: BTreeMap::new() },
            env_config: EnvConfig { runtime: Runtime { kubernetes: KubernetesRuntime { namespace: "ns".to_string() } }, recipe_config },
            secrets,
            log_level: LogLevel::default(),
        }
    }

    #[test]
    fn irsa_has_no_static_keys() {
        let selector =
            AwsCredentialSelector::Irsa { region: "eu-west-3".to_string(), role_arn: "arn:aws:iam::1:role/x".to_string(), web_identity_token_file: None };
        let config = build(&ctx_with(selector, BTreeMap::new())).unwrap().unwrap();
        let fields = config.fields();
        assert!(!fields.contains_key("access_key"));
        assert!(!fields.contains_key("secret_key"));
        assert_eq!(fields["assume_role_with_web_identity"]["role_arn"], serde_json::json!("arn:aws:iam::1:role/x"));
    }

    #[test]
    fn access_key_resolves_all_three_secrets() {
        let mut ak = BTreeMap::new();
        ak.insert("value".to_string(), "AKIA123".to_string());
        let mut sk = BTreeMap::new();
        sk.insert("value".to_string(), "shh".to_string());
        let mut tok = BTreeMap::new();
        tok.insert("value".to_string(), "session-tok".to_string());

        let mut secrets = BTreeMap::new();
        secrets.insert("aws-ak".to_string(), ResolvedSecret { secret_type: "opaque".to_string(), data: ak });
        secrets.insert("aws-sk".to_string(), ResolvedSecret { secret_type: "opaque".to_string(), data: sk });
        secrets.insert("aws-tok".to_string(), ResolvedSecret { secret_type: "opaque".to_string(), data: tok });

        let selector = AwsCredentialSelector::AccessKey {
            region: "eu-west-3".to_string(),
            access_key_id: SecretRef { secret: "aws-ak".to_string(), key: "value".to_string() },
            secret_access_key: SecretRef { secret: "aws-sk".to_string(), key: "value".to_string() },
            session_token: Some(SecretRef { secret: "aws-tok".to_string(), key: "value".to_string() }),
        };
        let config = build(&ctx_with(selector, secrets)).unwrap().unwrap();
        let fields = config.fields();
        assert_eq!(fields["access_key"], serde_json::json!("AKIA123"));
        assert_eq!(fields["secret_key"], serde_json::json!("shh"));
        assert_eq!(fields["token"], serde_json::json!("session-tok"));
    }
}
