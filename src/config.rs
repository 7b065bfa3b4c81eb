//! The `env_config` surface, grounded on the teacher's `io_models::terraform_service` module:
//! same `#[serde(default)]` / `#[serde(alias = "...")]` idiom, adapted from Qovery's
//! service-sizing/build settings to this engine's provider/registry/credential surface.

use std::collections::BTreeMap;

use serde_derive::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EnvConfig {
    pub runtime: Runtime,
    #[serde(rename = "recipe_config")]
    pub recipe_config: TerraformConfigSurface,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Runtime {
    pub kubernetes: KubernetesRuntime,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct KubernetesRuntime {
    pub namespace: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TerraformConfigSurface {
    pub terraform: TerraformSettings,
    pub env: EnvSettings,
    #[serde(alias = "env_secrets")]
    pub env_secrets: BTreeMap<String, EnvSecretRef>,
    pub providers: CloudProviderSelectors,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TerraformSettings {
    /// `providerName → list<additional attribute map>`, merged by the Provider Config Builder.
    pub providers: BTreeMap<String, Vec<BTreeMap<String, serde_json::Value>>>,
    pub module_registries: BTreeMap<String, ModuleRegistry>,
    pub version: Option<TerraformVersionSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleRegistry {
    pub url: String,
    #[serde(default)]
    pub authentication: Option<RegistryAuthentication>,
    #[serde(default)]
    pub tls: Option<TlsSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryAuthentication {
    pub token: SecretRef,
    #[serde(default)]
    pub additional_hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerraformVersionSource {
    pub version: String,
    pub releases_api_base_url: String,
    pub releases_archive_url: String,
    #[serde(default)]
    pub authentication: Option<RegistryAuthentication>,
    #[serde(default)]
    pub tls: Option<TlsSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSource {
    pub ca_certificate: SecretRef,
}

/// Points at one key inside an already-resolved `RecipeInvocationContext::secrets` entry.
/// `key` defaults to `"value"`, the convention used when a store holds exactly one secret.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretRef {
    pub secret: String,
    #[serde(default = "default_secret_key")]
    pub key: String,
}

fn default_secret_key() -> String {
    "value".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EnvSettings {
    pub additional_properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvSecretRef {
    pub source: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CloudProviderSelectors {
    pub azure: Option<AzureCredentialSelector>,
    pub aws: Option<AwsCredentialSelector>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AzureCredentialSelector {
    ServicePrincipal { subscription_id: String, tenant_id: String, client_id: String, client_secret: SecretRef },
    WorkloadIdentity {
        subscription_id: String,
        tenant_id: String,
        client_id: String,
        #[serde(default)]
        oidc_token_file_path: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AwsCredentialSelector {
    AccessKey {
        region: String,
        access_key_id: SecretRef,
        secret_access_key: SecretRef,
        #[serde(default)]
        session_token: Option<SecretRef>,
    },
    Irsa {
        region: String,
        role_arn: String,
        #[serde(default)]
        web_identity_token_file: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_config() {
        let raw = serde_json::json!({
            "runtime": {"kubernetes": {"namespace": "app-ns"}}
        });
        let config: EnvConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.runtime.kubernetes.namespace, "app-ns");
        assert!(config.recipe_config.terraform.providers.is_empty());
    }

    #[test]
    fn deserializes_aws_access_key_selector() {
        let raw = serde_json::json!({
            "runtime": {"kubernetes": {"namespace": "ns"}},
            "recipe_config": {
                "providers": {
                    "aws": {
                        "kind": "access_key",
                        "region": "eu-west-3",
                        "access_key_id": {"secret": "aws-creds"},
                        "secret_access_key": {"secret": "aws-creds"}
                    }
                }
            }
        });
        let config: EnvConfig = serde_json::from_value(raw).unwrap();
        assert!(matches!(config.recipe_config.providers.aws, Some(AwsCredentialSelector::AccessKey { .. })));
    }
}
