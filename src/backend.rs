//! Backend Store (C8): persists Terraform state as a named cluster secret, grounded on the
//! teacher's `QubeClient` (`services::kube_client.rs`) — a thin wrapper around `kube::Api<Secret>`
//! scoped to a namespace, with `404` folded into a recoverable `NotFound` rather than an error.

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams};

use crate::errors::RecipeEngineError;
use crate::runtime::block_on;

#[derive(thiserror::Error, Debug)]
pub enum BackendStoreError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// The collaborator interface SPEC_FULL.md §6 lists as consumed:
/// `KubernetesClient.Secrets(namespace).Get(name) → Secret|NotFound`, plus delete.
pub trait KubernetesClient: Send + Sync {
    fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<()>, BackendStoreError>;
    fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), BackendStoreError>;
}

#[derive(Clone)]
pub struct KubeBackendClient {
    client: kube::Client,
}

impl KubeBackendClient {
    pub fn new(client: kube::Client) -> Self {
        KubeBackendClient { client }
    }
}

impl KubernetesClient for KubeBackendClient {
    fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<()>, BackendStoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        block_on(async {
            match api.get(name).await {
                Ok(_) => Ok(Some(())),
                Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
                Err(err) => Err(BackendStoreError::Kube(err)),
            }
        })
    }

    fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), BackendStoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        block_on(async {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
                Err(err) => Err(BackendStoreError::Kube(err)),
            }
        })
    }
}

/// Verifies the state secret exists after a successful `apply` (SPEC_FULL.md §4.8). Its absence
/// is a fatal post-condition failure — the caller should not report a successful deploy.
pub fn verify_state_secret_exists(client: &dyn KubernetesClient, namespace: &str, secret_suffix: &str) -> Result<(), RecipeEngineError> {
    match client.get_secret(namespace, secret_suffix) {
        Ok(Some(())) => Ok(()),
        Ok(None) => Err(RecipeEngineError::PostConditionFailure {
            message: format!("state secret `{secret_suffix}` missing in namespace `{namespace}` after apply"),
        }),
        Err(err) => Err(RecipeEngineError::PostConditionFailure { message: format!("cannot verify state secret: {err}") }),
    }
}

/// Deletes the state secret. Idempotent: a missing secret is success (SPEC_FULL.md §4.8/§8
/// "Delete idempotence").
pub fn delete_state_secret(client: &dyn KubernetesClient, namespace: &str, secret_suffix: &str) -> Result<(), RecipeEngineError> {
    client
        .delete_secret(namespace, secret_suffix)
        .map_err(|err| RecipeEngineError::RecipeDeletionFailed { message: format!("cannot delete state secret: {err}"), stderr_tail: String::new() })
}
