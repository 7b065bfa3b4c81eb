//! Secret resolution (C1), grounded on the teacher's collaborator-trait convention — the engine
//! accepts a resolved map of secret data as opaque input and never talks to a live secret store
//! itself (mirrors how `QoveryApi`/`GitCredentials` are fetched once, up front, in
//! `io_models::terraform_service`).

use std::collections::BTreeMap;

use crate::context::ResolvedSecret;

#[derive(thiserror::Error, Debug)]
pub enum SecretError {
    #[error("secret store `{store_id}` not found")]
    SecretNotFound { store_id: String },

    #[error("key `{key}` not found in secret store `{store_id}`")]
    KeyNotFound { store_id: String, key: String },
}

/// One `{source, key}` reference to resolve into a plain string.
#[derive(Debug, Clone)]
pub struct SecretRefInput {
    pub store_id: String,
    pub key: String,
}

/// Live lookup collaborator. Implementations talk to whatever secret backend the caller uses;
/// the core only ever sees the result of [`resolve`].
pub trait SecretStore: Send + Sync {
    fn get(&self, store_id: &str) -> Option<BTreeMap<String, String>>;
}

/// Resolves every `{source, key}` reference up front, failing fast if any is missing. The
/// result is what populates `RecipeInvocationContext::secrets`.
pub fn resolve(
    store: &dyn SecretStore,
    refs: &[SecretRefInput],
) -> Result<BTreeMap<String, ResolvedSecret>, SecretError> {
    let mut resolved: BTreeMap<String, ResolvedSecret> = BTreeMap::new();

    for secret_ref in refs {
        let data = store
            .get(&secret_ref.store_id)
            .ok_or_else(|| SecretError::SecretNotFound { store_id: secret_ref.store_id.clone() })?;

        if !data.contains_key(&secret_ref.key) {
            return Err(SecretError::KeyNotFound {
                store_id: secret_ref.store_id.clone(),
                key: secret_ref.key.clone(),
            });
        }

        resolved
            .entry(secret_ref.store_id.clone())
            .or_insert_with(|| ResolvedSecret { secret_type: "opaque".to_string(), data: BTreeMap::new() })
            .data
            .insert(secret_ref.key.clone(), data[&secret_ref.key].clone());
    }

    Ok(resolved)
}

/// In-memory `SecretStore` used in tests and by callers that pre-fetch everything themselves.
pub struct StaticSecretStore {
    stores: BTreeMap<String, BTreeMap<String, String>>,
}

impl StaticSecretStore {
    pub fn new(stores: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        StaticSecretStore { stores }
    }
}

impl SecretStore for StaticSecretStore {
    fn get(&self, store_id: &str) -> Option<BTreeMap<String, String>> {
        self.stores.get(store_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StaticSecretStore {
        let mut stores = BTreeMap::new();
        let mut creds = BTreeMap::new();
        creds.insert("access_key_id".to_string(), "AKIA...".to_string());
        stores.insert("aws-creds".to_string(), creds);
        StaticSecretStore::new(stores)
    }

    #[test]
    fn resolves_known_refs() {
        let refs = vec![SecretRefInput { store_id: "aws-creds".to_string(), key: "access_key_id".to_string() }];
        let resolved = resolve(&store(), &refs).unwrap();
        assert_eq!(resolved["aws-creds"].data["access_key_id"], "AKIA...");
    }

    #[test]
    fn fails_on_missing_store() {
        let refs = vec![SecretRefInput { store_id: "missing".to_string(), key: "x".to_string() }];
        assert!(matches!(resolve(&store(), &refs), Err(SecretError::SecretNotFound { .. })));
    }

    #[test]
    fn fails_on_missing_key() {
        let refs = vec![SecretRefInput { store_id: "aws-creds".to_string(), key: "nope".to_string() }];
        assert!(matches!(resolve(&store(), &refs), Err(SecretError::KeyNotFound { .. })));
    }
}
