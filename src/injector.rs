//! Credential Injector (C7): merges computed provider fields into a module's own
//! `provider "<name>" { … }` blocks without touching any other provider block in the file.
//! Grounded on `hcl-edit`'s format-preserving edit model — unlike `hcl-rs`'s serde round-trip,
//! editing a parsed [`hcl_edit::structure::Body`] leaves untouched structures (including
//! unrelated provider blocks and their comments/whitespace) byte-identical, which is exactly the
//! isolation guarantee SPEC_FULL.md §4.7/§8 requires.

use std::collections::BTreeMap;
use std::path::Path;

use hcl_edit::expr::Expression;
use hcl_edit::structure::{Attribute, Body, Structure};
use hcl_edit::Ident;

use crate::errors::RecipeEngineError;

/// Walks `module_dir` (non-recursively — submodules are inspected and injected into separately)
/// and merges `provider_fields` into every `provider "<name>" { … }` block whose name is a key
/// of `provider_fields`. Files with no matching block are left untouched.
pub fn inject_into_module_dir(
    module_dir: &Path,
    provider_fields: &BTreeMap<String, BTreeMap<String, serde_json::Value>>,
) -> Result<(), RecipeEngineError> {
    if provider_fields.is_empty() {
        return Ok(());
    }

    let entries = std::fs::read_dir(module_dir)
        .map_err(|e| RecipeEngineError::injection(format!("cannot read module directory `{}`: {e}", module_dir.display())))?;

    for entry in entries {
        let entry = entry.map_err(|e| RecipeEngineError::injection(format!("cannot read module directory entry: {e}")))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let file_name = path.file_name().and_then(|f| f.to_str()).unwrap_or_default();
        if file_name.ends_with(".tf.json") {
            inject_json_file(&path, provider_fields)?;
        } else if file_name.ends_with(".tf") {
            inject_hcl_file(&path, provider_fields)?;
        }
    }

    Ok(())
}

fn inject_hcl_file(path: &Path, provider_fields: &BTreeMap<String, BTreeMap<String, serde_json::Value>>) -> Result<(), RecipeEngineError> {
    let raw =
        std::fs::read_to_string(path).map_err(|e| RecipeEngineError::injection(format!("cannot read `{}`: {e}", path.display())))?;

    if !raw.contains("provider") {
        return Ok(());
    }

    let mut body: Body = raw.parse().map_err(|e| RecipeEngineError::injection(format!("cannot parse HCL in `{}`: {e}", path.display())))?;

    let mut changed = false;
    for structure in body.iter_mut() {
        let Structure::Block(block) = structure else { continue };
        if block.ident.as_str() != "provider" {
            continue;
        }
        let Some(label) = block.labels.first() else { continue };
        let Some(fields) = provider_fields.get(label.as_str()) else { continue };

        inject_scalars_into_block(&mut block.body, fields);
        changed = true;
    }

    if changed {
        crate::fs::atomic_write(path, body.to_string().as_bytes())
            .map_err(|e| RecipeEngineError::injection(format!("cannot write `{}`: {e}", path.display())))?;
    }

    Ok(())
}

/// Adds or replaces scalar/boolean/number attributes on a single `provider` block body. Object-
/// and array-valued fields (notably `features`) are intentionally skipped here: SPEC_FULL.md
/// §4.7 requires every existing child block to survive byte-intact, and a module that already
/// ships its own `features { … }` keeps authority over it.
fn inject_scalars_into_block(body: &mut Body, fields: &BTreeMap<String, serde_json::Value>) {
    for (key, value) in fields {
        let Some(expr) = scalar_to_expression(value) else { continue };

        let existing = body.iter_mut().find_map(|structure| match structure {
            Structure::Attribute(attr) if attr.key.as_str() == key => Some(attr),
            _ => None,
        });

        match existing {
            Some(attr) => attr.value = expr,
            None => body.push(Attribute::new(Ident::new(key.clone()), expr)),
        }
    }
}

fn scalar_to_expression(value: &serde_json::Value) -> Option<Expression> {
    match value {
        serde_json::Value::String(s) => Some(Expression::from(s.as_str())),
        serde_json::Value::Bool(b) => Some(Expression::from(*b)),
        serde_json::Value::Number(n) => n.as_f64().map(Expression::from),
        _ => None,
    }
}

fn inject_json_file(path: &Path, provider_fields: &BTreeMap<String, BTreeMap<String, serde_json::Value>>) -> Result<(), RecipeEngineError> {
    let raw =
        std::fs::read_to_string(path).map_err(|e| RecipeEngineError::injection(format!("cannot read `{}`: {e}", path.display())))?;
    let mut value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| RecipeEngineError::injection(format!("cannot parse JSON in `{}`: {e}", path.display())))?;

    let Some(provider_obj) = value.get_mut("provider").and_then(|v| v.as_object_mut()) else {
        return Ok(());
    };

    let mut changed = false;
    for (name, fields) in provider_fields {
        let Some(entry) = provider_obj.get_mut(name) else { continue };
        merge_provider_entry(entry, fields);
        changed = true;
    }

    if changed {
        let body = serde_json::to_string_pretty(&value)
            .map_err(|e| RecipeEngineError::injection(format!("cannot serialize `{}`: {e}", path.display())))?;
        crate::fs::atomic_write(path, body.as_bytes())
            .map_err(|e| RecipeEngineError::injection(format!("cannot write `{}`: {e}", path.display())))?;
    }

    Ok(())
}

/// `provider.<name>` in `.tf.json` is a list of (usually one) config objects. Deep-merges maps,
/// replaces arrays, per SPEC_FULL.md §4.7.
fn merge_provider_entry(entry: &mut serde_json::Value, fields: &BTreeMap<String, serde_json::Value>) {
    let array = match entry {
        serde_json::Value::Array(arr) => arr,
        other => {
            let existing = other.take();
            *other = serde_json::Value::Array(vec![existing]);
            other.as_array_mut().unwrap()
        }
    };

    if array.is_empty() {
        array.push(serde_json::json!({}));
    }

    let target = &mut array[0];
    if !target.is_object() {
        *target = serde_json::json!({});
    }

    for (key, value) in fields {
        deep_merge_json(target, key, value.clone());
    }
}

fn deep_merge_json(target: &mut serde_json::Value, key: &str, value: serde_json::Value) {
    let obj = target.as_object_mut().expect("target normalized to an object above");
    match (obj.get_mut(key), &value) {
        (Some(existing), serde_json::Value::Object(_)) if existing.is_object() => {
            let serde_json::Value::Object(overlay) = value else { unreachable!() };
            for (k, v) in overlay {
                deep_merge_json(existing, &k, v);
            }
        }
        _ => {
            obj.insert(key.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn injects_only_the_named_provider_block_in_hcl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("providers.tf");
        std::fs::write(
            &path,
            r#"
provider "azurerm" {
  features {
    resource_group {
      prevent_deletion_if_contains_resources = false
    }
  }
}

provider "datadog" {
  api_key = "x"
}
"#,
        )
        .unwrap();

        let mut fields = BTreeMap::new();
        let mut azurerm = BTreeMap::new();
        azurerm.insert("subscription_id".to_string(), serde_json::json!("s"));
        azurerm.insert("client_id".to_string(), serde_json::json!("c"));
        azurerm.insert("tenant_id".to_string(), serde_json::json!("t"));
        azurerm.insert("use_oidc".to_string(), serde_json::json!(true));
        azurerm.insert("use_cli".to_string(), serde_json::json!(false));
        azurerm.insert("oidc_token_file_path".to_string(), serde_json::json!("/var/run/secrets/azure/tokens/azure-identity-token"));
        fields.insert("azurerm".to_string(), azurerm);

        inject_into_module_dir(dir.path(), &fields).unwrap();

        let updated = std::fs::read_to_string(&path).unwrap();
        assert!(updated.contains("subscription_id"));
        assert!(updated.contains("use_oidc"));
        assert!(updated.contains("prevent_deletion_if_contains_resources = false"));
        assert!(updated.contains(r#"api_key = "x""#));
    }

    #[test]
    fn leaves_files_without_a_matching_provider_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("providers.tf");
        let original = "provider \"datadog\" {\n  api_key = \"x\"\n}\n";
        std::fs::write(&path, original).unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("azurerm".to_string(), BTreeMap::from([("subscription_id".to_string(), serde_json::json!("s"))]));

        inject_into_module_dir(dir.path(), &fields).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn deep_merges_json_provider_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("providers.tf.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "provider": {
                    "azurerm": [{"features": {"resource_group": {"prevent_deletion_if_contains_resources": false}}}],
                    "datadog": [{"api_key": "x"}]
                }
            })
            .to_string(),
        )
        .unwrap();

        let mut fields = BTreeMap::new();
        let mut azurerm = BTreeMap::new();
        azurerm.insert("subscription_id".to_string(), serde_json::json!("s"));
        azurerm.insert("features".to_string(), serde_json::json!({"vm": {"skip_shutdown_and_force_delete": true}}));
        fields.insert("azurerm".to_string(), azurerm);

        inject_into_module_dir(dir.path(), &fields).unwrap();

        let updated: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(updated["provider"]["azurerm"][0]["subscription_id"], serde_json::json!("s"));
        assert_eq!(
            updated["provider"]["azurerm"][0]["features"]["resource_group"]["prevent_deletion_if_contains_resources"],
            serde_json::json!(false)
        );
        assert_eq!(updated["provider"]["azurerm"][0]["features"]["vm"]["skip_shutdown_and_force_delete"], serde_json::json!(true));
        assert_eq!(updated["provider"]["datadog"][0]["api_key"], serde_json::json!("x"));
    }
}
