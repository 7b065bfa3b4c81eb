//! Module Inspector (C5): downloads the module via `terraform get` and reads its declared
//! providers, variables and outputs off disk. Grounded on `cmd::terraform`'s exec wrappers for
//! the download step; the HCL/JSON readers here are shared with [`crate::injector`] so there is
//! exactly one HCL parsing path in the crate, per SPEC_FULL.md §4.5.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use hcl_edit::expr::Expression;
use hcl_edit::structure::{Body, Structure};

use crate::cmd::command::ProcessKiller;
use crate::cmd::terraform;
use crate::errors::RecipeEngineError;

#[derive(Debug, Clone)]
pub struct RequiredProviderMeta {
    pub source: String,
    pub version_constraints: String,
    pub aliases: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VariableMeta {
    pub type_constraint: Option<String>,
    pub has_default: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleInspectResult {
    pub context_var_exists: bool,
    pub required_providers: BTreeMap<String, RequiredProviderMeta>,
    pub result_output_exists: bool,
    pub parameters: BTreeMap<String, VariableMeta>,
}

/// Resolves `{working_dir}/.terraform/modules/{recipe_name}[/submodule]`. A `template_path` of
/// the common `git::…//sub` form carries its own subdirectory suffix after the first `//`; that
/// suffix is appended to the load path.
pub fn module_source_dir(working_dir: &Path, recipe_name: &str, template_path: &str) -> PathBuf {
    let base = working_dir.join(".terraform").join("modules").join(recipe_name);
    match template_path.split_once("//") {
        Some((_, subdir)) if !subdir.is_empty() => base.join(subdir),
        _ => base,
    }
}

/// Runs `terraform get` against the stub config already written to `working_dir`, then parses
/// the resulting module sources.
pub fn inspect(
    binary: &Path,
    working_dir: &Path,
    recipe_name: &str,
    template_path: &str,
    envs: &[(&str, &str)],
    abort: &ProcessKiller,
) -> Result<ModuleInspectResult, RecipeEngineError> {
    terraform::terraform_get(binary, working_dir, envs, abort).map_err(|(err, outcome)| {
        RecipeEngineError::RecipeDownloadFailed {
            message: format!("failed to download module `{template_path}`: {err}"),
            raw: outcome.map(|o| o.stderr.join("\n")),
        }
    })?;

    let module_dir = module_source_dir(working_dir, recipe_name, template_path);
    parse_module_dir(&module_dir)
}

/// Parses every `.tf`/`.tf.json` file directly under `module_dir` (not recursing into nested
/// module directories — those are separate [`module_source_dir`] calls) and accumulates the
/// union of declared providers, variables and outputs.
pub fn parse_module_dir(module_dir: &Path) -> Result<ModuleInspectResult, RecipeEngineError> {
    let mut result = ModuleInspectResult::default();

    let entries = std::fs::read_dir(module_dir)
        .map_err(|e| RecipeEngineError::setup(format!("cannot read module directory `{}`: {e}", module_dir.display())))?;

    for entry in entries {
        let entry = entry.map_err(|e| RecipeEngineError::setup(format!("cannot read module directory entry: {e}")))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let file_name = path.file_name().and_then(|f| f.to_str()).unwrap_or_default();
        if file_name.ends_with(".tf.json") {
            parse_json_module_file(&path, &mut result)?;
        } else if file_name.ends_with(".tf") {
            parse_hcl_module_file(&path, &mut result)?;
        }
    }

    Ok(result)
}

fn parse_hcl_module_file(path: &Path, result: &mut ModuleInspectResult) -> Result<(), RecipeEngineError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| RecipeEngineError::setup(format!("cannot read `{}`: {e}", path.display())))?;
    let body: Body = raw
        .parse()
        .map_err(|e| RecipeEngineError::setup(format!("cannot parse HCL in `{}`: {e}", path.display())))?;

    for structure in body.into_iter() {
        let Structure::Block(block) = structure else { continue };

        match block.ident.as_str() {
            "variable" => {
                if let Some(name) = block.labels.first().map(|l| l.as_str().to_string()) {
                    let meta = variable_meta_from_body(&block.body);
                    if name == "context" {
                        result.context_var_exists = true;
                    }
                    result.parameters.insert(name, meta);
                }
            }
            "output" => {
                if block.labels.first().map(|l| l.as_str()) == Some("result") {
                    result.result_output_exists = true;
                }
            }
            "terraform" => {
                for inner in block.body.into_iter() {
                    if let Structure::Attribute(attr) = inner {
                        if attr.key.as_str() == "required_providers" {
                            merge_required_providers_from_object(&attr.value, &mut result.required_providers);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}

fn variable_meta_from_body(body: &Body) -> VariableMeta {
    let mut meta = VariableMeta::default();
    for structure in body.iter() {
        let Structure::Attribute(attr) = structure else { continue };
        match attr.key.as_str() {
            "type" => meta.type_constraint = Some(expression_to_display(&attr.value)),
            "default" => meta.has_default = true,
            "description" => meta.description = expression_to_string(&attr.value),
            _ => {}
        }
    }
    meta
}

/// `required_providers` is written as `required_providers { aws = { source = "...", version =
/// "..." } }`: an attribute whose value is an HCL object, one entry per provider.
fn merge_required_providers_from_object(expr: &Expression, out: &mut BTreeMap<String, RequiredProviderMeta>) {
    let Expression::Object(object) = expr else { return };

    for (key, entry) in object.iter() {
        let provider_name = object_key_to_string(key);
        let Expression::Object(fields) = entry.expr() else { continue };

        let mut source = String::new();
        let mut version_constraints = String::new();
        let mut aliases = BTreeSet::new();

        for (field_key, field_value) in fields.iter() {
            match object_key_to_string(field_key).as_str() {
                "source" => source = expression_to_string(field_value.expr()).unwrap_or_default(),
                "version" => version_constraints = expression_to_string(field_value.expr()).unwrap_or_default(),
                "configuration_aliases" => {
                    if let Expression::Array(items) = field_value.expr() {
                        for item in items.iter() {
                            // `configuration_aliases = [aws.east]` parses each entry as a
                            // traversal; only the trailing segment (the alias) is kept.
                            if let Some(alias) = traversal_last_segment(item) {
                                aliases.insert(alias);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        out.insert(provider_name, RequiredProviderMeta { source, version_constraints, aliases });
    }
}

/// `configuration_aliases` entries parse as dotted traversals (`aws.east`) rather than strings;
/// rendering back to source text and taking the final `.`-separated segment avoids depending on
/// `hcl-edit`'s traversal-operator internals for what is, semantically, just an identifier.
fn traversal_last_segment(expr: &Expression) -> Option<String> {
    let rendered = expr.to_string();
    rendered.rsplit('.').next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn object_key_to_string(key: &hcl_edit::expr::ObjectKey) -> String {
    match key {
        hcl_edit::expr::ObjectKey::Ident(ident) => ident.as_str().to_string(),
        hcl_edit::expr::ObjectKey::Expression(expr) => expression_to_string(expr).unwrap_or_default(),
    }
}

fn expression_to_string(expr: &Expression) -> Option<String> {
    match expr {
        Expression::String(s) => Some(s.to_string()),
        Expression::Variable(ident) => Some(ident.as_str().to_string()),
        _ => None,
    }
}

fn expression_to_display(expr: &Expression) -> String {
    expression_to_string(expr).unwrap_or_else(|| format!("{expr:?}"))
}

fn parse_json_module_file(path: &Path, result: &mut ModuleInspectResult) -> Result<(), RecipeEngineError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| RecipeEngineError::setup(format!("cannot read `{}`: {e}", path.display())))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| RecipeEngineError::setup(format!("cannot parse JSON in `{}`: {e}", path.display())))?;

    if let Some(variables) = value.get("variable").and_then(|v| v.as_object()) {
        for (name, _) in variables {
            if name == "context" {
                result.context_var_exists = true;
            }
            result.parameters.entry(name.clone()).or_default();
        }
    }

    if let Some(outputs) = value.get("output").and_then(|v| v.as_object()) {
        if outputs.contains_key("result") {
            result.result_output_exists = true;
        }
    }

    if let Some(required_providers) =
        value.get("terraform").and_then(|t| t.as_object()).and_then(|t| t.get("required_providers")).and_then(|p| p.as_object())
    {
        for (name, meta) in required_providers {
            let source = meta.get("source").and_then(|s| s.as_str()).unwrap_or_default().to_string();
            let version_constraints = meta.get("version").and_then(|s| s.as_str()).unwrap_or_default().to_string();
            let aliases = meta
                .get("configuration_aliases")
                .and_then(|a| a.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            result.required_providers.insert(name.clone(), RequiredProviderMeta { source, version_constraints, aliases });
        }
    }

    Ok(())
}
