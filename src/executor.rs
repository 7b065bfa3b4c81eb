//! Executor (C9): orchestrates C1–C8 across `Deploy`, `Delete`, `GetRecipeMetadata`. Grounded on
//! `cmd::terraform`'s `init`/`apply`/`destroy` staging and the teacher's deployment-action step
//! sequencing (one `tracing` span per operation, a duration recorded through the injected
//! `Metrics` sink on every exit path, success or failure).

use std::collections::BTreeMap;
use std::time::Instant;

use crate::backend::{self, KubernetesClient};
use crate::binary::{BinaryInstaller, Downloader};
use crate::cmd::command::{CommandError, ProcessKiller};
use crate::cmd::terraform::{self, TerraformOutcome};
use crate::config_synth::{self, TerraformConfig};
use crate::context::RecipeInvocationContext;
use crate::errors::{classify_terraform_failure, RecipeEngineError};
use crate::fs as scoped_fs;
use crate::injector;
use crate::logger::{Logger, LogLevel, ProcessLogForwarder};
use crate::metrics::Metrics;
use crate::module_inspect::{self, ModuleInspectResult, VariableMeta};
use crate::provider;

#[derive(Debug, Clone, Default)]
pub struct DeployResult {
    pub outputs: serde_json::Value,
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleMetadata {
    pub parameters: BTreeMap<String, VariableMeta>,
    pub has_result_output: bool,
}

impl From<&ModuleInspectResult> for ModuleMetadata {
    fn from(inspect: &ModuleInspectResult) -> Self {
        ModuleMetadata { parameters: inspect.parameters.clone(), has_result_output: inspect.result_output_exists }
    }
}

pub struct Executor {
    binary_installer: BinaryInstaller,
    kube_client: Box<dyn KubernetesClient>,
    logger: Box<dyn Logger>,
    metrics: Box<dyn Metrics>,
}

impl Executor {
    pub fn new(
        downloader: Box<dyn Downloader>,
        kube_client: Box<dyn KubernetesClient>,
        logger: Box<dyn Logger>,
        metrics: Box<dyn Metrics>,
    ) -> Self {
        Executor { binary_installer: BinaryInstaller::new(downloader), kube_client, logger, metrics }
    }

    pub fn deploy(&self, ctx: &RecipeInvocationContext) -> Result<DeployResult, RecipeEngineError> {
        let span = info_span!("recipe_engine_operation", recipe_name = %ctx.env_recipe.name, resource_id = %ctx.resource_recipe.resource_id, action = "deploy");
        let _enter = span.enter();
        let started_at = Instant::now();
        let result = self.deploy_inner(ctx);
        self.record_duration("deploy", started_at, ctx, result.is_ok());
        result
    }

    pub fn delete(&self, ctx: &RecipeInvocationContext) -> Result<(), RecipeEngineError> {
        let span = info_span!("recipe_engine_operation", recipe_name = %ctx.env_recipe.name, resource_id = %ctx.resource_recipe.resource_id, action = "delete");
        let _enter = span.enter();
        let started_at = Instant::now();
        let result = self.delete_inner(ctx);
        self.record_duration("delete", started_at, ctx, result.is_ok());
        result
    }

    pub fn get_recipe_metadata(&self, ctx: &RecipeInvocationContext) -> Result<ModuleMetadata, RecipeEngineError> {
        let span = info_span!("recipe_engine_operation", recipe_name = %ctx.env_recipe.name, resource_id = %ctx.resource_recipe.resource_id, action = "get_recipe_metadata");
        let _enter = span.enter();
        let started_at = Instant::now();
        let result = self.get_recipe_metadata_inner(ctx);
        self.record_duration("get_recipe_metadata", started_at, ctx, result.is_ok());
        result
    }

    fn record_duration(&self, operation: &str, started_at: Instant, ctx: &RecipeInvocationContext, succeeded: bool) {
        self.metrics.record_duration(
            operation,
            started_at,
            &[
                ("resource_id", ctx.resource_recipe.resource_id.as_str()),
                ("recipe_name", ctx.env_recipe.name.as_str()),
                ("succeeded", if succeeded { "true" } else { "false" }),
            ],
        );
    }

    /// Steps 1–4 of SPEC_FULL.md §4.9: create the working directory, resolve the binary, write
    /// the stub config, inspect the module. Shared by all three public operations.
    #[allow(clippy::type_complexity)]
    fn setup_and_inspect(
        &self,
        ctx: &RecipeInvocationContext,
    ) -> Result<
        (scopeguard::ScopeGuard<std::path::PathBuf, fn(std::path::PathBuf)>, crate::binary::InstalledBinary, Vec<(String, String)>, ModuleInspectResult),
        RecipeEngineError,
    > {
        ctx.validate().map_err(RecipeEngineError::setup)?;

        let dir = scoped_fs::create_invocation_dir(&ctx.root_dir, &ctx.resource_recipe.resource_id)
            .map_err(|e| RecipeEngineError::setup(format!("cannot create working directory: {e}")))?;
        let working_dir = scopeguard::guard(dir, remove_dir_guard as fn(std::path::PathBuf));

        let envs = build_process_envs(ctx)?;
        let env_refs = env_refs(&envs);

        let binary = self.binary_installer.resolve(&working_dir, ctx, &ProcessKiller::never())?;

        TerraformConfig::stub(ctx).write(&working_dir)?;

        let inspect = module_inspect::inspect(
            &binary.exec_path,
            &working_dir,
            &ctx.env_recipe.name,
            &ctx.env_recipe.template_path,
            &env_refs,
            &ProcessKiller::never(),
        )?;

        Ok((working_dir, binary, envs, inspect))
    }

    fn deploy_inner(&self, ctx: &RecipeInvocationContext) -> Result<DeployResult, RecipeEngineError> {
        let (working_dir, binary, envs, inspect) = self.setup_and_inspect(ctx)?;
        let env_refs = env_refs(&envs);

        let provider_configs = provider::build_provider_configs(ctx, &inspect)?;

        let config = TerraformConfig::stub(ctx).enrich(ctx, &inspect, &provider_configs);
        config.write(&working_dir)?;

        let module_dir = module_inspect::module_source_dir(&working_dir, &ctx.env_recipe.name, &ctx.env_recipe.template_path);
        let primary_fields = primary_provider_fields(&provider_configs);
        injector::inject_into_module_dir(&module_dir, &primary_fields)?;

        let forwarder = ProcessLogForwarder::new(self.logger.as_ref(), ctx.log_level);

        let init_outcome = terraform::terraform_init(&binary.exec_path, &working_dir, &env_refs, &ProcessKiller::never())
            .map_err(|(err, outcome)| deployment_error(&err, outcome.as_ref(), "terraform init failed"))?;
        forward_outcome(&forwarder, &init_outcome);

        let apply_outcome = terraform::terraform_apply(&binary.exec_path, &working_dir, &env_refs, &ProcessKiller::never())
            .map_err(|(err, outcome)| deployment_error(&err, outcome.as_ref(), "terraform apply failed"))?;
        forward_outcome(&forwarder, &apply_outcome);

        let output_outcome = terraform::terraform_output(&binary.exec_path, &working_dir, &env_refs, &ProcessKiller::never())
            .map_err(|(err, outcome)| deployment_error(&err, outcome.as_ref(), "reading terraform outputs failed"))?;
        let outputs = parse_outputs(&output_outcome.stdout.join("\n"));

        let state_list_outcome = terraform::terraform_state_list(&binary.exec_path, &working_dir, &env_refs, &ProcessKiller::never())
            .map_err(|(err, outcome)| deployment_error(&err, outcome.as_ref(), "listing terraform state failed"))?;
        let resources: Vec<String> = state_list_outcome.stdout.into_iter().filter(|line| !line.trim().is_empty()).collect();

        let secret_suffix = config_synth::secret_suffix(&ctx.resource_recipe.resource_id);
        backend::verify_state_secret_exists(self.kube_client.as_ref(), &ctx.env_config.runtime.kubernetes.namespace, &secret_suffix)?;

        Ok(DeployResult { outputs, resources })
    }

    fn delete_inner(&self, ctx: &RecipeInvocationContext) -> Result<(), RecipeEngineError> {
        let (working_dir, binary, envs, inspect) = self.setup_and_inspect(ctx)?;
        let env_refs = env_refs(&envs);

        let provider_configs = provider::build_provider_configs(ctx, &inspect)?;
        let config = TerraformConfig::stub(ctx).enrich(ctx, &inspect, &provider_configs);
        config.write(&working_dir)?;

        let module_dir = module_inspect::module_source_dir(&working_dir, &ctx.env_recipe.name, &ctx.env_recipe.template_path);
        let primary_fields = primary_provider_fields(&provider_configs);
        injector::inject_into_module_dir(&module_dir, &primary_fields)?;

        terraform::terraform_init(&binary.exec_path, &working_dir, &env_refs, &ProcessKiller::never())
            .map_err(|(err, outcome)| deletion_error(&err, outcome.as_ref(), "terraform init failed"))?;

        terraform::terraform_destroy(&binary.exec_path, &working_dir, &env_refs, &ProcessKiller::never())
            .map_err(|(err, outcome)| deletion_error(&err, outcome.as_ref(), "terraform destroy failed"))?;

        let secret_suffix = config_synth::secret_suffix(&ctx.resource_recipe.resource_id);
        backend::delete_state_secret(self.kube_client.as_ref(), &ctx.env_config.runtime.kubernetes.namespace, &secret_suffix)
    }

    fn get_recipe_metadata_inner(&self, ctx: &RecipeInvocationContext) -> Result<ModuleMetadata, RecipeEngineError> {
        let (_working_dir, _binary, _envs, inspect) = self.setup_and_inspect(ctx)?;
        // Built for validation (a misconfigured credential selector should surface here, before
        // a caller ever reaches `init`/`apply`) even though the returned metadata doesn't carry
        // provider data — SPEC_FULL.md §4.9 runs GetRecipeMetadata through step 5.
        let _ = provider::build_provider_configs(ctx, &inspect)?;
        Ok(ModuleMetadata::from(&inspect))
    }
}

fn remove_dir_guard(dir: std::path::PathBuf) {
    let _ = scoped_fs::remove_invocation_dir(&dir);
}

fn primary_provider_fields(provider_configs: &BTreeMap<String, Vec<provider::ProviderConfig>>) -> BTreeMap<String, BTreeMap<String, serde_json::Value>> {
    provider_configs.iter().filter_map(|(name, blocks)| blocks.first().map(|block| (name.clone(), block.to_json_map()))).collect()
}

fn env_refs(envs: &[(String, String)]) -> Vec<(&str, &str)> {
    envs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

/// Builds the child-process environment from `recipe_config.env.additional_properties` plus
/// `recipe_config.env_secrets`, resolved against the already-populated `ctx.secrets`. A missing
/// source/key is fatal (SPEC_FULL.md §6).
fn build_process_envs(ctx: &RecipeInvocationContext) -> Result<Vec<(String, String)>, RecipeEngineError> {
    let mut envs: Vec<(String, String)> =
        ctx.env_config.recipe_config.env.additional_properties.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

    for (env_var, secret_ref) in &ctx.env_config.recipe_config.env_secrets {
        let value = ctx
            .secret(&secret_ref.source)
            .and_then(|resolved| resolved.data.get(&secret_ref.key))
            .ok_or_else(|| {
                RecipeEngineError::setup(format!(
                    "env secret `{env_var}` references unknown source/key `{}/{}`",
                    secret_ref.source, secret_ref.key
                ))
            })?;
        envs.push((env_var.clone(), value.clone()));
    }

    Ok(envs)
}

/// Extracts plain output values from `terraform output -json`'s `{name: {value, type, ...}}`
/// shape. Empty/unparseable output (e.g. the module declares no `result` output) yields an empty
/// object rather than an error.
fn parse_outputs(raw: &str) -> serde_json::Value {
    let Ok(serde_json::Value::Object(entries)) = serde_json::from_str::<serde_json::Value>(raw) else {
        return serde_json::json!({});
    };

    let mut outputs = serde_json::Map::new();
    for (name, meta) in entries {
        outputs.insert(name, meta.get("value").cloned().unwrap_or(serde_json::Value::Null));
    }
    serde_json::Value::Object(outputs)
}

fn deployment_error(err: &CommandError, outcome: Option<&TerraformOutcome>, context: &str) -> RecipeEngineError {
    let stderr_tail = tail(outcome, 40);
    let kind = classify_terraform_failure(&stderr_tail);
    RecipeEngineError::RecipeDeploymentFailed { message: format!("{context}: {kind} ({err})"), stderr_tail }
}

fn deletion_error(err: &CommandError, outcome: Option<&TerraformOutcome>, context: &str) -> RecipeEngineError {
    let stderr_tail = tail(outcome, 40);
    let kind = classify_terraform_failure(&stderr_tail);
    RecipeEngineError::RecipeDeletionFailed { message: format!("{context}: {kind} ({err})"), stderr_tail }
}

fn tail(outcome: Option<&TerraformOutcome>, max_lines: usize) -> String {
    outcome.map(|o| o.stderr.iter().rev().take(max_lines).rev().cloned().collect::<Vec<_>>().join("\n")).unwrap_or_default()
}

fn forward_outcome(forwarder: &ProcessLogForwarder, outcome: &TerraformOutcome) {
    for line in &outcome.stdout {
        forwarder.forward_stdout(line);
    }
    for line in &outcome.stderr {
        forwarder.forward_stderr(line);
    }
}
