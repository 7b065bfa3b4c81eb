//! Drives the `terraform` binary itself, grounded on the teacher's `cmd::terraform` module:
//! the `TerraformAction` bitflags, the `manage_common_issues` auto-repair loop and the
//! `terraform get/init/apply/destroy` wrappers all come from there, generalized from
//! Qovery's cloud-provider-specific plumbing down to the actions this engine actually drives.

use std::path::Path;
use std::time::Duration;

use bitflags::bitflags;
use rand::Rng;
use retry::delay::Fixed;
use retry::OperationResult;

use crate::cmd::command::{ChildProcess, CommandError, ProcessKiller};
use crate::errors::{classify_terraform_failure, TerraformFailureKind};

bitflags! {
    /// The subset of the Terraform CLI surface this engine drives. Kept as bitflags, as in the
    /// teacher, even though the executor only ever requests one action at a time today — it's
    /// how the teacher's retry/auto-repair plumbing is shaped and callers may reasonably want
    /// `INIT | VALIDATE` later.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TerraformAction: u32 {
        const INIT        = 1 << 0;
        const VALIDATE    = 1 << 1;
        const APPLY       = 1 << 2;
        const DESTROY     = 1 << 3;
        const STATE_LIST  = 1 << 4;
        const GET         = 1 << 5;
    }
}

pub struct TerraformOutcome {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Runs a Terraform failure through the same auto-repair heuristic the teacher applies: a
/// corrupted provider plugin cache manifests as "Failed to install provider from shared cache"
/// on `init`, and is fixed by dropping `.terraform.lock.hcl` and retrying after a short jittered
/// sleep so concurrent invocations sharing a plugin cache don't thrash in lockstep.
fn manage_common_issues(working_dir: &Path, raw_stderr: &str) -> bool {
    if raw_stderr.contains("Failed to install provider from shared cache") {
        let lock_file = working_dir.join(".terraform.lock.hcl");
        if lock_file.exists() {
            let _ = std::fs::remove_file(&lock_file);
        }
        let jitter_ms = rand::rng().random_range(250..2000);
        std::thread::sleep(Duration::from_millis(jitter_ms));
        return true;
    }

    false
}

fn terraform_exec(
    binary: &Path,
    working_dir: &Path,
    args: &[&str],
    envs: &[(&str, &str)],
    abort_notifier: &ProcessKiller,
) -> (TerraformOutcome, Option<CommandError>) {
    let plugin_cache_dir = working_dir.join(".terraform.d/plugin-cache");
    let _ = std::fs::create_dir_all(&plugin_cache_dir);
    let plugin_cache_dir = plugin_cache_dir.to_string_lossy().into_owned();

    let mut full_envs: Vec<(&str, &str)> = vec![("TF_PLUGIN_CACHE_DIR", plugin_cache_dir.as_str()), ("TF_IN_AUTOMATION", "1")];
    full_envs.extend_from_slice(envs);

    let mut cmd = ChildProcess::new(binary, args, &full_envs);
    cmd.set_current_dir(working_dir);

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let result = cmd.exec_with_abort(&mut |line| stdout.push(line), &mut |line| stderr.push(line), abort_notifier);

    (TerraformOutcome { stdout, stderr }, result.err())
}

/// Runs a Terraform subcommand, retrying a bounded number of times when
/// [`manage_common_issues`] recognizes a transient, self-inflicted failure. Any other failure
/// is returned immediately, paired with the captured outcome so the caller can classify the
/// stderr tail into a `RecipeDeploymentFailed`/`RecipeDeletionFailed` error.
fn terraform_run(
    binary: &Path,
    working_dir: &Path,
    args: &[&str],
    envs: &[(&str, &str)],
    abort_notifier: &ProcessKiller,
) -> Result<TerraformOutcome, (CommandError, Option<TerraformOutcome>)> {
    let result = retry::retry(Fixed::from_millis(500).take(2), || {
        let (outcome, err) = terraform_exec(binary, working_dir, args, envs, abort_notifier);
        match err {
            None => OperationResult::Ok(outcome),
            Some(err) => {
                let is_exit_error = matches!(err, CommandError::ExitStatusError(_));
                if is_exit_error && manage_common_issues(working_dir, &outcome.stderr.join("\n")) {
                    OperationResult::Retry((err, outcome))
                } else {
                    OperationResult::Err((err, outcome))
                }
            }
        }
    });

    result.map_err(|retry_err| {
        let (err, outcome) = retry_err.error;
        (err, Some(outcome))
    })
}

pub fn terraform_init(
    binary: &Path,
    working_dir: &Path,
    envs: &[(&str, &str)],
    abort_notifier: &ProcessKiller,
) -> Result<TerraformOutcome, (CommandError, Option<TerraformOutcome>)> {
    terraform_run(binary, working_dir, &["init", "-no-color"], envs, abort_notifier)
}

pub fn terraform_get(
    binary: &Path,
    working_dir: &Path,
    envs: &[(&str, &str)],
    abort_notifier: &ProcessKiller,
) -> Result<TerraformOutcome, (CommandError, Option<TerraformOutcome>)> {
    terraform_run(binary, working_dir, &["get", "-no-color"], envs, abort_notifier)
}

pub fn terraform_apply(
    binary: &Path,
    working_dir: &Path,
    envs: &[(&str, &str)],
    abort_notifier: &ProcessKiller,
) -> Result<TerraformOutcome, (CommandError, Option<TerraformOutcome>)> {
    terraform_run(binary, working_dir, &["apply", "-auto-approve", "-no-color"], envs, abort_notifier)
}

pub fn terraform_destroy(
    binary: &Path,
    working_dir: &Path,
    envs: &[(&str, &str)],
    abort_notifier: &ProcessKiller,
) -> Result<TerraformOutcome, (CommandError, Option<TerraformOutcome>)> {
    terraform_run(binary, working_dir, &["destroy", "-auto-approve", "-no-color"], envs, abort_notifier)
}

pub fn terraform_state_list(
    binary: &Path,
    working_dir: &Path,
    envs: &[(&str, &str)],
    abort_notifier: &ProcessKiller,
) -> Result<TerraformOutcome, (CommandError, Option<TerraformOutcome>)> {
    terraform_run(binary, working_dir, &["state", "list", "-no-color"], envs, abort_notifier)
}

/// Reads back the applied module's outputs as JSON. Run against the `kubernetes` backend
/// configured by the Config Synthesizer, so this always reflects the authoritative remote
/// state, never a local `terraform.tfstate` file.
pub fn terraform_output(
    binary: &Path,
    working_dir: &Path,
    envs: &[(&str, &str)],
    abort_notifier: &ProcessKiller,
) -> Result<TerraformOutcome, (CommandError, Option<TerraformOutcome>)> {
    terraform_run(binary, working_dir, &["output", "-json", "-no-color"], envs, abort_notifier)
}

/// Classifies the stderr tail of a failed `init`/`apply`/`destroy` run into a
/// `TerraformFailureKind`, joining the buffered lines the way the teacher joins its captured
/// output before running it through `TerraformError::new`.
pub fn classify_outcome_failure(outcome: &TerraformOutcome) -> TerraformFailureKind {
    classify_terraform_failure(&outcome.stderr.join("\n"))
}
