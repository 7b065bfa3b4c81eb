//! Binary Installer (C2): produces a working `terraform` executable path, installing it at most
//! once per shared slot. Grounded on the teacher's `cmd::terraform` probing idiom (`terraform
//! version` via [`ChildProcess`]) and on the xtask example's download → zip-extract → chmod
//! `0o755` install sequence, generalized into the three-tier slot lookup described in
//! SPEC_FULL.md §4.2.

pub mod registry_source;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::cmd::command::{ChildProcess, ProcessKiller};
use crate::config::TerraformVersionSource;
use crate::context::RecipeInvocationContext;
use crate::errors::RecipeEngineError;

pub use registry_source::{CustomRegistrySource, RegistrySourceInput};

const MARKER_FILE: &str = ".terraform-ready";

/// Process-wide map of named locks, one per shared-slot path, so unrelated `<tf-root>`s (used
/// only in tests, where each test picks its own `TERRAFORM_TEST_GLOBAL_DIR`) never contend on
/// the same mutex. This is the "named lock keyed on the shared-slot path" from SPEC_FULL.md §5.
static INSTALL_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let mut locks = INSTALL_LOCKS.lock().unwrap();
    locks.entry(path.to_path_buf()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
}

/// The vendor-provided latest-release downloader, source A in SPEC_FULL.md §4.2. A thin wrapper
/// so the installer can depend on a trait object and tests can substitute a fake that never
/// touches the network.
pub trait Downloader: Send + Sync {
    fn download(&self, install_dir: &Path, abort: &ProcessKiller) -> Result<PathBuf, RecipeEngineError>;
}

#[derive(Debug, Clone)]
pub struct InstalledBinary {
    pub exec_path: PathBuf,
    pub version_string: String,
}

/// Resolves `<tf-root>` honoring the test-only environment overrides. Read once when the
/// installer is constructed, as required by SPEC_FULL.md §4.2, rather than on every call, so a
/// test flipping the env var mid-run cannot change which directory an in-flight installer uses.
#[derive(Debug, Clone)]
pub struct BinarySlots {
    pub pre_mounted: PathBuf,
    pub shared: PathBuf,
}

impl BinarySlots {
    pub fn resolve() -> Self {
        let tf_root = std::env::var("TERRAFORM_TEST_GLOBAL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/terraform-root"));

        BinarySlots { pre_mounted: tf_root.join("current"), shared: tf_root.join(".terraform-global").join("terraform") }
    }

    fn shared_dir(&self) -> PathBuf {
        self.shared.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
    }

    fn marker(&self) -> PathBuf {
        self.shared_dir().join(MARKER_FILE)
    }
}

/// Per-invocation download staging directory (data-model slot 3), used only when both shared
/// slots miss. The downloaded/extracted binary is staged here, then moved into the shared slot
/// under the install lock — never downloaded directly into the shared slot — so a concurrent
/// reader can never observe a partially-written shared binary. Overridable in tests so a forced
/// download never writes under the real host filesystem layout.
fn installer_dir(invocation_root: &Path) -> PathBuf {
    std::env::var("TERRAFORM_TEST_INSTALLER_DIR").map(PathBuf::from).unwrap_or_else(|_| invocation_root.join(".terraform-bin"))
}

pub struct BinaryInstaller {
    slots: BinarySlots,
    downloader: Box<dyn Downloader>,
}

impl BinaryInstaller {
    pub fn new(downloader: Box<dyn Downloader>) -> Self {
        BinaryInstaller { slots: BinarySlots::resolve(), downloader }
    }

    /// Runs the three-tier lookup described in SPEC_FULL.md §4.2. `ctx.env_config.recipe_config
    /// .terraform.version` drives the choice between the default downloader and the
    /// [`CustomRegistrySource`] (C3) when present, and supplies the secret-backed CA
    /// certificate/auth token [`CustomRegistrySource`] needs, resolved against `ctx.secrets`.
    pub fn resolve(
        &self,
        invocation_root: &Path,
        ctx: &RecipeInvocationContext,
        abort: &ProcessKiller,
    ) -> Result<InstalledBinary, RecipeEngineError> {
        let version_source = ctx.env_config.recipe_config.terraform.version.as_ref();

        if let Some(binary) = probe(&self.slots.pre_mounted) {
            return Ok(binary);
        }

        if self.slots.marker().is_file() {
            if let Some(binary) = probe(&self.slots.shared) {
                return Ok(binary);
            }
        }

        let lock = lock_for(&self.slots.shared);
        let _guard = lock.lock().unwrap();

        // Re-check under the lock: another thread may have installed it while we waited.
        if self.slots.marker().is_file() {
            if let Some(binary) = probe(&self.slots.shared) {
                return Ok(binary);
            }
        }

        let shared_dir = self.slots.shared_dir();
        fs::create_dir_all(&shared_dir)
            .map_err(|e| RecipeEngineError::binary(format!("cannot create shared install dir: {e}")))?;

        // Stage the download per-invocation (data-model slot 3) rather than writing straight
        // into the shared slot, then move the finished binary into place under the lock.
        let download_dir = installer_dir(invocation_root);
        fs::create_dir_all(&download_dir)
            .map_err(|e| RecipeEngineError::binary(format!("cannot create download staging dir: {e}")))?;

        let installed_path = if needs_custom_source(version_source) {
            let source = version_source.expect("needs_custom_source implies Some");
            let ca_cert_pem = source.tls.as_ref().and_then(|tls| ctx.resolve_secret_ref(&tls.ca_certificate));
            let auth_token = source.authentication.as_ref().and_then(|auth| ctx.resolve_secret_ref(&auth.token));
            let input = RegistrySourceInput::from_version_source(source, &download_dir)?.with_secrets(ca_cert_pem, auth_token);
            CustomRegistrySource::new().install(&input, abort)?
        } else {
            self.downloader.download(&download_dir, abort)?
        };

        if installed_path != self.slots.shared {
            fs::rename(&installed_path, &self.slots.shared)
                .map_err(|e| RecipeEngineError::binary(format!("cannot place installed binary: {e}")))?;
        }
        set_executable(&self.slots.shared)?;
        let _ = fs::remove_dir_all(&download_dir);

        crate::fs::atomic_write(&self.slots.marker(), b"ready")
            .map_err(|e| RecipeEngineError::binary(format!("cannot write install marker: {e}")))?;

        probe(&self.slots.shared)
            .ok_or_else(|| RecipeEngineError::binary("installed terraform binary failed its version probe"))
    }
}

fn needs_custom_source(version_source: Option<&TerraformVersionSource>) -> bool {
    match version_source {
        None => false,
        Some(src) => src.authentication.is_some() || src.tls.is_some() || !src.releases_archive_url.is_empty(),
    }
}

fn set_executable(path: &Path) -> Result<(), RecipeEngineError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms =
            fs::metadata(path).map_err(|e| RecipeEngineError::binary(format!("cannot stat installed binary: {e}")))?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).map_err(|e| RecipeEngineError::binary(format!("cannot chmod installed binary: {e}")))?;
    }
    let _ = path;
    Ok(())
}

/// Runs `{binary} version` and checks the output matches `Terraform v<semver>`. Treats a
/// missing file, a non-executable mode, or a probe failure identically: all three fall through
/// to the next slot rather than aborting (SPEC_FULL.md §4.2 edge cases).
fn probe(path: &Path) -> Option<InstalledBinary> {
    if !is_probably_executable(path) {
        return None;
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut cmd = ChildProcess::new(path, &["version"], &[]);
    cmd.exec_with_output(&mut |line| stdout.push(line), &mut |line| stderr.push(line)).ok()?;

    let joined = stdout.join("\n");
    let re = Regex::new(r"Terraform v(?P<version>\d+\.\d+\.\d+\S*)").ok()?;
    let cap = re.captures(&joined)?;

    Some(InstalledBinary { exec_path: path.to_path_buf(), version_string: cap["version"].to_string() })
}

fn is_probably_executable(path: &Path) -> bool {
    let Ok(metadata) = fs::symlink_metadata(path).or_else(|_| fs::metadata(path)) else {
        return false;
    };
    if !metadata.is_file() && fs::metadata(path).map(|m| !m.is_file()).unwrap_or(true) {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let Ok(real) = fs::metadata(path) else { return false };
        return real.permissions().mode() & 0o111 != 0;
    }

    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    use crate::config::{EnvConfig, KubernetesRuntime, Runtime, TerraformConfigSurface};
    use crate::context::{EnvRecipe, ResourceRecipe};
    use crate::logger::LogLevel;

    fn test_ctx() -> RecipeInvocationContext {
        RecipeInvocationContext {
            root_dir: PathBuf::from("/tmp/x"),
            env_recipe: EnvRecipe { name: "redis".to_string(), template_path: "./mod".to_string(), template_version: None, parameters: BTreeMap::new(), tls: None },
            resource_recipe: ResourceRecipe {
                resource_id: "r".to_string(),
                application_id: "a".to_string(),
                environment_id: "e".to_string(),
                connected_resources: vec![],
                parameters: BTreeMap::new(),
            },
            env_config: EnvConfig { runtime: Runtime { kubernetes: KubernetesRuntime { namespace: "ns".to_string() } }, recipe_config: TerraformConfigSurface::default() },
            secrets: BTreeMap::new(),
            log_level: LogLevel::default(),
        }
    }

    struct FakeDownloader {
        script: &'static str,
    }

    impl Downloader for FakeDownloader {
        fn download(&self, install_dir: &Path, _abort: &ProcessKiller) -> Result<PathBuf, RecipeEngineError> {
            let path = install_dir.join("terraform");
            fs::write(&path, self.script).map_err(|e| RecipeEngineError::binary(e.to_string()))?;
            set_executable(&path)?;
            Ok(path)
        }
    }

    fn fake_terraform_script(version: &str) -> String {
        format!("#!/bin/sh\necho 'Terraform v{version}'\n")
    }

    #[test]
    fn uses_pre_mounted_binary_without_downloading() {
        let tf_root = tempdir().unwrap();
        std::env::set_var("TERRAFORM_TEST_GLOBAL_DIR", tf_root.path());

        let current = tf_root.path().join("current");
        fs::write(&current, fake_terraform_script("1.7.0")).unwrap();
        set_executable(&current).unwrap();

        let installer = BinaryInstaller::new(Box::new(FakeDownloader { script: "should not run" }));
        let invocation_root = tempdir().unwrap();
        let result = installer.resolve(invocation_root.path(), &test_ctx(), &ProcessKiller::never()).unwrap();

        assert_eq!(result.version_string, "1.7.0");
        assert!(!tf_root.path().join(".terraform-global").exists());
        assert!(!invocation_root.path().join(".terraform-bin").exists());
        std::env::remove_var("TERRAFORM_TEST_GLOBAL_DIR");
    }

    #[test]
    fn falls_through_a_non_executable_premounted_binary_and_downloads() {
        let tf_root = tempdir().unwrap();
        std::env::set_var("TERRAFORM_TEST_GLOBAL_DIR", tf_root.path());

        let current = tf_root.path().join("current");
        fs::write(&current, "not a valid script").unwrap();
        // deliberately not executable

        let installer = BinaryInstaller::new(Box::new(FakeDownloader { script: &fake_terraform_script_static() }));
        let invocation_root = tempdir().unwrap();
        let result = installer.resolve(invocation_root.path(), &test_ctx(), &ProcessKiller::never()).unwrap();

        assert_eq!(result.version_string, "1.8.0");
        assert!(tf_root.path().join(".terraform-global/.terraform-ready").exists());
        // the per-invocation staging dir is cleaned up once the binary lands in the shared slot
        assert!(!invocation_root.path().join(".terraform-bin").exists());
        std::env::remove_var("TERRAFORM_TEST_GLOBAL_DIR");
    }

    fn fake_terraform_script_static() -> String {
        fake_terraform_script("1.8.0")
    }

    #[test]
    fn reuses_shared_slot_once_marker_present() {
        let tf_root = tempdir().unwrap();
        std::env::set_var("TERRAFORM_TEST_GLOBAL_DIR", tf_root.path());

        let shared_dir = tf_root.path().join(".terraform-global");
        fs::create_dir_all(&shared_dir).unwrap();
        let shared_bin = shared_dir.join("terraform");
        fs::write(&shared_bin, fake_terraform_script("1.9.1")).unwrap();
        set_executable(&shared_bin).unwrap();
        fs::write(shared_dir.join(".terraform-ready"), b"ready").unwrap();

        let installer = BinaryInstaller::new(Box::new(FakeDownloader { script: "should not run" }));
        let invocation_root = tempdir().unwrap();
        let result = installer.resolve(invocation_root.path(), &test_ctx(), &ProcessKiller::never()).unwrap();

        assert_eq!(result.version_string, "1.9.1");
        std::env::remove_var("TERRAFORM_TEST_GLOBAL_DIR");
    }
}
