//! Custom Registry Source (C3): downloads a Terraform archive from an authenticated/TLS-custom
//! mirror. Grounded on the same xtask `download_terraform_zip`/`extract_and_install` idiom as
//! the default downloader in [`super`], with the bearer-token header and custom-root-CA pattern
//! used for `reqwest::blocking::Client` construction across the engine's provider integrations.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use url::Url;
use zip::ZipArchive;

use crate::cmd::command::ProcessKiller;
use crate::config::TerraformVersionSource;
use crate::errors::RecipeEngineError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Resolved inputs for one archive download, built from `env_config.recipe_config.terraform.version`.
pub struct RegistrySourceInput {
    pub product: String,
    pub version: String,
    pub base_url: Option<String>,
    pub archive_url: Option<String>,
    pub install_dir: PathBuf,
    pub ca_cert_pem: Option<String>,
    pub insecure_skip_verify: bool,
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

impl RegistrySourceInput {
    /// Builds the download input from the `env_config` surface. Secret-backed fields (CA cert,
    /// auth token) are expected to have already been substituted into plain strings by the
    /// caller — the Custom Registry Source itself never talks to the Secret Resolver.
    pub fn from_version_source(source: &TerraformVersionSource, install_dir: &Path) -> Result<Self, RecipeEngineError> {
        Ok(RegistrySourceInput {
            product: "terraform".to_string(),
            version: source.version.clone(),
            base_url: if source.releases_api_base_url.is_empty() { None } else { Some(source.releases_api_base_url.clone()) },
            archive_url: if source.releases_archive_url.is_empty() { None } else { Some(source.releases_archive_url.clone()) },
            install_dir: install_dir.to_path_buf(),
            ca_cert_pem: None,
            insecure_skip_verify: false,
            auth_token: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Attaches resolved secret material (CA PEM, bearer token) the executor looked up via the
    /// Secret Resolver before the binary install step began.
    pub fn with_secrets(mut self, ca_cert_pem: Option<String>, auth_token: Option<String>) -> Self {
        self.ca_cert_pem = ca_cert_pem;
        self.auth_token = auth_token;
        self
    }
}

#[derive(serde_derive::Deserialize)]
struct IndexResponse {
    versions: std::collections::BTreeMap<String, IndexVersion>,
}

#[derive(serde_derive::Deserialize)]
struct IndexVersion {
    builds: Vec<IndexBuild>,
}

#[derive(serde_derive::Deserialize)]
struct IndexBuild {
    os: String,
    arch: String,
    url: String,
}

pub struct CustomRegistrySource;

impl Default for CustomRegistrySource {
    fn default() -> Self {
        CustomRegistrySource
    }
}

impl CustomRegistrySource {
    pub fn new() -> Self {
        CustomRegistrySource
    }

    /// Downloads and installs the archive described by `input`, returning the path to the
    /// extracted `terraform` binary (not yet moved into its final shared-slot location — the
    /// caller in [`super::BinaryInstaller`] handles that rename).
    pub fn install(&self, input: &RegistrySourceInput, _abort: &ProcessKiller) -> Result<PathBuf, RecipeEngineError> {
        let archive_url = match &input.archive_url {
            Some(url) => {
                validate_archive_url(url, input.insecure_skip_verify)?;
                url.clone()
            }
            None => {
                let base_url = input
                    .base_url
                    .as_ref()
                    .ok_or_else(|| RecipeEngineError::binary("registry source needs either base_url or archive_url"))?;
                validate_releases_url(base_url, input.insecure_skip_verify)?;
                resolve_index_url(self, base_url, &input.product, &input.version, input)?
            }
        };

        let client = build_client(input)?;
        let bytes = download(&client, &archive_url, input.auth_token.as_deref())?;

        verify_checksum_if_present(&client, &archive_url, &bytes)?;

        let dest = input.install_dir.join("terraform");
        extract_single_binary(&bytes, &dest)?;
        Ok(dest)
    }
}

/// `validateReleasesURL` from SPEC_FULL.md §8: rejects non-HTTPS URLs unless
/// `insecure_skip_verify` is set, and rejects non-HTTP(S) schemes unconditionally.
pub fn validate_releases_url(raw: &str, insecure_skip_verify: bool) -> Result<(), RecipeEngineError> {
    let url = Url::parse(raw).map_err(|e| RecipeEngineError::binary(format!("invalid registry URL: {e}")))?;
    match url.scheme() {
        "https" => Ok(()),
        "http" if insecure_skip_verify => Ok(()),
        "http" => Err(RecipeEngineError::binary("registry URL must use https unless insecure_skip_verify is set")),
        other => Err(RecipeEngineError::binary(format!("unsupported URL scheme `{other}`"))),
    }
}

/// `validateArchiveURL`: the same rule, plus a `.zip` suffix requirement.
pub fn validate_archive_url(raw: &str, insecure_skip_verify: bool) -> Result<(), RecipeEngineError> {
    validate_releases_url(raw, insecure_skip_verify)?;
    if !raw.ends_with(".zip") {
        return Err(RecipeEngineError::binary("archive URL must end in .zip"));
    }
    Ok(())
}

fn build_client(input: &RegistrySourceInput) -> Result<reqwest::blocking::Client, RecipeEngineError> {
    let mut builder = reqwest::blocking::Client::builder().timeout(input.timeout);

    if input.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let Some(pem) = &input.ca_cert_pem {
        let cert = reqwest::Certificate::from_pem(pem.as_bytes())
            .map_err(|e| RecipeEngineError::binary(format!("invalid CA certificate: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }

    builder.build().map_err(|e| RecipeEngineError::binary(format!("cannot build HTTP client: {e}")))
}

fn download(client: &reqwest::blocking::Client, url: &str, auth_token: Option<&str>) -> Result<Vec<u8>, RecipeEngineError> {
    let response = authorized_get(client, url, auth_token)
        .send()
        .map_err(|e| RecipeEngineError::RecipeDownloadFailed { message: format!("cannot reach `{url}`"), raw: Some(e.to_string()) })?;

    if response.status() == reqwest::StatusCode::UNAUTHORIZED || response.status() == reqwest::StatusCode::FORBIDDEN {
        return Err(RecipeEngineError::binary(format!("registry authentication failed ({})", response.status())));
    }

    let response = response
        .error_for_status()
        .map_err(|e| RecipeEngineError::RecipeDownloadFailed { message: format!("non-success status from `{url}`"), raw: Some(e.to_string()) })?;

    response
        .bytes()
        .map(|b| b.to_vec())
        .map_err(|e| RecipeEngineError::RecipeDownloadFailed { message: "cannot read archive body".to_string(), raw: Some(e.to_string()) })
}

/// Attaches `Authorization: Bearer <token>` by rebuilding the request through `RequestBuilder`
/// rather than threading headers through [`build_client`], so callers without a token pay no
/// extra branch. Folded into [`download`] directly at the call site to keep one HTTP path.
fn authorized_get(client: &reqwest::blocking::Client, url: &str, token: Option<&str>) -> reqwest::blocking::RequestBuilder {
    let mut req = client.get(url);
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }
    req
}

fn resolve_index_url(
    source: &CustomRegistrySource,
    base_url: &str,
    product: &str,
    version: &str,
    input: &RegistrySourceInput,
) -> Result<String, RecipeEngineError> {
    let _ = source;
    let client = build_client(input)?;
    let index_url = format!("{}/{}/index.json", base_url.trim_end_matches('/'), product);

    let response = authorized_get(&client, &index_url, input.auth_token.as_deref())
        .send()
        .map_err(|e| RecipeEngineError::RecipeDownloadFailed { message: format!("cannot fetch `{index_url}`"), raw: Some(e.to_string()) })?
        .error_for_status()
        .map_err(|e| RecipeEngineError::RecipeDownloadFailed { message: "non-success status from registry index".to_string(), raw: Some(e.to_string()) })?;

    let index: IndexResponse = response
        .json()
        .map_err(|e| RecipeEngineError::RecipeDownloadFailed { message: "cannot parse registry index".to_string(), raw: Some(e.to_string()) })?;

    let entry = index
        .versions
        .get(version)
        .ok_or_else(|| RecipeEngineError::RecipeDownloadFailed { message: format!("version `{version}` not published on mirror"), raw: None })?;

    let (os, arch) = (target_os(), target_arch());
    entry
        .builds
        .iter()
        .find(|build| build.os == os && build.arch == arch)
        .map(|build| build.url.clone())
        .ok_or_else(|| RecipeEngineError::RecipeDownloadFailed {
            message: format!("no build for {os}/{arch} at version `{version}`"),
            raw: None,
        })
}

/// Verifies against a sibling `*_SHA256SUMS` artifact when present. A missing or unreachable
/// checksum file is logged and otherwise ignored (SPEC_FULL.md §4.3: "missing checksums logged,
/// not fatal"); a checksum that *is* present and mismatches is `ArchiveVerificationFailed`.
fn verify_checksum_if_present(client: &reqwest::blocking::Client, archive_url: &str, bytes: &[u8]) -> Result<(), RecipeEngineError> {
    let sums_url = format!("{archive_url}_SHA256SUMS");
    let Ok(response) = client.get(&sums_url).send() else {
        debug!("no SHA256SUMS sibling at {sums_url}, skipping checksum verification");
        return Ok(());
    };
    if !response.status().is_success() {
        debug!("SHA256SUMS sibling unavailable at {sums_url} ({}), skipping", response.status());
        return Ok(());
    }
    let Ok(body) = response.text() else {
        debug!("could not read SHA256SUMS body at {sums_url}, skipping");
        return Ok(());
    };

    let file_name = archive_url.rsplit('/').next().unwrap_or(archive_url);
    let expected = body.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let hash = parts.next()?;
        let name = parts.next()?.trim_start_matches('*');
        (name == file_name).then(|| hash.to_string())
    });

    let Some(expected) = expected else {
        debug!("no matching entry for {file_name} in SHA256SUMS, skipping");
        return Ok(());
    };

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let actual = hex_encode(&hasher.finalize());

    if actual != expected.to_lowercase() {
        return Err(RecipeEngineError::RecipeDownloadFailed {
            message: format!("checksum mismatch for {file_name}: expected {expected}, got {actual}"),
            raw: None,
        });
    }

    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn target_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

fn target_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Extracts the single `terraform` binary from a downloaded ZIP archive. Hardened per
/// SPEC_FULL.md §4.3/§8: an entry is only accepted if, after canonicalizing to its base name, it
/// still matches the original (no `..`, no path separators, not absolute).
fn extract_single_binary(zip_bytes: &[u8], dest_path: &Path) -> Result<(), RecipeEngineError> {
    let reader = Cursor::new(zip_bytes);
    let mut archive =
        ZipArchive::new(reader).map_err(|e| RecipeEngineError::binary(format!("not a valid zip archive: {e}")))?;

    for i in 0..archive.len() {
        let mut entry =
            archive.by_index(i).map_err(|e| RecipeEngineError::binary(format!("corrupt zip entry: {e}")))?;
        let name = entry.name().to_string();
        validate_zip_entry_name(&name)?;

        let base = Path::new(&name).file_name().and_then(|s| s.to_str()).unwrap_or("");
        if base == "terraform" || base == "terraform.exe" {
            if let Some(parent) = dest_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RecipeEngineError::binary(e.to_string()))?;
            }
            let mut out = std::fs::File::create(dest_path).map_err(|e| RecipeEngineError::binary(e.to_string()))?;
            std::io::copy(&mut entry, &mut out).map_err(|e| RecipeEngineError::binary(e.to_string()))?;
            return Ok(());
        }
    }

    Err(RecipeEngineError::binary("archive did not contain a terraform binary"))
}

/// The zip-safety property from SPEC_FULL.md §8: rejects `..`, path separators (`/` or `\`), and
/// absolute paths. Checked on the raw entry name directly rather than only after
/// canonicalization, since a canonicalized `..`-free name would otherwise silently resolve
/// outside the destination directory.
fn validate_zip_entry_name(name: &str) -> Result<(), RecipeEngineError> {
    if name.contains("..") {
        return Err(RecipeEngineError::binary(format!("unsafe archive entry `{name}`: directory traversal")));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(RecipeEngineError::binary(format!("unsafe archive entry `{name}`: nested path")));
    }
    if Path::new(name).is_absolute() {
        return Err(RecipeEngineError::binary(format!("unsafe archive entry `{name}`: absolute path")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_http_without_skip_verify() {
        assert!(validate_releases_url("http://example.com/terraform", false).is_err());
    }

    #[test]
    fn allows_http_with_skip_verify() {
        assert!(validate_releases_url("http://example.com/terraform", true).is_ok());
    }

    #[test]
    fn rejects_non_http_scheme_even_with_skip_verify() {
        assert!(validate_releases_url("ftp://example.com/terraform", true).is_err());
    }

    #[test]
    fn archive_url_requires_zip_suffix() {
        assert!(validate_archive_url("https://example.com/terraform.tar.gz", false).is_err());
        assert!(validate_archive_url("https://example.com/terraform.zip", false).is_ok());
    }

    #[test]
    fn rejects_directory_traversal_entry() {
        assert!(validate_zip_entry_name("../etc/passwd").is_err());
    }

    #[test]
    fn rejects_nested_path_entry() {
        assert!(validate_zip_entry_name("sub/terraform").is_err());
    }

    #[test]
    fn rejects_absolute_entry() {
        assert!(validate_zip_entry_name("/etc/passwd").is_err());
    }

    #[test]
    fn accepts_plain_binary_name() {
        assert!(validate_zip_entry_name("terraform").is_ok());
    }

    #[test]
    fn extracts_the_binary_from_a_well_formed_archive() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("terraform.zip");
        {
            let file = std::fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer.start_file::<_, ()>("terraform", zip::write::FileOptions::default()).unwrap();
            use std::io::Write;
            writer.write_all(b"#!/bin/sh\necho hi\n").unwrap();
            writer.finish().unwrap();
        }

        let bytes = std::fs::read(&zip_path).unwrap();
        let dest = dir.path().join("out/terraform");
        extract_single_binary(&bytes, &dest).unwrap();
        assert!(dest.exists());
    }

    #[test]
    fn rejects_archive_whose_only_entry_is_unsafe() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("evil.zip");
        {
            let file = std::fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer.start_file::<_, ()>("../../etc/passwd", zip::write::FileOptions::default()).unwrap();
            use std::io::Write;
            writer.write_all(b"not terraform").unwrap();
            writer.finish().unwrap();
        }

        let bytes = std::fs::read(&zip_path).unwrap();
        let dest = dir.path().join("out/terraform");
        assert!(extract_single_binary(&bytes, &dest).is_err());
    }
}
