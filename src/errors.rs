//! Error taxonomy for the recipe execution engine.
//!
//! Splits a sanitized, user-facing message from a raw detail blob that is logged but never
//! returned to callers (mirrors the `TerraformError`/`CommandError` split in process execution).

use std::fmt::{Display, Formatter};

/// Top-level error type returned by every public operation of the engine.
#[derive(thiserror::Error, Debug)]
pub enum RecipeEngineError {
    /// Preconditions failed: empty recipe name, invalid URL, missing namespace, secret lookup
    /// failed, working-dir creation failed.
    #[error("recipe setup failed: {message}")]
    RecipeSetupError { message: String },

    /// Module or archive download error.
    #[error("recipe download failed: {message}")]
    RecipeDownloadFailed { message: String, raw: Option<String> },

    /// `init`/`apply` failure. Carries the sanitized Terraform stderr tail.
    #[error("recipe deployment failed: {message}")]
    RecipeDeploymentFailed { message: String, stderr_tail: String },

    /// `destroy` failure.
    #[error("recipe deletion failed: {message}")]
    RecipeDeletionFailed { message: String, stderr_tail: String },

    /// State secret missing after apply.
    #[error("post-condition failed: {message}")]
    PostConditionFailure { message: String },

    /// HCL/JSON parse or write failure during credential injection.
    #[error("credential injection failed: {message}")]
    InjectionError { message: String },

    /// Install/probe failure for the Terraform binary.
    #[error("binary error: {message}")]
    BinaryError { message: String },

    /// The operation was cancelled via its `ProcessKiller`/cancellation signal.
    #[error("operation cancelled: {message}")]
    CancelledError { message: String },
}

impl RecipeEngineError {
    pub fn setup(message: impl Into<String>) -> Self {
        RecipeEngineError::RecipeSetupError { message: message.into() }
    }

    pub fn binary(message: impl Into<String>) -> Self {
        RecipeEngineError::BinaryError { message: message.into() }
    }

    pub fn injection(message: impl Into<String>) -> Self {
        RecipeEngineError::InjectionError { message: message.into() }
    }

    /// The component name this error originated in, used for structured logging.
    pub fn component(&self) -> &'static str {
        match self {
            RecipeEngineError::RecipeSetupError { .. } => "setup",
            RecipeEngineError::RecipeDownloadFailed { .. } => "module-download",
            RecipeEngineError::RecipeDeploymentFailed { .. } => "terraform",
            RecipeEngineError::RecipeDeletionFailed { .. } => "terraform",
            RecipeEngineError::PostConditionFailure { .. } => "backend-store",
            RecipeEngineError::InjectionError { .. } => "credential-injector",
            RecipeEngineError::BinaryError { .. } => "binary-installer",
            RecipeEngineError::CancelledError { .. } => "cancellation",
        }
    }

    /// A terse, secret-free message safe to surface to the caller (logged contexts like raw
    /// file paths or secret names stay out of this string, matching the teacher's
    /// `to_safe_message`/`message_safe` convention).
    pub fn safe_message(&self) -> String {
        match self {
            RecipeEngineError::RecipeSetupError { message } => message.clone(),
            RecipeEngineError::RecipeDownloadFailed { message, .. } => message.clone(),
            RecipeEngineError::RecipeDeploymentFailed { message, .. } => message.clone(),
            RecipeEngineError::RecipeDeletionFailed { message, .. } => message.clone(),
            RecipeEngineError::PostConditionFailure { message } => message.clone(),
            RecipeEngineError::InjectionError { message } => message.clone(),
            RecipeEngineError::BinaryError { message } => message.clone(),
            RecipeEngineError::CancelledError { message } => message.clone(),
        }
    }
}

/// Classification of a raw Terraform CLI failure, following the teacher's
/// `cmd::terraform::TerraformError` regex-driven classification.
#[derive(Debug, PartialEq, Eq)]
pub enum TerraformFailureKind {
    InvalidCredentials,
    QuotaExceeded { resource_type: String, max_resource_count: Option<u32> },
    NotEnoughPermissions { user: String, action: String, resource: String },
    Unknown,
}

impl Display for TerraformFailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TerraformFailureKind::InvalidCredentials => write!(f, "invalid credentials"),
            TerraformFailureKind::QuotaExceeded { resource_type, max_resource_count } => write!(
                f,
                "quota exceeded for {resource_type}{}",
                max_resource_count.map(|c| format!(" (max {c})")).unwrap_or_default()
            ),
            TerraformFailureKind::NotEnoughPermissions { user, action, resource } => {
                write!(f, "user `{user}` cannot perform `{action}` on `{resource}`")
            }
            TerraformFailureKind::Unknown => write!(f, "unclassified terraform failure"),
        }
    }
}

/// Classifies a raw Terraform stderr blob into a known failure kind, same regexes as the
/// teacher's `TerraformError::new`.
pub fn classify_terraform_failure(raw_output: &str) -> TerraformFailureKind {
    use regex::Regex;

    if raw_output.contains(
        "error calling sts:GetCallerIdentity: operation error STS: GetCallerIdentity, https response error StatusCode: 403",
    ) {
        return TerraformFailureKind::InvalidCredentials;
    }

    if let Ok(re) = Regex::new(
        r"You have exceeded the limit of (?P<resource_type>[\w?\s]+) allowed on your AWS account \((?P<max_resource_count>\d+) by default\)",
    ) {
        if let Some(cap) = re.captures(raw_output) {
            return TerraformFailureKind::QuotaExceeded {
                resource_type: cap["resource_type"].to_string(),
                max_resource_count: cap["max_resource_count"].parse().ok(),
            };
        }
    }

    if let Ok(re) = Regex::new(
        r"AccessDenied: User: (?P<user>.+?) is not authorized to perform: (?P<action>.+?) on resource: (?P<resource>.+?) because",
    ) {
        if let Some(cap) = re.captures(raw_output) {
            return TerraformFailureKind::NotEnoughPermissions {
                user: cap["user"].to_string(),
                action: cap["action"].to_string(),
                resource: cap["resource"].to_string(),
            };
        }
    }

    TerraformFailureKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_invalid_credentials() {
        let raw = "Error: error configuring Terraform AWS Provider: error validating provider credentials: error calling sts:GetCallerIdentity: operation error STS: GetCallerIdentity, https response error StatusCode: 403";
        assert_eq!(classify_terraform_failure(raw), TerraformFailureKind::InvalidCredentials);
    }

    #[test]
    fn classifies_quota_exceeded() {
        let raw = "You have exceeded the limit of vCPUs allowed on your AWS account (32 by default).";
        assert_eq!(
            classify_terraform_failure(raw),
            TerraformFailureKind::QuotaExceeded { resource_type: "vCPUs".to_string(), max_resource_count: Some(32) }
        );
    }

    #[test]
    fn classifies_not_enough_permissions() {
        let raw = "Error: error creating IAM policy foo: AccessDenied: User: arn:aws:iam::1:user/bob is not authorized to perform: iam:CreatePolicy on resource: policy foo because no identity-based policy allows the iam:CreatePolicy action";
        assert_eq!(
            classify_terraform_failure(raw),
            TerraformFailureKind::NotEnoughPermissions {
                user: "arn:aws:iam::1:user/bob".to_string(),
                action: "iam:CreatePolicy".to_string(),
                resource: "policy foo".to_string(),
            }
        );
    }

    #[test]
    fn falls_back_to_unknown() {
        assert_eq!(classify_terraform_failure("some unrelated error"), TerraformFailureKind::Unknown);
    }

    #[test]
    fn safe_message_never_echoes_raw_field() {
        let err = RecipeEngineError::RecipeDeploymentFailed {
            message: "apply failed".to_string(),
            stderr_tail: "AKIA-super-secret-leaked-here".to_string(),
        };
        assert!(!err.safe_message().contains("AKIA"));
    }
}
