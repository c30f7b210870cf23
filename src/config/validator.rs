//! Settings and declaration validation.
//!
//! Field ranges are checked by the `validator` derive on the settings
//! types; this module adds the cross-field and naming rules the derive
//! cannot express, collecting every problem before failing.

use std::collections::HashSet;
use tracing::debug;
use validator::Validate;

use crate::declaration::{DeclarationSet, ModuleCall, ResourceDeclaration};
use crate::error::{ConfigError, Result};
use crate::state::is_valid_workspace_name;

use super::settings::{BackendKind, Settings};

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

/// Validator for settings and declarations.
#[derive(Debug, Default)]
pub struct SettingsValidator;

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn into_result(self) -> Result<Self> {
        match self.errors.first() {
            None => Ok(self),
            Some(first) => Err(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            }
            .into()),
        }
    }
}

impl SettingsValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates engine settings.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self, settings: &Settings) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        if let Err(errors) = settings.validate() {
            for (field, problems) in errors.field_errors() {
                for problem in problems {
                    let message = problem
                        .message
                        .as_ref()
                        .map_or_else(|| format!("{field} is invalid ({})", problem.code), ToString::to_string);
                    result.error(field.to_string(), message);
                }
            }
            if result.errors.is_empty() {
                result.error("settings", errors.to_string());
            }
        }

        match settings.state.backend {
            BackendKind::S3 => {
                if settings.state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using the s3 backend",
                    );
                }
            }
            BackendKind::Local => {
                if settings.state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }

        if let Some(workspace) = &settings.workspace
            && !is_valid_workspace_name(workspace)
        {
            result.error("workspace", format!("Invalid workspace name '{workspace}'"));
        }

        if settings.lock_holder.as_ref().is_some_and(|h| h.trim().is_empty()) {
            result.error("lock_holder", "Lock holder cannot be empty");
        }

        debug!("Settings validation finished with {} error(s)", result.errors.len());
        result.into_result()
    }

    /// Checks declaration names. Structural problems (cycles, references,
    /// duplicate instances) are reported by the graph builder.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate_declarations(&self, declarations: &DeclarationSet) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();
        Self::validate_scope(declarations, "", &mut result);
        result.into_result()
    }

    fn validate_scope(declarations: &DeclarationSet, prefix: &str, result: &mut ValidationResult) {
        if declarations.is_empty() && prefix.is_empty() {
            result.warnings.push(String::from("No resources declared"));
        }

        let mut seen = HashSet::new();
        for (i, resource) in declarations.resources.iter().enumerate() {
            let field = format!("{prefix}resources[{i}]");
            Self::validate_resource(resource, &field, result);
            if !seen.insert((resource.resource_type.as_str(), resource.name.as_str())) {
                result.error(
                    format!("{field}.name"),
                    format!("Duplicate resource {}.{}", resource.resource_type, resource.name),
                );
            }
        }

        let mut calls = HashSet::new();
        for (i, call) in declarations.modules.iter().enumerate() {
            let field = format!("{prefix}modules[{i}]");
            Self::validate_call(call, &field, result);
            if !calls.insert(call.name.as_str()) {
                result.error(format!("{field}.name"), format!("Duplicate module call {}", call.name));
            }
            Self::validate_scope(&call.body, &format!("{field}.body."), result);
        }

        let mut outputs = HashSet::new();
        for (i, output) in declarations.outputs.iter().enumerate() {
            if !outputs.insert(output.name.as_str()) {
                result.error(
                    format!("{prefix}outputs[{i}].name"),
                    format!("Duplicate output {}", output.name),
                );
            }
        }
    }

    fn validate_resource(resource: &ResourceDeclaration, field: &str, result: &mut ValidationResult) {
        if !is_valid_name(&resource.resource_type) {
            result.error(
                format!("{field}.type"),
                format!(
                    "Resource type '{}' is invalid. Must be lowercase alphanumeric with underscores.",
                    resource.resource_type
                ),
            );
        }
        if !is_valid_name(&resource.name) {
            result.error(
                format!("{field}.name"),
                format!(
                    "Resource name '{}' is invalid. Must be lowercase alphanumeric with underscores or hyphens.",
                    resource.name
                ),
            );
        }
        if resource.lifecycle.prevent_destroy && resource.lifecycle.create_before_destroy {
            result.warnings.push(format!(
                "{field}.lifecycle: create_before_destroy has no effect while prevent_destroy is set"
            ));
        }
    }

    fn validate_call(call: &ModuleCall, field: &str, result: &mut ValidationResult) {
        if !is_valid_name(&call.name) {
            result.error(
                format!("{field}.name"),
                format!("Module name '{}' is invalid.", call.name),
            );
        }
    }
}

/// Checks if a name is valid: starts with a lowercase letter or
/// underscore, then lowercase letters, digits, underscores or hyphens.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        && name.len() <= 64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::Expr;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("bucket"));
        assert!(is_valid_name("local_file"));
        assert!(is_valid_name("web-1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("1bucket"));
        assert!(!is_valid_name("Bucket"));
        assert!(!is_valid_name("a.b"));
    }

    #[test]
    fn test_s3_requires_bucket() {
        let mut settings = Settings::default();
        settings.state.backend = BackendKind::S3;
        let err = SettingsValidator::new().validate(&settings).expect_err("no bucket");
        assert!(err.to_string().contains("bucket"));

        settings.state.bucket = Some(String::from("team-state"));
        assert!(SettingsValidator::new().validate(&settings).is_ok());
    }

    #[test]
    fn test_parallelism_reported() {
        let settings = Settings {
            parallelism: 0,
            ..Settings::default()
        };
        let err = SettingsValidator::new().validate(&settings).expect_err("range");
        assert!(err.to_string().contains("parallelism"));
    }

    #[test]
    fn test_duplicate_resources() {
        let declarations = DeclarationSet {
            resources: vec![
                ResourceDeclaration::new("bucket", "logs").with_argument("name", Expr::string("a")),
                ResourceDeclaration::new("bucket", "logs").with_argument("name", Expr::string("b")),
            ],
            ..DeclarationSet::default()
        };
        let err = SettingsValidator::new()
            .validate_declarations(&declarations)
            .expect_err("duplicate");
        assert!(err.to_string().contains("Duplicate resource bucket.logs"));
    }
}
