//! Loading settings and declarations from disk.
//!
//! Settings come from `converge.yaml` with `CONVERGE_*` environment
//! overrides; declarations come from a separate YAML document.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::declaration::DeclarationSet;
use crate::error::{ConfigError, CoreError, Result};

use super::settings::{BackendKind, Settings};

/// Configuration parser for settings and declaration files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Resolves `path` against the base path.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Loads settings from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Settings> {
        let path = self.resolve(path.as_ref());
        info!("Loading settings from: {}", path.display());

        let content = read_file(&path)?;
        self.parse_yaml(&content, Some(&path))
    }

    /// Parses settings from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Settings> {
        debug!("Parsing settings YAML");

        // An empty document means "all defaults".
        if content.trim().is_empty() {
            return Ok(Settings::default());
        }

        serde_yaml::from_str(content).map_err(|e| yaml_error(&e, source))
    }

    /// Loads settings with environment variable overrides.
    ///
    /// Recognised variables: `CONVERGE_BACKEND`, `CONVERGE_BACKEND_PATH`,
    /// `CONVERGE_S3_BUCKET`, `CONVERGE_S3_PREFIX`, `CONVERGE_S3_REGION`,
    /// `CONVERGE_PARALLELISM` and `CONVERGE_WORKSPACE`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<Settings> {
        let mut settings = self.load_file(path)?;
        Self::apply_env_overrides(&mut settings)?;
        Ok(settings)
    }

    /// Applies environment variable overrides to the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has an invalid value.
    pub fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
        if let Ok(backend) = std::env::var("CONVERGE_BACKEND") {
            debug!("Overriding state.backend from environment");
            settings.state.backend = match backend.to_ascii_lowercase().as_str() {
                "local" => BackendKind::Local,
                "s3" => BackendKind::S3,
                other => {
                    return Err(ConfigError::ValidationError {
                        message: format!("Unknown backend '{other}'"),
                        field: Some(String::from("CONVERGE_BACKEND")),
                    }
                    .into());
                }
            };
        }

        if let Ok(path) = std::env::var("CONVERGE_BACKEND_PATH") {
            debug!("Overriding state.path from environment");
            settings.state.path = Some(PathBuf::from(path));
        }

        if let Ok(bucket) = std::env::var("CONVERGE_S3_BUCKET") {
            debug!("Overriding state.bucket from environment");
            settings.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("CONVERGE_S3_PREFIX") {
            debug!("Overriding state.prefix from environment");
            settings.state.prefix = Some(prefix);
        }

        if let Ok(region) = std::env::var("CONVERGE_S3_REGION") {
            debug!("Overriding state.region from environment");
            settings.state.region = Some(region);
        }

        if let Ok(parallelism) = std::env::var("CONVERGE_PARALLELISM") {
            debug!("Overriding parallelism from environment");
            settings.parallelism = parallelism.parse().map_err(|_| ConfigError::ValidationError {
                message: format!("Invalid parallelism '{parallelism}'"),
                field: Some(String::from("CONVERGE_PARALLELISM")),
            })?;
        }

        if let Ok(workspace) = std::env::var("CONVERGE_WORKSPACE") {
            debug!("Overriding workspace from environment");
            settings.workspace = Some(workspace);
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self.resolve(Path::new(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Loads a declaration set from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_declarations(&self, path: impl AsRef<Path>) -> Result<DeclarationSet> {
        let path = self.resolve(path.as_ref());
        info!("Loading declarations from: {}", path.display());

        let content = read_file(&path)?;
        let declarations = self.parse_declarations(&content, Some(&path))?;
        debug!(
            "Loaded {} resource(s), {} module call(s), {} output(s)",
            declarations.resources.len(),
            declarations.modules.len(),
            declarations.outputs.len()
        );
        Ok(declarations)
    }

    /// Parses a declaration set from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_declarations(&self, content: &str, source: Option<&Path>) -> Result<DeclarationSet> {
        if content.trim().is_empty() {
            return Ok(DeclarationSet::default());
        }
        serde_yaml::from_str(content).map_err(|e| yaml_error(&e, source))
    }
}

fn read_file(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }

    std::fs::read_to_string(path).map_err(|e| {
        ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        }
        .into()
    })
}

fn yaml_error(e: &serde_yaml::Error, source: Option<&Path>) -> CoreError {
    let location = match (source, e.location()) {
        (Some(path), Some(at)) => Some(format!("{}:{}:{}", path.display(), at.line(), at.column())),
        (Some(path), None) => Some(path.display().to_string()),
        (None, Some(at)) => Some(format!("line {}, column {}", at.line(), at.column())),
        (None, None) => None,
    };
    ConfigError::ParseError {
        message: format!("YAML parse error: {e}"),
        location,
    }
    .into()
}

/// Default settings file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml"];

/// Finds the settings file in the start directory or one of its parents,
/// then in the user configuration directory.
///
/// # Errors
///
/// Returns an error if no settings file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found settings file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    if let Some(user_dir) = dirs::config_dir().map(|d| d.join("converge")) {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = user_dir.join(filename);
            if config_path.exists() {
                info!("Found settings file: {}", config_path.display());
                return Ok(config_path);
            }
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::{Expr, Reference, Repetition};

    #[test]
    fn test_parse_minimal_settings() {
        let parser = ConfigParser::new();
        let settings = parser.parse_yaml("parallelism: 4\n", None).expect("parse");
        assert_eq!(settings.parallelism, 4);
        assert_eq!(settings.state.backend, BackendKind::Local);
        assert!(settings.refresh);

        let settings = parser.parse_yaml("", None).expect("empty");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_parse_s3_settings() {
        let yaml = r"
state:
  backend: s3
  bucket: team-state
  prefix: network
  region: eu-west-1
refresh: false
";
        let settings = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        assert_eq!(settings.state.backend, BackendKind::S3);
        assert_eq!(settings.state.bucket.as_deref(), Some("team-state"));
        assert!(!settings.refresh);
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = ConfigParser::new()
            .parse_yaml("parallelism: [", Some(Path::new("converge.yaml")))
            .expect_err("invalid");
        assert!(err.to_string().contains("YAML parse error"));
    }

    #[test]
    fn test_parse_declarations() {
        let yaml = r"
resources:
  - type: bucket
    name: logs
    arguments:
      name:
        literal: app-logs
  - type: object
    name: index
    repetition:
      count:
        literal: 2
    arguments:
      bucket:
        ref:
          resource:
            type: bucket
            name: logs
            attribute: id
    lifecycle:
      create_before_destroy: true
outputs:
  - name: bucket_id
    value:
      ref:
        resource:
          type: bucket
          name: logs
          attribute: id
";
        let declarations = ConfigParser::new()
            .parse_declarations(yaml, None)
            .expect("parse");
        assert_eq!(declarations.resources.len(), 2);
        assert_eq!(declarations.outputs.len(), 1);

        let object = &declarations.resources[1];
        assert!(object.lifecycle.create_before_destroy);
        assert!(matches!(object.repetition, Some(Repetition::Count(_))));
        assert!(matches!(
            object.arguments.get("bucket"),
            Some(Expr::Ref(Reference::Resource { .. }))
        ));
    }

    #[test]
    fn test_load_declarations_relative_to_base() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("declarations.yaml"), "resources: []\n").expect("write");

        let parser = ConfigParser::new().with_base_path(dir.path());
        let declarations = parser
            .load_declarations("declarations.yaml")
            .expect("load");
        assert!(declarations.is_empty());

        let err = parser.load_declarations("missing.yaml").expect_err("missing");
        assert!(matches!(
            err,
            CoreError::Config(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("converge.yaml"), "{}\n").expect("write");
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, dir.path().join("converge.yaml"));
    }
}
