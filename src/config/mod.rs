//! Configuration module.
//!
//! This module handles all configuration-related functionality:
//! - Parsing `converge.yaml` settings and declaration files
//! - Validation of settings and declaration names
//! - Computing declaration fingerprints for saved plans

mod hash;
mod parser;
mod settings;
mod validator;

pub use hash::DeclarationHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use settings::{
    BackendKind, DEFAULT_DECLARATIONS_FILE, DEFAULT_PARALLELISM, Settings, StateSettings,
};
pub use validator::{SettingsValidator, ValidationError, ValidationResult};
