//! Workspace names and the persisted selection.
//!
//! A workspace is always passed explicitly to the store; the selection
//! file only remembers which one the command line should use next.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::error::{Result, StateError};

/// Name of the distinguished default workspace.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Maximum workspace name length.
const MAX_NAME_LEN: usize = 64;

/// A validated workspace name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Workspace(String);

impl Workspace {
    /// Validates and wraps a workspace name.
    pub fn new(name: &str) -> std::result::Result<Self, StateError> {
        if is_valid_workspace_name(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(StateError::InvalidWorkspaceName {
                name: name.to_string(),
            })
        }
    }

    /// The default workspace.
    #[must_use]
    pub fn default_workspace() -> Self {
        Self(DEFAULT_WORKSPACE.to_string())
    }

    /// Returns true for the default workspace.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_WORKSPACE
    }

    /// The name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::default_workspace()
    }
}

impl fmt::Display for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Workspace {
    type Err = StateError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Workspace {
    type Error = StateError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Workspace> for String {
    fn from(value: Workspace) -> Self {
        value.0
    }
}

/// `[a-z0-9][a-z0-9_-]*`, at most 64 characters.
#[must_use]
pub fn is_valid_workspace_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    name.len() <= MAX_NAME_LEN
        && (first.is_ascii_lowercase() || first.is_ascii_digit())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Reads the selected workspace; the default when nothing is selected.
pub async fn read_selection(path: &Path) -> Result<Workspace> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Workspace::new(content.trim())?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Workspace::default()),
        Err(e) => Err(e.into()),
    }
}

/// Persists the selected workspace.
pub async fn write_selection(path: &Path, workspace: &Workspace) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, format!("{workspace}\n")).await?;
    debug!("Selected workspace {workspace} in {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_workspace_names() {
        assert!(is_valid_workspace_name("default"));
        assert!(is_valid_workspace_name("prod-eu_1"));
        assert!(is_valid_workspace_name("9lives"));
        assert!(!is_valid_workspace_name(""));
        assert!(!is_valid_workspace_name("-dev"));
        assert!(!is_valid_workspace_name("Dev"));
        assert!(!is_valid_workspace_name("a/b"));
        assert!(!is_valid_workspace_name(&"a".repeat(65)));
        assert!(Workspace::new("staging").is_ok());
        assert!(Workspace::default().is_default());
    }

    #[tokio::test]
    async fn test_selection_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("sub/environment");
        assert!(read_selection(&path).await.expect("read").is_default());

        let staging = Workspace::new("staging").expect("name");
        write_selection(&path, &staging).await.expect("write");
        assert_eq!(read_selection(&path).await.expect("read"), staging);
    }
}
