//! Resource instance addressing.
//!
//! An address is a module instance path followed by a resource type, a
//! resource name and an optional instance key, rendered as
//! `module.net[0].bucket.logs["eu"]`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Instance key of a repeated declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceKey {
    /// Ordinal index from `count`.
    Index(u64),
    /// Map or set key from `for_each`.
    Key(String),
}

/// One step of a module path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleInstance {
    /// Module call name.
    pub name: String,
    /// Instance key when the module call is repeated.
    pub key: Option<InstanceKey>,
}

/// Path of module instances from the root module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModulePath(pub Vec<ModuleInstance>);

/// Address of a single resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    /// Module instance path (empty for the root module).
    pub module: ModulePath,
    /// Resource type.
    pub resource_type: String,
    /// Resource name.
    pub name: String,
    /// Instance key, if the declaration is repeated.
    pub key: Option<InstanceKey>,
}

impl InstanceKey {
    /// Renders the key the way it appears inside brackets.
    fn bracketed(&self) -> String {
        match self {
            Self::Index(i) => format!("[{i}]"),
            Self::Key(k) => format!("[\"{}\"]", k.replace('\\', "\\\\").replace('"', "\\\"")),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Key(k) => write!(f, "{k}"),
        }
    }
}

impl ModulePath {
    /// The root module path.
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Returns true for the root module.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new path with one more module instance appended.
    #[must_use]
    pub fn child(&self, name: &str, key: Option<InstanceKey>) -> Self {
        let mut path = self.0.clone();
        path.push(ModuleInstance {
            name: name.to_string(),
            key,
        });
        Self(path)
    }

    /// Returns true if `self` equals `prefix` or is nested inside it.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Returns true if `self` is inside any instance of the module call
    /// `name` declared at `parent`.
    #[must_use]
    pub fn is_within_call(&self, parent: &Self, name: &str) -> bool {
        self.0.len() > parent.0.len()
            && self.0.starts_with(&parent.0)
            && self.0[parent.0.len()].name == name
    }

    /// Replaces the prefix `from` with `to`.
    #[must_use]
    pub fn rebase(&self, from: &Self, to: &Self) -> Option<Self> {
        if !self.starts_with(from) {
            return None;
        }
        let mut path = to.0.clone();
        path.extend_from_slice(&self.0[from.0.len()..]);
        Some(Self(path))
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "module.{}", step.name)?;
            if let Some(key) = &step.key {
                write!(f, "{}", key.bracketed())?;
            }
        }
        Ok(())
    }
}

impl FromStr for ModulePath {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let segments = split_segments(s)?;
        let (path, rest) = take_module_path(s, &segments)?;
        if rest.is_empty() {
            Ok(path)
        } else {
            Err(invalid(s, "expected only module segments"))
        }
    }
}

impl TryFrom<String> for ModulePath {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModulePath> for String {
    fn from(value: ModulePath) -> Self {
        value.to_string()
    }
}

impl ResourceAddress {
    /// Creates a root-module address without an instance key.
    #[must_use]
    pub fn new(resource_type: &str, name: &str) -> Self {
        Self {
            module: ModulePath::root(),
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            key: None,
        }
    }

    /// Returns a copy with the given instance key.
    #[must_use]
    pub fn with_key(mut self, key: InstanceKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Returns a copy placed in the given module path.
    #[must_use]
    pub fn in_module(mut self, module: ModulePath) -> Self {
        self.module = module;
        self
    }

    /// Returns true if both addresses belong to the same declaration,
    /// ignoring the instance key.
    #[must_use]
    pub fn same_resource(&self, other: &Self) -> bool {
        self.module == other.module
            && self.resource_type == other.resource_type
            && self.name == other.name
    }

    /// The address without its instance key.
    #[must_use]
    pub fn without_key(&self) -> Self {
        Self {
            key: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.module.is_root() {
            write!(f, "{}.", self.module)?;
        }
        write!(f, "{}.{}", self.resource_type, self.name)?;
        if let Some(key) = &self.key {
            write!(f, "{}", key.bracketed())?;
        }
        Ok(())
    }
}

impl FromStr for ResourceAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = split_segments(s)?;
        let (module, rest) = take_module_path(s, &segments)?;
        match rest {
            [(resource_type, None), (name, key)] => Ok(Self {
                module,
                resource_type: resource_type.clone(),
                name: name.clone(),
                key: key.clone(),
            }),
            [(_, Some(_)), _] => Err(invalid(s, "resource type cannot carry an instance key")),
            _ => Err(invalid(s, "expected <type>.<name> after the module path")),
        }
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceAddress> for String {
    fn from(value: ResourceAddress) -> Self {
        value.to_string()
    }
}

type Segment = (String, Option<InstanceKey>);

fn invalid(input: &str, message: &str) -> ConfigError {
    ConfigError::InvalidAddress {
        input: input.to_string(),
        message: message.to_string(),
    }
}

/// Consumes leading `module.<name>[key]` pairs.
fn take_module_path<'a>(
    input: &str,
    segments: &'a [Segment],
) -> Result<(ModulePath, &'a [Segment]), ConfigError> {
    let mut path = Vec::new();
    let mut rest = segments;
    while let [(first, None), tail @ ..] = rest {
        if first != "module" {
            break;
        }
        let [(name, key), after @ ..] = tail else {
            return Err(invalid(input, "module keyword without a module name"));
        };
        path.push(ModuleInstance {
            name: name.clone(),
            key: key.clone(),
        });
        rest = after;
    }
    Ok((ModulePath(path), rest))
}

/// Splits `a.b["x.y"].c[0]` into name/key segments.
fn split_segments(input: &str) -> Result<Vec<Segment>, ConfigError> {
    let mut segments = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '.' || c == '[' {
                break;
            }
            if !(c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(invalid(input, &format!("unexpected character '{c}'")));
            }
            name.push(c);
            chars.next();
        }
        if name.is_empty() {
            return Err(invalid(input, "empty segment"));
        }

        let key = if chars.peek() == Some(&'[') {
            chars.next();
            Some(parse_key(input, &mut chars)?)
        } else {
            None
        };
        segments.push((name, key));

        match chars.next() {
            None => break,
            Some('.') => {}
            Some(c) => return Err(invalid(input, &format!("unexpected character '{c}'"))),
        }
    }

    Ok(segments)
}

/// Parses the inside of `[...]`; the opening bracket is already consumed.
fn parse_key(
    input: &str,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> Result<InstanceKey, ConfigError> {
    let key = if chars.peek() == Some(&'"') {
        chars.next();
        let mut value = String::new();
        loop {
            match chars.next() {
                Some('\\') => match chars.next() {
                    Some(c) => value.push(c),
                    None => return Err(invalid(input, "unterminated string key")),
                },
                Some('"') => break,
                Some(c) => value.push(c),
                None => return Err(invalid(input, "unterminated string key")),
            }
        }
        InstanceKey::Key(value)
    } else {
        let mut digits = String::new();
        while let Some(&c) = chars.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            digits.push(c);
            chars.next();
        }
        let index = digits
            .parse::<u64>()
            .map_err(|_| invalid(input, "instance key must be an integer or a quoted string"))?;
        InstanceKey::Index(index)
    };

    if chars.next() == Some(']') {
        Ok(key)
    } else {
        Err(invalid(input, "missing closing bracket"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_address() {
        let addr: ResourceAddress = "bucket.logs".parse().expect("parse");
        assert_eq!(addr, ResourceAddress::new("bucket", "logs"));
        assert_eq!(addr.to_string(), "bucket.logs");
    }

    #[test]
    fn test_parse_nested_address() {
        let input = r#"module.net[0].module.zone["eu-west"].instance.web["a.b"]"#;
        let addr: ResourceAddress = input.parse().expect("parse");
        assert_eq!(addr.module.0.len(), 2);
        assert_eq!(addr.module.0[0].key, Some(InstanceKey::Index(0)));
        assert_eq!(
            addr.module.0[1].key,
            Some(InstanceKey::Key(String::from("eu-west")))
        );
        assert_eq!(addr.key, Some(InstanceKey::Key(String::from("a.b"))));
        assert_eq!(addr.to_string(), input);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("bucket".parse::<ResourceAddress>().is_err());
        assert!("bucket[0].logs".parse::<ResourceAddress>().is_err());
        assert!("bucket.logs[".parse::<ResourceAddress>().is_err());
        assert!("module.a".parse::<ResourceAddress>().is_err());
        assert!("a.b.c".parse::<ResourceAddress>().is_err());
    }

    #[test]
    fn test_module_path_rebase() {
        let from: ModulePath = "module.a".parse().expect("parse");
        let to: ModulePath = "module.b[1]".parse().expect("parse");
        let inner: ModulePath = "module.a.module.c".parse().expect("parse");
        let rebased = inner.rebase(&from, &to).expect("rebase");
        assert_eq!(rebased.to_string(), "module.b[1].module.c");
        assert!(ModulePath::root().rebase(&from, &to).is_none());
    }

    #[test]
    fn test_address_serde_as_string() {
        let addr = ResourceAddress::new("bucket", "logs").with_key(InstanceKey::Index(2));
        let json = serde_json::to_string(&addr).expect("serialize");
        assert_eq!(json, "\"bucket.logs[2]\"");
        let back: ResourceAddress = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, addr);
    }
}
