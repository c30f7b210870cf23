//! Resource schemas published by providers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Definition of one attribute of a resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
    /// Must be declared.
    #[serde(default)]
    pub required: bool,
    /// May be declared.
    #[serde(default)]
    pub optional: bool,
    /// Set by the provider when not declared.
    #[serde(default)]
    pub computed: bool,
    /// A change to this argument replaces the object.
    #[serde(default)]
    pub force_new: bool,
    /// The value is hidden in rendered output.
    #[serde(default)]
    pub sensitive: bool,
}

/// Schema of one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Schema version stored alongside every instance.
    pub version: u64,
    /// Attribute definitions.
    pub attributes: BTreeMap<String, AttributeSchema>,
}

impl AttributeSchema {
    /// A required argument.
    #[must_use]
    pub const fn required() -> Self {
        Self {
            required: true,
            optional: false,
            computed: false,
            force_new: false,
            sensitive: false,
        }
    }

    /// An optional argument.
    #[must_use]
    pub const fn optional() -> Self {
        Self {
            required: false,
            optional: true,
            computed: false,
            force_new: false,
            sensitive: false,
        }
    }

    /// An attribute only the provider sets.
    #[must_use]
    pub const fn computed() -> Self {
        Self {
            required: false,
            optional: false,
            computed: true,
            force_new: false,
            sensitive: false,
        }
    }

    /// Marks the attribute as forcing replacement.
    #[must_use]
    pub const fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Marks the attribute as sensitive.
    #[must_use]
    pub const fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Returns true if the attribute can be declared.
    #[must_use]
    pub const fn is_argument(&self) -> bool {
        self.required || self.optional
    }
}

impl ResourceSchema {
    /// Creates an empty schema at the given version.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self {
            version,
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute definition.
    #[must_use]
    pub fn with(mut self, name: &str, attribute: AttributeSchema) -> Self {
        self.attributes.insert(name.to_string(), attribute);
        self
    }

    /// Returns true if a change to `name` forces replacement.
    #[must_use]
    pub fn forces_replacement(&self, name: &str) -> bool {
        self.attributes.get(name).is_some_and(|a| a.force_new)
    }

    /// Returns true if the attribute is set only by the provider.
    #[must_use]
    pub fn is_computed_only(&self, name: &str) -> bool {
        self.attributes
            .get(name)
            .is_some_and(|a| a.computed && !a.is_argument())
    }

    /// Names of attributes the provider may fill in after create.
    pub fn computed_attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.computed)
            .map(|(name, _)| name.as_str())
    }

    /// Names of sensitive attributes.
    #[must_use]
    pub fn sensitive_attributes(&self) -> std::collections::BTreeSet<String> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.sensitive)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Checks declared argument names against the schema: required
    /// arguments must be present, unknown or computed-only names are
    /// rejected.
    pub fn check_arguments<'a>(&self, declared: impl Iterator<Item = &'a String> + Clone) -> Vec<String> {
        let mut errors = Vec::new();

        for name in declared.clone() {
            match self.attributes.get(name) {
                None => errors.push(format!("unsupported argument '{name}'")),
                Some(attribute) if !attribute.is_argument() => {
                    errors.push(format!("'{name}' is computed and cannot be set"));
                }
                Some(_) => {}
            }
        }

        for (name, attribute) in &self.attributes {
            if attribute.required && !declared.clone().any(|d| d == name) {
                errors.push(format!("missing required argument '{name}'"));
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ResourceSchema {
        ResourceSchema::new(1)
            .with("id", AttributeSchema::computed())
            .with("name", AttributeSchema::required().force_new())
            .with("tags", AttributeSchema::optional())
    }

    #[test]
    fn test_forces_replacement() {
        let schema = schema();
        assert!(schema.forces_replacement("name"));
        assert!(!schema.forces_replacement("tags"));
        assert!(!schema.forces_replacement("missing"));
        assert!(schema.is_computed_only("id"));
    }

    #[test]
    fn test_check_arguments() {
        let schema = schema();
        let declared = [String::from("tags"), String::from("id"), String::from("bogus")];
        let errors = schema.check_arguments(declared.iter());
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("missing required argument 'name'")));
        assert!(errors.iter().any(|e| e.contains("'id' is computed")));
        assert!(errors.iter().any(|e| e.contains("unsupported argument 'bogus'")));
    }
}
