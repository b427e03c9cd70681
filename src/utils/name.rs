use std::{borrow::Borrow, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Model, event, or job name.
///
/// Names travel constantly: every job message, broker fan-out, channel key,
/// and registry lookup carries one, so they intern as `Arc<str>` and clone
/// without allocating. Two case rules live here with the type: registry
/// keys are the upper-cased form ([`Name::upper`]), and model-name
/// comparisons are case-insensitive ([`Name::matches`]). Event names, by
/// contrast, match by exact string equality, which plain `Eq`/`Hash`
/// already provide.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Name(Arc<str>);

impl Name {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Canonical registry-key form of a model name.
    pub fn upper(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref().to_uppercase().as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison, used wherever a model name arrives
    /// from outside the registry (lookups, router classification, listen
    /// patterns).
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl Serialize for Name {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Name::from)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Self(Arc::from(value.as_str()))
    }
}

impl<'a> From<&'a str> for Name {
    fn from(value: &'a str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&Name> for Name {
    fn from(value: &Name) -> Self {
        value.clone()
    }
}

impl Borrow<str> for Name {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upper_builds_the_registry_key() {
        assert_eq!(Name::upper("order").as_str(), "ORDER");
        assert_eq!(Name::upper("Order"), Name::new("ORDER"));
    }

    #[test]
    fn matches_ignores_case_but_eq_does_not() {
        let name = Name::new("orderCreated");
        assert!(name.matches("ORDERCREATED"));
        assert_ne!(name, Name::new("ORDERCREATED"));
    }
}
