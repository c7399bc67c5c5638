//! Bind targets: which document, which property, and how to listen.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MetabindError;
use crate::path::PropertyPath;

/// Where the bound document lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Structured metadata of an external document, written back by the
    /// scheduler and refreshed by external change events.
    #[default]
    Frontmatter,
    /// Process-local state. Cached and shared like frontmatter but never
    /// written to the store.
    Memory,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Frontmatter => "frontmatter",
            StorageType::Memory => "memory",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = MetabindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "frontmatter" => Ok(StorageType::Frontmatter),
            "memory" => Ok(StorageType::Memory),
            other => Err(MetabindError::Validation(format!(
                "unknown storage type {other:?}, expected frontmatter or memory"
            ))),
        }
    }
}

/// Cache key of a document: its storage type and logical path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub storage_type: StorageType,
    pub path: String,
}

impl DocumentKey {
    pub fn frontmatter(path: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Frontmatter,
            path: path.into(),
        }
    }

    pub fn memory(path: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Memory,
            path: path.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.storage_type {
            StorageType::Frontmatter => f.write_str(&self.path),
            other => write!(f, "{other}^{}", self.path),
        }
    }
}

/// A resolved, validated reference to one property of one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindTarget {
    pub storage_type: StorageType,
    pub storage_path: String,
    pub storage_prop: PropertyPath,
    /// Also notify on writes below `storage_prop`, not only at it.
    #[serde(default)]
    pub listen_to_children: bool,
}

impl BindTarget {
    /// A frontmatter target that listens to its exact path only.
    pub fn new(storage_path: impl Into<String>, storage_prop: PropertyPath) -> Self {
        Self {
            storage_type: StorageType::Frontmatter,
            storage_path: storage_path.into(),
            storage_prop,
            listen_to_children: false,
        }
    }

    pub fn with_storage_type(mut self, storage_type: StorageType) -> Self {
        self.storage_type = storage_type;
        self
    }

    pub fn listening_to_children(mut self) -> Self {
        self.listen_to_children = true;
        self
    }

    pub fn document(&self) -> DocumentKey {
        DocumentKey {
            storage_type: self.storage_type,
            path: self.storage_path.clone(),
        }
    }

    /// Parse `[type^][document#]property` and resolve it against the
    /// document the declaration appears in.
    ///
    /// # Example
    ///
    /// ```
    /// use metabind_core::{BindTarget, StorageType};
    ///
    /// let target = BindTarget::parse("status", "note.md").unwrap();
    /// assert_eq!(target.storage_path, "note.md");
    /// assert_eq!(target.storage_type, StorageType::Frontmatter);
    ///
    /// let target = BindTarget::parse("memory^board.md#columns[0]", "note.md").unwrap();
    /// assert_eq!(target.storage_path, "board.md");
    /// assert_eq!(target.storage_prop.to_string(), "columns[0]");
    /// ```
    pub fn parse(declaration: &str, current_document: &str) -> Result<Self, MetabindError> {
        declaration
            .parse::<BindTargetDeclaration>()?
            .resolve(current_document)
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.document(), self.storage_prop)
    }
}

/// An unresolved bind target as written by a user.
///
/// Storage type and document are optional and default to frontmatter of the
/// document that contains the declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindTargetDeclaration {
    #[serde(default)]
    pub storage_type: Option<String>,
    #[serde(default)]
    pub storage_path: Option<String>,
    pub storage_prop: String,
    #[serde(default)]
    pub listen_to_children: bool,
}

impl BindTargetDeclaration {
    pub fn new(storage_prop: impl Into<String>) -> Self {
        Self {
            storage_prop: storage_prop.into(),
            ..Self::default()
        }
    }

    /// Validate the declaration and fill in defaults.
    pub fn resolve(&self, current_document: &str) -> Result<BindTarget, MetabindError> {
        let storage_type = match self.storage_type.as_deref() {
            None => StorageType::default(),
            Some(name) => name.trim().parse()?,
        };

        let storage_path = match self.storage_path.as_deref().map(str::trim) {
            None => current_document.to_string(),
            Some("") => {
                return Err(MetabindError::Validation(
                    "bind target names an empty document".to_string(),
                ));
            }
            Some(path) => path.to_string(),
        };
        if storage_path.is_empty() {
            return Err(MetabindError::Validation(
                "bind target has no document to resolve against".to_string(),
            ));
        }

        let storage_prop = PropertyPath::parse(self.storage_prop.trim())
            .map_err(|e| MetabindError::Validation(format!("bind target property: {e}")))?;

        Ok(BindTarget {
            storage_type,
            storage_path,
            storage_prop,
            listen_to_children: self.listen_to_children,
        })
    }
}

impl FromStr for BindTargetDeclaration {
    type Err = MetabindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (storage_type, rest) = match s.split_once('^') {
            Some((storage_type, rest)) => (Some(storage_type.to_string()), rest),
            None => (None, s),
        };
        let (storage_path, prop) = match rest.split_once('#') {
            Some((path, prop)) => (Some(path.to_string()), prop),
            None => (None, rest),
        };
        Ok(Self {
            storage_type,
            storage_path,
            storage_prop: prop.to_string(),
            listen_to_children: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_current_document_frontmatter() {
        let target = BindTarget::parse("status", "note.md").unwrap();
        assert_eq!(
            target,
            BindTarget::new("note.md", PropertyPath::parse("status").unwrap())
        );
        assert_eq!(target.document(), DocumentKey::frontmatter("note.md"));
    }

    #[test]
    fn test_explicit_document_and_type() {
        let target = BindTarget::parse("memory^other.md#a.b[1]", "note.md").unwrap();
        assert_eq!(target.storage_type, StorageType::Memory);
        assert_eq!(target.storage_path, "other.md");
        assert_eq!(target.storage_prop, PropertyPath::parse("a.b[1]").unwrap());
        assert_eq!(target.to_string(), "memory^other.md#a.b[1]");
    }

    #[test]
    fn test_rejects_unknown_storage_type() {
        let err = BindTarget::parse("sqlite^x.md#a", "note.md").unwrap_err();
        assert!(matches!(err, MetabindError::Validation(_)));
        assert!(err.to_string().contains("sqlite"));
    }

    #[test]
    fn test_rejects_bad_property() {
        for bad in ["", "a..b", "note.md#", "note.md#[x]"] {
            let err = BindTarget::parse(bad, "note.md").unwrap_err();
            assert!(matches!(err, MetabindError::Validation(_)), "{bad}");
        }
    }

    #[test]
    fn test_rejects_empty_document() {
        assert!(BindTarget::parse("#status", "note.md").is_err());
        assert!(BindTarget::parse("status", "").is_err());
    }

    #[test]
    fn test_declaration_carries_listen_flag() {
        let declaration = BindTargetDeclaration {
            listen_to_children: true,
            ..BindTargetDeclaration::new("project")
        };
        let target = declaration.resolve("note.md").unwrap();
        assert!(target.listen_to_children);
    }

    #[test]
    fn test_declaration_deserializes() {
        let declaration: BindTargetDeclaration = serde_json::from_str(
            r#"{"storage_type": "memory", "storage_prop": "counter"}"#,
        )
        .unwrap();
        let target = declaration.resolve("note.md").unwrap();
        assert_eq!(target.document(), DocumentKey::memory("note.md"));
        assert!(!target.listen_to_children);
    }

    #[test]
    fn test_document_key_display() {
        assert_eq!(DocumentKey::frontmatter("a.md").to_string(), "a.md");
        assert_eq!(DocumentKey::memory("a.md").to_string(), "memory^a.md");
    }
}
