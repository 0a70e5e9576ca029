//! Canonical role mapping: source community roles → platform metadata keys.
//!
//! A [`RoleMap`] is built once at startup (from YAML or the built-in table),
//! validated against its metadata schema, and then shared read-only behind an
//! `Arc` by every component that needs it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::LinkError;

/// Maximum number of metadata records an application may register.
pub const MAX_METADATA_RECORDS: usize = 5;

/// Maximum length of a metadata key.
const MAX_KEY_LEN: usize = 50;

/// Maximum length of a metadata field name.
const MAX_NAME_LEN: usize = 100;

/// Maximum length of a metadata field description.
const MAX_DESCRIPTION_LEN: usize = 200;

// =============================================================================
// Schema
// =============================================================================

/// Comparison type of a registered metadata field.
///
/// Only the boolean kinds are produced by [`RoleMap::compute_vector`]; the
/// integer and datetime kinds can be registered but cannot be role targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    IntegerLessThanOrEqual,
    IntegerGreaterThanOrEqual,
    IntegerEqual,
    IntegerNotEqual,
    DatetimeLessThanOrEqual,
    DatetimeGreaterThanOrEqual,
    BooleanEqual,
    BooleanNotEqual,
}

impl MetadataKind {
    /// Integer type code used on the wire by the platform.
    pub fn code(self) -> u8 {
        match self {
            MetadataKind::IntegerLessThanOrEqual => 1,
            MetadataKind::IntegerGreaterThanOrEqual => 2,
            MetadataKind::IntegerEqual => 3,
            MetadataKind::IntegerNotEqual => 4,
            MetadataKind::DatetimeLessThanOrEqual => 5,
            MetadataKind::DatetimeGreaterThanOrEqual => 6,
            MetadataKind::BooleanEqual => 7,
            MetadataKind::BooleanNotEqual => 8,
        }
    }

    pub fn is_boolean(self) -> bool {
        matches!(self, MetadataKind::BooleanEqual | MetadataKind::BooleanNotEqual)
    }
}

fn default_kind() -> MetadataKind {
    MetadataKind::BooleanEqual
}

/// One metadata field declared to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub key: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: MetadataKind,
}

/// A `(source role id, target key)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMapping {
    pub source: String,
    pub target: String,
}

/// On-disk representation of a role map.
#[derive(Debug, Clone, Deserialize)]
struct RoleMapFile {
    roles: Vec<RoleMapping>,
    schema: Vec<MetadataField>,
}

// =============================================================================
// Metadata vector
// =============================================================================

/// Per-push metadata values keyed by target key.
///
/// Always covers every target key of the role map so that stale "connected"
/// flags are actively cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataVector(BTreeMap<String, i64>);

impl MetadataVector {
    pub fn get(&self, key: &str) -> Option<i64> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &i64)> {
        self.0.iter()
    }
}

impl FromIterator<(String, i64)> for MetadataVector {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// =============================================================================
// Role map
// =============================================================================

/// Validated, immutable role mapping plus the metadata schema it targets.
#[derive(Debug, Clone)]
pub struct RoleMap {
    mappings: Vec<RoleMapping>,
    schema: Vec<MetadataField>,
    sources: HashSet<String>,
}

impl RoleMap {
    /// Build a role map, validating it against the schema.
    pub fn new(mappings: Vec<RoleMapping>, schema: Vec<MetadataField>) -> Result<Self, LinkError> {
        validate_schema(&schema)?;

        let kinds: HashMap<&str, MetadataKind> =
            schema.iter().map(|f| (f.key.as_str(), f.kind)).collect();
        for mapping in &mappings {
            if mapping.source.is_empty() {
                return Err(LinkError::Config("empty source role id".into()));
            }
            match kinds.get(mapping.target.as_str()) {
                None => {
                    return Err(LinkError::Config(format!(
                        "role {} maps to unregistered key '{}'",
                        mapping.source, mapping.target
                    )));
                }
                // Role flags are 0/1; other kinds have no role semantics.
                Some(kind) if !kind.is_boolean() => {
                    return Err(LinkError::Config(format!(
                        "role {} maps to non-boolean key '{}' ({kind:?})",
                        mapping.source, mapping.target
                    )));
                }
                Some(_) => {}
            }
        }

        let sources = mappings.iter().map(|m| m.source.clone()).collect();
        Ok(Self {
            mappings,
            schema,
            sources,
        })
    }

    /// Parse a role map from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, LinkError> {
        let file: RoleMapFile = serde_yaml::from_str(text)
            .map_err(|e| LinkError::Config(format!("invalid role map: {e}")))?;
        Self::new(file.roles, file.schema)
    }

    /// Load a role map from a YAML file.
    pub fn load(path: &Path) -> Result<Self, LinkError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// Built-in mapping for the community this service was first deployed for.
    pub fn builtin() -> Self {
        let field = |target: &str, name: &str, description: &str| MetadataField {
            key: target.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            kind: MetadataKind::BooleanEqual,
        };
        let map = |source: &str, target: &str| RoleMapping {
            source: source.to_string(),
            target: target.to_string(),
        };

        let schema = vec![
            field("role_1415357826662011021", "Founder", "Holds the founder role"),
            field("role_1415360988949250141", "Staff", "Holds any staff role"),
            field("role_1415361550457507840", "Supporter", "Holds the supporter role"),
        ];
        let mappings = vec![
            map("1346250078238544004", "role_1415357826662011021"),
            map("1346253003467784194", "role_1415360988949250141"),
            map("1346253445161812048", "role_1415360988949250141"),
            map("1346253804622053427", "role_1415360988949250141"),
            map("1346250832466808832", "role_1415361550457507840"),
        ];

        Self {
            sources: mappings.iter().map(|m| m.source.clone()).collect(),
            mappings,
            schema,
        }
    }

    pub fn mappings(&self) -> &[RoleMapping] {
        &self.mappings
    }

    /// Metadata schema to register with the platform.
    pub fn schema(&self) -> &[MetadataField] {
        &self.schema
    }

    /// Domain of source role ids.
    pub fn source_roles(&self) -> &HashSet<String> {
        &self.sources
    }

    /// Range of target keys, in schema order, without duplicates.
    pub fn target_keys(&self) -> Vec<&str> {
        let used: HashSet<&str> = self.mappings.iter().map(|m| m.target.as_str()).collect();
        self.schema
            .iter()
            .map(|f| f.key.as_str())
            .filter(|k| used.contains(k))
            .collect()
    }

    /// Intersect a role set with the source domain.
    pub fn project<'a, I>(&self, roles: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        roles
            .into_iter()
            .filter(|r| self.sources.contains(*r))
            .cloned()
            .collect()
    }

    /// Compute the flag vector for a user's current roles.
    ///
    /// Every target key is present: 1 iff at least one of its source roles is
    /// held, else 0.
    pub fn compute_vector(&self, current_roles: &HashSet<String>) -> MetadataVector {
        let mut values: BTreeMap<String, i64> = self
            .target_keys()
            .into_iter()
            .map(|k| (k.to_string(), 0))
            .collect();
        for mapping in &self.mappings {
            if current_roles.contains(&mapping.source) {
                values.insert(mapping.target.clone(), 1);
            }
        }
        MetadataVector(values)
    }
}

fn validate_schema(schema: &[MetadataField]) -> Result<(), LinkError> {
    if schema.len() > MAX_METADATA_RECORDS {
        return Err(LinkError::Config(format!(
            "at most {MAX_METADATA_RECORDS} metadata records allowed, got {}",
            schema.len()
        )));
    }

    let mut seen = HashSet::new();
    for field in schema {
        let key_ok = !field.key.is_empty()
            && field.key.len() <= MAX_KEY_LEN
            && field
                .key
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !key_ok {
            return Err(LinkError::Config(format!(
                "invalid metadata key '{}': expected 1-{MAX_KEY_LEN} chars of a-z, 0-9, _",
                field.key
            )));
        }
        if !seen.insert(field.key.as_str()) {
            return Err(LinkError::Config(format!(
                "duplicate metadata key '{}'",
                field.key
            )));
        }
        if field.name.is_empty() || field.name.len() > MAX_NAME_LEN {
            return Err(LinkError::Config(format!(
                "metadata '{}' name must be 1-{MAX_NAME_LEN} chars",
                field.key
            )));
        }
        if field.description.is_empty() || field.description.len() > MAX_DESCRIPTION_LEN {
            return Err(LinkError::Config(format!(
                "metadata '{}' description must be 1-{MAX_DESCRIPTION_LEN} chars",
                field.key
            )));
        }
    }
    Ok(())
}
