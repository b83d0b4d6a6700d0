// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Schema metadata consumed by the compiler and executor.
//!
//! Schemas are defined and validated elsewhere; this module only models the
//! parts the query core reads: type prefixes, field types, nested object
//! properties and the configured language list.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ident::{NodeId, ROOT_PREFIX};

/// Name of the default database.
pub const DEFAULT_DB: &str = "default";

/// Type name reported for the root node.
pub const ROOT_TYPE: &str = "root";

/// Hierarchy relationship fields present on every type.
///
/// These are never expanded by `$all`; they must be requested explicitly.
pub const HIERARCHY_FIELDS: [&str; 4] = ["children", "parents", "ancestors", "descendants"];

/// Returns `true` when `field` is one of [`HIERARCHY_FIELDS`].
pub fn is_hierarchy_field(field: &str) -> bool {
    HIERARCHY_FIELDS.contains(&field)
}

/// Primitive and structured field kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Node id of the owning node.
    Id,
    /// Type name of the owning node.
    Type,
    /// Plain string.
    String,
    /// URL string.
    Url,
    /// Digest string.
    Digest,
    /// Email string.
    Email,
    /// Phone number string.
    Phone,
    /// Generic number.
    Number,
    /// Floating point number.
    Float,
    /// Integer.
    Int,
    /// Boolean.
    Boolean,
    /// Milliseconds since the epoch.
    Timestamp,
    /// Language keyed text.
    Text,
    /// Object with declared properties.
    Object,
    /// Map of arbitrary keys to a declared value schema.
    Record,
    /// Unordered set of values.
    Set,
    /// Ordered list of values.
    Array,
    /// Single node reference.
    Reference,
    /// Set of node references (hierarchy fields use this).
    References,
    /// Opaque JSON document.
    Json,
}

/// Schema of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Field kind.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Declared properties for `object` fields.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, FieldSchema>,
    /// Value schema for `record`, `set` and `array` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSchema>>,
    /// Database a `reference` points into (defaults to the owning database).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,
}

impl FieldSchema {
    /// Field schema with no nested structure.
    pub fn of(field_type: FieldType) -> Self {
        Self {
            field_type,
            properties: BTreeMap::new(),
            items: None,
            db: None,
        }
    }
}

/// Schema of one node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSchema {
    /// Two-character id prefix.
    #[serde(default)]
    pub prefix: String,
    /// Declared fields.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSchema>,
}

impl TypeSchema {
    /// Resolves a dot-separated path inside this type.
    pub fn field(&self, path: &str) -> Option<&FieldSchema> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            current = match current.field_type {
                FieldType::Object => current.properties.get(segment)?,
                FieldType::Record | FieldType::Text | FieldType::Json => return Some(current),
                _ => return None,
            };
        }
        Some(current)
    }

    fn add_implicit_fields(&mut self) {
        self.fields
            .entry("id".to_owned())
            .or_insert_with(|| FieldSchema::of(FieldType::Id));
        self.fields
            .entry("type".to_owned())
            .or_insert_with(|| FieldSchema::of(FieldType::Type));
        for name in HIERARCHY_FIELDS {
            self.fields
                .entry(name.to_owned())
                .or_insert_with(|| FieldSchema::of(FieldType::References));
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaDef {
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    root_type: Option<TypeSchema>,
    #[serde(default)]
    types: BTreeMap<String, TypeSchema>,
}

/// Schema of one database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SchemaDef", rename_all = "camelCase")]
pub struct Schema {
    /// Languages in fallback order.
    pub languages: Vec<String>,
    /// Schema of the root node.
    pub root_type: TypeSchema,
    /// Node types keyed by name.
    pub types: BTreeMap<String, TypeSchema>,
    #[serde(skip)]
    by_prefix: BTreeMap<String, String>,
}

impl From<SchemaDef> for Schema {
    fn from(def: SchemaDef) -> Self {
        Self::new(
            def.languages,
            def.root_type.unwrap_or_else(|| TypeSchema {
                prefix: ROOT_PREFIX.to_owned(),
                fields: BTreeMap::new(),
            }),
            def.types,
        )
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new(
            Vec::new(),
            TypeSchema {
                prefix: ROOT_PREFIX.to_owned(),
                fields: BTreeMap::new(),
            },
            BTreeMap::new(),
        )
    }
}

impl Schema {
    /// Builds a schema, adding the implicit `id`, `type` and hierarchy fields.
    pub fn new(
        languages: Vec<String>,
        mut root_type: TypeSchema,
        mut types: BTreeMap<String, TypeSchema>,
    ) -> Self {
        ROOT_PREFIX.clone_into(&mut root_type.prefix);
        root_type.add_implicit_fields();
        let mut by_prefix = BTreeMap::new();
        for (name, ty) in &mut types {
            ty.add_implicit_fields();
            by_prefix.insert(ty.prefix.clone(), name.clone());
        }
        Self {
            languages,
            root_type,
            types,
            by_prefix,
        }
    }

    /// Type name for a node id, derived from its prefix.
    pub fn type_of(&self, id: &NodeId) -> Option<&str> {
        if id.is_root() {
            return Some(ROOT_TYPE);
        }
        self.type_for_prefix(id.type_prefix())
    }

    /// Type name registered for a two-character prefix.
    pub fn type_for_prefix(&self, prefix: &str) -> Option<&str> {
        if prefix == ROOT_PREFIX {
            return Some(ROOT_TYPE);
        }
        self.by_prefix.get(prefix).map(String::as_str)
    }

    /// Prefix registered for a type name.
    pub fn prefix_of(&self, type_name: &str) -> Option<&str> {
        if type_name == ROOT_TYPE {
            return Some(ROOT_PREFIX);
        }
        self.types.get(type_name).map(|t| t.prefix.as_str())
    }

    /// Type schema by type name (`"root"` included).
    pub fn type_schema(&self, type_name: &str) -> Option<&TypeSchema> {
        if type_name == ROOT_TYPE {
            return Some(&self.root_type);
        }
        self.types.get(type_name)
    }

    /// Type schema of the node with `id`.
    pub fn type_schema_for(&self, id: &NodeId) -> Option<&TypeSchema> {
        if id.is_root() {
            return Some(&self.root_type);
        }
        self.by_prefix
            .get(id.type_prefix())
            .and_then(|name| self.types.get(name))
    }

    /// Field schema at `path` on the node with `id`.
    pub fn field_for(&self, id: &NodeId, path: &str) -> Option<&FieldSchema> {
        self.type_schema_for(id)?.field(path)
    }

    /// Field schema at `path` on the node with the given type prefix.
    pub fn field_for_prefix(&self, prefix: &str, path: &str) -> Option<&FieldSchema> {
        let name = self.type_for_prefix(prefix)?;
        self.type_schema(name)?.field(path)
    }

    /// Returns the first declaration of `path` in any type, root first.
    pub fn any_field(&self, path: &str) -> Option<&FieldSchema> {
        self.root_type
            .field(path)
            .or_else(|| self.types.values().find_map(|t| t.field(path)))
    }

    /// Returns `true` when `language` is configured.
    pub fn has_language(&self, language: &str) -> bool {
        self.languages.iter().any(|l| l == language)
    }
}

/// Schemas of every named database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schemas {
    dbs: BTreeMap<String, Schema>,
}

impl Schemas {
    /// Schemas with only the default database.
    pub fn single(schema: Schema) -> Self {
        let mut dbs = BTreeMap::new();
        dbs.insert(DEFAULT_DB.to_owned(), schema);
        Self { dbs }
    }

    /// Adds or replaces the schema of `db`.
    pub fn insert(&mut self, db: impl Into<String>, schema: Schema) {
        self.dbs.insert(db.into(), schema);
    }

    /// Schema of `db`.
    pub fn get(&self, db: &str) -> Option<&Schema> {
        self.dbs.get(db)
    }

    /// Names of all databases.
    pub fn databases(&self) -> impl Iterator<Item = &str> {
        self.dbs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    fn sample() -> Schema {
        serde_json::from_value(json!({
            "languages": ["en", "de"],
            "types": {
                "team": {
                    "prefix": "te",
                    "fields": {
                        "title": { "type": "text" },
                        "image": {
                            "type": "object",
                            "properties": { "thumb": { "type": "url" } }
                        }
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn prefixes_map_both_ways() {
        let schema = sample();
        assert_eq!(schema.type_of(&NodeId::new("te1")), Some("team"));
        assert_eq!(schema.type_of(&NodeId::root()), Some(ROOT_TYPE));
        assert_eq!(schema.prefix_of("team"), Some("te"));
        assert_eq!(schema.type_of(&NodeId::new("zz1")), None);
    }

    #[test]
    fn implicit_fields_are_added() {
        let schema = sample();
        let id = NodeId::new("te1");
        assert_eq!(
            schema.field_for(&id, "children").map(|f| f.field_type),
            Some(FieldType::References)
        );
        assert_eq!(
            schema.field_for(&id, "type").map(|f| f.field_type),
            Some(FieldType::Type)
        );
        assert!(schema.field_for(&NodeId::root(), "id").is_some());
    }

    #[test]
    fn nested_object_paths_resolve() {
        let schema = sample();
        let id = NodeId::new("te1");
        assert_eq!(
            schema.field_for(&id, "image.thumb").map(|f| f.field_type),
            Some(FieldType::Url)
        );
        assert!(schema.field_for(&id, "image.missing").is_none());
        assert_eq!(
            schema.field_for(&id, "title.en").map(|f| f.field_type),
            Some(FieldType::Text)
        );
    }
}
