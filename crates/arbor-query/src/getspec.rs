// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! GetSpec: the declarative read query, parsed into closed types.
//!
//! Clients send GetSpecs as JSON. Parsing validates the directive shapes once
//! so the compiler and executor match on variants instead of probing keys.
//!
//! ```json
//! { "$id": "te1", "title": { "$inherit": { "$type": ["sport"] } },
//!   "matches": { "$list": { "$find": { "$traverse": "children" } }, "name": true } }
//! ```
use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::error::CompileError;
use crate::filter::Fork;
use crate::ident::NodeId;
use crate::schema::{Schemas, DEFAULT_DB};
use crate::storage::{Order, Sort};

/// Deepest field map nesting the parser accepts.
pub const MAX_DEPTH: usize = 64;

/// A parsed GetSpec.
#[derive(Debug, Clone, PartialEq)]
pub struct GetSpec {
    /// Database the query runs against (`$db`, default `"default"`).
    pub db: String,
    /// Root node selection (`$id` / `$alias`).
    pub root: RootSelector,
    /// Requested text language.
    pub language: Option<String>,
    /// Attach execution metadata under `$meta`.
    pub include_meta: bool,
    /// Field selection of the root node.
    pub fields: FieldMap,
}

/// Candidate root ids and aliases. The first existing candidate wins, ids first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootSelector {
    /// `$id` candidates.
    pub ids: Vec<NodeId>,
    /// `$alias` candidates.
    pub aliases: Vec<String>,
}

impl RootSelector {
    /// Neither `$id` nor `$alias` was given; the query reads the root node.
    pub fn is_default(&self) -> bool {
        self.ids.is_empty() && self.aliases.is_empty()
    }
}

/// Selection of one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSpec {
    /// `true` reads the field, `false` excludes it from `$all`.
    Include(bool),
    /// `{ $field: "a" | ["a", "b"], $default? }`: read the first non-empty source.
    Source {
        /// Source field paths in fallback order.
        sources: Vec<String>,
        /// Value used when no source has one.
        default: Option<Value>,
    },
    /// `{ $value: v }`: constant.
    Value(Value),
    /// Nested selection, possibly carrying `$inherit` / `$list` / `$find` / `$id`.
    Map(FieldMap),
}

/// Field selections plus the structural directives of one object level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    /// Nested `$id`: read another node here.
    pub id: Vec<NodeId>,
    /// Nested `$db`.
    pub db: Option<String>,
    /// `$all: true`.
    pub all: bool,
    /// `$inherit`.
    pub inherit: Option<InheritSpec>,
    /// `$list`.
    pub list: Option<ListSpec>,
    /// `$find` (single result unless wrapped by `$list`).
    pub find: Option<FindSpec>,
    /// `$default`.
    pub default: Option<Value>,
    /// Field selections in key order.
    pub fields: Vec<(String, FieldSpec)>,
}

impl FieldMap {
    /// `true` when the map selects nothing and carries no directive.
    pub fn is_bare(&self) -> bool {
        !self.all
            && self.fields.is_empty()
            && self.id.is_empty()
            && self.db.is_none()
            && self.inherit.is_none()
            && self.list.is_none()
            && self.find.is_none()
    }

    /// `true` when no field is selected.
    pub fn selects_nothing(&self) -> bool {
        !self.all && self.fields.iter().all(|(_, s)| *s == FieldSpec::Include(false))
    }

    /// Top-level field paths this level reads, `$field` sources included.
    ///
    /// `$all` contributes `"*"`.
    pub fn selected_fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        if self.all {
            out.insert("*".to_owned());
        }
        for (name, spec) in &self.fields {
            match spec {
                FieldSpec::Include(false) | FieldSpec::Value(_) => {}
                FieldSpec::Include(true) | FieldSpec::Map(_) => {
                    out.insert(name.clone());
                }
                FieldSpec::Source { sources, .. } => out.extend(sources.iter().cloned()),
            }
        }
        out
    }
}

/// `$inherit` parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InheritSpec {
    /// Allowed ancestor types; empty allows any.
    pub types: Vec<String>,
    /// `$item`: inherit the whole nearest qualifying ancestor.
    pub item: bool,
    /// `$required`: fields the ancestor must have.
    pub required: Vec<String>,
    /// `$merge`: merge object values across all qualifying ancestors.
    pub merge: bool,
}

/// `$list` parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListSpec {
    /// `$find` inside the list.
    pub find: Option<FindSpec>,
    /// `$sort`.
    pub sort: Option<Sort>,
    /// `$offset`.
    pub offset: usize,
    /// `$limit`.
    pub limit: Option<usize>,
}

/// `$find` parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindSpec {
    /// `$traverse`.
    pub traverse: Option<TraverseSpec>,
    /// `$filter`.
    pub filter: Option<Fork>,
    /// Nested `$find`, run from every match of this one.
    pub find: Option<Box<FindSpec>>,
}

/// `$traverse` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraverseSpec {
    /// Edge name: a hierarchy field or a references field.
    Field(String),
    /// Explicit candidate ids.
    Ids(Vec<NodeId>),
}

impl GetSpec {
    /// Parses and validates a JSON GetSpec.
    pub fn parse(value: &Value, schemas: &Schemas) -> Result<Self, CompileError> {
        let obj = as_object(value, "$root", "")?;
        let db = match obj.get("$db") {
            Some(v) => expect_str(v, "$db", "")?.to_owned(),
            None => DEFAULT_DB.to_owned(),
        };
        let schema = schemas
            .get(&db)
            .ok_or_else(|| CompileError::UnknownDatabase(db.clone()))?;

        let mut root = RootSelector::default();
        if let Some(v) = obj.get("$id") {
            root.ids = string_list(v, "$id", "")?.into_iter().map(NodeId::from).collect();
        }
        if let Some(v) = obj.get("$alias") {
            root.aliases = string_list(v, "$alias", "")?;
        }
        let language = match obj.get("$language") {
            Some(v) => {
                let lang = expect_str(v, "$language", "")?;
                if !schema.has_language(lang) {
                    return Err(CompileError::UnsupportedLanguage(lang.to_owned()));
                }
                Some(lang.to_owned())
            }
            None => None,
        };
        let include_meta = match obj.get("$includeMeta") {
            Some(v) => expect_bool(v, "$includeMeta", "")?,
            None => false,
        };

        let mut rest = obj.clone();
        for key in ["$db", "$id", "$alias", "$language", "$includeMeta"] {
            rest.remove(key);
        }
        let fields = FieldMap::parse(&rest, "", 0)?;
        if fields.inherit.is_some() {
            return Err(CompileError::InvalidDirective {
                directive: "$inherit",
                path: String::new(),
                reason: "not allowed at the top level".to_owned(),
            });
        }
        Ok(Self {
            db,
            root,
            language,
            include_meta,
            fields,
        })
    }
}

impl FieldSpec {
    fn parse(value: &Value, path: &str, depth: usize) -> Result<Self, CompileError> {
        if depth > MAX_DEPTH {
            return Err(CompileError::TooDeep(MAX_DEPTH));
        }
        let obj = match value {
            Value::Bool(b) => return Ok(Self::Include(*b)),
            Value::Object(obj) => obj,
            other => {
                return Err(CompileError::InvalidDirective {
                    directive: "field",
                    path: path.to_owned(),
                    reason: format!("expected true, false or an object, got {other}"),
                })
            }
        };
        if let Some(v) = obj.get("$value") {
            if obj.len() > 1 {
                return Err(CompileError::MixedDirective {
                    directive: "$value",
                    path: path.to_owned(),
                });
            }
            return Ok(Self::Value(v.clone()));
        }
        if let Some(v) = obj.get("$field") {
            if obj.keys().any(|k| k != "$field" && k != "$default") {
                return Err(CompileError::MixedDirective {
                    directive: "$field",
                    path: path.to_owned(),
                });
            }
            return Ok(Self::Source {
                sources: string_list(v, "$field", path)?,
                default: obj.get("$default").cloned(),
            });
        }
        Ok(Self::Map(FieldMap::parse(obj, path, depth)?))
    }
}

impl FieldMap {
    fn parse(obj: &Map<String, Value>, path: &str, depth: usize) -> Result<Self, CompileError> {
        let mut map = Self::default();
        for (key, value) in obj {
            match key.as_str() {
                "$id" => {
                    map.id = string_list(value, "$id", path)?
                        .into_iter()
                        .map(NodeId::from)
                        .collect();
                }
                "$db" => map.db = Some(expect_str(value, "$db", path)?.to_owned()),
                "$all" => map.all = expect_bool(value, "$all", path)?,
                "$inherit" => map.inherit = InheritSpec::parse(value, path)?,
                "$list" => map.list = Some(ListSpec::parse(value, path)?),
                "$find" => map.find = Some(FindSpec::parse(value, path, depth)?),
                "$default" => map.default = Some(value.clone()),
                "$field" | "$value" => {
                    return Err(CompileError::MixedDirective {
                        directive: if key == "$field" { "$field" } else { "$value" },
                        path: path.to_owned(),
                    })
                }
                k if k.starts_with('$') => {
                    return Err(CompileError::UnknownDirective {
                        key: k.to_owned(),
                        path: path.to_owned(),
                    })
                }
                field => {
                    let child = join(path, field);
                    let spec = FieldSpec::parse(value, &child, depth + 1)?;
                    map.fields.push((field.to_owned(), spec));
                }
            }
        }
        if map.list.is_some() && map.find.is_some() {
            return Err(CompileError::ListWithFind(path.to_owned()));
        }
        if map.inherit.is_some() && (map.list.is_some() || map.find.is_some()) {
            return Err(CompileError::InvalidDirective {
                directive: "$inherit",
                path: path.to_owned(),
                reason: "cannot be combined with $list or $find".to_owned(),
            });
        }
        Ok(map)
    }
}

impl InheritSpec {
    fn parse(value: &Value, path: &str) -> Result<Option<Self>, CompileError> {
        let obj = match value {
            Value::Bool(false) => return Ok(None),
            Value::Bool(true) => return Ok(Some(Self::default())),
            Value::Object(obj) => obj,
            _ => return Err(invalid("$inherit", path, "expected a boolean or an object")),
        };
        let mut spec = Self::default();
        for (key, v) in obj {
            match key.as_str() {
                "$type" => spec.types = string_list(v, "$inherit", path)?,
                "$item" => {
                    spec.types = string_list(v, "$inherit", path)?;
                    spec.item = true;
                }
                "$required" => spec.required = string_list(v, "$inherit", path)?,
                "$merge" => spec.merge = expect_bool(v, "$inherit", path)?,
                other => {
                    return Err(CompileError::UnknownDirective {
                        key: other.to_owned(),
                        path: path.to_owned(),
                    })
                }
            }
        }
        Ok(Some(spec))
    }
}

impl ListSpec {
    fn parse(value: &Value, path: &str) -> Result<Self, CompileError> {
        let obj = match value {
            Value::Bool(true) => return Ok(Self::default()),
            Value::Object(obj) => obj,
            _ => return Err(invalid("$list", path, "expected true or an object")),
        };
        let mut spec = Self::default();
        for (key, v) in obj {
            match key.as_str() {
                "$find" => spec.find = Some(FindSpec::parse(v, path, 0)?),
                "$sort" => spec.sort = Some(parse_sort(v, path)?),
                "$offset" => spec.offset = expect_count(v, "$offset", path)?,
                "$limit" => spec.limit = Some(expect_count(v, "$limit", path)?),
                other => {
                    return Err(CompileError::UnknownDirective {
                        key: other.to_owned(),
                        path: path.to_owned(),
                    })
                }
            }
        }
        Ok(spec)
    }
}

impl FindSpec {
    fn parse(value: &Value, path: &str, depth: usize) -> Result<Self, CompileError> {
        if depth > MAX_DEPTH {
            return Err(CompileError::TooDeep(MAX_DEPTH));
        }
        let obj = as_object(value, "$find", path)?;
        let mut spec = Self::default();
        for (key, v) in obj {
            match key.as_str() {
                "$traverse" => {
                    spec.traverse = Some(match v {
                        Value::String(s) => TraverseSpec::Field(s.clone()),
                        Value::Array(_) => TraverseSpec::Ids(
                            string_list(v, "$find", path)?
                                .into_iter()
                                .map(NodeId::from)
                                .collect(),
                        ),
                        _ => return Err(invalid("$find", path, "$traverse must be a string or a list of ids")),
                    });
                }
                "$filter" => spec.filter = Some(Fork::from_json(v)?),
                "$find" => spec.find = Some(Box::new(Self::parse(v, path, depth + 1)?)),
                other => {
                    return Err(CompileError::UnknownDirective {
                        key: other.to_owned(),
                        path: path.to_owned(),
                    })
                }
            }
        }
        Ok(spec)
    }
}

fn parse_sort(value: &Value, path: &str) -> Result<Sort, CompileError> {
    let obj = as_object(value, "$sort", path)?;
    let field = obj
        .get("$field")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("$sort", path, "missing $field"))?;
    let order = match obj.get("$order").and_then(Value::as_str) {
        None | Some("asc") => Order::Asc,
        Some("desc") => Order::Desc,
        Some(other) => return Err(invalid("$sort", path, &format!("unknown order {other}"))),
    };
    Ok(Sort {
        field: field.to_owned(),
        order,
    })
}

/// Joins a parent path and a key with `.`.
pub(crate) fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_owned()
    } else {
        format!("{path}.{key}")
    }
}

fn invalid(directive: &'static str, path: &str, reason: &str) -> CompileError {
    CompileError::InvalidDirective {
        directive,
        path: path.to_owned(),
        reason: reason.to_owned(),
    }
}

fn as_object<'v>(
    value: &'v Value,
    directive: &'static str,
    path: &str,
) -> Result<&'v Map<String, Value>, CompileError> {
    value
        .as_object()
        .ok_or_else(|| invalid(directive, path, "expected an object"))
}

fn expect_str<'v>(value: &'v Value, directive: &'static str, path: &str) -> Result<&'v str, CompileError> {
    value
        .as_str()
        .ok_or_else(|| invalid(directive, path, "expected a string"))
}

fn expect_bool(value: &Value, directive: &'static str, path: &str) -> Result<bool, CompileError> {
    value
        .as_bool()
        .ok_or_else(|| invalid(directive, path, "expected a boolean"))
}

fn expect_count(value: &Value, directive: &'static str, path: &str) -> Result<usize, CompileError> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| invalid(directive, path, "expected a non-negative integer"))
}

fn string_list(value: &Value, directive: &'static str, path: &str) -> Result<Vec<String>, CompileError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| expect_str(v, directive, path).map(str::to_owned))
            .collect(),
        _ => Err(invalid(directive, path, "expected a string or a list of strings")),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;
    use crate::schema::Schema;
    use serde_json::json;

    fn schemas() -> Schemas {
        Schemas::single(
            serde_json::from_value::<Schema>(json!({
                "languages": ["en", "de"],
                "types": { "team": { "prefix": "te", "fields": { "title": { "type": "text" } } } }
            }))
            .unwrap(),
        )
    }

    #[test]
    fn list_and_find_at_one_level_is_rejected() {
        let err = GetSpec::parse(
            &json!({
                "$id": "root",
                "items": { "$list": true, "$find": { "$traverse": "children" }, "id": true }
            }),
            &schemas(),
        )
        .unwrap_err();
        assert_eq!(err, CompileError::ListWithFind("items".into()));
        assert!(err.to_string().contains("put $find in list"));
    }

    #[test]
    fn literal_directives_are_strict() {
        let err = GetSpec::parse(&json!({ "a": { "$value": 1, "b": true } }), &schemas()).unwrap_err();
        assert!(matches!(err, CompileError::MixedDirective { directive: "$value", .. }));

        let err = GetSpec::parse(&json!({ "a": { "$field": "x", "b": true } }), &schemas()).unwrap_err();
        assert!(matches!(err, CompileError::MixedDirective { directive: "$field", .. }));

        let ok = GetSpec::parse(&json!({ "a": { "$field": ["x", "y"], "$default": 3 } }), &schemas()).unwrap();
        assert_eq!(
            ok.fields.fields[0].1,
            FieldSpec::Source {
                sources: vec!["x".into(), "y".into()],
                default: Some(json!(3))
            }
        );
    }

    #[test]
    fn root_directives_are_lifted() {
        let spec = GetSpec::parse(
            &json!({ "$id": ["te1", "te2"], "$alias": "main", "$language": "de", "title": true }),
            &schemas(),
        )
        .unwrap();
        assert_eq!(spec.db, DEFAULT_DB);
        assert_eq!(spec.root.ids, vec![NodeId::new("te1"), NodeId::new("te2")]);
        assert_eq!(spec.root.aliases, vec!["main".to_owned()]);
        assert_eq!(spec.language.as_deref(), Some("de"));
        assert_eq!(spec.fields.fields.len(), 1);
    }

    #[test]
    fn language_must_be_configured() {
        let err = GetSpec::parse(&json!({ "$language": "fr" }), &schemas()).unwrap_err();
        assert_eq!(err, CompileError::UnsupportedLanguage("fr".into()));
    }

    #[test]
    fn unknown_database_is_rejected() {
        let err = GetSpec::parse(&json!({ "$db": "other" }), &schemas()).unwrap_err();
        assert_eq!(err, CompileError::UnknownDatabase("other".into()));
    }

    #[test]
    fn nested_find_and_inherit_shapes() {
        let spec = GetSpec::parse(
            &json!({
                "items": {
                    "$list": {
                        "$sort": { "$field": "name", "$order": "desc" },
                        "$limit": 5,
                        "$find": {
                            "$traverse": "descendants",
                            "$find": { "$filter": { "$field": "type", "$operator": "=", "$value": "team" } }
                        }
                    },
                    "name": true
                },
                "title": { "$inherit": { "$item": "sport", "$required": ["title"] }, "title": true }
            }),
            &schemas(),
        )
        .unwrap();
        let FieldSpec::Map(items) = &spec.fields.fields[0].1 else {
            panic!("expected a map")
        };
        let list = items.list.as_ref().unwrap();
        assert_eq!(list.limit, Some(5));
        assert_eq!(list.sort.as_ref().unwrap().order, Order::Desc);
        let find = list.find.as_ref().unwrap();
        assert_eq!(find.traverse, Some(TraverseSpec::Field("descendants".into())));
        assert!(find.find.as_ref().unwrap().filter.is_some());

        let FieldSpec::Map(title) = &spec.fields.fields[1].1 else {
            panic!("expected a map")
        };
        let inherit = title.inherit.as_ref().unwrap();
        assert!(inherit.item);
        assert_eq!(inherit.types, vec!["sport".to_owned()]);
        assert_eq!(inherit.required, vec!["title".to_owned()]);
    }

    #[test]
    fn unknown_directive_is_rejected() {
        let err = GetSpec::parse(&json!({ "a": { "$nope": 1 } }), &schemas()).unwrap_err();
        assert!(matches!(err, CompileError::UnknownDirective { .. }));
    }

    #[test]
    fn selected_fields_include_sources() {
        let spec = GetSpec::parse(
            &json!({ "a": true, "b": false, "c": { "$field": ["x", "y"] }, "d": { "$value": 1 } }),
            &schemas(),
        )
        .unwrap();
        let fields: Vec<_> = spec.fields.selected_fields().into_iter().collect();
        assert_eq!(fields, vec!["a", "x", "y"]);
    }
}
