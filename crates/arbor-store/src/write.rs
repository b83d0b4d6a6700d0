// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The set/delete write language.
//!
//! A set payload names its node with `$id`, `$alias` or just a `type` (a fresh
//! id is generated), carries plain field values, and edits the hierarchy
//! through `parents` / `children`:
//!
//! ```json
//! { "$id": "te1", "title": "ball", "$language": "en", "parents": { "$add": "sp1" } }
//! ```
//!
//! Payloads are validated completely before anything is written, so a
//! rejected payload leaves the database untouched. Every accepted write emits
//! one change notification per written field path (even when the value did
//! not change) and one per touched hierarchy field on both ends of an edge.
//! A node coming into existence is announced on `<id>.id`; an alias coming
//! into existence that a subscription waits on is announced on `<alias>.id`.
use std::collections::VecDeque;

use arbor_query::schema::{FieldSchema, FieldType, Schema, TypeSchema};
use arbor_query::{ChangeNotification, NodeId};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::graph::{Database, Node};

/// Result of an accepted write.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Applied {
    /// Node written (for deletes: the node asked for).
    pub(crate) id: NodeId,
    /// Nodes removed by a delete, cascade included.
    pub(crate) removed: Vec<NodeId>,
    /// Notifications in emission order.
    pub(crate) changes: Vec<ChangeNotification>,
}

#[derive(Debug)]
enum EdgeEdit {
    Replace(Vec<NodeId>),
    Patch { add: Vec<NodeId>, delete: Vec<NodeId> },
}

#[derive(Debug)]
struct Plan {
    id: NodeId,
    created: bool,
    type_name: String,
    aliases: Vec<String>,
    fields: Vec<(String, Value)>,
    parents: Option<EdgeEdit>,
    children: Option<EdgeEdit>,
}

/// Validates and applies a set payload.
pub(crate) fn set(
    db_name: &str,
    db: &mut Database,
    schema: &Schema,
    payload: &Value,
) -> Result<Applied, StoreError> {
    let plan = plan(db, schema, payload)?;
    Ok(apply(db_name, db, plan))
}

fn plan(db: &mut Database, schema: &Schema, payload: &Value) -> Result<Plan, StoreError> {
    let Value::Object(map) = payload else {
        return Err(StoreError::InvalidPayload(format!("expected an object, got {payload}")));
    };
    let language = match map.get("$language") {
        None => None,
        Some(Value::String(l)) => Some(l.as_str()),
        Some(other) => {
            return Err(StoreError::InvalidPayload(format!("$language must be a string, got {other}")))
        }
    };
    let aliases = string_list(map.get("$alias"), "$alias")?;
    let declared_type = match map.get("type") {
        None => None,
        Some(Value::String(t)) => Some(t.clone()),
        Some(other) => return Err(StoreError::InvalidPayload(format!("type must be a string, got {other}"))),
    };

    let explicit = match map.get("$id") {
        None => None,
        Some(Value::String(id)) => Some(NodeId::from(id.as_str())),
        Some(other) => return Err(StoreError::InvalidPayload(format!("$id must be a string, got {other}"))),
    };
    let by_alias = aliases.iter().find_map(|a| db.aliases.get(a).cloned());
    let (id, created) = match explicit.or(by_alias) {
        Some(id) => {
            let created = !db.contains(&id);
            (id, created)
        }
        None => {
            let type_name = declared_type.as_deref().ok_or(StoreError::MissingIdentity)?;
            let prefix = schema
                .prefix_of(type_name)
                .ok_or_else(|| StoreError::UnknownType(type_name.to_owned()))?;
            (db.generate_id(prefix), true)
        }
    };
    let type_name = match (&declared_type, schema.type_of(&id)) {
        (_, Some(derived)) => derived.to_owned(),
        (Some(declared), None) => return Err(StoreError::UnknownType(declared.clone())),
        (None, None) => return Err(StoreError::UnknownType(id.type_prefix().to_owned())),
    };
    let ty = schema
        .type_schema(&type_name)
        .ok_or_else(|| StoreError::UnknownType(type_name.clone()))?;

    let mut plan = Plan {
        id,
        created,
        type_name,
        aliases,
        fields: Vec::new(),
        parents: None,
        children: None,
    };
    for (key, value) in map {
        match key.as_str() {
            k if k.starts_with('$') => {}
            "id" | "type" => {}
            "parents" | "children" => {
                if plan.id.is_root() && key == "parents" {
                    return Err(StoreError::RootImmutable("re-parented"));
                }
                let edit = edge_edit(db, key, value)?;
                if key == "parents" {
                    plan.parents = Some(edit);
                } else {
                    plan.children = Some(edit);
                }
            }
            "ancestors" | "descendants" => {
                return Err(StoreError::InvalidPayload(format!("{key} is derived and cannot be set")))
            }
            _ => {
                let shaped = shape(db, &plan, ty, key, value, language)?;
                plan.fields.push((key.clone(), shaped));
            }
        }
    }
    Ok(plan)
}

fn shape(
    db: &Database,
    plan: &Plan,
    ty: &TypeSchema,
    key: &str,
    value: &Value,
    language: Option<&str>,
) -> Result<Value, StoreError> {
    let field = ty.fields.get(key).ok_or_else(|| StoreError::UnknownField {
        type_name: plan.type_name.clone(),
        field: key.to_owned(),
    })?;
    let existing = db.nodes.get(&plan.id).and_then(|n| n.fields.get(key));
    Ok(match (field.field_type, value) {
        (FieldType::Text, Value::String(s)) => {
            let lang = language.ok_or_else(|| StoreError::MissingLanguage(key.to_owned()))?;
            let mut merged = existing.and_then(Value::as_object).cloned().unwrap_or_default();
            merged.insert(lang.to_owned(), Value::String(s.clone()));
            Value::Object(merged)
        }
        (FieldType::Text | FieldType::Object, Value::Object(patch)) => {
            let mut merged = existing.cloned().unwrap_or_else(|| Value::Object(Map::new()));
            merge(&mut merged, patch);
            merged
        }
        (FieldType::Text | FieldType::Object, other) => {
            return Err(StoreError::InvalidPayload(format!("{key} expects an object, got {other}")))
        }
        (FieldType::References | FieldType::Set | FieldType::Array, Value::String(_)) => {
            Value::Array(vec![value.clone()])
        }
        (_, other) => {
            check_scalar(key, field, other)?;
            other.clone()
        }
    })
}

fn check_scalar(key: &str, field: &FieldSchema, value: &Value) -> Result<(), StoreError> {
    let ok = match field.field_type {
        FieldType::Number | FieldType::Float | FieldType::Int | FieldType::Timestamp => {
            value.is_number() || value.is_string()
        }
        FieldType::Boolean => value.is_boolean() || value.is_number(),
        FieldType::Record => value.is_object(),
        FieldType::Set | FieldType::Array | FieldType::References => value.is_array(),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidPayload(format!(
            "{key} has type {:?}, got {value}",
            field.field_type
        )))
    }
}

fn merge(target: &mut Value, patch: &Map<String, Value>) {
    let Value::Object(target) = target else {
        *target = Value::Object(patch.clone());
        return;
    };
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (Some(existing @ Value::Object(_)), Value::Object(inner)) => merge(existing, inner),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn string_list(value: Option<&Value>, what: &str) -> Result<Vec<String>, StoreError> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| StoreError::InvalidPayload(format!("{what} entries must be strings, got {v}")))
            })
            .collect(),
        Some(other) => Err(StoreError::InvalidPayload(format!(
            "{what} must be a string or a list, got {other}"
        ))),
    }
}

fn existing_ids(db: &Database, value: Option<&Value>, what: &str) -> Result<Vec<NodeId>, StoreError> {
    string_list(value, what)?
        .into_iter()
        .map(|s| {
            let id = NodeId::from(s);
            if db.contains(&id) {
                Ok(id)
            } else {
                Err(StoreError::UnknownNode(id))
            }
        })
        .collect()
}

fn edge_edit(db: &Database, key: &str, value: &Value) -> Result<EdgeEdit, StoreError> {
    match value {
        Value::Object(map) => {
            if let Some(unknown) = map.keys().find(|k| *k != "$add" && *k != "$delete") {
                return Err(StoreError::InvalidPayload(format!("unknown {key} directive {unknown}")));
            }
            Ok(EdgeEdit::Patch {
                add: existing_ids(db, map.get("$add"), key)?,
                delete: string_list(map.get("$delete"), key)?.into_iter().map(NodeId::from).collect(),
            })
        }
        other => Ok(EdgeEdit::Replace(existing_ids(db, Some(other), key)?)),
    }
}

fn apply(db_name: &str, db: &mut Database, plan: Plan) -> Applied {
    let id = plan.id;
    let mut changes = Vec::new();
    if plan.created {
        let mut node = Node::default();
        node.fields
            .insert("type".to_owned(), Value::String(plan.type_name.clone()));
        db.nodes.insert(id.clone(), node);
        db.missing.remove(id.as_str());
        changes.push(ChangeNotification::changed(db_name, &id, "id"));
        changes.push(ChangeNotification::changed(db_name, &id, "type"));
    }

    for alias in plan.aliases {
        db.aliases.insert(alias.clone(), id.clone());
        if db.missing.remove(&alias).is_some() {
            changes.push(ChangeNotification::changed(db_name, &NodeId::from(alias), "id"));
        }
        changes.push(ChangeNotification::changed(db_name, &id, "aliases"));
    }

    for (key, value) in plan.fields {
        let mut paths = Vec::new();
        leaf_paths(&key, &value, &mut paths);
        if let Some(node) = db.nodes.get_mut(&id) {
            node.fields.insert(key, value);
        }
        changes.extend(paths.iter().map(|p| ChangeNotification::changed(db_name, &id, p)));
    }

    let parents = match plan.parents {
        None if plan.created && !id.is_root() => Some(EdgeEdit::Replace(vec![NodeId::root()])),
        other => other,
    };
    if let Some(edit) = parents {
        let current = db.nodes.get(&id).map(|n| n.parents.clone()).unwrap_or_default();
        let (add, remove) = diff(&current, edit);
        for p in &remove {
            if db.unlink(p, &id) {
                changes.push(ChangeNotification::changed(db_name, p, "children"));
            }
        }
        for p in &add {
            if db.link(p, &id) {
                changes.push(ChangeNotification::changed(db_name, p, "children"));
            }
        }
        changes.push(ChangeNotification::changed(db_name, &id, "parents"));
    }
    if let Some(edit) = plan.children {
        let current = db.nodes.get(&id).map(|n| n.children.clone()).unwrap_or_default();
        let (add, remove) = diff(&current, edit);
        for c in &remove {
            if db.unlink(&id, c) {
                changes.push(ChangeNotification::changed(db_name, c, "parents"));
            }
        }
        for c in &add {
            if *c != id && db.link(&id, c) {
                changes.push(ChangeNotification::changed(db_name, c, "parents"));
            }
        }
        changes.push(ChangeNotification::changed(db_name, &id, "children"));
    }

    Applied {
        id,
        removed: Vec::new(),
        changes,
    }
}

// Edges to add and to remove to reach the requested state.
fn diff(current: &[NodeId], edit: EdgeEdit) -> (Vec<NodeId>, Vec<NodeId>) {
    match edit {
        EdgeEdit::Replace(wanted) => {
            let add = wanted.iter().filter(|w| !current.contains(w)).cloned().collect();
            let remove = current.iter().filter(|c| !wanted.contains(c)).cloned().collect();
            (add, remove)
        }
        EdgeEdit::Patch { add, delete } => (add, delete),
    }
}

fn leaf_paths(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, inner) in map {
                leaf_paths(&format!("{prefix}.{key}"), inner, out);
            }
        }
        _ => out.push(prefix.to_owned()),
    }
}

/// Removes `id` and every descendant left without parents.
pub(crate) fn delete(db_name: &str, db: &mut Database, id: &NodeId) -> Result<Applied, StoreError> {
    if id.is_root() {
        return Err(StoreError::RootImmutable("deleted"));
    }
    let mut applied = Applied {
        id: id.clone(),
        removed: Vec::new(),
        changes: Vec::new(),
    };
    let mut queue = VecDeque::from([id.clone()]);
    while let Some(next) = queue.pop_front() {
        let Some(node) = db.nodes.get(&next).cloned() else {
            continue;
        };
        for p in &node.parents {
            if db.unlink(p, &next) {
                applied.changes.push(ChangeNotification::changed(db_name, p, "children"));
            }
        }
        for c in &node.children {
            if db.unlink(&next, c) {
                applied.changes.push(ChangeNotification::changed(db_name, c, "parents"));
            }
            if db.nodes.get(c).is_some_and(|n| n.parents.is_empty()) {
                queue.push_back(c.clone());
            }
        }
        db.nodes.remove(&next);
        db.aliases.retain(|_, target| *target != next);
        applied.changes.push(ChangeNotification::deleted(db_name, &next));
        applied.removed.push(next);
    }
    Ok(applied)
}
