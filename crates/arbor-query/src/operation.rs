// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Operation compiler: one field map level to an ordered operation list.
//!
//! Compilation covers one object level at a time. Nested plain maps become
//! [`OperationKind::Recurse`] and are compiled when the executor reaches them,
//! so neither side recurses over the GetSpec tree.
use serde_json::Value;

use crate::error::CompileError;
use crate::filter::{self, FilterProgram, Fork};
use crate::getspec::{join, FieldMap, FieldSpec, FindSpec, InheritSpec, TraverseSpec};
use crate::ident::NodeId;
use crate::schema::{is_hierarchy_field, FieldType, Schema, Schemas};
use crate::storage::{Sort, Traversal};

/// Node and database a field map is compiled against.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    /// Database name.
    pub db: &'a str,
    /// All known schemas.
    pub schemas: &'a Schemas,
    /// Node the fields belong to.
    pub id: &'a NodeId,
}

impl<'a> Scope<'a> {
    /// Schema of the scope's database.
    pub fn schema(&self) -> Result<&'a Schema, CompileError> {
        self.schemas
            .get(self.db)
            .ok_or_else(|| CompileError::UnknownDatabase(self.db.to_owned()))
    }
}

/// One step of query execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Database of `id`.
    pub db: String,
    /// Node the operation reads from.
    pub id: NodeId,
    /// Destination path, relative to the enclosing result object.
    pub field: String,
    /// What to do.
    pub kind: OperationKind,
}

/// Operation variants.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    /// Read the first non-empty source field, else `default`.
    ReadField {
        /// Source paths on the node, in fallback order.
        sources: Vec<String>,
        /// Fallback value.
        default: Option<Value>,
    },
    /// Constant (`$value`).
    Literal(Value),
    /// Nested object selection on the same node.
    Recurse(FieldMap),
    /// Ancestor lookup.
    Inherit(InheritOp),
    /// `$find` / `$list`.
    Traverse(TraverseOp),
    /// Read another node, possibly in another database.
    Reference(ReferenceOp),
}

/// Parameters of [`OperationKind::Inherit`].
#[derive(Debug, Clone, PartialEq)]
pub struct InheritOp {
    /// Field path inherited.
    pub source: String,
    /// Allowed ancestor types.
    pub types: Vec<String>,
    /// Type prefixes of `types`; empty allows any.
    pub prefixes: Vec<String>,
    /// Resolution mode.
    pub mode: InheritMode,
    /// Filter qualifying ancestors (used by markers, item and merge lookups).
    pub program: Option<FilterProgram>,
    /// Fallback value.
    pub default: Option<Value>,
}

/// How an inherited value is resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum InheritMode {
    /// Nearest value of `source`.
    Value,
    /// Nearest value per selected field: `(output name, source path)`.
    Fields(Vec<(String, String)>),
    /// Object values of all qualifying ancestors merged, nearest wins.
    Merge,
    /// Fields of the nearest qualifying ancestor.
    Item(FieldMap),
    /// Nearest reference value, followed and read with the selection.
    Reference(FieldMap),
}

/// Shape of a traversal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// First match (`$find`), or an empty object.
    Single,
    /// All matches (`$list`).
    List,
}

/// One breadth-first traversal. Steps after the first start from the
/// previous step's matches.
#[derive(Debug, Clone, PartialEq)]
pub struct FindStep {
    /// Edge walked.
    pub direction: Traversal,
    /// Explicit candidates; empty means "the previous step's matches".
    pub ids: Vec<NodeId>,
    /// Compiled filter.
    pub filter: Option<FilterProgram>,
}

/// Parameters of [`OperationKind::Traverse`].
#[derive(Debug, Clone, PartialEq)]
pub struct TraverseOp {
    /// Single or list.
    pub shape: Shape,
    /// Traversal chain (nested `$find`s).
    pub steps: Vec<FindStep>,
    /// Sort of the final matches.
    pub sort: Option<Sort>,
    /// Matches skipped.
    pub offset: usize,
    /// Maximum matches.
    pub limit: Option<usize>,
    /// Selection applied to every match.
    pub item: FieldMap,
}

/// Where a referenced node id comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefTarget {
    /// Explicit candidates (nested `$id`); the first existing one wins.
    Ids(Vec<NodeId>),
    /// A reference field on the current node.
    Field(String),
}

/// Parameters of [`OperationKind::Reference`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceOp {
    /// Database of the referenced node.
    pub db: String,
    /// Target.
    pub target: RefTarget,
    /// Selection on the referenced node.
    pub map: FieldMap,
}

/// Compiles the field map sitting at `path` of the node in `scope`.
///
/// A map carrying `$find`, `$list`, `$inherit` or a nested `$id` compiles to
/// exactly one operation; a plain map compiles to one operation per selected
/// field. Fields the schema does not know are kept and dropped at execution.
pub fn compile(map: &FieldMap, scope: Scope<'_>, path: &str) -> Result<Vec<Operation>, CompileError> {
    if let Some(op) = directive(map, scope, path)? {
        return Ok(vec![op]);
    }
    let schema = scope.schema()?;
    let mut ops = Vec::with_capacity(map.fields.len());
    if map.all {
        expand_all(map, scope, schema, path, &mut ops);
    }
    for (name, spec) in &map.fields {
        let field = join(path, name);
        let kind = match spec {
            FieldSpec::Include(false) => continue,
            FieldSpec::Include(true) => read(&field, None),
            FieldSpec::Source { sources, default } => OperationKind::ReadField {
                sources: sources.clone(),
                default: default.clone(),
            },
            FieldSpec::Value(v) => OperationKind::Literal(v.clone()),
            FieldSpec::Map(nested) => {
                if let Some(op) = directive(nested, scope, &field)? {
                    ops.push(op);
                    continue;
                }
                if nested.is_bare() {
                    read(&field, nested.default.clone())
                } else {
                    match schema.field_for(scope.id, &field) {
                        Some(fs) if fs.field_type == FieldType::Reference => {
                            OperationKind::Reference(ReferenceOp {
                                db: fs.db.clone().unwrap_or_else(|| scope.db.to_owned()),
                                target: RefTarget::Field(field.clone()),
                                map: nested.clone(),
                            })
                        }
                        _ => OperationKind::Recurse(nested.clone()),
                    }
                }
            }
        };
        ops.push(op(scope, field, kind));
    }
    Ok(ops)
}

fn op(scope: Scope<'_>, field: String, kind: OperationKind) -> Operation {
    Operation {
        db: scope.db.to_owned(),
        id: scope.id.clone(),
        field,
        kind,
    }
}

fn read(field: &str, default: Option<Value>) -> OperationKind {
    OperationKind::ReadField {
        sources: vec![field.to_owned()],
        default,
    }
}

fn directive(map: &FieldMap, scope: Scope<'_>, path: &str) -> Result<Option<Operation>, CompileError> {
    if map.list.is_some() || map.find.is_some() {
        return traverse(map, scope, path).map(Some);
    }
    if let Some(spec) = &map.inherit {
        return inherit(map, spec, scope, path).map(Some);
    }
    let other_db = map.db.as_deref().filter(|db| *db != scope.db);
    if map.id.is_empty() && other_db.is_none() {
        return Ok(None);
    }
    if map.id.is_empty() {
        return Err(CompileError::InvalidDirective {
            directive: "$db",
            path: path.to_owned(),
            reason: "a nested $db needs an $id".to_owned(),
        });
    }
    let db = other_db.unwrap_or(scope.db);
    if scope.schemas.get(db).is_none() {
        return Err(CompileError::UnknownDatabase(db.to_owned()));
    }
    let mut selection = selection(map);
    selection.default = None;
    Ok(Some(op(
        scope,
        path.to_owned(),
        OperationKind::Reference(ReferenceOp {
            db: db.to_owned(),
            target: RefTarget::Ids(map.id.clone()),
            map: selection,
        }),
    )))
}

/// The map with its structural directives removed.
fn selection(map: &FieldMap) -> FieldMap {
    FieldMap {
        all: map.all,
        default: map.default.clone(),
        fields: map.fields.clone(),
        ..FieldMap::default()
    }
}

fn expand_all(map: &FieldMap, scope: Scope<'_>, schema: &Schema, path: &str, ops: &mut Vec<Operation>) {
    let listed = |key: &str| map.fields.iter().any(|(name, _)| name == key);
    if path.is_empty() {
        let Some(ty) = schema.type_schema_for(scope.id) else {
            return;
        };
        for key in ty.fields.keys() {
            if !is_hierarchy_field(key) && !listed(key) {
                ops.push(op(scope, key.clone(), read(key, None)));
            }
        }
        return;
    }
    let Some(fs) = schema.field_for(scope.id, path) else {
        return;
    };
    match fs.field_type {
        FieldType::Object => {
            for key in fs.properties.keys() {
                if !listed(key) {
                    let field = join(path, key);
                    ops.push(op(scope, field.clone(), read(&field, None)));
                }
            }
        }
        FieldType::Record | FieldType::Text => {
            ops.push(op(scope, path.to_owned(), read(path, None)));
        }
        _ => {}
    }
}

/// Traversal implied by the field a `$find` / `$list` sits under.
fn implied(scope: Scope<'_>, schema: &Schema, path: &str) -> Option<Traversal> {
    if path.is_empty() {
        return None;
    }
    let last = path.rsplit('.').next().unwrap_or(path);
    Traversal::from_field_name(last).or_else(|| {
        schema
            .field_for(scope.id, path)
            .filter(|fs| fs.field_type == FieldType::References)
            .map(|_| Traversal::Field(path.to_owned()))
    })
}

fn edge(name: &str) -> Traversal {
    Traversal::from_field_name(name).unwrap_or_else(|| Traversal::Field(name.to_owned()))
}

fn traverse(map: &FieldMap, scope: Scope<'_>, path: &str) -> Result<Operation, CompileError> {
    if map.list.is_some() && map.find.is_some() {
        return Err(CompileError::ListWithFind(path.to_owned()));
    }
    let schema = scope.schema()?;
    let (shape, find, sort, offset, limit) = match &map.list {
        Some(list) => (Shape::List, list.find.as_ref(), list.sort.clone(), list.offset, list.limit),
        None => (Shape::Single, map.find.as_ref(), None, 0, None),
    };
    let implied = implied(scope, schema, path);

    let mut steps = Vec::new();
    let Some(first) = find else {
        // `$list: true` lists the edge named by the field.
        let direction = implied.ok_or_else(|| CompileError::NeedsTraverse(path.to_owned()))?;
        steps.push(FindStep {
            direction,
            ids: Vec::new(),
            filter: None,
        });
        return Ok(op(
            scope,
            path.to_owned(),
            OperationKind::Traverse(TraverseOp {
                shape,
                steps,
                sort,
                offset,
                limit,
                item: selection(map),
            }),
        ));
    };

    let mut previous: Option<Traversal> = None;
    let mut current: Option<&FindSpec> = Some(first);
    while let Some(find) = current {
        let (direction, ids) = match &find.traverse {
            Some(TraverseSpec::Field(name)) => (edge(name), Vec::new()),
            Some(TraverseSpec::Ids(ids)) => (Traversal::Node, ids.clone()),
            None => (
                previous
                    .clone()
                    .or_else(|| implied.clone())
                    .ok_or_else(|| CompileError::NeedsTraverse(path.to_owned()))?,
                Vec::new(),
            ),
        };
        let filter = find
            .filter
            .as_ref()
            .map(|fork| filter::compile(fork, schema))
            .transpose()?;
        previous = Some(direction.clone());
        steps.push(FindStep {
            direction,
            ids,
            filter,
        });
        current = find.find.as_deref();
    }

    Ok(op(
        scope,
        path.to_owned(),
        OperationKind::Traverse(TraverseOp {
            shape,
            steps,
            sort,
            offset,
            limit,
            item: selection(map),
        }),
    ))
}

fn inherit(map: &FieldMap, spec: &InheritSpec, scope: Scope<'_>, path: &str) -> Result<Operation, CompileError> {
    let schema = scope.schema()?;
    let prefixes = spec
        .types
        .iter()
        .map(|t| {
            schema
                .prefix_of(t)
                .map(str::to_owned)
                .ok_or_else(|| CompileError::UnknownType(t.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let source = path.to_owned();
    let field_schema = match prefixes.first() {
        Some(prefix) => schema.field_for_prefix(prefix, &source),
        None => schema.field_for(scope.id, &source),
    }
    .or_else(|| schema.any_field(&source));
    let field_type = field_schema.map(|fs| fs.field_type);

    let selected: Vec<(String, String)> = map
        .fields
        .iter()
        .filter_map(|(name, spec)| match spec {
            FieldSpec::Include(true) => Some((name.clone(), join(path, name))),
            FieldSpec::Source { sources, .. } => sources.first().map(|s| (name.clone(), s.clone())),
            _ => None,
        })
        .collect();

    let mode = if spec.item {
        let mut item = selection(map);
        item.default = None;
        InheritMode::Item(item)
    } else if field_type == Some(FieldType::Reference) {
        let mut item = selection(map);
        item.default = None;
        InheritMode::Reference(item)
    } else if spec.merge && matches!(field_type, Some(FieldType::Object | FieldType::Record)) {
        InheritMode::Merge
    } else if selected.is_empty() {
        InheritMode::Value
    } else {
        InheritMode::Fields(selected.clone())
    };

    let type_fork = (!spec.types.is_empty()).then(|| Fork::any_type(&spec.types));
    let fork = if spec.item {
        let mut parts: Vec<Fork> = spec.required.iter().map(Fork::exists).collect();
        parts.extend(type_fork);
        (!parts.is_empty()).then_some(Fork::And(parts))
    } else {
        let watched: Vec<&str> = match &mode {
            InheritMode::Fields(sel) => sel.iter().map(|(_, s)| s.as_str()).collect(),
            _ => vec![source.as_str()],
        };
        let mut parts = vec![Fork::Or(watched.into_iter().map(Fork::exists).collect())];
        parts.extend(type_fork);
        Some(Fork::And(parts))
    };
    let program = fork.map(|f| filter::compile(&f, schema)).transpose()?;

    Ok(op(
        scope,
        path.to_owned(),
        OperationKind::Inherit(InheritOp {
            source,
            types: spec.types.clone(),
            prefixes,
            mode,
            program,
            default: map.default.clone(),
        }),
    ))
}
