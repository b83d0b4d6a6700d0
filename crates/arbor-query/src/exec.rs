// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Operation executor.
//!
//! Execution drains a FIFO worklist of frames. A frame is a batch of
//! operations plus the result path they write under; operations that need
//! further reads (nested objects, traversal matches, references, inherited
//! items) compile their selection and push a new frame instead of recursing.
//!
//! Under a subscription every field and traversal the query consults is
//! reported to the [`MarkerRegistrar`] before the storage call is issued.
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rustc_hash::FxHashSet;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use crate::cast::{cast, is_empty, Lang};
use crate::error::{CompileError, ExecError};
use crate::getspec::{join, FieldMap, GetSpec};
use crate::ident::{NodeId, SubscriptionId};
use crate::marker::{Marker, MarkerRegistrar};
use crate::operation::{
    compile, InheritMode, InheritOp, Operation, OperationKind, RefTarget, ReferenceOp, Scope,
    Shape, TraverseOp,
};
use crate::schema::{Schema, Schemas};
use crate::storage::{FindMode, FindQuery, FindReply, Order, Sort, Storage, Traversal};

/// Subscription context of an execution.
pub struct Subscribed<'r> {
    /// Subscription the markers belong to.
    pub id: SubscriptionId,
    /// Marker sink.
    pub registrar: &'r mut dyn MarkerRegistrar,
}

/// Facts gathered while executing, reported under `$meta` on request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecMeta {
    /// Resolved root node.
    pub root: Option<NodeId>,
    /// Fields read on nodes reached through references or nested ids,
    /// per database.
    pub refs: BTreeMap<String, BTreeMap<NodeId, BTreeSet<String>>>,
    /// Nodes matched by traversals.
    pub matched: BTreeSet<NodeId>,
    /// A traversal or inherit marker was newly registered.
    pub has_find_markers: bool,
}

/// Result of an execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    /// Result tree, without `$meta`.
    pub value: Value,
    /// Execution facts.
    pub meta: ExecMeta,
}

/// Runs `spec` and returns the result tree, with `$meta` attached when the
/// spec asks for it.
pub async fn get(storage: &dyn Storage, schemas: &Schemas, spec: &GetSpec) -> Result<Value, ExecError> {
    let Output { mut value, meta } = execute(storage, schemas, spec, None).await?;
    if spec.include_meta {
        if let Value::Object(obj) = &mut value {
            let mut by_db = Map::new();
            by_db.insert(spec.db.clone(), serde_json::to_value(meta).unwrap_or_default());
            obj.insert("$meta".to_owned(), Value::Object(by_db));
        }
    }
    Ok(value)
}

/// Runs `spec`, optionally under a subscription.
///
/// An unresolvable root yields `{"$isNull": true}`; under a subscription the
/// unresolved candidates are registered so their creation triggers a refresh.
#[instrument(level = "debug", skip_all, fields(db = %spec.db))]
pub async fn execute(
    storage: &dyn Storage,
    schemas: &Schemas,
    spec: &GetSpec,
    mut subscribed: Option<Subscribed<'_>>,
) -> Result<Output, ExecError> {
    if schemas.get(&spec.db).is_none() {
        return Err(CompileError::UnknownDatabase(spec.db.clone()).into());
    }
    let root = if spec.root.is_default() {
        Some(NodeId::root())
    } else {
        resolve_root(storage, spec).await?
    };
    let Some(root) = root else {
        if let Some(sub) = subscribed.as_mut() {
            let missing: Vec<String> = spec
                .root
                .aliases
                .iter()
                .cloned()
                .chain(spec.root.ids.iter().map(ToString::to_string))
                .collect();
            storage.add_missing(&spec.db, &sub.id, &missing).await?;
        }
        return Ok(Output {
            value: json!({ "$isNull": true }),
            meta: ExecMeta::default(),
        });
    };

    let ops = compile(
        &spec.fields,
        Scope {
            db: &spec.db,
            schemas,
            id: &root,
        },
        "",
    )?;
    let mut exec = Executor {
        storage,
        schemas,
        language: spec.language.as_deref(),
        subscribed,
        meta: ExecMeta {
            root: Some(root),
            ..ExecMeta::default()
        },
        result: Value::Object(Map::new()),
        queue: VecDeque::new(),
    };
    exec.queue.push_back(Frame {
        base: Vec::new(),
        ops,
        record: Record::ROOT,
    });
    exec.run().await?;
    Ok(Output {
        value: exec.result,
        meta: exec.meta,
    })
}

async fn resolve_root(storage: &dyn Storage, spec: &GetSpec) -> Result<Option<NodeId>, ExecError> {
    for id in &spec.root.ids {
        if storage.exists(&spec.db, id).await? {
            return Ok(Some(id.clone()));
        }
    }
    for alias in &spec.root.aliases {
        if let Some(id) = storage.resolve_alias(&spec.db, alias).await? {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seg {
    Key(String),
    Index(usize),
}

/// What a frame reports while it reads.
#[derive(Debug, Clone, Copy)]
struct Record {
    /// Register per-field markers.
    markers: bool,
    /// Record reads in [`ExecMeta::refs`].
    refs: bool,
}

impl Record {
    const ROOT: Self = Self {
        markers: true,
        refs: false,
    };
    const REFERENCED: Self = Self {
        markers: true,
        refs: true,
    };
    // Traversal and inherit markers already cover these reads.
    const COVERED: Self = Self {
        markers: false,
        refs: false,
    };
}

struct Frame {
    base: Vec<Seg>,
    ops: Vec<Operation>,
    record: Record,
}

struct Executor<'a, 'r> {
    storage: &'a dyn Storage,
    schemas: &'a Schemas,
    language: Option<&'a str>,
    subscribed: Option<Subscribed<'r>>,
    meta: ExecMeta,
    result: Value,
    queue: VecDeque<Frame>,
}

impl<'a> Executor<'a, '_> {
    async fn run(&mut self) -> Result<(), ExecError> {
        while let Some(Frame { base, ops, record }) = self.queue.pop_front() {
            for op in ops {
                self.step(op, &base, record).await?;
            }
        }
        Ok(())
    }

    async fn step(&mut self, op: Operation, base: &[Seg], record: Record) -> Result<(), ExecError> {
        match &op.kind {
            OperationKind::ReadField { sources, default } => {
                self.read_field(&op, sources, default.as_ref(), base, record).await
            }
            OperationKind::Literal(value) => {
                write(&mut self.result, base, &op.field, value.clone());
                Ok(())
            }
            OperationKind::Recurse(map) => {
                let ops = compile(map, self.scope(&op.db, &op.id), &op.field)?;
                self.queue.push_back(Frame {
                    base: base.to_vec(),
                    ops,
                    record,
                });
                Ok(())
            }
            OperationKind::Inherit(inherit) => self.inherit(&op, inherit, base).await,
            OperationKind::Traverse(traverse) => self.traverse(&op, traverse, base).await,
            OperationKind::Reference(reference) => self.reference(&op, reference, base, record).await,
        }
    }

    fn scope<'s>(&self, db: &'s str, id: &'s NodeId) -> Scope<'s>
    where
        'a: 's,
    {
        Scope {
            db,
            schemas: self.schemas,
            id,
        }
    }

    fn schema(&self, db: &str) -> Result<&'a Schema, ExecError> {
        self.schemas
            .get(db)
            .ok_or_else(|| CompileError::UnknownDatabase(db.to_owned()).into())
    }

    fn lang(&self, schema: &'a Schema) -> Lang<'a> {
        Lang {
            requested: self.language,
            fallback: &schema.languages,
        }
    }

    /// Registers a marker when running under a subscription.
    async fn mark(&mut self, db: &str, build: impl FnOnce(SubscriptionId) -> Marker + Send) -> Result<bool, ExecError> {
        let Some(sub) = self.subscribed.as_mut() else {
            return Ok(false);
        };
        let marker = build(sub.id.clone());
        Ok(sub.registrar.register(db, marker).await?)
    }

    fn record_ref(&mut self, db: &str, id: &NodeId, field: &str) {
        self.meta
            .refs
            .entry(db.to_owned())
            .or_default()
            .entry(id.clone())
            .or_default()
            .insert(field.to_owned());
    }

    async fn read_value(&self, schema: &'a Schema, db: &str, id: &NodeId, source: &str) -> Result<Option<Value>, ExecError> {
        match source {
            "id" => return Ok(Some(Value::String(id.to_string()))),
            "type" => return Ok(schema.type_of(id).map(|t| Value::String(t.to_owned()))),
            _ => {}
        }
        let Some(fs) = schema.field_for(id, source) else {
            return Ok(None);
        };
        let raw = self.storage.get_field(db, id, source).await?;
        Ok(raw.and_then(|v| cast(v, fs, self.lang(schema))))
    }

    async fn read_field(
        &mut self,
        op: &Operation,
        sources: &[String],
        default: Option<&Value>,
        base: &[Seg],
        record: Record,
    ) -> Result<(), ExecError> {
        let schema = self.schema(&op.db)?;
        if record.markers {
            self.mark(&op.db, |sub| Marker::node(sub, op.id.clone(), sources.iter().cloned()))
                .await?;
        }
        let mut fallback = None;
        for source in sources {
            if record.refs {
                self.record_ref(&op.db, &op.id, source);
            }
            match self.read_value(schema, &op.db, &op.id, source).await? {
                Some(v) if !is_empty(&v) => {
                    write(&mut self.result, base, &op.field, v);
                    return Ok(());
                }
                Some(v) => {
                    fallback.get_or_insert(v);
                }
                None => {}
            }
        }
        if let Some(v) = fallback.or_else(|| default.cloned()) {
            write(&mut self.result, base, &op.field, v);
        }
        Ok(())
    }

    async fn traverse(&mut self, op: &Operation, t: &TraverseOp, base: &[Seg]) -> Result<(), ExecError> {
        let schema = self.schema(&op.db)?;
        let Some(last) = t.steps.len().checked_sub(1) else {
            return Ok(());
        };
        let mut roots = vec![op.id.clone()];
        for (i, step) in t.steps.iter().enumerate() {
            let is_last = i == last;
            let starts = if step.ids.is_empty() {
                std::mem::take(&mut roots)
            } else {
                step.ids.clone()
            };
            let mut fields = BTreeSet::new();
            if is_last {
                fields = t.item.selected_fields();
                if let Some(sort) = &t.sort {
                    fields.insert(sort.field.clone());
                }
            }
            let marker_nodes = if i == 0 { vec![op.id.clone()] } else { starts.clone() };
            for node in marker_nodes {
                let added = self
                    .mark(&op.db, |sub| {
                        Marker::traversal(sub, node, fields.iter().cloned(), step.direction.clone(), step.filter.clone())
                    })
                    .await?;
                self.meta.has_find_markers |= added;
            }

            let limit = match (is_last, t.shape) {
                (false, _) => None,
                (true, Shape::Single) => Some(1),
                (true, Shape::List) => t.limit,
            };
            let query = FindQuery {
                direction: step.direction.clone(),
                mode: FindMode::Ids,
                roots: starts,
                filter: step.filter.clone(),
                sort: if is_last { t.sort.clone() } else { None },
                offset: if is_last { t.offset } else { 0 },
                limit,
            };
            let (ids, sorted) = match self.storage.find(&op.db, &query).await? {
                FindReply::Ids { ids, sorted } => (ids, sorted),
                FindReply::Merged(_) => (Vec::new(), true),
            };
            let mut seen = FxHashSet::default();
            roots = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();
            if is_last {
                if let (Some(sort), false) = (&t.sort, sorted) {
                    debug!(field = %sort.field, "sorting traversal matches client side");
                    roots = self.sort_client(schema, &op.db, roots, sort).await?;
                    roots = roots.into_iter().skip(t.offset).take(t.limit.unwrap_or(usize::MAX)).collect();
                }
            }
        }
        self.meta.matched.extend(roots.iter().cloned());

        let target = extend(base, &op.field);
        let ids_only = t.item.selects_nothing();
        match t.shape {
            Shape::List => {
                if ids_only {
                    let ids = roots.iter().map(|id| Value::String(id.to_string())).collect();
                    write(&mut self.result, base, &op.field, Value::Array(ids));
                    return Ok(());
                }
                let items = vec![Value::Object(Map::new()); roots.len()];
                write(&mut self.result, base, &op.field, Value::Array(items));
                for (i, id) in roots.iter().enumerate() {
                    let ops = compile(&t.item, self.scope(&op.db, id), "")?;
                    let mut item_base = target.clone();
                    item_base.push(Seg::Index(i));
                    self.queue.push_back(Frame {
                        base: item_base,
                        ops,
                        record: Record::COVERED,
                    });
                }
            }
            Shape::Single => {
                let Some(id) = roots.first() else {
                    if !op.field.is_empty() {
                        write(&mut self.result, base, &op.field, Value::Object(Map::new()));
                    }
                    return Ok(());
                };
                if ids_only {
                    write(&mut self.result, base, &op.field, Value::String(id.to_string()));
                    return Ok(());
                }
                if !op.field.is_empty() {
                    write(&mut self.result, base, &op.field, Value::Object(Map::new()));
                }
                let ops = compile(&t.item, self.scope(&op.db, id), "")?;
                self.queue.push_back(Frame {
                    base: target,
                    ops,
                    record: Record::COVERED,
                });
            }
        }
        Ok(())
    }

    async fn sort_client(&self, schema: &'a Schema, db: &str, ids: Vec<NodeId>, sort: &Sort) -> Result<Vec<NodeId>, ExecError> {
        let mut keyed = Vec::with_capacity(ids.len());
        for id in ids {
            let key = self.read_value(schema, db, &id, &sort.field).await?;
            keyed.push((key, id));
        }
        keyed.sort_by(|(a, _), (b, _)| compare_keys(a.as_ref(), b.as_ref(), sort.order));
        Ok(keyed.into_iter().map(|(_, id)| id).collect())
    }

    async fn reference(&mut self, op: &Operation, r: &ReferenceOp, base: &[Seg], record: Record) -> Result<(), ExecError> {
        let candidates = match &r.target {
            RefTarget::Ids(ids) => ids.clone(),
            RefTarget::Field(field) => {
                if record.markers {
                    self.mark(&op.db, |sub| Marker::node(sub, op.id.clone(), [field.clone()]))
                        .await?;
                }
                if record.refs {
                    self.record_ref(&op.db, &op.id, field);
                }
                match self.storage.get_field(&op.db, &op.id, field).await? {
                    Some(Value::String(s)) => vec![NodeId::from(s)],
                    _ => Vec::new(),
                }
            }
        };
        // Validates the target database before any read against it.
        self.schema(&r.db)?;
        let mut target = None;
        for id in candidates {
            if self.storage.exists(&r.db, &id).await? {
                target = Some(id);
                break;
            }
        }
        let Some(target) = target else {
            return Ok(());
        };
        self.descend(&r.db, &target, &r.map, base, &op.field, Record::REFERENCED)
    }

    /// Compiles `map` for `id` and queues it under `base.field`.
    fn descend(&mut self, db: &str, id: &NodeId, map: &FieldMap, base: &[Seg], field: &str, record: Record) -> Result<(), ExecError> {
        if map.selects_nothing() {
            write(&mut self.result, base, field, Value::String(id.to_string()));
            return Ok(());
        }
        let ops = compile(map, self.scope(db, id), "")?;
        write(&mut self.result, base, field, Value::Object(Map::new()));
        self.queue.push_back(Frame {
            base: extend(base, field),
            ops,
            record,
        });
        Ok(())
    }

    async fn inherit(&mut self, op: &Operation, i: &InheritOp, base: &[Seg]) -> Result<(), ExecError> {
        let schema = self.schema(&op.db)?;
        let watched: Vec<String> = match &i.mode {
            InheritMode::Fields(sel) => sel.iter().map(|(_, src)| src.clone()).collect(),
            InheritMode::Item(map) => map.selected_fields().into_iter().collect(),
            _ => vec![i.source.clone()],
        };
        if self.subscribed.is_some() {
            self.mark(&op.db, |sub| Marker::node(sub, op.id.clone(), watched.iter().cloned()))
                .await?;
            let added = self
                .mark(&op.db, |sub| {
                    Marker::traversal(sub, op.id.clone(), watched.iter().cloned(), Traversal::Ancestors, i.program.clone())
                })
                .await?;
            self.meta.has_find_markers |= added;
        }

        let resolved = match &i.mode {
            InheritMode::Value => {
                let hits = self
                    .storage
                    .inherit(&op.db, &op.id, &i.prefixes, std::slice::from_ref(&i.source))
                    .await?;
                hits.into_iter().next().and_then(|hit| {
                    let fs = schema.field_for(&hit.node, &hit.field)?;
                    cast(hit.value, fs, self.lang(schema))
                })
            }
            InheritMode::Fields(selection) => {
                let hits = self.storage.inherit(&op.db, &op.id, &i.prefixes, &watched).await?;
                let mut found = false;
                for hit in hits {
                    let Some((out, _)) = selection.iter().find(|(_, src)| *src == hit.field) else {
                        continue;
                    };
                    let Some(fs) = schema.field_for(&hit.node, &hit.field) else {
                        continue;
                    };
                    if let Some(v) = cast(hit.value, fs, self.lang(schema)) {
                        write(&mut self.result, base, &join(&op.field, out), v);
                        found = true;
                    }
                }
                if found {
                    return Ok(());
                }
                None
            }
            InheritMode::Merge => self.inherit_merge(op, i, schema).await?,
            InheritMode::Item(map) => {
                let query = FindQuery {
                    limit: Some(1),
                    filter: i.program.clone(),
                    ..FindQuery::ids(Traversal::Ancestors, op.id.clone())
                };
                if let FindReply::Ids { ids, .. } = self.storage.find(&op.db, &query).await? {
                    if let Some(ancestor) = ids.first() {
                        return self.descend(&op.db, ancestor, map, base, &op.field, Record::COVERED);
                    }
                }
                None
            }
            InheritMode::Reference(map) => {
                let hits = self
                    .storage
                    .inherit(&op.db, &op.id, &i.prefixes, std::slice::from_ref(&i.source))
                    .await?;
                let target = hits
                    .into_iter()
                    .find_map(|hit| hit.value.as_str().map(NodeId::from));
                if let Some(target) = target {
                    if self.storage.exists(&op.db, &target).await? {
                        return self.descend(&op.db, &target, map, base, &op.field, Record::REFERENCED);
                    }
                }
                None
            }
        };
        if let Some(v) = resolved.or_else(|| i.default.clone()) {
            write(&mut self.result, base, &op.field, v);
        }
        Ok(())
    }

    async fn inherit_merge(&self, op: &Operation, i: &InheritOp, schema: &'a Schema) -> Result<Option<Value>, ExecError> {
        let query = FindQuery {
            mode: FindMode::Merge {
                field: i.source.clone(),
            },
            filter: i.program.clone(),
            ..FindQuery::ids(Traversal::Ancestors, op.id.clone())
        };
        let mut merged = match self.storage.find(&op.db, &query).await? {
            FindReply::Merged(map) => map,
            FindReply::Ids { .. } => Map::new(),
        };
        // The node's own keys win over every ancestor's.
        if let Some(Value::Object(own)) = self.storage.get_field(&op.db, &op.id, &i.source).await? {
            merged.extend(own);
        }
        if merged.is_empty() {
            return Ok(None);
        }
        let fs = schema
            .field_for(&op.id, &i.source)
            .or_else(|| schema.any_field(&i.source));
        Ok(match fs {
            Some(fs) => cast(Value::Object(merged), fs, self.lang(schema)),
            None => Some(Value::Object(merged)),
        })
    }
}

fn compare_keys(a: Option<&Value>, b: Option<&Value>, order: Order) -> Ordering {
    let ord = match (a, b) {
        (None, None) => return Ordering::Equal,
        // Missing keys sort last in both directions.
        (None, Some(_)) => return Ordering::Greater,
        (Some(_), None) => return Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .unwrap_or(0.0)
            .total_cmp(&y.as_f64().unwrap_or(0.0)),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    };
    match order {
        Order::Asc => ord,
        Order::Desc => ord.reverse(),
    }
}

fn extend(base: &[Seg], field: &str) -> Vec<Seg> {
    let mut out = base.to_vec();
    out.extend(
        field
            .split('.')
            .filter(|s| !s.is_empty())
            .map(|s| Seg::Key(s.to_owned())),
    );
    out
}

/// Writes `value` at `base.field`, creating intermediate objects.
fn write(result: &mut Value, base: &[Seg], field: &str, value: Value) {
    let path = extend(base, field);
    let Some((last, parents)) = path.split_last() else {
        match (result, value) {
            (Value::Object(dst), Value::Object(src)) => dst.extend(src),
            (dst, v) => *dst = v,
        }
        return;
    };
    let mut current = result;
    for seg in parents {
        current = match seg {
            Seg::Key(key) => {
                if !current.is_object() {
                    *current = Value::Object(Map::new());
                }
                let Value::Object(obj) = current else { return };
                obj.entry(key.clone()).or_insert_with(|| Value::Object(Map::new()))
            }
            Seg::Index(i) => match current.get_mut(*i) {
                Some(v) => v,
                None => return,
            },
        };
    }
    match last {
        Seg::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            if let Value::Object(obj) = current {
                obj.insert(key.clone(), value);
            }
        }
        Seg::Index(i) => {
            if let Some(slot) = current.get_mut(*i) {
                *slot = value;
            }
        }
    }
}
