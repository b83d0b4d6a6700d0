// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Static dependency walk of a GetSpec.
//!
//! A subscription depends on `(node, field)` pairs. The node is known exactly
//! for the root and for anything reached through an id. For nodes reached
//! through a traversal only the type prefix and the region (descendants of X,
//! ancestors of X, ...) are known, so those dependencies carry a
//! [`Containment`] the manager checks when a write hits them.
//!
//! The walk compiles the GetSpec one level at a time with an explicit frame
//! stack and never calls storage. Nodes read through reference fields are
//! only known after an execution and come from [`ExecMeta::refs`].
use std::collections::BTreeSet;

use arbor_query::exec::ExecMeta;
use arbor_query::filter::{Instruction, OpCode};
use arbor_query::getspec::FieldMap;
use arbor_query::operation::{self, InheritMode, InheritOp, OperationKind, RefTarget, Scope, TraverseOp};
use arbor_query::storage::Traversal;
use arbor_query::{CompileError, FilterProgram, GetSpec, NodeId, Schemas};

/// Field path matching any field of a node (`$all` at the top level).
pub const ANY_FIELD: &str = "*";

/// Region of the hierarchy a type or wildcard dependency is limited to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Containment {
    /// Every node qualifies.
    Always,
    /// Only nodes reached from `root` along `direction`.
    Within {
        /// Start of the traversal.
        root: NodeId,
        /// Edge walked.
        direction: Traversal,
    },
}

/// Nodes a dependency applies to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Target {
    /// Exactly this node.
    Node(NodeId),
    /// Nodes with this type prefix inside the region.
    Prefix {
        /// Two-character type prefix.
        prefix: String,
        /// Region.
        containment: Containment,
    },
    /// Nodes of any type inside the region.
    Any(Containment),
}

/// One `(nodes, field)` dependency of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dependency {
    /// Database of the nodes.
    pub db: String,
    /// Nodes.
    pub target: Target,
    /// Field path, or [`ANY_FIELD`].
    pub field: String,
}

/// What a compiled filter reveals about its matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramShape {
    /// Type prefixes every match must have; `None` when unconstrained.
    pub prefixes: Option<BTreeSet<String>>,
    /// Fields the filter reads.
    pub fields: BTreeSet<String>,
}

enum Sym {
    Name(String),
    Value,
    Cond(Option<BTreeSet<String>>),
}

impl Sym {
    fn cond(self) -> Option<BTreeSet<String>> {
        match self {
            Self::Cond(c) => c,
            Self::Name(_) | Self::Value => None,
        }
    }
}

impl ProgramShape {
    /// Evaluates `program` symbolically.
    ///
    /// `type = x` narrows to `{x}`; AND intersects constrained operands, OR
    /// unions them only when both sides are constrained, NOT drops the
    /// constraint.
    pub fn of(program: &FilterProgram) -> Self {
        let mut fields = BTreeSet::new();
        let mut stack: Vec<Sym> = Vec::new();
        for ins in program.instructions() {
            let sym = match ins {
                Instruction::Name(n) => Sym::Name(n.clone()),
                Instruction::Num(_) | Instruction::Reg(_) => Sym::Value,
                Instruction::Op(OpCode::TypeEq) => match stack.pop() {
                    Some(Sym::Name(prefix)) => Sym::Cond(Some(BTreeSet::from([prefix]))),
                    _ => Sym::Cond(None),
                },
                Instruction::Op(OpCode::GetStr | OpCode::GetNum) => {
                    if let Some(Sym::Name(field)) = stack.pop() {
                        fields.insert(field);
                    }
                    Sym::Value
                }
                Instruction::Op(OpCode::Not) => {
                    stack.pop();
                    Sym::Cond(None)
                }
                Instruction::Op(OpCode::And) => {
                    let a = stack.pop().and_then(Sym::cond);
                    let b = stack.pop().and_then(Sym::cond);
                    Sym::Cond(match (a, b) {
                        (Some(a), Some(b)) => Some(a.intersection(&b).cloned().collect()),
                        (Some(x), None) | (None, Some(x)) => Some(x),
                        (None, None) => None,
                    })
                }
                Instruction::Op(OpCode::Or) => {
                    let a = stack.pop().and_then(Sym::cond);
                    let b = stack.pop().and_then(Sym::cond);
                    Sym::Cond(match (a, b) {
                        (Some(mut a), Some(b)) => {
                            a.extend(b);
                            Some(a)
                        }
                        _ => None,
                    })
                }
                Instruction::Op(_) => {
                    stack.pop();
                    stack.pop();
                    Sym::Cond(None)
                }
            };
            stack.push(sym);
        }
        let prefixes = match (stack.pop(), stack.is_empty()) {
            (Some(top), true) => top.cond(),
            _ => None,
        };
        Self { prefixes, fields }
    }
}

#[derive(Debug, Clone)]
enum Subject {
    Node(NodeId),
    Items {
        prefix: Option<String>,
        containment: Containment,
    },
}

impl Subject {
    fn items(prefixes: Option<BTreeSet<String>>, containment: &Containment) -> Vec<Self> {
        match prefixes {
            Some(prefixes) => prefixes
                .into_iter()
                .map(|p| Self::Items {
                    prefix: Some(p),
                    containment: containment.clone(),
                })
                .collect(),
            None => vec![Self::Items {
                prefix: None,
                containment: containment.clone(),
            }],
        }
    }

    fn target(&self) -> Target {
        match self {
            Self::Node(id) => Target::Node(id.clone()),
            Self::Items {
                prefix: Some(prefix),
                containment,
            } => Target::Prefix {
                prefix: prefix.clone(),
                containment: containment.clone(),
            },
            Self::Items {
                prefix: None,
                containment,
            } => Target::Any(containment.clone()),
        }
    }

    // Id the subject's selection compiles against; only its prefix matters.
    fn template(&self) -> NodeId {
        match self {
            Self::Node(id) => id.clone(),
            Self::Items { prefix: Some(p), .. } => NodeId::new(p.as_str()),
            Self::Items { prefix: None, .. } => NodeId::new(ANY_FIELD),
        }
    }
}

struct Frame {
    db: String,
    subject: Subject,
    map: FieldMap,
    path: String,
}

struct Walk<'a> {
    schemas: &'a Schemas,
    frames: Vec<Frame>,
    out: BTreeSet<Dependency>,
}

/// Dependencies of `spec` as last executed.
///
/// `meta.root` is the resolved root; while it is `None` only the creation of
/// a candidate root (`<id>.id`, `<alias>.id`) is watched.
pub fn collect(spec: &GetSpec, schemas: &Schemas, meta: &ExecMeta) -> Result<BTreeSet<Dependency>, CompileError> {
    let mut walk = Walk {
        schemas,
        frames: Vec::new(),
        out: BTreeSet::new(),
    };
    for id in &spec.root.ids {
        walk.add(&spec.db, Target::Node(id.clone()), "id");
    }
    for alias in &spec.root.aliases {
        walk.add(&spec.db, Target::Node(NodeId::new(alias.as_str())), "id");
    }
    if let Some(root) = &meta.root {
        walk.frames.push(Frame {
            db: spec.db.clone(),
            subject: Subject::Node(root.clone()),
            map: spec.fields.clone(),
            path: String::new(),
        });
    }
    walk.run()?;
    for (db, nodes) in &meta.refs {
        for (id, fields) in nodes {
            for field in fields {
                walk.add(db, Target::Node(id.clone()), field);
            }
        }
    }
    Ok(walk.out)
}

impl Walk<'_> {
    fn add(&mut self, db: &str, target: Target, field: &str) {
        self.out.insert(Dependency {
            db: db.to_owned(),
            target,
            field: field.to_owned(),
        });
    }

    fn run(&mut self) -> Result<(), CompileError> {
        while let Some(Frame {
            db,
            subject,
            map,
            path,
        }) = self.frames.pop()
        {
            if map.all {
                let field = if path.is_empty() { ANY_FIELD } else { path.as_str() };
                self.add(&db, subject.target(), field);
            }
            let template = subject.template();
            let scope = Scope {
                db: &db,
                schemas: self.schemas,
                id: &template,
            };
            for op in operation::compile(&map, scope, &path)? {
                match op.kind {
                    OperationKind::ReadField { sources, .. } => {
                        for source in sources {
                            self.add(&db, subject.target(), &source);
                        }
                    }
                    OperationKind::Literal(_) => {}
                    OperationKind::Recurse(nested) => self.frames.push(Frame {
                        db: db.clone(),
                        subject: subject.clone(),
                        map: nested,
                        path: op.field,
                    }),
                    OperationKind::Reference(reference) => match reference.target {
                        RefTarget::Ids(ids) => {
                            for id in ids {
                                self.add(&reference.db, Target::Node(id.clone()), "id");
                                self.frames.push(Frame {
                                    db: reference.db.clone(),
                                    subject: Subject::Node(id),
                                    map: reference.map.clone(),
                                    path: String::new(),
                                });
                            }
                        }
                        RefTarget::Field(field) => self.add(&db, subject.target(), &field),
                    },
                    OperationKind::Inherit(inherit) => self.inherit(&db, &subject, inherit),
                    OperationKind::Traverse(traverse) => self.traverse(&db, &subject, &traverse),
                }
            }
        }
        Ok(())
    }

    fn inherit(&mut self, db: &str, subject: &Subject, op: InheritOp) {
        let mut fields: BTreeSet<String> = match &op.mode {
            InheritMode::Fields(selected) => selected.iter().map(|(_, s)| s.clone()).collect(),
            InheritMode::Item(_) => BTreeSet::new(),
            InheritMode::Value | InheritMode::Merge | InheritMode::Reference(_) => {
                BTreeSet::from([op.source.clone()])
            }
        };
        if let Some(program) = &op.program {
            fields.extend(ProgramShape::of(program).fields);
        }
        let region = match subject {
            Subject::Node(id) => Containment::Within {
                root: id.clone(),
                direction: Traversal::Ancestors,
            },
            Subject::Items { .. } => Containment::Always,
        };
        let prefixes = (!op.prefixes.is_empty()).then(|| op.prefixes.iter().cloned().collect());
        let ancestors = Subject::items(prefixes, &region);
        let item_mode = matches!(op.mode, InheritMode::Item(_));
        for field in &fields {
            if !item_mode {
                self.add(db, subject.target(), field);
            }
            for ancestor in &ancestors {
                self.add(db, ancestor.target(), field);
            }
        }
        self.add(db, subject.target(), "parents");
        self.add(db, Target::Any(region), "parents");
        if let InheritMode::Item(map) = op.mode {
            for ancestor in ancestors {
                self.frames.push(Frame {
                    db: db.to_owned(),
                    subject: ancestor,
                    map: map.clone(),
                    path: String::new(),
                });
            }
        }
    }

    fn traverse(&mut self, db: &str, subject: &Subject, op: &TraverseOp) {
        let mut starts = vec![subject.clone()];
        for (i, step) in op.steps.iter().enumerate() {
            let structural = step.direction.structural_fields();
            for start in &starts {
                for field in &structural {
                    self.add(db, start.target(), field);
                }
            }
            let region = match (i, subject) {
                (0, Subject::Node(id)) => Containment::Within {
                    root: id.clone(),
                    direction: step.direction.clone(),
                },
                _ => Containment::Always,
            };
            if matches!(step.direction, Traversal::Ancestors | Traversal::Descendants) {
                for field in &structural {
                    self.add(db, Target::Any(region.clone()), field);
                }
            }
            let shape = step.filter.as_ref().map(ProgramShape::of).unwrap_or_default();
            let matches = if step.ids.is_empty() {
                Subject::items(shape.prefixes, &region)
            } else {
                step.ids.iter().cloned().map(Subject::Node).collect()
            };
            for m in &matches {
                if let Subject::Node(_) = m {
                    self.add(db, m.target(), "id");
                }
                for field in &shape.fields {
                    self.add(db, m.target(), field);
                }
            }
            starts = matches;
        }
        if let Some(sort) = &op.sort {
            for start in &starts {
                self.add(db, start.target(), &sort.field);
            }
        }
        for start in starts {
            self.frames.push(Frame {
                db: db.to_owned(),
                subject: start,
                map: op.item.clone(),
                path: String::new(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use arbor_query::{compile_filter, Fork, Schema};
    use serde_json::json;

    fn schema() -> Schema {
        serde_json::from_value(json!({
            "languages": ["en"],
            "types": {
                "sport": { "prefix": "sp", "fields": { "title": { "type": "text" } } },
                "team": {
                    "prefix": "te",
                    "fields": {
                        "name": { "type": "string" },
                        "title": { "type": "text" },
                        "captain": { "type": "reference" }
                    }
                },
                "match": {
                    "prefix": "ma",
                    "fields": { "name": { "type": "string" }, "value": { "type": "number" } }
                }
            }
        }))
        .unwrap()
    }

    fn deps(spec: serde_json::Value, root: Option<&str>) -> BTreeSet<Dependency> {
        let schemas = Schemas::single(schema());
        let spec = GetSpec::parse(&spec, &schemas).unwrap();
        let meta = ExecMeta {
            root: root.map(NodeId::new),
            ..ExecMeta::default()
        };
        collect(&spec, &schemas, &meta).unwrap()
    }

    fn dep(target: Target, field: &str) -> Dependency {
        Dependency {
            db: "default".to_owned(),
            target,
            field: field.to_owned(),
        }
    }

    fn node(id: &str) -> Target {
        Target::Node(NodeId::new(id))
    }

    #[test]
    fn plain_fields_depend_on_the_root() {
        let out = deps(json!({ "$id": "ma1", "value": true, "name": { "$field": ["title", "name"] } }), Some("ma1"));
        let expected: BTreeSet<_> = [
            dep(node("ma1"), "id"),
            dep(node("ma1"), "value"),
            dep(node("ma1"), "title"),
            dep(node("ma1"), "name"),
        ]
        .into();
        assert_eq!(out, expected);
    }

    #[test]
    fn unresolved_roots_only_watch_creation() {
        let out = deps(json!({ "$alias": "final", "value": true }), None);
        assert_eq!(out, BTreeSet::from([dep(node("final"), "id")]));
    }

    #[test]
    fn lists_depend_on_typed_items_within_the_region() {
        let out = deps(
            json!({
                "$id": "te1",
                "matches": {
                    "name": true,
                    "$list": {
                        "$sort": { "$field": "value", "$order": "desc" },
                        "$find": {
                            "$traverse": "children",
                            "$filter": [
                                { "$field": "type", "$operator": "=", "$value": "match" },
                                { "$field": "value", "$operator": ">", "$value": 4 }
                            ]
                        }
                    }
                }
            }),
            Some("te1"),
        );
        let items = Target::Prefix {
            prefix: "ma".to_owned(),
            containment: Containment::Within {
                root: NodeId::new("te1"),
                direction: Traversal::Children,
            },
        };
        assert!(out.contains(&dep(node("te1"), "children")));
        assert!(out.contains(&dep(items.clone(), "value")));
        assert!(out.contains(&dep(items, "name")));
        assert!(!out.iter().any(|d| matches!(d.target, Target::Any(_))));
    }

    #[test]
    fn descendants_watch_structure_below_the_root() {
        let out = deps(
            json!({ "$id": "sp1", "items": { "id": true, "$list": { "$find": { "$traverse": "descendants" } } } }),
            Some("sp1"),
        );
        let region = Containment::Within {
            root: NodeId::new("sp1"),
            direction: Traversal::Descendants,
        };
        assert!(out.contains(&dep(Target::Any(region.clone()), "children")));
        assert!(out.contains(&dep(Target::Any(region), "id")));
    }

    #[test]
    fn inherit_watches_self_typed_ancestors_and_structure() {
        let out = deps(json!({ "$id": "te1", "title": { "$inherit": { "$type": ["sport"] } } }), Some("te1"));
        let region = Containment::Within {
            root: NodeId::new("te1"),
            direction: Traversal::Ancestors,
        };
        assert!(out.contains(&dep(node("te1"), "title")));
        assert!(out.contains(&dep(
            Target::Prefix {
                prefix: "sp".to_owned(),
                containment: region.clone(),
            },
            "title"
        )));
        assert!(out.contains(&dep(node("te1"), "parents")));
        assert!(out.contains(&dep(Target::Any(region), "parents")));
    }

    #[test]
    fn references_come_from_the_last_execution() {
        let schemas = Schemas::single(schema());
        let spec = GetSpec::parse(&json!({ "$id": "te1", "captain": { "name": true } }), &schemas).unwrap();
        let mut meta = ExecMeta {
            root: Some(NodeId::new("te1")),
            ..ExecMeta::default()
        };
        meta.refs
            .entry("default".to_owned())
            .or_default()
            .insert(NodeId::new("pe1"), BTreeSet::from(["name".to_owned()]));
        let out = collect(&spec, &schemas, &meta).unwrap();
        assert!(out.contains(&dep(node("te1"), "captain")));
        assert!(out.contains(&dep(node("pe1"), "name")));
    }

    #[test]
    fn all_at_the_top_level_watches_every_field() {
        let out = deps(json!({ "$id": "ma1", "$all": true }), Some("ma1"));
        assert!(out.contains(&dep(node("ma1"), ANY_FIELD)));
    }

    #[test]
    fn program_shape_tracks_type_constraints() {
        let schema = schema();
        let shape = |filter: serde_json::Value| {
            ProgramShape::of(&compile_filter(&Fork::from_json(&filter).unwrap(), &schema).unwrap())
        };
        let both = shape(json!({ "$field": "type", "$operator": "=", "$value": ["match", "team"] }));
        assert_eq!(both.prefixes, Some(BTreeSet::from(["ma".to_owned(), "te".to_owned()])));

        let narrowed = shape(json!([
            { "$field": "type", "$operator": "=", "$value": "match" },
            { "$field": "name", "$operator": "exists" }
        ]));
        assert_eq!(narrowed.prefixes, Some(BTreeSet::from(["ma".to_owned()])));
        assert_eq!(narrowed.fields, BTreeSet::from(["name".to_owned()]));

        let negated = shape(json!({ "$field": "type", "$operator": "!=", "$value": "match" }));
        assert_eq!(negated.prefixes, None);
    }
}
