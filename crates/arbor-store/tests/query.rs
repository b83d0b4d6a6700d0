// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]
//! End-to-end GetSpec execution against the in-memory store.

use arbor_query::exec::Subscribed;
use arbor_query::{
    execute, get, ExecError, GetSpec, Marker, Schema, Schemas, StorageError, StorageRegistrar,
    SubscriptionId,
};
use arbor_store::MemoryStore;
use serde_json::{json, Value};

fn schemas() -> Schemas {
    let schema: Schema = serde_json::from_value(json!({
        "languages": ["en", "de", "nl"],
        "types": {
            "league": {
                "prefix": "le",
                "fields": { "name": { "type": "string" } }
            },
            "sport": {
                "prefix": "sp",
                "fields": {
                    "title": { "type": "string" },
                    "name": { "type": "string" },
                    "theme": {
                        "type": "object",
                        "properties": {
                            "color": { "type": "string" },
                            "font": { "type": "string" }
                        }
                    },
                    "captain": { "type": "reference" }
                }
            },
            "team": {
                "prefix": "te",
                "fields": {
                    "title": { "type": "string" },
                    "name": { "type": "string" },
                    "theme": {
                        "type": "object",
                        "properties": {
                            "color": { "type": "string" },
                            "font": { "type": "string" }
                        }
                    },
                    "captain": { "type": "reference" }
                }
            },
            "match": {
                "prefix": "ma",
                "fields": {
                    "name": { "type": "string" },
                    "value": { "type": "number" },
                    "status": { "type": "int" },
                    "done": { "type": "boolean" },
                    "title": { "type": "text" },
                    "image": {
                        "type": "object",
                        "properties": {
                            "thumb": { "type": "string" },
                            "full": { "type": "string" }
                        }
                    }
                }
            },
            "person": {
                "prefix": "pe",
                "fields": { "name": { "type": "string" } }
            }
        }
    }))
    .unwrap();
    Schemas::single(schema)
}

async fn store() -> MemoryStore {
    let store = MemoryStore::new(schemas());
    for payload in [
        json!({ "$id": "le1", "name": "league" }),
        json!({ "$id": "sp1", "parents": ["le1"], "title": "ball",
                "theme": { "color": "red", "font": "serif" } }),
        json!({ "$id": "te1", "parents": ["sp1"], "name": "reds", "theme": { "color": "blue" } }),
        json!({ "$id": "pe1", "name": "kim" }),
        json!({ "$id": "ma1", "parents": ["te1"], "name": "final", "value": 5, "status": 2 }),
        json!({ "$id": "ma2", "parents": ["te1"], "name": "semi", "value": 3 }),
        json!({ "$id": "ma3", "parents": ["te1"], "name": "quarter", "value": 9 }),
    ] {
        store.set("default", &payload).await.unwrap();
    }
    store
}

async fn run(store: &MemoryStore, spec: Value) -> Value {
    let schemas = schemas();
    let spec = GetSpec::parse(&spec, &schemas).unwrap();
    get(store, &schemas, &spec).await.unwrap()
}

#[tokio::test]
async fn literal_reads_return_exactly_the_written_fields() {
    let store = store().await;
    let out = run(&store, json!({ "$id": "ma1", "name": true, "value": true, "status": true })).await;
    assert_eq!(out, json!({ "name": "final", "value": 5, "status": 2 }));

    store
        .set("default", &json!({ "$id": "ma1", "value": 6, "done": true }))
        .await
        .unwrap();
    let out = run(&store, json!({ "$id": "ma1", "value": true, "done": true, "id": true, "type": true })).await;
    assert_eq!(out, json!({ "value": 6, "done": true, "id": "ma1", "type": "match" }));
}

#[tokio::test]
async fn unknown_and_unset_fields_are_omitted() {
    let store = store().await;
    let out = run(&store, json!({ "$id": "ma2", "name": true, "status": true, "bogus": true })).await;
    assert_eq!(out, json!({ "name": "semi" }));
}

#[tokio::test]
async fn inherit_resolves_from_the_typed_ancestor() {
    let store = store().await;
    let out = run(
        &store,
        json!({ "$id": "te1", "title": { "$inherit": { "$type": ["sport"] } } }),
    )
    .await;
    assert_eq!(out, json!({ "title": "ball" }));
}

#[tokio::test]
async fn inherit_prefers_the_node_and_supports_merge() {
    let store = store().await;
    let out = run(&store, json!({ "$id": "ma1", "name": { "$inherit": true } })).await;
    assert_eq!(out, json!({ "name": "final" }));

    let out = run(
        &store,
        json!({ "$id": "ma1", "theme": { "$inherit": { "$type": ["team", "sport"], "$merge": true } } }),
    )
    .await;
    assert_eq!(out, json!({ "theme": { "color": "blue", "font": "serif" } }));
}

#[tokio::test]
async fn inherit_item_reads_the_whole_ancestor() {
    let store = store().await;
    let out = run(
        &store,
        json!({ "$id": "ma1", "league": { "$inherit": { "$item": ["league"] }, "name": true, "id": true } }),
    )
    .await;
    assert_eq!(out, json!({ "league": { "name": "league", "id": "le1" } }));
}

#[tokio::test]
async fn list_children_sorted_and_paged() {
    let store = store().await;
    let out = run(
        &store,
        json!({
            "$id": "te1",
            "children": {
                "$list": { "$sort": { "$field": "value", "$order": "desc" }, "$offset": 1, "$limit": 2 },
                "name": true
            }
        }),
    )
    .await;
    assert_eq!(out, json!({ "children": [{ "name": "final" }, { "name": "semi" }] }));
}

#[tokio::test]
async fn find_descendants_with_filter() {
    let store = store().await;
    let out = run(
        &store,
        json!({
            "$id": "le1",
            "matches": {
                "$list": {
                    "$find": {
                        "$traverse": "descendants",
                        "$filter": [
                            { "$field": "type", "$operator": "=", "$value": "match" },
                            { "$field": "value", "$operator": ">", "$value": 4 }
                        ]
                    },
                    "$sort": { "$field": "value" }
                },
                "id": true
            }
        }),
    )
    .await;
    assert_eq!(out, json!({ "matches": [{ "id": "ma1" }, { "id": "ma3" }] }));

    let out = run(
        &store,
        json!({
            "$id": "le1",
            "best": {
                "$find": {
                    "$traverse": "descendants",
                    "$filter": { "$field": "name", "$operator": "=", "$value": "semi" }
                },
                "value": true
            }
        }),
    )
    .await;
    assert_eq!(out, json!({ "best": { "value": 3 } }));
}

#[tokio::test]
async fn nested_find_runs_from_every_match() {
    let store = store().await;
    let out = run(
        &store,
        json!({
            "$id": "root",
            "names": {
                "$list": {
                    "$find": {
                        "$traverse": "descendants",
                        "$filter": { "$field": "type", "$operator": "=", "$value": "team" },
                        "$find": {
                            "$traverse": "children",
                            "$filter": { "$field": "value", "$operator": "<", "$value": 6 }
                        }
                    },
                    "$sort": { "$field": "name" }
                },
                "name": true
            }
        }),
    )
    .await;
    assert_eq!(out, json!({ "names": [{ "name": "final" }, { "name": "semi" }] }));
}

#[tokio::test]
async fn empty_selection_lists_ids() {
    let store = store().await;
    let out = run(&store, json!({ "$id": "sp1", "children": { "$list": true } })).await;
    assert_eq!(out, json!({ "children": ["te1"] }));
}

#[tokio::test]
async fn text_follows_the_requested_language() {
    let store = store().await;
    store
        .set("default", &json!({ "$id": "ma1", "$language": "de", "title": "Endspiel" }))
        .await
        .unwrap();
    let out = run(&store, json!({ "$id": "ma1", "$language": "nl", "title": true })).await;
    assert_eq!(out, json!({ "title": "Endspiel" }));
    let out = run(&store, json!({ "$id": "ma1", "title": true })).await;
    assert_eq!(out, json!({ "title": { "de": "Endspiel" } }));
}

#[tokio::test]
async fn field_fallbacks_defaults_and_values() {
    let store = store().await;
    let out = run(
        &store,
        json!({
            "$id": "ma2",
            "label": { "$field": ["status", "name"] },
            "status": { "$default": 0 },
            "kind": { "$value": "fixture" }
        }),
    )
    .await;
    assert_eq!(out, json!({ "label": "semi", "status": 0, "kind": "fixture" }));
}

#[tokio::test]
async fn references_and_nested_ids_read_other_nodes() {
    let store = store().await;
    store
        .set("default", &json!({ "$id": "te1", "captain": "pe1" }))
        .await
        .unwrap();
    let out = run(
        &store,
        json!({
            "$id": "te1",
            "captain": { "name": true },
            "sport": { "$id": "sp1", "theme": { "color": true } }
        }),
    )
    .await;
    assert_eq!(
        out,
        json!({ "captain": { "name": "kim" }, "sport": { "theme": { "color": "red" } } })
    );
}

#[tokio::test]
async fn unresolved_roots_are_null_and_waited_for() {
    let store = store().await;
    let schemas = schemas();
    let spec = GetSpec::parse(&json!({ "$id": "ma9", "$alias": "later", "name": true }), &schemas).unwrap();
    assert_eq!(get(&store, &schemas, &spec).await.unwrap(), json!({ "$isNull": true }));

    let sub = SubscriptionId::new("s1");
    let mut registrar = StorageRegistrar::new(&store);
    let subscribed = Subscribed {
        id: sub.clone(),
        registrar: &mut registrar,
    };
    let out = execute(&store, &schemas, &spec, Some(subscribed)).await.unwrap();
    assert_eq!(out.value, json!({ "$isNull": true }));
    assert_eq!(store.waiting_for("default", "ma9").await, vec![sub.clone()]);
    assert_eq!(store.waiting_for("default", "later").await, vec![sub]);
}

#[tokio::test]
async fn aliases_resolve_the_root() {
    let store = store().await;
    store
        .set("default", &json!({ "$id": "sp1", "$alias": "main" }))
        .await
        .unwrap();
    let out = run(&store, json!({ "$alias": ["missing", "main"], "name": { "$default": "none" } })).await;
    assert_eq!(out, json!({ "name": "none" }));
}

#[tokio::test]
async fn subscribed_execution_registers_markers() {
    let store = store().await;
    let schemas = schemas();
    let spec = GetSpec::parse(
        &json!({
            "$id": "te1",
            "name": true,
            "children": { "$list": true, "value": true }
        }),
        &schemas,
    )
    .unwrap();
    let sub = SubscriptionId::new("s1");
    let mut registrar = StorageRegistrar::new(&store);
    let out = execute(
        &store,
        &schemas,
        &spec,
        Some(Subscribed {
            id: sub.clone(),
            registrar: &mut registrar,
        }),
    )
    .await
    .unwrap();
    assert!(out.meta.has_find_markers);
    assert_eq!(out.meta.matched.len(), 3);

    let markers = store.markers("default", &sub).await;
    assert!(markers
        .iter()
        .any(|m: &Marker| m.traversal.is_none() && m.fields.contains("name")));
    assert!(markers
        .iter()
        .any(|m| m.traversal.is_some() && m.fields.contains("value")));
}

#[tokio::test]
async fn include_meta_attaches_execution_facts() {
    let store = store().await;
    let out = run(&store, json!({ "$id": "ma1", "$includeMeta": true, "name": true })).await;
    assert_eq!(out["name"], json!("final"));
    assert_eq!(out["$meta"]["default"]["root"], json!("ma1"));
}

#[tokio::test]
async fn storage_failures_abort_the_query() {
    let store = store().await;
    let schemas = schemas();
    let spec = GetSpec::parse(&json!({ "$id": "ma1", "name": true }), &schemas).unwrap();
    store.set_available(false);
    let err = get(&store, &schemas, &spec).await.unwrap_err();
    assert!(matches!(err, ExecError::Storage(StorageError::Unavailable(_))));
}

#[tokio::test]
async fn deleted_nodes_read_as_null() {
    let store = store().await;
    let removed = store.delete("default", &"te1".into()).await.unwrap();
    assert_eq!(removed.len(), 4);
    let out = run(&store, json!({ "$id": "ma1", "name": true })).await;
    assert_eq!(out, json!({ "$isNull": true }));
}
