// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-process storage engine for arbor.
//!
//! [`MemoryStore`] implements the [`arbor_query::Storage`] command protocol
//! over plain in-memory tables: a parent/child hierarchy rooted at `root`,
//! raw field values, aliases, hash tables, subscription markers and a
//! pub/sub fan-out. It also speaks the set/delete write language and emits
//! a [`arbor_query::ChangeNotification`] for every field it touches.
#![forbid(unsafe_code)]

mod error;
mod graph;
mod memory;
mod rpn;
mod write;

pub use error::StoreError;
pub use memory::{MemoryStore, Published, CHANNEL_CAPACITY};
