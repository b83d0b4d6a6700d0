// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! arbor-query: GetSpec compilation and execution over a hierarchical store.
//!
//! A GetSpec is parsed into closed types ([`getspec`]), compiled one object
//! level at a time into [`operation::Operation`]s, and executed against any
//! [`storage::Storage`] implementation. Filters compile to postfix programs
//! ([`filter`]) the storage engine evaluates during traversals. Executions
//! running under a subscription report their dependencies as
//! [`marker::Marker`]s.
#![forbid(unsafe_code)]

pub mod cast;
pub mod error;
pub mod exec;
pub mod filter;
pub mod getspec;
pub mod hash;
pub mod ident;
pub mod marker;
pub mod operation;
pub mod schema;
pub mod storage;

pub use error::{CompileError, ExecError};
pub use exec::{execute, get, ExecMeta, Output, Subscribed};
pub use filter::{compile as compile_filter, FilterProgram, Fork};
pub use getspec::GetSpec;
pub use hash::{content_hash, ContentHash};
pub use ident::{NodeId, SubscriptionId};
pub use marker::{Marker, MarkerRegistrar, StorageRegistrar};
pub use schema::{Schema, Schemas};
pub use storage::{ChangeKind, ChangeNotification, Storage, StorageError};
