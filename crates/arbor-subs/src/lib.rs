// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! arbor-subs: live GetSpec subscriptions.
//!
//! [`SubscriptionManager`] owns every subscription of a process. Writes reach
//! it as [`arbor_query::ChangeNotification`]s, are resolved to subscriptions
//! through the [`index::SubscriptionIndex`], debounced by the
//! [`dispatcher::Dispatcher`] and re-executed; changed results are published
//! as [`envelope::Envelope`]s.
#![forbid(unsafe_code)]

pub mod config;
pub mod deps;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod index;
pub mod manager;
pub mod membership;

pub use config::ManagerConfig;
pub use dispatcher::DispatcherConfig;
pub use envelope::Envelope;
pub use error::SubscriptionError;
pub use manager::{spawn, Command, CoordinatorEvent, SubscriptionHandle, SubscriptionManager};
