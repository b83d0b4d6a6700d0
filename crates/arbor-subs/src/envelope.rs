// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Messages published to subscribers.
use arbor_query::SubscriptionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Channel every manager publishes its liveness heartbeat on.
pub const HEARTBEAT_CHANNEL: &str = "subscriptions:heartbeat";

/// Pub/sub channel of one subscription.
pub fn channel(id: &SubscriptionId) -> String {
    format!("subscription:{id}")
}

/// Envelope published on a subscription channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// New result tree.
    Update {
        /// Result, without `$meta`.
        payload: Value,
    },
    /// The root node was removed; no further messages follow.
    Delete,
    /// The subscription is still served.
    Heartbeat,
}

impl Envelope {
    /// Wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    #[test]
    fn envelopes_are_tagged_by_type() {
        let update = Envelope::Update {
            payload: json!({ "value": 5 }),
        };
        let wire: Value = serde_json::from_str(&update.to_json().unwrap()).unwrap();
        assert_eq!(wire, json!({ "type": "update", "payload": { "value": 5 } }));
        assert_eq!(Envelope::Delete.to_json().unwrap(), r#"{"type":"delete"}"#);
        assert_eq!(Envelope::Heartbeat.to_json().unwrap(), r#"{"type":"heartbeat"}"#);
        assert_eq!(channel(&SubscriptionId::new("ab12")), "subscription:ab12");
    }
}
