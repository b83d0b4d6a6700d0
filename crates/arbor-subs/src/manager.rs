// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Subscription manager: the one task that owns every live subscription.
//!
//! Change notifications are resolved through the [`SubscriptionIndex`] and
//! staged; the [`Dispatcher`] decides when staged subscriptions are
//! re-executed. A subscription publishes only when the hash of its result
//! changed. Client commands and coordinator events reach the task over
//! bounded channels; nothing else touches its state.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arbor_query::filter::{FilterValue, Operator};
use arbor_query::schema::is_hierarchy_field;
use arbor_query::storage::{ChangeKind, FindQuery, FindReply};
use arbor_query::{
    compile_filter, content_hash, execute, ChangeNotification, CompileError, ContentHash, Fork, GetSpec,
    ExecMeta, NodeId, Schemas, Storage, StorageRegistrar, Subscribed, SubscriptionId,
};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::ManagerConfig;
use crate::deps::{self, Containment, Dependency};
use crate::dispatcher::{Decision, Dispatcher};
use crate::envelope::{self, Envelope, HEARTBEAT_CHANNEL};
use crate::error::SubscriptionError;
use crate::index::SubscriptionIndex;
use crate::membership::MembershipCache;

/// Hash table holding persisted subscription definitions, per database.
pub const SUBSCRIPTIONS_KEY: &str = "___subscriptions";
/// Field of [`SUBSCRIPTIONS_KEY`] bumped whenever the table changes.
pub const LAST_EDITED_FIELD: &str = "___lastEdited";
/// Bookkeeping fields of the table start with this and are not definitions.
const RESERVED_PREFIX: &str = "___";
/// Hash table of per-subscription heartbeat counters, per database. Every
/// process holding a subscription watches its counter; a counter that stops
/// moving means no client is left anywhere.
pub const HEARTBEATS_KEY: &str = "___heartbeats";

/// Capacity of the command channel.
pub const COMMAND_CAPACITY: usize = 256;
/// Capacity of the coordinator event channel.
pub const EVENT_CAPACITY: usize = 16;

/// Request from a client.
#[derive(Debug)]
pub enum Command {
    /// Start (or join) the subscription for a GetSpec.
    Subscribe {
        /// JSON GetSpec.
        definition: Value,
        /// Receives the subscription id.
        reply: oneshot::Sender<Result<SubscriptionId, SubscriptionError>>,
    },
    /// Drop a subscription.
    Unsubscribe {
        /// Subscription.
        id: SubscriptionId,
    },
    /// The client of a subscription is still alive.
    Heartbeat {
        /// Subscription.
        id: SubscriptionId,
    },
}

/// Connection state reported by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// Storage reachable again; every subscription is recalculated.
    Connected,
    /// Storage unreachable; staged work is held.
    Disconnected,
    /// The set of storage servers changed; markers are re-applied.
    ServersUpdated,
}

#[derive(Debug)]
struct Subscription {
    spec: GetSpec,
    root: Option<NodeId>,
    deps: BTreeSet<Dependency>,
    last_hash: Option<ContentHash>,
    in_progress: bool,
    has_find_markers: bool,
    last_seen: Instant,
    // Last shared heartbeat counter observed.
    beat: Option<u64>,
    // A local client heartbeat not yet written to the shared counter.
    beat_pending: bool,
}

impl Subscription {
    fn new(spec: GetSpec) -> Self {
        Self {
            spec,
            root: None,
            deps: BTreeSet::new(),
            last_hash: None,
            in_progress: false,
            has_find_markers: false,
            last_seen: Instant::now(),
            beat: None,
            beat_pending: false,
        }
    }

    fn seen(&mut self) {
        self.last_seen = Instant::now();
        self.beat_pending = true;
    }
}

/// Id of the subscription for `definition`: hex blake3 of its canonical form.
pub fn subscription_id(definition: &Value) -> Result<SubscriptionId, SubscriptionError> {
    Ok(SubscriptionId::new(content_hash(definition)?.to_hex()))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Owner of the subscription index, staged set and hash cache.
pub struct SubscriptionManager {
    storage: Arc<dyn Storage>,
    schemas: Arc<Schemas>,
    config: ManagerConfig,
    subs: BTreeMap<SubscriptionId, Subscription>,
    index: SubscriptionIndex,
    membership: MembershipCache,
    dispatcher: Dispatcher,
    staged: BTreeSet<SubscriptionId>,
    connected: bool,
    last_refresh: u64,
}

impl SubscriptionManager {
    /// Manager over `storage` with no subscriptions.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, schemas: Arc<Schemas>, config: ManagerConfig) -> Self {
        Self {
            storage,
            schemas,
            index: SubscriptionIndex::new(config.cache_cap),
            membership: MembershipCache::new(config.cache_cap),
            dispatcher: Dispatcher::new(config.dispatcher),
            config,
            subs: BTreeMap::new(),
            staged: BTreeSet::new(),
            connected: true,
            last_refresh: 0,
        }
    }

    /// Live subscription ids.
    pub fn subscriptions(&self) -> impl Iterator<Item = &SubscriptionId> {
        self.subs.keys()
    }

    /// Subscriptions waiting for the next drain.
    pub fn staged(&self) -> &BTreeSet<SubscriptionId> {
        &self.staged
    }

    /// Hash of the last published result of `id`.
    pub fn last_hash(&self, id: &SubscriptionId) -> Option<ContentHash> {
        self.subs.get(id).and_then(|s| s.last_hash)
    }

    /// The dependency index.
    pub fn index(&self) -> &SubscriptionIndex {
        &self.index
    }

    /// The debounce state machine.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Starts the subscription for `definition`, or refreshes the heartbeat
    /// of the existing one. A new subscription is persisted and its first
    /// result published right away.
    #[instrument(skip_all)]
    pub async fn subscribe(&mut self, definition: Value) -> Result<SubscriptionId, SubscriptionError> {
        let spec = GetSpec::parse(&definition, &self.schemas)?;
        let id = subscription_id(&definition)?;
        if let Some(sub) = self.subs.get_mut(&id) {
            sub.seen();
            return Ok(id);
        }
        let text = serde_json::to_string(&definition)?;
        self.storage
            .hset(&spec.db, SUBSCRIPTIONS_KEY, id.as_str(), &text)
            .await?;
        self.touch(&spec.db).await?;
        self.subs.insert(id.clone(), Subscription::new(spec));
        self.beat(&id).await?;
        info!(%id, "subscription added");
        self.refresh(&id).await?;
        Ok(id)
    }

    /// Drops `id`. Returns `false` when it was not live.
    pub async fn unsubscribe(&mut self, id: &SubscriptionId) -> Result<bool, SubscriptionError> {
        let existed = self.subs.contains_key(id);
        if existed {
            self.forget(id).await?;
            info!(%id, "subscription removed");
        }
        Ok(existed)
    }

    /// Records a client heartbeat. Returns `false` for unknown ids. The
    /// shared counter is bumped on the next [`Self::heartbeat_tick`].
    pub fn heartbeat(&mut self, id: &SubscriptionId) -> bool {
        match self.subs.get_mut(id) {
            Some(sub) => {
                sub.seen();
                true
            }
            None => false,
        }
    }

    // Bumps the shared heartbeat counter of `id`.
    async fn beat(&mut self, id: &SubscriptionId) -> Result<(), SubscriptionError> {
        let Some(db) = self.subs.get(id).map(|s| s.spec.db.clone()) else {
            return Ok(());
        };
        let previous = self
            .storage
            .hget(&db, HEARTBEATS_KEY, id.as_str())
            .await?
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let next = previous.wrapping_add(1);
        self.storage
            .hset(&db, HEARTBEATS_KEY, id.as_str(), &next.to_string())
            .await?;
        if let Some(sub) = self.subs.get_mut(id) {
            sub.beat = Some(next);
            sub.beat_pending = false;
        }
        Ok(())
    }

    // Counters written by other processes count as client activity.
    async fn observe_beats(&mut self) -> Result<(), SubscriptionError> {
        let now = Instant::now();
        let dbs: Vec<String> = self.schemas.databases().map(str::to_owned).collect();
        for db in &dbs {
            let counters = self.storage.hgetall(db, HEARTBEATS_KEY).await?;
            for (field, text) in counters {
                let Ok(counter) = text.parse::<u64>() else {
                    continue;
                };
                let Some(sub) = self.subs.get_mut(&SubscriptionId::new(field)) else {
                    continue;
                };
                if sub.spec.db == *db && sub.beat != Some(counter) {
                    sub.beat = Some(counter);
                    sub.last_seen = now;
                }
            }
        }
        Ok(())
    }

    // Markers and missing-key registrations may live in any database the
    // subscription reached.
    async fn clear_markers(&self, id: &SubscriptionId) -> Result<(), SubscriptionError> {
        for db in self.schemas.databases() {
            self.storage.remove_markers(db, id).await?;
        }
        Ok(())
    }

    // Stamps only move forward, so two edits in one millisecond stay ordered.
    async fn touch(&mut self, db: &str) -> Result<(), SubscriptionError> {
        let previous = self
            .storage
            .hget(db, SUBSCRIPTIONS_KEY, LAST_EDITED_FIELD)
            .await?
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let stamp = now_millis().max(previous.saturating_add(1));
        self.storage
            .hset(db, SUBSCRIPTIONS_KEY, LAST_EDITED_FIELD, &stamp.to_string())
            .await?;
        self.last_refresh = self.last_refresh.max(stamp);
        Ok(())
    }

    async fn forget(&mut self, id: &SubscriptionId) -> Result<(), SubscriptionError> {
        self.index.remove(id);
        self.staged.remove(id);
        if let Some(sub) = self.subs.remove(id) {
            self.clear_markers(id).await?;
            self.storage
                .hdel(&sub.spec.db, SUBSCRIPTIONS_KEY, id.as_str())
                .await?;
            self.storage.hdel(&sub.spec.db, HEARTBEATS_KEY, id.as_str()).await?;
            self.touch(&sub.spec.db).await?;
        }
        Ok(())
    }

    /// Resolves one change notification and stages what it affects.
    pub async fn handle_change(&mut self, change: &ChangeNotification) -> Result<(), SubscriptionError> {
        self.dispatcher.record(1);
        let (node, path) = change.split();
        if change.kind == ChangeKind::Deleted {
            self.membership.clear();
            self.root_deleted(&change.db, &node).await?;
            let hits = self.index.resolve_node(&change.db, &node);
            for sub in hits.direct.iter().chain(hits.candidates.iter().map(|(sub, _)| sub)) {
                self.stage(sub);
            }
            return Ok(());
        }
        if path.first().is_some_and(|field| is_hierarchy_field(field)) {
            self.membership.clear();
        }
        let hits = self.index.resolve(&change.db, &node, &path);
        let mut affected = hits.direct;
        for (sub, containment) in hits.candidates {
            if affected.contains(&sub) {
                continue;
            }
            if self.is_member(&change.db, &node, &containment).await? {
                affected.insert(sub);
            }
        }
        for sub in &affected {
            self.stage(sub);
        }
        Ok(())
    }

    async fn is_member(
        &mut self,
        db: &str,
        node: &NodeId,
        containment: &Containment,
    ) -> Result<bool, SubscriptionError> {
        let Containment::Within { root, direction } = containment else {
            return Ok(true);
        };
        if let Some(member) = self.membership.get(db, node, containment) {
            return Ok(member);
        }
        let schema = self
            .schemas
            .get(db)
            .ok_or_else(|| CompileError::UnknownDatabase(db.to_owned()))?;
        let program = compile_filter(
            &Fork::leaf("id", Operator::Eq, FilterValue::Str(node.to_string())),
            schema,
        )?;
        let query = FindQuery {
            filter: Some(program),
            limit: Some(1),
            ..FindQuery::ids(direction.clone(), root.clone())
        };
        let member = match self.storage.find(db, &query).await? {
            FindReply::Ids { ids, .. } => !ids.is_empty(),
            FindReply::Merged(map) => !map.is_empty(),
        };
        self.membership.insert(db, node, containment, member);
        Ok(member)
    }

    // At most one pending refresh per subscription.
    fn stage(&mut self, id: &SubscriptionId) {
        let Some(sub) = self.subs.get_mut(id) else {
            return;
        };
        if sub.in_progress {
            return;
        }
        sub.in_progress = true;
        self.staged.insert(id.clone());
        self.dispatcher.stage(Instant::now());
    }

    /// Stages every subscription.
    pub fn recalculate_all(&mut self) {
        let ids: Vec<SubscriptionId> = self.subs.keys().cloned().collect();
        for id in &ids {
            self.stage(id);
        }
        if !self.staged.is_empty() {
            self.dispatcher.stage(Instant::now());
        }
    }

    async fn root_deleted(&mut self, db: &str, node: &NodeId) -> Result<(), SubscriptionError> {
        let doomed: Vec<SubscriptionId> = self
            .subs
            .iter()
            .filter(|(_, s)| s.spec.db == db && s.root.as_ref() == Some(node))
            .map(|(id, _)| id.clone())
            .collect();
        let message = Envelope::Delete.to_json()?;
        for id in doomed {
            self.storage.publish(&envelope::channel(&id), &message).await?;
            self.forget(&id).await?;
            info!(%id, %node, "subscription root deleted");
        }
        Ok(())
    }

    /// Re-executes every staged subscription. Returns how many published.
    ///
    /// A failing subscription is logged and left unstaged so that its next
    /// triggering write retries it.
    pub async fn drain(&mut self) -> usize {
        let staged = std::mem::take(&mut self.staged);
        let mut published = 0;
        for id in staged {
            let Some(sub) = self.subs.get_mut(&id) else {
                continue;
            };
            sub.in_progress = false;
            match self.refresh(&id).await {
                Ok(true) => published += 1,
                Ok(false) => {}
                Err(err) => warn!(%id, error = %err, "subscription refresh failed"),
            }
        }
        self.dispatcher.finish();
        published
    }

    /// Executes `id`, re-indexes its dependencies and publishes when the
    /// result hash changed. Returns whether it published.
    pub async fn refresh(&mut self, id: &SubscriptionId) -> Result<bool, SubscriptionError> {
        let spec = match self.subs.get(id) {
            Some(sub) => sub.spec.clone(),
            None => return Err(SubscriptionError::Unknown(id.clone())),
        };
        self.clear_markers(id).await?;
        let output = {
            let mut registrar = StorageRegistrar::new(self.storage.as_ref());
            let subscribed = Subscribed {
                id: id.clone(),
                registrar: &mut registrar,
            };
            execute(self.storage.as_ref(), &self.schemas, &spec, Some(subscribed)).await?
        };
        let deps = deps::collect(&spec, &self.schemas, &output.meta)?;
        let hash = content_hash(&output.value)?;
        self.index.insert(id, deps.clone());
        let Some(sub) = self.subs.get_mut(id) else {
            return Ok(false);
        };
        sub.root.clone_from(&output.meta.root);
        sub.deps = deps;
        sub.has_find_markers |= output.meta.has_find_markers;
        if sub.last_hash == Some(hash) {
            return Ok(false);
        }
        sub.last_hash = Some(hash);
        let message = Envelope::Update {
            payload: output.value,
        }
        .to_json()?;
        self.storage.publish(&envelope::channel(id), &message).await?;
        debug!(%id, hash = %hash, "subscription update published");
        Ok(true)
    }

    /// Writes pending client heartbeats to the shared counters, publishes
    /// heartbeats and evicts subscriptions whose counter stopped moving.
    pub async fn heartbeat_tick(&mut self) -> Result<(), SubscriptionError> {
        let pending: Vec<SubscriptionId> = self
            .subs
            .iter()
            .filter(|(_, s)| s.beat_pending)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &pending {
            self.beat(id).await?;
        }
        self.observe_beats().await?;
        let now = Instant::now();
        let expired: Vec<SubscriptionId> = self
            .subs
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_seen) > self.config.eviction_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.forget(&id).await?;
            info!(%id, "subscription evicted after missed heartbeats");
        }
        let beat = json!({ "ts": now_millis(), "subscriptions": self.subs.len() }).to_string();
        self.storage.publish(HEARTBEAT_CHANNEL, &beat).await?;
        let message = Envelope::Heartbeat.to_json()?;
        for id in self.subs.keys() {
            self.storage.publish(&envelope::channel(id), &message).await?;
        }
        Ok(())
    }

    /// Runs [`Self::full_refresh`] when any database's table was edited after
    /// the last one. Returns whether it ran.
    pub async fn refresh_if_edited(&mut self) -> Result<bool, SubscriptionError> {
        let dbs: Vec<String> = self.schemas.databases().map(str::to_owned).collect();
        for db in &dbs {
            let edited = self
                .storage
                .hget(db, SUBSCRIPTIONS_KEY, LAST_EDITED_FIELD)
                .await?
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            if edited > self.last_refresh {
                self.full_refresh().await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Reloads every persisted definition and rebuilds the index from
    /// scratch. Subscriptions missing from the table are dropped; new ones
    /// are staged for their first execution.
    #[instrument(skip_all)]
    pub async fn full_refresh(&mut self) -> Result<(), SubscriptionError> {
        let mut persisted: BTreeMap<SubscriptionId, Value> = BTreeMap::new();
        let mut newest = self.last_refresh;
        let dbs: Vec<String> = self.schemas.databases().map(str::to_owned).collect();
        for db in &dbs {
            for (field, text) in self.storage.hgetall(db, SUBSCRIPTIONS_KEY).await? {
                if field == LAST_EDITED_FIELD {
                    newest = newest.max(text.parse().unwrap_or(0));
                    continue;
                }
                if field.starts_with(RESERVED_PREFIX) {
                    continue;
                }
                let id = SubscriptionId::new(field);
                match serde_json::from_str::<Value>(&text) {
                    Ok(definition) => {
                        persisted.insert(id, definition);
                    }
                    Err(err) => warn!(
                        error = %SubscriptionError::Decode { id, reason: err.to_string() },
                        "persisted subscription skipped"
                    ),
                }
            }
        }

        let gone: Vec<SubscriptionId> = self
            .subs
            .keys()
            .filter(|id| !persisted.contains_key(*id))
            .cloned()
            .collect();
        for id in &gone {
            self.subs.remove(id);
            self.staged.remove(id);
        }
        let mut added = Vec::new();
        for (id, definition) in persisted {
            if self.subs.contains_key(&id) {
                continue;
            }
            let parsed = GetSpec::parse(&definition, &self.schemas).and_then(|spec| {
                // Root not resolved yet; the first refresh completes the set.
                let meta = ExecMeta {
                    root: spec.root.ids.first().cloned(),
                    ..ExecMeta::default()
                };
                let deps = deps::collect(&spec, &self.schemas, &meta)?;
                Ok((spec, deps))
            });
            match parsed {
                Ok((spec, deps)) => {
                    let mut sub = Subscription::new(spec);
                    sub.deps = deps;
                    self.subs.insert(id.clone(), sub);
                    added.push(id);
                }
                Err(err) => warn!(
                    error = %SubscriptionError::Decode { id, reason: err.to_string() },
                    "persisted subscription skipped"
                ),
            }
        }

        self.index
            .rebuild(self.subs.iter().map(|(id, s)| (id.clone(), s.deps.clone())));
        self.membership.clear();
        for id in &added {
            self.stage(id);
        }
        self.last_refresh = newest;
        info!(
            subscriptions = self.subs.len(),
            added = added.len(),
            dropped = gone.len(),
            "full refresh complete"
        );
        Ok(())
    }

    /// Applies a coordinator event.
    pub async fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Connected => {
                info!("storage connected; recalculating all subscriptions");
                self.connected = true;
                self.recalculate_all();
            }
            CoordinatorEvent::Disconnected => {
                warn!(staged = self.staged.len(), "storage disconnected; holding staged updates");
                self.connected = false;
            }
            CoordinatorEvent::ServersUpdated => {
                let marked: Vec<(String, SubscriptionId)> = self
                    .subs
                    .iter()
                    .filter(|(_, s)| s.has_find_markers)
                    .map(|(id, s)| (s.spec.db.clone(), id.clone()))
                    .collect();
                info!(subscriptions = marked.len(), "servers updated; refreshing markers");
                for (db, id) in marked {
                    if let Err(err) = self.storage.refresh_markers(&db, &id).await {
                        warn!(%id, error = %err, "marker refresh failed");
                    }
                    self.stage(&id);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { definition, reply } => {
                let result = self.subscribe(definition).await;
                if let Err(err) = &result {
                    warn!(error = %err, "subscribe failed");
                }
                let _ = reply.send(result);
            }
            Command::Unsubscribe { id } => {
                if let Err(err) = self.unsubscribe(&id).await {
                    warn!(%id, error = %err, "unsubscribe failed");
                }
            }
            Command::Heartbeat { id } => {
                if !self.heartbeat(&id) {
                    debug!(%id, "heartbeat for unknown subscription");
                }
            }
        }
    }

    async fn on_deadline(&mut self) {
        match self.dispatcher.poll(Instant::now()) {
            Decision::Wait(_) => {}
            Decision::Drain if self.connected => {
                let published = self.drain().await;
                debug!(published, "staged subscriptions drained");
            }
            Decision::Drain => {
                self.dispatcher.finish();
                debug!(staged = self.staged.len(), "drain deferred while disconnected");
            }
        }
    }

    /// Event loop. Ends when the change stream or the command channel closes.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<CoordinatorEvent>,
        mut changes: broadcast::Receiver<ChangeNotification>,
    ) {
        let heartbeat_period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let refresh_period = self.config.refresh_interval.max(Duration::from_millis(1));
        let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = interval_at(Instant::now() + refresh_period, refresh_period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            let deadline = self.dispatcher.deadline();
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(change) => {
                        if let Err(err) = self.handle_change(&change).await {
                            warn!(channel = %change.channel, error = %err, "change resolution failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "change stream lagged; recalculating all subscriptions");
                        self.recalculate_all();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("change stream closed");
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        info!("command channel closed");
                        break;
                    }
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => events_open = false,
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_deadline().await;
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = self.heartbeat_tick().await {
                        warn!(error = %err, "heartbeat failed");
                    }
                    if let Err(err) = self.refresh_if_edited().await {
                        warn!(error = %err, "subscription table check failed");
                    }
                }
                _ = refresh.tick() => {
                    if let Err(err) = self.full_refresh().await {
                        warn!(error = %err, "full refresh failed");
                    }
                }
            }
        }
    }
}

/// Client side of a running manager.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    commands: mpsc::Sender<Command>,
    events: mpsc::Sender<CoordinatorEvent>,
}

impl SubscriptionHandle {
    /// Subscribes to `definition` and returns the subscription id.
    pub async fn subscribe(&self, definition: Value) -> Result<SubscriptionId, SubscriptionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { definition, reply })
            .await
            .map_err(|_| SubscriptionError::Closed)?;
        rx.await.map_err(|_| SubscriptionError::Closed)?
    }

    /// Drops a subscription.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SubscriptionError> {
        self.commands
            .send(Command::Unsubscribe { id })
            .await
            .map_err(|_| SubscriptionError::Closed)
    }

    /// Reports the client of `id` alive.
    pub async fn heartbeat(&self, id: SubscriptionId) -> Result<(), SubscriptionError> {
        self.commands
            .send(Command::Heartbeat { id })
            .await
            .map_err(|_| SubscriptionError::Closed)
    }

    /// Forwards a coordinator event.
    pub async fn notify(&self, event: CoordinatorEvent) -> Result<(), SubscriptionError> {
        self.events.send(event).await.map_err(|_| SubscriptionError::Closed)
    }
}

/// Spawns `manager` on the current runtime.
pub fn spawn(
    manager: SubscriptionManager,
    changes: broadcast::Receiver<ChangeNotification>,
) -> (SubscriptionHandle, JoinHandle<()>) {
    let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (events, event_rx) = mpsc::channel(EVENT_CAPACITY);
    let task = tokio::spawn(manager.run(command_rx, event_rx, changes));
    (SubscriptionHandle { commands, events }, task)
}
