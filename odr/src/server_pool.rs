use core::{cmp::Reverse, fmt::Display, pin::pin, time::Duration};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::SystemTime,
};

use anyhow::Result;
use database::Database;
use futures::{channel::mpsc::UnboundedSender, Stream, StreamExt as _};
use itertools::Itertools as _;
use log::{log, Level};
use parking_lot::Mutex;
use prometheus_metrics::Metrics;
use rand::seq::SliceRandom as _;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    messages::OdrToNetwork,
    misc::{DialFailure, DiscoveredServer, NodeAddress, PeerId, Topic, UnixSeconds},
    odr_config::OdrConfig,
    score::{Outcome, Score},
};

const KEY_PREFIX: &[u8] = b"server_pool/";

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub enum DialState {
    Unknown,
    Dialing { started_at: UnixSeconds },
    Connected,
    FailedBackoff { retry_at: UnixSeconds },
}

/// Quality record of a known server. Survives across connections and restarts.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct ServerPoolEntry {
    pub node: NodeAddress,
    pub topic: Topic,
    pub score: Score,
    pub dial_state: DialState,
    pub last_seen: UnixSeconds,
    pub consecutive_failures: u32,
    pub dial_attempts: u64,
}

impl ServerPoolEntry {
    fn new(topic: Topic, node: NodeAddress, now: UnixSeconds) -> Self {
        Self {
            node,
            topic,
            score: Score::default(),
            dial_state: DialState::Unknown,
            last_seen: now,
            consecutive_failures: 0,
            dial_attempts: 0,
        }
    }

    #[must_use]
    pub const fn peer_id(&self) -> PeerId {
        self.node.peer_id
    }

    #[must_use]
    pub const fn is_dial_candidate(&self, now: UnixSeconds) -> bool {
        match self.dial_state {
            DialState::Unknown => true,
            DialState::FailedBackoff { retry_at } => retry_at <= now,
            DialState::Dialing { .. } | DialState::Connected => false,
        }
    }

    const fn is_active(&self) -> bool {
        matches!(
            self.dial_state,
            DialState::Dialing { .. } | DialState::Connected,
        )
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<PeerId, ServerPoolEntry>,
    // Entries changed or removed since the last flush.
    dirty: HashSet<PeerId>,
    removed: HashSet<PeerId>,
}

impl PoolState {
    fn touch(&mut self, peer_id: PeerId) -> Option<&mut ServerPoolEntry> {
        let entry = self.entries.get_mut(&peer_id)?;
        self.dirty.insert(peer_id);
        Some(entry)
    }
}

/// Known servers ranked by a persisted quality score.
pub struct ServerPool {
    config: OdrConfig,
    database: Arc<Database>,
    state: Mutex<PoolState>,
    generation: watch::Sender<u64>,
    shutdown: CancellationToken,
    metrics: Option<Arc<Metrics>>,
}

impl ServerPool {
    /// Loads previously persisted entries from `database`.
    ///
    /// Servers that were dialing or connected when the entries were stored become plain
    /// candidates again.
    pub fn new(
        config: OdrConfig,
        database: Arc<Database>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        let mut entries = HashMap::new();

        for result in database.iterator_prefix(KEY_PREFIX)? {
            let (_, bytes) = result?;
            let mut entry = bincode::deserialize::<ServerPoolEntry>(&bytes)?;

            if entry.is_active() {
                entry.dial_state = DialState::Unknown;
            }

            entries.insert(entry.peer_id(), entry);
        }

        let pool = Self {
            config,
            database,
            state: Mutex::new(PoolState {
                entries,
                ..PoolState::default()
            }),
            generation: watch::Sender::new(0),
            shutdown: CancellationToken::new(),
            metrics,
        };

        pool.log(
            Level::Info,
            format_args!("loaded {} known servers", pool.len()),
        );

        pool.update_entry_count();

        Ok(pool)
    }

    /// Returns up to `dial_batch_size` servers for `topic` to dial next and marks them as dialing.
    ///
    /// Known servers are taken in score order, but a share of the batch is reserved for servers
    /// that have never been dialed.
    pub fn suggest_peers(&self, topic: &Topic) -> Vec<NodeAddress> {
        self.suggest_peers_at(topic, unix_now())
    }

    pub fn suggest_peers_at(&self, topic: &Topic, now: UnixSeconds) -> Vec<NodeAddress> {
        let batch_size = self.config.dial_batch_size;

        let exploration_slots = match self.config.exploration_interval {
            0 => 0,
            interval => batch_size.div_ceil(interval),
        };

        let mut state = self.state.lock();

        let (mut fresh, known): (Vec<_>, Vec<_>) = state
            .entries
            .values()
            .filter(|entry| entry.topic == *topic && entry.is_dial_candidate(now))
            .partition(|entry| entry.dial_attempts == 0);

        fresh.shuffle(&mut rand::thread_rng());

        let known = known.into_iter().sorted_by_key(|entry| {
            (Reverse(entry.score), Reverse(entry.last_seen), entry.peer_id())
        });

        let mut fresh = fresh.into_iter();
        let mut chosen = fresh.by_ref().take(exploration_slots).collect_vec();
        let known_slots = batch_size.saturating_sub(chosen.len());

        chosen.extend(known.take(known_slots));

        let remaining_slots = batch_size.saturating_sub(chosen.len());

        chosen.extend(fresh.take(remaining_slots));

        let chosen = chosen.into_iter().map(ServerPoolEntry::peer_id).collect_vec();

        chosen
            .into_iter()
            .filter_map(|peer_id| {
                let entry = state.touch(peer_id)?;
                entry.dial_state = DialState::Dialing { started_at: now };
                entry.dial_attempts += 1;
                Some(entry.node)
            })
            .collect()
    }

    pub fn mark_connected(&self, peer_id: PeerId) -> bool {
        let connected = self
            .state
            .lock()
            .touch(peer_id)
            .map(|entry| {
                entry.dial_state = DialState::Connected;
                entry.consecutive_failures = 0;
                entry.last_seen = unix_now();
            })
            .is_some();

        if connected {
            self.register_dial("connected");
            self.notify();
        }

        connected
    }

    /// Records a failed connection attempt and returns the backoff before the next dial.
    pub fn mark_failed(&self, peer_id: PeerId, reason: DialFailure) -> Option<Duration> {
        let now = unix_now();

        let backoff = self.state.lock().touch(peer_id).map(|entry| {
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.score = entry.score.apply(Outcome::ConnectFailed, &self.config);

            let backoff = self.backoff(entry.consecutive_failures);

            entry.dial_state = DialState::FailedBackoff {
                retry_at: now.saturating_add(backoff.as_secs()),
            };

            backoff
        })?;

        self.log(
            Level::Debug,
            format_args!("dial to {peer_id} failed ({reason:?}), retrying in {backoff:?}"),
        );

        self.register_dial(reason.into());
        self.notify();

        Some(backoff)
    }

    /// Fails dials that have not been reported back within `dial_timeout`.
    ///
    /// Returns the servers that were failed.
    pub fn expire_dials(&self) -> Vec<PeerId> {
        self.expire_dials_at(unix_now())
    }

    pub fn expire_dials_at(&self, now: UnixSeconds) -> Vec<PeerId> {
        let timeout = self.config.dial_timeout.as_secs();

        let expired = self
            .state
            .lock()
            .entries
            .values()
            .filter(|entry| match entry.dial_state {
                DialState::Dialing { started_at } => started_at.saturating_add(timeout) <= now,
                _ => false,
            })
            .map(ServerPoolEntry::peer_id)
            .sorted()
            .collect_vec();

        for peer_id in &expired {
            self.mark_failed(*peer_id, DialFailure::Unreachable);
        }

        expired
    }

    /// Returns a connected server to the dial candidate set.
    pub fn mark_disconnected(&self, peer_id: PeerId) -> bool {
        let disconnected = self
            .state
            .lock()
            .touch(peer_id)
            .filter(|entry| entry.dial_state == DialState::Connected)
            .map(|entry| {
                entry.dial_state = DialState::Unknown;
                entry.last_seen = unix_now();
            })
            .is_some();

        if disconnected {
            self.notify();
        }

        disconnected
    }

    pub fn mark_served(&self, peer_id: PeerId, outcome: Outcome) -> Option<Score> {
        let score = self.state.lock().touch(peer_id).map(|entry| {
            entry.score = entry.score.apply(outcome, &self.config);

            if outcome.is_success() {
                entry.last_seen = unix_now();
            }

            entry.score
        })?;

        self.notify();

        Some(score)
    }

    /// Adds a server from discovery or an inbound connection.
    ///
    /// Returns `false` if the server was already known. The address of a known server is updated
    /// unless it is being dialed or is connected.
    pub fn add_candidate(&self, topic: Topic, node: NodeAddress) -> bool {
        let now = unix_now();
        let peer_id = node.peer_id;

        let inserted = {
            let mut state = self.state.lock();

            if let Some(entry) = state.entries.get(&peer_id) {
                if !entry.is_active() && (entry.node != node || entry.topic != topic) {
                    if let Some(entry) = state.touch(peer_id) {
                        entry.node = node;
                        entry.topic = topic;
                    }
                }

                false
            } else {
                state
                    .entries
                    .insert(peer_id, ServerPoolEntry::new(topic, node, now));

                state.dirty.insert(peer_id);
                state.removed.remove(&peer_id);

                self.evict(&mut state);

                true
            }
        };

        if inserted {
            self.update_entry_count();
            self.notify();
        }

        inserted
    }

    #[must_use]
    pub fn score(&self, peer_id: PeerId) -> Option<Score> {
        self.state.lock().entries.get(&peer_id).map(|entry| entry.score)
    }

    #[must_use]
    pub fn entry(&self, peer_id: PeerId) -> Option<ServerPoolEntry> {
        self.state.lock().entries.get(&peer_id).cloned()
    }

    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| entry.dial_state == DialState::Connected)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns a receiver that observes every score or state update.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Writes entries changed since the last flush to the database.
    pub fn flush(&self) -> Result<()> {
        let (pairs, removed) = {
            let state = self.state.lock();

            let pairs = state
                .dirty
                .iter()
                .filter_map(|peer_id| state.entries.get(peer_id))
                .map(|entry| Ok((entry_key(entry.peer_id()), bincode::serialize(entry)?)))
                .collect::<Result<Vec<_>>>()?;

            let removed = state.removed.iter().copied().collect_vec();

            (pairs, removed)
        };

        if pairs.is_empty() && removed.is_empty() {
            return Ok(());
        }

        self.database.put_batch(pairs.iter().map(|(key, value)| (key, value)))?;

        for peer_id in &removed {
            self.database.delete(entry_key(*peer_id))?;
        }

        let mut state = self.state.lock();

        for (key, _) in &pairs {
            if let Some(peer_id) = key.strip_prefix(KEY_PREFIX).and_then(PeerId::from_slice) {
                state.dirty.remove(&peer_id);
            }
        }

        for peer_id in removed {
            state.removed.remove(&peer_id);
        }

        Ok(())
    }

    /// Adds servers from `feed` until the feed ends or the pool is stopped.
    pub async fn run_discovery(&self, feed: impl Stream<Item = DiscoveredServer>) {
        let mut feed = pin!(feed);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                server = feed.next() => match server {
                    Some(DiscoveredServer { topic, node }) => {
                        self.add_candidate(topic, node);
                    }
                    None => {
                        self.log(Level::Debug, "discovery feed ended");
                        break;
                    }
                },
            }
        }
    }

    /// Periodically expires unanswered dials and persists the pool.
    ///
    /// Suggested servers are sent to the network for dialing while fewer than `target_servers`
    /// are connected.
    pub async fn run_dialer(&self, topic: Topic, network_tx: UnboundedSender<OdrToNetwork>) {
        let mut interval = tokio::time::interval(self.config.dial_interval);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let expired = self.expire_dials();

            if !expired.is_empty() {
                self.log(
                    Level::Debug,
                    format_args!("{} dials were not answered in time", expired.len()),
                );
            }

            if let Err(error) = self.flush() {
                self.log(Level::Warn, format_args!("failed to persist server pool: {error:?}"));
            }

            if self.connected_count() >= self.config.target_servers {
                continue;
            }

            for node in self.suggest_peers(&topic) {
                OdrToNetwork::Dial(node).send(&network_tx);
            }
        }
    }

    /// Stops the discovery and dial loops and persists the pool.
    pub fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        self.flush()
    }

    fn backoff(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(31);

        self.config
            .backoff_base
            .saturating_mul(1 << exponent)
            .min(self.config.backoff_max)
    }

    // Removes the lowest-scored inactive entries while the pool is over capacity.
    fn evict(&self, state: &mut PoolState) {
        while state.entries.len() > self.config.max_server_pool_entries {
            let Some(peer_id) = state
                .entries
                .values()
                .filter(|entry| !entry.is_active())
                .min_by_key(|entry| (entry.score, entry.last_seen, entry.peer_id()))
                .map(ServerPoolEntry::peer_id)
            else {
                break;
            };

            state.entries.remove(&peer_id);
            state.dirty.remove(&peer_id);
            state.removed.insert(peer_id);
        }
    }

    fn notify(&self) {
        self.generation
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn update_entry_count(&self) {
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.set_server_pool_entries(self.len());
        }
    }

    fn register_dial(&self, result: &str) {
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.register_dial(result);
        }
    }

    fn log(&self, level: Level, message: impl Display) {
        log!(level, "[Server pool] {message}");
    }
}

fn entry_key(peer_id: PeerId) -> Vec<u8> {
    [KEY_PREFIX, peer_id.as_bytes()].concat()
}

fn unix_now() -> UnixSeconds {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
