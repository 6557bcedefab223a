use core::{fmt::Display, time::Duration};
use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use futures::channel::{mpsc::UnboundedSender, oneshot};
use log::{log, Level};
use parking_lot::Mutex;
use prometheus_metrics::Metrics;
use tokio::{
    sync::Notify,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{RetrieveError, ValidationError},
    messages::OdrToNetwork,
    misc::{PeerId, RequestKind, SequenceId},
    odr_config::OdrConfig,
    request::{Request, RequestKey, Response, Validator},
    request_distributor::{default_eligibility, RequestDistributor, Selection},
    score::Outcome,
    server_pool::ServerPool,
};

const NO_PEERS_MESSAGE_COOLDOWN: Duration = Duration::from_secs(10);

enum Attempt {
    Response(Response),
    PeerLost,
    Timeout,
}

// The outstanding dispatch of a pending request. `delivery_tx` is taken by whichever of response
// delivery and peer loss comes first.
struct Dispatch {
    peer_id: PeerId,
    delivery_tx: Option<oneshot::Sender<Attempt>>,
}

#[derive(Default)]
struct Failures {
    eligible_seen: bool,
    invalid: usize,
    other: usize,
}

impl Failures {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Invalid | Outcome::Stale => self.invalid += 1,
            Outcome::Timeout | Outcome::PeerLost => self.other += 1,
            Outcome::Served { .. } | Outcome::ConnectFailed => {}
        }
    }

    // Error reported when the deadline passes.
    const fn classify(&self) -> RetrieveError {
        if !self.eligible_seen {
            RetrieveError::NoPeers
        } else if self.invalid > 0 && self.other == 0 {
            RetrieveError::Invalid
        } else {
            RetrieveError::Timeout
        }
    }
}

/// Retry and correlation state machine for retrievals.
///
/// Each call to [`Self::retrieve`] runs its own attempt loop. The manager only shares the
/// correlation table mapping sequence ids of pending requests to their outstanding dispatch.
pub struct RetrieveManager {
    config: OdrConfig,
    distributor: RequestDistributor,
    server_pool: Arc<ServerPool>,
    network_tx: UnboundedSender<OdrToNetwork>,
    next_sequence_id: AtomicU64,
    pending: Mutex<HashMap<SequenceId, Option<Dispatch>>>,
    drained: Notify,
    shutdown: CancellationToken,
    no_peers_message_shown_at: Mutex<Option<Instant>>,
    metrics: Option<Arc<Metrics>>,
}

impl RetrieveManager {
    #[must_use]
    pub fn new(
        config: OdrConfig,
        distributor: RequestDistributor,
        server_pool: Arc<ServerPool>,
        network_tx: UnboundedSender<OdrToNetwork>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            config,
            distributor,
            server_pool,
            network_tx,
            next_sequence_id: AtomicU64::new(0),
            pending: Mutex::default(),
            drained: Notify::new(),
            shutdown: CancellationToken::new(),
            no_peers_message_shown_at: Mutex::default(),
            metrics,
        }
    }

    pub fn new_request(&self, kind: RequestKind, key: RequestKey) -> Request {
        let sequence_id = self.next_sequence_id.fetch_add(1, Ordering::Relaxed);
        Request::new(kind, key, sequence_id)
    }

    /// Retrieves a payload for `request` that passes `validator`.
    ///
    /// Without an explicit `deadline` the request expires `default_deadline` after creation.
    pub async fn retrieve(
        &self,
        request: Request,
        validator: Validator,
        deadline: Option<Instant>,
    ) -> Result<Bytes, RetrieveError> {
        self.retrieve_with_cancel(request, validator, deadline, &CancellationToken::new())
            .await
    }

    pub async fn retrieve_with_cancel(
        &self,
        request: Request,
        validator: Validator,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<Bytes, RetrieveError> {
        let kind: &'static str = request.kind().into();
        let sequence_id = request.sequence_id();
        let deadline =
            deadline.unwrap_or_else(|| request.created_at() + self.config.default_deadline);

        let timer = self.metrics.as_ref().and_then(|metrics| {
            prometheus_metrics::start_timer_vec(&metrics.odr_retrieve_times, kind)
        });

        let result = match self.register(sequence_id) {
            Ok(guard) => {
                let result = self.run(&request, &validator, deadline, cancel).await;
                drop(guard);
                result
            }
            Err(error) => Err(error),
        };

        match &result {
            Ok(payload) => self.log(
                Level::Debug,
                format_args!("request {sequence_id} ({kind}) served {} bytes", payload.len()),
            ),
            Err(error) => self.log(
                Level::Debug,
                format_args!("request {sequence_id} ({kind}) failed: {error}"),
            ),
        }

        if let Some(metrics) = self.metrics.as_ref() {
            let label = match &result {
                Ok(_) => "success",
                Err(error) => error.into(),
            };

            metrics.register_retrieval(kind, label);
        }

        if matches!(result, Err(RetrieveError::Cancelled)) {
            prometheus_metrics::stop_and_discard(timer);
        } else {
            prometheus_metrics::stop_and_record(timer);
        }

        result
    }

    /// Routes a response to the request waiting for it.
    ///
    /// Returns `false` if no pending request has an outstanding dispatch with the same sequence id
    /// to the responding peer. Late and duplicate responses are discarded that way.
    pub fn deliver(&self, response: Response) -> bool {
        let sequence_id = response.sequence_id;
        let peer_id = response.peer_id;

        match self.take_delivery_tx(sequence_id, peer_id) {
            Some(delivery_tx) => delivery_tx.send(Attempt::Response(response)).is_ok(),
            None => {
                self.log(
                    Level::Debug,
                    format_args!("discarding unexpected response {sequence_id} from {peer_id}"),
                );

                false
            }
        }
    }

    /// Removes a disconnected peer and retries everything that was in flight on it.
    ///
    /// Returns the number of affected requests.
    pub fn peer_disconnected(&self, peer_id: PeerId) -> usize {
        let lost = self.distributor.registry().remove(peer_id);

        for sequence_id in &lost {
            self.lose(*sequence_id, peer_id);
        }

        lost.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Cancels every pending request and waits until all of them have released their peers.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        loop {
            let drained = self.drained.notified();

            if self.pending.lock().is_empty() {
                break;
            }

            drained.await;
        }

        self.log(Level::Info, "stopped");
    }

    async fn run(
        &self,
        request: &Request,
        validator: &Validator,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Bytes, RetrieveError> {
        let sequence_id = request.sequence_id();
        let mut changes = self.distributor.registry().subscribe();
        let mut tried = HashSet::new();
        let mut failures = Failures::default();
        let mut exhausted = false;

        loop {
            if cancel.is_cancelled() || self.shutdown.is_cancelled() {
                return Err(RetrieveError::Cancelled);
            }

            if Instant::now() >= deadline {
                return Err(failures.classify());
            }

            changes.borrow_and_update();

            let selection = self
                .distributor
                .distribute(request, default_eligibility, &tried);

            let peer_id = match selection {
                Selection::Selected(peer_id) => peer_id,
                Selection::NotYetAvailable { eligible, .. } => {
                    failures.eligible_seen |= eligible > 0;

                    if selection.is_exhausted() {
                        if !exhausted {
                            self.log(
                                Level::Debug,
                                format_args!(
                                    "request {sequence_id} tried all {eligible} eligible peers, \
                                     waiting for another one",
                                ),
                            );
                        }

                        exhausted = true;
                    } else if eligible == 0 {
                        self.warn_no_peers(request.kind());
                    }

                    let interruption = tokio::select! {
                        () = cancel.cancelled() => Some(RetrieveError::Cancelled),
                        () = self.shutdown.cancelled() => Some(RetrieveError::Cancelled),
                        () = sleep_until(deadline) => Some(failures.classify()),
                        Ok(()) = changes.changed() => None,
                    };

                    if let Some(error) = interruption {
                        return Err(error);
                    }

                    continue;
                }
            };

            failures.eligible_seen = true;
            exhausted = false;
            tried.insert(peer_id);

            let dispatched_at = Instant::now();
            let delivery_rx = self.dispatch(request, peer_id);
            let attempt_deadline = deadline.min(dispatched_at + self.config.attempt_timeout);

            let attempt = tokio::select! {
                () = cancel.cancelled() => return Err(RetrieveError::Cancelled),
                () = self.shutdown.cancelled() => return Err(RetrieveError::Cancelled),
                delivery = delivery_rx => delivery.unwrap_or(Attempt::PeerLost),
                () = sleep_until(attempt_deadline) => Attempt::Timeout,
            };

            self.finish_attempt(sequence_id, peer_id);

            let outcome = match attempt {
                Attempt::Response(response) => match validator(response.payload.as_ref()) {
                    Ok(()) => {
                        let latency = response.received_at.saturating_duration_since(dispatched_at);
                        self.report(peer_id, request.kind(), Outcome::Served { latency });
                        return Ok(response.payload);
                    }
                    Err(ValidationError::Stale) => {
                        self.log(
                            Level::Debug,
                            format_args!("stale response to request {sequence_id} from {peer_id}"),
                        );

                        Outcome::Stale
                    }
                    Err(ValidationError::Invalid(error)) => {
                        self.log(
                            Level::Warn,
                            format_args!(
                                "invalid response to request {sequence_id} from {peer_id}: {error}",
                            ),
                        );

                        Outcome::Invalid
                    }
                },
                Attempt::PeerLost => {
                    // A lost peer did not misbehave and may be retried if it reconnects.
                    tried.remove(&peer_id);
                    Outcome::PeerLost
                }
                Attempt::Timeout => Outcome::Timeout,
            };

            failures.record(outcome);
            self.report(peer_id, request.kind(), outcome);
        }
    }

    fn register(&self, sequence_id: SequenceId) -> Result<PendingGuard<'_>, RetrieveError> {
        if self.shutdown.is_cancelled() {
            return Err(RetrieveError::Cancelled);
        }

        let pending_count = {
            let mut pending = self.pending.lock();

            match pending.entry(sequence_id) {
                Entry::Occupied(_) => None,
                Entry::Vacant(vacant) => {
                    vacant.insert(None);
                    Some(pending.len())
                }
            }
        };

        let Some(pending_count) = pending_count else {
            self.log(
                Level::Warn,
                format_args!("request {sequence_id} is already being retrieved"),
            );

            return Err(RetrieveError::Cancelled);
        };

        self.update_pending_requests(pending_count);

        Ok(PendingGuard {
            manager: self,
            sequence_id,
        })
    }

    fn unregister(&self, sequence_id: SequenceId) {
        let (dispatch, pending_count) = {
            let mut pending = self.pending.lock();
            let dispatch = pending.remove(&sequence_id).flatten();
            (dispatch, pending.len())
        };

        if let Some(Dispatch { peer_id, .. }) = dispatch {
            self.distributor.registry().release(peer_id, sequence_id);
        }

        self.update_pending_requests(pending_count);

        if pending_count == 0 {
            self.drained.notify_waiters();
        }
    }

    fn dispatch(&self, request: &Request, peer_id: PeerId) -> oneshot::Receiver<Attempt> {
        let sequence_id = request.sequence_id();
        let (delivery_tx, delivery_rx) = oneshot::channel();

        if let Some(slot) = self.pending.lock().get_mut(&sequence_id) {
            *slot = Some(Dispatch {
                peer_id,
                delivery_tx: Some(delivery_tx),
            });
        }

        // The peer may have been removed between reservation and the dispatch being recorded.
        if !self.distributor.registry().is_dispatched(peer_id, sequence_id) {
            self.lose(sequence_id, peer_id);
        }

        OdrToNetwork::SendRequest {
            peer_id,
            request: request.clone(),
        }
        .send(&self.network_tx);

        self.log(
            Level::Debug,
            format_args!(
                "dispatched request {sequence_id} ({:?}) to {peer_id}",
                request.kind(),
            ),
        );

        delivery_rx
    }

    fn finish_attempt(&self, sequence_id: SequenceId, peer_id: PeerId) {
        if let Some(slot) = self.pending.lock().get_mut(&sequence_id) {
            *slot = None;
        }

        self.distributor.registry().release(peer_id, sequence_id);
    }

    fn lose(&self, sequence_id: SequenceId, peer_id: PeerId) {
        if let Some(delivery_tx) = self.take_delivery_tx(sequence_id, peer_id) {
            // The receiver is gone only if the request has already been resolved.
            delivery_tx.send(Attempt::PeerLost).ok();
        }
    }

    fn take_delivery_tx(
        &self,
        sequence_id: SequenceId,
        peer_id: PeerId,
    ) -> Option<oneshot::Sender<Attempt>> {
        self.pending
            .lock()
            .get_mut(&sequence_id)?
            .as_mut()
            .filter(|dispatch| dispatch.peer_id == peer_id)?
            .delivery_tx
            .take()
    }

    fn report(&self, peer_id: PeerId, kind: RequestKind, outcome: Outcome) {
        self.distributor.registry().record_outcome(peer_id, outcome);
        self.server_pool.mark_served(peer_id, outcome);

        if let Some(metrics) = self.metrics.as_ref() {
            metrics.register_attempt(kind.into(), outcome.into());
        }
    }

    fn warn_no_peers(&self, kind: RequestKind) {
        {
            let mut shown_at = self.no_peers_message_shown_at.lock();

            if !shown_at.is_none_or(|instant| instant.elapsed() > NO_PEERS_MESSAGE_COOLDOWN) {
                return;
            }

            *shown_at = Some(Instant::now());
        }

        self.log(
            Level::Warn,
            format_args!("no connected server can serve {kind:?} requests, waiting for one"),
        );
    }

    fn update_pending_requests(&self, pending_count: usize) {
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.set_pending_requests(pending_count);
        }
    }

    fn log(&self, level: Level, message: impl Display) {
        log!(
            level,
            "[ODR: {} pending, {} servers] {}",
            self.pending_count(),
            self.distributor.registry().len(),
            message,
        );
    }
}

// Removes the pending entry and releases its outstanding dispatch when the retrieval resolves or
// its future is dropped.
struct PendingGuard<'manager> {
    manager: &'manager RetrieveManager,
    sequence_id: SequenceId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.manager.unregister(self.sequence_id);
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, bail, Result};
    use database::Database;
    use futures::{
        channel::mpsc::{self, UnboundedReceiver},
        StreamExt as _,
    };
    use itertools::Itertools as _;
    use tokio::task::JoinHandle;

    use crate::{
        misc::{test_utils, BlockHead, Topic},
        peer_registry::{Peer, PeerRegistry},
        score::Score,
    };

    use super::*;

    const GOOD: &[u8] = b"good";
    const BAD: &[u8] = b"bad";

    struct Harness {
        manager: Arc<RetrieveManager>,
        registry: Arc<PeerRegistry>,
        server_pool: Arc<ServerPool>,
        network_rx: UnboundedReceiver<OdrToNetwork>,
    }

    impl Harness {
        fn new(config: OdrConfig) -> Result<Self> {
            Self::with_metrics(config, None)
        }

        fn with_metrics(config: OdrConfig, metrics: Option<Arc<Metrics>>) -> Result<Self> {
            let registry = Arc::new(PeerRegistry::new(config, None));
            let database = Arc::new(Database::in_memory());
            let server_pool = Arc::new(ServerPool::new(config, database, None)?);
            let (network_tx, network_rx) = mpsc::unbounded();

            let manager = Arc::new(RetrieveManager::new(
                config,
                RequestDistributor::new(Arc::clone(&registry)),
                Arc::clone(&server_pool),
                network_tx,
                metrics,
            ));

            Ok(Self {
                manager,
                registry,
                server_pool,
                network_rx,
            })
        }

        fn connect(&self, n: u64, score: u8) {
            self.connect_with_capacity(n, score, 4);
        }

        fn connect_with_capacity(&self, n: u64, score: u8, capacity: usize) {
            let topic = Topic::from("LES@test".to_owned());

            self.server_pool.add_candidate(topic, test_utils::node(n));
            self.server_pool.mark_connected(test_utils::peer_id(n));

            self.registry.add(Peer::new(
                test_utils::announcement(n, 100),
                capacity,
                Score::new(score),
            ));
        }

        fn header_request(&self) -> Request {
            self.manager
                .new_request(RequestKind::Header, RequestKey::Number(50))
                .with_min_block_number(50)
        }

        fn spawn_retrieve(
            &self,
            deadline: Option<Instant>,
        ) -> JoinHandle<Result<Bytes, RetrieveError>> {
            let manager = Arc::clone(&self.manager);
            let request = self.header_request();

            tokio::spawn(async move { manager.retrieve(request, validator(), deadline).await })
        }

        async fn next_dispatch(&mut self) -> Result<(PeerId, Request)> {
            match self.network_rx.next().await {
                Some(OdrToNetwork::SendRequest { peer_id, request }) => Ok((peer_id, request)),
                _ => bail!("expected a dispatched request"),
            }
        }

        async fn respond(&mut self, payload: &'static [u8]) -> Result<PeerId> {
            let (peer_id, request) = self.next_dispatch().await?;
            let response = Response::new(request.sequence_id(), peer_id, payload);

            assert!(self.manager.deliver(response));

            Ok(peer_id)
        }
    }

    fn validator() -> Validator {
        Box::new(|payload: &[u8]| {
            if payload == GOOD {
                Ok(())
            } else {
                Err(ValidationError::Invalid(anyhow!("unexpected payload")))
            }
        })
    }

    #[tokio::test]
    async fn valid_response_is_returned() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;

        harness.connect(1, 50);

        let task = harness.spawn_retrieve(None);
        let peer_id = harness.respond(GOOD).await?;

        assert_eq!(task.await?, Ok(Bytes::from_static(GOOD)));
        assert_eq!(harness.registry.in_flight(peer_id), Some(0));
        assert!(harness.server_pool.score(peer_id) > Some(Score::new(50)));
        assert_eq!(harness.manager.pending_count(), 0);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_data_from_every_peer_fails_with_invalid_at_deadline() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;

        for n in 1..=3 {
            harness.connect(n, 50);
        }

        let started_at = Instant::now();
        let task = harness.spawn_retrieve(None);
        let mut responders = vec![];

        for _ in 1..=3 {
            responders.push(harness.respond(BAD).await?);
        }

        assert_eq!(task.await?, Err(RetrieveError::Invalid));
        assert_eq!(responders.iter().unique().count(), 3);
        assert!(started_at.elapsed() >= OdrConfig::default().default_deadline);

        for peer_id in responders {
            let reliability = harness.registry.get(peer_id).map(|peer| peer.reliability());

            assert!(reliability < Some(Score::new(50)));
            assert!(harness.server_pool.score(peer_id) < Some(Score::new(50)));
            assert_eq!(harness.registry.in_flight(peer_id), Some(0));
        }

        Ok(())
    }

    #[tokio::test]
    async fn stale_data_is_retried_on_another_peer() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;

        harness.connect(1, 90);
        harness.connect(2, 50);

        let manager = Arc::clone(&harness.manager);
        let request = harness.header_request();

        let stale_then_good: Validator = Box::new(|payload: &[u8]| {
            if payload == GOOD {
                Ok(())
            } else {
                Err(ValidationError::Stale)
            }
        });

        let task =
            tokio::spawn(async move { manager.retrieve(request, stale_then_good, None).await });

        let stale_peer = harness.respond(BAD).await?;
        let good_peer = harness.respond(GOOD).await?;

        assert_eq!(task.await?, Ok(Bytes::from_static(GOOD)));
        assert_eq!(stale_peer, test_utils::peer_id(1));
        assert_eq!(good_peer, test_utils::peer_id(2));
        assert_eq!(harness.server_pool.score(stale_peer), Some(Score::new(40)));

        Ok(())
    }

    #[tokio::test]
    async fn cancellation_releases_the_peer() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;

        harness.connect(1, 50);

        let manager = Arc::clone(&harness.manager);
        let request = harness.header_request();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            manager
                .retrieve_with_cancel(request, validator(), None, &task_cancel)
                .await
        });

        let (peer_id, request) = harness.next_dispatch().await?;

        assert_eq!(harness.registry.in_flight(peer_id), Some(1));

        cancel.cancel();

        assert_eq!(task.await?, Err(RetrieveError::Cancelled));
        assert_eq!(harness.registry.in_flight(peer_id), Some(0));

        let late_response = Response::new(request.sequence_id(), peer_id, GOOD);

        assert!(!harness.manager.deliver(late_response));

        Ok(())
    }

    #[tokio::test]
    async fn disconnect_is_retried_on_another_peer() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;

        harness.connect(1, 90);
        harness.connect(2, 50);

        let task = harness.spawn_retrieve(None);
        let (lost_peer, _) = harness.next_dispatch().await?;

        assert_eq!(lost_peer, test_utils::peer_id(1));
        assert_eq!(harness.manager.peer_disconnected(lost_peer), 1);

        let serving_peer = harness.respond(GOOD).await?;

        assert_eq!(serving_peer, test_utils::peer_id(2));
        assert_eq!(task.await?, Ok(Bytes::from_static(GOOD)));
        assert!(!harness.registry.contains(lost_peer));

        Ok(())
    }

    #[tokio::test]
    async fn responses_are_correlated_exactly_once() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;

        harness.connect(1, 50);
        harness.connect(2, 50);

        let task = harness.spawn_retrieve(None);
        let (peer_id, request) = harness.next_dispatch().await?;
        let sequence_id = request.sequence_id();
        let other_peer = test_utils::peer_id(if peer_id == test_utils::peer_id(1) { 2 } else { 1 });

        assert!(!harness.manager.deliver(Response::new(sequence_id + 1000, peer_id, GOOD)));
        assert!(!harness.manager.deliver(Response::new(sequence_id, other_peer, GOOD)));
        assert!(harness.manager.deliver(Response::new(sequence_id, peer_id, GOOD)));
        assert!(!harness.manager.deliver(Response::new(sequence_id, peer_id, GOOD)));

        assert_eq!(task.await?, Ok(Bytes::from_static(GOOD)));

        // A disconnect after the response has been correlated must not release twice.
        assert_eq!(harness.manager.peer_disconnected(peer_id), 0);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_timeouts_demote_a_reliable_peer() -> Result<()> {
        let config = OdrConfig {
            attempt_timeout: Duration::from_millis(100),
            ..OdrConfig::default()
        };

        let mut harness = Harness::new(config)?;
        let peer_a = test_utils::peer_id(1);
        let peer_b = test_utils::peer_id(2);

        harness.connect(1, 100);
        harness.connect(2, 10);

        for _ in 0..3 {
            let deadline = Instant::now() + config.attempt_timeout;
            let request = harness.header_request();
            let result = harness.manager.retrieve(request, validator(), Some(deadline)).await;

            assert_eq!(result, Err(RetrieveError::Timeout));
            assert_eq!(harness.next_dispatch().await?.0, peer_a);
        }

        let score_a = harness.registry.get(peer_a).map(|peer| peer.reliability());
        let score_b = harness.registry.get(peer_b).map(|peer| peer.reliability());

        assert!(score_a < score_b);

        let task = harness.spawn_retrieve(None);

        assert_eq!(harness.respond(GOOD).await?, peer_b);
        assert_eq!(task.await?, Ok(Bytes::from_static(GOOD)));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_a_peer_to_become_eligible() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;
        let started_at = Instant::now();
        let task = harness.spawn_retrieve(Some(started_at + Duration::from_millis(500)));

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(harness.network_rx.try_next().is_err());

        harness.connect(1, 50);

        assert_eq!(harness.respond(GOOD).await?, test_utils::peer_id(1));
        assert_eq!(task.await?, Ok(Bytes::from_static(GOOD)));
        assert!(started_at.elapsed() < Duration::from_millis(500));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn head_announcement_makes_a_peer_eligible() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;

        harness
            .registry
            .add(Peer::new(test_utils::announcement(1, 10), 4, Score::default()));

        let task = harness.spawn_retrieve(None);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(harness.network_rx.try_next().is_err());

        let head = BlockHead {
            number: 60,
            ..BlockHead::default()
        };

        assert!(harness.registry.update_head(test_utils::peer_id(1), head));
        assert_eq!(harness.respond(GOOD).await?, test_utils::peer_id(1));
        assert_eq!(task.await?, Ok(Bytes::from_static(GOOD)));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_without_peers_fails_with_no_peers() -> Result<()> {
        let harness = Harness::new(OdrConfig::default())?;
        let request = harness.header_request();
        let deadline = Instant::now() + Duration::from_millis(500);

        assert_eq!(
            harness.manager.retrieve(request, validator(), Some(deadline)).await,
            Err(RetrieveError::NoPeers),
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_on_the_only_peer_fails_with_timeout() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;

        harness.connect(1, 50);

        let task = harness.spawn_retrieve(None);
        let (peer_id, _) = harness.next_dispatch().await?;

        assert_eq!(task.await?, Err(RetrieveError::Timeout));
        assert_eq!(harness.registry.in_flight(peer_id), Some(0));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn peer_connecting_after_all_peers_failed_is_used() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;
        let started_at = Instant::now();

        harness.connect(1, 50);

        let task = harness.spawn_retrieve(Some(started_at + Duration::from_millis(500)));

        assert_eq!(harness.respond(BAD).await?, test_utils::peer_id(1));

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(harness.network_rx.try_next().is_err());

        harness.connect(2, 50);

        assert_eq!(harness.respond(GOOD).await?, test_utils::peer_id(2));
        assert_eq!(task.await?, Ok(Bytes::from_static(GOOD)));
        assert!(started_at.elapsed() < Duration::from_millis(500));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn lost_peer_is_retried_after_reconnecting() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;

        harness.connect(1, 50);

        let task = harness.spawn_retrieve(None);
        let (peer_id, _) = harness.next_dispatch().await?;

        assert_eq!(harness.manager.peer_disconnected(peer_id), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;

        harness.connect(1, 50);

        assert_eq!(harness.respond(GOOD).await?, peer_id);
        assert_eq!(task.await?, Ok(Bytes::from_static(GOOD)));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_after_losing_every_peer_fails_with_timeout() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;

        harness.connect(1, 50);

        let task = harness.spawn_retrieve(None);
        let (peer_id, _) = harness.next_dispatch().await?;

        harness.manager.peer_disconnected(peer_id);

        assert_eq!(task.await?, Err(RetrieveError::Timeout));

        Ok(())
    }

    #[tokio::test]
    async fn concurrent_retrievals_never_share_a_dispatch() -> Result<()> {
        const REQUESTS: usize = 50;
        const CAPACITY: usize = 2;

        let mut harness = Harness::new(OdrConfig::default())?;
        let peers = (1..=3).map(test_utils::peer_id).collect_vec();

        for n in 1..=3 {
            harness.connect_with_capacity(n, 50, CAPACITY);
        }

        let tasks = (0..REQUESTS)
            .map(|_| harness.spawn_retrieve(None))
            .collect_vec();

        let mut dispatched = HashSet::new();
        let mut outstanding = HashSet::new();
        let mut served = 0;

        while served < REQUESTS {
            let mut batch = vec![harness.next_dispatch().await?];

            tokio::task::yield_now().await;

            while let Ok(Some(OdrToNetwork::SendRequest { peer_id, request })) =
                harness.network_rx.try_next()
            {
                batch.push((peer_id, request));
            }

            for (peer_id, request) in &batch {
                let pair = (*peer_id, request.sequence_id());

                assert!(dispatched.insert(pair), "{pair:?} was dispatched twice");
                assert!(outstanding.insert(pair));

                let load = outstanding
                    .iter()
                    .filter(|(outstanding_peer, _)| outstanding_peer == peer_id)
                    .count();

                assert!(load <= CAPACITY);
            }

            for (peer_id, request) in batch {
                let sequence_id = request.sequence_id();

                // Every fifth request is answered with bad data on its first attempt.
                let retried = dispatched
                    .iter()
                    .filter(|(_, dispatched_id)| *dispatched_id == sequence_id)
                    .count()
                    > 1;

                let payload = if sequence_id % 5 == 0 && !retried {
                    BAD
                } else {
                    served += 1;
                    GOOD
                };

                outstanding.remove(&(peer_id, sequence_id));

                assert!(harness
                    .manager
                    .deliver(Response::new(sequence_id, peer_id, payload)));
            }
        }

        for task in tasks {
            assert_eq!(task.await?, Ok(Bytes::from_static(GOOD)));
        }

        for peer_id in peers {
            assert_eq!(harness.registry.in_flight(peer_id), Some(0));
        }

        assert_eq!(harness.manager.pending_count(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn cancelled_retrievals_are_not_timed() -> Result<()> {
        let metrics = Arc::new(Metrics::new()?);
        let mut harness = Harness::with_metrics(OdrConfig::default(), Some(Arc::clone(&metrics)))?;

        harness.connect(1, 50);

        let cancel = CancellationToken::new();

        cancel.cancel();

        let request = harness.header_request();

        assert_eq!(
            harness
                .manager
                .retrieve_with_cancel(request, validator(), None, &cancel)
                .await,
            Err(RetrieveError::Cancelled),
        );

        let task = harness.spawn_retrieve(None);

        harness.respond(GOOD).await?;

        assert_eq!(task.await?, Ok(Bytes::from_static(GOOD)));

        let sample_count = metrics
            .odr_retrieve_times
            .get_metric_with_label_values(&["header"])?
            .get_sample_count();

        assert_eq!(sample_count, 1);

        Ok(())
    }

    #[tokio::test]
    async fn stop_cancels_pending_requests() -> Result<()> {
        let mut harness = Harness::new(OdrConfig::default())?;

        harness.connect(1, 50);

        let task = harness.spawn_retrieve(None);
        let (peer_id, _) = harness.next_dispatch().await?;

        harness.manager.stop().await;

        assert_eq!(task.await?, Err(RetrieveError::Cancelled));
        assert_eq!(harness.registry.in_flight(peer_id), Some(0));
        assert_eq!(harness.manager.pending_count(), 0);

        let request = harness.header_request();

        assert_eq!(
            harness.manager.retrieve(request, validator(), None).await,
            Err(RetrieveError::Cancelled),
        );

        Ok(())
    }
}
