use std::sync::Arc;

use anyhow::Result;
use database::Database;
use ethereum_types::H256;
use futures::{
    channel::mpsc::{UnboundedReceiver, UnboundedSender},
    Stream, StreamExt as _,
};
use log::{debug, info};
use parking_lot::Mutex;
use prometheus_metrics::Metrics;
use tokio::task::JoinHandle;

use crate::{
    messages::{NetworkToOdr, OdrToNetwork},
    misc::{DiscoveredServer, NodeAddress, ServerAnnouncement, Topic},
    odr::{ChainVerifier, LightOdr},
    odr_config::OdrConfig,
    peer_registry::{Peer, PeerRegistry},
    request_distributor::RequestDistributor,
    retrieve_manager::RetrieveManager,
    server_pool::ServerPool,
};

/// Discovery topic of servers for the chain with the given genesis block.
#[must_use]
pub fn les_topic(genesis_hash: H256) -> Topic {
    Topic::from(format!("LES@{}", hex::encode(&genesis_hash[..8])))
}

/// Owns every ODR component and connects them to the network.
pub struct LightService {
    config: OdrConfig,
    topic: Topic,
    registry: Arc<PeerRegistry>,
    server_pool: Arc<ServerPool>,
    retrieve_manager: Arc<RetrieveManager>,
    odr: Arc<LightOdr>,
    network_tx: UnboundedSender<OdrToNetwork>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LightService {
    pub fn new(
        config: OdrConfig,
        database: Arc<Database>,
        network_tx: UnboundedSender<OdrToNetwork>,
        verifier: Arc<dyn ChainVerifier>,
        genesis_hash: H256,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        let registry = Arc::new(PeerRegistry::new(config, metrics.clone()));
        let distributor = RequestDistributor::new(Arc::clone(&registry));

        let server_pool = Arc::new(ServerPool::new(
            config,
            Arc::clone(&database),
            metrics.clone(),
        )?);

        let retrieve_manager = Arc::new(RetrieveManager::new(
            config,
            distributor,
            Arc::clone(&server_pool),
            network_tx.clone(),
            metrics.clone(),
        ));

        let odr = Arc::new(LightOdr::new(
            config,
            Arc::clone(&retrieve_manager),
            verifier,
            Some(database),
            metrics,
        )?);

        let topic = les_topic(genesis_hash);

        info!("light service created (topic: {topic})");

        Ok(Self {
            config,
            topic,
            registry,
            server_pool,
            retrieve_manager,
            odr,
            network_tx,
            tasks: Mutex::default(),
        })
    }

    #[must_use]
    pub const fn odr(&self) -> &Arc<LightOdr> {
        &self.odr
    }

    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Spawns the discovery consumer and the dial loop.
    pub fn start(&self, discovery: impl Stream<Item = DiscoveredServer> + Send + 'static) {
        let server_pool = Arc::clone(&self.server_pool);
        let discovery_task =
            tokio::spawn(async move { server_pool.run_discovery(discovery).await });

        let server_pool = Arc::clone(&self.server_pool);
        let topic = self.topic.clone();
        let network_tx = self.network_tx.clone();
        let dialer_task =
            tokio::spawn(async move { server_pool.run_dialer(topic, network_tx).await });

        self.tasks.lock().extend([discovery_task, dialer_task]);
    }

    /// Handles network events until the network side drops its sender.
    pub async fn run(&self, mut network_rx: UnboundedReceiver<NetworkToOdr>) {
        while let Some(message) = network_rx.next().await {
            self.handle(message);
        }

        debug!("network event channel closed");
    }

    pub fn handle(&self, message: NetworkToOdr) {
        match message {
            NetworkToOdr::PeerConnected(announcement) => self.on_peer_connected(announcement),
            NetworkToOdr::PeerDisconnected(peer_id) => {
                let lost = self.retrieve_manager.peer_disconnected(peer_id);
                self.server_pool.mark_disconnected(peer_id);

                debug!("server {peer_id} disconnected with {lost} requests in flight");
            }
            NetworkToOdr::HeadAnnounced(peer_id, head) => {
                self.registry.update_head(peer_id, head);
            }
            NetworkToOdr::Response(response) => {
                self.retrieve_manager.deliver(response);
            }
            NetworkToOdr::DialFailed(peer_id, reason) => {
                self.server_pool.mark_failed(peer_id, reason);
            }
        }
    }

    /// Cancels all queries, waits for them to finish, stops the server pool loops and persists
    /// the pool.
    pub async fn stop(&self) -> Result<()> {
        self.odr.stop().await;
        self.server_pool.stop()?;

        let tasks = core::mem::take(&mut *self.tasks.lock());

        for task in tasks {
            task.await?;
        }

        info!("light service stopped");

        Ok(())
    }

    // Connected peers start with the reliability their server pool entry has earned.
    fn on_peer_connected(&self, announcement: ServerAnnouncement) {
        let peer_id = announcement.peer_id;

        let node = NodeAddress {
            peer_id,
            address: announcement.address,
        };

        self.server_pool.add_candidate(self.topic.clone(), node);
        self.server_pool.mark_connected(peer_id);

        let reliability = self.server_pool.score(peer_id).unwrap_or_default();

        self.registry.add(Peer::new(
            announcement,
            self.config.default_peer_capacity,
            reliability,
        ));
    }
}
