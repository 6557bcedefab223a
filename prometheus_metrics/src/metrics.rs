use anyhow::Result;
use log::warn;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, IntGauge};

#[derive(Debug)]
pub struct Metrics {
    // Retrievals
    odr_retrievals: IntCounterVec,
    odr_attempts: IntCounterVec,
    pub odr_retrieve_times: HistogramVec,
    odr_pending_requests: IntGauge,
    odr_cache_hits: IntCounterVec,

    // Servers
    odr_connected_servers: IntGauge,
    odr_server_pool_entries: IntGauge,
    odr_dials: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            // Retrievals
            odr_retrievals: IntCounterVec::new(
                opts!("ODR_RETRIEVALS_TOTAL", "Number of finished retrievals"),
                &["kind", "result"],
            )?,

            odr_attempts: IntCounterVec::new(
                opts!("ODR_ATTEMPTS_TOTAL", "Number of dispatches to serving peers"),
                &["kind", "outcome"],
            )?,

            odr_retrieve_times: HistogramVec::new(
                histogram_opts!(
                    "ODR_RETRIEVE_TIMES",
                    "Time from retrieval start to its resolution",
                ),
                &["kind"],
            )?,

            odr_pending_requests: IntGauge::new(
                "ODR_PENDING_REQUESTS",
                "Number of retrievals currently in progress",
            )?,

            odr_cache_hits: IntCounterVec::new(
                opts!("ODR_CACHE_HITS_TOTAL", "Number of queries answered locally"),
                &["kind"],
            )?,

            // Servers
            odr_connected_servers: IntGauge::new(
                "ODR_CONNECTED_SERVERS",
                "Number of connected serving peers",
            )?,

            odr_server_pool_entries: IntGauge::new(
                "ODR_SERVER_POOL_ENTRIES",
                "Number of known servers in the server pool",
            )?,

            odr_dials: IntCounterVec::new(
                opts!("ODR_DIALS_TOTAL", "Number of dial attempts by result"),
                &["result"],
            )?,
        })
    }

    pub fn register_with_default_metrics(&self) -> Result<()> {
        let default_registry = prometheus::default_registry();

        default_registry.register(Box::new(self.odr_retrievals.clone()))?;
        default_registry.register(Box::new(self.odr_attempts.clone()))?;
        default_registry.register(Box::new(self.odr_retrieve_times.clone()))?;
        default_registry.register(Box::new(self.odr_pending_requests.clone()))?;
        default_registry.register(Box::new(self.odr_cache_hits.clone()))?;
        default_registry.register(Box::new(self.odr_connected_servers.clone()))?;
        default_registry.register(Box::new(self.odr_server_pool_entries.clone()))?;
        default_registry.register(Box::new(self.odr_dials.clone()))?;

        Ok(())
    }

    // Retrievals
    pub fn register_retrieval(&self, kind: &str, result: &str) {
        match self.odr_retrievals.get_metric_with_label_values(&[kind, result]) {
            Ok(counter) => counter.inc(),
            Err(error) => warn!("unable to register retrieval for {kind}/{result}: {error:?}"),
        }
    }

    pub fn register_attempt(&self, kind: &str, outcome: &str) {
        match self.odr_attempts.get_metric_with_label_values(&[kind, outcome]) {
            Ok(counter) => counter.inc(),
            Err(error) => warn!("unable to register attempt for {kind}/{outcome}: {error:?}"),
        }
    }

    pub fn set_pending_requests(&self, count: usize) {
        self.odr_pending_requests.set(count.try_into().unwrap_or(i64::MAX));
    }

    pub fn register_cache_hit(&self, kind: &str) {
        match self.odr_cache_hits.get_metric_with_label_values(&[kind]) {
            Ok(counter) => counter.inc(),
            Err(error) => warn!("unable to register cache hit for {kind}: {error:?}"),
        }
    }

    // Servers
    pub fn set_connected_servers(&self, count: usize) {
        self.odr_connected_servers.set(count.try_into().unwrap_or(i64::MAX));
    }

    pub fn set_server_pool_entries(&self, count: usize) {
        self.odr_server_pool_entries.set(count.try_into().unwrap_or(i64::MAX));
    }

    pub fn register_dial(&self, result: &str) {
        match self.odr_dials.get_metric_with_label_values(&[result]) {
            Ok(counter) => counter.inc(),
            Err(error) => warn!("unable to register dial for {result}: {error:?}"),
        }
    }
}
