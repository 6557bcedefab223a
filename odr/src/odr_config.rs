use core::time::Duration;

use derivative::Derivative;

#[derive(Clone, Copy, Debug, Derivative)]
#[derivative(Default)]
pub struct OdrConfig {
    /// Deadline of a retrieval when the caller does not supply one.
    #[derivative(Default(value = "Duration::from_secs(10)"))]
    pub default_deadline: Duration,

    /// Upper bound on how long a single dispatch waits for its response.
    #[derivative(Default(value = "Duration::from_secs(2)"))]
    pub attempt_timeout: Duration,

    /// Soft limit on in-flight requests for peers that do not announce one.
    #[derivative(Default(value = "8"))]
    pub default_peer_capacity: usize,

    #[derivative(Default(value = "4"))]
    pub dial_batch_size: usize,

    /// One in every `exploration_interval` dial slots goes to a never-tried server.
    #[derivative(Default(value = "4"))]
    pub exploration_interval: usize,

    #[derivative(Default(value = "Duration::from_secs(5)"))]
    pub dial_interval: Duration,

    /// Dials not reported back within this time count as failed.
    #[derivative(Default(value = "Duration::from_secs(30)"))]
    pub dial_timeout: Duration,

    /// Connected servers above which the dialer stops suggesting candidates.
    #[derivative(Default(value = "8"))]
    pub target_servers: usize,

    #[derivative(Default(value = "Duration::from_secs(5)"))]
    pub backoff_base: Duration,

    #[derivative(Default(value = "Duration::from_secs(600)"))]
    pub backoff_max: Duration,

    #[derivative(Default(value = "Duration::from_millis(200)"))]
    pub fast_response: Duration,

    #[derivative(Default(value = "Duration::from_secs(1)"))]
    pub slow_response: Duration,

    #[derivative(Default(value = "1000"))]
    pub max_server_pool_entries: usize,

    #[derivative(Default(value = "true"))]
    pub cache_verified_results: bool,

    /// Oldest cached results are evicted beyond this many entries.
    #[derivative(Default(value = "4096"))]
    pub max_cached_results: u64,
}
