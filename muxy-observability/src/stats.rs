use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

macro_rules! proxy_stats {
    ($($(#[$doc:meta])* $name:ident),+ $(,)?) => {
        /// One block of counters per worker thread. Workers bump their
        /// own block with relaxed stores; readers sum across blocks on
        /// demand, so the hot path never contends.
        #[derive(Debug, Default)]
        pub struct ProxyStats {
            $($(#[$doc])* pub $name: AtomicU64,)+
        }

        impl ProxyStats {
            /// Counter names in wire order, paired with this block's values.
            pub fn entries(&self) -> Vec<(&'static str, u64)> {
                vec![$((stringify!($name), self.$name.load(Ordering::Relaxed)),)+]
            }
        }
    };
}

proxy_stats! {
    /// Upstream connections accepted.
    tot_upstream_conns,
    /// Commands parsed off upstream sockets.
    tot_upstream_cmds,
    /// Upstream protocol errors (connection closed after CLIENT_ERROR).
    tot_upstream_protocol_errors,
    /// Downstream sockets opened.
    tot_downstream_connect,
    /// Downstream connect attempts that failed.
    tot_downstream_connect_failed,
    /// Connect attempts suppressed by the blacklist.
    tot_downstream_blacklisted,
    /// Downstream sockets handed to requests (pool hits + fresh connects).
    tot_downstream_acquired,
    /// Downstream sockets returned to the idle pool.
    tot_downstream_released,
    /// Downstream sockets closed instead of pooled.
    tot_downstream_closed,
    /// Reply deadlines that fired.
    tot_downstream_timeouts,
    /// Requests that timed out waiting on a per-identity socket slot.
    tot_downstream_conn_queue_timeouts,
    /// Upstreams expired off the worker wait queue.
    tot_wait_queue_timeouts,
    /// Command retries (dead socket or NOT_MY_VBUCKET).
    tot_retries,
    /// Retries caused specifically by NOT_MY_VBUCKET.
    tot_retries_not_my_vbucket,
    /// SASL PLAIN handshakes that failed or timed out.
    tot_auth_errors,
    /// SELECT_BUCKET steps that timed out after a successful PLAIN.
    tot_auth_select_bucket_timeouts,
    /// Cluster configs adopted in place (map-only).
    tot_config_stable_updates,
    /// Cluster configs that forced a pool rebuild.
    tot_config_reconfigures,
    /// Published configs rejected by validation.
    stat_config_fails,
    /// Multi-get keys collapsed by de-duplication.
    tot_multiget_keys_deduped,
}

/// Process-wide view over every worker's counter block.
#[derive(Debug, Default, Clone)]
pub struct StatsRegistry {
    workers: Arc<Mutex<Vec<Arc<ProxyStats>>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a counter block for one worker and register it.
    pub fn register_worker(&self) -> Arc<ProxyStats> {
        let stats = Arc::new(ProxyStats::default());
        self.workers.lock().expect("stats registry poisoned").push(Arc::clone(&stats));
        stats
    }

    /// Sum all worker blocks into one table, preserving wire order.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let workers = self.workers.lock().expect("stats registry poisoned");
        let mut totals: Vec<(&'static str, u64)> = Vec::new();
        for worker in workers.iter() {
            for (i, (name, value)) in worker.entries().into_iter().enumerate() {
                match totals.get_mut(i) {
                    Some((_, total)) => *total += value,
                    None => totals.push((name, value)),
                }
            }
        }
        totals
    }

    /// Render the `stats proxy` ASCII response body.
    pub fn render_ascii(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024);
        let mut num = itoa::Buffer::new();
        for (name, value) in self.snapshot() {
            out.extend_from_slice(b"STAT ");
            out.extend_from_slice(name.as_bytes());
            out.push(b' ');
            out.extend_from_slice(num.format(value).as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"END\r\n");
        out
    }
}
