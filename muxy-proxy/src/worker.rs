//! Worker threads and per-worker state.
//!
//! One monoio runtime per thread; every worker accepts on every bucket's
//! listen port (SO_REUSEPORT spreads the load). All mutable per-worker
//! state — the router, the downstream pools, the request-slot gate —
//! lives in a `RefCell` behind an `Rc`, touched only from that thread.

use crate::downstream::DownstreamConn;
use crate::pool::{DownstreamPools, PoolTuning};
use crate::request::ValueFrame;
use arc_swap::ArcSwap;
use futures::channel::oneshot;
use muxy_core::cluster::BackendKind;
use muxy_core::config::MuxyConfig;
use muxy_core::route::RouteTarget;
use muxy_core::{Behavior, ClusterConfig, MuxyError, Router};
use muxy_observability::{ProxyStats, StatsRegistry};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info, warn};

/// Per-bucket shared state: the listen address, the static behavior,
/// and the hot-swapped cluster config.
///
/// The `ArcSwap` is the config broadcast: the main thread publishes a
/// new immutable `ClusterConfig`, workers notice the version change at
/// their next accept or command and adopt it.
pub struct BucketShared {
    pub name: String,
    pub listen: SocketAddr,
    pub behavior: Behavior,
    pub cluster: ArcSwap<ClusterConfig>,
}

/// Shared state across all worker threads.
pub struct SharedState {
    pub config: Arc<MuxyConfig>,
    pub buckets: Vec<Arc<BucketShared>>,
    pub stats: StatsRegistry,
}

impl SharedState {
    /// `clusters[i]` is the initial cluster for `config.buckets[i]`.
    pub fn new(config: MuxyConfig, clusters: Vec<ClusterConfig>) -> Arc<Self> {
        let buckets = config
            .buckets
            .iter()
            .zip(clusters)
            .map(|(bucket, cluster)| {
                Arc::new(BucketShared {
                    name: bucket.name.clone(),
                    listen: bucket.listen,
                    behavior: bucket.behavior.clone(),
                    cluster: ArcSwap::new(Arc::new(cluster)),
                })
            })
            .collect();
        Arc::new(Self { config: Arc::new(config), buckets, stats: StatsRegistry::new() })
    }
}

struct WorkerState {
    cluster: Arc<ClusterConfig>,
    router: Router,
    pools: DownstreamPools<DownstreamConn>,
    /// Version of the last full reconfigure. Requests stamp this on the
    /// sockets they open; a mismatch at release time closes the socket.
    epoch: u64,
    active_requests: u32,
    slot_waiters: VecDeque<oneshot::Sender<()>>,
    /// Multi-get squashing registry: keys with a fetch in flight, each
    /// with the subscribers waiting to share the result. Only consulted
    /// when squashing is allowed for this bucket.
    inflight_gets: HashMap<Vec<u8>, Vec<oneshot::Sender<Option<ValueFrame>>>>,
}

/// One worker's view of one bucket.
pub struct WorkerCtx {
    pub worker_id: usize,
    pub shared: Arc<SharedState>,
    pub bucket: Arc<BucketShared>,
    pub stats: Arc<ProxyStats>,
    state: RefCell<WorkerState>,
}

impl WorkerCtx {
    pub fn new(
        worker_id: usize,
        shared: Arc<SharedState>,
        bucket: Arc<BucketShared>,
        stats: Arc<ProxyStats>,
    ) -> Result<Rc<Self>, MuxyError> {
        let cluster = bucket.cluster.load_full();
        let router = Router::from_config(&cluster)?;
        let tuning = PoolTuning {
            conn_max: bucket.behavior.downstream_conn_max,
            connect_max_errors: bucket.behavior.connect_max_errors,
            retry_interval: Duration::from_millis(bucket.behavior.connect_retry_interval_ms),
        };
        let epoch = cluster.version;
        Ok(Rc::new(Self {
            worker_id,
            shared,
            bucket,
            stats,
            state: RefCell::new(WorkerState {
                router,
                pools: DownstreamPools::new(tuning, epoch),
                epoch,
                cluster,
                active_requests: 0,
                slot_waiters: VecDeque::new(),
                inflight_gets: HashMap::new(),
            }),
        }))
    }

    /// Adopt a newly published cluster config, if any. Map-only changes
    /// swap the router in place and keep every pooled socket; anything
    /// else rebuilds the router and resets the pools (in-flight
    /// requests keep their old epoch and their sockets close on
    /// release). A config that fails validation is ignored: the worker
    /// keeps serving with what it has.
    pub fn maybe_adopt(&self) {
        let current = self.bucket.cluster.load_full();
        let mut guard = self.state.borrow_mut();
        let st = &mut *guard;
        if current.version == st.cluster.version {
            return;
        }
        if st.router.stable_update(&st.cluster, &current) {
            info!(bucket = %self.bucket.name, version = current.version, "Cluster map updated in place");
            st.cluster = current;
            self.stats.tot_config_stable_updates.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match Router::from_config(&current) {
            Ok(router) => {
                info!(
                    bucket = %self.bucket.name,
                    version = current.version,
                    servers = current.servers.len(),
                    "Cluster reconfigured"
                );
                st.router = router;
                st.epoch = current.version;
                st.pools.reset(current.version);
                st.cluster = current;
                self.stats.tot_config_reconfigures.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(bucket = %self.bucket.name, error = %e, "Rejected published cluster config");
                self.stats.stat_config_fails.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn cluster(&self) -> Arc<ClusterConfig> {
        self.state.borrow().cluster.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.state.borrow().epoch
    }

    pub fn servers_len(&self) -> usize {
        self.state.borrow().cluster.servers.len()
    }

    pub fn route(&self, key: &[u8]) -> Result<RouteTarget, MuxyError> {
        self.state.borrow().router.route(key)
    }

    pub fn mark_bad_master(&self, vbucket: u16, old_master: usize) -> bool {
        self.state.borrow_mut().router.mark_bad_master(vbucket, old_master)
    }

    /// Brief, non-await access to the pools.
    pub fn with_pools<R>(&self, f: impl FnOnce(&mut DownstreamPools<DownstreamConn>) -> R) -> R {
        f(&mut self.state.borrow_mut().pools)
    }

    // ── Multi-get squashing (cross-client) ────────────────────────

    /// Squashing collapses identical in-flight gets from different
    /// clients onto one backend fetch. It must be asked for, and it is
    /// refused outright for vbucket-routed buckets: a NOT_MY_VBUCKET
    /// retry retargets individual keys per request, which a shared
    /// fetch cannot honor.
    pub fn multiget_squash_allowed(&self) -> bool {
        self.bucket.behavior.multiget_squash
            && self.state.borrow().cluster.kind == BackendKind::Ketama
    }

    /// Join an in-flight fetch for `key`, or claim ownership of it.
    /// `Some(rx)` means another request is already fetching and will
    /// publish the result; `None` means the caller now owns the fetch
    /// and must call [`publish_inflight_gets`] for it, on every path.
    ///
    /// [`publish_inflight_gets`]: WorkerCtx::publish_inflight_gets
    pub(crate) fn subscribe_inflight_get(
        &self,
        key: &[u8],
    ) -> Option<oneshot::Receiver<Option<ValueFrame>>> {
        let mut st = self.state.borrow_mut();
        match st.inflight_gets.get_mut(key) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            }
            None => {
                st.inflight_gets.insert(key.to_vec(), Vec::new());
                None
            }
        }
    }

    /// Resolve owned fetches: fan the gathered frames (or the miss/
    /// error, as `None`) out to every subscriber and clear the entries.
    pub(crate) fn publish_inflight_gets(
        &self,
        keys: &[Vec<u8>],
        results: Option<&HashMap<Vec<u8>, ValueFrame>>,
    ) {
        let mut st = self.state.borrow_mut();
        for key in keys {
            let Some(waiters) = st.inflight_gets.remove(key) else { continue };
            for tx in waiters {
                let _ = tx.send(results.and_then(|r| r.get(key).cloned()));
            }
        }
    }

    // ── Request-slot gate (downstream_max + wait queue) ───────────

    /// Claim a request slot, parking on the worker wait queue when
    /// `downstream_max` is saturated. Waiting longer than
    /// `wait_queue_timeout` fails the command with the wait-queue
    /// error; a zero timeout fails saturated requests immediately.
    pub async fn admit(self: &Rc<Self>) -> Result<SlotGuard, MuxyError> {
        let downstream_max = self.bucket.behavior.downstream_max;
        let waiter = {
            let mut st = self.state.borrow_mut();
            if downstream_max == 0 || st.active_requests < downstream_max {
                st.active_requests += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                st.slot_waiters.push_back(tx);
                Some(rx)
            }
        };
        let Some(mut rx) = waiter else {
            return Ok(SlotGuard { ctx: Rc::clone(self) });
        };

        let timeout_ms = self.bucket.behavior.clamp_to_cycle(self.bucket.behavior.wait_queue_timeout_ms);
        if timeout_ms == 0 {
            return Err(MuxyError::OutOfDownstreams);
        }
        match monoio::time::timeout(Duration::from_millis(timeout_ms), &mut rx).await {
            Ok(Ok(())) => Ok(SlotGuard { ctx: Rc::clone(self) }),
            Ok(Err(_canceled)) => Err(MuxyError::OutOfDownstreams),
            Err(_elapsed) => {
                // a slot may have been handed over in the same tick the
                // timer fired; pass it on rather than leak it
                if let Ok(Some(())) = rx.try_recv() {
                    self.release_slot();
                }
                self.stats.tot_wait_queue_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(MuxyError::WaitQueueTimeout)
            }
        }
    }

    fn release_slot(&self) {
        let mut st = self.state.borrow_mut();
        while let Some(tx) = st.slot_waiters.pop_front() {
            if tx.send(()).is_ok() {
                // slot handed to the oldest live waiter
                return;
            }
        }
        st.active_requests = st.active_requests.saturating_sub(1);
    }

    pub fn active_requests(&self) -> u32 {
        self.state.borrow().active_requests
    }
}

/// RAII request slot; dropping re-drives the wait queue.
pub struct SlotGuard {
    ctx: Rc<WorkerCtx>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.ctx.release_slot();
    }
}

/// Spawn the worker threads — one monoio runtime per thread, every
/// bucket's listener bound in each (SO_REUSEPORT).
pub fn spawn_workers(shared: Arc<SharedState>, num_workers: usize) -> Vec<std::thread::JoinHandle<()>> {
    let mut handles = Vec::with_capacity(num_workers);
    for worker_id in 0..num_workers {
        let shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("muxy-worker-{worker_id}"))
            .spawn(move || {
                let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_all()
                    .build()
                    .expect("Failed to build monoio runtime");
                rt.block_on(worker_main(worker_id, shared));
            })
            .expect("Failed to spawn worker thread");
        handles.push(handle);
    }
    info!(workers = num_workers, "Workers spawned");
    handles
}

async fn worker_main(worker_id: usize, shared: Arc<SharedState>) {
    let stats = shared.stats.register_worker();
    let mut accept_loops = Vec::with_capacity(shared.buckets.len());

    for bucket in &shared.buckets {
        let ctx = match WorkerCtx::new(worker_id, Arc::clone(&shared), Arc::clone(bucket), Arc::clone(&stats)) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(worker = worker_id, bucket = %bucket.name, error = %e, "Worker bucket setup failed");
                continue;
            }
        };
        let listener = match monoio::net::TcpListener::bind(bucket.listen) {
            Ok(l) => l,
            Err(e) => {
                error!(worker = worker_id, addr = %bucket.listen, error = %e, "Worker bind failed");
                continue;
            }
        };
        info!(worker = worker_id, bucket = %bucket.name, addr = %bucket.listen, "Worker listening");
        accept_loops.push(accept_loop(ctx, listener));
    }

    futures::future::join_all(accept_loops).await;
}

async fn accept_loop(ctx: Rc<WorkerCtx>, listener: monoio::net::TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                ctx.maybe_adopt();
                ctx.stats.tot_upstream_conns.fetch_add(1, Ordering::Relaxed);
                let ctx = Rc::clone(&ctx);
                monoio::spawn(async move {
                    if let Err(e) = crate::upstream::serve_upstream(stream, peer, ctx).await {
                        tracing::debug!(error = %e, "Client connection closed");
                    }
                });
            }
            Err(e) => {
                error!(worker = ctx.worker_id, error = %e, "Accept error");
            }
        }
    }
}
