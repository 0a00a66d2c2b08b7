// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Muxy — memcached-protocol proxy
//
//  Architecture: monoio thread-per-core + shared-nothing data plane
//  Routing:      ketama consistent hash / vbucket map
//  Config:       YAML / kv-string bootstrap, REST poll with
//                last-known-good persistence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use muxy_core::config::{BucketConfig, MuxyConfig};
use muxy_core::{BackendKind, ClusterConfig};
use muxy_proxy::worker::{self, SharedState};
use muxy_store::source::RestSource;
use muxy_store::{persist, spawn_rest_poller};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Global shutdown flag — set by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "muxy", version, about = "Muxy — memcached-protocol proxy")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// One-line bucket config: comma-separated key=value pairs
    /// (url=… or a server list; see docs for the full key set).
    /// Overrides --config when given.
    #[arg(short = 'z', long)]
    cluster: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    muxy_observability::logger::init(&cli.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Muxy starting — monoio thread-per-core engine"
    );

    // ── Config ──
    let config = if let Some(spec) = &cli.cluster {
        MuxyConfig::from_kv_string(spec)?
    } else {
        MuxyConfig::load(cli.config.as_deref().and_then(|p| p.to_str()))?
    };
    if config.buckets.is_empty() {
        anyhow::bail!("no buckets configured");
    }

    let num_workers = config.effective_workers();
    info!(workers = num_workers, buckets = config.buckets.len(), "Worker count");

    // ── Bootstrap one cluster per bucket ──
    let multi_bucket = config.buckets.len() > 1;
    let mut clusters = Vec::with_capacity(config.buckets.len());
    for bucket in &config.buckets {
        let save_path = config
            .save_path
            .as_deref()
            .map(|p| save_path_for(p, &bucket.name, multi_bucket));
        let mut cluster = bootstrap_cluster(bucket, &config, save_path.as_deref())?;
        cluster.version = 1;
        info!(
            bucket = %bucket.name,
            listen = %bucket.listen,
            servers = cluster.servers.len(),
            kind = ?cluster.kind,
            "Bucket ready"
        );
        clusters.push(cluster);
    }

    // ── Listen ports must be bindable before we commit ──
    for bucket in &config.buckets {
        if let Err(e) = std::net::TcpListener::bind(bucket.listen) {
            anyhow::bail!("cannot bind {} for bucket {}: {e}", bucket.listen, bucket.name);
        }
    }

    // ── Shared state + workers ──
    let shared = SharedState::new(config, clusters);
    let worker_handles = worker::spawn_workers(Arc::clone(&shared), num_workers);

    // ── REST pollers, one thread per url-configured bucket ──
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut pollers = 0;
    for bucket in &shared.config.buckets {
        let Some(url) = &bucket.url else { continue };
        let source = RestSource::new(url, shared.config.rest.timeout_ms)?;
        let _poller = spawn_rest_poller(
            bucket.name.clone(),
            source,
            Duration::from_secs(shared.config.rest.poll_interval_secs.max(1)),
            tx.clone(),
        );
        pollers += 1;
    }
    drop(tx);

    info!(workers = num_workers, pollers, "Muxy is ready — serving traffic");

    // ── Graceful shutdown: wait for SIGTERM/SIGINT ──
    setup_signal_handler();

    // ── Publish loop: adopt polled configs until shutdown ──
    let mut versions: HashMap<String, u64> =
        shared.buckets.iter().map(|b| (b.name.clone(), 1)).collect();
    let multi = shared.config.buckets.len() > 1;
    while !SHUTDOWN.load(Ordering::Relaxed) {
        let polled = if pollers > 0 {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(polled) => Some(polled),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    pollers = 0;
                    None
                }
            }
        } else {
            std::thread::sleep(Duration::from_millis(100));
            None
        };
        let Some((name, mut cluster)) = polled else { continue };

        let Some(position) = shared.buckets.iter().position(|b| b.name == name) else {
            continue;
        };
        let bucket_cfg = &shared.config.buckets[position];
        let bucket_shared = &shared.buckets[position];

        apply_bucket_overrides(&mut cluster, bucket_cfg);
        if let Err(e) = cluster.validate() {
            warn!(bucket = %name, error = %e, "Polled cluster config rejected");
            continue;
        }
        if same_layout(&bucket_shared.cluster.load(), &cluster) {
            continue;
        }

        let version = versions.get(&name).copied().unwrap_or(1) + 1;
        versions.insert(name.clone(), version);
        cluster.version = version;

        if let Some(base) = shared.config.save_path.as_deref() {
            persist::save_cluster(&save_path_for(base, &name, multi), &cluster);
        }

        let stable = bucket_shared.cluster.load().same_servers(&cluster);
        info!(
            bucket = %name,
            version,
            servers = cluster.servers.len(),
            stable_update = stable,
            "Publishing cluster config"
        );
        bucket_shared.cluster.store(Arc::new(cluster));
    }

    info!("Shutdown signal received, stopping...");

    // Workers run infinite accept loops; on process exit the OS reclaims
    // their threads and sockets.
    drop(worker_handles);

    info!("Muxy stopped");
    Ok(())
}

/// Build the initial cluster for one bucket: inline server list first,
/// then the REST endpoint, then the last-known-good file.
fn bootstrap_cluster(
    bucket: &BucketConfig,
    config: &MuxyConfig,
    save_path: Option<&Path>,
) -> anyhow::Result<ClusterConfig> {
    if let Some(servers) = &bucket.servers {
        let list = servers.replace(';', ",");
        let mut cluster = ClusterConfig::parse_server_list(&list)?;
        apply_bucket_overrides(&mut cluster, bucket);
        cluster.validate()?;
        return Ok(cluster);
    }

    let Some(url) = &bucket.url else {
        anyhow::bail!("bucket {} has neither a server list nor a url", bucket.name);
    };

    let source = RestSource::new(url, config.rest.timeout_ms)?;
    match source.fetch_blocking() {
        Ok(mut cluster) => {
            apply_bucket_overrides(&mut cluster, bucket);
            cluster.validate()?;
            if let Some(path) = save_path {
                persist::save_cluster(path, &cluster);
            }
            Ok(cluster)
        }
        Err(e) => {
            warn!(bucket = %bucket.name, url = %url, error = %e, "Initial cluster fetch failed");
            if let Some(path) = save_path
                && let Some(mut cluster) = persist::load_cluster(path)
            {
                warn!(bucket = %bucket.name, path = %path.display(), "Using last-known-good cluster");
                apply_bucket_overrides(&mut cluster, bucket);
                return Ok(cluster);
            }
            Err(e.context(format!("no cluster config for bucket {}", bucket.name)))
        }
    }
}

/// Bucket-level credential overrides beat cluster-document credentials;
/// the SELECT_BUCKET name falls back to the SASL user when the document
/// does not carry one.
fn apply_bucket_overrides(cluster: &mut ClusterConfig, bucket: &BucketConfig) {
    if bucket.usr.is_some() || bucket.pwd.is_some() {
        for server in &mut cluster.servers {
            if bucket.usr.is_some() {
                server.usr = bucket.usr.clone();
            }
            if bucket.pwd.is_some() {
                server.pwd = bucket.pwd.clone();
            }
        }
    }
    if cluster.kind == BackendKind::Vbucket && cluster.bucket.is_none() {
        cluster.bucket = bucket.usr.clone();
    }
}

fn same_layout(a: &ClusterConfig, b: &ClusterConfig) -> bool {
    a.kind == b.kind && a.bucket == b.bucket && a.servers == b.servers && a.vbuckets == b.vbuckets
}

fn save_path_for(base: &Path, bucket: &str, multi: bool) -> PathBuf {
    if !multi {
        return base.to_path_buf();
    }
    match base.file_stem().and_then(|s| s.to_str()) {
        Some(stem) => base.with_file_name(format!("{stem}-{bucket}.json")),
        None => base.join(format!("{bucket}.json")),
    }
}

fn setup_signal_handler() {
    // SIGTERM (docker stop) + SIGINT (Ctrl+C)
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
