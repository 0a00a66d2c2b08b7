use async_trait::async_trait;
use muxy_core::ClusterConfig;
use std::time::Duration;
use tracing::{debug, warn};

/// Anything that can produce a cluster layout. The REST poller is the
/// production source; tests and bootstrap use parsed strings and saved
/// files directly.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<ClusterConfig>;
}

/// Thin HTTP poller for a vBucketServerMap JSON endpoint.
pub struct RestSource {
    url: String,
    client: reqwest::Client,
}

impl RestSource {
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build()?;
        Ok(Self { url: url.into(), client })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One-shot fetch for bootstrap, before any runtime exists.
    pub fn fetch_blocking(&self) -> anyhow::Result<ClusterConfig> {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        rt.block_on(self.fetch())
    }
}

#[async_trait]
impl ConfigSource for RestSource {
    async fn fetch(&self) -> anyhow::Result<ClusterConfig> {
        let response = self.client.get(&self.url).send().await?.error_for_status()?;
        let body = response.text().await?;
        Ok(ClusterConfig::parse_vbucket_json(&body)?)
    }
}

/// Run a REST source on a dedicated thread (its own current-thread
/// tokio runtime — the data plane stays monoio-only) and push every
/// successfully parsed config into `tx`. The receiver stamps versions
/// and publishes; this loop never does.
///
/// Fetch failures are logged and retried at the next tick; the proxy
/// keeps serving with whatever config it has.
pub fn spawn_rest_poller(
    bucket: String,
    source: RestSource,
    poll_interval: Duration,
    tx: crossbeam_channel::Sender<(String, ClusterConfig)>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("muxy-config-{bucket}"))
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Failed to build tokio runtime for config poller");
            rt.block_on(async move {
                loop {
                    match source.fetch().await {
                        Ok(cluster) => {
                            debug!(bucket = %bucket, servers = cluster.servers.len(), "Fetched cluster config");
                            if tx.send((bucket.clone(), cluster)).is_err() {
                                // publisher is gone; we are shutting down
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(bucket = %bucket, url = %source.url(), error = %e, "Cluster config fetch failed");
                        }
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            });
        })
        .expect("Failed to spawn config poller thread")
}
