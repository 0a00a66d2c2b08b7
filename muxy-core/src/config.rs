use crate::behavior::Behavior;
use crate::error::MuxyError;
use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Environment variables honored for downstream SASL credentials.
pub const ENV_SASL_USR: &str = "MOXI_SASL_PLAIN_USR";
pub const ENV_SASL_PWD: &str = "MOXI_SASL_PLAIN_PWD";

/// Top-level configuration for the Muxy proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxyConfig {
    /// Proxy node ID (auto-generated if not set)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Number of worker threads (0 = one per core)
    #[serde(default)]
    pub workers: usize,

    /// Last-known-good cluster JSON, rewritten atomically on every
    /// accepted config. Lets a restart survive a REST outage.
    #[serde(default)]
    pub save_path: Option<PathBuf>,

    /// REST polling settings (used by buckets with a `url`).
    #[serde(default)]
    pub rest: RestConfig,

    /// Buckets served by this proxy. Each gets its own listen port,
    /// cluster, credentials, and behavior overrides.
    #[serde(default)]
    pub buckets: Vec<BucketConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Seconds between config polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Per-request timeout (milliseconds).
    #[serde(default = "default_rest_timeout")]
    pub timeout_ms: u64,
}

/// One proxied bucket: a listen port bound to one backend cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    #[serde(default = "default_bucket_name")]
    pub name: String,

    /// Upstream listener address.
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,

    /// Inline ketama server list: `host:port[:weight];…`
    #[serde(default)]
    pub servers: Option<String>,

    /// REST endpoint serving the vbucket cluster JSON.
    #[serde(default)]
    pub url: Option<String>,

    /// Downstream SASL user/password overrides. Environment variables
    /// win over these; these win over cluster-document credentials.
    #[serde(default)]
    pub usr: Option<String>,
    #[serde(default)]
    pub pwd: Option<String>,

    #[serde(default)]
    pub behavior: Behavior,
}

impl MuxyConfig {
    /// Load configuration from a YAML file plus `MUXY_` environment
    /// overrides (`MUXY_WORKERS`, `MUXY_REST__POLL_INTERVAL_SECS`, …).
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["muxy.yaml", "/etc/muxy/muxy.yaml", "config/muxy.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("MUXY_").split("__"));

        let mut config: Self = figment.extract()?;
        config.apply_env_credentials();
        Ok(config)
    }

    /// Parse the single-string bootstrap form: comma-separated
    /// `key=value` pairs describing one bucket.
    ///
    /// Recognized keys: `url`, `servers` (semicolon-separated list),
    /// `port_listen`, `bucket`, `usr`, `pwd`, `save_path`, and every
    /// behavior tunable by its field name (`downstream_max=8`, …).
    pub fn from_kv_string(spec: &str) -> Result<Self, MuxyError> {
        let mut bucket = BucketConfig::default();
        let mut save_path = None;
        let mut extra_servers: Vec<String> = Vec::new();

        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let Some((key, value)) = token.split_once('=') else {
                // bare host:port tokens accumulate into the server list
                extra_servers.push(token.to_string());
                continue;
            };
            match key {
                "url" => bucket.url = Some(value.to_string()),
                "servers" => {
                    extra_servers.extend(value.split(';').map(|s| s.trim().to_string()));
                }
                "port_listen" => {
                    let port: u16 = value
                        .parse()
                        .map_err(|_| MuxyError::Config(format!("unparsable port {value:?}")))?;
                    bucket.listen = SocketAddr::new(bucket.listen.ip(), port);
                }
                "bucket" => bucket.name = value.to_string(),
                "usr" => bucket.usr = Some(value.to_string()),
                "pwd" => bucket.pwd = Some(value.to_string()),
                "save_path" => save_path = Some(PathBuf::from(value)),
                _ => {
                    apply_behavior_kv(&mut bucket.behavior, key, value)?;
                }
            }
        }

        if !extra_servers.is_empty() {
            bucket.servers = Some(extra_servers.join(";"));
        }
        if bucket.servers.is_none() && bucket.url.is_none() {
            return Err(MuxyError::Config("config needs url= or a server list".into()));
        }

        let mut config = Self {
            node_id: default_node_id(),
            workers: 0,
            save_path,
            rest: RestConfig::default(),
            buckets: vec![bucket],
        };
        config.apply_env_credentials();
        Ok(config)
    }

    /// Fold `MOXI_SASL_PLAIN_USR` / `MOXI_SASL_PLAIN_PWD` into every
    /// bucket that does not set credentials explicitly.
    pub fn apply_env_credentials(&mut self) {
        let usr = std::env::var(ENV_SASL_USR).ok().filter(|v| !v.is_empty());
        let pwd = std::env::var(ENV_SASL_PWD).ok().filter(|v| !v.is_empty());
        for bucket in &mut self.buckets {
            if bucket.usr.is_none() {
                bucket.usr = usr.clone();
            }
            if bucket.pwd.is_none() {
                bucket.pwd = pwd.clone();
            }
        }
    }

    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }
}

fn apply_behavior_kv(behavior: &mut Behavior, key: &str, value: &str) -> Result<(), MuxyError> {
    fn num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, MuxyError> {
        value.parse().map_err(|_| MuxyError::Config(format!("bad value {value:?} for {key}")))
    }
    match key {
        "cycle" => behavior.cycle_ms = num(key, value)?,
        "downstream_max" => behavior.downstream_max = num(key, value)?,
        "downstream_conn_max" => behavior.downstream_conn_max = num(key, value)?,
        "connect_timeout" => behavior.connect_timeout_ms = num(key, value)?,
        "auth_timeout" => behavior.auth_timeout_ms = num(key, value)?,
        "downstream_timeout" => behavior.downstream_timeout_ms = num(key, value)?,
        "downstream_conn_queue_timeout" => {
            behavior.downstream_conn_queue_timeout_ms = num(key, value)?
        }
        "wait_queue_timeout" => behavior.wait_queue_timeout_ms = num(key, value)?,
        "connect_max_errors" => behavior.connect_max_errors = num(key, value)?,
        "connect_retry_interval" => behavior.connect_retry_interval_ms = num(key, value)?,
        "downstream_protocol" => {
            behavior.downstream_protocol = match value {
                "ascii" => crate::behavior::DownstreamProtocol::Ascii,
                "binary" => crate::behavior::DownstreamProtocol::Binary,
                _ => return Err(MuxyError::Config(format!("bad downstream_protocol {value:?}"))),
            }
        }
        "upstream_protocol" => {
            behavior.upstream_protocol = match value {
                "auto" => crate::behavior::UpstreamProtocol::Auto,
                "ascii" => crate::behavior::UpstreamProtocol::Ascii,
                "binary" => crate::behavior::UpstreamProtocol::Binary,
                _ => return Err(MuxyError::Config(format!("bad upstream_protocol {value:?}"))),
            }
        }
        "multiget_squash" => behavior.multiget_squash = num::<u8>(key, value)? != 0,
        _ => return Err(MuxyError::Config(format!("unknown option {key:?}"))),
    }
    Ok(())
}

// Default implementations

impl Default for MuxyConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            workers: 0,
            save_path: None,
            rest: RestConfig::default(),
            buckets: vec![BucketConfig::default()],
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self { poll_interval_secs: default_poll_interval(), timeout_ms: default_rest_timeout() }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            name: default_bucket_name(),
            listen: default_listen_addr(),
            servers: None,
            url: None,
            usr: None,
            pwd: None,
            behavior: Behavior::default(),
        }
    }
}

// Serde default functions

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_bucket_name() -> String {
    "default".to_string()
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:11211".parse().unwrap()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_rest_timeout() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = MuxyConfig::default();
        assert_eq!(cfg.buckets.len(), 1);
        assert_eq!(cfg.buckets[0].listen.port(), 11211);
        assert_eq!(cfg.buckets[0].name, "default");
    }

    #[test]
    fn test_kv_string_url() {
        let cfg = MuxyConfig::from_kv_string("url=http://127.0.0.1:8091/pools,port_listen=11411")
            .unwrap();
        assert_eq!(cfg.buckets[0].url.as_deref(), Some("http://127.0.0.1:8091/pools"));
        assert_eq!(cfg.buckets[0].listen.port(), 11411);
    }

    #[test]
    fn test_kv_string_servers_and_tunables() {
        let cfg = MuxyConfig::from_kv_string(
            "servers=a:11211;b:11212,downstream_max=8,downstream_conn_max=1,cycle=100",
        )
        .unwrap();
        let b = &cfg.buckets[0];
        assert_eq!(b.servers.as_deref(), Some("a:11211;b:11212"));
        assert_eq!(b.behavior.downstream_max, 8);
        assert_eq!(b.behavior.downstream_conn_max, 1);
        assert_eq!(b.behavior.cycle_ms, 100);
    }

    #[test]
    fn test_kv_string_bare_server_tokens() {
        let cfg = MuxyConfig::from_kv_string("a:11211,b:11212,port_listen=11311").unwrap();
        assert_eq!(cfg.buckets[0].servers.as_deref(), Some("a:11211;b:11212"));
    }

    #[test]
    fn test_kv_string_requires_cluster() {
        assert!(matches!(
            MuxyConfig::from_kv_string("downstream_max=8"),
            Err(MuxyError::Config(_))
        ));
    }

    #[test]
    fn test_kv_string_rejects_unknown_key() {
        assert!(MuxyConfig::from_kv_string("servers=a:1,bogus_key=1").is_err());
    }

    #[test]
    fn test_kv_string_rejects_bad_port() {
        assert!(matches!(
            MuxyConfig::from_kv_string("servers=a:1,port_listen=notaport"),
            Err(MuxyError::Config(_))
        ));
    }

    #[test]
    fn test_kv_string_protocols() {
        let cfg = MuxyConfig::from_kv_string(
            "servers=a:11211,downstream_protocol=binary,upstream_protocol=ascii",
        )
        .unwrap();
        let b = &cfg.buckets[0].behavior;
        assert_eq!(b.downstream_protocol, crate::behavior::DownstreamProtocol::Binary);
        assert_eq!(b.upstream_protocol, crate::behavior::UpstreamProtocol::Ascii);
    }
}
