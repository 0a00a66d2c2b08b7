use crate::error::MuxyError;
use serde::{Deserialize, Serialize};

/// One backend memcached server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub host: String,
    pub port: u16,

    /// SASL user for binary downstreams.
    #[serde(default)]
    pub usr: Option<String>,

    /// SASL password for binary downstreams.
    #[serde(default)]
    pub pwd: Option<String>,

    /// Ketama weight.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl ServerSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, usr: None, pwd: None, weight: 1 }
    }

    /// `host:port`, the connect address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The canonical pool key: `host:port:usr:pwd:ascii?`.
    ///
    /// The protocol flag is part of the identity because SASL state makes
    /// a binary socket non-interchangeable with an ASCII one to the same
    /// server.
    pub fn host_identity(&self, ascii: bool) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.host,
            self.port,
            self.usr.as_deref().unwrap_or(""),
            self.pwd.as_deref().unwrap_or(""),
            if ascii { "ascii" } else { "binary" },
        )
    }

    /// Identity with the password clipped: safe for logs and for
    /// `SERVER_ERROR` lines delivered to clients.
    pub fn scrubbed_identity(&self) -> String {
        match &self.usr {
            Some(usr) => format!("{}:{}:{}", self.host, self.port, usr),
            None => self.address(),
        }
    }
}

/// Which routing backend a cluster uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ketama,
    Vbucket,
}

/// The vbucket partition table: `map[vb][0]` is the master server index,
/// the rest are replicas in failover order. `-1` marks an absent server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbucketTable {
    pub count: usize,
    pub map: Vec<Vec<i32>>,
}

/// Immutable, versioned cluster layout handed to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Monotonic publish version, stamped by the publisher.
    #[serde(default)]
    pub version: u64,

    pub kind: BackendKind,

    pub servers: Vec<ServerSpec>,

    /// Bucket name for the downstream SELECT_BUCKET step.
    #[serde(default)]
    pub bucket: Option<String>,

    #[serde(default)]
    pub vbuckets: Option<VbucketTable>,
}

/// The REST/JSON cluster document (vBucketServerMap shape).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VbucketDoc {
    #[serde(default)]
    hash_algorithm: Option<String>,
    #[serde(default)]
    num_replicas: Option<u32>,
    server_list: Vec<String>,
    v_bucket_map: Vec<Vec<i32>>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sasl_password: Option<String>,
}

impl ClusterConfig {
    /// Parse a libmemcached-style `host:port[:weight],…` server list into
    /// a ketama cluster.
    pub fn parse_server_list(list: &str) -> Result<Self, MuxyError> {
        let mut servers = Vec::new();
        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut fields = part.split(':');
            let host = fields
                .next()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| MuxyError::ClusterParse(format!("empty host in {part:?}")))?;
            let port = match fields.next() {
                Some(p) => p
                    .parse::<u16>()
                    .map_err(|_| MuxyError::ClusterParse(format!("bad port in {part:?}")))?,
                None => 11211,
            };
            let weight = match fields.next() {
                Some(w) => w
                    .parse::<u32>()
                    .map_err(|_| MuxyError::ClusterParse(format!("bad weight in {part:?}")))?,
                None => 1,
            };
            servers.push(ServerSpec { host: host.to_string(), port, usr: None, pwd: None, weight });
        }
        if servers.is_empty() {
            return Err(MuxyError::ClusterParse("no servers in list".into()));
        }
        let cfg = Self { version: 0, kind: BackendKind::Ketama, servers, bucket: None, vbuckets: None };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a vBucketServerMap JSON document into a vbucket cluster.
    ///
    /// Bucket credentials (`name`/`saslPassword`) apply to every server:
    /// the cluster authenticates per bucket, not per node.
    pub fn parse_vbucket_json(json: &str) -> Result<Self, MuxyError> {
        let doc: VbucketDoc =
            serde_json::from_str(json).map_err(|e| MuxyError::ClusterParse(e.to_string()))?;

        if let Some(alg) = &doc.hash_algorithm
            && !alg.eq_ignore_ascii_case("crc")
        {
            return Err(MuxyError::ClusterParse(format!("unsupported hash algorithm {alg:?}")));
        }
        let _ = doc.num_replicas;

        let usr = doc.name.clone().filter(|n| !n.is_empty());
        let pwd = doc.sasl_password.clone().filter(|p| !p.is_empty());

        let mut servers = Vec::with_capacity(doc.server_list.len());
        for entry in &doc.server_list {
            let (host, port) = match entry.rsplit_once(':') {
                Some((h, p)) => (
                    h.to_string(),
                    p.parse::<u16>()
                        .map_err(|_| MuxyError::ClusterParse(format!("bad port in {entry:?}")))?,
                ),
                None => (entry.clone(), 11211),
            };
            servers.push(ServerSpec { host, port, usr: usr.clone(), pwd: pwd.clone(), weight: 1 });
        }

        let cfg = Self {
            version: 0,
            kind: BackendKind::Vbucket,
            servers,
            bucket: doc.name,
            vbuckets: Some(VbucketTable { count: doc.v_bucket_map.len(), map: doc.v_bucket_map }),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the structural invariants: non-empty server list, and for
    /// vbucket clusters a power-of-two map (≤ 65536) whose indices all
    /// fall inside the server list (`-1` allowed for absent replicas).
    pub fn validate(&self) -> Result<(), MuxyError> {
        if self.servers.is_empty() {
            return Err(MuxyError::ClusterParse("empty server list".into()));
        }
        match self.kind {
            BackendKind::Ketama => {
                if self.vbuckets.is_some() {
                    return Err(MuxyError::ClusterParse("ketama cluster with a vbucket map".into()));
                }
            }
            BackendKind::Vbucket => {
                let table = self
                    .vbuckets
                    .as_ref()
                    .ok_or_else(|| MuxyError::ClusterParse("vbucket cluster without a map".into()))?;
                if table.count == 0 || table.count > 65536 || !table.count.is_power_of_two() {
                    return Err(MuxyError::ClusterParse(format!(
                        "vbucket count {} is not a power of two ≤ 65536",
                        table.count
                    )));
                }
                if table.map.len() != table.count {
                    return Err(MuxyError::ClusterParse("vbucket map length != count".into()));
                }
                let n = self.servers.len() as i32;
                for (vb, chain) in table.map.iter().enumerate() {
                    if chain.is_empty() {
                        return Err(MuxyError::ClusterParse(format!("vbucket {vb} has no servers")));
                    }
                    for &idx in chain {
                        if idx < -1 || idx >= n {
                            return Err(MuxyError::ClusterParse(format!(
                                "vbucket {vb} references server {idx} out of {n}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// True when `other` differs only in its vbucket map — the condition
    /// for a stable update that preserves live connections.
    pub fn same_servers(&self, other: &ClusterConfig) -> bool {
        self.kind == other.kind && self.bucket == other.bucket && self.servers == other.servers
    }
}
