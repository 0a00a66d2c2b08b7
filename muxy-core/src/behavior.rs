use serde::{Deserialize, Serialize};

/// Wire protocol selection for a bucket's downstream connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownstreamProtocol {
    Ascii,
    Binary,
}

/// Wire protocol accepted on a bucket's listen port.
///
/// `Auto` sniffs the first byte of each new connection: `0x80` means a
/// binary client, anything else is treated as ASCII.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    Auto,
    Ascii,
    Binary,
}

/// Per-bucket tunables for the forwarding engine.
///
/// All timeouts are milliseconds. A zero timeout disables the timer; a
/// zero cap means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Behavior {
    /// Millisecond quantum used to coalesce deadline timers.
    #[serde(default = "default_cycle_ms")]
    pub cycle_ms: u64,

    /// Per-worker cap on concurrently active requests.
    #[serde(default = "default_downstream_max")]
    pub downstream_max: u32,

    /// Per-worker, per-server-identity cap on open downstream sockets.
    /// 0 = unlimited.
    #[serde(default)]
    pub downstream_conn_max: u32,

    /// TCP connect timeout for new downstream sockets.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// SASL PLAIN + SELECT_BUCKET handshake timeout (binary downstreams).
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// Reply deadline for a forwarded request.
    #[serde(default = "default_downstream_timeout_ms")]
    pub downstream_timeout_ms: u64,

    /// How long a request may wait for a pooled socket when the
    /// per-identity cap is reached.
    #[serde(default = "default_conn_queue_timeout_ms")]
    pub downstream_conn_queue_timeout_ms: u64,

    /// How long an upstream may wait for a request slot when
    /// `downstream_max` is saturated.
    #[serde(default = "default_wait_queue_timeout_ms")]
    pub wait_queue_timeout_ms: u64,

    /// Consecutive connect errors before a server identity is
    /// blacklisted. 0 disables blacklisting.
    #[serde(default = "default_connect_max_errors")]
    pub connect_max_errors: u32,

    /// How long a blacklisted identity stays suppressed.
    #[serde(default = "default_connect_retry_interval_ms")]
    pub connect_retry_interval_ms: u64,

    /// Protocol spoken to the backends.
    #[serde(default = "default_downstream_protocol")]
    pub downstream_protocol: DownstreamProtocol,

    /// Protocol accepted from clients.
    #[serde(default = "default_upstream_protocol")]
    pub upstream_protocol: UpstreamProtocol,

    /// Collapse identical in-flight multi-gets from different clients
    /// onto one backend fetch. Refused for vbucket-routed buckets
    /// regardless of this flag: NOT_MY_VBUCKET retargeting needs
    /// per-client key sets to retry correctly.
    #[serde(default)]
    pub multiget_squash: bool,
}

impl Behavior {
    /// Clamp a millisecond deadline down to the cycle quantum so timers
    /// coalesce. Never rounds a nonzero deadline to zero.
    pub fn clamp_to_cycle(&self, ms: u64) -> u64 {
        if self.cycle_ms == 0 || ms == 0 {
            return ms;
        }
        let q = (ms / self.cycle_ms) * self.cycle_ms;
        if q == 0 { self.cycle_ms } else { q }
    }
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            cycle_ms: default_cycle_ms(),
            downstream_max: default_downstream_max(),
            downstream_conn_max: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            downstream_timeout_ms: default_downstream_timeout_ms(),
            downstream_conn_queue_timeout_ms: default_conn_queue_timeout_ms(),
            wait_queue_timeout_ms: default_wait_queue_timeout_ms(),
            connect_max_errors: default_connect_max_errors(),
            connect_retry_interval_ms: default_connect_retry_interval_ms(),
            downstream_protocol: default_downstream_protocol(),
            upstream_protocol: default_upstream_protocol(),
            multiget_squash: false,
        }
    }
}

// Serde default functions

fn default_cycle_ms() -> u64 {
    200
}

fn default_downstream_max() -> u32 {
    1024
}

fn default_connect_timeout_ms() -> u64 {
    400
}

fn default_auth_timeout_ms() -> u64 {
    100
}

fn default_downstream_timeout_ms() -> u64 {
    5000
}

fn default_conn_queue_timeout_ms() -> u64 {
    200
}

fn default_wait_queue_timeout_ms() -> u64 {
    200
}

fn default_connect_max_errors() -> u32 {
    5
}

fn default_connect_retry_interval_ms() -> u64 {
    30_000
}

fn default_downstream_protocol() -> DownstreamProtocol {
    DownstreamProtocol::Ascii
}

fn default_upstream_protocol() -> UpstreamProtocol {
    UpstreamProtocol::Auto
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let b = Behavior::default();
        assert_eq!(b.cycle_ms, 200);
        assert_eq!(b.downstream_conn_max, 0);
        assert_eq!(b.downstream_protocol, DownstreamProtocol::Ascii);
        assert_eq!(b.upstream_protocol, UpstreamProtocol::Auto);
        assert!(!b.multiget_squash);
    }

    #[test]
    fn test_defaults_from_serde() {
        let b: Behavior = serde_json::from_str("{}").unwrap();
        assert_eq!(b, Behavior::default());
    }

    #[test]
    fn test_serde_overrides() {
        let b: Behavior = serde_json::from_str(
            r#"{"downstream_conn_max": 1, "downstream_protocol": "binary"}"#,
        )
        .unwrap();
        assert_eq!(b.downstream_conn_max, 1);
        assert_eq!(b.downstream_protocol, DownstreamProtocol::Binary);
    }

    #[test]
    fn test_clamp_to_cycle() {
        let b = Behavior { cycle_ms: 200, ..Behavior::default() };
        assert_eq!(b.clamp_to_cycle(5000), 5000);
        assert_eq!(b.clamp_to_cycle(4321), 4200);
        // sub-quantum deadlines round up to one quantum, not to zero
        assert_eq!(b.clamp_to_cycle(50), 200);
        // zero stays zero (disabled)
        assert_eq!(b.clamp_to_cycle(0), 0);
    }

    #[test]
    fn test_clamp_with_cycle_disabled() {
        let b = Behavior { cycle_ms: 0, ..Behavior::default() };
        assert_eq!(b.clamp_to_cycle(4321), 4321);
    }
}
