use thiserror::Error;

/// Unified error type for Muxy.
///
/// Variants that embed a server identity expect the *scrubbed* form
/// (`host:port:usr`, password clipped) — see `ServerSpec::scrubbed_identity`.
/// The raw identity must never reach a log line or an upstream client.
#[derive(Error, Debug)]
pub enum MuxyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Cluster parse error: {0}")]
    ClusterParse(String),

    #[error("proxy write to downstream {0}")]
    DownstreamWrite(String),

    #[error("proxy downstream closed")]
    DownstreamClosed,

    #[error("proxy downstream timeout {0}")]
    DownstreamTimeout(String),

    #[error("proxy wait queue timeout")]
    WaitQueueTimeout,

    #[error("proxy out of downstreams")]
    OutOfDownstreams,

    #[error("a2b auth_error")]
    AuthError,

    #[error("a2b select_bucket_timeout")]
    SelectBucketTimeout,

    #[error("no server for vbucket {0}")]
    NoServer(u16),

    #[error("temporary failure")]
    TemporaryFailure,

    #[error("client protocol error: {0}")]
    Client(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

impl MuxyError {
    /// Render the error as a single upstream ASCII response line.
    ///
    /// Client protocol errors become `CLIENT_ERROR`; everything else is a
    /// `SERVER_ERROR` in the exact wording memcached clients expect.
    pub fn ascii_line(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        match self {
            MuxyError::Client(msg) => {
                out.extend_from_slice(b"CLIENT_ERROR ");
                out.extend_from_slice(msg.as_bytes());
            }
            other => {
                out.extend_from_slice(b"SERVER_ERROR ");
                out.extend_from_slice(other.to_string().as_bytes());
            }
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Map to a binary protocol response status.
    pub fn binary_status(&self) -> u16 {
        match self {
            MuxyError::Client(_) => status::EINVAL,
            MuxyError::WaitQueueTimeout => status::EBUSY,
            MuxyError::OutOfDownstreams => status::ENOMEM,
            MuxyError::AuthError | MuxyError::SelectBucketTimeout => status::AUTH_ERROR,
            MuxyError::TemporaryFailure => status::ETMPFAIL,
            _ => status::EINTERNAL,
        }
    }

    /// True for errors that count against a pool's blacklist counter.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MuxyError::DownstreamWrite(_)
                | MuxyError::DownstreamClosed
                | MuxyError::DownstreamTimeout(_)
                | MuxyError::AuthError
                | MuxyError::SelectBucketTimeout
                | MuxyError::Io(_)
        )
    }
}

/// Binary protocol status codes (the subset the proxy maps to).
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const KEY_ENOENT: u16 = 0x0001;
    pub const KEY_EEXISTS: u16 = 0x0002;
    pub const E2BIG: u16 = 0x0003;
    pub const EINVAL: u16 = 0x0004;
    pub const NOT_STORED: u16 = 0x0005;
    pub const DELTA_BADVAL: u16 = 0x0006;
    pub const NOT_MY_VBUCKET: u16 = 0x0007;
    pub const AUTH_ERROR: u16 = 0x0020;
    pub const AUTH_CONTINUE: u16 = 0x0021;
    pub const UNKNOWN_COMMAND: u16 = 0x0081;
    pub const ENOMEM: u16 = 0x0082;
    pub const NOT_SUPPORTED: u16 = 0x0083;
    pub const EINTERNAL: u16 = 0x0084;
    pub const EBUSY: u16 = 0x0085;
    pub const ETMPFAIL: u16 = 0x0086;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_lines() {
        assert_eq!(
            MuxyError::WaitQueueTimeout.ascii_line(),
            b"SERVER_ERROR proxy wait queue timeout\r\n".to_vec()
        );
        assert_eq!(
            MuxyError::OutOfDownstreams.ascii_line(),
            b"SERVER_ERROR proxy out of downstreams\r\n".to_vec()
        );
        assert_eq!(
            MuxyError::DownstreamClosed.ascii_line(),
            b"SERVER_ERROR proxy downstream closed\r\n".to_vec()
        );
        assert_eq!(
            MuxyError::DownstreamTimeout("a:11211:u".into()).ascii_line(),
            b"SERVER_ERROR proxy downstream timeout a:11211:u\r\n".to_vec()
        );
        assert_eq!(
            MuxyError::DownstreamWrite("a:11211:u".into()).ascii_line(),
            b"SERVER_ERROR proxy write to downstream a:11211:u\r\n".to_vec()
        );
    }

    #[test]
    fn test_client_error_line() {
        let err = MuxyError::Client("bad data chunk".into());
        assert_eq!(err.ascii_line(), b"CLIENT_ERROR bad data chunk\r\n".to_vec());
    }

    #[test]
    fn test_binary_status_mapping() {
        assert_eq!(MuxyError::WaitQueueTimeout.binary_status(), status::EBUSY);
        assert_eq!(MuxyError::OutOfDownstreams.binary_status(), status::ENOMEM);
        assert_eq!(MuxyError::AuthError.binary_status(), status::AUTH_ERROR);
        assert_eq!(MuxyError::Client("x".into()).binary_status(), status::EINVAL);
        assert_eq!(MuxyError::DownstreamClosed.binary_status(), status::EINTERNAL);
    }

    #[test]
    fn test_transient_classification() {
        assert!(MuxyError::DownstreamClosed.is_transient());
        assert!(MuxyError::DownstreamTimeout("x".into()).is_transient());
        assert!(MuxyError::AuthError.is_transient());
        assert!(!MuxyError::WaitQueueTimeout.is_transient());
        assert!(!MuxyError::Client("x".into()).is_transient());
    }
}
