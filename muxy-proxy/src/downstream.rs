//! The proxy-to-backend connection driver: connect (with SASL PLAIN and
//! SELECT_BUCKET for binary buckets), request writes, and response
//! frame reads for both wire protocols.

use crate::io::BufferedStream;
use crate::pool::PoolConn;
use monoio::net::TcpStream;
use muxy_core::error::status;
use muxy_core::{Behavior, MuxyError, ServerSpec};
use muxy_protocol::binary::{BinHeader, BinPacket, HEADER_LEN, OPAQUE_IGNORE_REPLY};
use std::net::SocketAddr;
use std::time::Duration;

/// Resolve an `addr` string (e.g. `"cache1:11211"`) to `SocketAddr`s.
///
/// Resolution goes through std's blocking `ToSocketAddrs`; acceptable
/// because it only runs on a fresh connect (pool miss or post-failure),
/// never on the pooled steady state. Candidates are sorted IPv4-first:
/// `localhost` commonly resolves to `::1` before `127.0.0.1`, and most
/// backends listen on IPv4 only.
fn resolve_addrs(addr: &str) -> Vec<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return vec![sa];
    }
    use std::net::ToSocketAddrs;
    let all: Vec<SocketAddr> = match addr.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => return vec![],
    };
    let mut v4: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv4()).collect();
    let v6: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv6()).collect();
    v4.extend(v6);
    v4
}

/// One socket to one backend server.
pub struct DownstreamConn {
    io: BufferedStream,
    identity: String,
    scrubbed: String,
    server_index: usize,
    epoch: u64,
    /// True while no response is pending or partially consumed.
    clean: bool,
}

impl DownstreamConn {
    /// Open, and for binary buckets authenticate, a new backend socket.
    ///
    /// The SASL PLAIN step and the SELECT_BUCKET step each run under
    /// `auth_timeout`; `NOT_SUPPORTED` from either is success (the
    /// backend predates the feature).
    pub async fn connect(
        server: &ServerSpec,
        behavior: &Behavior,
        bucket: Option<&str>,
        ascii: bool,
        server_index: usize,
        epoch: u64,
    ) -> Result<Self, MuxyError> {
        let address = server.address();
        let scrubbed = server.scrubbed_identity();
        let candidates = resolve_addrs(&address);
        if candidates.is_empty() {
            tracing::warn!(addr = %address, "Downstream address resolve failed");
            return Err(MuxyError::DownstreamWrite(scrubbed));
        }

        let connect_timeout = Duration::from_millis(behavior.connect_timeout_ms.max(1));
        let mut stream: Option<TcpStream> = None;
        for sa in &candidates {
            match monoio::time::timeout(connect_timeout, TcpStream::connect(*sa)).await {
                Ok(Ok(s)) => {
                    let _ = s.set_nodelay(true);
                    tracing::debug!(addr = %address, resolved = %sa, "Downstream connected");
                    stream = Some(s);
                    break;
                }
                Ok(Err(e)) => {
                    tracing::debug!(addr = %address, resolved = %sa, error = %e, "Downstream candidate failed, trying next");
                }
                Err(_) => {
                    tracing::debug!(addr = %address, resolved = %sa, "Downstream connect timed out, trying next");
                }
            }
        }
        let Some(stream) = stream else {
            tracing::warn!(addr = %address, tried = candidates.len(), "Downstream connect failed on all candidates");
            return Err(MuxyError::DownstreamWrite(scrubbed));
        };

        let mut conn = Self {
            io: BufferedStream::new(stream),
            identity: server.host_identity(ascii),
            scrubbed,
            server_index,
            epoch,
            clean: true,
        };

        if !ascii {
            conn.authenticate(server, behavior, bucket).await?;
        }
        Ok(conn)
    }

    async fn authenticate(
        &mut self,
        server: &ServerSpec,
        behavior: &Behavior,
        bucket: Option<&str>,
    ) -> Result<(), MuxyError> {
        let auth_timeout = Duration::from_millis(behavior.auth_timeout_ms.max(1));

        if let Some(usr) = &server.usr {
            let frame = BinPacket::sasl_plain_auth(usr, server.pwd.as_deref().unwrap_or(""));
            self.write_frame(frame.to_bytes(), true).await?;
            let reply = match monoio::time::timeout(auth_timeout, self.read_packet()).await {
                Ok(r) => r?,
                Err(_) => {
                    tracing::warn!(identity = %self.scrubbed, "SASL PLAIN timed out");
                    return Err(MuxyError::AuthError);
                }
            };
            self.clean = true;
            match reply.status() {
                status::SUCCESS | status::NOT_SUPPORTED => {}
                other => {
                    tracing::warn!(identity = %self.scrubbed, status = other, "SASL PLAIN refused");
                    return Err(MuxyError::AuthError);
                }
            }
        }

        if let Some(name) = bucket {
            self.write_frame(BinPacket::select_bucket(name).to_bytes(), true).await?;
            let reply = match monoio::time::timeout(auth_timeout, self.read_packet()).await {
                Ok(r) => r?,
                Err(_) => {
                    tracing::warn!(identity = %self.scrubbed, bucket = name, "SELECT_BUCKET timed out");
                    return Err(MuxyError::SelectBucketTimeout);
                }
            };
            self.clean = true;
            match reply.status() {
                status::SUCCESS | status::NOT_SUPPORTED => {}
                other => {
                    tracing::warn!(identity = %self.scrubbed, bucket = name, status = other, "SELECT_BUCKET refused");
                    return Err(MuxyError::AuthError);
                }
            }
        }
        Ok(())
    }

    pub fn scrubbed(&self) -> &str {
        &self.scrubbed
    }

    pub fn server_index(&self) -> usize {
        self.server_index
    }

    /// Bytes of a reply already sitting in the parse buffer. Decides
    /// whether a mid-flight close is retryable.
    pub fn reply_started(&self) -> bool {
        self.io.has_buffered()
    }

    /// The request engine marks the connection clean once it has
    /// consumed a full response; only clean sockets go back to the pool.
    pub fn mark_clean(&mut self) {
        self.clean = true;
    }

    /// Write one encoded request. `expects_reply` dirties the socket
    /// until the engine has read the response back out.
    pub async fn write_frame(&mut self, data: Vec<u8>, expects_reply: bool) -> Result<(), MuxyError> {
        if expects_reply {
            self.clean = false;
        }
        self.io
            .write_all(data)
            .await
            .map_err(|_| MuxyError::DownstreamWrite(self.scrubbed.clone()))
    }

    /// Read one ASCII response line (stripped). A close mid-line or
    /// before the line is a downstream error, never a clean end.
    pub async fn read_line(&mut self) -> Result<Vec<u8>, MuxyError> {
        match self.io.read_line().await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(MuxyError::DownstreamClosed),
            Err(_) => Err(MuxyError::DownstreamClosed),
        }
    }

    /// Read an exact data chunk (a `VALUE` body plus its `\r\n`).
    pub async fn read_chunk(&mut self, n: usize) -> Result<Vec<u8>, MuxyError> {
        self.io.read_exact(n).await.map_err(|_| MuxyError::DownstreamClosed)
    }

    /// Read one binary response frame, silently dropping stale error
    /// frames that answer quiet commands (recognized by the sentinel
    /// opaque stamped at encode time).
    pub async fn read_packet(&mut self) -> Result<BinPacket, MuxyError> {
        loop {
            let packet = self.read_packet_raw().await?;
            if packet.header.opaque == OPAQUE_IGNORE_REPLY {
                tracing::debug!(
                    identity = %self.scrubbed,
                    opcode = packet.header.opcode,
                    status = packet.status(),
                    "Dropped reply to a quiet command"
                );
                continue;
            }
            return Ok(packet);
        }
    }

    async fn read_packet_raw(&mut self) -> Result<BinPacket, MuxyError> {
        if !self.io.fill_to(HEADER_LEN).await.map_err(MuxyError::Io)? {
            return Err(MuxyError::DownstreamClosed);
        }
        let header = BinHeader::expect_response(self.io.buffered())
            .map_err(|e| MuxyError::Internal(format!("downstream framing: {e}")))?;
        let total = HEADER_LEN + header.body_len as usize;
        if !self.io.fill_to(total).await.map_err(MuxyError::Io)? {
            return Err(MuxyError::DownstreamClosed);
        }
        let frame = self.io.read_exact(total).await.map_err(|_| MuxyError::DownstreamClosed)?;
        BinPacket::from_body(header, &frame[HEADER_LEN..])
            .map_err(|e| MuxyError::Internal(format!("downstream framing: {e}")))
    }
}

impl PoolConn for DownstreamConn {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn config_epoch(&self) -> u64 {
        self.epoch
    }

    fn is_clean(&self) -> bool {
        // leftover buffered bytes would leak into the next request's
        // response stream
        self.clean && !self.io.has_buffered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_ip_literal_skips_dns() {
        let addrs = resolve_addrs("127.0.0.1:11211");
        assert_eq!(addrs, vec!["127.0.0.1:11211".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn resolve_sorts_ipv4_first() {
        let addrs = resolve_addrs("localhost:11211");
        if addrs.len() > 1 {
            assert!(addrs[0].is_ipv4(), "IPv4 candidates must come first");
        }
    }

    #[test]
    fn resolve_garbage_is_empty() {
        assert!(resolve_addrs("no-such-host.invalid.:0:0").is_empty());
    }
}
