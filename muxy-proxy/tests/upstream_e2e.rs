//! End-to-end tests through `serve_upstream` with real sockets on both
//! sides: protocol sniffing, client protocol errors, the proxy's own
//! stats, and the cross-protocol round trip.

use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::{TcpListener, TcpStream};
use muxy_core::behavior::{Behavior, DownstreamProtocol};
use muxy_core::cluster::ClusterConfig;
use muxy_core::config::MuxyConfig;
use muxy_proxy::upstream::serve_upstream;
use muxy_proxy::worker::{SharedState, WorkerCtx};
use muxy_protocol::binary::{BinPacket, HEADER_LEN, opcode};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

fn run_async<F: std::future::Future>(fut: F) -> F::Output {
    monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
        .enable_timer()
        .build()
        .expect("monoio runtime build failed")
        .block_on(fut)
}

fn make_ctx(cluster: ClusterConfig, behavior: Behavior) -> Rc<WorkerCtx> {
    let mut config = MuxyConfig::default();
    config.buckets[0].behavior = behavior;
    let shared = SharedState::new(config, vec![cluster]);
    let stats = shared.stats.register_worker();
    WorkerCtx::new(0, Arc::clone(&shared), Arc::clone(&shared.buckets[0]), stats)
        .expect("worker ctx")
}

/// Accept loop for the proxy side; serves every accepted client.
fn spawn_proxy(ctx: Rc<WorkerCtx>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("proxy bind");
    let addr = listener.local_addr().expect("proxy addr");
    monoio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else { return };
            let ctx = Rc::clone(&ctx);
            monoio::spawn(async move {
                let _ = serve_upstream(stream, peer, ctx).await;
            });
        }
    });
    addr
}

async fn read_some(client: &mut TcpStream) -> Vec<u8> {
    let (res, buf) = client.read(vec![0u8; 4096]).await;
    let n = res.unwrap_or(0);
    buf[..n].to_vec()
}

async fn send(client: &mut TcpStream, bytes: &[u8]) {
    let (res, _) = client.write_all(bytes.to_vec()).await;
    res.expect("client write");
}

// ── Backend speaking both protocols with one shared store ─────

type Items = Rc<RefCell<HashMap<Vec<u8>, (u32, Vec<u8>)>>>;

fn spawn_store_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("backend bind");
    let addr = listener.local_addr().expect("backend addr");
    let items: Items = Rc::new(RefCell::new(HashMap::new()));
    monoio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            monoio::spawn(serve_store_backend(stream, Rc::clone(&items)));
        }
    });
    addr
}

async fn serve_store_backend(mut stream: TcpStream, items: Items) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        while buf.len() < HEADER_LEN {
            let (res, chunk) = stream.read(vec![0u8; 4096]).await;
            match res {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        while buf.len() < HEADER_LEN + body_len {
            let (res, chunk) = stream.read(vec![0u8; 4096]).await;
            match res {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let frame = buf[..HEADER_LEN + body_len].to_vec();
        buf.drain(..HEADER_LEN + body_len);

        let op = frame[1];
        let key_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
        let ext_len = frame[4] as usize;
        let opaque = u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]);
        let key = frame[HEADER_LEN + ext_len..HEADER_LEN + ext_len + key_len].to_vec();
        let value = frame[HEADER_LEN + ext_len + key_len..].to_vec();

        let reply = match op {
            opcode::SET | opcode::SETQ => {
                let flags = u32::from_be_bytes([frame[24], frame[25], frame[26], frame[27]]);
                items.borrow_mut().insert(key, (flags, value));
                if op == opcode::SETQ {
                    continue;
                }
                BinPacket::response(op, 0, &[], &[], &[]).with_opaque(opaque).to_bytes()
            }
            opcode::GETK | opcode::GETKQ => match items.borrow().get(&key) {
                Some((flags, data)) => {
                    BinPacket::response(op, 0, &flags.to_be_bytes(), &key, data)
                        .with_opaque(opaque)
                        .to_bytes()
                }
                None if op == opcode::GETKQ => continue,
                None => BinPacket::response(op, 0x0001, &[], &[], b"Not found")
                    .with_opaque(opaque)
                    .to_bytes(),
            },
            opcode::NOOP => BinPacket::response(op, 0, &[], &[], &[]).with_opaque(opaque).to_bytes(),
            other => BinPacket::response(other, 0x0081, &[], &[], &[]).with_opaque(opaque).to_bytes(),
        };
        let (res, _) = stream.write_all(reply).await;
        if res.is_err() {
            return;
        }
    }
}

// ── Sniffed ASCII client, miss through a binary downstream ────

#[test]
fn sniffed_ascii_get_miss_answers_end() {
    run_async(async {
        let backend = spawn_store_backend();
        let mut behavior = Behavior::default();
        behavior.downstream_protocol = DownstreamProtocol::Binary;
        let cluster = ClusterConfig::parse_server_list(&backend.to_string()).unwrap();
        let proxy = spawn_proxy(make_ctx(cluster, behavior));

        let mut client = TcpStream::connect(proxy.to_string().as_str()).await.unwrap();
        send(&mut client, b"get absent\r\n").await;
        assert_eq!(read_some(&mut client).await, b"END\r\n".to_vec());
    });
}

// ── R2: binary SET then ASCII get sees the same bytes ─────────

#[test]
fn cross_protocol_set_binary_get_ascii() {
    run_async(async {
        let backend = spawn_store_backend();
        let mut behavior = Behavior::default();
        behavior.downstream_protocol = DownstreamProtocol::Binary;
        let cluster = ClusterConfig::parse_server_list(&backend.to_string()).unwrap();
        let proxy = spawn_proxy(make_ctx(cluster, behavior));

        // binary client stores k with flags 7
        let mut extras = Vec::new();
        extras.extend_from_slice(&7u32.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        let set = BinPacket::request(opcode::SET, 0, &extras, b"k", b"hello").with_opaque(9);
        let mut bin_client = TcpStream::connect(proxy.to_string().as_str()).await.unwrap();
        send(&mut bin_client, &set.to_bytes()).await;
        let reply = read_some(&mut bin_client).await;
        assert_eq!(reply[0], 0x81);
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), 0, "binary SET stored");

        // ascii client reads it back, flags decoded to decimal
        let mut ascii_client = TcpStream::connect(proxy.to_string().as_str()).await.unwrap();
        send(&mut ascii_client, b"get k\r\n").await;
        assert_eq!(
            read_some(&mut ascii_client).await,
            b"VALUE k 7 5\r\nhello\r\nEND\r\n".to_vec()
        );
    });
}

// ── Unknown ASCII command answers ERROR and keeps the conn ────

#[test]
fn unknown_command_does_not_close_connection() {
    run_async(async {
        let backend = spawn_store_backend();
        let mut behavior = Behavior::default();
        behavior.downstream_protocol = DownstreamProtocol::Binary;
        let cluster = ClusterConfig::parse_server_list(&backend.to_string()).unwrap();
        let proxy = spawn_proxy(make_ctx(cluster, behavior));

        let mut client = TcpStream::connect(proxy.to_string().as_str()).await.unwrap();
        send(&mut client, b"frobnicate\r\n").await;
        assert_eq!(read_some(&mut client).await, b"ERROR\r\n".to_vec());

        // still serviceable
        send(&mut client, b"get absent\r\n").await;
        assert_eq!(read_some(&mut client).await, b"END\r\n".to_vec());
    });
}

// ── Oversized key is a CLIENT_ERROR and the conn closes ───────

#[test]
fn oversized_key_closes_connection() {
    run_async(async {
        let backend = spawn_store_backend();
        let cluster = ClusterConfig::parse_server_list(&backend.to_string()).unwrap();
        let proxy = spawn_proxy(make_ctx(cluster, Behavior::default()));

        let mut client = TcpStream::connect(proxy.to_string().as_str()).await.unwrap();
        let mut line = b"get ".to_vec();
        line.extend_from_slice(&vec![b'k'; 251]);
        line.extend_from_slice(b"\r\n");
        send(&mut client, &line).await;

        let reply = read_some(&mut client).await;
        assert!(reply.starts_with(b"CLIENT_ERROR"), "got {:?}", String::from_utf8_lossy(&reply));
        assert!(read_some(&mut client).await.is_empty(), "connection closed after CLIENT_ERROR");
    });
}

// ── Bad data chunk terminator ─────────────────────────────────

#[test]
fn bad_data_chunk_closes_connection() {
    run_async(async {
        let backend = spawn_store_backend();
        let cluster = ClusterConfig::parse_server_list(&backend.to_string()).unwrap();
        let proxy = spawn_proxy(make_ctx(cluster, Behavior::default()));

        let mut client = TcpStream::connect(proxy.to_string().as_str()).await.unwrap();
        send(&mut client, b"set k 0 0 3\r\naaaXX").await;
        let reply = read_some(&mut client).await;
        assert_eq!(reply, b"CLIENT_ERROR bad data chunk\r\n".to_vec());
        assert!(read_some(&mut client).await.is_empty());
    });
}

// ── stats proxy is served locally ─────────────────────────────

#[test]
fn stats_proxy_answers_without_backend() {
    run_async(async {
        // no backend at all: the dead address must never be contacted
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let cluster = ClusterConfig::parse_server_list(&dead_addr.to_string()).unwrap();
        let ctx = make_ctx(cluster, Behavior::default());
        let proxy = spawn_proxy(Rc::clone(&ctx));

        let mut client = TcpStream::connect(proxy.to_string().as_str()).await.unwrap();
        send(&mut client, b"stats proxy\r\n").await;
        let reply = String::from_utf8(read_some(&mut client).await).unwrap();
        assert!(reply.contains("STAT tot_upstream_cmds 1\r\n"), "got: {reply}");
        assert!(reply.ends_with("END\r\n"));
        assert_eq!(
            ctx.stats.tot_downstream_connect.load(std::sync::atomic::Ordering::Relaxed),
            0,
            "stats proxy must not touch downstreams"
        );
    });
}

// ── Forced-binary listener closes on a bad magic byte ─────────

#[test]
fn binary_listener_closes_on_bad_magic() {
    run_async(async {
        let backend = spawn_store_backend();
        let mut behavior = Behavior::default();
        behavior.upstream_protocol = muxy_core::behavior::UpstreamProtocol::Binary;
        behavior.downstream_protocol = DownstreamProtocol::Binary;
        let cluster = ClusterConfig::parse_server_list(&backend.to_string()).unwrap();
        let proxy = spawn_proxy(make_ctx(cluster, behavior));

        let mut client = TcpStream::connect(proxy.to_string().as_str()).await.unwrap();
        send(&mut client, b"get this-is-not-binary\r\n").await;
        // enough bytes for a header, wrong magic: silent close
        assert!(read_some(&mut client).await.is_empty());
    });
}

// ── Quiet-get batch: GETKQ hits flush before the NOOP reply ───

#[test]
fn binary_quiet_get_batch_flushes_on_noop() {
    run_async(async {
        let backend = spawn_store_backend();
        let mut behavior = Behavior::default();
        behavior.downstream_protocol = DownstreamProtocol::Binary;
        let cluster = ClusterConfig::parse_server_list(&backend.to_string()).unwrap();
        let proxy = spawn_proxy(make_ctx(cluster, behavior));

        // seed a value over the binary side
        let mut bin_client = TcpStream::connect(proxy.to_string().as_str()).await.unwrap();
        let mut extras = Vec::new();
        extras.extend_from_slice(&0u32.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        let set = BinPacket::request(opcode::SET, 0, &extras, b"hit", b"data").with_opaque(1);
        send(&mut bin_client, &set.to_bytes()).await;
        let _ = read_some(&mut bin_client).await;

        // GETKQ hit + GETKQ miss + NOOP barrier in one write
        let mut batch = Vec::new();
        BinPacket::request(opcode::GETKQ, 0, &[], b"hit", &[])
            .with_opaque(11)
            .encode_into(&mut batch);
        BinPacket::request(opcode::GETKQ, 0, &[], b"miss", &[])
            .with_opaque(12)
            .encode_into(&mut batch);
        BinPacket::request(opcode::NOOP, 0, &[], &[], &[]).with_opaque(13).encode_into(&mut batch);
        send(&mut bin_client, &batch).await;

        // responses: one GETKQ hit (opaque 11), then the NOOP (13);
        // the miss stays silent
        let mut reply = Vec::new();
        while !ends_with_noop(&reply, 13) {
            let chunk = read_some(&mut bin_client).await;
            assert!(!chunk.is_empty(), "connection closed before NOOP reply");
            reply.extend_from_slice(&chunk);
        }
        let first_opaque = u32::from_be_bytes([reply[12], reply[13], reply[14], reply[15]]);
        assert_eq!(first_opaque, 11, "hit answered with the client's opaque");
        assert_eq!(reply[1], opcode::GETKQ);
        let frames = count_frames(&reply);
        assert_eq!(frames, 2, "hit + NOOP, miss silent");
    });
}

fn count_frames(bytes: &[u8]) -> usize {
    let mut offset = 0;
    let mut frames = 0;
    while offset + HEADER_LEN <= bytes.len() {
        let body = u32::from_be_bytes([
            bytes[offset + 8],
            bytes[offset + 9],
            bytes[offset + 10],
            bytes[offset + 11],
        ]) as usize;
        offset += HEADER_LEN + body;
        frames += 1;
    }
    frames
}

fn ends_with_noop(bytes: &[u8], opaque: u32) -> bool {
    let mut offset = 0;
    while offset + HEADER_LEN <= bytes.len() {
        let body = u32::from_be_bytes([
            bytes[offset + 8],
            bytes[offset + 9],
            bytes[offset + 10],
            bytes[offset + 11],
        ]) as usize;
        if offset + HEADER_LEN + body == bytes.len()
            && bytes[offset + 1] == opcode::NOOP
            && u32::from_be_bytes([
                bytes[offset + 12],
                bytes[offset + 13],
                bytes[offset + 14],
                bytes[offset + 15],
            ]) == opaque
        {
            return true;
        }
        offset += HEADER_LEN + body;
    }
    false
}
