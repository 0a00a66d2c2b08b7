//! In-memory memcached backend for Muxy development and by-hand tests.
//!
//! Speaks enough of both wire protocols to exercise the proxy: the
//! ASCII storage/retrieval/arith commands plus stats and flush_all, and
//! the binary opcodes the proxy forwards (including the SASL PLAIN and
//! SELECT_BUCKET handshake, which it accepts unconditionally). Not a
//! cache: no expiry, no LRU, no memory bound.

use clap::Parser;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser)]
#[command(name = "mock-memcached", about = "In-memory memcached backend for Muxy development")]
struct Cli {
    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:11411")]
    addr: SocketAddr,
}

#[derive(Clone)]
struct Item {
    flags: u32,
    data: Vec<u8>,
    cas: u64,
}

#[derive(Default)]
struct Store {
    items: Mutex<HashMap<Vec<u8>, Item>>,
    cas_counter: AtomicU64,
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
}

impl Store {
    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(run(cli.addr))
}

async fn run(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    eprintln!("[mock-memcached] listening on {addr}");
    let store = Arc::new(Store::default());

    loop {
        let (stream, _) = listener.accept().await?;
        let store = Arc::clone(&store);
        tokio::task::spawn(async move {
            if let Err(e) = serve(stream, store).await {
                let msg = e.to_string();
                if !msg.contains("reset") && !msg.contains("closed") {
                    eprintln!("[mock-memcached] conn error: {e}");
                }
            }
        });
    }
}

async fn serve(mut stream: TcpStream, store: Arc<Store>) -> anyhow::Result<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(16 * 1024);
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        // need at least one byte to pick the protocol
        while buf.is_empty() {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let reply = if buf[0] == 0x80 {
            let Some(frame) = take_binary_frame(&mut stream, &mut buf, &mut chunk).await? else {
                return Ok(());
            };
            binary_reply(&frame, &store)
        } else {
            let Some((line, data)) = take_ascii_command(&mut stream, &mut buf, &mut chunk).await?
            else {
                return Ok(());
            };
            let text = String::from_utf8_lossy(&line).to_string();
            if text == "quit" {
                return Ok(());
            }
            ascii_reply(&text, data, &store)
        };
        if !reply.is_empty() {
            stream.write_all(&reply).await?;
        }
    }
}

async fn fill(stream: &mut TcpStream, buf: &mut Vec<u8>, chunk: &mut [u8]) -> anyhow::Result<bool> {
    let n = stream.read(chunk).await?;
    if n == 0 {
        return Ok(false);
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(true)
}

// ── ASCII side ────────────────────────────────────────────────

/// Pull one command line (and the data chunk for storage commands).
async fn take_ascii_command(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    chunk: &mut [u8],
) -> anyhow::Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
    let line = loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf[..pos].to_vec();
            buf.drain(..pos + 2);
            break line;
        }
        if !fill(stream, buf, chunk).await? {
            return Ok(None);
        }
    };

    let text = String::from_utf8_lossy(&line).to_string();
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let is_store = matches!(
        tokens.first().copied(),
        Some("set" | "add" | "replace" | "append" | "prepend" | "cas")
    );
    if !is_store {
        return Ok(Some((line, None)));
    }

    let bytes: usize = tokens.get(4).and_then(|t| t.parse().ok()).unwrap_or(0);
    while buf.len() < bytes + 2 {
        if !fill(stream, buf, chunk).await? {
            return Ok(None);
        }
    }
    let mut data = buf[..bytes + 2].to_vec();
    buf.drain(..bytes + 2);
    data.truncate(bytes);
    Ok(Some((line, Some(data))))
}

fn ascii_reply(line: &str, data: Option<Vec<u8>>, store: &Store) -> Vec<u8> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let noreply = tokens.last() == Some(&"noreply");
    let reply = ascii_reply_inner(&tokens, data, store);
    if noreply { Vec::new() } else { reply }
}

fn ascii_reply_inner(tokens: &[&str], data: Option<Vec<u8>>, store: &Store) -> Vec<u8> {
    match tokens.first().copied() {
        Some("get") | Some("gets") => {
            store.cmd_get.fetch_add(1, Ordering::Relaxed);
            let with_cas = tokens[0] == "gets";
            let items = store.items.lock().unwrap();
            let mut out = Vec::new();
            for key in &tokens[1..] {
                if let Some(item) = items.get(key.as_bytes()) {
                    let header = if with_cas {
                        format!("VALUE {} {} {} {}\r\n", key, item.flags, item.data.len(), item.cas)
                    } else {
                        format!("VALUE {} {} {}\r\n", key, item.flags, item.data.len())
                    };
                    out.extend_from_slice(header.as_bytes());
                    out.extend_from_slice(&item.data);
                    out.extend_from_slice(b"\r\n");
                }
            }
            out.extend_from_slice(b"END\r\n");
            out
        }
        Some(verb @ ("set" | "add" | "replace" | "append" | "prepend" | "cas")) => {
            store.cmd_set.fetch_add(1, Ordering::Relaxed);
            let key = tokens.get(1).unwrap_or(&"").as_bytes().to_vec();
            let flags: u32 = tokens.get(2).and_then(|t| t.parse().ok()).unwrap_or(0);
            let data = data.unwrap_or_default();
            let mut items = store.items.lock().unwrap();
            let exists = items.contains_key(&key);
            let stored = match verb {
                "add" if exists => false,
                "replace" if !exists => false,
                "append" | "prepend" => {
                    if let Some(item) = items.get_mut(&key) {
                        if verb == "append" {
                            item.data.extend_from_slice(&data);
                        } else {
                            let mut joined = data.clone();
                            joined.extend_from_slice(&item.data);
                            item.data = joined;
                        }
                        item.cas = store.next_cas();
                        true
                    } else {
                        false
                    }
                }
                "cas" => {
                    let wanted: u64 = tokens.get(5).and_then(|t| t.parse().ok()).unwrap_or(0);
                    match items.get_mut(&key) {
                        Some(item) if item.cas == wanted => {
                            item.flags = flags;
                            item.data = data;
                            item.cas = store.next_cas();
                            true
                        }
                        Some(_) => return b"EXISTS\r\n".to_vec(),
                        None => return b"NOT_FOUND\r\n".to_vec(),
                    }
                }
                _ => {
                    items.insert(key, Item { flags, data, cas: store.next_cas() });
                    true
                }
            };
            if stored { b"STORED\r\n".to_vec() } else { b"NOT_STORED\r\n".to_vec() }
        }
        Some("delete") => {
            let key = tokens.get(1).unwrap_or(&"").as_bytes();
            if store.items.lock().unwrap().remove(key).is_some() {
                b"DELETED\r\n".to_vec()
            } else {
                b"NOT_FOUND\r\n".to_vec()
            }
        }
        Some(verb @ ("incr" | "decr")) => {
            let key = tokens.get(1).unwrap_or(&"").as_bytes();
            let delta: u64 = tokens.get(2).and_then(|t| t.parse().ok()).unwrap_or(0);
            let mut items = store.items.lock().unwrap();
            match items.get_mut(key) {
                Some(item) => {
                    let Ok(current) = String::from_utf8_lossy(&item.data).parse::<u64>() else {
                        return b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n"
                            .to_vec();
                    };
                    let next = if verb == "incr" {
                        current.wrapping_add(delta)
                    } else {
                        current.saturating_sub(delta)
                    };
                    item.data = next.to_string().into_bytes();
                    item.cas = store.next_cas();
                    format!("{next}\r\n").into_bytes()
                }
                None => b"NOT_FOUND\r\n".to_vec(),
            }
        }
        Some("touch") => {
            let key = tokens.get(1).unwrap_or(&"").as_bytes();
            if store.items.lock().unwrap().contains_key(key) {
                b"TOUCHED\r\n".to_vec()
            } else {
                b"NOT_FOUND\r\n".to_vec()
            }
        }
        Some("flush_all") => {
            store.items.lock().unwrap().clear();
            b"OK\r\n".to_vec()
        }
        Some("verbosity") => b"OK\r\n".to_vec(),
        Some("version") => b"VERSION 1.6.0-mock\r\n".to_vec(),
        Some("stats") => {
            let items = store.items.lock().unwrap().len();
            format!(
                "STAT pid {}\r\nSTAT version 1.6.0-mock\r\nSTAT curr_items {}\r\nSTAT cmd_get {}\r\nSTAT cmd_set {}\r\nSTAT uptime 1\r\nEND\r\n",
                std::process::id(),
                items,
                store.cmd_get.load(Ordering::Relaxed),
                store.cmd_set.load(Ordering::Relaxed),
            )
            .into_bytes()
        }
        _ => b"ERROR\r\n".to_vec(),
    }
}

// ── Binary side ───────────────────────────────────────────────

struct Frame {
    opcode: u8,
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
    opaque: u32,
    cas: u64,
}

async fn take_binary_frame(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    chunk: &mut [u8],
) -> anyhow::Result<Option<Frame>> {
    while buf.len() < 24 {
        if !fill(stream, buf, chunk).await? {
            return Ok(None);
        }
    }
    let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    while buf.len() < 24 + body_len {
        if !fill(stream, buf, chunk).await? {
            return Ok(None);
        }
    }
    let key_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let ext_len = buf[4] as usize;
    let opaque = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
    let cas = u64::from_be_bytes([
        buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
    ]);
    let frame = Frame {
        opcode: buf[1],
        extras: buf[24..24 + ext_len].to_vec(),
        key: buf[24 + ext_len..24 + ext_len + key_len].to_vec(),
        value: buf[24 + ext_len + key_len..24 + body_len].to_vec(),
        opaque,
        cas,
    };
    buf.drain(..24 + body_len);
    Ok(Some(frame))
}

fn response(frame: &Frame, status: u16, extras: &[u8], key: &[u8], value: &[u8], cas: u64) -> Vec<u8> {
    let body_len = (extras.len() + key.len() + value.len()) as u32;
    let mut out = Vec::with_capacity(24 + body_len as usize);
    out.push(0x81);
    out.push(frame.opcode);
    out.extend_from_slice(&(key.len() as u16).to_be_bytes());
    out.push(extras.len() as u8);
    out.push(0);
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(&body_len.to_be_bytes());
    out.extend_from_slice(&frame.opaque.to_be_bytes());
    out.extend_from_slice(&cas.to_be_bytes());
    out.extend_from_slice(extras);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

fn binary_reply(frame: &Frame, store: &Store) -> Vec<u8> {
    const GET: u8 = 0x00;
    const SET: u8 = 0x01;
    const ADD: u8 = 0x02;
    const REPLACE: u8 = 0x03;
    const DELETE: u8 = 0x04;
    const INCR: u8 = 0x05;
    const DECR: u8 = 0x06;
    const FLUSH: u8 = 0x08;
    const GETQ: u8 = 0x09;
    const NOOP: u8 = 0x0a;
    const VERSION: u8 = 0x0b;
    const GETK: u8 = 0x0c;
    const GETKQ: u8 = 0x0d;
    const STAT: u8 = 0x10;
    const SETQ: u8 = 0x11;
    const DELETEQ: u8 = 0x14;
    const TOUCH: u8 = 0x1c;
    const SASL_AUTH: u8 = 0x21;
    const SELECT_BUCKET: u8 = 0x89;

    const ENOENT: u16 = 0x0001;
    const EEXISTS: u16 = 0x0002;
    const UNKNOWN: u16 = 0x0081;

    match frame.opcode {
        GET | GETK | GETQ | GETKQ => {
            store.cmd_get.fetch_add(1, Ordering::Relaxed);
            let items = store.items.lock().unwrap();
            let quiet = matches!(frame.opcode, GETQ | GETKQ);
            let with_key = matches!(frame.opcode, GETK | GETKQ);
            match items.get(&frame.key) {
                Some(item) => {
                    let extras = item.flags.to_be_bytes();
                    let key: &[u8] = if with_key { &frame.key } else { &[] };
                    response(frame, 0, &extras, key, &item.data, item.cas)
                }
                None if quiet => Vec::new(),
                None => response(frame, ENOENT, &[], &[], b"Not found", 0),
            }
        }
        SET | SETQ | ADD | REPLACE => {
            store.cmd_set.fetch_add(1, Ordering::Relaxed);
            let flags = if frame.extras.len() >= 4 {
                u32::from_be_bytes([frame.extras[0], frame.extras[1], frame.extras[2], frame.extras[3]])
            } else {
                0
            };
            let mut items = store.items.lock().unwrap();
            let exists = items.contains_key(&frame.key);
            let status = match frame.opcode {
                ADD if exists => EEXISTS,
                REPLACE if !exists => ENOENT,
                _ if frame.cas != 0
                    && items.get(&frame.key).map(|i| i.cas) != Some(frame.cas) =>
                {
                    if exists { EEXISTS } else { ENOENT }
                }
                _ => {
                    let cas = store.next_cas();
                    items.insert(
                        frame.key.clone(),
                        Item { flags, data: frame.value.clone(), cas },
                    );
                    if frame.opcode == SETQ {
                        return Vec::new();
                    }
                    return response(frame, 0, &[], &[], &[], cas);
                }
            };
            response(frame, status, &[], &[], &[], 0)
        }
        DELETE | DELETEQ => {
            let removed = store.items.lock().unwrap().remove(&frame.key).is_some();
            if frame.opcode == DELETEQ && removed {
                return Vec::new();
            }
            response(frame, if removed { 0 } else { ENOENT }, &[], &[], &[], 0)
        }
        INCR | DECR => {
            let delta = if frame.extras.len() >= 8 {
                u64::from_be_bytes(frame.extras[0..8].try_into().unwrap())
            } else {
                0
            };
            let mut items = store.items.lock().unwrap();
            match items.get_mut(&frame.key) {
                Some(item) => {
                    let current: u64 =
                        String::from_utf8_lossy(&item.data).parse().unwrap_or(0);
                    let next = if frame.opcode == INCR {
                        current.wrapping_add(delta)
                    } else {
                        current.saturating_sub(delta)
                    };
                    item.data = next.to_string().into_bytes();
                    item.cas = store.next_cas();
                    response(frame, 0, &[], &[], &next.to_be_bytes(), item.cas)
                }
                None => response(frame, ENOENT, &[], &[], &[], 0),
            }
        }
        TOUCH => {
            let hit = store.items.lock().unwrap().contains_key(&frame.key);
            response(frame, if hit { 0 } else { ENOENT }, &[], &[], &[], 0)
        }
        FLUSH => {
            store.items.lock().unwrap().clear();
            response(frame, 0, &[], &[], &[], 0)
        }
        NOOP => response(frame, 0, &[], &[], &[], 0),
        VERSION => response(frame, 0, &[], &[], b"1.6.0-mock", 0),
        STAT => {
            let mut out = Vec::new();
            let entries = [
                ("pid".to_string(), std::process::id().to_string()),
                ("version".to_string(), "1.6.0-mock".to_string()),
                ("curr_items".to_string(), store.items.lock().unwrap().len().to_string()),
                ("uptime".to_string(), "1".to_string()),
            ];
            for (name, value) in entries {
                out.extend_from_slice(&response(frame, 0, &[], name.as_bytes(), value.as_bytes(), 0));
            }
            out.extend_from_slice(&response(frame, 0, &[], &[], &[], 0));
            out
        }
        // the proxy's handshake: accept anything
        SASL_AUTH | SELECT_BUCKET => response(frame, 0, &[], &[], &[], 0),
        _ => response(frame, UNKNOWN, &[], &[], b"Unknown command", 0),
    }
}
