//! The request engine: one parsed upstream command in, the bytes to
//! answer it with out.
//!
//! Every path follows the same shape: route the key(s), acquire pooled
//! downstream sockets, encode for the bucket's downstream protocol
//! (a2a passthrough, a2b translation, b2b with vbucket rewrite), read
//! the reply under the deadline, and release the socket back to the
//! pool. NOT_MY_VBUCKET and dead-socket replies re-enter the forward
//! loop, bounded by `2 × servers.len()` attempts.

use crate::downstream::DownstreamConn;
use crate::pool::AcquireOutcome;
use crate::worker::WorkerCtx;
use muxy_core::behavior::DownstreamProtocol;
use muxy_core::error::status;
use muxy_core::{Behavior, MuxyError};
use muxy_protocol::ascii::{self, AsciiRequest, AsciiResponseLine, StoreVerb};
use muxy_protocol::binary::{BinPacket, opcode};
use muxy_protocol::command::is_quiet;
use muxy_protocol::stats::StatsMerger;
use muxy_protocol::translate::{
    ReplyContext, arith_value_line, encode_arith, encode_delete, encode_flush, encode_getkq,
    encode_stat, encode_store, encode_touch, encode_verbosity, encode_version, error_line,
    flags_from_extras, response_line,
};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[inline]
fn bump(counter: &std::sync::atomic::AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn ascii_downstream(ctx: &WorkerCtx) -> bool {
    ctx.bucket.behavior.downstream_protocol == DownstreamProtocol::Ascii
}

fn reply_deadline(behavior: &Behavior) -> Option<Duration> {
    let ms = behavior.clamp_to_cycle(behavior.downstream_timeout_ms);
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn max_attempts(ctx: &WorkerCtx) -> u32 {
    2 * ctx.servers_len().max(1) as u32
}

// ── Socket acquisition ────────────────────────────────────────

/// Get a downstream socket for one server position: pooled, freshly
/// connected, or waited for under the conn-queue timeout.
pub(crate) async fn acquire_conn(
    ctx: &Rc<WorkerCtx>,
    server_index: usize,
) -> Result<DownstreamConn, MuxyError> {
    let behavior = &ctx.bucket.behavior;
    let ascii = ascii_downstream(ctx);
    let cluster = ctx.cluster();
    let server = cluster
        .servers
        .get(server_index)
        .cloned()
        .ok_or_else(|| MuxyError::Internal(format!("server index {server_index} out of range")))?;
    let identity = server.host_identity(ascii);
    let epoch = ctx.epoch();

    match ctx.with_pools(|p| p.acquire(&identity)) {
        AcquireOutcome::Ready(conn) => {
            bump(&ctx.stats.tot_downstream_acquired);
            Ok(conn)
        }
        AcquireOutcome::Blacklisted => {
            bump(&ctx.stats.tot_downstream_blacklisted);
            Err(MuxyError::DownstreamClosed)
        }
        AcquireOutcome::MustConnect => {
            bump(&ctx.stats.tot_downstream_connect);
            let connected = DownstreamConn::connect(
                &server,
                behavior,
                cluster.bucket.as_deref(),
                ascii,
                server_index,
                epoch,
            )
            .await;
            match connected {
                Ok(conn) => {
                    ctx.with_pools(|p| p.connect_succeeded(&identity));
                    bump(&ctx.stats.tot_downstream_acquired);
                    Ok(conn)
                }
                Err(e) => {
                    ctx.with_pools(|p| p.connect_failed(&identity));
                    bump(&ctx.stats.tot_downstream_connect_failed);
                    match &e {
                        MuxyError::AuthError => bump(&ctx.stats.tot_auth_errors),
                        MuxyError::SelectBucketTimeout => {
                            bump(&ctx.stats.tot_auth_select_bucket_timeouts)
                        }
                        _ => {}
                    }
                    Err(e)
                }
            }
        }
        AcquireOutcome::Queued(mut rx) => {
            let timeout_ms =
                behavior.clamp_to_cycle(behavior.downstream_conn_queue_timeout_ms);
            if timeout_ms == 0 {
                return Err(MuxyError::OutOfDownstreams);
            }
            match monoio::time::timeout(Duration::from_millis(timeout_ms), &mut rx).await {
                Ok(Ok(Ok(conn))) => {
                    bump(&ctx.stats.tot_downstream_acquired);
                    Ok(conn)
                }
                // every socket for this identity died while we waited
                Ok(Ok(Err(_flushed))) => Err(MuxyError::DownstreamClosed),
                Ok(Err(_canceled)) => Err(MuxyError::DownstreamClosed),
                Err(_elapsed) => {
                    if let Ok(Some(Ok(conn))) = rx.try_recv() {
                        // handed over in the same tick the timer fired
                        ctx.with_pools(|p| p.release(conn, true));
                    }
                    // the socket we waited for is suspect: close it on
                    // its next release so it reconnects fresh
                    ctx.with_pools(|p| p.force_reconnect(&identity));
                    bump(&ctx.stats.tot_downstream_conn_queue_timeouts);
                    Err(MuxyError::DownstreamTimeout(server.scrubbed_identity()))
                }
            }
        }
    }
}

fn release(ctx: &WorkerCtx, conn: DownstreamConn, keep: bool) {
    if keep {
        bump(&ctx.stats.tot_downstream_released);
    } else {
        bump(&ctx.stats.tot_downstream_closed);
    }
    ctx.with_pools(|p| p.release(conn, keep));
}

fn fail_conn(ctx: &WorkerCtx, conn: DownstreamConn) {
    bump(&ctx.stats.tot_downstream_closed);
    ctx.with_pools(|p| p.fail(conn));
}

// ── ASCII entry point ─────────────────────────────────────────

pub async fn run_ascii(ctx: &Rc<WorkerCtx>, req: &AsciiRequest) -> Result<Vec<u8>, MuxyError> {
    match req {
        AsciiRequest::Get { keys, with_cas } => run_ascii_get(ctx, keys, *with_cas).await,
        AsciiRequest::Store { .. }
        | AsciiRequest::Delete { .. }
        | AsciiRequest::Arith { .. }
        | AsciiRequest::Touch { .. } => run_ascii_keyed(ctx, req).await,
        AsciiRequest::FlushAll { .. }
        | AsciiRequest::Stats { .. }
        | AsciiRequest::Version
        | AsciiRequest::Verbosity { .. } => run_ascii_broadcast(ctx, req).await,
        AsciiRequest::Quit => Ok(Vec::new()),
    }
}

// ── Single-key commands (storage, delete, arith, touch) ───────

#[derive(Clone, Copy)]
enum KeyedKind {
    Store(StoreVerb),
    Delete,
    Arith,
    Touch,
}

enum KeyedOutcome {
    Reply(Vec<u8>),
    NotMyVbucket,
}

async fn run_ascii_keyed(ctx: &Rc<WorkerCtx>, req: &AsciiRequest) -> Result<Vec<u8>, MuxyError> {
    let ascii = ascii_downstream(ctx);
    let noreply = req.noreply();
    let (key, kind) = match req {
        AsciiRequest::Store { verb, key, .. } => (key, KeyedKind::Store(*verb)),
        AsciiRequest::Delete { key, .. } => (key, KeyedKind::Delete),
        AsciiRequest::Arith { key, .. } => (key, KeyedKind::Arith),
        AsciiRequest::Touch { key, .. } => (key, KeyedKind::Touch),
        _ => return Err(MuxyError::Internal("non-keyed command in keyed path".into())),
    };

    let limit = max_attempts(ctx);
    let mut attempt = 0u32;
    loop {
        let target = ctx.route(key)?;
        let vbucket = target.vbucket.max(0) as u16;
        let wire = if ascii {
            let mut out = Vec::with_capacity(64);
            req.encode_line(&mut out);
            if let AsciiRequest::Store { data, .. } = req {
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            out
        } else {
            encode_keyed_a2b(req, vbucket, noreply).to_bytes()
        };

        let mut conn = acquire_conn(ctx, target.server).await?;
        let exchanged = match reply_deadline(&ctx.bucket.behavior) {
            Some(deadline) => {
                match monoio::time::timeout(
                    deadline,
                    exchange_keyed(&mut conn, wire, noreply, kind, ascii),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        let scrubbed = conn.scrubbed().to_string();
                        fail_conn(ctx, conn);
                        bump(&ctx.stats.tot_downstream_timeouts);
                        return Err(MuxyError::DownstreamTimeout(scrubbed));
                    }
                }
            }
            None => exchange_keyed(&mut conn, wire, noreply, kind, ascii).await,
        };

        match exchanged {
            Ok(KeyedOutcome::Reply(bytes)) => {
                release(ctx, conn, true);
                return Ok(bytes);
            }
            Ok(KeyedOutcome::NotMyVbucket) => {
                // the socket is fine; the key just lives elsewhere now
                release(ctx, conn, true);
                ctx.mark_bad_master(vbucket, target.server);
                bump(&ctx.stats.tot_retries);
                bump(&ctx.stats.tot_retries_not_my_vbucket);
                attempt += 1;
                if attempt > limit {
                    return Ok(error_line(status::NOT_MY_VBUCKET));
                }
            }
            Err(e) => {
                let retryable =
                    matches!(e, MuxyError::DownstreamClosed) && !conn.reply_started();
                fail_conn(ctx, conn);
                if retryable && attempt < limit {
                    attempt += 1;
                    bump(&ctx.stats.tot_retries);
                    continue;
                }
                return Err(e);
            }
        }
    }
}

fn encode_keyed_a2b(req: &AsciiRequest, vbucket: u16, quiet: bool) -> BinPacket {
    match req {
        AsciiRequest::Store { verb, key, flags, exptime, cas, data, .. } => {
            encode_store(*verb, key, *flags, *exptime, *cas, data, vbucket, quiet)
        }
        AsciiRequest::Delete { key, .. } => encode_delete(key, vbucket, quiet),
        AsciiRequest::Arith { incr, key, delta, .. } => {
            encode_arith(*incr, key, *delta, vbucket, quiet)
        }
        AsciiRequest::Touch { key, exptime, .. } => encode_touch(key, *exptime, vbucket, quiet),
        _ => unreachable!("only keyed commands are encoded here"),
    }
}

async fn exchange_keyed(
    conn: &mut DownstreamConn,
    wire: Vec<u8>,
    noreply: bool,
    kind: KeyedKind,
    ascii: bool,
) -> Result<KeyedOutcome, MuxyError> {
    conn.write_frame(wire, !noreply).await?;
    if noreply {
        return Ok(KeyedOutcome::Reply(Vec::new()));
    }
    if ascii {
        let mut line = conn.read_line().await?;
        conn.mark_clean();
        line.extend_from_slice(b"\r\n");
        return Ok(KeyedOutcome::Reply(line));
    }
    let packet = conn.read_packet().await?;
    conn.mark_clean();
    let st = packet.status();
    if st == status::NOT_MY_VBUCKET {
        return Ok(KeyedOutcome::NotMyVbucket);
    }
    let bytes = match kind {
        KeyedKind::Arith if st == status::SUCCESS => arith_value_line(&packet.value),
        KeyedKind::Arith => error_line(st),
        KeyedKind::Store(verb) => response_line(ReplyContext::Store(verb), st),
        KeyedKind::Delete => response_line(ReplyContext::Delete, st),
        KeyedKind::Touch => response_line(ReplyContext::Touch, st),
    };
    Ok(KeyedOutcome::Reply(bytes))
}

// ── Multi-get with de-duplication and scatter/gather ──────────

#[derive(Debug, Clone)]
pub(crate) struct ValueFrame {
    pub(crate) key: Vec<u8>,
    pub(crate) flags: u32,
    pub(crate) cas: Option<u64>,
    pub(crate) data: Vec<u8>,
}

/// Collapse repeated keys: distinct keys in first-seen order plus how
/// many times each was asked for (every occurrence gets its own VALUE
/// on the way back).
fn dedupe_keys(keys: &[Vec<u8>]) -> (Vec<Vec<u8>>, HashMap<Vec<u8>, u32>) {
    let mut order = Vec::with_capacity(keys.len());
    let mut interest: HashMap<Vec<u8>, u32> = HashMap::with_capacity(keys.len());
    for key in keys {
        match interest.entry(key.clone()) {
            Entry::Occupied(mut e) => *e.get_mut() += 1,
            Entry::Vacant(e) => {
                e.insert(1);
                order.push(key.clone());
            }
        }
    }
    (order, interest)
}

enum GroupError {
    /// Socket died before any reply byte: the whole group may retry.
    Retryable,
    Fatal(MuxyError),
}

struct FetchOutcome {
    values: Vec<ValueFrame>,
    /// Keys the backend disowned, with the vbucket and the master that
    /// answered, for retargeting.
    not_my_vbucket: Vec<(Vec<u8>, u16, usize)>,
}

async fn run_ascii_get(
    ctx: &Rc<WorkerCtx>,
    keys: &[Vec<u8>],
    with_cas: bool,
) -> Result<Vec<u8>, MuxyError> {
    let (order, interest) = dedupe_keys(keys);
    let duplicates = keys.len() - order.len();
    if duplicates > 0 {
        ctx.stats.tot_multiget_keys_deduped.fetch_add(duplicates as u64, Ordering::Relaxed);
    }

    // cross-client squashing: join fetches already in flight for the
    // same keys, own the rest
    let squash = ctx.multiget_squash_allowed();
    let mut subscriptions = Vec::new();
    let fetch_keys: Vec<Vec<u8>> = if squash {
        let mut owned = Vec::new();
        for key in &order {
            match ctx.subscribe_inflight_get(key) {
                Some(rx) => subscriptions.push((key.clone(), rx)),
                None => owned.push(key.clone()),
            }
        }
        owned
    } else {
        order.clone()
    };

    let fetched = fetch_all(ctx, &fetch_keys).await;
    if squash {
        // owners must publish on every path, error included, or the
        // subscribers would hang until their own deadline
        ctx.publish_inflight_gets(&fetch_keys, fetched.as_ref().ok());
    }
    let mut results = fetched?;

    for (key, rx) in subscriptions {
        if let Ok(Some(frame)) = rx.await {
            results.insert(key, frame);
        }
        // a canceled or missing publish reads as a miss
    }

    let mut out = Vec::with_capacity(64);
    for key in &order {
        if let Some(frame) = results.get(key) {
            let copies = interest.get(key).copied().unwrap_or(1);
            for _ in 0..copies {
                ascii::emit_value(
                    &mut out,
                    &frame.key,
                    frame.flags,
                    &frame.data,
                    if with_cas { frame.cas } else { None },
                );
            }
        }
    }
    out.extend_from_slice(b"END\r\n");
    Ok(out)
}

/// The scatter side of a multi-get: route every key, fetch per server,
/// and re-target NOT_MY_VBUCKET keys until done or out of retries.
async fn fetch_all(
    ctx: &Rc<WorkerCtx>,
    keys: &[Vec<u8>],
) -> Result<HashMap<Vec<u8>, ValueFrame>, MuxyError> {
    let mut results: HashMap<Vec<u8>, ValueFrame> = HashMap::with_capacity(keys.len());
    let mut pending: Vec<Vec<u8>> = keys.to_vec();
    let limit = max_attempts(ctx);
    let mut attempt = 0u32;

    while !pending.is_empty() {
        // group this round's keys by their current master
        let mut groups: Vec<(usize, Vec<(Vec<u8>, u16)>)> = Vec::new();
        for key in pending.drain(..) {
            let target = ctx.route(&key)?;
            let vbucket = target.vbucket.max(0) as u16;
            match groups.iter_mut().find(|(server, _)| *server == target.server) {
                Some((_, group)) => group.push((key, vbucket)),
                None => groups.push((target.server, vec![(key, vbucket)])),
            }
        }

        for (server, group) in groups {
            match fetch_group(ctx, server, &group).await {
                Ok(outcome) => {
                    for frame in outcome.values {
                        results.insert(frame.key.clone(), frame);
                    }
                    for (key, vbucket, old_master) in outcome.not_my_vbucket {
                        ctx.mark_bad_master(vbucket, old_master);
                        bump(&ctx.stats.tot_retries);
                        bump(&ctx.stats.tot_retries_not_my_vbucket);
                        pending.push(key);
                    }
                }
                Err(GroupError::Retryable) => {
                    bump(&ctx.stats.tot_retries);
                    pending.extend(group.into_iter().map(|(key, _)| key));
                }
                Err(GroupError::Fatal(e)) => return Err(e),
            }
        }

        if pending.is_empty() {
            break;
        }
        attempt += 1;
        if attempt > limit {
            // retry budget burned; unresolved keys surface as misses,
            // which is what get semantics make of them
            break;
        }
    }

    Ok(results)
}

/// Fetch one server's share of a multi-get and parse every returned
/// VALUE. ASCII downstreams get one `get k1 k2…` line; binary
/// downstreams get a GETKQ-per-key batch closed by NOOP.
async fn fetch_group(
    ctx: &Rc<WorkerCtx>,
    server: usize,
    group: &[(Vec<u8>, u16)],
) -> Result<FetchOutcome, GroupError> {
    let ascii = ascii_downstream(ctx);
    let mut conn = acquire_conn(ctx, server).await.map_err(GroupError::Fatal)?;

    let wire = if ascii {
        let mut line = b"get".to_vec();
        for (key, _) in group {
            line.push(b' ');
            line.extend_from_slice(key);
        }
        line.extend_from_slice(b"\r\n");
        line
    } else {
        let mut out = Vec::with_capacity(32 * (group.len() + 1));
        for (index, (key, vbucket)) in group.iter().enumerate() {
            encode_getkq(key, *vbucket, index as u32).encode_into(&mut out);
        }
        BinPacket::noop().encode_into(&mut out);
        out
    };

    let gather = async {
        conn.write_frame(wire, true).await?;
        if ascii {
            gather_ascii_values(&mut conn).await.map(|values| FetchOutcome {
                values,
                not_my_vbucket: Vec::new(),
            })
        } else {
            gather_binary_values(&mut conn, group).await
        }
    };

    let gathered = match reply_deadline(&ctx.bucket.behavior) {
        Some(deadline) => match monoio::time::timeout(deadline, gather).await {
            Ok(result) => result,
            Err(_elapsed) => {
                let scrubbed = conn.scrubbed().to_string();
                fail_conn(ctx, conn);
                bump(&ctx.stats.tot_downstream_timeouts);
                return Err(GroupError::Fatal(MuxyError::DownstreamTimeout(scrubbed)));
            }
        },
        None => gather.await,
    };

    match gathered {
        Ok(outcome) => {
            conn.mark_clean();
            release(ctx, conn, true);
            Ok(outcome)
        }
        Err(e) => {
            let retryable = matches!(e, MuxyError::DownstreamClosed) && !conn.reply_started();
            fail_conn(ctx, conn);
            if retryable { Err(GroupError::Retryable) } else { Err(GroupError::Fatal(e)) }
        }
    }
}

async fn gather_ascii_values(conn: &mut DownstreamConn) -> Result<Vec<ValueFrame>, MuxyError> {
    let mut values = Vec::new();
    loop {
        let line = conn.read_line().await?;
        match ascii::parse_response_line(&line)
            .map_err(|e| MuxyError::Internal(format!("downstream response: {e}")))?
        {
            AsciiResponseLine::Value { key, flags, bytes, cas } => {
                let mut chunk = conn.read_chunk(bytes + 2).await?;
                if chunk[bytes..] != *b"\r\n" {
                    return Err(MuxyError::Internal("downstream chunk framing".into()));
                }
                chunk.truncate(bytes);
                values.push(ValueFrame { key, flags, cas, data: chunk });
            }
            AsciiResponseLine::End => return Ok(values),
            AsciiResponseLine::Stat { .. } => {
                return Err(MuxyError::Internal("STAT in a get response".into()));
            }
            AsciiResponseLine::Line(line) => {
                return Err(MuxyError::Internal(format!(
                    "downstream error: {}",
                    String::from_utf8_lossy(&line)
                )));
            }
        }
    }
}

async fn gather_binary_values(
    conn: &mut DownstreamConn,
    group: &[(Vec<u8>, u16)],
) -> Result<FetchOutcome, MuxyError> {
    let mut outcome = FetchOutcome { values: Vec::new(), not_my_vbucket: Vec::new() };
    loop {
        let packet = conn.read_packet().await?;
        if packet.header.opcode == opcode::NOOP {
            return Ok(outcome);
        }
        let index = packet.header.opaque as usize;
        let Some((key, vbucket)) = group.get(index) else {
            tracing::debug!(opaque = packet.header.opaque, "Unmatched get response dropped");
            continue;
        };
        match packet.status() {
            status::SUCCESS => outcome.values.push(ValueFrame {
                key: key.clone(),
                flags: flags_from_extras(&packet.extras),
                cas: Some(packet.header.cas),
                data: packet.value,
            }),
            status::NOT_MY_VBUCKET => {
                outcome.not_my_vbucket.push((key.clone(), *vbucket, conn.server_index()));
            }
            status::KEY_ENOENT => {} // explicit miss; quiet gets usually just skip
            other => {
                tracing::debug!(status = other, "Multi-get member failed; surfacing as a miss");
            }
        }
    }
}

// ── Broadcast commands (flush_all, stats, version, verbosity) ─

enum BroadcastPart {
    /// A single-line reply (already `\r\n`-terminated).
    Line(Vec<u8>),
    /// Parsed STAT table.
    Stats(Vec<(Vec<u8>, Vec<u8>)>),
    /// Quiet broadcast: nothing to read.
    Quiet,
}

async fn run_ascii_broadcast(ctx: &Rc<WorkerCtx>, req: &AsciiRequest) -> Result<Vec<u8>, MuxyError> {
    let noreply = req.noreply();
    let servers = ctx.servers_len();
    let is_stats = matches!(req, AsciiRequest::Stats { .. });

    let mut parts = Vec::with_capacity(servers);
    let fan_out = (0..servers).map(|server| broadcast_one(ctx, server, req, noreply, is_stats));
    for part in futures::future::join_all(fan_out).await {
        parts.push(part?);
    }

    if noreply {
        return Ok(Vec::new());
    }

    match req {
        AsciiRequest::Stats { .. } => {
            let mut merger = StatsMerger::new();
            for part in parts {
                if let BroadcastPart::Stats(entries) = part {
                    for (name, value) in entries {
                        merger.merge_line(&name, &value);
                    }
                }
            }
            let mut out = Vec::with_capacity(1024);
            merger.flush_ascii(&mut out);
            Ok(out)
        }
        AsciiRequest::Version => {
            // "version" merges like the stats rule: first answer wins
            for part in parts {
                if let BroadcastPart::Line(line) = part {
                    return Ok(line);
                }
            }
            Err(MuxyError::DownstreamClosed)
        }
        _ => {
            // flush_all / verbosity reduce to OK iff every backend said OK
            for part in parts {
                if let BroadcastPart::Line(line) = part
                    && line != b"OK\r\n"
                {
                    return Ok(line);
                }
            }
            Ok(b"OK\r\n".to_vec())
        }
    }
}

async fn broadcast_one(
    ctx: &Rc<WorkerCtx>,
    server: usize,
    req: &AsciiRequest,
    noreply: bool,
    is_stats: bool,
) -> Result<BroadcastPart, MuxyError> {
    let ascii = ascii_downstream(ctx);
    let mut conn = acquire_conn(ctx, server).await?;

    let wire = if ascii {
        let mut out = Vec::with_capacity(32);
        req.encode_line(&mut out);
        out
    } else {
        encode_broadcast_a2b(req, noreply).to_bytes()
    };

    let exchange = async {
        conn.write_frame(wire, !noreply).await?;
        if noreply {
            return Ok(BroadcastPart::Quiet);
        }
        if is_stats {
            let entries = if ascii {
                gather_ascii_stats(&mut conn).await?
            } else {
                gather_binary_stats(&mut conn).await?
            };
            return Ok(BroadcastPart::Stats(entries));
        }
        if ascii {
            let mut line = conn.read_line().await?;
            line.extend_from_slice(b"\r\n");
            Ok(BroadcastPart::Line(line))
        } else {
            let packet = conn.read_packet().await?;
            let line = match (req, packet.status()) {
                (AsciiRequest::Version, status::SUCCESS) => {
                    let mut line = b"VERSION ".to_vec();
                    line.extend_from_slice(&packet.value);
                    line.extend_from_slice(b"\r\n");
                    line
                }
                (_, status::SUCCESS) => b"OK\r\n".to_vec(),
                (_, st) => error_line(st),
            };
            Ok(BroadcastPart::Line(line))
        }
    };

    let exchanged = match reply_deadline(&ctx.bucket.behavior) {
        Some(deadline) => match monoio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_elapsed) => {
                let scrubbed = conn.scrubbed().to_string();
                fail_conn(ctx, conn);
                bump(&ctx.stats.tot_downstream_timeouts);
                return Err(MuxyError::DownstreamTimeout(scrubbed));
            }
        },
        None => exchange.await,
    };

    match exchanged {
        Ok(part) => {
            conn.mark_clean();
            release(ctx, conn, true);
            Ok(part)
        }
        Err(e) => {
            fail_conn(ctx, conn);
            Err(e)
        }
    }
}

fn encode_broadcast_a2b(req: &AsciiRequest, quiet: bool) -> BinPacket {
    match req {
        AsciiRequest::FlushAll { delay, .. } => encode_flush(*delay, quiet),
        AsciiRequest::Stats { arg } => encode_stat(arg.as_deref()),
        AsciiRequest::Version => encode_version(),
        AsciiRequest::Verbosity { level, .. } => encode_verbosity(*level, quiet),
        _ => unreachable!("only broadcast commands are encoded here"),
    }
}

async fn gather_ascii_stats(
    conn: &mut DownstreamConn,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MuxyError> {
    let mut entries = Vec::new();
    loop {
        let line = conn.read_line().await?;
        match ascii::parse_response_line(&line)
            .map_err(|e| MuxyError::Internal(format!("downstream response: {e}")))?
        {
            AsciiResponseLine::Stat { name, value } => entries.push((name, value)),
            AsciiResponseLine::End => return Ok(entries),
            AsciiResponseLine::Line(line) => {
                return Err(MuxyError::Internal(format!(
                    "downstream error: {}",
                    String::from_utf8_lossy(&line)
                )));
            }
            AsciiResponseLine::Value { .. } => {
                return Err(MuxyError::Internal("VALUE in a stats response".into()));
            }
        }
    }
}

async fn gather_binary_stats(
    conn: &mut DownstreamConn,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MuxyError> {
    let mut entries = Vec::new();
    loop {
        let packet = conn.read_packet().await?;
        if packet.status() != status::SUCCESS {
            return Err(MuxyError::Internal(format!(
                "stats broadcast refused with status {}",
                packet.status()
            )));
        }
        if packet.key.is_empty() {
            // empty-key STAT terminates the stream
            return Ok(entries);
        }
        entries.push((packet.key, packet.value));
    }
}

// ── Binary upstream (b2b) ─────────────────────────────────────

/// Forward one loud binary command (or a quiet mutation) and return the
/// upstream reply bytes. Quiet gets go through [`run_binary_get_batch`].
pub async fn run_binary(ctx: &Rc<WorkerCtx>, packet: &BinPacket) -> Result<Vec<u8>, MuxyError> {
    if ascii_downstream(ctx) {
        // the binary→ascii direction has no translator; say so honestly
        // (quiet commands asked to hear nothing, even about this)
        if is_quiet(packet.header.opcode) {
            return Ok(Vec::new());
        }
        return Ok(BinPacket::response(packet.header.opcode, status::NOT_SUPPORTED, &[], &[], &[])
            .with_opaque(packet.header.opaque)
            .to_bytes());
    }
    if muxy_protocol::command::is_broadcast(packet.header.opcode) {
        run_binary_broadcast(ctx, packet).await
    } else {
        run_binary_keyed(ctx, packet).await
    }
}

async fn run_binary_keyed(ctx: &Rc<WorkerCtx>, packet: &BinPacket) -> Result<Vec<u8>, MuxyError> {
    let quiet = is_quiet(packet.header.opcode);
    let limit = max_attempts(ctx);
    let mut attempt = 0u32;

    loop {
        let target = ctx.route(&packet.key)?;
        let vbucket = target.vbucket.max(0) as u16;

        let mut forward = packet.clone();
        forward.header.vbucket_or_status = vbucket;
        if quiet {
            // quiet mutations never answer upstream; stamp the sentinel
            // so a late error frame is dropped instead of corrupting
            // the next response stream
            forward.header.opaque = muxy_protocol::binary::OPAQUE_IGNORE_REPLY;
        }

        let mut conn = acquire_conn(ctx, target.server).await?;
        let exchange = async {
            conn.write_frame(forward.to_bytes(), !quiet).await?;
            if quiet {
                return Ok(None);
            }
            let reply = conn.read_packet().await?;
            conn.mark_clean();
            Ok(Some(reply))
        };

        let exchanged = match reply_deadline(&ctx.bucket.behavior) {
            Some(deadline) => match monoio::time::timeout(deadline, exchange).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    let scrubbed = conn.scrubbed().to_string();
                    fail_conn(ctx, conn);
                    bump(&ctx.stats.tot_downstream_timeouts);
                    return Err(MuxyError::DownstreamTimeout(scrubbed));
                }
            },
            None => exchange.await,
        };

        match exchanged {
            Ok(None) => {
                release(ctx, conn, true);
                return Ok(Vec::new());
            }
            Ok(Some(reply)) if reply.status() == status::NOT_MY_VBUCKET => {
                release(ctx, conn, true);
                ctx.mark_bad_master(vbucket, target.server);
                bump(&ctx.stats.tot_retries);
                bump(&ctx.stats.tot_retries_not_my_vbucket);
                attempt += 1;
                if attempt > limit {
                    // retry budget burned: the client sees the last body
                    let mut last = reply;
                    last.header.opaque = packet.header.opaque;
                    return Ok(last.to_bytes());
                }
            }
            Ok(Some(mut reply)) => {
                release(ctx, conn, true);
                reply.header.opaque = packet.header.opaque;
                return Ok(reply.to_bytes());
            }
            Err(e) => {
                let retryable =
                    matches!(e, MuxyError::DownstreamClosed) && !conn.reply_started();
                fail_conn(ctx, conn);
                if retryable && attempt < limit {
                    attempt += 1;
                    bump(&ctx.stats.tot_retries);
                    continue;
                }
                return Err(e);
            }
        }
    }
}

async fn run_binary_broadcast(ctx: &Rc<WorkerCtx>, packet: &BinPacket) -> Result<Vec<u8>, MuxyError> {
    let quiet = is_quiet(packet.header.opcode);
    let servers = ctx.servers_len();
    let loud_opcode = muxy_protocol::command::loud_variant(packet.header.opcode);

    let fan_out = (0..servers).map(|server| broadcast_one_binary(ctx, server, packet, quiet));
    let mut replies = Vec::with_capacity(servers);
    for reply in futures::future::join_all(fan_out).await {
        replies.push(reply?);
    }

    if quiet {
        return Ok(Vec::new());
    }

    if loud_opcode == opcode::STAT {
        let mut merger = StatsMerger::new();
        for reply in replies.into_iter().flatten() {
            if let BroadcastPart::Stats(entries) = reply {
                for (name, value) in entries {
                    merger.merge_line(&name, &value);
                }
            }
        }
        let mut out = Vec::with_capacity(1024);
        merger.flush_binary(packet.header.opaque, &mut out);
        return Ok(out);
    }

    // single-status reduction: first failure wins, else success; the
    // version broadcast answers with the first backend's version string
    let mut version_value: Option<Vec<u8>> = None;
    let mut bad_status: Option<u16> = None;
    for reply in replies.into_iter().flatten() {
        if let BroadcastPart::Line(raw) = reply {
            // raw carries the two status bytes then the value
            let st = u16::from_be_bytes([raw[0], raw[1]]);
            if st != status::SUCCESS {
                bad_status.get_or_insert(st);
            } else if version_value.is_none() && raw.len() > 2 {
                version_value = Some(raw[2..].to_vec());
            }
        }
    }

    let st = bad_status.unwrap_or(status::SUCCESS);
    let value = if loud_opcode == opcode::VERSION && st == status::SUCCESS {
        version_value.unwrap_or_default()
    } else {
        Vec::new()
    };
    Ok(BinPacket::response(loud_opcode, st, &[], &[], &value)
        .with_opaque(packet.header.opaque)
        .to_bytes())
}

async fn broadcast_one_binary(
    ctx: &Rc<WorkerCtx>,
    server: usize,
    packet: &BinPacket,
    quiet: bool,
) -> Result<Option<BroadcastPart>, MuxyError> {
    let mut forward = packet.clone();
    forward.header.vbucket_or_status = 0;
    if quiet {
        forward.header.opaque = muxy_protocol::binary::OPAQUE_IGNORE_REPLY;
    }
    let is_stats = muxy_protocol::command::loud_variant(packet.header.opcode) == opcode::STAT;

    let mut conn = acquire_conn(ctx, server).await?;
    let exchange = async {
        conn.write_frame(forward.to_bytes(), !quiet).await?;
        if quiet {
            return Ok(None);
        }
        if is_stats {
            let entries = gather_binary_stats(&mut conn).await?;
            return Ok(Some(BroadcastPart::Stats(entries)));
        }
        let reply = conn.read_packet().await?;
        conn.mark_clean();
        // pack status + value for the reducer
        let mut raw = reply.status().to_be_bytes().to_vec();
        raw.extend_from_slice(&reply.value);
        Ok(Some(BroadcastPart::Line(raw)))
    };

    let exchanged = match reply_deadline(&ctx.bucket.behavior) {
        Some(deadline) => match monoio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_elapsed) => {
                let scrubbed = conn.scrubbed().to_string();
                fail_conn(ctx, conn);
                bump(&ctx.stats.tot_downstream_timeouts);
                return Err(MuxyError::DownstreamTimeout(scrubbed));
            }
        },
        None => exchange.await,
    };

    match exchanged {
        Ok(part) => {
            conn.mark_clean();
            release(ctx, conn, true);
            Ok(part)
        }
        Err(e) => {
            fail_conn(ctx, conn);
            Err(e)
        }
    }
}

/// A batch of quiet binary gets (GETQ/GETKQ) terminated upstream by a
/// NOOP: fan out per server as GETKQ+NOOP, then answer hits in request
/// order with the client's own opcodes and opaques, closing with the
/// NOOP response.
pub async fn run_binary_get_batch(
    ctx: &Rc<WorkerCtx>,
    batch: &[BinPacket],
    noop_opaque: Option<u32>,
) -> Result<Vec<u8>, MuxyError> {
    if ascii_downstream(ctx) {
        let mut out = Vec::new();
        if let Some(opaque) = noop_opaque {
            out = BinPacket::response(opcode::NOOP, status::NOT_SUPPORTED, &[], &[], &[])
                .with_opaque(opaque)
                .to_bytes();
        }
        return Ok(out);
    }

    let limit = max_attempts(ctx);
    let mut attempt = 0u32;
    // batch index → gathered frame
    let mut hits: HashMap<usize, ValueFrame> = HashMap::new();
    let mut pending: Vec<usize> = (0..batch.len()).collect();

    while !pending.is_empty() {
        let mut groups: Vec<(usize, Vec<(Vec<u8>, u16)>, Vec<usize>)> = Vec::new();
        for batch_index in pending.drain(..) {
            let key = &batch[batch_index].key;
            let target = ctx.route(key)?;
            let vbucket = target.vbucket.max(0) as u16;
            match groups.iter_mut().find(|(server, _, _)| *server == target.server) {
                Some((_, group, indices)) => {
                    group.push((key.clone(), vbucket));
                    indices.push(batch_index);
                }
                None => groups.push((target.server, vec![(key.clone(), vbucket)], vec![batch_index])),
            }
        }

        for (server, group, indices) in groups {
            match fetch_group(ctx, server, &group).await {
                Ok(outcome) => {
                    for frame in outcome.values {
                        if let Some(position) = group.iter().position(|(k, _)| *k == frame.key) {
                            hits.insert(indices[position], frame);
                        }
                    }
                    for (key, vbucket, old_master) in outcome.not_my_vbucket {
                        ctx.mark_bad_master(vbucket, old_master);
                        bump(&ctx.stats.tot_retries);
                        bump(&ctx.stats.tot_retries_not_my_vbucket);
                        if let Some(position) = group.iter().position(|(k, _)| *k == key) {
                            pending.push(indices[position]);
                        }
                    }
                }
                Err(GroupError::Retryable) => {
                    bump(&ctx.stats.tot_retries);
                    pending.extend(indices);
                }
                Err(GroupError::Fatal(e)) => return Err(e),
            }
        }

        if pending.is_empty() {
            break;
        }
        attempt += 1;
        if attempt > limit {
            break; // leftovers surface as quiet-get misses
        }
    }

    let mut out = Vec::new();
    for (index, request) in batch.iter().enumerate() {
        let Some(frame) = hits.get(&index) else { continue };
        let mut extras = Vec::with_capacity(4);
        extras.extend_from_slice(&frame.flags.to_be_bytes());
        let with_key = request.header.opcode == opcode::GETKQ;
        BinPacket::response(
            request.header.opcode,
            status::SUCCESS,
            &extras,
            if with_key { &frame.key } else { &[] },
            &frame.data,
        )
        .with_opaque(request.header.opaque)
        .with_cas(frame.cas.unwrap_or(0))
        .encode_into(&mut out);
    }
    if let Some(opaque) = noop_opaque {
        BinPacket::response(opcode::NOOP, status::SUCCESS, &[], &[], &[])
            .with_opaque(opaque)
            .encode_into(&mut out);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_preserves_order_and_counts() {
        let keys = vec![b"a".to_vec(), b"b".to_vec(), b"a".to_vec(), b"a".to_vec()];
        let (order, interest) = dedupe_keys(&keys);
        assert_eq!(order, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(interest[&b"a".to_vec()], 3);
        assert_eq!(interest[&b"b".to_vec()], 1);
    }

    #[test]
    fn dedupe_single_key() {
        let keys = vec![b"x".to_vec()];
        let (order, interest) = dedupe_keys(&keys);
        assert_eq!(order.len(), 1);
        assert_eq!(interest[&b"x".to_vec()], 1);
    }
}
