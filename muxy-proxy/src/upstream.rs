//! The client-facing connection driver: protocol sniffing, command
//! parsing (ASCII line/body phases, binary framing), and dispatch into
//! the request engine. One task per accepted socket.

use crate::io::BufferedStream;
use crate::request;
use crate::worker::WorkerCtx;
use monoio::net::TcpStream;
use muxy_core::MuxyError;
use muxy_core::behavior::UpstreamProtocol;
use muxy_core::error::status;
use muxy_protocol::ascii::{self, AsciiParseError, AsciiRequest};
use muxy_protocol::binary::{BinHeader, BinPacket, HEADER_LEN, MAGIC_REQUEST, opcode};
use muxy_protocol::command;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::Ordering;

/// Hard cap on one command's body; anything larger is a protocol error,
/// not a buffer to allocate.
const MAX_BODY_LEN: usize = 64 << 20;

#[inline]
fn bump(counter: &std::sync::atomic::AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub async fn serve_upstream(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Rc<WorkerCtx>,
) -> anyhow::Result<()> {
    let mut io = BufferedStream::new(stream);
    let binary = match ctx.bucket.behavior.upstream_protocol {
        UpstreamProtocol::Ascii => false,
        UpstreamProtocol::Binary => true,
        UpstreamProtocol::Auto => {
            // sniff the first byte without consuming it
            if !io.fill_to(1).await? {
                return Ok(());
            }
            io.buffered()[0] == MAGIC_REQUEST
        }
    };
    tracing::debug!(peer = %peer, binary, bucket = %ctx.bucket.name, "Upstream connection");
    if binary { serve_binary(io, ctx).await } else { serve_ascii(io, ctx).await }
}

// ── ASCII clients ─────────────────────────────────────────────

async fn serve_ascii(mut io: BufferedStream, ctx: Rc<WorkerCtx>) -> anyhow::Result<()> {
    loop {
        let Some(line) = io.read_line().await? else {
            return Ok(());
        };
        if line.is_empty() {
            continue;
        }
        bump(&ctx.stats.tot_upstream_cmds);

        let mut req = match ascii::parse_request(&line) {
            Ok(req) => req,
            Err(AsciiParseError::UnknownCommand) => {
                io.write_all(b"ERROR\r\n".to_vec()).await?;
                continue;
            }
            Err(AsciiParseError::Client(msg)) => {
                bump(&ctx.stats.tot_upstream_protocol_errors);
                io.write_all(format!("CLIENT_ERROR {msg}\r\n").into_bytes()).await?;
                return Ok(());
            }
        };

        // storage commands: second phase reads exactly bytes+2 octets
        if let AsciiRequest::Store { bytes, data, .. } = &mut req {
            if *bytes > MAX_BODY_LEN {
                bump(&ctx.stats.tot_upstream_protocol_errors);
                io.write_all(b"SERVER_ERROR object too large for cache\r\n".to_vec()).await?;
                return Ok(());
            }
            let mut chunk = io.read_exact(*bytes + 2).await?;
            if chunk[*bytes..] != *b"\r\n" {
                bump(&ctx.stats.tot_upstream_protocol_errors);
                io.write_all(b"CLIENT_ERROR bad data chunk\r\n".to_vec()).await?;
                return Ok(());
            }
            chunk.truncate(*bytes);
            *data = chunk;
        }

        if matches!(req, AsciiRequest::Quit) {
            return Ok(());
        }

        // the proxy answers for itself; no fan-out
        if let AsciiRequest::Stats { arg: Some(arg) } = &req
            && arg == b"proxy"
        {
            io.write_all(ctx.shared.stats.render_ascii()).await?;
            continue;
        }

        ctx.maybe_adopt();
        let noreply = req.noreply();

        let slot = match ctx.admit().await {
            Ok(slot) => slot,
            Err(e) => {
                if !noreply {
                    io.write_all(e.ascii_line()).await?;
                }
                continue;
            }
        };
        let result = request::run_ascii(&ctx, &req).await;
        drop(slot);

        match result {
            Ok(bytes) => {
                if !bytes.is_empty() {
                    io.write_all(bytes).await?;
                }
            }
            Err(e @ MuxyError::Client(_)) => {
                bump(&ctx.stats.tot_upstream_protocol_errors);
                io.write_all(e.ascii_line()).await?;
                return Ok(());
            }
            Err(e) => {
                // noreply clients asked to hear nothing, errors included
                if !noreply {
                    io.write_all(e.ascii_line()).await?;
                }
            }
        }
    }
}

// ── Binary clients ────────────────────────────────────────────

fn binary_error(packet: &BinPacket, e: &MuxyError) -> Vec<u8> {
    BinPacket::response(packet.header.opcode, e.binary_status(), &[], &[], e.to_string().as_bytes())
        .with_opaque(packet.header.opaque)
        .to_bytes()
}

fn render_binary_proxy_stats(ctx: &WorkerCtx, opaque: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(1024);
    let mut num = itoa::Buffer::new();
    for (name, value) in ctx.shared.stats.snapshot() {
        BinPacket::response(opcode::STAT, status::SUCCESS, &[], name.as_bytes(), num.format(value).as_bytes())
            .with_opaque(opaque)
            .encode_into(&mut out);
    }
    BinPacket::response(opcode::STAT, status::SUCCESS, &[], &[], &[])
        .with_opaque(opaque)
        .encode_into(&mut out);
    out
}

async fn serve_binary(mut io: BufferedStream, ctx: Rc<WorkerCtx>) -> anyhow::Result<()> {
    // GETQ/GETKQ runs accumulate here until a loud command closes the
    // batch (normally the client's NOOP barrier)
    let mut quiet_gets: Vec<BinPacket> = Vec::new();

    loop {
        if !io.fill_to(HEADER_LEN).await? {
            return Ok(());
        }
        let header = match BinHeader::expect_request(io.buffered()) {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!(error = %e, "Binary client framing error");
                bump(&ctx.stats.tot_upstream_protocol_errors);
                return Ok(());
            }
        };
        if header.body_len as usize > MAX_BODY_LEN {
            bump(&ctx.stats.tot_upstream_protocol_errors);
            return Ok(());
        }
        let total = HEADER_LEN + header.body_len as usize;
        if !io.fill_to(total).await? {
            return Ok(());
        }
        let frame = io.read_exact(total).await?;
        let packet = match BinPacket::from_body(header, &frame[HEADER_LEN..]) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "Binary client framing error");
                bump(&ctx.stats.tot_upstream_protocol_errors);
                return Ok(());
            }
        };
        bump(&ctx.stats.tot_upstream_cmds);
        let op = packet.header.opcode;

        if op == opcode::GETQ || op == opcode::GETKQ {
            quiet_gets.push(packet);
            continue;
        }

        ctx.maybe_adopt();

        // a loud command closes any accumulated quiet-get batch; a NOOP
        // doubles as the batch terminator and is answered by the batch
        if !quiet_gets.is_empty() {
            let batch = std::mem::take(&mut quiet_gets);
            let noop_opaque = (op == opcode::NOOP).then_some(packet.header.opaque);
            match ctx.admit().await {
                Ok(_slot) => match request::run_binary_get_batch(&ctx, &batch, noop_opaque).await {
                    Ok(bytes) => {
                        if !bytes.is_empty() {
                            io.write_all(bytes).await?;
                        }
                    }
                    Err(e) => io.write_all(binary_error(&packet, &e)).await?,
                },
                Err(e) => io.write_all(binary_error(&packet, &e)).await?,
            }
            if noop_opaque.is_some() {
                continue;
            }
        }

        match op {
            opcode::QUIT => {
                let reply = BinPacket::response(op, status::SUCCESS, &[], &[], &[])
                    .with_opaque(packet.header.opaque)
                    .to_bytes();
                io.write_all(reply).await?;
                return Ok(());
            }
            opcode::QUITQ => return Ok(()),
            // upstream SASL is never proxied; credentials belong to the
            // proxy's own downstream configuration
            opcode::SASL_AUTH | opcode::SASL_LIST_MECHS | opcode::SASL_STEP
            | opcode::SELECT_BUCKET => {
                let reply = BinPacket::response(op, status::NOT_SUPPORTED, &[], &[], &[])
                    .with_opaque(packet.header.opaque)
                    .to_bytes();
                io.write_all(reply).await?;
                continue;
            }
            opcode::STAT if packet.key == b"proxy" => {
                io.write_all(render_binary_proxy_stats(&ctx, packet.header.opaque)).await?;
                continue;
            }
            _ if !command::is_forwardable(op) => {
                bump(&ctx.stats.tot_upstream_protocol_errors);
                let reply = BinPacket::response(op, status::UNKNOWN_COMMAND, &[], &[], &[])
                    .with_opaque(packet.header.opaque)
                    .to_bytes();
                io.write_all(reply).await?;
                continue;
            }
            _ => {}
        }

        let quiet = command::is_quiet(op);
        let slot = match ctx.admit().await {
            Ok(slot) => slot,
            Err(e) => {
                if !quiet {
                    io.write_all(binary_error(&packet, &e)).await?;
                }
                continue;
            }
        };
        let result = request::run_binary(&ctx, &packet).await;
        drop(slot);

        match result {
            Ok(bytes) => {
                if !bytes.is_empty() {
                    io.write_all(bytes).await?;
                }
            }
            Err(e) => {
                if !quiet {
                    io.write_all(binary_error(&packet, &e)).await?;
                }
            }
        }
    }
}
