//! ASCII↔binary translation: request encoders for the a2b path and the
//! binary-status → ASCII-reply mapping.

use crate::ascii::StoreVerb;
use crate::binary::{BinPacket, OPAQUE_IGNORE_REPLY, opcode};
use crate::command::store_spec;
use muxy_core::error::status;

/// What ASCII command a binary response answers; picks the success line
/// and the two status special cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyContext {
    Store(StoreVerb),
    Delete,
    Touch,
    Flush,
}

/// Map a binary response status to the upstream ASCII line (with
/// trailing `\r\n`). NOT_MY_VBUCKET is not mapped here — it triggers a
/// retry and must never reach the client.
pub fn response_line(ctx: ReplyContext, st: u16) -> Vec<u8> {
    let line: &[u8] = match st {
        status::SUCCESS => match ctx {
            ReplyContext::Store(_) => b"STORED",
            ReplyContext::Delete => b"DELETED",
            ReplyContext::Touch => b"TOUCHED",
            ReplyContext::Flush => b"OK",
        },
        status::KEY_ENOENT => match ctx {
            ReplyContext::Store(StoreVerb::Replace) => b"NOT_STORED",
            _ => b"NOT_FOUND",
        },
        status::KEY_EEXISTS => match ctx {
            ReplyContext::Store(StoreVerb::Add) => b"NOT_STORED",
            _ => b"EXISTS",
        },
        other => return error_line(other),
    };
    let mut out = line.to_vec();
    out.extend_from_slice(b"\r\n");
    out
}

/// The non-success → ASCII error mapping shared by every command shape.
pub fn error_line(st: u16) -> Vec<u8> {
    let line: &[u8] = match st {
        status::NOT_STORED => b"NOT_STORED",
        status::KEY_ENOENT => b"NOT_FOUND",
        status::KEY_EEXISTS => b"EXISTS",
        status::E2BIG => b"SERVER_ERROR a2b e2big",
        status::EINVAL => b"SERVER_ERROR a2b einval",
        status::DELTA_BADVAL => b"SERVER_ERROR a2b delta_badval",
        status::NOT_MY_VBUCKET => b"SERVER_ERROR a2b not_my_vbucket",
        status::AUTH_ERROR => b"SERVER_ERROR a2b auth_error",
        status::AUTH_CONTINUE => b"SERVER_ERROR a2b auth_continue",
        status::UNKNOWN_COMMAND => b"SERVER_ERROR a2b unknown",
        status::ENOMEM => b"SERVER_ERROR a2b out of memory",
        status::NOT_SUPPORTED => b"SERVER_ERROR a2b not supported",
        status::EINTERNAL => b"SERVER_ERROR a2b einternal",
        status::EBUSY => b"SERVER_ERROR a2b ebusy",
        status::ETMPFAIL => b"SERVER_ERROR temporary failure",
        _ => b"SERVER_ERROR a2b error",
    };
    let mut out = line.to_vec();
    out.extend_from_slice(b"\r\n");
    out
}

/// Render a binary incr/decr success value (8-byte BE counter) as the
/// ASCII decimal reply.
pub fn arith_value_line(value: &[u8]) -> Vec<u8> {
    let mut bytes = [0u8; 8];
    let n = value.len().min(8);
    bytes[8 - n..].copy_from_slice(&value[value.len() - n..]);
    let mut num = itoa::Buffer::new();
    let mut out = num.format(u64::from_be_bytes(bytes)).as_bytes().to_vec();
    out.extend_from_slice(b"\r\n");
    out
}

/// Flags live in the first four extras bytes of a binary get response.
pub fn flags_from_extras(extras: &[u8]) -> u32 {
    if extras.len() < 4 {
        return 0;
    }
    u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
}

// ── a2b request encoders ──────────────────────────────────────

/// Switch to the quiet twin (when one exists) and stamp the sentinel
/// opaque. Opcodes with no quiet twin keep their opcode but still get
/// the sentinel: the proxy skips reading their reply, and the sentinel
/// lets the downstream reader drop that frame when it surfaces later.
fn maybe_quiet(packet: BinPacket, quiet: bool) -> BinPacket {
    if quiet {
        let mut p = packet;
        p.header.opcode = crate::command::quiet_variant(p.header.opcode);
        p.header.opaque = OPAQUE_IGNORE_REPLY;
        p
    } else {
        packet
    }
}

/// `set|add|replace|append|prepend|cas` → the storage opcode with
/// flags/exptime extras (cas rides the header's cas field).
pub fn encode_store(
    verb: StoreVerb,
    key: &[u8],
    flags: u32,
    exptime: u32,
    cas: u64,
    data: &[u8],
    vbucket: u16,
    quiet: bool,
) -> BinPacket {
    let spec = store_spec(verb);
    let mut extras = Vec::with_capacity(spec.ext_len as usize);
    if spec.ext_len == 8 {
        extras.extend_from_slice(&flags.to_be_bytes());
        extras.extend_from_slice(&exptime.to_be_bytes());
    }
    let packet = BinPacket::request(spec.opcode, vbucket, &extras, key, data).with_cas(cas);
    maybe_quiet(packet, quiet)
}

/// Single-key get → GETK, so the response carries the key for the
/// upstream `VALUE` line.
pub fn encode_get(key: &[u8], vbucket: u16) -> BinPacket {
    BinPacket::request(opcode::GETK, vbucket, &[], key, &[])
}

/// Multi-get member → GETKQ with the key's position as opaque; the
/// batch is terminated by a NOOP.
pub fn encode_getkq(key: &[u8], vbucket: u16, opaque: u32) -> BinPacket {
    BinPacket::request(opcode::GETKQ, vbucket, &[], key, &[]).with_opaque(opaque)
}

pub fn encode_delete(key: &[u8], vbucket: u16, quiet: bool) -> BinPacket {
    maybe_quiet(BinPacket::request(opcode::DELETE, vbucket, &[], key, &[]), quiet)
}

/// incr/decr → 20-byte extras (delta, initial, expiration). Expiration
/// `0xffffffff` keeps ASCII semantics: no auto-create on miss.
pub fn encode_arith(incr: bool, key: &[u8], delta: u64, vbucket: u16, quiet: bool) -> BinPacket {
    let mut extras = Vec::with_capacity(20);
    extras.extend_from_slice(&delta.to_be_bytes());
    extras.extend_from_slice(&0u64.to_be_bytes());
    extras.extend_from_slice(&u32::MAX.to_be_bytes());
    let op = if incr { opcode::INCREMENT } else { opcode::DECREMENT };
    maybe_quiet(BinPacket::request(op, vbucket, &extras, key, &[]), quiet)
}

pub fn encode_touch(key: &[u8], exptime: u32, vbucket: u16, quiet: bool) -> BinPacket {
    maybe_quiet(BinPacket::request(opcode::TOUCH, vbucket, &exptime.to_be_bytes(), key, &[]), quiet)
}

pub fn encode_flush(delay: Option<u32>, quiet: bool) -> BinPacket {
    let extras = delay.map(|d| d.to_be_bytes().to_vec()).unwrap_or_default();
    maybe_quiet(BinPacket::request(opcode::FLUSH, 0, &extras, &[], &[]), quiet)
}

pub fn encode_version() -> BinPacket {
    BinPacket::request(opcode::VERSION, 0, &[], &[], &[])
}

pub fn encode_stat(arg: Option<&[u8]>) -> BinPacket {
    BinPacket::request(opcode::STAT, 0, &[], arg.unwrap_or_default(), &[])
}

pub fn encode_verbosity(level: u32, quiet: bool) -> BinPacket {
    maybe_quiet(BinPacket::request(opcode::VERBOSITY, 0, &level.to_be_bytes(), &[], &[]), quiet)
}
