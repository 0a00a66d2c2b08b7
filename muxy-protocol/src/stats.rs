//! Merging broadcast STATS responses from several backends into one
//! client-facing table.

use crate::binary::{BinPacket, opcode};
use std::collections::BTreeMap;

/// How two backends' values for one stat name combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeRule {
    /// Identity-like values: keep the first backend's answer.
    First,
    /// Monotonic-ish values where the minimum is the honest aggregate.
    Smallest,
    /// Everything else: add them up.
    Sum,
}

fn rule_for(name: &str) -> MergeRule {
    match name {
        "pid" | "version" | "libevent" | "ep_dbname" | "ep_storage_type" | "ep_flusher_state"
        | "ep_warmup_thread" => MergeRule::First,
        "uptime" | "time" | "pointer_size" | "limit_maxbytes" | "accepting_conns" => {
            MergeRule::Smallest
        }
        n if n.ends_with(":chunk_size") || n.ends_with(":chunk_per_page") || n.ends_with(":age") => {
            MergeRule::Smallest
        }
        _ => MergeRule::Sum,
    }
}

fn merge_smallest(a: &str, b: &str) -> String {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => {
            if y < x { b.to_string() } else { a.to_string() }
        }
        _ => a.to_string(),
    }
}

/// Sum two stat values: unsigned 64-bit unless either side carries a
/// decimal point, floating point then. Unparsable values keep the
/// first operand.
fn merge_sum(a: &str, b: &str) -> String {
    let dotted = a.contains('.') || b.contains('.');
    if dotted {
        match (a.parse::<f64>(), b.parse::<f64>()) {
            (Ok(x), Ok(y)) => return format!("{}", x + y),
            _ => return a.to_string(),
        }
    }
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.wrapping_add(y).to_string(),
        _ => a.to_string(),
    }
}

/// Accumulates `STAT name value` lines from every reserved downstream
/// of a broadcast STATS request.
#[derive(Debug, Default)]
pub struct StatsMerger {
    entries: BTreeMap<String, String>,
}

impl StatsMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn merge(&mut self, name: &str, value: &str) {
        match self.entries.get_mut(name) {
            None => {
                self.entries.insert(name.to_string(), value.to_string());
            }
            Some(existing) => {
                let merged = match rule_for(name) {
                    MergeRule::First => return,
                    MergeRule::Smallest => merge_smallest(existing, value),
                    MergeRule::Sum => merge_sum(existing, value),
                };
                *existing = merged;
            }
        }
    }

    pub fn merge_line(&mut self, name: &[u8], value: &[u8]) {
        self.merge(&String::from_utf8_lossy(name), &String::from_utf8_lossy(value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|s| s.as_str())
    }

    /// `STAT name value\r\n…END\r\n`
    pub fn flush_ascii(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(b"STAT ");
            out.extend_from_slice(name.as_bytes());
            out.push(b' ');
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"END\r\n");
    }

    /// One STAT response packet per entry, then the empty terminator.
    pub fn flush_binary(&self, opaque: u32, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            BinPacket::response(opcode::STAT, 0, &[], name.as_bytes(), value.as_bytes())
                .with_opaque(opaque)
                .encode_into(out);
        }
        BinPacket::response(opcode::STAT, 0, &[], &[], &[]).with_opaque(opaque).encode_into(out);
    }
}
