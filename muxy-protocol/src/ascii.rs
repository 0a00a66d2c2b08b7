use crate::MAX_KEY_LEN;
use thiserror::Error;

/// The storage-family verbs: command line followed by a `bytes+2` data
/// chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StoreVerb {
    pub fn name(&self) -> &'static str {
        match self {
            StoreVerb::Set => "set",
            StoreVerb::Add => "add",
            StoreVerb::Replace => "replace",
            StoreVerb::Append => "append",
            StoreVerb::Prepend => "prepend",
            StoreVerb::Cas => "cas",
        }
    }
}

/// A parsed ASCII command line. Storage commands carry their value in
/// `data`, filled by the upstream driver's second read phase.
#[derive(Debug, Clone, PartialEq)]
pub enum AsciiRequest {
    Get {
        keys: Vec<Vec<u8>>,
        with_cas: bool,
    },
    Store {
        verb: StoreVerb,
        key: Vec<u8>,
        flags: u32,
        exptime: u32,
        bytes: usize,
        cas: u64,
        noreply: bool,
        data: Vec<u8>,
    },
    Delete {
        key: Vec<u8>,
        noreply: bool,
    },
    Arith {
        incr: bool,
        key: Vec<u8>,
        delta: u64,
        noreply: bool,
    },
    Touch {
        key: Vec<u8>,
        exptime: u32,
        noreply: bool,
    },
    FlushAll {
        delay: Option<u32>,
        noreply: bool,
    },
    Stats {
        arg: Option<Vec<u8>>,
    },
    Version,
    Verbosity {
        level: u32,
        noreply: bool,
    },
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AsciiParseError {
    /// Rendered upstream as a bare `ERROR\r\n`.
    #[error("unknown command")]
    UnknownCommand,

    /// Rendered upstream as `CLIENT_ERROR {0}\r\n` and the connection
    /// is closed.
    #[error("{0}")]
    Client(String),
}

fn bad_line() -> AsciiParseError {
    AsciiParseError::Client("bad command line format".into())
}

fn check_key(key: &[u8]) -> Result<Vec<u8>, AsciiParseError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(bad_line());
    }
    Ok(key.to_vec())
}

fn parse_num<T: std::str::FromStr>(token: &[u8]) -> Result<T, AsciiParseError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(bad_line)
}

fn is_noreply(token: Option<&&[u8]>) -> bool {
    matches!(token, Some(t) if *t == b"noreply")
}

/// Parse one command line (without the trailing `\r\n`).
pub fn parse_request(line: &[u8]) -> Result<AsciiRequest, AsciiParseError> {
    let tokens: Vec<&[u8]> = line.split(|&b| b == b' ').filter(|t| !t.is_empty()).collect();
    let Some(&verb) = tokens.first() else {
        return Err(AsciiParseError::UnknownCommand);
    };

    match verb {
        b"get" | b"gets" => {
            if tokens.len() < 2 {
                return Err(bad_line());
            }
            let keys = tokens[1..]
                .iter()
                .map(|k| check_key(k))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(AsciiRequest::Get { keys, with_cas: verb == b"gets" })
        }
        b"set" | b"add" | b"replace" | b"append" | b"prepend" | b"cas" => {
            let store_verb = match verb {
                b"set" => StoreVerb::Set,
                b"add" => StoreVerb::Add,
                b"replace" => StoreVerb::Replace,
                b"append" => StoreVerb::Append,
                b"prepend" => StoreVerb::Prepend,
                _ => StoreVerb::Cas,
            };
            let want = if store_verb == StoreVerb::Cas { 6 } else { 5 };
            if tokens.len() < want {
                return Err(bad_line());
            }
            let key = check_key(tokens[1])?;
            let flags = parse_num(tokens[2])?;
            let exptime = parse_num(tokens[3])?;
            let bytes = parse_num(tokens[4])?;
            let cas = if store_verb == StoreVerb::Cas { parse_num(tokens[5])? } else { 0 };
            let noreply = is_noreply(tokens.get(want));
            if tokens.len() > want + usize::from(noreply) {
                return Err(bad_line());
            }
            Ok(AsciiRequest::Store {
                verb: store_verb,
                key,
                flags,
                exptime,
                bytes,
                cas,
                noreply,
                data: Vec::new(),
            })
        }
        b"delete" => {
            if tokens.len() < 2 {
                return Err(bad_line());
            }
            let key = check_key(tokens[1])?;
            // tolerate the legacy "delete <key> <time>" form
            let mut rest = 2;
            if tokens.get(rest).is_some_and(|t| t.iter().all(|b| b.is_ascii_digit())) {
                rest += 1;
            }
            Ok(AsciiRequest::Delete { key, noreply: is_noreply(tokens.get(rest)) })
        }
        b"incr" | b"decr" => {
            if tokens.len() < 3 {
                return Err(bad_line());
            }
            Ok(AsciiRequest::Arith {
                incr: verb == b"incr",
                key: check_key(tokens[1])?,
                delta: parse_num(tokens[2])?,
                noreply: is_noreply(tokens.get(3)),
            })
        }
        b"touch" => {
            if tokens.len() < 3 {
                return Err(bad_line());
            }
            Ok(AsciiRequest::Touch {
                key: check_key(tokens[1])?,
                exptime: parse_num(tokens[2])?,
                noreply: is_noreply(tokens.get(3)),
            })
        }
        b"flush_all" => {
            let mut delay = None;
            let mut rest = 1;
            if let Some(t) = tokens.get(1)
                && t.iter().all(|b| b.is_ascii_digit())
                && !t.is_empty()
            {
                delay = Some(parse_num(t)?);
                rest = 2;
            }
            Ok(AsciiRequest::FlushAll { delay, noreply: is_noreply(tokens.get(rest)) })
        }
        b"stats" => Ok(AsciiRequest::Stats { arg: tokens.get(1).map(|t| t.to_vec()) }),
        b"version" => Ok(AsciiRequest::Version),
        b"verbosity" => {
            if tokens.len() < 2 {
                return Err(bad_line());
            }
            Ok(AsciiRequest::Verbosity {
                level: parse_num(tokens[1])?,
                noreply: is_noreply(tokens.get(2)),
            })
        }
        b"quit" => Ok(AsciiRequest::Quit),
        _ => Err(AsciiParseError::UnknownCommand),
    }
}

impl AsciiRequest {
    pub fn noreply(&self) -> bool {
        match self {
            AsciiRequest::Store { noreply, .. }
            | AsciiRequest::Delete { noreply, .. }
            | AsciiRequest::Arith { noreply, .. }
            | AsciiRequest::Touch { noreply, .. }
            | AsciiRequest::FlushAll { noreply, .. }
            | AsciiRequest::Verbosity { noreply, .. } => *noreply,
            _ => false,
        }
    }

    /// Commands that fan out to every backend.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            AsciiRequest::FlushAll { .. }
                | AsciiRequest::Stats { .. }
                | AsciiRequest::Version
                | AsciiRequest::Verbosity { .. }
        )
    }

    /// Re-emit the canonical command line (with trailing `\r\n`).
    /// Storage data chunks are appended by the caller.
    pub fn encode_line(&self, out: &mut Vec<u8>) {
        let mut num = itoa::Buffer::new();
        match self {
            AsciiRequest::Get { keys, with_cas } => {
                out.extend_from_slice(if *with_cas { b"gets" } else { b"get" });
                for key in keys {
                    out.push(b' ');
                    out.extend_from_slice(key);
                }
            }
            AsciiRequest::Store { verb, key, flags, exptime, bytes, cas, noreply, .. } => {
                out.extend_from_slice(verb.name().as_bytes());
                out.push(b' ');
                out.extend_from_slice(key);
                for n in [*flags as u64, *exptime as u64, *bytes as u64] {
                    out.push(b' ');
                    out.extend_from_slice(num.format(n).as_bytes());
                }
                if *verb == StoreVerb::Cas {
                    out.push(b' ');
                    out.extend_from_slice(num.format(*cas).as_bytes());
                }
                if *noreply {
                    out.extend_from_slice(b" noreply");
                }
            }
            AsciiRequest::Delete { key, noreply } => {
                out.extend_from_slice(b"delete ");
                out.extend_from_slice(key);
                if *noreply {
                    out.extend_from_slice(b" noreply");
                }
            }
            AsciiRequest::Arith { incr, key, delta, noreply } => {
                out.extend_from_slice(if *incr { b"incr " } else { b"decr " });
                out.extend_from_slice(key);
                out.push(b' ');
                out.extend_from_slice(num.format(*delta).as_bytes());
                if *noreply {
                    out.extend_from_slice(b" noreply");
                }
            }
            AsciiRequest::Touch { key, exptime, noreply } => {
                out.extend_from_slice(b"touch ");
                out.extend_from_slice(key);
                out.push(b' ');
                out.extend_from_slice(num.format(*exptime).as_bytes());
                if *noreply {
                    out.extend_from_slice(b" noreply");
                }
            }
            AsciiRequest::FlushAll { delay, noreply } => {
                out.extend_from_slice(b"flush_all");
                if let Some(d) = delay {
                    out.push(b' ');
                    out.extend_from_slice(num.format(*d).as_bytes());
                }
                if *noreply {
                    out.extend_from_slice(b" noreply");
                }
            }
            AsciiRequest::Stats { arg } => {
                out.extend_from_slice(b"stats");
                if let Some(a) = arg {
                    out.push(b' ');
                    out.extend_from_slice(a);
                }
            }
            AsciiRequest::Version => out.extend_from_slice(b"version"),
            AsciiRequest::Verbosity { level, noreply } => {
                out.extend_from_slice(b"verbosity ");
                out.extend_from_slice(num.format(*level).as_bytes());
                if *noreply {
                    out.extend_from_slice(b" noreply");
                }
            }
            AsciiRequest::Quit => out.extend_from_slice(b"quit"),
        }
        out.extend_from_slice(b"\r\n");
    }
}

// ── Downstream response lines ─────────────────────────────────

/// One classified line of an ASCII response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsciiResponseLine {
    /// `VALUE <key> <flags> <bytes> [cas]` — a data chunk follows.
    Value { key: Vec<u8>, flags: u32, bytes: usize, cas: Option<u64> },
    /// `END` — terminator of a get/gets/stats response.
    End,
    /// `STAT <name> <value>`
    Stat { name: Vec<u8>, value: Vec<u8> },
    /// Any other single-line terminal (`STORED`, `NOT_FOUND`, an
    /// integer reply, `VERSION …`, `OK`, errors, …).
    Line(Vec<u8>),
}

pub fn parse_response_line(line: &[u8]) -> Result<AsciiResponseLine, AsciiParseError> {
    if line == b"END" {
        return Ok(AsciiResponseLine::End);
    }
    if let Some(rest) = line.strip_prefix(b"VALUE ") {
        let tokens: Vec<&[u8]> = rest.split(|&b| b == b' ').filter(|t| !t.is_empty()).collect();
        if tokens.len() < 3 {
            return Err(bad_line());
        }
        return Ok(AsciiResponseLine::Value {
            key: tokens[0].to_vec(),
            flags: parse_num(tokens[1])?,
            bytes: parse_num(tokens[2])?,
            cas: match tokens.get(3) {
                Some(t) => Some(parse_num(t)?),
                None => None,
            },
        });
    }
    if let Some(rest) = line.strip_prefix(b"STAT ") {
        let mut split = rest.splitn(2, |&b| b == b' ');
        let name = split.next().unwrap_or_default().to_vec();
        let value = split.next().unwrap_or_default().to_vec();
        if name.is_empty() {
            return Err(bad_line());
        }
        return Ok(AsciiResponseLine::Stat { name, value });
    }
    Ok(AsciiResponseLine::Line(line.to_vec()))
}

/// Emit a `VALUE` header line followed by the data chunk.
pub fn emit_value(out: &mut Vec<u8>, key: &[u8], flags: u32, data: &[u8], cas: Option<u64>) {
    let mut num = itoa::Buffer::new();
    out.extend_from_slice(b"VALUE ");
    out.extend_from_slice(key);
    out.push(b' ');
    out.extend_from_slice(num.format(flags).as_bytes());
    out.push(b' ');
    out.extend_from_slice(num.format(data.len()).as_bytes());
    if let Some(cas) = cas {
        out.push(b' ');
        out.extend_from_slice(num.format(cas).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_multi() {
        let req = parse_request(b"get a b c").unwrap();
        assert_eq!(
            req,
            AsciiRequest::Get {
                keys: vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
                with_cas: false
            }
        );
        assert!(!req.noreply());
        assert!(!req.is_broadcast());
    }

    #[test]
    fn test_parse_gets_carries_cas_flag() {
        assert!(matches!(
            parse_request(b"gets a").unwrap(),
            AsciiRequest::Get { with_cas: true, .. }
        ));
    }

    #[test]
    fn test_parse_set() {
        let req = parse_request(b"set k 12 0 5").unwrap();
        match req {
            AsciiRequest::Store { verb, key, flags, exptime, bytes, noreply, .. } => {
                assert_eq!(verb, StoreVerb::Set);
                assert_eq!(key, b"k".to_vec());
                assert_eq!(flags, 12);
                assert_eq!(exptime, 0);
                assert_eq!(bytes, 5);
                assert!(!noreply);
            }
            other => panic!("expected Store, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_set_noreply() {
        assert!(parse_request(b"set k 0 0 3 noreply").unwrap().noreply());
    }

    #[test]
    fn test_parse_cas_requires_cas_token() {
        assert!(parse_request(b"cas k 0 0 3").is_err());
        match parse_request(b"cas k 0 0 3 99").unwrap() {
            AsciiRequest::Store { verb: StoreVerb::Cas, cas, .. } => assert_eq!(cas, 99),
            other => panic!("expected cas Store, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_trailing_garbage_rejected() {
        assert_eq!(parse_request(b"set k 0 0 3 gibberish"), Err(bad_line()));
    }

    #[test]
    fn test_key_length_boundary() {
        let key250 = vec![b'k'; 250];
        let mut line = b"get ".to_vec();
        line.extend_from_slice(&key250);
        assert!(parse_request(&line).is_ok(), "250-byte key accepted");

        let key251 = vec![b'k'; 251];
        let mut line = b"get ".to_vec();
        line.extend_from_slice(&key251);
        assert!(matches!(parse_request(&line), Err(AsciiParseError::Client(_))), "251 rejected");
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(parse_request(b"frobnicate x"), Err(AsciiParseError::UnknownCommand));
        assert_eq!(parse_request(b""), Err(AsciiParseError::UnknownCommand));
    }

    #[test]
    fn test_parse_delete_legacy_time() {
        assert_eq!(
            parse_request(b"delete k 0 noreply").unwrap(),
            AsciiRequest::Delete { key: b"k".to_vec(), noreply: true }
        );
    }

    #[test]
    fn test_parse_incr_decr() {
        assert_eq!(
            parse_request(b"incr k 5").unwrap(),
            AsciiRequest::Arith { incr: true, key: b"k".to_vec(), delta: 5, noreply: false }
        );
        assert_eq!(
            parse_request(b"decr k 2 noreply").unwrap(),
            AsciiRequest::Arith { incr: false, key: b"k".to_vec(), delta: 2, noreply: true }
        );
    }

    #[test]
    fn test_parse_broadcasts() {
        assert!(parse_request(b"flush_all").unwrap().is_broadcast());
        assert!(parse_request(b"flush_all 10 noreply").unwrap().is_broadcast());
        assert!(parse_request(b"stats").unwrap().is_broadcast());
        assert!(parse_request(b"version").unwrap().is_broadcast());
        assert!(parse_request(b"verbosity 1").unwrap().is_broadcast());
    }

    #[test]
    fn test_encode_line_roundtrip() {
        for line in [
            &b"get a b"[..],
            b"gets x",
            b"set k 12 34 5",
            b"cas k 0 0 3 99",
            b"delete k noreply",
            b"incr counter 10",
            b"touch k 300",
            b"flush_all 10",
            b"stats proxy",
            b"version",
        ] {
            let req = parse_request(line).unwrap();
            let mut out = Vec::new();
            req.encode_line(&mut out);
            let mut expect = line.to_vec();
            expect.extend_from_slice(b"\r\n");
            assert_eq!(out, expect, "roundtrip for {:?}", String::from_utf8_lossy(line));
        }
    }

    #[test]
    fn test_parse_response_value() {
        assert_eq!(
            parse_response_line(b"VALUE k 0 5").unwrap(),
            AsciiResponseLine::Value { key: b"k".to_vec(), flags: 0, bytes: 5, cas: None }
        );
        assert_eq!(
            parse_response_line(b"VALUE k 7 5 1234").unwrap(),
            AsciiResponseLine::Value { key: b"k".to_vec(), flags: 7, bytes: 5, cas: Some(1234) }
        );
    }

    #[test]
    fn test_parse_response_end_and_stat() {
        assert_eq!(parse_response_line(b"END").unwrap(), AsciiResponseLine::End);
        assert_eq!(
            parse_response_line(b"STAT uptime 123").unwrap(),
            AsciiResponseLine::Stat { name: b"uptime".to_vec(), value: b"123".to_vec() }
        );
    }

    #[test]
    fn test_parse_response_single_line() {
        assert_eq!(
            parse_response_line(b"STORED").unwrap(),
            AsciiResponseLine::Line(b"STORED".to_vec())
        );
    }

    #[test]
    fn test_emit_value() {
        let mut out = Vec::new();
        emit_value(&mut out, b"k", 7, b"hello", None);
        assert_eq!(out, b"VALUE k 7 5\r\nhello\r\n".to_vec());

        out.clear();
        emit_value(&mut out, b"k", 0, b"", Some(9));
        assert_eq!(out, b"VALUE k 0 0 9\r\n\r\n".to_vec());
    }
}
