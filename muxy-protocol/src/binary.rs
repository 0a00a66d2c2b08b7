use thiserror::Error;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;
pub const HEADER_LEN: usize = 24;

/// Opaque stamped on quiet requests so a late error frame for a command
/// the client never wants answered can be recognized and dropped.
pub const OPAQUE_IGNORE_REPLY: u32 = 0x0412_F00D;

/// Binary protocol opcodes.
pub mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const REPLACE: u8 = 0x03;
    pub const DELETE: u8 = 0x04;
    pub const INCREMENT: u8 = 0x05;
    pub const DECREMENT: u8 = 0x06;
    pub const QUIT: u8 = 0x07;
    pub const FLUSH: u8 = 0x08;
    pub const GETQ: u8 = 0x09;
    pub const NOOP: u8 = 0x0a;
    pub const VERSION: u8 = 0x0b;
    pub const GETK: u8 = 0x0c;
    pub const GETKQ: u8 = 0x0d;
    pub const APPEND: u8 = 0x0e;
    pub const PREPEND: u8 = 0x0f;
    pub const STAT: u8 = 0x10;
    pub const SETQ: u8 = 0x11;
    pub const ADDQ: u8 = 0x12;
    pub const REPLACEQ: u8 = 0x13;
    pub const DELETEQ: u8 = 0x14;
    pub const INCREMENTQ: u8 = 0x15;
    pub const DECREMENTQ: u8 = 0x16;
    pub const QUITQ: u8 = 0x17;
    pub const FLUSHQ: u8 = 0x18;
    pub const APPENDQ: u8 = 0x19;
    pub const PREPENDQ: u8 = 0x1a;
    pub const VERBOSITY: u8 = 0x1b;
    pub const TOUCH: u8 = 0x1c;
    pub const SASL_LIST_MECHS: u8 = 0x20;
    pub const SASL_AUTH: u8 = 0x21;
    pub const SASL_STEP: u8 = 0x22;
    pub const SELECT_BUCKET: u8 = 0x89;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("packet shorter than the 24-byte header")]
    TooShort,

    #[error("bad magic byte 0x{0:02x}")]
    BadMagic(u8),

    #[error("body length does not match header")]
    BodySizeMismatch,

    #[error("extras/key lengths exceed body length")]
    BadSegmentLengths,
}

/// The canonical 24-byte header. `vbucket_or_status` is the vbucket id
/// on requests and the status code on responses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BinHeader {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub ext_len: u8,
    pub data_type: u8,
    pub vbucket_or_status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl BinHeader {
    /// Decode a header from the first 24 bytes of `bytes`. Magic is not
    /// checked here; use [`expect_request`]/[`expect_response`].
    ///
    /// [`expect_request`]: BinHeader::expect_request
    /// [`expect_response`]: BinHeader::expect_response
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::TooShort);
        }
        Ok(Self {
            magic: bytes[0],
            opcode: bytes[1],
            key_len: u16::from_be_bytes([bytes[2], bytes[3]]),
            ext_len: bytes[4],
            data_type: bytes[5],
            vbucket_or_status: u16::from_be_bytes([bytes[6], bytes[7]]),
            body_len: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            opaque: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            cas: u64::from_be_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22],
                bytes[23],
            ]),
        })
    }

    pub fn expect_request(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Self::parse(bytes)?;
        if header.magic != MAGIC_REQUEST {
            return Err(WireError::BadMagic(header.magic));
        }
        Ok(header)
    }

    pub fn expect_response(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Self::parse(bytes)?;
        if header.magic != MAGIC_RESPONSE {
            return Err(WireError::BadMagic(header.magic));
        }
        Ok(header)
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.magic);
        out.push(self.opcode);
        out.extend_from_slice(&self.key_len.to_be_bytes());
        out.push(self.ext_len);
        out.push(self.data_type);
        out.extend_from_slice(&self.vbucket_or_status.to_be_bytes());
        out.extend_from_slice(&self.body_len.to_be_bytes());
        out.extend_from_slice(&self.opaque.to_be_bytes());
        out.extend_from_slice(&self.cas.to_be_bytes());
    }
}

/// A complete frame: header plus the three body segments.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BinPacket {
    pub header: BinHeader,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl BinPacket {
    pub fn request(opcode: u8, vbucket: u16, extras: &[u8], key: &[u8], value: &[u8]) -> Self {
        let mut packet = BinPacket {
            header: BinHeader {
                magic: MAGIC_REQUEST,
                opcode,
                vbucket_or_status: vbucket,
                ..BinHeader::default()
            },
            extras: extras.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
        };
        packet.refresh_lengths();
        packet
    }

    pub fn response(opcode: u8, status: u16, extras: &[u8], key: &[u8], value: &[u8]) -> Self {
        let mut packet = BinPacket {
            header: BinHeader {
                magic: MAGIC_RESPONSE,
                opcode,
                vbucket_or_status: status,
                ..BinHeader::default()
            },
            extras: extras.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
        };
        packet.refresh_lengths();
        packet
    }

    /// Recompute `key_len`/`ext_len`/`body_len` from the segments.
    pub fn refresh_lengths(&mut self) {
        self.header.key_len = self.key.len() as u16;
        self.header.ext_len = self.extras.len() as u8;
        self.header.body_len = (self.extras.len() + self.key.len() + self.value.len()) as u32;
    }

    /// Split a body buffer into segments according to `header`.
    pub fn from_body(header: BinHeader, body: &[u8]) -> Result<Self, WireError> {
        if body.len() != header.body_len as usize {
            return Err(WireError::BodySizeMismatch);
        }
        let seg = header.ext_len as usize + header.key_len as usize;
        if seg > body.len() {
            return Err(WireError::BadSegmentLengths);
        }
        let (extras, rest) = body.split_at(header.ext_len as usize);
        let (key, value) = rest.split_at(header.key_len as usize);
        Ok(Self { header, extras: extras.to_vec(), key: key.to_vec(), value: value.to_vec() })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.header.write(out);
        out.extend_from_slice(&self.extras);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.header.body_len as usize);
        self.encode_into(&mut out);
        out
    }

    /// Response status (meaningless on requests).
    pub fn status(&self) -> u16 {
        self.header.vbucket_or_status
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.header.opaque = opaque;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.header.cas = cas;
        self
    }

    // ── Handshake frames ──────────────────────────────────────────

    /// SASL PLAIN: mech key `"PLAIN"`, body `\0usr\0pwd`.
    pub fn sasl_plain_auth(usr: &str, pwd: &str) -> Self {
        let mut body = Vec::with_capacity(usr.len() + pwd.len() + 2);
        body.push(0);
        body.extend_from_slice(usr.as_bytes());
        body.push(0);
        body.extend_from_slice(pwd.as_bytes());
        Self::request(opcode::SASL_AUTH, 0, &[], b"PLAIN", &body)
    }

    pub fn select_bucket(name: &str) -> Self {
        Self::request(opcode::SELECT_BUCKET, 0, &[], name.as_bytes(), &[])
    }

    pub fn noop() -> Self {
        Self::request(opcode::NOOP, 0, &[], &[], &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = BinHeader {
            magic: MAGIC_REQUEST,
            opcode: opcode::SET,
            key_len: 5,
            ext_len: 8,
            data_type: 0,
            vbucket_or_status: 513,
            body_len: 18,
            opaque: 0xdead_beef,
            cas: 42,
        };
        let mut bytes = Vec::new();
        header.write(&mut bytes);
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(BinHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_too_short() {
        assert_eq!(BinHeader::parse(&[0x80; 23]), Err(WireError::TooShort));
    }

    #[test]
    fn test_magic_checks() {
        let req = BinPacket::request(opcode::GET, 0, &[], b"k", &[]).to_bytes();
        assert!(BinHeader::expect_request(&req).is_ok());
        assert_eq!(BinHeader::expect_response(&req), Err(WireError::BadMagic(MAGIC_REQUEST)));
    }

    #[test]
    fn test_get_request_bytes() {
        let bytes = BinPacket::request(opcode::GET, 0, &[], b"Hello", &[]).to_bytes();
        let expect = vec![
            0x80, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x48, 0x65, 0x6c, 0x6c,
            0x6f,
        ];
        assert_eq!(bytes, expect);
    }

    #[test]
    fn test_set_request_framing() {
        let extras = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0x1c, 0x20];
        let packet = BinPacket::request(opcode::ADD, 0, &extras, b"Hello", b"World");
        assert_eq!(packet.header.key_len, 5);
        assert_eq!(packet.header.ext_len, 8);
        assert_eq!(packet.header.body_len, 18);
        let bytes = packet.to_bytes();
        let expect = vec![
            0x80, 0x02, 0x00, 0x05, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef,
            0x00, 0x00, 0x1c, 0x20, 0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x57, 0x6f, 0x72, 0x6c, 0x64,
        ];
        assert_eq!(bytes, expect);
    }

    #[test]
    fn test_from_body_splits_segments() {
        let packet = BinPacket::request(opcode::SET, 3, &[1, 2, 3, 4, 0, 0, 0, 0], b"key", b"val");
        let bytes = packet.to_bytes();
        let header = BinHeader::expect_request(&bytes).unwrap();
        let parsed = BinPacket::from_body(header, &bytes[HEADER_LEN..]).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_from_body_rejects_mismatch() {
        let packet = BinPacket::request(opcode::SET, 0, &[], b"key", b"val");
        let header = packet.header;
        assert_eq!(BinPacket::from_body(header, b"short"), Err(WireError::BodySizeMismatch));
    }

    #[test]
    fn test_from_body_rejects_bad_segments() {
        let mut header = BinHeader { magic: MAGIC_RESPONSE, body_len: 2, key_len: 8, ..BinHeader::default() };
        header.ext_len = 0;
        assert_eq!(BinPacket::from_body(header, &[0, 0]), Err(WireError::BadSegmentLengths));
    }

    #[test]
    fn test_sasl_plain_body() {
        let packet = BinPacket::sasl_plain_auth("user", "pass");
        assert_eq!(packet.key, b"PLAIN".to_vec());
        assert_eq!(packet.value, b"\0user\0pass".to_vec());
        assert_eq!(packet.header.opcode, opcode::SASL_AUTH);
    }

    #[test]
    fn test_select_bucket_frame() {
        let packet = BinPacket::select_bucket("default");
        assert_eq!(packet.header.opcode, opcode::SELECT_BUCKET);
        assert_eq!(packet.key, b"default".to_vec());
        assert!(packet.value.is_empty());
    }
}
