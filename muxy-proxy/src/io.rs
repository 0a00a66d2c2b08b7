//! Buffered framing over a monoio TCP stream, shared by the upstream
//! and downstream drivers. Rent-style reads land in a reused scratch
//! buffer and accumulate into `buf` until a full line or frame is
//! available.

use bytes::BytesMut;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use std::io;

const SCRATCH_SIZE: usize = 16 * 1024;

pub struct BufferedStream {
    stream: TcpStream,
    buf: BytesMut,
    scratch: Vec<u8>,
}

impl BufferedStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream, buf: BytesMut::with_capacity(SCRATCH_SIZE), scratch: vec![0u8; SCRATCH_SIZE] }
    }

    /// Unconsumed bytes already read off the socket.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// One socket read into the accumulator. Returns the byte count;
    /// zero means the peer closed.
    pub async fn fill(&mut self) -> io::Result<usize> {
        let scratch = std::mem::take(&mut self.scratch);
        let (res, scratch) = self.stream.read(scratch).await;
        self.scratch = scratch;
        let n = res?;
        if n > 0 {
            self.buf.extend_from_slice(&self.scratch[..n]);
        }
        Ok(n)
    }

    /// Make at least `n` bytes available, or report the close.
    pub async fn fill_to(&mut self, n: usize) -> io::Result<bool> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Read one `\r\n`-terminated line, stripped. `Ok(None)` on a clean
    /// close before any byte of the line.
    pub async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                let mut line = self.buf.split_to(pos + 2);
                line.truncate(pos);
                return Ok(Some(line.to_vec()));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> io::Result<Vec<u8>> {
        if !self.fill_to(n).await? {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(self.buf.split_to(n).to_vec())
    }

    pub async fn write_all(&mut self, data: Vec<u8>) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (res, _) = self.stream.write_all(data).await;
        res.map(|_| ())
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::find_crlf;

    #[test]
    fn find_crlf_positions() {
        assert_eq!(find_crlf(b"END\r\n"), Some(3));
        assert_eq!(find_crlf(b"\r\n"), Some(0));
        assert_eq!(find_crlf(b"no terminator"), None);
        assert_eq!(find_crlf(b"split\rhere\nnot"), None);
    }
}
