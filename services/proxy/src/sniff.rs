//! Hostname sniffing for HTTP and TLS connections.
//!
//! Both sniffers consume as little of the connection as they can and return
//! every byte they read, so the backend can replay them. Neither reads more
//! than [`MAX_HEADER_SIZE`] bytes.

use std::io;

use hostmux_handoff::MAX_HEADER_SIZE;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 22;

/// Handshake message type of a ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 1;

/// Smallest record that can hold a ClientHello.
const MIN_CLIENT_HELLO_LEN: usize = 42;

const EXTENSION_SERVER_NAME: u16 = 0;
const NAME_TYPE_HOST_NAME: u8 = 0;

/// Outcome of a successful sniff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sniffed {
    /// Requested hostname, exactly as sent. Empty when the client sent none.
    pub hostname: String,
    /// Bytes consumed from the connection, in order.
    pub consumed: Vec<u8>,
}

/// Why a connection could not be routed by hostname.
#[derive(Debug, Error)]
pub enum SniffError {
    /// The header block or handshake does not fit in `MAX_HEADER_SIZE`.
    #[error("headers exceed {} bytes", MAX_HEADER_SIZE)]
    TooLarge,

    #[error("malformed preamble: {0}")]
    Malformed(&'static str),

    #[error("read failed: {0}")]
    Read(#[from] io::Error),
}

/// Find the `Host` header of a plaintext HTTP request.
///
/// Reads a single byte at a time so nothing past the `Host` line (or the
/// end of headers) is taken from the connection. The header name match is
/// case-sensitive.
pub async fn sniff_http<R>(conn: &mut R) -> Result<Sniffed, SniffError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut consumed = Vec::with_capacity(512);
    let mut line_start = 0;
    let mut byte = [0u8; 1];

    while consumed.len() < MAX_HEADER_SIZE {
        if conn.read(&mut byte).await? == 0 {
            return Err(SniffError::Malformed("connection closed inside headers"));
        }
        consumed.push(byte[0]);
        if byte[0] != b'\n' {
            continue;
        }

        let line = &consumed[line_start..];
        if line == b"\r\n" {
            return Ok(Sniffed {
                hostname: String::new(),
                consumed,
            });
        }
        if let Some(hostname) = host_header(line) {
            return Ok(Sniffed { hostname, consumed });
        }
        line_start = consumed.len();
    }

    Err(SniffError::TooLarge)
}

fn host_header(line: &[u8]) -> Option<String> {
    let colon = line.iter().position(|&b| b == b':')?;
    if line[..colon].trim_ascii() != b"Host" {
        return None;
    }
    let value = line[colon + 1..].trim_ascii();
    Some(String::from_utf8_lossy(value).into_owned())
}

/// Find the SNI hostname in a TLS ClientHello.
///
/// Reads the 5-byte record header and then exactly one record. A
/// ClientHello without a server_name extension yields an empty hostname.
pub async fn sniff_tls<R>(conn: &mut R) -> Result<Sniffed, SniffError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 5];
    conn.read_exact(&mut header).await?;

    if header[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(SniffError::Malformed("not a handshake record"));
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len < MIN_CLIENT_HELLO_LEN {
        return Err(SniffError::Malformed("handshake record too short"));
    }
    if header.len() + len > MAX_HEADER_SIZE {
        return Err(SniffError::TooLarge);
    }

    let mut consumed = vec![0u8; header.len() + len];
    consumed[..header.len()].copy_from_slice(&header);
    conn.read_exact(&mut consumed[header.len()..]).await?;

    let hostname = server_name(&consumed[header.len()..])?
        .unwrap_or_default()
        .to_owned();
    Ok(Sniffed { hostname, consumed })
}

/// Extract the first host_name entry from a ClientHello handshake message.
pub fn server_name(handshake: &[u8]) -> Result<Option<&str>, SniffError> {
    let mut msg = Reader::new(handshake);
    if msg.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(SniffError::Malformed("not a ClientHello"));
    }
    if msg.u24()? as usize != msg.remaining() {
        return Err(SniffError::Malformed("handshake length mismatch"));
    }

    // client_version + random
    msg.take(2 + 32)?;

    let session_id_len = msg.u8()? as usize;
    if session_id_len > 32 {
        return Err(SniffError::Malformed("session id too long"));
    }
    msg.take(session_id_len)?;

    let cipher_suites_len = msg.u16()? as usize;
    if cipher_suites_len % 2 != 0 {
        return Err(SniffError::Malformed("odd cipher suites length"));
    }
    msg.take(cipher_suites_len)?;

    let compression_len = msg.u8()? as usize;
    msg.take(compression_len)?;

    if msg.remaining() == 0 {
        return Ok(None);
    }
    if msg.u16()? as usize != msg.remaining() {
        return Err(SniffError::Malformed("extensions length mismatch"));
    }

    while msg.remaining() > 0 {
        let ext_type = msg.u16()?;
        let ext_len = msg.u16()? as usize;
        let data = msg.take(ext_len)?;
        if ext_type != EXTENSION_SERVER_NAME {
            continue;
        }
        if let Some(name) = host_name_entry(data)? {
            return Ok(Some(name));
        }
    }

    Ok(None)
}

fn host_name_entry(ext: &[u8]) -> Result<Option<&str>, SniffError> {
    let mut list = Reader::new(ext);
    if list.u16()? as usize != list.remaining() {
        return Err(SniffError::Malformed("server name list length mismatch"));
    }

    while list.remaining() > 0 {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;
        if name_type == NAME_TYPE_HOST_NAME {
            return std::str::from_utf8(name)
                .map(Some)
                .map_err(|_| SniffError::Malformed("server name is not UTF-8"));
        }
    }

    Ok(None)
}

/// Big-endian cursor that fails on truncation.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniffError> {
        if n > self.buf.len() {
            return Err(SniffError::Malformed("truncated ClientHello"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, SniffError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SniffError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32, SniffError> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}
