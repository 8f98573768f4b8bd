//! Client-facing TLS
//!
//! The server name is read from the ClientHello with `peek`, so the bytes
//! stay in the socket for the real handshake that follows. That lets the
//! proxy pick the leaf certificate before it starts talking TLS.

use std::time::Duration;

use log::{debug, trace};
use openssl::ssl::{Ssl, SslAcceptor};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_openssl::SslStream;

use crate::common::{ProxyError, Result};

const RECORD_HEADER_LEN: usize = 5;
const MAX_RECORD_LEN: usize = 16384;
const HANDSHAKE_RECORD: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const SERVER_NAME_EXTENSION: u16 = 0x0000;
const HOST_NAME: u8 = 0x00;

/// Length of the first record, if `data` starts with a TLS handshake record
fn record_len(data: &[u8]) -> Option<usize> {
    if data.len() < RECORD_HEADER_LEN || data[0] != HANDSHAKE_RECORD || data[1] != 0x03 {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([data[3], data[4]]));
    (4..=MAX_RECORD_LEN).contains(&len).then_some(len)
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn skip_u8_prefixed(&mut self) -> Option<()> {
        let n = usize::from(self.u8()?);
        self.take(n).map(|_| ())
    }

    fn u16_prefixed(&mut self) -> Option<&'a [u8]> {
        let n = usize::from(self.u16()?);
        self.take(n)
    }
}

/// Server name indicated by a complete ClientHello record
pub fn parse_server_name(data: &[u8]) -> Option<String> {
    let len = record_len(data)?;
    let mut record = Reader { data: data.get(RECORD_HEADER_LEN..RECORD_HEADER_LEN + len)? };

    if record.u8()? != CLIENT_HELLO {
        return None;
    }
    record.take(3)?; // handshake length
    record.take(2 + 32)?; // version, random
    record.skip_u8_prefixed()?; // session id
    record.u16_prefixed()?; // cipher suites
    record.skip_u8_prefixed()?; // compression methods

    let mut extensions = Reader { data: record.u16_prefixed()? };
    while let Some(kind) = extensions.u16() {
        let body = extensions.u16_prefixed()?;
        if kind != SERVER_NAME_EXTENSION {
            continue;
        }
        let mut list = Reader { data: body };
        let mut names = Reader { data: list.u16_prefixed()? };
        while let Some(name_type) = names.u8() {
            let name = names.u16_prefixed()?;
            if name_type == HOST_NAME {
                return std::str::from_utf8(name).ok().map(str::to_ascii_lowercase);
            }
        }
    }
    None
}

/// Wait for the ClientHello and return the server name it indicates
///
/// Returns `None` when the client does not speak TLS, sends no name, or does
/// not finish its hello within `wait`.
pub async fn peek_server_name(stream: &TcpStream, wait: Duration) -> Result<Option<String>> {
    let deadline = Instant::now() + wait;
    let mut buf = vec![0u8; RECORD_HEADER_LEN + MAX_RECORD_LEN];
    let mut seen = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let n = match timeout(remaining, stream.peek(&mut buf)).await {
            Ok(Ok(0)) => return Ok(None),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ProxyError::Io(e)),
            Err(_) => {
                debug!("Timeout waiting for ClientHello");
                return Ok(None);
            }
        };
        trace!("Peeked {} bytes", n);

        if n >= RECORD_HEADER_LEN {
            let Some(len) = record_len(&buf[..n]) else {
                debug!("Connection does not start with a TLS handshake record");
                return Ok(None);
            };
            if n >= RECORD_HEADER_LEN + len {
                return Ok(parse_server_name(&buf[..n]));
            }
        }
        if n == seen {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(Duration::from_millis(5)).await;
        }
        seen = n;
    }
}

/// Complete the server side of a handshake
pub async fn accept(acceptor: &SslAcceptor, stream: TcpStream) -> Result<SslStream<TcpStream>> {
    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, stream)?;
    std::pin::Pin::new(&mut stream)
        .accept()
        .await
        .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
    debug!("TLS handshake with client complete");
    Ok(stream)
}
