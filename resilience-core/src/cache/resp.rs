//! Minimal RESP2 client connection.
//!
//! Only what the failover client needs: command encoding, reply parsing for
//! simple strings, errors, integers, bulk strings and arrays, and a TCP
//! connection that issues one command at a time.

use super::{CacheConnection, CacheError};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Largest bulk reply accepted (512MB, the server-side limit).
const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Parse one reply. `Ok(None)` means the buffer holds an incomplete frame.
pub fn parse(data: &[u8]) -> Result<Option<(RespValue, usize)>, CacheError> {
    if data.is_empty() {
        return Ok(None);
    }
    let Some(line_end) = find_crlf(&data[1..]) else {
        return Ok(None);
    };
    let line = &data[1..1 + line_end];
    let header_len = line_end + 3;

    match data[0] {
        b'+' => Ok(Some((RespValue::Simple(String::from_utf8_lossy(line).into_owned()), header_len))),
        b'-' => Ok(Some((RespValue::Error(String::from_utf8_lossy(line).into_owned()), header_len))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), header_len))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), header_len)));
            }
            let len = len as usize;
            if len > MAX_BULK_SIZE {
                return Err(CacheError::Command(format!("bulk reply too large: {} bytes", len)));
            }
            if data.len() < header_len + len + 2 {
                return Ok(None);
            }
            let body = data[header_len..header_len + len].to_vec();
            Ok(Some((RespValue::Bulk(Some(body)), header_len + len + 2)))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((RespValue::Array(None), header_len)));
            }
            let mut consumed = header_len;
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                match parse(&data[consumed..])? {
                    Some((item, used)) => {
                        items.push(item);
                        consumed += used;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), consumed)))
        }
        other => Err(CacheError::Command(format!("unexpected reply type byte 0x{:02x}", other))),
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn parse_int(line: &[u8]) -> Result<i64, CacheError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CacheError::Command(format!("invalid integer in reply: {:?}", String::from_utf8_lossy(line))))
}

/// Host, port and optional password from a `redis://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespAddress {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl RespAddress {
    pub fn parse(url: &str) -> Result<Self, CacheError> {
        let rest = url
            .strip_prefix("redis://")
            .ok_or_else(|| CacheError::Connection(format!("unsupported cache url scheme: {}", url)))?;
        let rest = rest.split('/').next().unwrap_or_default();

        let (password, host_port) = match rest.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                let password = userinfo.rsplit(':').next().unwrap_or_default();
                ((!password.is_empty()).then(|| password.to_string()), host_port)
            }
            None => (None, rest),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse()
                    .map_err(|_| CacheError::Connection(format!("invalid port in cache url: {}", url)))?,
            ),
            None => (host_port, 6379),
        };
        if host.is_empty() {
            return Err(CacheError::Connection(format!("missing host in cache url: {}", url)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            password,
        })
    }
}

pub struct RespConnection {
    stream: TcpStream,
    buf: BytesMut,
}

impl RespConnection {
    /// Connect and complete the handshake (AUTH when a password is set, then PING).
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let addr = RespAddress::parse(url)?;
        let stream = tokio::time::timeout(timeout, TcpStream::connect((addr.host.as_str(), addr.port)))
            .await
            .map_err(|_| CacheError::Connection(format!("connect to {}:{} timed out", addr.host, addr.port)))??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        };

        let handshake = async {
            if let Some(password) = &addr.password {
                conn.request(&[b"AUTH", password.as_bytes()]).await?;
            }
            conn.ping().await
        };
        let outcome = tokio::time::timeout(timeout, handshake).await;
        match outcome {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(CacheError::Command(m))) => Err(CacheError::Connection(format!("handshake rejected: {}", m))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CacheError::Connection("handshake timed out".into())),
        }
    }

    async fn request(&mut self, args: &[&[u8]]) -> Result<RespValue, CacheError> {
        self.stream.write_all(&encode_command(args)).await?;

        loop {
            if let Some((value, used)) = parse(&self.buf)? {
                self.buf.advance(used);
                return match value {
                    RespValue::Error(m) => Err(CacheError::Command(m)),
                    v => Ok(v),
                };
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(CacheError::Connection("connection closed by peer".into()));
            }
        }
    }
}

#[async_trait]
impl CacheConnection for RespConnection {
    async fn ping(&mut self) -> Result<(), CacheError> {
        match self.request(&[b"PING"]).await? {
            RespValue::Simple(s) if s == "PONG" => Ok(()),
            other => Err(CacheError::Command(format!("unexpected PING reply: {:?}", other))),
        }
    }

    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self.request(&[b"GET", key.as_bytes()]).await? {
            RespValue::Bulk(v) => Ok(v),
            other => Err(CacheError::Command(format!("unexpected GET reply: {:?}", other))),
        }
    }

    async fn set(&mut self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let reply = match ttl {
            Some(ttl) => {
                let ms = ttl.as_millis().max(1).to_string();
                self.request(&[b"SET", key.as_bytes(), value, b"PX", ms.as_bytes()]).await?
            }
            None => self.request(&[b"SET", key.as_bytes(), value]).await?,
        };
        match reply {
            RespValue::Simple(_) => Ok(()),
            other => Err(CacheError::Command(format!("unexpected SET reply: {:?}", other))),
        }
    }

    async fn expire(&mut self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let secs = ttl.as_secs().max(1).to_string();
        match self.request(&[b"EXPIRE", key.as_bytes(), secs.as_bytes()]).await? {
            RespValue::Integer(n) => Ok(n == 1),
            other => Err(CacheError::Command(format!("unexpected EXPIRE reply: {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let encoded = encode_command(&[b"SET", b"k", b"v"]);
        assert_eq!(encoded, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(parse(b"+PONG\r\n").unwrap(), Some((RespValue::Simple("PONG".into()), 7)));
        assert_eq!(parse(b":1\r\n").unwrap(), Some((RespValue::Integer(1), 4)));
        assert_eq!(parse(b"$-1\r\n").unwrap(), Some((RespValue::Bulk(None), 5)));
        assert_eq!(
            parse(b"$5\r\nhello\r\n").unwrap(),
            Some((RespValue::Bulk(Some(b"hello".to_vec())), 11))
        );
        assert_eq!(
            parse(b"-ERR wrong type\r\n").unwrap(),
            Some((RespValue::Error("ERR wrong type".into()), 17))
        );
    }

    #[test]
    fn test_parse_incomplete_frames() {
        assert_eq!(parse(b"$5\r\nhel").unwrap(), None);
        assert_eq!(parse(b"+PON").unwrap(), None);
        assert_eq!(parse(b"*2\r\n:1\r\n").unwrap(), None);
        assert!(parse(b"!oops\r\n").is_err());
    }

    #[test]
    fn test_parse_address() {
        let addr = RespAddress::parse("redis://:s3cret@cache.internal:6380/0").unwrap();
        assert_eq!(addr.host, "cache.internal");
        assert_eq!(addr.port, 6380);
        assert_eq!(addr.password.as_deref(), Some("s3cret"));

        let local = RespAddress::parse("redis://127.0.0.1").unwrap();
        assert_eq!(local.port, 6379);
        assert!(local.password.is_none());

        assert!(RespAddress::parse("memcached://x").is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_class() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = RespConnection::connect(&format!("redis://127.0.0.1:{}", port), Duration::from_millis(500))
            .await
            .err()
            .unwrap();
        assert!(err.is_connection_class());
    }
}
