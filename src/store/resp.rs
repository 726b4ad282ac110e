//! Minimal Redis (RESP2) client over a Tokio TCP stream.
//!
//! One connection, commands serialized through a mutex, lazy reconnect on
//! the next command after any transport error, and a per-command timeout.

use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info};

use super::backend::KvBackend;
use crate::error::{StoreError, StoreResult};

// ----------------------------------------------------------------------------
// Wire format
// ----------------------------------------------------------------------------

/// A decoded RESP2 reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    fn into_integer(self) -> StoreResult<i64> {
        match self {
            RespValue::Integer(n) => Ok(n),
            other => Err(StoreError::protocol(format!("expected integer, got {:?}", other))),
        }
    }

    fn into_strings(self) -> StoreResult<Vec<String>> {
        match self {
            RespValue::Array(None) => Ok(Vec::new()),
            RespValue::Array(Some(items)) => items
                .into_iter()
                .map(|item| match item {
                    RespValue::Bulk(Some(bytes)) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
                    RespValue::Simple(s) => Ok(s),
                    other => Err(StoreError::protocol(format!("unexpected array item {:?}", other))),
                })
                .collect(),
            other => Err(StoreError::protocol(format!("expected array, got {:?}", other))),
        }
    }
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
    buf
}

async fn read_line<R: AsyncRead + Unpin + Send>(reader: &mut BufReader<R>) -> StoreResult<String> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| StoreError::protocol(format!("read failed: {}", e)))?;
    if n == 0 {
        return Err(StoreError::protocol("connection closed by server"));
    }
    Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string())
}

/// Decode one reply. Boxed because arrays recurse.
pub fn read_value<'a, R>(reader: &'a mut BufReader<R>) -> BoxFuture<'a, StoreResult<RespValue>>
where
    R: AsyncRead + Unpin + Send + 'a,
{
    async move {
        let line = read_line(reader).await?;
        let tag = line.get(..1).unwrap_or_default();
        let rest = line.get(1..).unwrap_or_default();
        let number = || {
            rest.parse::<i64>()
                .map_err(|_| StoreError::protocol(format!("bad length '{}'", rest)))
        };

        match tag {
            "+" => Ok(RespValue::Simple(rest.to_string())),
            "-" => Ok(RespValue::Error(rest.to_string())),
            ":" => Ok(RespValue::Integer(number()?)),
            "$" => {
                let len = number()?;
                if len < 0 {
                    return Ok(RespValue::Bulk(None));
                }
                let mut data = vec![0u8; len as usize + 2];
                reader
                    .read_exact(&mut data)
                    .await
                    .map_err(|e| StoreError::protocol(format!("read failed: {}", e)))?;
                data.truncate(len as usize);
                Ok(RespValue::Bulk(Some(data)))
            }
            "*" => {
                let len = number()?;
                if len < 0 {
                    return Ok(RespValue::Array(None));
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(read_value(reader).await?);
                }
                Ok(RespValue::Array(Some(items)))
            }
            _ => Err(StoreError::protocol(format!("unknown reply '{}'", line))),
        }
    }
    .boxed()
}

// ----------------------------------------------------------------------------
// Connection settings
// ----------------------------------------------------------------------------

/// Parsed `redis://[:password@]host[:port][/db]`
#[derive(Clone, PartialEq, Eq)]
pub struct RedisEndpoint {
    pub addr: String,
    pub password: Option<String>,
    pub db: u32,
}

impl Debug for RedisEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEndpoint")
            .field("addr", &self.addr)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("db", &self.db)
            .finish()
    }
}

impl RedisEndpoint {
    pub fn parse(url: &str) -> StoreResult<Self> {
        let invalid = |message: &str| StoreError::InvalidUrl {
            url: url.to_string(),
            message: message.to_string(),
        };

        let rest = url
            .strip_prefix("redis://")
            .ok_or_else(|| invalid("scheme must be redis://"))?;
        let (auth, rest) = match rest.rsplit_once('@') {
            Some((auth, rest)) => (Some(auth), rest),
            None => (None, rest),
        };
        let password = auth
            .map(|a| a.split_once(':').map_or(a, |(_, pw)| pw))
            .filter(|pw| !pw.is_empty())
            .map(str::to_string);

        let (host_port, db) = match rest.split_once('/') {
            Some((hp, db)) if !db.is_empty() => (
                hp,
                db.parse::<u32>().map_err(|_| invalid("database must be a number"))?,
            ),
            Some((hp, _)) => (hp, 0),
            None => (rest, 0),
        };
        if host_port.is_empty() {
            return Err(invalid("missing host"));
        }
        let addr = if host_port.contains(':') {
            host_port.to_string()
        } else {
            format!("{}:6379", host_port)
        };

        Ok(Self { addr, password, db })
    }
}

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Redis-protocol backend
pub struct RedisBackend {
    endpoint: RedisEndpoint,
    timeout: Duration,
    conn: TokioMutex<Option<Connection>>,
}

impl RedisBackend {
    pub fn new(url: &str, timeout: Duration) -> StoreResult<Self> {
        Ok(Self {
            endpoint: RedisEndpoint::parse(url)?,
            timeout,
            conn: TokioMutex::new(None),
        })
    }

    async fn connect(&self) -> StoreResult<Connection> {
        let stream = TcpStream::connect(&self.endpoint.addr)
            .await
            .map_err(|e| StoreError::Connection {
                endpoint: self.endpoint.addr.clone(),
                message: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(read),
            writer: write,
        };

        if let Some(password) = &self.endpoint.password {
            Self::roundtrip(&mut conn, &[b"AUTH", password.as_bytes()]).await?;
        }
        if self.endpoint.db != 0 {
            let db = self.endpoint.db.to_string();
            Self::roundtrip(&mut conn, &[b"SELECT", db.as_bytes()]).await?;
        }

        info!(target: "hostd::store", endpoint = %self.endpoint.addr, db = self.endpoint.db, "Connected to store");
        Ok(conn)
    }

    async fn roundtrip(conn: &mut Connection, args: &[&[u8]]) -> StoreResult<RespValue> {
        let frame = encode_command(args);
        conn.writer
            .write_all(&frame)
            .await
            .map_err(|e| StoreError::protocol(format!("write failed: {}", e)))?;
        match read_value(&mut conn.reader).await? {
            RespValue::Error(message) => Err(StoreError::Server { message }),
            value => Ok(value),
        }
    }

    async fn command(&self, args: &[&[u8]]) -> StoreResult<RespValue> {
        let name = String::from_utf8_lossy(args.first().copied().unwrap_or_default()).into_owned();
        let mut guard = self.conn.lock().await;

        let attempt = async {
            if guard.is_none() {
                *guard = Some(self.connect().await?);
            }
            match guard.as_mut() {
                Some(conn) => Self::roundtrip(conn, args).await,
                None => Err(StoreError::protocol("no connection")),
            }
        };

        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                command: name.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        // A server error leaves the stream in sync; anything else may not.
        if let Err(err) = &result {
            if !matches!(err, StoreError::Server { .. }) {
                if guard.take().is_some() {
                    debug!(target: "hostd::store", command = %name, error = %err, "Dropping store connection");
                }
            }
        }
        result
    }
}

impl Debug for RedisBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> StoreResult<()> {
        self.command(&[b"PING"]).await.map(|_| ())
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let reply = self
            .command(&[b"SISMEMBER", key.as_bytes(), member.as_bytes()])
            .await?;
        Ok(reply.into_integer()? == 1)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let reply = self
            .command(&[b"SADD", key.as_bytes(), member.as_bytes()])
            .await?;
        Ok(reply.into_integer()? == 1)
    }

    async fn srem(&self, key: &str, members: &[String]) -> StoreResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut args: Vec<&[u8]> = Vec::with_capacity(members.len() + 2);
        args.push(b"SREM");
        args.push(key.as_bytes());
        args.extend(members.iter().map(|m| m.as_bytes()));
        self.command(&args).await.map(|_| ())
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<usize> {
        let reply = self
            .command(&[b"LPUSH", key.as_bytes(), value.as_bytes()])
            .await?;
        Ok(reply.into_integer()?.max(0) as usize)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let (start, stop) = (start.to_string(), stop.to_string());
        self.command(&[b"LRANGE", key.as_bytes(), start.as_bytes(), stop.as_bytes()])
            .await?
            .into_strings()
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()> {
        let (start, stop) = (start.to_string(), stop.to_string());
        self.command(&[b"LTRIM", key.as_bytes(), start.as_bytes(), stop.as_bytes()])
            .await
            .map(|_| ())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let secs = ttl.as_secs().max(1).to_string();
        self.command(&[b"EXPIRE", key.as_bytes(), secs.as_bytes()])
            .await
            .map(|_| ())
    }
}
