//! Raw SCPI socket endpoint.
//!
//! Most LAN instruments accept newline-terminated SCPI on port 5025. One
//! session per instrument; the stream sits behind a `tokio::sync::Mutex` so
//! a write and its reply are never interleaved with another exchange.
//!
//! A failed or timed-out exchange drops the socket. Its reply may still be
//! in flight, so the next exchange opens a fresh connection instead of
//! reading that reply as its own.

use super::endpoint::ScpiEndpoint;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

type Session = BufReader<TcpStream>;

/// SCPI over a TCP socket.
pub struct TcpEndpoint {
    address: String,
    host: String,
    port: u16,
    timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl TcpEndpoint {
    /// Connect to `host:port`.
    pub async fn connect(
        address: &str,
        host: &str,
        port: u16,
        io_timeout: Duration,
    ) -> Result<Self> {
        let session = open(host, port, io_timeout).await?;
        debug!(address, "socket opened");
        Ok(Self {
            address: address.to_string(),
            host: host.to_string(),
            port,
            timeout: io_timeout,
            session: Mutex::new(Some(session)),
        })
    }

    /// The live session, reconnecting if the last exchange dropped it.
    async fn ensure<'a>(&self, slot: &'a mut Option<Session>) -> Result<&'a mut Session> {
        if slot.is_none() {
            warn!(address = %self.address, "reconnecting after failed exchange");
            *slot = Some(open(&self.host, self.port, self.timeout).await?);
        }
        slot.as_mut().ok_or_else(|| anyhow!("no session to {}", self.address))
    }
}

async fn open(host: &str, port: u16, io_timeout: Duration) -> Result<Session> {
    let stream = timeout(io_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| anyhow!("connect to {}:{} timed out after {:?}", host, port, io_timeout))?
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
    stream.set_nodelay(true)?;
    Ok(BufReader::new(stream))
}

async fn send(stream: &mut Session, command: &str) -> Result<()> {
    let line = format!("{}\n", command);
    stream
        .get_mut()
        .write_all(line.as_bytes())
        .await
        .context("socket write failed")?;
    stream.get_mut().flush().await.context("socket flush failed")
}

async fn exchange(stream: &mut Session, command: &str) -> Result<String> {
    send(stream, command).await?;
    let mut reply = String::new();
    let read = stream
        .read_line(&mut reply)
        .await
        .context("socket read failed")?;
    if read == 0 {
        return Err(anyhow!("connection closed by instrument"));
    }
    Ok(reply.trim_end().to_string())
}

#[async_trait]
impl ScpiEndpoint for TcpEndpoint {
    fn address(&self) -> &str {
        &self.address
    }

    async fn write(&self, command: &str) -> Result<()> {
        let mut slot = self.session.lock().await;
        let stream = self.ensure(&mut slot).await?;
        let result = timeout(self.timeout, send(stream, command))
            .await
            .map_err(|_| anyhow!("write timed out after {:?}", self.timeout))
            .and_then(|sent| sent);
        if result.is_err() {
            *slot = None;
        }
        result
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut slot = self.session.lock().await;
        let stream = self.ensure(&mut slot).await?;
        let result = timeout(self.timeout, exchange(stream, command))
            .await
            .map_err(|_| anyhow!("query timed out after {:?}", self.timeout))
            .and_then(|reply| reply);
        if result.is_err() {
            *slot = None;
        }
        result
    }
}
