//! Line transport to the node.
//!
//! A transaction writes one command line and collects reply lines up to and
//! including the terminal `OK`/`ERR` line. Any failure drops the connection
//! so a late reply can never be read as the answer to the next command.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::status::is_terminal;

/// Replies longer than this are not something the node sends.
const MAX_REPLY_LINES: usize = 32;

pub trait Link: Send {
    /// Send one command, return every reply line, the terminal line last.
    fn transact(
        &mut self,
        command: &str,
    ) -> impl Future<Output = Result<Vec<String>, LinkError>> + Send;
}

pub struct TcpLink {
    addr: String,
    timeout: Duration,
    stream: Option<BufReader<TcpStream>>,
}

impl TcpLink {
    /// Connection is opened lazily on the first command.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            stream: None,
        }
    }

    async fn connected(&mut self) -> Result<&mut BufReader<TcpStream>, LinkError> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|source| LinkError::Connect {
                    addr: self.addr.clone(),
                    source,
                })?;
            let _ = stream.set_nodelay(true);
            info!(addr = %self.addr, "link connected");
            self.stream = Some(BufReader::new(stream));
        }
        self.stream.as_mut().ok_or(LinkError::Closed)
    }

    async fn exchange(&mut self, command: &str) -> Result<Vec<String>, LinkError> {
        let stream = self.connected().await?;
        stream
            .get_mut()
            .write_all(format!("{command}\n").as_bytes())
            .await?;

        let mut lines = Vec::new();
        let mut buf = String::new();
        loop {
            buf.clear();
            if stream.read_line(&mut buf).await? == 0 {
                return Err(LinkError::Closed);
            }
            let line = buf.trim_end_matches(['\r', '\n']).to_string();
            let done = is_terminal(&line);
            lines.push(line);
            if done {
                return Ok(lines);
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(LinkError::Closed);
            }
        }
    }
}

impl Link for TcpLink {
    async fn transact(&mut self, command: &str) -> Result<Vec<String>, LinkError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let result = match tokio::time::timeout(self.timeout, self.exchange(command)).await {
            Ok(r) => r,
            Err(_) => Err(LinkError::Timeout(timeout_ms)),
        };
        match &result {
            Ok(lines) => debug!(command, reply = ?lines, "link transaction"),
            Err(e) => {
                warn!(command, kind = %e.kind(), "link transaction failed: {e}");
                self.stream = None;
            }
        }
        result
    }
}
