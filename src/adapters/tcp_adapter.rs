//! Raw-socket SCPI adapter.
//!
//! Most LAN sourcemeters accept newline-terminated SCPI on a plain TCP socket
//! (port 5025 by convention). This adapter needs no VISA installation.
//!
//! Accepted connection descriptors:
//!
//! ```text
//! 192.168.1.204                     # default port 5025
//! 192.168.1.204:5025
//! TCPIP::192.168.1.204::5025::SOCKET
//! TCPIP0::192.168.1.204::5025::SOCKET
//! ```
//!
//! Queries are cancel safe. A query dropped before its reply arrived (user
//! abort, deadline) leaves the reply owed; the next query discards every owed
//! line before reading its own, so responses never shift by one.

use super::ScpiTransport;
use crate::error::{AppResult, SweepError};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Conventional raw SCPI socket port.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Turn a connection descriptor into a `host:port` socket address.
///
/// # Errors
/// [`SweepError::Validation`] for INSTR (non-socket) VISA resources and
/// malformed descriptors.
pub fn parse_socket_descriptor(descriptor: &str) -> AppResult<String> {
    let descriptor = descriptor.trim();
    if descriptor.is_empty() {
        return Err(SweepError::Validation(
            "connection descriptor cannot be empty".to_string(),
        ));
    }

    if descriptor.to_ascii_uppercase().starts_with("TCPIP") {
        let parts: Vec<&str> = descriptor.split("::").collect();
        return match parts.as_slice() {
            [_, host, port, kind] if kind.eq_ignore_ascii_case("SOCKET") => {
                let port: u16 = port.parse().map_err(|_| {
                    SweepError::Validation(format!("invalid port in '{}'", descriptor))
                })?;
                Ok(format!("{}:{}", host, port))
            }
            _ => Err(SweepError::Validation(format!(
                "'{}' is not a TCPIP socket resource (expected TCPIP::host::port::SOCKET)",
                descriptor
            ))),
        };
    }

    match descriptor.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port
                .parse()
                .map_err(|_| SweepError::Validation(format!("invalid port in '{}'", descriptor)))?;
            Ok(format!("{}:{}", host, port))
        }
        Some(_) => Err(SweepError::Validation(format!(
            "missing host in '{}'",
            descriptor
        ))),
        None => Ok(format!("{}:{}", descriptor, DEFAULT_SCPI_PORT)),
    }
}

/// SCPI over a raw TCP socket.
pub struct TcpScpiTransport {
    address: String,
    io_timeout: Duration,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    /// Replies sent for but not yet read, including the current query's.
    owed_replies: usize,
    /// Bytes of a reply line whose read was interrupted.
    partial_line: Vec<u8>,
}

impl TcpScpiTransport {
    /// Connect to `descriptor`, giving up after `connect_timeout`.
    ///
    /// # Errors
    /// [`SweepError::Connection`] if the socket cannot be opened in time.
    pub async fn open(
        descriptor: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> AppResult<Self> {
        let address = parse_socket_descriptor(descriptor)?;
        info!("Connecting to SCPI socket at {}", address);

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                SweepError::Connection(format!(
                    "timed out after {:?} connecting to {}",
                    connect_timeout, address
                ))
            })?
            .map_err(|e| SweepError::Connection(format!("{}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            address,
            io_timeout,
            reader: Some(BufReader::new(read_half)),
            writer: Some(write_half),
            owed_replies: 0,
            partial_line: Vec::new(),
        })
    }

    async fn send_line(&mut self, cmd: &str) -> AppResult<()> {
        let writer = self.writer.as_mut().ok_or(SweepError::SessionClosed)?;
        let line = format!("{}\n", cmd);
        tokio::time::timeout(self.io_timeout, writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| timed_out("write", cmd))??;
        Ok(())
    }

    /// Read one newline-terminated line. Cancel safe: interrupted bytes stay
    /// in `partial_line` and the next call continues the same line.
    async fn read_reply_line(&mut self) -> AppResult<String> {
        let reader = self.reader.as_mut().ok_or(SweepError::SessionClosed)?;
        reader.read_until(b'\n', &mut self.partial_line).await?;
        if !self.partial_line.ends_with(b"\n") {
            self.partial_line.clear();
            return Err(SweepError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection to {} closed mid-response", self.address),
            )));
        }
        let line = String::from_utf8_lossy(&self.partial_line)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.partial_line.clear();
        self.owed_replies = self.owed_replies.saturating_sub(1);
        Ok(line)
    }

    /// Skip replies owed to abandoned queries, then read the current one.
    async fn read_current_reply(&mut self) -> AppResult<String> {
        loop {
            let line = self.read_reply_line().await?;
            if self.owed_replies == 0 {
                return Ok(line);
            }
            debug!("Discarding stale SCPI reply '{}'", line);
        }
    }
}

fn timed_out(operation: &str, cmd: &str) -> SweepError {
    SweepError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("SCPI {} timed out: {}", operation, cmd),
    ))
}

#[async_trait]
impl ScpiTransport for TcpScpiTransport {
    async fn write(&mut self, cmd: &str) -> AppResult<()> {
        debug!("SCPI write: {}", cmd);
        self.send_line(cmd).await
    }

    async fn query(&mut self, cmd: &str) -> AppResult<String> {
        debug!("SCPI query: {}", cmd);
        self.send_line(cmd).await?;
        self.owed_replies += 1;

        let response = tokio::time::timeout(self.io_timeout, self.read_current_reply())
            .await
            .map_err(|_| timed_out("query", cmd))??;
        debug!("SCPI query '{}' -> '{}'", cmd, response);
        Ok(response)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.reader = None;
        self.owed_replies = 0;
        self.partial_line.clear();
        if let Some(mut writer) = self.writer.take() {
            info!("Closing SCPI socket at {}", self.address);
            writer.shutdown().await?;
        }
        Ok(())
    }
}
