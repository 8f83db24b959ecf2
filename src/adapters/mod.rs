//! Hardware adapter implementations
//!
//! This module defines the transport seam between instrument drivers and the
//! wire. Drivers speak SCPI text through [`ScpiTransport`]; adapters decide how
//! the bytes travel.

pub mod tcp_adapter;

pub use tcp_adapter::{parse_socket_descriptor, TcpScpiTransport};

use crate::error::AppResult;
use async_trait::async_trait;

/// Line-oriented SCPI transport.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Send a command without reading a response.
    async fn write(&mut self, cmd: &str) -> AppResult<()>;

    /// Send a command and read one response line (terminator stripped).
    ///
    /// Must be cancel safe: dropping a query before its reply arrives must
    /// not hand that reply to a later query.
    async fn query(&mut self, cmd: &str) -> AppResult<String>;

    /// Release the connection. Idempotent.
    async fn close(&mut self) -> AppResult<()>;
}
