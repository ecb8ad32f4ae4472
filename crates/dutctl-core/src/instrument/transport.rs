//! Line-oriented SCPI transports.
//!
//! Drivers never touch sockets directly; they talk to a boxed
//! [`ScpiTransport`] so the same driver runs against real hardware
//! ([`TcpScpi`]) or the in-process simulator ([`super::sim::SimScpi`]).

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::error::InstrumentError;
use super::types::Endpoint;

/// A request/response channel to one SCPI instrument.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Address used in error messages and logs.
    fn describe(&self) -> String;

    /// Send a command that produces no reply.
    async fn write(&mut self, command: &str) -> Result<(), InstrumentError>;

    /// Send a query and return its reply with the terminator stripped.
    async fn query(&mut self, command: &str) -> Result<String, InstrumentError>;
}

/// Builds transports for configured instruments.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, name: &str, endpoint: &Endpoint, timeout: Duration)
    -> Box<dyn ScpiTransport>;
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// Raw SCPI over a TCP socket (port 5025 on most bench instruments).
///
/// The connection is opened lazily and dropped on any I/O failure so the
/// next call reconnects.
pub struct TcpScpi {
    endpoint: Endpoint,
    timeout: Duration,
    conn: Option<BufReader<TcpStream>>,
}

impl TcpScpi {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self {
            endpoint,
            timeout,
            conn: None,
        }
    }

    fn comm_error(&self, message: impl Into<String>) -> InstrumentError {
        InstrumentError::Communication {
            endpoint: self.endpoint.to_string(),
            message: message.into(),
        }
    }

    fn timeout_error(&self) -> InstrumentError {
        InstrumentError::Timeout {
            endpoint: self.endpoint.to_string(),
            timeout: self.timeout,
        }
    }

    async fn connection(&mut self) -> Result<&mut BufReader<TcpStream>, InstrumentError> {
        if self.conn.is_none() {
            let addr = (self.endpoint.host.as_str(), self.endpoint.port);
            let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| self.timeout_error())?
                .map_err(|e| self.comm_error(format!("connect: {e}")))?;
            // SCPI exchanges are tiny; Nagle only adds latency.
            let _ = stream.set_nodelay(true);
            debug!(endpoint = %self.endpoint, "connected");
            self.conn = Some(BufReader::new(stream));
        }
        let unavailable = self.comm_error("connection unavailable");
        self.conn.as_mut().ok_or(unavailable)
    }

    async fn send_line(&mut self, command: &str) -> Result<(), InstrumentError> {
        let timeout = self.timeout;
        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\n');

        let conn = self.connection().await?;
        let result = tokio::time::timeout(timeout, conn.get_mut().write_all(line.as_bytes())).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.conn = None;
                Err(self.comm_error(format!("write: {e}")))
            }
            Err(_) => {
                self.conn = None;
                Err(self.timeout_error())
            }
        }
    }
}

#[async_trait]
impl ScpiTransport for TcpScpi {
    fn describe(&self) -> String {
        self.endpoint.to_string()
    }

    async fn write(&mut self, command: &str) -> Result<(), InstrumentError> {
        trace!(endpoint = %self.endpoint, command, "scpi write");
        self.send_line(command).await
    }

    async fn query(&mut self, command: &str) -> Result<String, InstrumentError> {
        trace!(endpoint = %self.endpoint, command, "scpi query");
        self.send_line(command).await?;

        let timeout = self.timeout;
        let mut reply = String::new();
        let conn = self.connection().await?;
        let result = tokio::time::timeout(timeout, conn.read_line(&mut reply)).await;
        match result {
            Ok(Ok(0)) => {
                self.conn = None;
                Err(self.comm_error("connection closed by instrument"))
            }
            Ok(Ok(_)) => Ok(reply.trim_end_matches(['\r', '\n']).to_string()),
            Ok(Err(e)) => {
                self.conn = None;
                Err(self.comm_error(format!("read: {e}")))
            }
            Err(_) => {
                // A late reply would desynchronise the next query.
                self.conn = None;
                Err(self.timeout_error())
            }
        }
    }
}

/// Factory producing [`TcpScpi`] transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn connect(
        &self,
        _name: &str,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Box<dyn ScpiTransport> {
        Box::new(TcpScpi::new(endpoint.clone(), timeout))
    }
}

/// Parse a numeric SCPI reply such as `+1.20000000E+00`.
pub fn parse_number(endpoint: &str, command: &str, reply: &str) -> Result<f64, InstrumentError> {
    reply
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| InstrumentError::MalformedReply {
            endpoint: endpoint.to_string(),
            command: command.to_string(),
            reply: reply.to_string(),
        })
}
