//! Socket codec bridge
//!
//! Executes SRBs on a remote executor over a persistent stream connection
//! using the framing in [`crate::wire`]. The connection is opened lazily,
//! reused while it works, and dropped on the first I/O or framing failure
//! so the next command starts on a fresh connection. Nothing is retried
//! within a call.

use crate::config::BridgeConfig;
use crate::dispatcher::CommandBridge;
use crate::error::{BridgeError, BridgeResult};
use crate::srb::{DataDirection, ScsiOutcome, Srb};
use crate::wire::{self, ResponseHeader, RESPONSE_HEADER_SIZE};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Establishes connections to the remote executor
pub trait Connector {
    type Stream: Read + Write;

    fn connect(&self) -> io::Result<Self::Stream>;

    /// Human-readable endpoint, for logs
    fn endpoint(&self) -> &str;
}

/// TCP connector for a fixed `host:port`
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: String,
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(endpoint: &str) -> Self {
        let defaults = BridgeConfig::default();
        TcpConnector {
            endpoint: endpoint.to_string(),
            connect_timeout: defaults.connect_timeout,
            io_timeout: defaults.io_timeout,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        TcpConnector {
            endpoint: config.endpoint.clone(),
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
        }
    }

    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in self.endpoint.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(self.io_timeout)?;
                    stream.set_write_timeout(self.io_timeout)?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} resolved to no addresses", self.endpoint),
            )
        }))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Bridge that forwards ExecuteScsiCommand to a remote executor
pub struct SocketBridge<C: Connector = TcpConnector> {
    connector: C,
    conn: Option<C::Stream>,
}

impl SocketBridge<TcpConnector> {
    pub fn from_config(config: &BridgeConfig) -> Self {
        SocketBridge::new(TcpConnector::from_config(config))
    }
}

impl<C: Connector> SocketBridge<C> {
    /// Create a bridge; no connection is made until the first command
    pub fn new(connector: C) -> Self {
        SocketBridge {
            connector,
            conn: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Drop the connection; the next command reconnects
    pub fn disconnect(&mut self) {
        if self.conn.take().is_some() {
            log::debug!("Dropped connection to {}", self.connector.endpoint());
        }
    }

    /// Execute one SRB on the remote executor
    pub fn execute(&mut self, srb: &mut Srb<'_>) -> ScsiOutcome {
        let direction = srb.direction();
        let (cdb, data, _sense) = srb.transfer_parts();
        log::debug!(
            "Remote exec cdb={} dir={:?} len={}",
            hex::encode(cdb),
            direction,
            data.len()
        );

        match self.transact(cdb, direction, data) {
            Ok(wire::status::COMPLETE) => ScsiOutcome::complete(),
            Ok(status) => {
                log::warn!("Executor reported status 0x{:02x}", status);
                ScsiOutcome::target_error(status)
            }
            Err(_) => ScsiOutcome::error(),
        }
    }

    /// One request/response exchange. Returns the wire status byte.
    ///
    /// At most `data.len()` response bytes are copied into `data`; any
    /// excess is read and discarded so the stream stays framed. Any error
    /// drops the connection.
    pub fn transact(
        &mut self,
        cdb: &[u8],
        direction: DataDirection,
        data: &mut [u8],
    ) -> BridgeResult<u8> {
        let result = self.exchange(cdb, direction, data);
        if let Err(e) = &result {
            log::error!("Executor exchange with {} failed: {}", self.connector.endpoint(), e);
            self.disconnect();
        }
        result
    }

    fn exchange(
        &mut self,
        cdb: &[u8],
        direction: DataDirection,
        data: &mut [u8],
    ) -> BridgeResult<u8> {
        let stream = self.stream()?;

        wire::write_request(stream, cdb, direction, data)?;

        let mut header_buf = [0u8; RESPONSE_HEADER_SIZE];
        stream.read_exact(&mut header_buf)?;
        let header = ResponseHeader::from_bytes(&header_buf);

        let data_len = header.data_len as usize;
        let copy_len = data_len.min(data.len());
        stream.read_exact(&mut data[..copy_len])?;

        let excess = (data_len - copy_len) as u64;
        if excess > 0 {
            log::warn!(
                "Executor returned {} bytes, buffer is {}; draining {}",
                data_len,
                data.len(),
                excess
            );
            drain(stream, excess)?;
        }

        if copy_len >= 16 {
            log::trace!("Buffer[0..16]: {}", hex::encode(&data[..16]));
        }

        Ok(header.status)
    }

    fn stream(&mut self) -> BridgeResult<&mut C::Stream> {
        if self.conn.is_none() {
            let stream = self.connector.connect().map_err(|e| {
                log::error!("Connection to executor at {} failed: {}", self.connector.endpoint(), e);
                BridgeError::Io(e)
            })?;
            log::info!("Connected to executor at {}", self.connector.endpoint());
            self.conn = Some(stream);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| BridgeError::Protocol("connection unavailable".to_string()))
    }
}

/// Read and discard exactly `count` bytes
fn drain<R: Read>(stream: &mut R, count: u64) -> BridgeResult<()> {
    let drained = io::copy(&mut stream.by_ref().take(count), &mut io::sink())?;
    if drained != count {
        return Err(BridgeError::Protocol(format!(
            "Connection closed while draining: {} of {} bytes",
            drained, count
        )));
    }
    Ok(())
}

impl<C: Connector> CommandBridge for SocketBridge<C> {
    fn execute(&mut self, srb: &mut Srb<'_>) -> ScsiOutcome {
        SocketBridge::execute(self, srb)
    }

    fn adapter_identifier(&self) -> &str {
        "SOCKET BRIDGE"
    }
}
