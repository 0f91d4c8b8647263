//! Remote executor server
//!
//! The other end of the socket codec bridge: accepts connections, decodes
//! request frames and answers each one from a [`CommandExecutor`]. Each
//! client gets its own thread. The executor is shared behind a mutex, so
//! commands from different clients never interleave on the device.
//!
//! With a session log directory configured, every client connection also
//! gets a [`SessionLog`] naming each command through an [`OpcodeDecoder`].

use crate::decoder::{LogLevel, OpcodeDecoder};
use crate::error::{BridgeError, BridgeResult};
use crate::passthrough::{PassthroughCommand, ScsiPassthrough};
use crate::session_log::SessionLog;
use crate::srb::{DataDirection, SENSE_LEN};
use crate::wire::{self, ExecRequest, ExecResponse};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Default listen address, matching the bridge's default endpoint
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:9999";

/// Answers decoded request frames
pub trait CommandExecutor {
    fn execute(&mut self, request: &ExecRequest) -> ExecResponse;
}

impl<E: CommandExecutor + ?Sized> CommandExecutor for Box<E> {
    fn execute(&mut self, request: &ExecRequest) -> ExecResponse {
        (**self).execute(request)
    }
}

/// Executor that runs requests on a local passthrough device
pub struct PassthroughExecutor<D: ScsiPassthrough> {
    device: D,
    timeout: Duration,
}

impl<D: ScsiPassthrough> PassthroughExecutor<D> {
    pub fn new(device: D, timeout: Duration) -> Self {
        PassthroughExecutor { device, timeout }
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

#[cfg(target_os = "linux")]
impl PassthroughExecutor<crate::sg::SgDevice> {
    /// Run device discovery and wrap the device it settles on
    pub fn discover(config: &crate::config::BridgeConfig) -> BridgeResult<Self> {
        let matcher = crate::discovery::AllowlistMatcher::from_config(&config.discovery);
        let found = crate::discovery::discover(&config.discovery, &crate::sg::SgOpener, &matcher)
            .ok_or_else(|| BridgeError::NoDevice("no matching generic-SCSI device".to_string()))?;
        log::info!("Executing on {}", found.path.display());
        Ok(PassthroughExecutor::new(found.device, config.command_timeout))
    }
}

impl<D: ScsiPassthrough> CommandExecutor for PassthroughExecutor<D> {
    fn execute(&mut self, request: &ExecRequest) -> ExecResponse {
        let mut data = vec![0u8; request.transfer_len as usize];
        if request.direction == DataDirection::Out {
            let n = request.data.len().min(data.len());
            data[..n].copy_from_slice(&request.data[..n]);
        }
        let mut sense = [0u8; SENSE_LEN];

        let mut cmd = PassthroughCommand {
            cdb: &request.cdb,
            direction: request.direction,
            data: &mut data,
            sense: &mut sense,
            timeout: self.timeout,
        };

        match self.device.execute(&mut cmd) {
            Ok(result) if result.status == 0 => {
                if request.direction != DataDirection::In {
                    return ExecResponse::complete(Vec::new());
                }
                let resid = usize::try_from(result.resid.max(0)).unwrap_or(0);
                data.truncate(data.len().saturating_sub(resid));
                ExecResponse::complete(data)
            }
            Ok(result) => {
                let sense_len = (result.sense_len as usize).min(sense.len());
                log::warn!(
                    "Device status 0x{:02x} for cdb={} sense={}",
                    result.status,
                    hex::encode(&request.cdb),
                    hex::encode(&sense[..sense_len])
                );
                ExecResponse::error()
            }
            Err(e) => {
                log::error!("Passthrough failed for cdb={}: {}", hex::encode(&request.cdb), e);
                ExecResponse::error()
            }
        }
    }
}

/// Serve request frames from one connection until the peer closes it
///
/// Returns the number of commands answered.
pub fn serve_connection<S, E>(stream: &mut S, executor: &Mutex<E>) -> BridgeResult<u64>
where
    S: Read + Write,
    E: CommandExecutor + ?Sized,
{
    answer_frames(stream, executor, None::<&mut SessionLog<io::Sink>>)
}

/// [`serve_connection`], recording every exchange in `session`
///
/// A failure that ends the connection is recorded as an error event.
pub fn serve_logged_connection<S, E, W>(
    stream: &mut S,
    executor: &Mutex<E>,
    session: &mut SessionLog<W>,
) -> BridgeResult<u64>
where
    S: Read + Write,
    E: CommandExecutor + ?Sized,
    W: Write,
{
    let result = answer_frames(stream, executor, Some(&mut *session));
    if let Err(e) = &result {
        session.event(LogLevel::Err, &format!("Error: {}", e));
    }
    result
}

fn answer_frames<S, E, W>(
    stream: &mut S,
    executor: &Mutex<E>,
    mut session: Option<&mut SessionLog<W>>,
) -> BridgeResult<u64>
where
    S: Read + Write,
    E: CommandExecutor + ?Sized,
    W: Write,
{
    let mut served = 0;
    while let Some(request) = wire::read_request(stream)? {
        log::debug!(
            "Request cdb={} dir={:?} len={}",
            hex::encode(&request.cdb),
            request.direction,
            request.transfer_len
        );
        if let Some(session) = session.as_deref_mut() {
            session.command(&request);
        }

        let response = {
            let mut executor = executor
                .lock()
                .map_err(|_| BridgeError::Protocol("executor lock poisoned".to_string()))?;
            executor.execute(&request)
        };

        if let Some(session) = session.as_deref_mut() {
            session.response(&request, &response);
        }
        wire::write_response(stream, &response)?;
        served += 1;
    }
    Ok(served)
}

/// Where session logs go and how commands are named in them
#[derive(Debug, Clone)]
struct SessionLogging {
    dir: PathBuf,
    decoder: Arc<OpcodeDecoder>,
}

impl SessionLogging {
    fn open(&self, peer: &str) -> Option<SessionLog<std::fs::File>> {
        match SessionLog::create(&self.dir, Arc::clone(&self.decoder)) {
            Ok(mut session) => {
                session.event(LogLevel::Info, &format!("Client Connected: {}", peer));
                Some(session)
            }
            Err(e) => {
                log::warn!("No session log for {}: {}", peer, e);
                None
            }
        }
    }
}

/// Executor server
pub struct ExecutorServer<E: CommandExecutor> {
    bind_addr: String,
    io_timeout: Option<Duration>,
    session_logging: Option<SessionLogging>,
    executor: Arc<Mutex<E>>,
}

impl<E: CommandExecutor + Send + 'static> ExecutorServer<E> {
    /// Create a new builder for configuring the server
    pub fn builder() -> ExecutorServerBuilder<E> {
        ExecutorServerBuilder::new()
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn executor(&self) -> Arc<Mutex<E>> {
        Arc::clone(&self.executor)
    }

    pub fn session_log_dir(&self) -> Option<&Path> {
        self.session_logging.as_ref().map(|l| l.dir.as_path())
    }

    /// Bind the listening socket
    pub fn bind(self) -> BridgeResult<BoundServer<E>> {
        let listener = TcpListener::bind(&self.bind_addr)?;
        log::info!("Executor server listening on {}", listener.local_addr()?);
        Ok(BoundServer {
            listener,
            io_timeout: self.io_timeout,
            session_logging: self.session_logging,
            executor: self.executor,
        })
    }

    /// Bind and serve forever
    pub fn run(self) -> BridgeResult<()> {
        self.bind()?.serve()
    }
}

/// A server with its listening socket bound
pub struct BoundServer<E: CommandExecutor> {
    listener: TcpListener,
    io_timeout: Option<Duration>,
    session_logging: Option<SessionLogging>,
    executor: Arc<Mutex<E>>,
}

impl<E: CommandExecutor + Send + 'static> BoundServer<E> {
    pub fn local_addr(&self) -> BridgeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one thread per client
    pub fn serve(self) -> BridgeResult<()> {
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let executor = Arc::clone(&self.executor);
            let io_timeout = self.io_timeout;
            let logging = self.session_logging.clone();
            thread::spawn(move || handle_client(stream, io_timeout, logging.as_ref(), &executor));
        }
        Ok(())
    }

    /// Accept a single connection and serve it on the calling thread
    pub fn serve_one(&self) -> BridgeResult<u64> {
        let (stream, _) = self.listener.accept()?;
        handle_client(stream, self.io_timeout, self.session_logging.as_ref(), &self.executor)
    }
}

fn handle_client<E: CommandExecutor>(
    mut stream: TcpStream,
    io_timeout: Option<Duration>,
    logging: Option<&SessionLogging>,
    executor: &Mutex<E>,
) -> BridgeResult<u64> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    log::info!("Client connected: {}", peer);

    stream.set_nodelay(true)?;
    stream.set_read_timeout(io_timeout)?;
    stream.set_write_timeout(io_timeout)?;

    let result = match logging.and_then(|l| l.open(&peer)) {
        Some(mut session) => {
            let result = serve_logged_connection(&mut stream, executor, &mut session);
            session.close();
            result
        }
        None => serve_connection(&mut stream, executor),
    };
    match &result {
        Ok(served) => log::info!("Client {} disconnected after {} commands", peer, served),
        Err(e) => log::warn!("Client {} dropped: {}", peer, e),
    }
    result
}

/// Builder for configuring an executor server
pub struct ExecutorServerBuilder<E: CommandExecutor> {
    bind_addr: Option<String>,
    io_timeout: Option<Duration>,
    session_log_dir: Option<PathBuf>,
    decoder: Option<OpcodeDecoder>,
    _phantom: std::marker::PhantomData<E>,
}

impl<E: CommandExecutor> ExecutorServerBuilder<E> {
    fn new() -> Self {
        Self {
            bind_addr: None,
            io_timeout: None,
            session_log_dir: None,
            decoder: None,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Set the bind address (default: 127.0.0.1:9999)
    pub fn bind_addr(mut self, addr: &str) -> Self {
        self.bind_addr = Some(addr.to_string());
        self
    }

    /// Per-connection read/write timeout (default: none)
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    /// Write a transaction log per client connection into `dir`
    pub fn session_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.session_log_dir = Some(dir.into());
        self
    }

    /// Opcode table for session logs (default: [`OpcodeDecoder::builtin`])
    pub fn decoder(mut self, decoder: OpcodeDecoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Build the server around the executor
    pub fn build(self, executor: E) -> BridgeResult<ExecutorServer<E>> {
        let bind_addr = self
            .bind_addr
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        if !bind_addr.contains(':') {
            return Err(BridgeError::Config(format!(
                "bind_addr must be host:port, got '{}'",
                bind_addr
            )));
        }
        if self.io_timeout == Some(Duration::ZERO) {
            return Err(BridgeError::Config("io_timeout must be nonzero".to_string()));
        }

        let decoder = self.decoder;
        let session_logging = self.session_log_dir.map(|dir| SessionLogging {
            dir,
            decoder: Arc::new(decoder.unwrap_or_else(OpcodeDecoder::builtin)),
        });

        Ok(ExecutorServer {
            bind_addr,
            io_timeout: self.io_timeout,
            session_logging,
            executor: Arc::new(Mutex::new(executor)),
        })
    }
}
