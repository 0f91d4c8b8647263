//! ASPI SCSI bridge
//!
//! Lets a legacy ASPI client drive a SCSI peripheral it cannot reach
//! directly. The client's SCSI Request Blocks (SRBs) are executed by one of
//! two bridges:
//!
//! - [`SocketBridge`] forwards each command to a remote executor over a
//!   small length-prefixed protocol (see [`wire`] and [`server`]).
//! - [`PassthroughBridge`] runs each command on a local Linux generic-SCSI
//!   node through `SG_IO`, after [`discovery`] has picked the node with an
//!   INQUIRY probe.
//!
//! [`Aspi`] is the entry point: it answers the adapter queries itself and
//! hands ExecuteScsiCommand SRBs to the bridge.
//!
//! On the executor side, [`ExecutorServer`] runs either a
//! [`PassthroughExecutor`] or the in-memory [`VirtualSem`], and can keep a
//! per-client [`SessionLog`] of every exchange.
//!
//! # Example
//!
//! ```no_run
//! use aspi_bridge::{flags, Aspi, BridgeConfig, CompletionEvent, SocketBridge, Srb, SrbStatus};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BridgeConfig::from_env()?;
//! let mut aspi = Aspi::new(SocketBridge::from_config(&config));
//!
//! let event = CompletionEvent::new();
//! let mut buf = [0u8; 96];
//! let mut srb = Srb::exec(&[0x12, 0, 0, 0, 96, 0], flags::DIR_IN, &mut buf)
//!     .with_completion(&event);
//!
//! let status = aspi.send_command(&mut srb);
//! event.wait_timeout(Duration::from_secs(1));
//! if status == SrbStatus::Complete {
//!     println!("Vendor: {}", String::from_utf8_lossy(&buf[8..16]));
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decoder;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod passthrough;
pub mod probe;
pub mod server;
pub mod session_log;
#[cfg(target_os = "linux")]
pub mod sg;
pub mod socket;
pub mod srb;
pub mod virtual_sem;
pub mod wire;

pub use config::{BridgeConfig, BridgeConfigBuilder, DiscoveryConfig};
pub use decoder::{LogLevel, OpcodeDecoder};
pub use discovery::{AllowlistMatcher, DeviceMatcher, DeviceOpener, Discovered};
pub use dispatcher::{Aspi, CommandBridge};
pub use error::{describe_status, BridgeError, BridgeResult};
pub use passthrough::{PassthroughBridge, PassthroughCommand, PassthroughResult, ScsiPassthrough};
pub use probe::DeviceIdentity;
pub use server::{CommandExecutor, ExecutorServer, PassthroughExecutor};
pub use session_log::SessionLog;
pub use socket::{Connector, SocketBridge, TcpConnector};
pub use srb::{
    flags, AdapterInquiry, CommandCode, CompletionEvent, CompletionSignal, DataDirection,
    ScsiOutcome, Srb, SrbStatus,
};
pub use virtual_sem::{SemEvent, SemState, VirtualSem};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
