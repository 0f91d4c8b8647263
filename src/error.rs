//! Error types for bridge operations

use crate::srb::SrbStatus;
use thiserror::Error;

/// Bridge errors
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No device: {0}")]
    NoDevice(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported command code 0x{0:02x}")]
    UnsupportedCommand(u8),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Explain an SRB status code in operator terms
///
/// Used when logging the outcome of a command and by the demo programs.
pub fn describe_status(status: SrbStatus) -> &'static str {
    match status {
        SrbStatus::Pending => "Command pending: the request has not been finalized yet",
        SrbStatus::Complete => "Command completed successfully",
        SrbStatus::Aborted => "Command aborted by the host",
        SrbStatus::AbortFailed => "Abort request failed: the command had already completed",
        SrbStatus::Error => {
            "Command failed: the transport broke or the device reported an error. \
             Check target_status for the device status byte"
        }
        SrbStatus::InvalidCommand => "Invalid command code in SRB",
        SrbStatus::InvalidAdapter => "Invalid host adapter number: only adapter 0 exists",
        SrbStatus::NoDevice => {
            "No device: discovery found no matching SCSI device. \
             Set SEM_DEVICE to a /dev/sg path to override the scan"
        }
    }
}
