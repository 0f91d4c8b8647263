//! Local generic-SCSI passthrough bridge
//!
//! Executes an SRB directly against the device handle resolved by
//! discovery. The kernel moves data straight into the caller's buffer, so
//! no copy or length reconciliation happens here.

use crate::config::BridgeConfig;
use crate::dispatcher::CommandBridge;
use crate::srb::{DataDirection, ScsiOutcome, Srb};
use std::io;
use std::time::Duration;

/// A raw SCSI command ready for a passthrough device
pub struct PassthroughCommand<'a> {
    pub cdb: &'a [u8],
    pub direction: DataDirection,
    /// Transfer region, its length is the transfer length
    pub data: &'a mut [u8],
    /// Sense region
    pub sense: &'a mut [u8],
    pub timeout: Duration,
}

/// What the kernel reported for a completed passthrough call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassthroughResult {
    /// SCSI status byte from the device
    pub status: u8,
    pub host_status: u16,
    pub driver_status: u16,
    /// Bytes of sense data written
    pub sense_len: u8,
    /// Bytes of the transfer that did not happen
    pub resid: i32,
}

/// A device that can execute raw CDBs
///
/// `Err` means the call itself could not be issued or completed. A device
/// that rejected the command still returns `Ok` with a nonzero status.
pub trait ScsiPassthrough {
    fn execute(&mut self, cmd: &mut PassthroughCommand<'_>) -> io::Result<PassthroughResult>;
}

impl<D: ScsiPassthrough + ?Sized> ScsiPassthrough for Box<D> {
    fn execute(&mut self, cmd: &mut PassthroughCommand<'_>) -> io::Result<PassthroughResult> {
        (**self).execute(cmd)
    }
}

/// Bridge that runs ExecuteScsiCommand on a local device
pub struct PassthroughBridge<D: ScsiPassthrough> {
    device: Option<D>,
    timeout: Duration,
}

impl<D: ScsiPassthrough> PassthroughBridge<D> {
    /// Create a bridge over an already resolved device (or none)
    pub fn new(device: Option<D>, timeout: Duration) -> Self {
        PassthroughBridge { device, timeout }
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    /// Execute one SRB against the device
    pub fn execute(&mut self, srb: &mut Srb<'_>) -> ScsiOutcome {
        let Some(device) = self.device.as_mut() else {
            log::warn!("No device resolved at startup, failing command");
            return ScsiOutcome::no_device();
        };

        // Target/LUN are ignored, the bridge is mapped to one device
        let direction = srb.direction();
        let (cdb, data, sense) = srb.transfer_parts();
        log::debug!(
            "SG_IO cdb={} dir={:?} len={}",
            hex::encode(cdb),
            direction,
            data.len()
        );

        let mut cmd = PassthroughCommand {
            cdb,
            direction,
            data,
            sense,
            timeout: self.timeout,
        };

        match device.execute(&mut cmd) {
            Err(e) => {
                log::error!("SG_IO ioctl failed: {}", e);
                ScsiOutcome::error()
            }
            Ok(result) => {
                if result.host_status != 0 || result.driver_status != 0 {
                    log::warn!(
                        "SG_IO host_status=0x{:x} driver_status=0x{:x}",
                        result.host_status,
                        result.driver_status
                    );
                }
                if result.status != 0 {
                    log::warn!("SCSI error status: 0x{:x}", result.status);
                    ScsiOutcome::target_error(result.status)
                } else {
                    ScsiOutcome::complete()
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
impl PassthroughBridge<crate::sg::SgDevice> {
    /// Run device discovery once and build a bridge over whatever it found
    pub fn discover(config: &BridgeConfig) -> Self {
        let matcher = crate::discovery::AllowlistMatcher::from_config(&config.discovery);
        let found = crate::discovery::discover(&config.discovery, &crate::sg::SgOpener, &matcher);
        PassthroughBridge::new(found.map(|d| d.device), config.command_timeout)
    }
}

impl<D: ScsiPassthrough> CommandBridge for PassthroughBridge<D> {
    fn execute(&mut self, srb: &mut Srb<'_>) -> ScsiOutcome {
        PassthroughBridge::execute(self, srb)
    }

    fn adapter_identifier(&self) -> &str {
        "SG PASSTHROUGH"
    }
}
