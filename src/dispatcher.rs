//! ASPI entry points
//!
//! [`Aspi`] is the context object behind `GetASPI32SupportInfo` and
//! `SendASPI32Command`. It owns one [`CommandBridge`] and routes each SRB by
//! command code. Every submission leaves the SRB with a terminal status,
//! and only ExecuteScsiCommand ever reaches the bridge.

use crate::error::BridgeError;
use crate::srb::{AdapterInquiry, CommandCode, ScsiOutcome, Srb, SrbStatus, DTYPE_DIRECT_ACCESS};

/// Support-info word: one host adapter, status byte `SS_COMP`
pub const SUPPORT_INFO: u32 = (1 << 8) | SrbStatus::Complete as u32;

/// ASPI manager identification reported by AdapterInquiry
pub const MANAGER_ID: &str = "ASPI for WIN32";

/// Maximum transfer length reported by AdapterInquiry
pub const MAX_TRANSFER: u32 = 64 * 1024;

/// Executes ExecuteScsiCommand SRBs against some backend
pub trait CommandBridge {
    /// Run the SRB's CDB. Must not touch the SRB status; the dispatcher
    /// writes it from the returned outcome.
    fn execute(&mut self, srb: &mut Srb<'_>) -> ScsiOutcome;

    /// Host adapter identification for AdapterInquiry
    fn adapter_identifier(&self) -> &str {
        "ASPI BRIDGE"
    }
}

impl<B: CommandBridge + ?Sized> CommandBridge for Box<B> {
    fn execute(&mut self, srb: &mut Srb<'_>) -> ScsiOutcome {
        (**self).execute(srb)
    }

    fn adapter_identifier(&self) -> &str {
        (**self).adapter_identifier()
    }
}

/// ASPI dispatcher over one bridge
pub struct Aspi<B: CommandBridge> {
    bridge: B,
}

impl<B: CommandBridge> Aspi<B> {
    pub fn new(bridge: B) -> Self {
        log::info!("ASPI bridge ready: {}", bridge.adapter_identifier());
        Aspi { bridge }
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    pub fn into_bridge(self) -> B {
        self.bridge
    }

    /// `GetASPI32SupportInfo`
    pub fn support_info(&self) -> u32 {
        SUPPORT_INFO
    }

    /// `SendASPI32Command`
    ///
    /// Returns the status written into the SRB.
    pub fn send_command(&mut self, srb: &mut Srb<'_>) -> SrbStatus {
        srb.mark_pending();

        let Some(command) = srb.command() else {
            log::warn!("{}", BridgeError::UnsupportedCommand(srb.command_code));
            return srb.finalize_status(SrbStatus::Error);
        };
        log::debug!("ASPI command {:?}", command);

        match command {
            CommandCode::AdapterInquiry => {
                srb.adapter_inquiry = Some(AdapterInquiry {
                    adapter_count: 1,
                    scsi_id: 7,
                    manager_id: MANAGER_ID.to_string(),
                    identifier: self.bridge.adapter_identifier().to_string(),
                    max_transfer: MAX_TRANSFER,
                });
                srb.finalize(ScsiOutcome::complete())
            }
            CommandCode::GetDeviceType => {
                srb.device_type = Some(DTYPE_DIRECT_ACCESS);
                srb.finalize(ScsiOutcome::complete())
            }
            CommandCode::ExecuteScsiCommand => {
                let outcome = self.bridge.execute(srb);
                let status = srb.finalize(outcome);
                log::debug!("ExecuteScsiCommand finished: {:?}", status);
                status
            }
            other => {
                log::warn!("{} ({:?})", BridgeError::UnsupportedCommand(other as u8), other);
                srb.finalize_status(SrbStatus::Error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srb::{flags, CompletionEvent};
    use std::time::Duration;

    /// Bridge that fills the data-in buffer and reports a fixed outcome
    struct ScriptedBridge {
        outcome: ScsiOutcome,
        calls: u32,
    }

    impl ScriptedBridge {
        fn new(outcome: ScsiOutcome) -> Self {
            ScriptedBridge { outcome, calls: 0 }
        }
    }

    impl CommandBridge for ScriptedBridge {
        fn execute(&mut self, srb: &mut Srb<'_>) -> ScsiOutcome {
            self.calls += 1;
            srb.data.fill(0x42);
            self.outcome
        }
    }

    #[test]
    fn test_support_info() {
        let aspi = Aspi::new(ScriptedBridge::new(ScsiOutcome::complete()));
        assert_eq!(aspi.support_info(), 0x0101);
        assert_eq!(aspi.bridge().calls, 0);
    }

    #[test]
    fn test_adapter_inquiry() {
        let mut aspi = Aspi::new(ScriptedBridge::new(ScsiOutcome::complete()));
        let mut srb = Srb::new(CommandCode::AdapterInquiry as u8);
        assert_eq!(aspi.send_command(&mut srb), SrbStatus::Complete);

        let inquiry = srb.adapter_inquiry.unwrap();
        assert_eq!(inquiry.adapter_count, 1);
        assert_eq!(inquiry.manager_id, "ASPI for WIN32");
        assert_eq!(inquiry.identifier, "ASPI BRIDGE");
        assert_eq!(aspi.bridge().calls, 0);
    }

    #[test]
    fn test_get_device_type() {
        let mut aspi = Aspi::new(ScriptedBridge::new(ScsiOutcome::complete()));
        let mut srb = Srb::new(CommandCode::GetDeviceType as u8).with_address(0, 3, 0);
        assert_eq!(aspi.send_command(&mut srb), SrbStatus::Complete);
        assert_eq!(srb.device_type, Some(0));
        assert_eq!(aspi.bridge().calls, 0);
    }

    #[test]
    fn test_exec_uses_bridge_outcome() {
        let mut aspi = Aspi::new(ScriptedBridge::new(ScsiOutcome::target_error(0x02)));
        let mut buf = [0u8; 8];
        let mut srb = Srb::exec(&[0x03, 0, 0, 0, 8, 0], flags::DIR_IN, &mut buf);
        assert_eq!(aspi.send_command(&mut srb), SrbStatus::Error);
        assert_eq!(srb.target_status, 0x02);
        assert_eq!(srb.host_status, 0);
        assert_eq!(buf, [0x42; 8]);
    }

    #[test]
    fn test_unsupported_commands_fail_without_side_effects() {
        let mut aspi = Aspi::new(ScriptedBridge::new(ScsiOutcome::complete()));
        for code in [0x03u8, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0xFF] {
            let mut srb = Srb::new(code);
            assert_eq!(aspi.send_command(&mut srb), SrbStatus::Error, "code 0x{:02x}", code);
            assert!(srb.adapter_inquiry.is_none());
            assert!(srb.device_type.is_none());
        }
        assert_eq!(aspi.bridge().calls, 0);
    }

    #[test]
    fn test_unsupported_commands_keep_caller_status_fields() {
        let mut aspi = Aspi::new(ScriptedBridge::new(ScsiOutcome::complete()));
        for code in [CommandCode::RescanBus as u8, 0x09] {
            let mut srb = Srb::new(code);
            srb.host_status = 0x11;
            srb.target_status = 0x22;
            assert_eq!(aspi.send_command(&mut srb), SrbStatus::Error);
            assert_eq!(srb.host_status, 0x11, "code 0x{:02x}", code);
            assert_eq!(srb.target_status, 0x22, "code 0x{:02x}", code);
        }
    }

    #[test]
    fn test_resubmitted_srb_gets_fresh_status() {
        let mut aspi = Aspi::new(ScriptedBridge::new(ScsiOutcome::complete()));
        let mut srb = Srb::exec(&[0x00; 6], 0, &mut []);
        assert_eq!(aspi.send_command(&mut srb), SrbStatus::Complete);

        aspi.bridge_mut().outcome = ScsiOutcome::error();
        assert_eq!(aspi.send_command(&mut srb), SrbStatus::Error);
        assert_eq!(aspi.bridge().calls, 2);
    }

    #[test]
    fn test_completion_signalled_for_exec_only() {
        let mut aspi = Aspi::new(ScriptedBridge::new(ScsiOutcome::error()));

        let event = CompletionEvent::new();
        let mut srb = Srb::exec(&[0x00; 6], 0, &mut []).with_completion(&event);
        aspi.send_command(&mut srb);
        assert!(event.wait_timeout(Duration::from_millis(10)));

        let other = CompletionEvent::new();
        let mut srb = Srb::new(CommandCode::AdapterInquiry as u8).with_completion(&other);
        aspi.send_command(&mut srb);
        assert!(!other.is_set());
    }

    #[test]
    fn test_boxed_bridge() {
        let bridge: Box<dyn CommandBridge> = Box::new(ScriptedBridge::new(ScsiOutcome::no_device()));
        let mut aspi = Aspi::new(bridge);
        let mut srb = Srb::exec(&[0x00; 6], 0, &mut []);
        assert_eq!(aspi.send_command(&mut srb), SrbStatus::NoDevice);
    }
}
