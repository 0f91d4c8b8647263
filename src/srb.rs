//! SCSI Request Block model
//!
//! The SRB is the command/result record the legacy client hands to
//! `SendASPI32Command`. The bridges read the command side (CDB, flags,
//! caller buffers) and the dispatcher writes the result side exactly once.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Largest CDB an SRB can carry
pub const MAX_CDB_LEN: usize = 16;

/// Size of the SRB sense area (32 bytes of sense data plus 2 reserved)
pub const SENSE_LEN: usize = 32 + 2;

/// Peripheral device type reported for GetDeviceType (direct access)
pub const DTYPE_DIRECT_ACCESS: u8 = 0x00;

/// ASPI command codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    AdapterInquiry = 0x00,
    GetDeviceType = 0x01,
    ExecuteScsiCommand = 0x02,
    AbortSrb = 0x03,
    ResetDevice = 0x04,
    SetAdapterParams = 0x05,
    GetDiskInfo = 0x06,
    RescanBus = 0x07,
    GetSetTimeouts = 0x08,
}

impl CommandCode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(CommandCode::AdapterInquiry),
            0x01 => Some(CommandCode::GetDeviceType),
            0x02 => Some(CommandCode::ExecuteScsiCommand),
            0x03 => Some(CommandCode::AbortSrb),
            0x04 => Some(CommandCode::ResetDevice),
            0x05 => Some(CommandCode::SetAdapterParams),
            0x06 => Some(CommandCode::GetDiskInfo),
            0x07 => Some(CommandCode::RescanBus),
            0x08 => Some(CommandCode::GetSetTimeouts),
            _ => None,
        }
    }
}

/// SRB status codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SrbStatus {
    #[default]
    Pending = 0x00,
    Complete = 0x01,
    Aborted = 0x02,
    AbortFailed = 0x03,
    Error = 0x04,
    InvalidCommand = 0x80,
    InvalidAdapter = 0x81,
    NoDevice = 0x82,
}

impl SrbStatus {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(SrbStatus::Pending),
            0x01 => Some(SrbStatus::Complete),
            0x02 => Some(SrbStatus::Aborted),
            0x03 => Some(SrbStatus::AbortFailed),
            0x04 => Some(SrbStatus::Error),
            0x80 => Some(SrbStatus::InvalidCommand),
            0x81 => Some(SrbStatus::InvalidAdapter),
            0x82 => Some(SrbStatus::NoDevice),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != SrbStatus::Pending
    }
}

/// SRB flag bits
pub mod flags {
    pub const POSTING: u8 = 0x01;
    pub const RESIDUAL_COUNT: u8 = 0x04;
    pub const DIR_IN: u8 = 0x08;
    pub const DIR_OUT: u8 = 0x10;
    pub const EVENT_NOTIFY: u8 = 0x40;
}

/// Data phase direction of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// No data phase
    None,
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl DataDirection {
    /// Map SRB flags to a direction. DIR_IN wins if a caller sets both.
    pub fn from_flags(srb_flags: u8) -> Self {
        if srb_flags & flags::DIR_IN != 0 {
            DataDirection::In
        } else if srb_flags & flags::DIR_OUT != 0 {
            DataDirection::Out
        } else {
            DataDirection::None
        }
    }
}

/// Completion notification for posted commands
///
/// Raised once per command after the SRB status is final.
pub trait CompletionSignal {
    fn signal(&self);
}

impl<F: Fn()> CompletionSignal for F {
    fn signal(&self) {
        self()
    }
}

/// Manual-reset event, the Rust stand-in for a Win32 event handle
#[derive(Debug, Default)]
pub struct CompletionEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl CompletionEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.signalled.lock().map(|s| *s).unwrap_or(false)
    }

    pub fn reset(&self) {
        if let Ok(mut s) = self.signalled.lock() {
            *s = false;
        }
    }

    /// Block until signalled or `timeout` elapses. Returns whether the event is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = match self.signalled.lock() {
            Ok(g) => g,
            Err(_) => return false,
        };
        match self.cond.wait_timeout_while(guard, timeout, |set| !*set) {
            Ok((set, _)) => *set,
            Err(_) => false,
        }
    }
}

impl CompletionSignal for CompletionEvent {
    fn signal(&self) {
        if let Ok(mut s) = self.signalled.lock() {
            *s = true;
            self.cond.notify_all();
        }
    }
}

/// Adapter description returned by AdapterInquiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInquiry {
    pub adapter_count: u8,
    pub scsi_id: u8,
    /// ASPI manager identification (16 chars max)
    pub manager_id: String,
    /// Host adapter identification (16 chars max)
    pub identifier: String,
    pub max_transfer: u32,
}

/// Result fields a bridge hands back for one executed command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScsiOutcome {
    pub status: SrbStatus,
    pub host_status: u8,
    pub target_status: u8,
}

impl ScsiOutcome {
    pub fn complete() -> Self {
        ScsiOutcome {
            status: SrbStatus::Complete,
            host_status: 0,
            target_status: 0,
        }
    }

    /// Transport or framing failure, no device status available
    pub fn error() -> Self {
        ScsiOutcome {
            status: SrbStatus::Error,
            host_status: 0,
            target_status: 0,
        }
    }

    /// The remote executor or the device reported a nonzero status
    pub fn target_error(target_status: u8) -> Self {
        ScsiOutcome {
            status: SrbStatus::Error,
            host_status: 0,
            target_status,
        }
    }

    pub fn no_device() -> Self {
        ScsiOutcome {
            status: SrbStatus::NoDevice,
            host_status: 0,
            target_status: 0,
        }
    }
}

/// SCSI Request Block
///
/// Borrows the caller's data buffer and completion signal for the duration
/// of one call. The bridge writes at most `data.len()` bytes into `data` and
/// never reallocates it.
pub struct Srb<'a> {
    pub command_code: u8,
    status: SrbStatus,
    pub adapter_id: u8,
    pub target_id: u8,
    pub lun: u8,
    pub flags: u8,
    cdb: [u8; MAX_CDB_LEN],
    cdb_len: u8,
    pub data: &'a mut [u8],
    pub sense: [u8; SENSE_LEN],
    pub host_status: u8,
    pub target_status: u8,
    pub completion: Option<&'a dyn CompletionSignal>,
    /// Filled by AdapterInquiry
    pub adapter_inquiry: Option<AdapterInquiry>,
    /// Filled by GetDeviceType
    pub device_type: Option<u8>,
}

impl Srb<'static> {
    /// Create an SRB for a command that carries no data buffer
    pub fn new(command_code: u8) -> Self {
        Srb {
            command_code,
            status: SrbStatus::Pending,
            adapter_id: 0,
            target_id: 0,
            lun: 0,
            flags: 0,
            cdb: [0u8; MAX_CDB_LEN],
            cdb_len: 0,
            data: &mut [],
            sense: [0u8; SENSE_LEN],
            host_status: 0,
            target_status: 0,
            completion: None,
            adapter_inquiry: None,
            device_type: None,
        }
    }
}

impl<'a> Srb<'a> {
    /// Create an ExecuteScsiCommand SRB
    ///
    /// CDB bytes past `MAX_CDB_LEN` are dropped.
    pub fn exec(cdb: &[u8], srb_flags: u8, data: &'a mut [u8]) -> Self {
        let len = cdb.len().min(MAX_CDB_LEN);
        let mut bytes = [0u8; MAX_CDB_LEN];
        bytes[..len].copy_from_slice(&cdb[..len]);

        Srb {
            command_code: CommandCode::ExecuteScsiCommand as u8,
            status: SrbStatus::Pending,
            adapter_id: 0,
            target_id: 0,
            lun: 0,
            flags: srb_flags,
            cdb: bytes,
            cdb_len: len as u8,
            data,
            sense: [0u8; SENSE_LEN],
            host_status: 0,
            target_status: 0,
            completion: None,
            adapter_inquiry: None,
            device_type: None,
        }
    }

    /// Replace the CDB with the raw 16-byte area and declared length of an ABI record
    pub fn with_raw_cdb(mut self, bytes: [u8; MAX_CDB_LEN], declared_len: u8) -> Self {
        self.cdb = bytes;
        self.cdb_len = declared_len;
        self
    }

    pub fn with_address(mut self, adapter_id: u8, target_id: u8, lun: u8) -> Self {
        self.adapter_id = adapter_id;
        self.target_id = target_id;
        self.lun = lun;
        self
    }

    pub fn with_completion(mut self, signal: &'a dyn CompletionSignal) -> Self {
        self.completion = Some(signal);
        self.flags |= flags::EVENT_NOTIFY;
        self
    }

    pub fn command(&self) -> Option<CommandCode> {
        CommandCode::from_u8(self.command_code)
    }

    pub fn status(&self) -> SrbStatus {
        self.status
    }

    /// The CDB bytes within the declared length
    pub fn cdb(&self) -> &[u8] {
        let len = (self.cdb_len as usize).min(MAX_CDB_LEN);
        &self.cdb[..len]
    }

    pub fn direction(&self) -> DataDirection {
        DataDirection::from_flags(self.flags)
    }

    /// Split borrows for a transfer: CDB, caller data buffer, sense area
    pub fn transfer_parts(&mut self) -> (&[u8], &mut [u8], &mut [u8]) {
        let len = (self.cdb_len as usize).min(MAX_CDB_LEN);
        (&self.cdb[..len], &mut *self.data, &mut self.sense[..])
    }

    /// Reset the status at the start of a submission
    pub(crate) fn mark_pending(&mut self) {
        self.status = SrbStatus::Pending;
    }

    /// Write the result fields, then raise the completion signal if requested
    ///
    /// The status is write-once per submission: a second call leaves the
    /// record untouched and returns the status already written.
    pub(crate) fn finalize(&mut self, outcome: ScsiOutcome) -> SrbStatus {
        if self.status.is_terminal() {
            log::warn!(
                "SRB already finalized with {:?}, ignoring {:?}",
                self.status,
                outcome.status
            );
            return self.status;
        }

        self.host_status = outcome.host_status;
        self.target_status = outcome.target_status;
        self.status = outcome.status;

        let posted = self.flags & flags::EVENT_NOTIFY != 0
            && self.command() == Some(CommandCode::ExecuteScsiCommand);
        if posted {
            if let Some(signal) = self.completion {
                signal.signal();
            }
        }

        self.status
    }

    /// Write only the status, leaving host and target status as the caller
    /// set them. Used for commands that never reach a device.
    pub(crate) fn finalize_status(&mut self, status: SrbStatus) -> SrbStatus {
        if self.status.is_terminal() {
            log::warn!(
                "SRB already finalized with {:?}, ignoring {:?}",
                self.status,
                status
            );
            return self.status;
        }
        self.status = status;
        self.status
    }
}

impl std::fmt::Debug for Srb<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Srb")
            .field("command_code", &self.command_code)
            .field("status", &self.status)
            .field("adapter_id", &self.adapter_id)
            .field("target_id", &self.target_id)
            .field("lun", &self.lun)
            .field("flags", &self.flags)
            .field("cdb", &hex::encode(self.cdb()))
            .field("data_len", &self.data.len())
            .field("host_status", &self.host_status)
            .field("target_status", &self.target_status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingSignal {
        count: Cell<u32>,
    }

    impl CompletionSignal for CountingSignal {
        fn signal(&self) {
            self.count.set(self.count.get() + 1);
        }
    }

    #[test]
    fn test_command_code_from_u8() {
        assert_eq!(CommandCode::from_u8(0x00), Some(CommandCode::AdapterInquiry));
        assert_eq!(CommandCode::from_u8(0x02), Some(CommandCode::ExecuteScsiCommand));
        assert_eq!(CommandCode::from_u8(0x08), Some(CommandCode::GetSetTimeouts));
        assert_eq!(CommandCode::from_u8(0x09), None);
    }

    #[test]
    fn test_status_terminal() {
        assert!(!SrbStatus::Pending.is_terminal());
        assert!(SrbStatus::Complete.is_terminal());
        assert!(SrbStatus::NoDevice.is_terminal());
        assert_eq!(SrbStatus::from_u8(0x82), Some(SrbStatus::NoDevice));
        assert_eq!(SrbStatus::from_u8(0x05), None);
    }

    #[test]
    fn test_direction_from_flags() {
        assert_eq!(DataDirection::from_flags(flags::DIR_IN), DataDirection::In);
        assert_eq!(DataDirection::from_flags(flags::DIR_OUT), DataDirection::Out);
        assert_eq!(DataDirection::from_flags(flags::EVENT_NOTIFY), DataDirection::None);
        assert_eq!(DataDirection::from_flags(0), DataDirection::None);
    }

    #[test]
    fn test_cdb_bounded_by_declared_length() {
        let mut raw = [0xAAu8; MAX_CDB_LEN];
        raw[..6].copy_from_slice(&[0x12, 0, 0, 0, 0x60, 0]);
        let srb = Srb::new(CommandCode::ExecuteScsiCommand as u8).with_raw_cdb(raw, 6);
        assert_eq!(srb.cdb(), &[0x12, 0, 0, 0, 0x60, 0]);

        // A bogus declared length never reads past the CDB area
        let srb = Srb::new(CommandCode::ExecuteScsiCommand as u8).with_raw_cdb(raw, 200);
        assert_eq!(srb.cdb().len(), MAX_CDB_LEN);
    }

    #[test]
    fn test_exec_truncates_long_cdb() {
        let long = [0x01u8; 20];
        let srb = Srb::exec(&long, 0, &mut []);
        assert_eq!(srb.cdb().len(), MAX_CDB_LEN);
    }

    #[test]
    fn test_finalize_is_write_once() {
        let mut srb = Srb::exec(&[0x00; 6], 0, &mut []);
        assert_eq!(srb.finalize(ScsiOutcome::target_error(0x02)), SrbStatus::Error);
        assert_eq!(srb.finalize(ScsiOutcome::complete()), SrbStatus::Error);
        assert_eq!(srb.status(), SrbStatus::Error);
        assert_eq!(srb.target_status, 0x02);
    }

    #[test]
    fn test_finalize_status_keeps_device_fields() {
        let mut srb = Srb::new(0x05);
        srb.host_status = 0x11;
        srb.target_status = 0x22;
        assert_eq!(srb.finalize_status(SrbStatus::Error), SrbStatus::Error);
        assert_eq!(srb.finalize_status(SrbStatus::Complete), SrbStatus::Error);
        assert_eq!(srb.host_status, 0x11);
        assert_eq!(srb.target_status, 0x22);
    }

    #[test]
    fn test_finalize_signals_once_when_posted() {
        let signal = CountingSignal { count: Cell::new(0) };
        let mut srb = Srb::exec(&[0x00; 6], 0, &mut []).with_completion(&signal);
        srb.finalize(ScsiOutcome::complete());
        srb.finalize(ScsiOutcome::complete());
        assert_eq!(signal.count.get(), 1);
    }

    #[test]
    fn test_finalize_without_notify_flag_does_not_signal() {
        let signal = CountingSignal { count: Cell::new(0) };
        let mut srb = Srb::exec(&[0x00; 6], 0, &mut []);
        srb.completion = Some(&signal);
        srb.finalize(ScsiOutcome::complete());
        assert_eq!(signal.count.get(), 0);
    }

    #[test]
    fn test_closure_signal() {
        let fired = Cell::new(0u32);
        let callback = || fired.set(fired.get() + 1);
        let mut srb = Srb::exec(&[0x00; 6], 0, &mut []).with_completion(&callback);
        srb.finalize(ScsiOutcome::no_device());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_completion_event() {
        let event = CompletionEvent::new();
        assert!(!event.is_set());
        assert!(!event.wait_timeout(Duration::from_millis(1)));
        event.signal();
        assert!(event.is_set());
        assert!(event.wait_timeout(Duration::from_millis(1)));
        event.reset();
        assert!(!event.is_set());
    }
}
