//! In-memory JEOL SEM
//!
//! A [`CommandExecutor`] that answers the microscope's vendor command set
//! from a small state model, so the bridge and its clients can be exercised
//! without hardware. It identifies as `JEOL` / `SEM` to INQUIRY, reports
//! readings as four-byte little-endian words, and applies the control
//! commands to its state. Changes to accelerating voltage, magnification
//! and scanning are published to subscribers as [`SemEvent`]s.

use crate::server::CommandExecutor;
use crate::wire::{ExecRequest, ExecResponse};
use std::sync::mpsc::{self, Receiver, Sender};

/// Opcodes of the microscope command set
pub mod opcode {
    pub const SCAN: u8 = 0x00;
    pub const VACUUM_CONTROL: u8 = 0x01;
    pub const GUN_CONTROL: u8 = 0x02;
    pub const LENS_CONTROL: u8 = 0x03;
    pub const VIDEO: u8 = 0x04;
    pub const INQUIRY: u8 = 0x12;
    pub const VACUUM_STATUS: u8 = 0xC4;
    pub const PRESSURE: u8 = 0xC5;
    pub const GUN_STATUS: u8 = 0xC6;
    pub const IDENTIFICATION: u8 = 0xCC;
}

/// Vacuum status values
pub mod vacuum {
    pub const OFF: u16 = 0;
    pub const READY: u16 = 3;
}

/// Microscope state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemState {
    pub ht_status: u16,
    /// Accelerating voltage, volts
    pub accv: u16,
    pub filament: u16,
    pub vacuum_status: u16,
    /// 0 high vacuum, 1 low vacuum
    pub vacuum_mode: u16,
    pub mag_index: u16,
    pub stage_x: i32,
    pub stage_y: i32,
    pub stage_z: i32,
    pub stage_r: i32,
    pub stage_t: i32,
    pub scan_speed: u16,
    pub scanning: bool,
    pub beam_current: u16,
    pub emission_current: u16,
    pub hardware_id: u16,
}

impl Default for SemState {
    fn default() -> Self {
        SemState {
            ht_status: 0,
            accv: 15000,
            filament: 0,
            vacuum_status: vacuum::READY,
            vacuum_mode: 0,
            mag_index: 100,
            stage_x: 0,
            stage_y: 0,
            stage_z: 10000,
            stage_r: 0,
            stage_t: 0,
            scan_speed: 1,
            scanning: false,
            beam_current: 100,
            emission_current: 50,
            hardware_id: 0x170C,
        }
    }
}

/// State change published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemEvent {
    Accv(u16),
    Mag(u16),
    ScanSpeed(u16),
    ScanStatus(bool),
}

/// The in-memory microscope
#[derive(Default)]
pub struct VirtualSem {
    state: SemState,
    subscribers: Vec<Sender<SemEvent>>,
}

impl VirtualSem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SemState) -> Self {
        VirtualSem {
            state,
            subscribers: Vec::new(),
        }
    }

    pub fn state(&self) -> &SemState {
        &self.state
    }

    /// Receive every state change from now on
    pub fn subscribe(&mut self) -> Receiver<SemEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    fn publish(&mut self, event: SemEvent) {
        log::debug!("Publishing {:?}", event);
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }

    fn inquiry(&self, transfer_len: u32) -> Vec<u8> {
        let mut data = vec![0u8; 36];
        data[0] = 0x03;
        data[4] = 31;
        data[8..16].copy_from_slice(b"JEOL    ");
        data[16..32].copy_from_slice(b"SEM             ");
        data[32..36].copy_from_slice(b"1.0 ");
        data.truncate(transfer_len as usize);
        data
    }

    fn vacuum_control(&mut self, cdb: &[u8]) {
        let addressed =
            at(cdb, 1) == Some(0x01) && at(cdb, 4) == Some(0x06) && at(cdb, 5) == Some(0x40);
        if !addressed {
            return;
        }
        let Some(value) = at(cdb, 9) else {
            return;
        };
        match at(cdb, 6) {
            Some(0x44) => {
                self.state.vacuum_mode = u16::from(value);
                log::info!("SetVacuumMode -> {}", value);
            }
            Some(0x38) if value == 1 => {
                self.state.vacuum_status = vacuum::READY;
                log::info!("Evacuate");
            }
            Some(0x38) => {
                self.state.vacuum_status = vacuum::OFF;
                log::info!("Vent");
            }
            _ => {}
        }
    }

    fn gun_control(&mut self, cdb: &[u8]) {
        if at(cdb, 1) != Some(0x01) {
            return;
        }
        match at(cdb, 4) {
            Some(0x07) => {
                if let Some(state) = at(cdb, 9) {
                    self.state.ht_status = u16::from(state);
                    log::info!("SetHT -> {}", state);
                }
            }
            Some(0x08) => {
                let Some(value) = word_le(cdb, 9) else {
                    return;
                };
                match at(cdb, 8) {
                    Some(0x00) => {
                        self.state.accv = value;
                        log::info!("SetAccv -> {}", value);
                        self.publish(SemEvent::Accv(value));
                    }
                    Some(0x14) => {
                        self.state.filament = value;
                        log::info!("SetFilament -> {}", value);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn lens_control(&mut self, cdb: &[u8]) {
        if at(cdb, 1) == Some(0x01) && at(cdb, 8) == Some(0x10) {
            if let Some(mag) = word_le(cdb, 9) {
                self.state.mag_index = mag;
                log::info!("SetMag -> {}", mag);
                self.publish(SemEvent::Mag(mag));
            }
        }
    }

    fn scan_control(&mut self, cdb: &[u8]) {
        if at(cdb, 1) == Some(0x01) && at(cdb, 4) == Some(0x00) {
            if let Some(speed) = word_be(cdb, 6) {
                self.state.scan_speed = speed;
                log::info!("SetScanSpeed -> {}", speed);
                self.publish(SemEvent::ScanSpeed(speed));
            }
        } else if at(cdb, 4) == Some(0x09) {
            let start = at(cdb, 5).unwrap_or(0) != 0;
            self.state.scanning = start;
            log::info!("Scan {}", if start { "start" } else { "stop" });
            self.publish(SemEvent::ScanStatus(start));
        }
    }
}

impl CommandExecutor for VirtualSem {
    fn execute(&mut self, request: &ExecRequest) -> ExecResponse {
        let cdb = request.cdb.as_slice();
        let Some(&op) = cdb.first() else {
            return ExecResponse::error();
        };
        let sub = at(cdb, 1);

        let data = match op {
            opcode::INQUIRY => self.inquiry(request.transfer_len),
            opcode::IDENTIFICATION => match sub {
                Some(0x81) => reading(self.state.hardware_id),
                _ => Vec::new(),
            },
            opcode::VACUUM_STATUS => match sub {
                Some(0x01) => reading(self.state.vacuum_status),
                Some(0x00) => reading(self.state.vacuum_mode),
                _ => Vec::new(),
            },
            opcode::GUN_STATUS => match sub {
                Some(0x10) => reading(self.state.ht_status),
                Some(0x11) => reading(self.state.accv),
                Some(0x12) => reading(self.state.filament),
                _ => Vec::new(),
            },
            opcode::PRESSURE => match sub {
                // Valve position: open
                Some(0x09) => reading(1),
                _ => Vec::new(),
            },
            opcode::VACUUM_CONTROL => {
                self.vacuum_control(cdb);
                Vec::new()
            }
            opcode::GUN_CONTROL => {
                self.gun_control(cdb);
                Vec::new()
            }
            opcode::LENS_CONTROL => {
                self.lens_control(cdb);
                Vec::new()
            }
            opcode::SCAN => {
                self.scan_control(cdb);
                Vec::new()
            }
            opcode::VIDEO => {
                if at(cdb, 4) == Some(0x1E) && at(cdb, 5) == Some(0x07) {
                    log::info!("RequestVideo");
                }
                Vec::new()
            }
            // Unknown status reads answer zero
            op if (op & 0xF0) == 0xC0 => {
                log::debug!("Unknown read {}", hex::encode(cdb));
                vec![0u8; 4]
            }
            _ => {
                log::debug!("Unknown write {}", hex::encode(cdb));
                Vec::new()
            }
        };

        ExecResponse::complete(data)
    }
}

fn at(cdb: &[u8], offset: usize) -> Option<u8> {
    cdb.get(offset).copied()
}

fn word_le(cdb: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes([at(cdb, offset)?, at(cdb, offset + 1)?]))
}

fn word_be(cdb: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([at(cdb, offset)?, at(cdb, offset + 1)?]))
}

/// Four-byte reading: little-endian word, two bytes padding
fn reading(value: u16) -> Vec<u8> {
    let [lo, hi] = value.to_le_bytes();
    vec![lo, hi, 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srb::DataDirection;
    use crate::wire::status;

    fn exec(sem: &mut VirtualSem, cdb: &[u8]) -> ExecResponse {
        let request = ExecRequest {
            cdb: cdb.to_vec(),
            direction: DataDirection::In,
            transfer_len: 96,
            data: Vec::new(),
        };
        sem.execute(&request)
    }

    fn read_word(sem: &mut VirtualSem, cdb: &[u8]) -> u16 {
        let response = exec(sem, cdb);
        assert_eq!(response.status, status::COMPLETE);
        assert_eq!(response.data.len(), 4);
        assert_eq!(&response.data[2..], &[0, 0]);
        u16::from_le_bytes([response.data[0], response.data[1]])
    }

    #[test]
    fn test_inquiry_identifies_jeol_sem() {
        let mut sem = VirtualSem::new();
        let response = exec(&mut sem, &[0x12, 0, 0, 0, 96, 0]);
        assert_eq!(response.status, status::COMPLETE);
        assert_eq!(response.data.len(), 36);
        assert_eq!(response.data[0], 0x03);
        assert_eq!(response.data[4], 31);
        assert_eq!(&response.data[8..16], b"JEOL    ");
        assert_eq!(&response.data[16..32], b"SEM             ");
        assert_eq!(&response.data[32..36], b"1.0 ");
    }

    #[test]
    fn test_inquiry_truncated_to_transfer_length() {
        let mut sem = VirtualSem::new();
        let request = ExecRequest {
            cdb: vec![0x12, 0, 0, 0, 12, 0],
            direction: DataDirection::In,
            transfer_len: 12,
            data: Vec::new(),
        };
        let response = sem.execute(&request);
        assert_eq!(response.data.len(), 12);
        assert_eq!(&response.data[8..12], b"JEOL");
    }

    #[test]
    fn test_hardware_id() {
        let mut sem = VirtualSem::new();
        assert_eq!(read_word(&mut sem, &[0xCC, 0x81, 0, 4, 0, 0]), 0x170C);
        assert!(exec(&mut sem, &[0xCC, 0x80, 0, 4, 0, 0]).data.is_empty());
    }

    #[test]
    fn test_vacuum_readings() {
        let mut sem = VirtualSem::new();
        assert_eq!(read_word(&mut sem, &[0xC4, 0x01, 0, 0, 0, 0]), vacuum::READY);
        assert_eq!(read_word(&mut sem, &[0xC4, 0x00, 0, 0, 0, 0]), 0);
    }

    #[test]
    fn test_gun_readings() {
        let mut sem = VirtualSem::new();
        assert_eq!(read_word(&mut sem, &[0xC6, 0x10, 0, 0, 0, 0]), 0);
        assert_eq!(read_word(&mut sem, &[0xC6, 0x11, 0, 0, 0, 0]), 15000);
        assert_eq!(read_word(&mut sem, &[0xC6, 0x12, 0, 0, 0, 0]), 0);
    }

    #[test]
    fn test_valve_position() {
        let mut sem = VirtualSem::new();
        assert_eq!(read_word(&mut sem, &[0xC5, 0x09, 0, 0, 0, 0]), 1);
    }

    #[test]
    fn test_set_vacuum_mode() {
        let mut sem = VirtualSem::new();
        let response = exec(&mut sem, &[0x01, 0x01, 0, 0, 0x06, 0x40, 0x44, 0x01, 0, 0x01]);
        assert_eq!(response, ExecResponse::complete(Vec::new()));
        assert_eq!(sem.state().vacuum_mode, 1);
        assert_eq!(read_word(&mut sem, &[0xC4, 0x00, 0, 0, 0, 0]), 1);
    }

    #[test]
    fn test_vent_then_evacuate() {
        let mut sem = VirtualSem::new();
        exec(&mut sem, &[0x01, 0x01, 0, 0, 0x06, 0x40, 0x38, 0x00, 0x01, 0x00]);
        assert_eq!(sem.state().vacuum_status, vacuum::OFF);

        exec(&mut sem, &[0x01, 0x01, 0, 0, 0x06, 0x40, 0x38, 0x00, 0x01, 0x01]);
        assert_eq!(sem.state().vacuum_status, vacuum::READY);
    }

    #[test]
    fn test_vacuum_control_ignores_short_cdb() {
        let mut sem = VirtualSem::new();
        let response = exec(&mut sem, &[0x01, 0x01, 0, 0, 0x06, 0x40, 0x38]);
        assert_eq!(response.status, status::COMPLETE);
        assert_eq!(sem.state(), &SemState::default());
    }

    #[test]
    fn test_set_ht() {
        let mut sem = VirtualSem::new();
        exec(&mut sem, &[0x02, 0x01, 0, 0, 0x07, 0x40, 0x02, 0x00, 0x02, 0x01]);
        assert_eq!(sem.state().ht_status, 1);
        assert_eq!(read_word(&mut sem, &[0xC6, 0x10, 0, 0, 0, 0]), 1);
    }

    #[test]
    fn test_set_accv_publishes() {
        let mut sem = VirtualSem::new();
        let events = sem.subscribe();
        let [lo, hi] = 20000u16.to_le_bytes();
        exec(&mut sem, &[0x02, 0x01, 0, 0, 0x08, 0x40, 0x02, 0x01, 0x00, lo, hi, 0]);
        assert_eq!(sem.state().accv, 20000);
        assert_eq!(events.try_recv(), Ok(SemEvent::Accv(20000)));
        assert_eq!(read_word(&mut sem, &[0xC6, 0x11, 0, 0, 0, 0]), 20000);
    }

    #[test]
    fn test_set_filament_is_silent() {
        let mut sem = VirtualSem::new();
        let events = sem.subscribe();
        exec(&mut sem, &[0x02, 0x01, 0, 0, 0x08, 0x40, 0x02, 0x01, 0x14, 0x2C, 0x01, 0]);
        assert_eq!(sem.state().filament, 300);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_set_magnification() {
        let mut sem = VirtualSem::new();
        let events = sem.subscribe();
        exec(&mut sem, &[0x03, 0x01, 0, 0, 0x08, 0, 0, 0, 0x10, 0xF4, 0x01]);
        assert_eq!(sem.state().mag_index, 500);
        assert_eq!(events.try_recv(), Ok(SemEvent::Mag(500)));
    }

    #[test]
    fn test_scan_speed_is_big_endian() {
        let mut sem = VirtualSem::new();
        let events = sem.subscribe();
        exec(&mut sem, &[0x00, 0x01, 0, 0x04, 0x00, 0x00, 0x01, 0x02]);
        assert_eq!(sem.state().scan_speed, 0x0102);
        assert_eq!(events.try_recv(), Ok(SemEvent::ScanSpeed(0x0102)));
    }

    #[test]
    fn test_scan_start_stop() {
        let mut sem = VirtualSem::new();
        let events = sem.subscribe();
        exec(&mut sem, &[0x00, 0x00, 0, 0, 0x09, 0x01]);
        assert!(sem.state().scanning);
        exec(&mut sem, &[0x00, 0x00, 0, 0, 0x09, 0x00]);
        assert!(!sem.state().scanning);
        let seen: Vec<_> = events.try_iter().collect();
        assert_eq!(seen, vec![SemEvent::ScanStatus(true), SemEvent::ScanStatus(false)]);
    }

    #[test]
    fn test_request_video_acknowledged() {
        let mut sem = VirtualSem::new();
        let response = exec(&mut sem, &[0x04, 0, 0, 0, 0x1E, 0x07]);
        assert_eq!(response, ExecResponse::complete(Vec::new()));
    }

    #[test]
    fn test_unknown_opcodes() {
        let mut sem = VirtualSem::new();
        assert_eq!(exec(&mut sem, &[0xC9, 0, 0, 0, 0, 0]), ExecResponse::complete(vec![0; 4]));
        assert_eq!(exec(&mut sem, &[0x5A, 0, 0, 0, 0, 0]), ExecResponse::complete(Vec::new()));
        assert_eq!(exec(&mut sem, &[]), ExecResponse::error());
    }

    #[test]
    fn test_dropped_subscriber_is_forgotten() {
        let mut sem = VirtualSem::new();
        drop(sem.subscribe());
        let [lo, hi] = 9000u16.to_le_bytes();
        exec(&mut sem, &[0x02, 0x01, 0, 0, 0x08, 0x40, 0x02, 0x01, 0x00, lo, hi, 0]);
        assert!(sem.subscribers.is_empty());
    }
}
