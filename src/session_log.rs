//! Per-client transaction log
//!
//! The executor server can keep one log file per client connection,
//! `sem_session_YYYYMMDD_HHMMSS.log`, with a line for every command as it
//! arrives and another for its response:
//!
//! ```text
//! 2024-05-01 12:00:00.123 [INFO] [EVT] Client Connected: 127.0.0.1:50512
//! 2024-05-01 12:00:00.124 [INFO] [CMD] GetVacuumStatus      | CDB: C4 01 00 00 00 00    | DATA: [Empty] -> Status=0
//! 2024-05-01 12:00:00.125 [INFO] [RES] GetVacuumStatus      | CDB: C4 01 00 00 00 00    | DATA: 03 00 00 00 -> Status=1
//! ```
//!
//! Timestamps are UTC. Write failures are reported through `log` once and
//! never interrupt the connection.

use crate::decoder::{LogLevel, OpcodeDecoder, Phase};
use crate::error::BridgeResult;
use crate::wire::{self, ExecRequest, ExecResponse};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes of data shown per line
const DATA_PREVIEW: usize = 16;

/// Transaction log for one client session
pub struct SessionLog<W: Write> {
    out: W,
    decoder: Arc<OpcodeDecoder>,
    path: Option<PathBuf>,
    failed: bool,
}

impl SessionLog<File> {
    /// Create a new log file under `dir`, creating the directory if needed
    pub fn create(dir: &Path, decoder: Arc<OpcodeDecoder>) -> BridgeResult<Self> {
        std::fs::create_dir_all(dir)?;
        let stamp = file_stamp(SystemTime::now());

        let mut suffix = 0u32;
        loop {
            let name = if suffix == 0 {
                format!("sem_session_{}.log", stamp)
            } else {
                format!("sem_session_{}_{}.log", stamp, suffix)
            };
            let path = dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    log::info!("Session log: {}", path.display());
                    let mut session = SessionLog::new(file, decoder);
                    session.path = Some(path);
                    return Ok(session);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<W: Write> SessionLog<W> {
    /// Start a session on any writer; writes the opening event
    pub fn new(out: W, decoder: Arc<OpcodeDecoder>) -> Self {
        let mut session = SessionLog {
            out,
            decoder,
            path: None,
            failed: false,
        };
        session.event(LogLevel::Info, "Session Started");
        session
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn event(&mut self, level: LogLevel, msg: &str) {
        let line = format!("{} [{}] [EVT] {}\n", timestamp(SystemTime::now()), level, msg);
        self.write_line(&line);
    }

    /// Record a request before it runs
    pub fn command(&mut self, request: &ExecRequest) {
        let decoded = self
            .decoder
            .decode(&request.cdb, Some(request.data.as_slice()), Phase::Command);
        self.transaction(Phase::Command, &decoded.name, decoded.level, &request.cdb, &request.data, 0);
    }

    /// Record the response sent for `request`
    pub fn response(&mut self, request: &ExecRequest, response: &ExecResponse) {
        let decoded = self
            .decoder
            .decode(&request.cdb, Some(response.data.as_slice()), Phase::Response);
        self.transaction(
            Phase::Response,
            &decoded.name,
            decoded.level,
            &request.cdb,
            &response.data,
            response.status,
        );
    }

    /// Write the closing event and return the writer
    pub fn close(mut self) -> W {
        self.event(LogLevel::Info, "Session Ended");
        if let Err(e) = self.out.flush() {
            log::warn!("Session log flush failed: {}", e);
        }
        self.out
    }

    fn transaction(
        &mut self,
        phase: Phase,
        name: &str,
        level: LogLevel,
        cdb: &[u8],
        data: &[u8],
        status: u8,
    ) {
        let level = match status {
            0 | wire::status::COMPLETE => level,
            wire::status::ERROR => LogLevel::Err,
            _ => LogLevel::Warn,
        };
        let line = format!(
            "{} [{}] [{}] {:<20} | CDB: {:<20} | DATA: {} -> Status={}\n",
            timestamp(SystemTime::now()),
            level,
            phase.tag(),
            name,
            hex_bytes(cdb),
            data_preview(data),
            status
        );
        self.write_line(&line);
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = self.out.write_all(line.as_bytes()).and_then(|_| self.out.flush()) {
            if !self.failed {
                log::warn!("Session log write failed: {}", e);
                self.failed = true;
            }
        }
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn data_preview(data: &[u8]) -> String {
    if data.is_empty() {
        return "[Empty]".to_string();
    }
    let mut out = hex_bytes(&data[..data.len().min(DATA_PREVIEW)]);
    if data.len() > DATA_PREVIEW {
        out.push_str(" ...");
    }
    out
}

/// UTC `(year, month, day, hour, minute, second, millisecond)`
fn utc_fields(time: SystemTime) -> (i64, u32, u32, u32, u32, u32, u32) {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since.as_secs() as i64;
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400) as u32;

    // Days-to-civil conversion over 400-year eras
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };

    (
        year,
        month,
        day,
        rem / 3600,
        rem % 3600 / 60,
        rem % 60,
        since.subsec_millis(),
    )
}

fn timestamp(time: SystemTime) -> String {
    let (y, mo, d, h, mi, s, ms) = utc_fields(time);
    format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}", y, mo, d, h, mi, s, ms)
}

fn file_stamp(time: SystemTime) -> String {
    let (y, mo, d, h, mi, s, _) = utc_fields(time);
    format!("{:04}{:02}{:02}_{:02}{:02}{:02}", y, mo, d, h, mi, s)
}
