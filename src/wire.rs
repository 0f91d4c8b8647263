//! Framing for the socket executor protocol
//!
//! Every integer is little-endian and fixed width. CDB and data bytes are
//! raw.
//!
//! ```text
//! request:  u32 cdb_len | u8 direction | u32 transfer_len | CDB | [data]
//! response: u8 status   | u32 data_len | data
//! ```
//!
//! Data follows the request header only for `direction == out` with a
//! nonzero `transfer_len`, and is exactly `transfer_len` bytes.

use crate::error::{BridgeError, BridgeResult};
use crate::srb::{DataDirection, MAX_CDB_LEN};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Write};

/// Request header size in bytes
pub const REQUEST_HEADER_SIZE: usize = 9;

/// Response header size in bytes
pub const RESPONSE_HEADER_SIZE: usize = 5;

/// Largest transfer an executor accepts in one request
pub const MAX_TRANSFER_LEN: u32 = 16 * 1024 * 1024;

/// Direction byte values
pub mod direction {
    pub const NONE: u8 = 0;
    pub const IN: u8 = 1;
    pub const OUT: u8 = 2;
}

/// Response status bytes (same values as the SRB status codes)
pub mod status {
    pub const COMPLETE: u8 = 0x01;
    pub const ERROR: u8 = 0x04;
}

pub fn direction_to_wire(dir: DataDirection) -> u8 {
    match dir {
        DataDirection::None => direction::NONE,
        DataDirection::In => direction::IN,
        DataDirection::Out => direction::OUT,
    }
}

pub fn direction_from_wire(val: u8) -> Option<DataDirection> {
    match val {
        direction::NONE => Some(DataDirection::None),
        direction::IN => Some(DataDirection::In),
        direction::OUT => Some(DataDirection::Out),
        _ => None,
    }
}

/// Fixed part of a request frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub cdb_len: u32,
    pub direction: DataDirection,
    pub transfer_len: u32,
}

impl RequestHeader {
    pub fn to_bytes(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut buf = [0u8; REQUEST_HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.cdb_len);
        buf[4] = direction_to_wire(self.direction);
        LittleEndian::write_u32(&mut buf[5..9], self.transfer_len);
        buf
    }

    pub fn from_bytes(buf: &[u8; REQUEST_HEADER_SIZE]) -> BridgeResult<Self> {
        let mut cursor = Cursor::new(&buf[..]);
        let cdb_len = cursor.read_u32::<LittleEndian>()?;
        let dir_byte = cursor.read_u8()?;
        let transfer_len = cursor.read_u32::<LittleEndian>()?;

        let direction = direction_from_wire(dir_byte).ok_or_else(|| {
            BridgeError::Protocol(format!("Invalid direction byte: 0x{:02x}", dir_byte))
        })?;

        Ok(RequestHeader {
            cdb_len,
            direction,
            transfer_len,
        })
    }

    /// True when the request frame carries a data-out payload
    pub fn has_payload(&self) -> bool {
        self.direction == DataDirection::Out && self.transfer_len > 0
    }
}

/// Fixed part of a response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: u8,
    pub data_len: u32,
}

impl ResponseHeader {
    pub fn to_bytes(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut buf = [0u8; RESPONSE_HEADER_SIZE];
        buf[0] = self.status;
        LittleEndian::write_u32(&mut buf[1..5], self.data_len);
        buf
    }

    pub fn from_bytes(buf: &[u8; RESPONSE_HEADER_SIZE]) -> Self {
        ResponseHeader {
            status: buf[0],
            data_len: LittleEndian::read_u32(&buf[1..5]),
        }
    }
}

/// A decoded request frame, as seen by an executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub cdb: Vec<u8>,
    pub direction: DataDirection,
    pub transfer_len: u32,
    /// Data-out payload, empty unless `direction == Out`
    pub data: Vec<u8>,
}

/// A response frame produced by an executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResponse {
    pub status: u8,
    pub data: Vec<u8>,
}

impl ExecResponse {
    pub fn complete(data: Vec<u8>) -> Self {
        ExecResponse {
            status: status::COMPLETE,
            data,
        }
    }

    pub fn error() -> Self {
        ExecResponse {
            status: status::ERROR,
            data: Vec::new(),
        }
    }
}

/// Write one request frame. `data` must be the caller buffer for data-out.
pub fn write_request<W: Write>(
    w: &mut W,
    cdb: &[u8],
    dir: DataDirection,
    data: &[u8],
) -> BridgeResult<()> {
    let header = RequestHeader {
        cdb_len: cdb.len() as u32,
        direction: dir,
        transfer_len: data.len() as u32,
    };
    w.write_all(&header.to_bytes())?;
    w.write_all(cdb)?;
    if header.has_payload() {
        w.write_all(data)?;
    }
    w.flush()?;
    Ok(())
}

/// Read one request frame
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// frames. A close anywhere inside a frame is an error.
pub fn read_request<R: Read>(r: &mut R) -> BridgeResult<Option<ExecRequest>> {
    let mut header_buf = [0u8; REQUEST_HEADER_SIZE];
    if !read_frame_start(r, &mut header_buf)? {
        return Ok(None);
    }
    let header = RequestHeader::from_bytes(&header_buf)?;

    if header.cdb_len == 0 || header.cdb_len as usize > MAX_CDB_LEN {
        return Err(BridgeError::Protocol(format!(
            "CDB length {} out of range (1..={})",
            header.cdb_len, MAX_CDB_LEN
        )));
    }
    if header.transfer_len > MAX_TRANSFER_LEN {
        return Err(BridgeError::Protocol(format!(
            "Transfer length {} exceeds {}",
            header.transfer_len, MAX_TRANSFER_LEN
        )));
    }

    let mut cdb = vec![0u8; header.cdb_len as usize];
    r.read_exact(&mut cdb)?;

    let mut data = Vec::new();
    if header.has_payload() {
        data = vec![0u8; header.transfer_len as usize];
        r.read_exact(&mut data)?;
    }

    Ok(Some(ExecRequest {
        cdb,
        direction: header.direction,
        transfer_len: header.transfer_len,
        data,
    }))
}

/// Write one response frame
pub fn write_response<W: Write>(w: &mut W, response: &ExecResponse) -> BridgeResult<()> {
    let header = ResponseHeader {
        status: response.status,
        data_len: response.data.len() as u32,
    };
    w.write_all(&header.to_bytes())?;
    w.write_all(&response.data)?;
    w.flush()?;
    Ok(())
}

/// Fill `buf` completely, distinguishing a clean close before the first byte
fn read_frame_start<R: Read>(r: &mut R, buf: &mut [u8]) -> BridgeResult<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(BridgeError::Protocol(format!(
                    "Connection closed after {} of {} header bytes",
                    filled,
                    buf.len()
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BridgeError::Io(e)),
        }
    }
    Ok(true)
}
