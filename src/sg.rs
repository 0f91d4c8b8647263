//! Linux generic-SCSI (`/dev/sgN`) access through the `SG_IO` ioctl
//!
//! Layout and constants follow `<scsi/sg.h>`.

use crate::discovery::DeviceOpener;
use crate::passthrough::{PassthroughCommand, PassthroughResult, ScsiPassthrough};
use crate::srb::DataDirection;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// `SG_IO` ioctl request number
pub const SG_IO: u32 = 0x2285;

pub const SG_DXFER_NONE: libc::c_int = -1;
pub const SG_DXFER_TO_DEV: libc::c_int = -2;
pub const SG_DXFER_FROM_DEV: libc::c_int = -3;

/// `sg_io_hdr_t`
#[repr(C)]
#[derive(Debug)]
struct SgIoHdr {
    interface_id: libc::c_int,
    dxfer_direction: libc::c_int,
    cmd_len: libc::c_uchar,
    mx_sb_len: libc::c_uchar,
    iovec_count: libc::c_ushort,
    dxfer_len: libc::c_uint,
    dxferp: *mut libc::c_void,
    cmdp: *const libc::c_uchar,
    sbp: *mut libc::c_uchar,
    timeout: libc::c_uint,
    flags: libc::c_uint,
    pack_id: libc::c_int,
    usr_ptr: *mut libc::c_void,
    status: libc::c_uchar,
    masked_status: libc::c_uchar,
    msg_status: libc::c_uchar,
    sb_len_wr: libc::c_uchar,
    host_status: libc::c_ushort,
    driver_status: libc::c_ushort,
    resid: libc::c_int,
    duration: libc::c_uint,
    info: libc::c_uint,
}

impl SgIoHdr {
    fn zeroed() -> Self {
        SgIoHdr {
            interface_id: b'S' as libc::c_int,
            dxfer_direction: SG_DXFER_NONE,
            cmd_len: 0,
            mx_sb_len: 0,
            iovec_count: 0,
            dxfer_len: 0,
            dxferp: std::ptr::null_mut(),
            cmdp: std::ptr::null(),
            sbp: std::ptr::null_mut(),
            timeout: 0,
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        }
    }
}

/// An open generic-SCSI device node
#[derive(Debug)]
pub struct SgDevice {
    file: File,
    path: PathBuf,
}

impl SgDevice {
    /// Open read/write, blocking
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::open_with(path.as_ref(), 0)
    }

    /// Open read/write with `O_NONBLOCK`, so a busy node fails instead of waiting
    pub fn open_nonblocking<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::open_with(path.as_ref(), libc::O_NONBLOCK)
    }

    fn open_with(path: &Path, custom_flags: libc::c_int) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(custom_flags)
            .open(path)?;
        Ok(SgDevice {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScsiPassthrough for SgDevice {
    fn execute(&mut self, cmd: &mut PassthroughCommand<'_>) -> io::Result<PassthroughResult> {
        let cmd_len = u8::try_from(cmd.cdb.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "CDB too long"))?;
        let dxfer_len = u32::try_from(cmd.data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "transfer too long"))?;
        let timeout_ms = u32::try_from(cmd.timeout.as_millis()).unwrap_or(u32::MAX);

        let mut hdr = SgIoHdr::zeroed();
        hdr.cmd_len = cmd_len;
        hdr.cmdp = cmd.cdb.as_ptr();
        hdr.mx_sb_len = cmd.sense.len().min(u8::MAX as usize) as u8;
        hdr.sbp = cmd.sense.as_mut_ptr();
        hdr.timeout = timeout_ms;

        hdr.dxfer_direction = match cmd.direction {
            DataDirection::None => SG_DXFER_NONE,
            DataDirection::In => SG_DXFER_FROM_DEV,
            DataDirection::Out => SG_DXFER_TO_DEV,
        };
        if cmd.direction != DataDirection::None && dxfer_len > 0 {
            hdr.dxfer_len = dxfer_len;
            hdr.dxferp = cmd.data.as_mut_ptr().cast();
        }

        // SAFETY: hdr points at the CDB, data and sense slices borrowed by
        // `cmd` for the whole call, and their lengths bound what the kernel
        // reads and writes. SG_IO is synchronous, so nothing outlives the call.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), SG_IO as _, &mut hdr as *mut SgIoHdr) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(PassthroughResult {
            status: hdr.status,
            host_status: hdr.host_status,
            driver_status: hdr.driver_status,
            sense_len: hdr.sb_len_wr,
            resid: hdr.resid,
        })
    }
}

/// Opens `/dev/sgN` nodes for discovery
#[derive(Debug, Clone, Copy, Default)]
pub struct SgOpener;

impl DeviceOpener for SgOpener {
    type Device = SgDevice;

    fn open_candidate(&self, path: &Path) -> io::Result<SgDevice> {
        SgDevice::open_nonblocking(path)
    }

    fn open_override(&self, path: &Path) -> io::Result<SgDevice> {
        SgDevice::open(path)
    }
}
