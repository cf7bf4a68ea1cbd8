//! Ioctl transport to the memdev mailbox character device.
//!
//! The kernel relays mailbox commands through two ioctls on
//! `/dev/cxl/<memdev>`: a support-table query and a single-shot send. This
//! module owns the raw `#[repr(C)]` views of those ioctls and the device
//! node validation; everything above it speaks [`QueryResult`] and
//! [`SendCommand`].

use std::os::fd::AsRawFd;
use std::path::PathBuf;

use rustix::fs::{major, minor, Mode, OFlags};
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// Ioctl encoding (asm-generic _IOC)
// ============================================================================

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, ty: u64, nr: u64, size: u64) -> u64 {
    (dir << 30) | (size << 16) | (ty << 8) | nr
}

const CXL_MEM_IOC_TYPE: u64 = 0xCE;

/// `_IOR(0xCE, 1, struct cxl_mem_query_commands)`; the sizeof covers only
/// the 8-byte header, the flexible entry array follows it.
pub const CXL_MEM_QUERY_COMMANDS: u64 = ioc(
    IOC_READ,
    CXL_MEM_IOC_TYPE,
    1,
    std::mem::size_of::<RawQueryHeader>() as u64,
);

/// `_IOWR(0xCE, 2, struct cxl_send_command)`.
pub const CXL_MEM_SEND_COMMAND: u64 = ioc(
    IOC_READ | IOC_WRITE,
    CXL_MEM_IOC_TYPE,
    2,
    std::mem::size_of::<RawSendCommand>() as u64,
);

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RawQueryHeader {
    n_commands: u32,
    rsvd: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RawCommandInfo {
    id: u32,
    flags: u32,
    size_in: i32,
    size_out: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct RawSendCommand {
    id: u32,
    flags: u32,
    opcode: u16,
    op_rsvd: u16,
    retval: u32,
    in_size: i32,
    in_rsvd: u32,
    in_payload: u64,
    out_size: i32,
    out_rsvd: u32,
    out_payload: u64,
}

// ============================================================================
// Transport-facing types
// ============================================================================

/// One row of the kernel's command support table.
#[derive(Debug, Clone, Copy)]
pub struct CommandInfo {
    pub id: u32,
    pub flags: u32,
    /// Declared input payload size; negative means variable.
    pub size_in: i32,
    /// Declared output payload size; negative means variable.
    pub size_out: i32,
}

/// The full support table returned by the query ioctl.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub commands: Vec<CommandInfo>,
}

impl QueryResult {
    /// Row for a command id, if the device supports it.
    pub fn find(&self, id: u32) -> Option<CommandInfo> {
        self.commands.iter().copied().find(|c| c.id == id)
    }
}

/// One mailbox submission. `out_payload` is sized by the caller and
/// truncated by the transport to what the kernel actually wrote.
#[derive(Debug)]
pub struct SendCommand {
    pub id: u32,
    pub flags: u32,
    /// Vendor opcode, only meaningful for the raw passthrough command.
    pub raw_opcode: u16,
    pub in_payload: Vec<u8>,
    pub out_payload: Vec<u8>,
}

/// Identity of the device node a command targets. The char-dev numbers
/// come from the sysfs `dev` attribute and are revalidated against the
/// opened node on every transport call.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub devname: String,
    pub major: u32,
    pub minor: u32,
    pub payload_max: usize,
}

/// The mailbox side of the library, behind a trait so tests can script
/// responses without a device.
pub trait MboxTransport: Send + Sync {
    /// Two-phase support-table query.
    fn query(&self, dev: &DeviceHandle) -> Result<QueryResult>;

    /// Submit one command. Returns the device's status code (0 means
    /// success); transport failures are `Err`.
    fn send(&self, dev: &DeviceHandle, cmd: &mut SendCommand) -> Result<u32>;
}

// ============================================================================
// Live char-dev implementation
// ============================================================================

/// [`MboxTransport`] over the real `/dev/cxl` character devices.
pub struct CharDevMailbox {
    dev_dir: PathBuf,
}

impl CharDevMailbox {
    pub fn new() -> Self {
        CharDevMailbox { dev_dir: PathBuf::from("/dev/cxl") }
    }

    /// Open the device node and verify it is the char dev sysfs claims,
    /// guarding against a stale or re-used `/dev` entry.
    fn open_validated(&self, dev: &DeviceHandle) -> Result<rustix::fd::OwnedFd> {
        let path = self.dev_dir.join(&dev.devname);
        let fd = rustix::fs::open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;
        let stat = rustix::fs::fstat(&fd)?;
        let is_chardev = rustix::fs::FileType::from_raw_mode(stat.st_mode)
            == rustix::fs::FileType::CharacterDevice;
        if !is_chardev
            || major(stat.st_rdev) != dev.major
            || minor(stat.st_rdev) != dev.minor
        {
            return Err(Error::invalid(format!(
                "{}: not a device node for {}",
                path.display(),
                dev.devname
            )));
        }
        Ok(fd)
    }
}

impl Default for CharDevMailbox {
    fn default() -> Self {
        Self::new()
    }
}

fn do_ioctl(fd: &rustix::fd::OwnedFd, request: u64, arg: *mut libc::c_void) -> Result<()> {
    // SAFETY: arg points at a live buffer laid out per the request's UAPI
    // struct, sized by the caller.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request as libc::c_ulong, arg) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

impl MboxTransport for CharDevMailbox {
    fn query(&self, dev: &DeviceHandle) -> Result<QueryResult> {
        let fd = self.open_validated(dev)?;

        // First pass with zero entries learns the count.
        let mut header = RawQueryHeader::default();
        do_ioctl(
            &fd,
            CXL_MEM_QUERY_COMMANDS,
            &mut header as *mut RawQueryHeader as *mut libc::c_void,
        )?;
        let n = header.n_commands as usize;
        debug!(memdev = dev.devname, commands = n, "queried command support");
        if n == 0 {
            return Ok(QueryResult::default());
        }

        // Second pass sized to the count.
        let header_len = std::mem::size_of::<RawQueryHeader>();
        let entry_len = std::mem::size_of::<RawCommandInfo>();
        let mut buf = vec![0u8; header_len + n * entry_len];
        buf[..4].copy_from_slice(&(n as u32).to_ne_bytes());
        do_ioctl(&fd, CXL_MEM_QUERY_COMMANDS, buf.as_mut_ptr() as *mut libc::c_void)?;

        let mut commands = Vec::with_capacity(n);
        for chunk in buf[header_len..].chunks_exact(entry_len) {
            // The kernel fills these in native endianness.
            let word = |i: usize| {
                let mut b = [0u8; 4];
                b.copy_from_slice(&chunk[i * 4..i * 4 + 4]);
                b
            };
            commands.push(CommandInfo {
                id: u32::from_ne_bytes(word(0)),
                flags: u32::from_ne_bytes(word(1)),
                size_in: i32::from_ne_bytes(word(2)),
                size_out: i32::from_ne_bytes(word(3)),
            });
        }
        Ok(QueryResult { commands })
    }

    fn send(&self, dev: &DeviceHandle, cmd: &mut SendCommand) -> Result<u32> {
        let fd = self.open_validated(dev)?;
        let mut raw = RawSendCommand {
            id: cmd.id,
            flags: cmd.flags,
            opcode: cmd.raw_opcode,
            op_rsvd: 0,
            retval: 0,
            in_size: cmd.in_payload.len() as i32,
            in_rsvd: 0,
            in_payload: cmd.in_payload.as_ptr() as u64,
            out_size: cmd.out_payload.len() as i32,
            out_rsvd: 0,
            out_payload: cmd.out_payload.as_mut_ptr() as u64,
        };
        do_ioctl(
            &fd,
            CXL_MEM_SEND_COMMAND,
            &mut raw as *mut RawSendCommand as *mut libc::c_void,
        )?;

        // The kernel writes back how much output it produced.
        if raw.out_size >= 0 && (raw.out_size as usize) < cmd.out_payload.len() {
            cmd.out_payload.truncate(raw.out_size as usize);
        }
        debug!(memdev = dev.devname, id = cmd.id, retval = raw.retval, "sent command");
        Ok(raw.retval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_request_encoding() {
        // _IOR(0xCE, 1, 8-byte struct) and _IOWR(0xCE, 2, 48-byte struct).
        assert_eq!(CXL_MEM_QUERY_COMMANDS, (2 << 30) | (8 << 16) | (0xCE << 8) | 1);
        assert_eq!(CXL_MEM_SEND_COMMAND, (3 << 30) | (48 << 16) | (0xCE << 8) | 2);
    }

    #[test]
    fn raw_struct_sizes_match_uapi() {
        assert_eq!(std::mem::size_of::<RawQueryHeader>(), 8);
        assert_eq!(std::mem::size_of::<RawCommandInfo>(), 16);
        assert_eq!(std::mem::size_of::<RawSendCommand>(), 48);
    }
}
