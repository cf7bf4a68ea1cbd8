//! Sysfs access layer for the CXL device hierarchy.
//!
//! Everything the library learns about topology comes from the kernel's
//! sysfs tree under `/sys/bus/cxl`. All of that interaction funnels through
//! the [`AttrIo`] trait so tests can substitute a directory tree of their
//! own making:
//!
//! - Attribute read/write (single-value files, trailing newline trimmed)
//! - Directory scans for `name<id>` children
//! - Symlink resolution (`uport`, `parent_dport`, physical nodes)
//! - Driver bind/unbind and the probe-flush/quiescence primitives
//!
//! [`Sysfs`] is the real implementation. It is cheap to construct and holds
//! no open file descriptors between calls.

use std::fs;
use std::path::{Path, PathBuf};

use rustix::fs::{Mode, OFlags};
use tracing::debug;

use crate::error::{Error, Result};

/// Upper bound on a single sysfs attribute value, matching the kernel's
/// one-page convention.
pub const ATTR_SIZE: usize = 1024;

/// Abstract sysfs operations used by [`CxlContext`](crate::CxlContext).
///
/// Paths handed to these methods are absolute device paths obtained from
/// [`AttrIo::devices_dir`] plus entry names from [`AttrIo::list_dir`].
pub trait AttrIo: Send + Sync {
    /// Directory containing all CXL device nodes (`/sys/bus/cxl/devices`).
    fn devices_dir(&self) -> &Path;

    /// Read a single-value attribute file. The trailing newline, if any,
    /// is trimmed.
    fn read_attr(&self, path: &Path) -> Result<String>;

    /// Write a value to an attribute file.
    fn write_attr(&self, path: &Path, value: &str) -> Result<()>;

    /// Like [`AttrIo::write_attr`] but failures are expected and not logged.
    fn write_attr_quiet(&self, path: &Path, value: &str) -> Result<()> {
        self.write_attr(path, value)
    }

    /// List entry names of a directory.
    fn list_dir(&self, path: &Path) -> Result<Vec<String>>;

    /// Resolve a path (typically a symlink) to its canonical target.
    fn canonicalize(&self, path: &Path) -> Option<PathBuf>;

    /// Whether a directory entry exists, without following symlinks.
    /// Used for `driver` links to test whether a device is bound.
    fn entry_exists(&self, path: &Path) -> bool;

    /// Offer a device to every registered driver until one binds it.
    fn bind(&self, devname: &str) -> Result<()>;

    /// Unbind a device from its current driver.
    fn unbind(&self, dev_path: &Path) -> Result<()>;

    /// Kick the bus to flush pending device probing.
    fn flush(&self) -> Result<()>;

    /// Whether the uevent queue still has unprocessed events.
    fn events_pending(&self) -> bool;
}

// ============================================================================
// Real backend
// ============================================================================

/// [`AttrIo`] backed by the live `/sys/bus/cxl` tree.
#[derive(Debug, Clone)]
pub struct Sysfs {
    devices: PathBuf,
    drivers: PathBuf,
    flush_path: PathBuf,
    udev_queue: PathBuf,
}

impl Sysfs {
    /// Backend rooted at the standard `/sys/bus/cxl` location.
    pub fn new() -> Self {
        Self::rooted_at(Path::new("/sys/bus/cxl"), Path::new("/run/udev/queue"))
    }

    /// Backend rooted at an alternate bus directory. The udev queue file is
    /// polled for quiescence; it is absent once all events have settled.
    pub fn rooted_at(bus_dir: &Path, udev_queue: &Path) -> Self {
        Sysfs {
            devices: bus_dir.join("devices"),
            drivers: bus_dir.join("drivers"),
            flush_path: bus_dir.join("flush"),
            udev_queue: udev_queue.to_path_buf(),
        }
    }

    fn write_raw(&self, path: &Path, value: &str, quiet: bool) -> Result<()> {
        let fd = rustix::fs::open(path, OFlags::WRONLY | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| {
                if !quiet {
                    debug!(path = %path.display(), errno = ?e, "failed to open attribute");
                }
                e
            })?;
        rustix::io::write(&fd, value.as_bytes()).map_err(|e| {
            if !quiet {
                debug!(path = %path.display(), value, errno = ?e, "failed to write attribute");
            }
            e
        })?;
        Ok(())
    }
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new()
    }
}

impl AttrIo for Sysfs {
    fn devices_dir(&self) -> &Path {
        &self.devices
    }

    fn read_attr(&self, path: &Path) -> Result<String> {
        let fd = rustix::fs::open(path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| {
                debug!(path = %path.display(), errno = ?e, "failed to open attribute");
                e
            })?;
        let mut buf = [0u8; ATTR_SIZE];
        let n = rustix::io::read(&fd, &mut buf)?;
        if n >= ATTR_SIZE {
            return Err(Error::Parse(format!("{}: oversized attribute", path.display())));
        }
        let mut s = String::from_utf8_lossy(&buf[..n]).into_owned();
        if s.ends_with('\n') {
            s.pop();
        }
        Ok(s)
    }

    fn write_attr(&self, path: &Path, value: &str) -> Result<()> {
        self.write_raw(path, value, false)
    }

    fn write_attr_quiet(&self, path: &Path, value: &str) -> Result<()> {
        self.write_raw(path, value, true)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        Ok(names)
    }

    fn canonicalize(&self, path: &Path) -> Option<PathBuf> {
        fs::canonicalize(path).ok()
    }

    fn entry_exists(&self, path: &Path) -> bool {
        path.symlink_metadata().is_ok()
    }

    fn bind(&self, devname: &str) -> Result<()> {
        // Every driver on the bus gets a chance; the first one whose `bind`
        // accepts the device wins.
        for drv in self.list_dir(&self.drivers)? {
            if drv.starts_with('.') {
                continue;
            }
            let bind_path = self.drivers.join(&drv).join("bind");
            if self.write_attr_quiet(&bind_path, devname).is_ok() {
                return Ok(());
            }
        }
        debug!(devname, "no driver accepted bind");
        Err(rustix::io::Errno::NXIO.into())
    }

    fn unbind(&self, dev_path: &Path) -> Result<()> {
        let devname = devname_of(dev_path);
        self.write_attr(&dev_path.join("driver/unbind"), devname)
    }

    fn flush(&self) -> Result<()> {
        self.write_attr(&self.flush_path, "1\n")
    }

    fn events_pending(&self) -> bool {
        // The queue file exists only while udev has unprocessed events.
        self.udev_queue.exists()
    }
}

// ============================================================================
// Name helpers
// ============================================================================

/// Final path component as the device name. Device paths always have one.
pub(crate) fn devname_of(dev_path: &Path) -> &str {
    dev_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
}

/// Parse `name` as `<prefix><decimal id>`. Directory entries that do not
/// match the shape (wrong prefix, empty or non-numeric remainder) are
/// skipped by enumeration, not treated as errors.
pub(crate) fn parse_dev_name(name: &str, prefix: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?;
    if rest.is_empty() {
        return None;
    }
    rest.parse::<u32>().ok()
}
