//! Memory devices (`memN`): the physical endpoints commands are sent to.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::sysfs::{devname_of, AttrIo};
use crate::topology::{attr_u64_or, parse_u32, PortRef};

/// Which partition a capacity request applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    /// Apply the requested capacity to the volatile partition.
    Ram,
    /// Apply the requested capacity to the persistent partition.
    Pmem,
}

/// The nvdimm bridge sub-object of a memdev, when present.
#[derive(Debug, Clone)]
pub struct Pmem {
    pub(crate) id: u32,
    pub(crate) dev_path: PathBuf,
}

impl Pmem {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn devname(&self) -> &str {
        devname_of(&self.dev_path)
    }
}

/// A CXL memory expander device.
#[derive(Debug)]
pub struct Memdev {
    pub(crate) alive: bool,
    pub(crate) id: u32,
    pub(crate) dev_path: PathBuf,
    pub(crate) host_path: PathBuf,
    pub(crate) major: u32,
    pub(crate) minor: u32,
    pub(crate) payload_max: usize,
    pub(crate) ram_size: u64,
    pub(crate) pmem_size: u64,
    pub(crate) lsa_size: u64,
    pub(crate) serial: u64,
    pub(crate) numa_node: i32,
    pub(crate) firmware_version: String,
    pub(crate) pmem: Option<Pmem>,

    /// Cached cross-reference to the resolved endpoint port.
    pub(crate) endpoint: Option<PortRef>,
}

impl Memdev {
    pub(crate) fn from_sysfs(io: &dyn AttrIo, id: u32, dev_path: &Path) -> Result<Memdev> {
        // The char-dev numbers come from the `dev` attribute; a memdev
        // without a character device is unusable for commands.
        let dev = io.read_attr(&dev_path.join("dev"))?;
        let (major, minor) = dev
            .split_once(':')
            .and_then(|(ma, mi)| Some((parse_u32(ma).ok()?, parse_u32(mi).ok()?)))
            .ok_or_else(|| Error::Parse(format!("{}: bad dev attribute {dev:?}", dev_path.display())))?;

        let pmem_size = crate::topology::parse_u64(&io.read_attr(&dev_path.join("pmem/size"))?)?;
        let ram_size = crate::topology::parse_u64(&io.read_attr(&dev_path.join("ram/size"))?)?;
        let payload_max =
            crate::topology::parse_u64(&io.read_attr(&dev_path.join("payload_max"))?)? as usize;
        let lsa_size =
            crate::topology::parse_u64(&io.read_attr(&dev_path.join("label_storage_size"))?)?;
        let serial = attr_u64_or(io, &dev_path.join("serial"), u64::MAX);
        let numa_node = io
            .read_attr(&dev_path.join("numa_node"))
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .unwrap_or(-1);
        let firmware_version = io.read_attr(&dev_path.join("firmware_version"))?;

        // The canonical path ends in the memdev node itself; its parent is
        // the host device the memdev hangs off of.
        let canonical = io
            .canonicalize(dev_path)
            .ok_or_else(|| Error::not_found(format!("{}", dev_path.display())))?;
        let host_path = canonical
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::not_found(format!("{}: no host device", dev_path.display())))?;

        Ok(Memdev {
            alive: true,
            id,
            dev_path: dev_path.to_path_buf(),
            host_path,
            major,
            minor,
            payload_max,
            ram_size,
            pmem_size,
            lsa_size,
            serial,
            numa_node,
            firmware_version,
            pmem: None,
            endpoint: None,
        })
    }

    /// Kernel id of this memdev (the `N` in `memN`).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Device name (e.g. `mem3`).
    pub fn devname(&self) -> &str {
        devname_of(&self.dev_path)
    }

    /// Name of the host device this memdev hangs off of (typically a PCI
    /// function).
    pub fn host(&self) -> &str {
        devname_of(&self.host_path)
    }

    /// Char-dev major number, validated against `/dev/cxl/<name>` on every
    /// command submission.
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Char-dev minor number.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Largest mailbox payload the kernel will relay for this device.
    pub fn payload_max(&self) -> usize {
        self.payload_max
    }

    /// Active volatile partition size in bytes.
    pub fn ram_size(&self) -> u64 {
        self.ram_size
    }

    /// Active persistent partition size in bytes.
    pub fn pmem_size(&self) -> u64 {
        self.pmem_size
    }

    /// Label storage area size in bytes.
    pub fn label_size(&self) -> u64 {
        self.lsa_size
    }

    /// Device serial number, `u64::MAX` when not exposed.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// NUMA node of the device, -1 when not exposed.
    pub fn numa_node(&self) -> i32 {
        self.numa_node
    }

    /// Firmware revision string from sysfs.
    pub fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    /// The nvdimm bridge sub-object, when the pmem stack is active.
    pub fn pmem(&self) -> Option<&Pmem> {
        self.pmem.as_ref()
    }

    /// Whether the mem driver is currently bound. Queried live.
    pub fn is_enabled(&self, io: &dyn AttrIo) -> bool {
        io.entry_exists(&self.dev_path.join("driver"))
    }

    /// Whether the nvdimm bridge driver is bound to the pmem sub-object.
    pub fn nvdimm_bridge_active(&self, io: &dyn AttrIo) -> bool {
        self.pmem
            .as_ref()
            .is_some_and(|p| io.entry_exists(&p.dev_path.join("driver")))
    }

    /// Sysfs path of this memdev's device directory.
    pub fn path(&self) -> &Path {
        &self.dev_path
    }
}

// ============================================================================
// Capacity partitioning
// ============================================================================

/// Translate a user capacity request into the volatile size carried by the
/// set-partition command. `None` applies all available capacity to `ty`.
pub fn size_to_volatile(ty: PartitionType, size: Option<u64>, available: u64) -> Result<u64> {
    let Some(size) = size else {
        return Ok(match ty {
            PartitionType::Pmem => 0,
            PartitionType::Ram => available,
        });
    };
    if size > available {
        return Err(Error::invalid(format!(
            "{size:#x} exceeds available capacity {available:#x}"
        )));
    }
    Ok(match ty {
        PartitionType::Pmem => available - size,
        PartitionType::Ram => size,
    })
}

/// Align a volatile-size request to the device's partition alignment unit.
///
/// With `align` unset, an unaligned request is an error. Otherwise the
/// value is rounded in the direction that honors the requested partition:
/// down for pmem (never shrink the persistent side), up for ram. Alignment
/// may not push the value past the available capacity.
pub fn partition_align(
    ty: PartitionType,
    volatile_size: u64,
    alignment: u64,
    available: u64,
    align: bool,
) -> Result<u64> {
    if alignment == 0 {
        return Err(Error::invalid("no available capacity"));
    }
    if volatile_size % alignment == 0 {
        return Ok(volatile_size);
    }
    if !align {
        return Err(Error::invalid(format!(
            "size {volatile_size:#x} is not partition aligned to {alignment:#x}"
        )));
    }
    let aligned = match ty {
        PartitionType::Pmem => volatile_size - volatile_size % alignment,
        PartitionType::Ram => volatile_size + (alignment - volatile_size % alignment),
    };
    if aligned > available {
        return Err(Error::invalid(format!(
            "aligned partition size {aligned:#x} exceeds available size {available:#x}"
        )));
    }
    Ok(aligned)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB256: u64 = 256 << 20;

    #[test]
    fn omitted_size_takes_all_capacity() {
        assert_eq!(size_to_volatile(PartitionType::Pmem, None, 4 * MIB256).unwrap(), 0);
        assert_eq!(
            size_to_volatile(PartitionType::Ram, None, 4 * MIB256).unwrap(),
            4 * MIB256
        );
    }

    #[test]
    fn pmem_request_leaves_the_remainder_volatile() {
        assert_eq!(
            size_to_volatile(PartitionType::Pmem, Some(MIB256), 4 * MIB256).unwrap(),
            3 * MIB256
        );
        assert_eq!(
            size_to_volatile(PartitionType::Ram, Some(MIB256), 4 * MIB256).unwrap(),
            MIB256
        );
    }

    #[test]
    fn oversized_request_rejected() {
        assert!(size_to_volatile(PartitionType::Ram, Some(5 * MIB256), 4 * MIB256).is_err());
    }

    #[test]
    fn unaligned_without_align_flag_is_an_error() {
        assert!(partition_align(PartitionType::Ram, MIB256 + 1, MIB256, 4 * MIB256, false).is_err());
        // Already aligned passes regardless.
        assert_eq!(
            partition_align(PartitionType::Ram, MIB256, MIB256, 4 * MIB256, false).unwrap(),
            MIB256
        );
    }

    #[test]
    fn align_direction_follows_partition_type() {
        // pmem-preferring rounds the volatile side down, ram rounds up.
        assert_eq!(
            partition_align(PartitionType::Pmem, MIB256 + 7, MIB256, 4 * MIB256, true).unwrap(),
            MIB256
        );
        assert_eq!(
            partition_align(PartitionType::Ram, MIB256 + 7, MIB256, 4 * MIB256, true).unwrap(),
            2 * MIB256
        );
    }

    #[test]
    fn align_may_not_exceed_available() {
        assert!(
            partition_align(PartitionType::Ram, 4 * MIB256 - 1, MIB256, 4 * MIB256 - 1, true)
                .is_err()
        );
    }
}
