//! Address decoders and their downstream targets.
//!
//! Every port carries decoders named `decoder<port>.<id>`. Root decoders
//! describe platform address windows and own regions; switch decoders route;
//! endpoint decoders program device physical address (DPA) spans. The
//! free-extent computation over a root decoder's sorted region list lives
//! here as well.

use std::path::{Path, PathBuf};

use bitflags::bitflags;

use crate::sysfs::{devname_of, AttrIo};
use crate::topology::{attr_u32_or, attr_u64_or, Mode, PortKind, PortRef, RegionRef};

bitflags! {
    /// Capability bits of a decoder. The kernel only exposes the `cap_*`
    /// attributes on root decoders; switch and endpoint decoders are
    /// implicitly fully capable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DecoderFlags: u8 {
        /// Accelerator (type-2) memory may be mapped.
        const ACCELMEM = 1 << 0;
        /// Expander (type-3) memory may be mapped.
        const MEM = 1 << 1;
        /// Volatile capacity may be mapped.
        const VOLATILE = 1 << 2;
        /// Persistent capacity may be mapped.
        const PMEM = 1 << 3;
    }
}

/// Downstream target type programmed into a switch/endpoint decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetKind {
    #[default]
    Unknown,
    /// Type-3 memory expander.
    Expander,
    /// Type-2 accelerator.
    Accelerator,
}

/// Association of a decoder with one downstream path, by interleave
/// position. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Target {
    pub(crate) id: u32,
    pub(crate) position: u32,
    pub(crate) dev_path: PathBuf,
    pub(crate) phys_path: Option<PathBuf>,
    pub(crate) fw_path: Option<PathBuf>,
}

impl Target {
    /// Dport id this target routes to.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Interleave position (0..ways).
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Device name of the dport.
    pub fn devname(&self) -> &str {
        devname_of(&self.dev_path)
    }

    /// Name of the associated physical (PCI) device, if any.
    pub fn physical_node(&self) -> Option<&str> {
        self.phys_path.as_deref().map(devname_of)
    }

    /// Name of the associated firmware (ACPI) device, if any.
    pub fn firmware_node(&self) -> Option<&str> {
        self.fw_path.as_deref().map(devname_of)
    }

    /// Whether this target is on the decode path of `host_path`, the
    /// canonical platform device path of a memdev.
    pub(crate) fn maps_host_path(&self, host_path: &Path) -> bool {
        let probe = self.phys_path.as_deref().unwrap_or(&self.dev_path);
        host_path.starts_with(probe)
    }
}

/// An address decoder on a port.
#[derive(Debug)]
pub struct Decoder {
    pub(crate) alive: bool,
    pub(crate) id: u32,
    pub(crate) dev_path: PathBuf,
    pub(crate) port: PortRef,
    pub(crate) port_kind: PortKind,

    pub(crate) start: u64,
    pub(crate) size: u64,
    pub(crate) dpa_resource: u64,
    pub(crate) dpa_size: u64,
    pub(crate) mode: Mode,
    pub(crate) interleave_ways: u32,
    pub(crate) interleave_granularity: u32,
    pub(crate) flags: DecoderFlags,
    pub(crate) target_kind: TargetKind,
    pub(crate) locked: bool,
    pub(crate) nr_targets: u32,
    pub(crate) targets: Vec<Target>,

    pub(crate) regions: Vec<RegionRef>,
    pub(crate) stale_regions: Vec<RegionRef>,
    pub(crate) regions_init: bool,
    pub(crate) max_available_extent: u64,
}

impl Decoder {
    pub(crate) fn from_sysfs(
        io: &dyn AttrIo,
        id: u32,
        dev_path: &Path,
        port: PortRef,
        port_kind: PortKind,
        port_dev_path: &Path,
    ) -> Decoder {
        let start = attr_u64_or(io, &dev_path.join("start"), u64::MAX);
        let size = attr_u64_or(io, &dev_path.join("size"), u64::MAX);
        let mode = match io.read_attr(&dev_path.join("mode")) {
            Ok(s) => match s.as_str() {
                "ram" => Mode::Ram,
                "pmem" => Mode::Pmem,
                "none" => Mode::None,
                _ => Mode::Mixed,
            },
            Err(_) => Mode::None,
        };
        let interleave_granularity =
            attr_u32_or(io, &dev_path.join("interleave_granularity"), u32::MAX);
        let interleave_ways = attr_u32_or(io, &dev_path.join("interleave_ways"), u32::MAX);

        let mut dpa_resource = 0;
        let mut dpa_size = 0;
        let mut flags = DecoderFlags::empty();
        let mut target_kind = TargetKind::Unknown;
        let mut locked = false;

        match port_kind {
            PortKind::Endpoint | PortKind::Switch => {
                if port_kind == PortKind::Endpoint {
                    dpa_resource = attr_u64_or(io, &dev_path.join("dpa_resource"), u64::MAX);
                    dpa_size = attr_u64_or(io, &dev_path.join("dpa_size"), u64::MAX);
                }
                flags = DecoderFlags::all();
                locked = attr_u32_or(io, &dev_path.join("locked"), 0) != 0;
                target_kind = match io.read_attr(&dev_path.join("target_type")).as_deref() {
                    Ok("accelerator") => TargetKind::Accelerator,
                    Ok("expander") => TargetKind::Expander,
                    _ => TargetKind::Unknown,
                };
            }
            PortKind::Root => {
                let caps = [
                    ("cap_type2", DecoderFlags::ACCELMEM),
                    ("cap_type3", DecoderFlags::MEM),
                    ("cap_ram", DecoderFlags::VOLATILE),
                    ("cap_pmem", DecoderFlags::PMEM),
                ];
                for (attr, bit) in caps {
                    if attr_u32_or(io, &dev_path.join(attr), 0) != 0 {
                        flags |= bit;
                    }
                }
                locked = attr_u32_or(io, &dev_path.join("locked"), 0) != 0;
            }
        }

        let targets = parse_targets(io, dev_path, port_dev_path);
        let nr_targets = targets.len() as u32;

        Decoder {
            alive: true,
            id,
            dev_path: dev_path.to_path_buf(),
            port,
            port_kind,
            start,
            size,
            dpa_resource,
            dpa_size,
            mode,
            interleave_ways,
            interleave_granularity,
            flags,
            target_kind,
            locked,
            nr_targets,
            targets,
            regions: Vec::new(),
            stale_regions: Vec::new(),
            regions_init: false,
            max_available_extent: 0,
        }
    }

    /// Kernel id of this decoder (the `M` in `decoderN.M`).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Device name (e.g. `decoder3.1`).
    pub fn devname(&self) -> &str {
        devname_of(&self.dev_path)
    }

    /// Port this decoder belongs to.
    pub fn port(&self) -> PortRef {
        self.port
    }

    /// Host physical address base, `u64::MAX` when unprogrammed.
    pub fn resource(&self) -> u64 {
        self.start
    }

    /// Decode window size in bytes, `u64::MAX` when unknown.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Device physical address base (endpoint decoders only).
    pub fn dpa_resource(&self) -> Option<u64> {
        (self.port_kind == PortKind::Endpoint).then_some(self.dpa_resource)
    }

    /// Device physical address span (endpoint decoders only).
    pub fn dpa_size(&self) -> Option<u64> {
        (self.port_kind == PortKind::Endpoint).then_some(self.dpa_size)
    }

    /// Operating mode (endpoint decoders only).
    pub fn mode(&self) -> Option<Mode> {
        (self.port_kind == PortKind::Endpoint).then_some(self.mode)
    }

    pub fn interleave_ways(&self) -> u32 {
        self.interleave_ways
    }

    pub fn interleave_granularity(&self) -> u32 {
        self.interleave_granularity
    }

    /// Capability bits (implied all-set below the root).
    pub fn flags(&self) -> DecoderFlags {
        self.flags
    }

    /// Downstream target type (switch/endpoint decoders).
    pub fn target_kind(&self) -> TargetKind {
        self.target_kind
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn nr_targets(&self) -> u32 {
        self.nr_targets
    }

    /// Interleave targets, in position order.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Target at a given interleave position.
    pub fn target_by_position(&self, position: u32) -> Option<&Target> {
        self.targets.iter().find(|t| t.position == position)
    }

    /// Largest free extent of this root decoder's address window, as of the
    /// last enumeration. Zero for non-root decoders.
    pub fn max_available_extent(&self) -> u64 {
        self.max_available_extent
    }

    /// Sysfs path of this decoder's device directory.
    pub fn path(&self) -> &Path {
        &self.dev_path
    }
}

/// Parse the `target_list` attribute into [`Target`] records. One bad
/// target stops the walk but keeps what parsed so far.
fn parse_targets(io: &dyn AttrIo, dev_path: &Path, port_dev_path: &Path) -> Vec<Target> {
    let list = io.read_attr(&dev_path.join("target_list")).unwrap_or_default();
    let mut targets = Vec::new();
    for (position, token) in list.split(',').enumerate() {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let Ok(id) = token.parse::<u32>() else {
            tracing::error!(decoder = %devname_of(dev_path), position, "failed to parse target");
            break;
        };
        let dport_base = port_dev_path.join(format!("dport{id}"));
        let Some(target_path) = io.canonicalize(&dport_base) else {
            break;
        };
        let phys_path = io.canonicalize(&dport_base.join("physical_node"));
        let fw_path = io.canonicalize(&dport_base.join("firmware_node"));
        let phys_path = match (phys_path, &fw_path) {
            (None, Some(_)) => Some(target_path.clone()),
            (p, _) => p,
        };
        targets.push(Target {
            id,
            position: position as u32,
            dev_path: target_path,
            phys_path,
            fw_path,
        });
    }
    targets
}

/// Largest contiguous free sub-range of a root decoder's `[start,
/// start+size)` window, given its regions sorted ascending by start and
/// non-overlapping. `(start, size, configured)` per region; unconfigured
/// regions do not occupy space yet.
///
/// The scan seeds "end of previous occupied range" one byte before the
/// window so the first gap computes uniformly, then takes the maximum gap
/// between successive regions, and finally the tail gap up to the window
/// end. With no configured regions this reduces to the window size.
pub(crate) fn max_available_extent(
    start: u64,
    size: u64,
    regions: impl Iterator<Item = (u64, u64, bool)>,
) -> u64 {
    let mut prev_end = start.wrapping_sub(1);
    let mut max_extent = 0;
    for (rstart, rsize, configured) in regions {
        if !configured {
            continue;
        }
        // A difference of 1 in addresses is an extent of 0.
        let cur = rstart.wrapping_sub(prev_end).wrapping_sub(1);
        max_extent = max_extent.max(cur);
        prev_end = rstart + rsize - 1;
    }
    let decoder_end = start + size - 1;
    max_extent.max(decoder_end.wrapping_sub(prev_end))
}
