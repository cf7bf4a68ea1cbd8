//! Ports and their downstream attachment points.
//!
//! A port is the unit of CXL decode hierarchy: the bus's root port at depth
//! 0, switch ports below it, and endpoint ports as the leaves that pair with
//! memory devices. All three variants share this one type, discriminated by
//! [`PortKind`].

use std::path::{Path, PathBuf};

use smallvec::SmallVec;

use crate::error::Result;
use crate::sysfs::{devname_of, AttrIo};
use crate::topology::{BusRef, DecoderRef, MemdevRef, PortRef};

/// Which level of the hierarchy a [`Port`] sits at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// The platform root port wrapped by a bus.
    Root,
    /// An intermediate switch port.
    Switch,
    /// A leaf attachment point, paired with one memdev.
    Endpoint,
}

/// A downstream port: where a child bus segment enters this port.
#[derive(Debug, Clone)]
pub struct Dport {
    pub(crate) id: u32,
    pub(crate) dev_path: PathBuf,
    pub(crate) phys_path: Option<PathBuf>,
    pub(crate) fw_path: Option<PathBuf>,
}

impl Dport {
    pub(crate) fn from_sysfs(io: &dyn AttrIo, id: u32, dport_base: &Path) -> Option<Dport> {
        let dev_path = io.canonicalize(dport_base)?;
        let phys_path = io.canonicalize(&dport_base.join("physical_node"));
        let fw_path = io.canonicalize(&dport_base.join("firmware_node"));
        // ACPI-described dports have a firmware node but no PCI physical
        // node; fall back to the device path so host matching still works.
        let phys_path = match (phys_path, &fw_path) {
            (None, Some(_)) => Some(dev_path.clone()),
            (p, _) => p,
        };
        Some(Dport { id, dev_path, phys_path, fw_path })
    }

    /// Kernel id of this dport (the `N` in `dportN`).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Device name (final path component).
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

    /// Whether this dport is on the decode path of `host_path`, the
    /// canonical platform device path of a memdev.
    pub(crate) fn maps_host_path(&self, host_path: &Path) -> bool {
        let probe = self.phys_path.as_deref().unwrap_or(&self.dev_path);
        host_path.starts_with(probe)
    }
}

/// One node of the port hierarchy.
#[derive(Debug)]
pub struct Port {
    pub(crate) alive: bool,
    pub(crate) id: u32,
    pub(crate) kind: PortKind,
    pub(crate) depth: u32,
    pub(crate) dev_path: PathBuf,
    pub(crate) uport_path: PathBuf,
    pub(crate) parent: Option<PortRef>,
    pub(crate) bus: BusRef,
    pub(crate) parent_dport_path: Option<PathBuf>,
    pub(crate) parent_dport: Option<usize>,

    pub(crate) children: SmallVec<[PortRef; 4]>,
    pub(crate) endpoints: SmallVec<[PortRef; 4]>,
    pub(crate) decoders: SmallVec<[DecoderRef; 4]>,
    pub(crate) dports: Vec<Dport>,
    pub(crate) ports_init: bool,
    pub(crate) endpoints_init: bool,
    pub(crate) decoders_init: bool,
    pub(crate) dports_init: bool,

    /// Endpoint variant only: cached cross-reference to the memdev.
    pub(crate) memdev: Option<MemdevRef>,
}

impl Port {
    pub(crate) fn from_sysfs(
        io: &dyn AttrIo,
        kind: PortKind,
        id: u32,
        dev_path: &Path,
        parent: Option<(PortRef, u32)>,
        bus: BusRef,
    ) -> Result<Port> {
        let uport_path = io.canonicalize(&dev_path.join("uport")).ok_or_else(|| {
            crate::error::Error::not_found(format!("{}: no uport link", dev_path.display()))
        })?;
        let depth = parent.map_or(0, |(_, d)| d + 1);

        // Root devices have no parents and depth-1 ports are both root
        // targets and hosts of the next level, so parent_dport == uport
        // there; only deeper ports carry a distinct link.
        let parent_dport_path = if depth > 1 {
            io.canonicalize(&dev_path.join("parent_dport"))
        } else {
            None
        };

        Ok(Port {
            alive: true,
            id,
            kind,
            depth,
            dev_path: dev_path.to_path_buf(),
            uport_path,
            parent: parent.map(|(p, _)| p),
            bus,
            parent_dport_path,
            parent_dport: None,
            children: SmallVec::new(),
            endpoints: SmallVec::new(),
            decoders: SmallVec::new(),
            dports: Vec::new(),
            ports_init: false,
            endpoints_init: false,
            decoders_init: false,
            dports_init: false,
            memdev: None,
        })
    }

    /// Kernel id of this port (the `N` in `portN`/`rootN`/`endpointN`).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Device name (final path component, e.g. `port2`).
    pub fn devname(&self) -> &str {
        devname_of(&self.dev_path)
    }

    /// Which hierarchy level this port occupies.
    pub fn kind(&self) -> PortKind {
        self.kind
    }

    /// Distance from the bus root (root = 0).
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Name of the upstream host device this port decodes for.
    pub fn host(&self) -> &str {
        devname_of(&self.uport_path)
    }

    /// Parent port, if any (the root port has none).
    pub fn parent(&self) -> Option<PortRef> {
        self.parent
    }

    /// Bus this port belongs to.
    pub fn bus(&self) -> BusRef {
        self.bus
    }

    pub fn is_root(&self) -> bool {
        self.kind == PortKind::Root
    }

    pub fn is_switch(&self) -> bool {
        self.kind == PortKind::Switch
    }

    pub fn is_endpoint(&self) -> bool {
        self.kind == PortKind::Endpoint
    }

    /// Sysfs path of this port's device directory.
    pub fn path(&self) -> &Path {
        &self.dev_path
    }

    /// Downstream ports. Only meaningful after
    /// [`CxlContext::dports`](crate::CxlContext::dports) has populated them.
    pub fn dports(&self) -> &[Dport] {
        &self.dports
    }

    /// Whether the port driver is currently bound. Queried live, never
    /// cached.
    pub fn is_enabled(&self, io: &dyn AttrIo) -> bool {
        io.entry_exists(&self.dev_path.join("driver"))
    }
}
