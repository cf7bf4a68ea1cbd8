//! The library context: entity arenas, lazy enumeration, and lifecycle.
//!
//! [`CxlContext`] owns every entity the library knows about. Containers are
//! populated lazily: the first traversal of a container scans the matching
//! sysfs directory and instantiates one entity per `name<id>` child, with
//! id-based de-duplication. Before every scan the context kicks the bus
//! probe flush and waits for the uevent queue to quiesce, so that topology
//! reads observe settled driver state.
//!
//! A context is intended for single-threaded use; nothing here takes locks.
//! Entity handles (`BusRef`, `PortRef`, ...) index into arenas and stay
//! valid across invalidation — dead slots are skipped by enumeration, not
//! reused.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::mbox::transport::{CharDevMailbox, MboxTransport};
use crate::sysfs::{devname_of, parse_dev_name, AttrIo, Sysfs};
use crate::topology::decoder::max_available_extent;
use crate::topology::{
    bus::provider_alias, Bus, BusRef, Decoder, DecoderRef, Dport, Mapping, Memdev, MemdevRef,
    Mode, Pmem, Port, PortKind, PortRef, Region, RegionRef,
};

/// Default quiescence-wait budget in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Root object of the library. See the module docs for the ownership and
/// laziness rules.
pub struct CxlContext {
    io: Arc<dyn AttrIo>,
    transport: Arc<dyn MboxTransport>,
    timeout_ms: u64,

    buses: Vec<Bus>,
    ports: Vec<Port>,
    decoders: Vec<Decoder>,
    regions: Vec<Region>,
    memdevs: Vec<Memdev>,

    buses_init: bool,
    memdevs_init: bool,
}

impl CxlContext {
    /// Context over the live system (`/sys/bus/cxl` and `/dev/cxl`).
    pub fn new() -> Self {
        Self::with_backends(Arc::new(Sysfs::new()), Arc::new(CharDevMailbox::new()))
    }

    /// Context with injected backends. This is how tests substitute a fake
    /// sysfs tree and a scripted mailbox.
    pub fn with_backends(io: Arc<dyn AttrIo>, transport: Arc<dyn MboxTransport>) -> Self {
        CxlContext {
            io,
            transport,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            buses: Vec::new(),
            ports: Vec::new(),
            decoders: Vec::new(),
            regions: Vec::new(),
            memdevs: Vec::new(),
            buses_init: false,
            memdevs_init: false,
        }
    }

    /// Quiescence-wait budget in milliseconds. Zero polls forever.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
    }

    pub(crate) fn io(&self) -> &dyn AttrIo {
        self.io.as_ref()
    }

    pub(crate) fn transport(&self) -> Arc<dyn MboxTransport> {
        Arc::clone(&self.transport)
    }

    // ========================================================================
    // Arena access
    // ========================================================================

    /// Resolve a bus handle. Handles from this context never dangle.
    pub fn bus(&self, b: BusRef) -> &Bus {
        &self.buses[b.0]
    }

    /// Resolve a port handle.
    pub fn port(&self, p: PortRef) -> &Port {
        &self.ports[p.0]
    }

    /// Resolve a decoder handle.
    pub fn decoder(&self, d: DecoderRef) -> &Decoder {
        &self.decoders[d.0]
    }

    /// Resolve a region handle.
    pub fn region(&self, r: RegionRef) -> &Region {
        &self.regions[r.0]
    }

    /// Resolve a memdev handle.
    pub fn memdev(&self, m: MemdevRef) -> &Memdev {
        &self.memdevs[m.0]
    }

    /// Provider name of a bus, with the fixed ACPI/test aliases applied.
    pub fn bus_provider(&self, b: BusRef) -> &str {
        provider_alias(self.ports[self.buses[b.0].port.0].host())
    }

    // ========================================================================
    // Quiescence + directory scanning
    // ========================================================================

    /// Kick the probe flush and poll until the uevent queue drains or the
    /// timeout budget runs out.
    fn wait_probe(&self) -> Result<()> {
        let mut remaining = self.timeout_ms;
        let mut slept = 0u64;
        loop {
            self.io.flush()?;
            if !self.io.events_pending() {
                break;
            }
            slept += 1;
            thread::sleep(Duration::from_millis(1));
            if self.timeout_ms != 0 {
                if remaining == 0 {
                    break;
                }
                remaining -= 1;
            }
        }
        if slept > 0 {
            debug!(waited_ms = slept, "waited for device probing");
        }
        Ok(())
    }

    /// Scan `base` for `prefix<id>` children. Quiesces first; a missing or
    /// unreadable directory yields no children, matching the "no devices"
    /// case.
    fn scan_children(&self, base: &Path, prefix: &str) -> Vec<(u32, PathBuf)> {
        if let Err(e) = self.wait_probe() {
            debug!(error = %e, "probe flush failed");
        }
        let names = match self.io.list_dir(base) {
            Ok(names) => names,
            Err(_) => {
                debug!(base = %base.display(), prefix, "no devices found");
                return Vec::new();
            }
        };
        names
            .into_iter()
            .filter_map(|name| {
                let id = parse_dev_name(&name, prefix)?;
                Some((id, base.join(name)))
            })
            .collect()
    }

    // ========================================================================
    // Buses
    // ========================================================================

    /// All live buses, enumerating on first call.
    pub fn buses(&mut self) -> Vec<BusRef> {
        self.init_buses();
        (0..self.buses.len())
            .map(BusRef)
            .filter(|b| self.buses[b.0].alive)
            .collect()
    }

    fn init_buses(&mut self) {
        if self.buses_init {
            return;
        }
        self.buses_init = true;
        let devices = self.io.devices_dir().to_path_buf();
        for (id, path) in self.scan_children(&devices, "root") {
            self.add_bus(id, &path);
        }
    }

    fn add_bus(&mut self, id: u32, dev_path: &Path) -> Option<BusRef> {
        if let Some(existing) = (0..self.buses.len()).map(BusRef).find(|b| {
            self.buses[b.0].alive && self.ports[self.buses[b.0].port.0].id == id
        }) {
            return Some(existing);
        }
        let bus_ref = BusRef(self.buses.len());
        let port_ref = PortRef(self.ports.len());
        match Port::from_sysfs(self.io.as_ref(), PortKind::Root, id, dev_path, None, bus_ref) {
            Ok(port) => {
                self.ports.push(port);
                self.buses.push(Bus { alive: true, port: port_ref });
                Some(bus_ref)
            }
            Err(e) => {
                error!(bus = id, error = %e, "failed to add bus");
                None
            }
        }
    }

    // ========================================================================
    // Memdevs
    // ========================================================================

    /// All live memdevs, enumerating on first call.
    pub fn memdevs(&mut self) -> Vec<MemdevRef> {
        self.init_memdevs();
        (0..self.memdevs.len())
            .map(MemdevRef)
            .filter(|m| self.memdevs[m.0].alive)
            .collect()
    }

    fn init_memdevs(&mut self) {
        if self.memdevs_init {
            return;
        }
        self.memdevs_init = true;
        let devices = self.io.devices_dir().to_path_buf();
        for (id, path) in self.scan_children(&devices, "mem") {
            self.add_memdev(id, &path);
        }
    }

    fn add_memdev(&mut self, id: u32, dev_path: &Path) -> Option<MemdevRef> {
        if let Some(existing) = (0..self.memdevs.len())
            .map(MemdevRef)
            .find(|m| self.memdevs[m.0].alive && self.memdevs[m.0].id == id)
        {
            return Some(existing);
        }
        let mut memdev = match Memdev::from_sysfs(self.io.as_ref(), id, dev_path) {
            Ok(m) => m,
            Err(e) => {
                error!(memdev = id, error = %e, "failed to add memdev");
                return None;
            }
        };
        if let Some((pmem_id, pmem_path)) = self.scan_children(dev_path, "pmem").into_iter().next()
        {
            memdev.pmem = Some(Pmem { id: pmem_id, dev_path: pmem_path });
        }
        let m = MemdevRef(self.memdevs.len());
        self.memdevs.push(memdev);
        Some(m)
    }

    // ========================================================================
    // Ports and endpoints
    // ========================================================================

    /// Live child (switch) ports of `parent`, enumerating on first call.
    pub fn child_ports(&mut self, parent: PortRef) -> Vec<PortRef> {
        self.init_ports(parent);
        self.ports[parent.0]
            .children
            .iter()
            .copied()
            .filter(|p| self.ports[p.0].alive)
            .collect()
    }

    fn init_ports(&mut self, parent: PortRef) {
        if self.ports[parent.0].ports_init {
            return;
        }
        self.ports[parent.0].ports_init = true;
        let base = self.ports[parent.0].dev_path.clone();
        for (id, path) in self.scan_children(&base, "port") {
            self.add_port(parent, PortKind::Switch, id, &path);
        }
    }

    /// Live endpoints of `parent`, enumerating on first call.
    pub fn endpoints(&mut self, parent: PortRef) -> Vec<PortRef> {
        self.init_endpoints(parent);
        self.ports[parent.0]
            .endpoints
            .iter()
            .copied()
            .filter(|p| self.ports[p.0].alive)
            .collect()
    }

    fn init_endpoints(&mut self, parent: PortRef) {
        if self.ports[parent.0].endpoints_init {
            return;
        }
        self.ports[parent.0].endpoints_init = true;
        let base = self.ports[parent.0].dev_path.clone();
        for (id, path) in self.scan_children(&base, "endpoint") {
            self.add_port(parent, PortKind::Endpoint, id, &path);
        }
    }

    fn add_port(
        &mut self,
        parent: PortRef,
        kind: PortKind,
        id: u32,
        dev_path: &Path,
    ) -> Option<PortRef> {
        let siblings = match kind {
            PortKind::Endpoint => &self.ports[parent.0].endpoints,
            _ => &self.ports[parent.0].children,
        };
        if let Some(existing) = siblings
            .iter()
            .copied()
            .find(|p| self.ports[p.0].alive && self.ports[p.0].id == id)
        {
            return Some(existing);
        }
        let depth = self.ports[parent.0].depth;
        let bus = self.ports[parent.0].bus;
        let port =
            match Port::from_sysfs(self.io.as_ref(), kind, id, dev_path, Some((parent, depth)), bus)
            {
                Ok(p) => p,
                Err(e) => {
                    error!(port = id, error = %e, "failed to add port");
                    return None;
                }
            };
        let p = PortRef(self.ports.len());
        self.ports.push(port);
        match kind {
            PortKind::Endpoint => self.ports[parent.0].endpoints.push(p),
            _ => self.ports[parent.0].children.push(p),
        }
        Some(p)
    }

    /// All descendant ports of `top` in depth-first order, enumerating
    /// every level on the way down. `top` itself is not included.
    pub fn all_ports(&mut self, top: PortRef) -> Vec<PortRef> {
        let mut out = Vec::new();
        let mut stack: Vec<PortRef> = self.child_ports(top);
        stack.reverse();
        while let Some(p) = stack.pop() {
            out.push(p);
            let mut children = self.child_ports(p);
            children.reverse();
            stack.extend(children);
        }
        out
    }

    /// Whether the port's driver is bound. Queried live, never cached.
    pub fn port_is_enabled(&self, p: PortRef) -> bool {
        self.ports[p.0].is_enabled(self.io.as_ref())
    }

    /// Bus of a port. Disabled ports have no bus.
    pub fn port_bus(&self, p: PortRef) -> Option<BusRef> {
        if !self.port_is_enabled(p) {
            return None;
        }
        Some(self.ports[p.0].bus)
    }

    /// Number of dports on a port, populating them on first call.
    pub fn dport_count(&mut self, p: PortRef) -> usize {
        self.init_dports(p);
        self.ports[p.0].dports.len()
    }

    /// Dports of a port, populating them on first call.
    pub fn dports(&mut self, p: PortRef) -> &[Dport] {
        self.init_dports(p);
        &self.ports[p.0].dports
    }

    fn init_dports(&mut self, p: PortRef) {
        if self.ports[p.0].dports_init {
            return;
        }
        self.ports[p.0].dports_init = true;
        let base = self.ports[p.0].dev_path.clone();
        for (id, path) in self.scan_children(&base, "dport") {
            if self.ports[p.0].dports.iter().any(|d| d.id == id) {
                continue;
            }
            if let Some(dport) = Dport::from_sysfs(self.io.as_ref(), id, &path) {
                self.ports[p.0].dports.push(dport);
            }
        }
    }

    /// The dport on `p` that routes to `memdev`, by host-path prefix.
    pub fn dport_by_memdev(&mut self, p: PortRef, m: MemdevRef) -> Option<&Dport> {
        self.init_dports(p);
        let host_path = self.memdevs[m.0].host_path.clone();
        self.ports[p.0].dports.iter().find(|d| d.maps_host_path(&host_path))
    }

    /// The dport of the parent port that this port enters through.
    /// Resolved lazily and cached; only ports below depth 1 have one.
    pub fn parent_dport(&mut self, p: PortRef) -> Option<(PortRef, usize)> {
        let parent = self.ports[p.0].parent?;
        if let Some(idx) = self.ports[p.0].parent_dport {
            return Some((parent, idx));
        }
        let link = self.ports[p.0].parent_dport_path.clone()?;
        let name = devname_of(&link).to_owned();
        self.init_dports(parent);
        let idx = self.ports[parent.0]
            .dports
            .iter()
            .position(|d| d.devname() == name)?;
        self.ports[p.0].parent_dport = Some(idx);
        Some((parent, idx))
    }

    /// Whether `p` is on the ancestor chain of the endpoint hosting `m`
    /// (including the endpoint itself).
    pub fn port_hosts_memdev(&mut self, p: PortRef, m: MemdevRef) -> bool {
        let Some(endpoint) = self.memdev_endpoint(m) else {
            return false;
        };
        let mut iter = Some(endpoint);
        while let Some(q) = iter {
            if q == p {
                return true;
            }
            iter = self.ports[q.0].parent;
        }
        false
    }

    // ========================================================================
    // Memdev <-> endpoint cross-reference
    // ========================================================================

    /// Whether the mem driver is bound. Queried live, never cached.
    pub fn memdev_is_enabled(&self, m: MemdevRef) -> bool {
        self.memdevs[m.0].is_enabled(self.io.as_ref())
    }

    /// The endpoint hosting this memdev, resolving and caching the
    /// bidirectional association on first success.
    ///
    /// If the endpoint found already points at a different memdev the
    /// conflict is logged and the association is still recorded, keeping
    /// the topology navigable rather than failing hard.
    pub fn memdev_endpoint(&mut self, m: MemdevRef) -> Option<PortRef> {
        if let Some(ep) = self.memdevs[m.0].endpoint {
            return Some(ep);
        }
        if !self.memdev_is_enabled(m) {
            return None;
        }
        let devname = self.memdevs[m.0].devname().to_owned();
        let mut found = None;
        for b in self.buses() {
            let root = self.buses[b.0].port;
            if let Some(ep) = self.find_endpoint(root, &devname) {
                found = Some(ep);
                break;
            }
        }
        let ep = found?;
        if let Some(prev) = self.ports[ep.0].memdev {
            if prev != m {
                warn!(
                    endpoint = self.ports[ep.0].devname(),
                    assigned = self.memdevs[prev.0].devname(),
                    requested = devname,
                    "endpoint already assigned to another memdev"
                );
            }
        }
        self.memdevs[m.0].endpoint = Some(ep);
        self.ports[ep.0].memdev = Some(m);
        Some(ep)
    }

    fn find_endpoint(&mut self, parent: PortRef, devname: &str) -> Option<PortRef> {
        for ep in self.endpoints(parent) {
            if self.ports[ep.0].host() == devname {
                return Some(ep);
            }
        }
        for child in self.child_ports(parent) {
            if let Some(ep) = self.find_endpoint(child, devname) {
                return Some(ep);
            }
        }
        None
    }

    /// The memdev paired with an endpoint, resolving and caching the
    /// bidirectional association on first success. Mirror image of
    /// [`CxlContext::memdev_endpoint`], with the same conflict tolerance.
    pub fn endpoint_memdev(&mut self, ep: PortRef) -> Option<MemdevRef> {
        if let Some(m) = self.ports[ep.0].memdev {
            return Some(m);
        }
        if !self.port_is_enabled(ep) {
            return None;
        }
        let host = self.ports[ep.0].host().to_owned();
        let m = self
            .memdevs()
            .into_iter()
            .find(|m| self.memdevs[m.0].devname() == host)?;
        if let Some(prev) = self.memdevs[m.0].endpoint {
            if prev != ep {
                warn!(
                    memdev = self.memdevs[m.0].devname(),
                    assigned = self.ports[prev.0].devname(),
                    requested = self.ports[ep.0].devname(),
                    "memdev already assigned to another endpoint"
                );
            }
        }
        self.ports[ep.0].memdev = Some(m);
        self.memdevs[m.0].endpoint = Some(ep);
        Some(m)
    }

    /// Bus of a memdev, via its resolved endpoint.
    pub fn memdev_bus(&mut self, m: MemdevRef) -> Option<BusRef> {
        let ep = self.memdev_endpoint(m)?;
        self.port_bus(ep)
    }

    // ========================================================================
    // Decoders
    // ========================================================================

    /// Live decoders of a port, sorted by id, enumerating on first call.
    pub fn decoders(&mut self, p: PortRef) -> Vec<DecoderRef> {
        self.init_decoders(p);
        self.ports[p.0]
            .decoders
            .iter()
            .copied()
            .filter(|d| self.decoders[d.0].alive)
            .collect()
    }

    fn init_decoders(&mut self, p: PortRef) {
        if self.ports[p.0].decoders_init {
            return;
        }
        self.ports[p.0].decoders_init = true;
        let base = self.ports[p.0].dev_path.clone();
        let prefix = format!("decoder{}.", self.ports[p.0].id);
        for (id, path) in self.scan_children(&base, &prefix) {
            self.add_decoder(p, id, &path);
        }
    }

    fn add_decoder(&mut self, p: PortRef, id: u32, dev_path: &Path) -> DecoderRef {
        if let Some(existing) = self.ports[p.0]
            .decoders
            .iter()
            .copied()
            .find(|d| self.decoders[d.0].alive && self.decoders[d.0].id == id)
        {
            return existing;
        }
        let kind = self.ports[p.0].kind;
        let port_path = self.ports[p.0].dev_path.clone();
        let decoder = Decoder::from_sysfs(self.io.as_ref(), id, dev_path, p, kind, &port_path);
        let d = DecoderRef(self.decoders.len());
        self.decoders.push(decoder);

        // Keep the port's decoder list ordered by id.
        let pos = self.ports[p.0]
            .decoders
            .iter()
            .position(|&o| self.decoders[o.0].id > id)
            .unwrap_or(self.ports[p.0].decoders.len());
        self.ports[p.0].decoders.insert(pos, d);

        if kind == PortKind::Root {
            self.init_regions(d);
            self.recompute_extent(d);
        }
        d
    }

    fn recompute_extent(&mut self, d: DecoderRef) {
        let start = self.decoders[d.0].start;
        let size = self.decoders[d.0].size;
        if start == u64::MAX || size == u64::MAX {
            return;
        }
        let regions: Vec<(u64, u64, bool)> = self.decoders[d.0]
            .regions
            .iter()
            .map(|&r| &self.regions[r.0])
            .filter(|r| r.alive)
            .map(|r| (r.start, r.size, r.is_configured()))
            .collect();
        let extent = max_available_extent(start, size, regions.into_iter());
        self.decoders[d.0].max_available_extent = extent;
    }

    /// Find a decoder anywhere in the topology by its device name
    /// (`decoderN.M`), enumerating ports and decoders as needed.
    pub fn decoder_by_name(&mut self, name: &str) -> Option<DecoderRef> {
        for b in self.buses() {
            let top = self.buses[b.0].port;
            let mut stack = vec![top];
            while let Some(p) = stack.pop() {
                if let Some(d) = self.port_match_decoder(p, name) {
                    return Some(d);
                }
                for ep in self.endpoints(p) {
                    if let Some(d) = self.port_match_decoder(ep, name) {
                        return Some(d);
                    }
                }
                stack.extend(self.child_ports(p));
            }
        }
        None
    }

    fn port_match_decoder(&mut self, p: PortRef, name: &str) -> Option<DecoderRef> {
        self.decoders(p)
            .into_iter()
            .find(|&d| self.decoders[d.0].devname() == name)
    }

    /// The target on a decoder that routes to `memdev`, by host-path
    /// prefix.
    pub fn decoder_target_by_memdev(
        &self,
        d: DecoderRef,
        m: MemdevRef,
    ) -> Option<&crate::topology::Target> {
        let host_path = &self.memdevs[m.0].host_path;
        self.decoders[d.0]
            .targets
            .iter()
            .find(|t| t.maps_host_path(host_path))
    }

    /// The memdev behind an endpoint decoder.
    pub fn decoder_memdev(&mut self, d: DecoderRef) -> Option<MemdevRef> {
        let p = self.decoders[d.0].port;
        if !self.ports[p.0].is_endpoint() {
            return None;
        }
        self.endpoint_memdev(p)
    }

    /// Set the device physical address span of an endpoint decoder.
    pub fn decoder_set_dpa_size(&mut self, d: DecoderRef, size: u64) -> Result<()> {
        let p = self.decoders[d.0].port;
        if !self.ports[p.0].is_endpoint() {
            return Err(Error::invalid(format!(
                "{}: not an endpoint decoder",
                self.decoders[d.0].devname()
            )));
        }
        let path = self.decoders[d.0].dev_path.join("dpa_size");
        self.io.write_attr(&path, &format!("{size:#x}\n"))?;
        self.decoders[d.0].dpa_size = size;
        Ok(())
    }

    /// Set the operating mode of an endpoint decoder. Only `Ram` and
    /// `Pmem` may be requested.
    pub fn decoder_set_mode(&mut self, d: DecoderRef, mode: Mode) -> Result<()> {
        let p = self.decoders[d.0].port;
        if !self.ports[p.0].is_endpoint() {
            return Err(Error::invalid(format!(
                "{}: not an endpoint decoder",
                self.decoders[d.0].devname()
            )));
        }
        if !matches!(mode, Mode::Ram | Mode::Pmem) {
            return Err(Error::invalid(format!(
                "{}: unsupported mode {:?}",
                self.decoders[d.0].devname(),
                mode
            )));
        }
        let path = self.decoders[d.0].dev_path.join("mode");
        self.io.write_attr(&path, mode.as_str())?;
        self.decoders[d.0].mode = mode;
        Ok(())
    }

    /// The region a switch/endpoint decoder currently participates in.
    pub fn decoder_region(&mut self, d: DecoderRef) -> Option<RegionRef> {
        let p = self.decoders[d.0].port;
        if self.ports[p.0].is_root() {
            return None;
        }
        let name = self.io.read_attr(&self.decoders[d.0].dev_path.join("region")).ok()?;
        if name.is_empty() {
            return None;
        }
        // Regions live under the root port's decoders.
        let mut top = p;
        while let Some(parent) = self.ports[top.0].parent {
            top = parent;
        }
        for rd in self.decoders(top) {
            for r in self.regions(rd) {
                if self.regions[r.0].devname() == name {
                    return Some(r);
                }
            }
        }
        None
    }

    // ========================================================================
    // Regions
    // ========================================================================

    /// Live regions of a root decoder, sorted by start address,
    /// enumerating on first call. Non-root decoders own no regions.
    pub fn regions(&mut self, d: DecoderRef) -> Vec<RegionRef> {
        self.init_regions(d);
        self.decoders[d.0]
            .regions
            .iter()
            .copied()
            .filter(|r| self.regions[r.0].alive)
            .collect()
    }

    /// Stale regions of a decoder: entities displaced by kernel id reuse.
    pub fn stale_regions(&self, d: DecoderRef) -> &[RegionRef] {
        &self.decoders[d.0].stale_regions
    }

    fn init_regions(&mut self, d: DecoderRef) {
        if self.decoders[d.0].regions_init {
            return;
        }
        if self.ports[self.decoders[d.0].port.0].kind != PortKind::Root {
            return;
        }
        self.decoders[d.0].regions_init = true;
        let base = self.decoders[d.0].dev_path.clone();
        for (id, path) in self.scan_children(&base, "region") {
            self.add_region(d, id, &path);
        }
    }

    fn add_region(&mut self, d: DecoderRef, id: u32, dev_path: &Path) -> Option<RegionRef> {
        let region = match Region::from_sysfs(self.io.as_ref(), id, dev_path, d) {
            Ok(r) => r,
            Err(e) => {
                error!(region = id, error = %e, "failed to add region");
                return None;
            }
        };

        // The kernel reuses region ids. A same-id entity already on the
        // live list is displaced to the stale list, never silently dropped:
        // callers may still hold a handle to it.
        if let Some(pos) = self.decoders[d.0]
            .regions
            .iter()
            .position(|&r| self.regions[r.0].id == id)
        {
            let old = self.decoders[d.0].regions.remove(pos);
            self.decoders[d.0].stale_regions.push(old);
        }

        let r = RegionRef(self.regions.len());
        let start = region.start;
        self.regions.push(region);
        let pos = self.decoders[d.0]
            .regions
            .iter()
            .position(|&o| self.regions[o.0].start > start)
            .unwrap_or(self.decoders[d.0].regions.len());
        self.decoders[d.0].regions.insert(pos, r);
        Some(r)
    }

    /// Mappings of a region, materialized on first call by resolving each
    /// `targetN` attribute to an endpoint decoder. A position that fails
    /// to resolve is skipped, not fatal.
    pub fn mappings(&mut self, r: RegionRef) -> Vec<Mapping> {
        self.init_mappings(r);
        self.regions[r.0].mappings.clone()
    }

    fn init_mappings(&mut self, r: RegionRef) {
        if self.regions[r.0].mappings_init {
            return;
        }
        self.regions[r.0].mappings_init = true;
        let ways = self.regions[r.0].interleave_ways;
        if ways == u32::MAX {
            debug!(region = self.regions[r.0].devname(), "interleave ways unknown");
            return;
        }
        let dev_path = self.regions[r.0].dev_path.clone();
        for position in 0..ways {
            let attr = dev_path.join(format!("target{position}"));
            let name = match self.io.read_attr(&attr) {
                Ok(n) => n,
                Err(_) => {
                    error!(region = self.regions[r.0].devname(), position, "failed to read target");
                    continue;
                }
            };
            let Some(decoder) = self.decoder_by_name(&name) else {
                error!(
                    region = self.regions[r.0].devname(),
                    position, target = name, "target decoder lookup failure"
                );
                continue;
            };
            self.regions[r.0].mappings.push(Mapping { decoder, position });
        }
    }

    /// Whether the region driver is bound. Queried live, never cached.
    pub fn region_is_enabled(&self, r: RegionRef) -> bool {
        self.regions[r.0].is_enabled(self.io.as_ref())
    }

    /// Bind the region driver, then refresh the start address: `resource`
    /// is assigned by the kernel at enable time.
    pub fn region_enable(&mut self, r: RegionRef) -> Result<()> {
        if self.region_is_enabled(r) {
            return Ok(());
        }
        let devname = self.regions[r.0].devname().to_owned();
        let _ = self.io.bind(&devname);
        if !self.region_is_enabled(r) {
            error!(region = devname, "failed to enable");
            return Err(rustix::io::Errno::NXIO.into());
        }
        if let Ok(s) = self.io.read_attr(&self.regions[r.0].dev_path.join("resource")) {
            if let Ok(resource) = crate::topology::parse_u64(&s) {
                self.regions[r.0].start = resource;
            }
        }
        debug!(region = self.regions[r.0].devname(), "enabled");
        Ok(())
    }

    /// Unbind the region driver.
    pub fn region_disable(&mut self, r: RegionRef) -> Result<()> {
        let dev_path = self.regions[r.0].dev_path.clone();
        let _ = self.io.unbind(&dev_path);
        if self.region_is_enabled(r) {
            let devname = self.regions[r.0].devname();
            error!(region = devname, "failed to disable");
            return Err(Error::busy(format!("{devname}: failed to disable")));
        }
        Ok(())
    }

    fn region_delete_name(&mut self, d: DecoderRef, devname: &str) -> Result<()> {
        let path = self.decoders[d.0].dev_path.join("delete_region");
        self.io.write_attr(&path, devname).map_err(|e| {
            error!(region = devname, error = %e, "error deleting region");
            e
        })
    }

    /// Delete a disabled region, dropping the live entity and forcing the
    /// decoder to re-enumerate on next traversal.
    pub fn region_delete(&mut self, r: RegionRef) -> Result<()> {
        if self.region_is_enabled(r) {
            return Err(Error::busy(format!(
                "{}: cannot delete while enabled",
                self.regions[r.0].devname()
            )));
        }
        let d = self.regions[r.0].decoder;
        let devname = self.regions[r.0].devname().to_owned();
        self.region_delete_name(d, &devname)?;
        self.decoders[d.0].regions_init = false;
        self.decoders[d.0].regions.retain(|&x| x != r);
        self.regions[r.0].alive = false;
        Ok(())
    }

    /// Create a region of the given mode under a root decoder: read the
    /// next region name the kernel has reserved, commit it by writing it
    /// back, then walk to the new entity.
    pub fn create_region(&mut self, d: DecoderRef, mode: Mode) -> Result<RegionRef> {
        let attr = match mode {
            Mode::Pmem => "create_pmem_region",
            Mode::Ram => "create_ram_region",
            _ => {
                return Err(Error::invalid(format!(
                    "{}: cannot create a {:?} region",
                    self.decoders[d.0].devname(),
                    mode
                )))
            }
        };
        let path = self.decoders[d.0].dev_path.join(attr);
        let name = self.io.read_attr(&path).map_err(|e| {
            error!(error = %e, "failed to read new region name");
            e
        })?;
        self.io.write_attr(&path, &name).map_err(|e| {
            error!(error = %e, "failed to write new region name");
            e
        })?;

        // Force a re-scan so the new region can be discovered.
        self.decoders[d.0].regions_init = false;
        for r in self.regions(d) {
            if self.regions[r.0].devname() == name {
                return Ok(r);
            }
        }

        // Walking to the region we just created failed; delete it rather
        // than leave a dangling id behind.
        error!(region = name, "failed to find newly created region");
        let _ = self.region_delete_name(d, &name);
        Err(Error::not_found(name))
    }

    fn region_write_attr(&mut self, r: RegionRef, attr: &str, value: &str) -> Result<()> {
        let path = self.regions[r.0].dev_path.join(attr);
        self.io.write_attr(&path, value)
    }

    /// Set the region size. The in-memory value is refreshed on success;
    /// zero is rejected (deletion goes through [`CxlContext::region_delete`]).
    pub fn region_set_size(&mut self, r: RegionRef, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::invalid(format!(
                "{}: cannot set size to zero",
                self.regions[r.0].devname()
            )));
        }
        self.region_write_attr(r, "size", &format!("{size:#x}\n"))?;
        self.regions[r.0].size = size;
        Ok(())
    }

    /// Set the region uuid.
    pub fn region_set_uuid(&mut self, r: RegionRef, uuid: uuid::Uuid) -> Result<()> {
        self.region_write_attr(r, "uuid", &uuid.hyphenated().to_string())?;
        self.regions[r.0].uuid = Some(uuid);
        Ok(())
    }

    /// Set the interleave way count.
    pub fn region_set_interleave_ways(&mut self, r: RegionRef, ways: u32) -> Result<()> {
        self.region_write_attr(r, "interleave_ways", &format!("{ways}\n"))?;
        self.regions[r.0].interleave_ways = ways;
        Ok(())
    }

    /// Set the interleave granularity.
    pub fn region_set_interleave_granularity(
        &mut self,
        r: RegionRef,
        granularity: u32,
    ) -> Result<()> {
        self.region_write_attr(r, "interleave_granularity", &format!("{granularity}\n"))?;
        self.regions[r.0].interleave_granularity = granularity;
        Ok(())
    }

    /// Validate a size/interleave request against this region's root
    /// decoder before touching sysfs.
    pub fn region_validate_config(
        &self,
        root_decoder: DecoderRef,
        size: u64,
        ways: u32,
        granularity: Option<u32>,
    ) -> Result<()> {
        crate::topology::validate_interleave(
            size,
            ways,
            granularity,
            self.decoders[root_decoder.0].interleave_granularity,
        )
    }

    /// Assign the endpoint decoder at an interleave position.
    pub fn region_set_target(
        &mut self,
        r: RegionRef,
        position: u32,
        decoder: DecoderRef,
    ) -> Result<()> {
        let name = self.decoders[decoder.0].devname().to_owned();
        self.region_write_attr(r, &format!("target{position}"), &name)
    }

    /// Clear the target at an interleave position. Active regions refuse.
    pub fn region_clear_target(&mut self, r: RegionRef, position: u32) -> Result<()> {
        if self.region_is_enabled(r) {
            return Err(Error::busy(format!(
                "{}: can't clear targets on an active region",
                self.regions[r.0].devname()
            )));
        }
        self.region_write_attr(r, &format!("target{position}"), "")
    }

    /// Clear every target position. Active regions refuse.
    pub fn region_clear_all_targets(&mut self, r: RegionRef) -> Result<()> {
        if self.region_is_enabled(r) {
            return Err(Error::busy(format!(
                "{}: can't clear targets on an active region",
                self.regions[r.0].devname()
            )));
        }
        let ways = self.regions[r.0].interleave_ways;
        if ways == 0 || ways == u32::MAX {
            return Err(Error::invalid(format!(
                "{}: interleave ways not set",
                self.regions[r.0].devname()
            )));
        }
        for position in 0..ways {
            self.region_write_attr(r, &format!("target{position}"), "")?;
        }
        Ok(())
    }

    /// The endpoint decoder at a target position, read fresh from sysfs.
    pub fn region_target_decoder(&mut self, r: RegionRef, position: u32) -> Result<DecoderRef> {
        let path = self.regions[r.0].dev_path.join(format!("target{position}"));
        let name = self.io.read_attr(&path)?;
        self.decoder_by_name(&name)
            .ok_or_else(|| Error::not_found(format!("decoder {name}")))
    }

    fn set_region_decode(&mut self, r: RegionRef, state: crate::topology::DecodeState) -> Result<()> {
        let value = match state {
            crate::topology::DecodeState::Committed => "1\n",
            _ => "0\n",
        };
        self.region_write_attr(r, "commit", value)?;
        self.regions[r.0].decode_state = state;
        Ok(())
    }

    /// Commit the region's decode programming to hardware.
    pub fn region_decode_commit(&mut self, r: RegionRef) -> Result<()> {
        self.set_region_decode(r, crate::topology::DecodeState::Committed)
    }

    /// Reset the region's decode programming.
    pub fn region_decode_reset(&mut self, r: RegionRef) -> Result<()> {
        self.set_region_decode(r, crate::topology::DecodeState::Reset)
    }

    // ========================================================================
    // Enable/disable + invalidation
    // ========================================================================

    /// Bind the mem driver to a memdev.
    pub fn memdev_enable(&mut self, m: MemdevRef) -> Result<()> {
        if self.memdev_is_enabled(m) {
            return Ok(());
        }
        let devname = self.memdevs[m.0].devname().to_owned();
        let _ = self.io.bind(&devname);
        if !self.memdev_is_enabled(m) {
            error!(memdev = devname, "failed to enable");
            return Err(rustix::io::Errno::NXIO.into());
        }
        debug!(memdev = devname, "enabled");
        Ok(())
    }

    /// Unbind a memdev's driver and invalidate its bus's port hierarchy:
    /// endpoint topology below the bus is indeterminate after the unbind.
    pub fn memdev_disable_invalidate(&mut self, m: MemdevRef) -> Result<()> {
        if !self.memdev_is_enabled(m) {
            return Ok(());
        }
        let devname = self.memdevs[m.0].devname().to_owned();
        let Some(bus) = self.memdev_bus(m) else {
            error!(memdev = devname, "failed to invalidate");
            return Err(rustix::io::Errno::NXIO.into());
        };
        let dev_path = self.memdevs[m.0].dev_path.clone();
        let _ = self.io.unbind(&dev_path);
        if self.memdev_is_enabled(m) {
            error!(memdev = devname, "failed to disable");
            return Err(Error::busy(format!("{devname}: failed to disable")));
        }
        self.bus_invalidate(bus);
        debug!(memdev = devname, "disabled");
        Ok(())
    }

    /// Bind the port driver.
    pub fn port_enable(&mut self, p: PortRef) -> Result<()> {
        if self.port_is_enabled(p) {
            return Ok(());
        }
        let devname = self.ports[p.0].devname().to_owned();
        let _ = self.io.bind(&devname);
        if !self.port_is_enabled(p) {
            error!(port = devname, "failed to enable");
            return Err(rustix::io::Errno::NXIO.into());
        }
        debug!(port = devname, "enabled");
        Ok(())
    }

    /// Unbind a port's driver and invalidate its bus's port hierarchy.
    ///
    /// Root ports cannot be disabled through this interface. Without
    /// `force`, a port still hosting an enabled memdev refuses.
    pub fn port_disable_invalidate(&mut self, p: PortRef, force: bool) -> Result<()> {
        let devname = self.ports[p.0].devname().to_owned();
        if self.ports[p.0].is_root() {
            return Err(Error::invalid(format!(
                "{devname}: cannot be disabled through this interface"
            )));
        }
        if !force {
            for m in self.memdevs() {
                if self.memdev_is_enabled(m) && self.port_hosts_memdev(p, m) {
                    return Err(Error::busy(format!(
                        "{devname}: hosts enabled memdev {}",
                        self.memdevs[m.0].devname()
                    )));
                }
            }
        }
        let Some(bus) = self.port_bus(p) else {
            error!(port = devname, "failed to invalidate");
            return Err(rustix::io::Errno::NXIO.into());
        };
        let dev_path = self.ports[p.0].dev_path.clone();
        let _ = self.io.unbind(&dev_path);
        if self.port_is_enabled(p) {
            error!(port = devname, "failed to disable");
            return Err(Error::busy(format!("{devname}: failed to disable")));
        }
        debug!(port = devname, "disabled");
        self.bus_invalidate(bus);
        Ok(())
    }

    /// Unbind the platform device under a bus and drop the whole bus from
    /// the context.
    pub fn bus_disable_invalidate(&mut self, b: BusRef) -> Result<()> {
        let root = self.buses[b.0].port;
        let uport = self.ports[root.0].uport_path.clone();
        self.io.unbind(&uport)?;
        self.buses[b.0].alive = false;
        self.kill_port_subtree(root);
        let _ = self.io.flush();
        Ok(())
    }

    /// Drop all ports below the bus root and clear every memdev's endpoint
    /// cache: something happened to make port state indeterminate, so the
    /// next traversal starts over.
    fn bus_invalidate(&mut self, b: BusRef) {
        for memdev in &mut self.memdevs {
            memdev.endpoint = None;
        }
        let root = self.buses[b.0].port;
        let children: Vec<PortRef> = self.ports[root.0].children.to_vec();
        for child in children {
            self.kill_port_subtree(child);
        }
        self.ports[root.0].children.clear();
        self.ports[root.0].ports_init = false;
        let _ = self.io.flush();
    }

    fn kill_port_subtree(&mut self, p: PortRef) {
        self.ports[p.0].alive = false;
        self.ports[p.0].memdev = None;
        self.ports[p.0].dports.clear();
        self.ports[p.0].dports_init = false;
        self.ports[p.0].ports_init = false;
        self.ports[p.0].endpoints_init = false;
        self.ports[p.0].decoders_init = false;
        let children: Vec<PortRef> = self.ports[p.0].children.drain(..).collect();
        let endpoints: Vec<PortRef> = self.ports[p.0].endpoints.drain(..).collect();
        let decoders: Vec<DecoderRef> = self.ports[p.0].decoders.drain(..).collect();
        for d in decoders {
            self.kill_decoder(d);
        }
        for ep in endpoints {
            self.kill_port_subtree(ep);
        }
        for child in children {
            self.kill_port_subtree(child);
        }
    }

    fn kill_decoder(&mut self, d: DecoderRef) {
        self.decoders[d.0].alive = false;
        self.decoders[d.0].regions_init = false;
        let mut regions: Vec<RegionRef> = self.decoders[d.0].regions.drain(..).collect();
        regions.extend(self.decoders[d.0].stale_regions.drain(..));
        for r in regions {
            self.regions[r.0].alive = false;
        }
    }
}

impl Default for CxlContext {
    fn default() -> Self {
        Self::new()
    }
}
