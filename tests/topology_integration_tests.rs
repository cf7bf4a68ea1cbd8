//! End-to-end topology tests over a synthetic sysfs tree.
//!
//! Each test builds a small device hierarchy in a tempdir (one bus, one
//! switch port, one endpoint, one memdev, a root decoder with two regions)
//! and drives the context through the same directory-scan and attribute
//! paths the live kernel tree would exercise. Driver bind state is
//! modelled as the presence of a `driver` directory, created and removed
//! by the bind/unbind hooks.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cxlctl::filter::{self, PortFilterMode};
use cxlctl::mbox::transport::{DeviceHandle, MboxTransport, QueryResult, SendCommand};
use cxlctl::topology::DecodeState;
use cxlctl::{AttrIo, CxlContext, Error, Mode, Sysfs};

// ============================================================================
// Backends
// ============================================================================

struct NoMailbox;

impl MboxTransport for NoMailbox {
    fn query(&self, _dev: &DeviceHandle) -> cxlctl::Result<QueryResult> {
        Err(Error::Unsupported("no mailbox in this fixture".into()))
    }

    fn send(&self, _dev: &DeviceHandle, _cmd: &mut SendCommand) -> cxlctl::Result<u32> {
        Err(Error::Unsupported("no mailbox in this fixture".into()))
    }
}

/// Sysfs over the fixture tree, with bind/unbind mapped onto creating and
/// removing `driver` directories the way the kernel would.
struct FakeIo {
    inner: Sysfs,
    devices: PathBuf,
}

impl FakeIo {
    fn new(base: &Path) -> Self {
        FakeIo {
            inner: Sysfs::rooted_at(base, &base.join("no-queue")),
            devices: base.join("devices"),
        }
    }

    fn find_dev(dir: &Path, devname: &str) -> Option<PathBuf> {
        for entry in fs::read_dir(dir).ok()? {
            let entry = entry.ok()?;
            // Never follow symlinks; uport links would cycle.
            if !entry.file_type().ok()?.is_dir() {
                continue;
            }
            let path = entry.path();
            if path.file_name().is_some_and(|n| n == devname) {
                return Some(path);
            }
            if let Some(found) = Self::find_dev(&path, devname) {
                return Some(found);
            }
        }
        None
    }
}

impl AttrIo for FakeIo {
    fn devices_dir(&self) -> &Path {
        self.inner.devices_dir()
    }

    fn read_attr(&self, path: &Path) -> cxlctl::Result<String> {
        self.inner.read_attr(path)
    }

    fn write_attr(&self, path: &Path, value: &str) -> cxlctl::Result<()> {
        self.inner.write_attr(path, value)
    }

    fn list_dir(&self, path: &Path) -> cxlctl::Result<Vec<String>> {
        self.inner.list_dir(path)
    }

    fn canonicalize(&self, path: &Path) -> Option<PathBuf> {
        self.inner.canonicalize(path)
    }

    fn entry_exists(&self, path: &Path) -> bool {
        self.inner.entry_exists(path)
    }

    fn bind(&self, devname: &str) -> cxlctl::Result<()> {
        let dev = Self::find_dev(&self.devices, devname)
            .ok_or_else(|| Error::NotFound(devname.to_owned()))?;
        fs::create_dir_all(dev.join("driver"))?;
        Ok(())
    }

    fn unbind(&self, dev_path: &Path) -> cxlctl::Result<()> {
        fs::remove_dir_all(dev_path.join("driver"))?;
        Ok(())
    }

    fn flush(&self) -> cxlctl::Result<()> {
        Ok(())
    }

    fn events_pending(&self) -> bool {
        false
    }
}

// ============================================================================
// Fixture tree
// ============================================================================

fn attr(dir: &Path, name: &str, value: &str) {
    fs::write(dir.join(name), value).unwrap();
}

struct Fixture {
    _dir: tempfile::TempDir,
    base: PathBuf,
}

impl Fixture {
    fn new() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        let devices = base.join("devices");

        fs::write(base.join("flush"), "").unwrap();
        fs::create_dir_all(base.join("phys/ACPI0017:00/driver")).unwrap();
        fs::create_dir_all(base.join("phys/hb0")).unwrap();

        let root = devices.join("root0");
        fs::create_dir_all(root.join("driver")).unwrap();
        symlink(base.join("phys/ACPI0017:00"), root.join("uport")).unwrap();

        // Root decoder: 64 KiB window, one committed region at the bottom
        // and one reset region in the middle.
        let dec = root.join("decoder0.0");
        fs::create_dir_all(&dec).unwrap();
        attr(&dec, "start", "0x0");
        attr(&dec, "size", "0x10000");
        attr(&dec, "cap_type3", "1");
        attr(&dec, "cap_ram", "1");
        attr(&dec, "cap_pmem", "1");
        attr(&dec, "interleave_granularity", "256");
        attr(&dec, "interleave_ways", "1");
        attr(&dec, "create_pmem_region", "region5");
        attr(&dec, "delete_region", "");

        let r0 = dec.join("region0");
        fs::create_dir_all(&r0).unwrap();
        attr(&r0, "resource", "0x0");
        attr(&r0, "size", "0x2000");
        attr(&r0, "uuid", "f1f91f37-5b38-45a3-95c3-1d0c4a7a0218");
        attr(&r0, "interleave_ways", "1");
        attr(&r0, "interleave_granularity", "256");
        attr(&r0, "commit", "1");
        attr(&r0, "mode", "pmem");
        attr(&r0, "target0", "decoder2.0");

        let r5 = dec.join("region5");
        fs::create_dir_all(&r5).unwrap();
        attr(&r5, "resource", "0x6000");
        attr(&r5, "size", "0x1000");
        attr(&r5, "uuid", "");
        attr(&r5, "interleave_ways", "1");
        attr(&r5, "interleave_granularity", "256");
        attr(&r5, "commit", "0");
        attr(&r5, "mode", "pmem");
        attr(&r5, "target0", "");

        // Switch port hosting one endpoint.
        let p1 = root.join("port1");
        fs::create_dir_all(p1.join("driver")).unwrap();
        symlink(base.join("phys/hb0"), p1.join("uport")).unwrap();
        let d1 = p1.join("decoder1.0");
        fs::create_dir_all(&d1).unwrap();
        attr(&d1, "start", "0x0");
        attr(&d1, "size", "0x10000");

        let ep = p1.join("endpoint2");
        fs::create_dir_all(ep.join("driver")).unwrap();
        let d2 = ep.join("decoder2.0");
        fs::create_dir_all(&d2).unwrap();
        attr(&d2, "dpa_resource", "0x0");
        attr(&d2, "dpa_size", "0x2000");
        attr(&d2, "mode", "pmem");
        attr(&d2, "region", "region0");

        // The memdev behind the endpoint.
        let mem = devices.join("mem0");
        fs::create_dir_all(mem.join("driver")).unwrap();
        fs::create_dir_all(mem.join("ram")).unwrap();
        fs::create_dir_all(mem.join("pmem")).unwrap();
        attr(&mem, "dev", "248:0");
        attr(&mem, "payload_max", "4096");
        attr(&mem.join("ram"), "size", "0x0");
        attr(&mem.join("pmem"), "size", "0x8000000");
        attr(&mem, "label_storage_size", "0x20000");
        attr(&mem, "serial", "0x5678");
        attr(&mem, "numa_node", "0");
        attr(&mem, "firmware_version", "1.0");
        symlink(&mem, ep.join("uport")).unwrap();

        Fixture { _dir: dir, base }
    }

    fn context(&self) -> CxlContext {
        let mut ctx =
            CxlContext::with_backends(Arc::new(FakeIo::new(&self.base)), Arc::new(NoMailbox));
        ctx.set_timeout_ms(1);
        ctx
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.base.join(rel)
    }
}

// ============================================================================
// Enumeration
// ============================================================================

#[test]
fn lazy_enumeration_is_stable() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let buses = ctx.buses();
    assert_eq!(buses.len(), 1);
    let b = buses[0];
    assert_eq!(ctx.buses(), vec![b]);
    assert_eq!(ctx.bus_provider(b), "ACPI.CXL");

    let root = ctx.bus(b).port();
    assert!(ctx.port(root).is_root());
    assert_eq!(ctx.port(root).depth(), 0);

    let children = ctx.child_ports(root);
    assert_eq!(children.len(), 1);
    let p1 = children[0];
    assert_eq!(ctx.port(p1).devname(), "port1");
    assert_eq!(ctx.port(p1).depth(), 1);
    // Repeat scans hand back the same entity.
    assert_eq!(ctx.child_ports(root), vec![p1]);

    let eps = ctx.endpoints(p1);
    assert_eq!(eps.len(), 1);
    assert_eq!(ctx.port(eps[0]).devname(), "endpoint2");
    assert_eq!(ctx.port(eps[0]).host(), "mem0");

    let memdevs = ctx.memdevs();
    assert_eq!(memdevs.len(), 1);
    let m = memdevs[0];
    assert_eq!(ctx.memdev(m).devname(), "mem0");
    assert_eq!(ctx.memdev(m).payload_max(), 4096);
    assert_eq!(ctx.memdev(m).serial(), 0x5678);
    assert_eq!(ctx.memdev(m).pmem_size(), 0x0800_0000);

    assert_eq!(ctx.all_ports(root), vec![p1]);
}

#[test]
fn root_decoder_regions_sorted_with_free_extent() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let root = ctx.bus(b).port();
    let decoders = ctx.decoders(root);
    assert_eq!(decoders.len(), 1);
    let d = decoders[0];
    assert_eq!(ctx.decoder(d).devname(), "decoder0.0");

    let regions = ctx.regions(d);
    assert_eq!(regions.len(), 2);
    assert_eq!(ctx.region(regions[0]).devname(), "region0");
    assert_eq!(ctx.region(regions[1]).devname(), "region5");
    assert!(ctx.region(regions[0]).is_committed());
    assert_eq!(ctx.region(regions[1]).decode_state(), DecodeState::Reset);
    assert!(ctx.region(regions[0]).uuid().is_some());
    assert!(ctx.region(regions[1]).uuid().is_none());

    // Window 0x0..0x10000 with only region0 (0x0..0x2000) occupying
    // space: region5 is reset and does not count.
    assert_eq!(ctx.decoder(d).max_available_extent(), 0xE000);
}

#[test]
fn endpoint_memdev_pairing_is_bidirectional() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let m = ctx.memdevs()[0];
    let ep = ctx.memdev_endpoint(m).unwrap();
    assert_eq!(ctx.port(ep).devname(), "endpoint2");
    assert_eq!(ctx.endpoint_memdev(ep), Some(m));

    let b = ctx.buses()[0];
    assert_eq!(ctx.memdev_bus(m), Some(b));

    let p1 = ctx.child_ports(ctx.bus(b).port())[0];
    assert!(ctx.port_hosts_memdev(p1, m));
    assert!(ctx.port_hosts_memdev(ep, m));
}

#[test]
fn region_mappings_resolve_endpoint_decoders() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let d = ctx.decoders(ctx.bus(b).port())[0];
    let r0 = ctx.regions(d)[0];

    let mappings = ctx.mappings(r0);
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].position(), 0);
    assert_eq!(ctx.decoder(mappings[0].decoder()).devname(), "decoder2.0");

    let m = ctx.memdevs()[0];
    assert!(filter::region_maps_memdev(&mut ctx, r0, m));
    assert!(filter::decoder_maps_memdev(&mut ctx, mappings[0].decoder(), m));
}

#[test]
fn decoder_region_attribute_walks_to_the_region() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let root = ctx.bus(b).port();
    let p1 = ctx.child_ports(root)[0];
    let ep = ctx.endpoints(p1)[0];
    let ep_dec = ctx.decoders(ep)[0];
    let sw_dec = ctx.decoders(p1)[0];

    let root_dec = ctx.decoders(root)[0];
    let r0 = ctx.regions(root_dec)[0];
    assert_eq!(ctx.decoder_region(ep_dec), Some(r0));
    // The switch decoder has no region attribute.
    assert_eq!(ctx.decoder_region(sw_dec), None);
}

// ============================================================================
// Filters
// ============================================================================

#[test]
fn filters_cover_every_listing_axis() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let root = ctx.bus(b).port();
    let p1 = ctx.child_ports(root)[0];
    let ep = ctx.endpoints(p1)[0];
    let m = ctx.memdevs()[0];
    let d = ctx.decoders(root)[0];
    let r0 = ctx.regions(d)[0];

    assert!(filter::bus_matches(&ctx, b, None));
    assert!(filter::bus_matches(&ctx, b, Some("ACPI.CXL")));
    assert!(filter::bus_matches(&ctx, b, Some("root0")));
    assert!(!filter::bus_matches(&ctx, b, Some("pci0000:34")));

    assert!(filter::port_matches(&ctx, p1, Some("port1"), PortFilterMode::Single));
    // The endpoint itself is not port1, but port1 is its ancestor.
    assert!(!filter::port_matches(&ctx, ep, Some("port1"), PortFilterMode::Single));
    assert!(filter::port_matches(&ctx, ep, Some("port1"), PortFilterMode::Ancestry));

    assert!(filter::memdev_matches(&ctx, m, Some("mem0"), None));
    assert!(!filter::memdev_matches(&ctx, m, Some("mem3,mem7"), None));
    assert!(filter::memdev_matches(&ctx, m, Some("mem0"), Some("0x5678")));
    assert!(filter::memdev_matches(&ctx, m, None, Some("22136")));
    assert!(!filter::memdev_matches(&ctx, m, Some("mem0"), Some("0x9999")));

    assert!(filter::decoder_matches(&ctx, d, Some("0.0")));
    assert!(filter::decoder_matches(&ctx, d, Some("decoder0.0")));
    assert!(!filter::decoder_matches(&ctx, d, Some("1.0")));

    assert!(filter::region_matches(&ctx, r0, Some("region0")));
    assert!(filter::region_matches(&ctx, r0, Some("0")));

    assert!(filter::memdev_matches_port(&mut ctx, m, Some("port1")));
    assert!(!filter::memdev_matches_port(&mut ctx, m, Some("port9")));
    assert!(filter::memdev_matches_bus(&mut ctx, m, Some("ACPI.CXL")));
    assert!(filter::port_matches_bus(&ctx, p1, Some("root0")));
    assert!(filter::decoder_matches_port(&ctx, d, Some("root0")));
    assert!(filter::region_matches_decoder(&ctx, r0, Some("0.0")));
}

#[test]
fn host_and_kind_tokens_widen_the_vocabulary() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let root = ctx.bus(b).port();
    let p1 = ctx.child_ports(root)[0];
    let ep = ctx.endpoints(p1)[0];
    let m = ctx.memdevs()[0];
    let root_dec = ctx.decoders(root)[0];
    let ep_dec = ctx.decoders(ep)[0];

    // Host device names match ports, endpoints, and memdevs.
    assert_eq!(ctx.port(ep).host(), "mem0");
    assert!(filter::port_matches(&ctx, ep, Some("mem0"), PortFilterMode::Single));
    assert!(filter::port_matches(&ctx, p1, Some("hb0"), PortFilterMode::Single));
    assert!(!filter::port_matches(&ctx, p1, Some("mem0"), PortFilterMode::Single));
    let host = ctx.memdev(m).host().to_owned();
    assert!(filter::memdev_matches(&ctx, m, Some(&host), None));

    // Kind keywords select ports and decoders by hierarchy level.
    assert!(filter::port_matches(&ctx, root, Some("root"), PortFilterMode::Single));
    assert!(filter::port_matches(&ctx, p1, Some("switch"), PortFilterMode::Single));
    assert!(filter::port_matches(&ctx, ep, Some("endpoint"), PortFilterMode::Single));
    assert!(!filter::port_matches(&ctx, p1, Some("endpoint"), PortFilterMode::Single));
    // Ancestry mode lets a keyword hit anywhere up the chain.
    assert!(filter::port_matches(&ctx, ep, Some("switch"), PortFilterMode::Ancestry));

    assert!(filter::decoder_matches(&ctx, root_dec, Some("root")));
    assert!(filter::decoder_matches(&ctx, ep_dec, Some("endpoint")));
    assert!(!filter::decoder_matches(&ctx, ep_dec, Some("root")));
}

// ============================================================================
// Region lifecycle
// ============================================================================

#[test]
fn create_region_displaces_reused_ids() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let d = ctx.decoders(ctx.bus(b).port())[0];
    let before = ctx.regions(d);
    assert_eq!(before.len(), 2);

    let created = ctx.create_region(d, Mode::Pmem).unwrap();
    assert_eq!(ctx.region(created).devname(), "region5");
    assert!(!before.contains(&created));

    // The rescan displaced the prior entities; handles to them still
    // resolve, they are just off the live list.
    let stale = ctx.stale_regions(d).to_vec();
    assert_eq!(stale.len(), 2);
    for old in before {
        assert!(stale.contains(&old));
        let _ = ctx.region(old).devname();
    }
    assert_eq!(ctx.regions(d).len(), 2);
}

#[test]
fn create_region_rejects_bad_mode() {
    let fx = Fixture::new();
    let mut ctx = fx.context();
    let b = ctx.buses()[0];
    let d = ctx.decoders(ctx.bus(b).port())[0];
    assert!(matches!(ctx.create_region(d, Mode::None), Err(Error::InvalidArgument(_))));
}

#[test]
fn region_enable_refreshes_resource() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let d = ctx.decoders(ctx.bus(b).port())[0];
    let r5 = ctx.regions(d)[1];
    assert!(!ctx.region_is_enabled(r5));

    ctx.region_enable(r5).unwrap();
    assert!(ctx.region_is_enabled(r5));
    assert_eq!(ctx.region(r5).resource(), 0x6000);

    // Targets may not be cleared while the region is active.
    assert!(matches!(ctx.region_clear_target(r5, 0), Err(Error::Busy(_))));
    assert!(matches!(ctx.region_clear_all_targets(r5), Err(Error::Busy(_))));

    ctx.region_disable(r5).unwrap();
    assert!(!ctx.region_is_enabled(r5));
}

#[test]
fn region_setters_round_trip() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let root = ctx.bus(b).port();
    let d = ctx.decoders(root)[0];
    let r5 = ctx.regions(d)[1];

    assert!(matches!(ctx.region_set_size(r5, 0), Err(Error::InvalidArgument(_))));
    ctx.region_set_size(r5, 0x4000).unwrap();
    assert_eq!(ctx.region(r5).size(), 0x4000);
    assert_eq!(
        fs::read_to_string(fx.path("devices/root0/decoder0.0/region5/size")).unwrap(),
        "0x4000\n"
    );

    let uuid = uuid::Uuid::parse_str("5f2f8c23-6a10-4bd6-a7b1-d53a6ab09ab9").unwrap();
    ctx.region_set_uuid(r5, uuid).unwrap();
    assert_eq!(ctx.region(r5).uuid(), Some(uuid));

    ctx.region_set_interleave_ways(r5, 1).unwrap();
    ctx.region_set_interleave_granularity(r5, 256).unwrap();
    assert_eq!(ctx.region(r5).interleave_ways(), 1);
    assert_eq!(ctx.region(r5).interleave_granularity(), 256);

    // Size must divide across the ways; granularity must match the root.
    assert!(ctx.region_validate_config(d, 0x4000, 1, Some(512)).is_ok());
    assert!(ctx.region_validate_config(d, 0x4000, 2, Some(512)).is_err());
    assert!(ctx.region_validate_config(d, 0x4001, 2, None).is_err());

    let ep_dec = {
        let p1 = ctx.child_ports(root)[0];
        let ep = ctx.endpoints(p1)[0];
        ctx.decoders(ep)[0]
    };
    ctx.region_set_target(r5, 0, ep_dec).unwrap();
    assert_eq!(ctx.region_target_decoder(r5, 0).unwrap(), ep_dec);
    ctx.region_clear_target(r5, 0).unwrap();

    ctx.region_decode_commit(r5).unwrap();
    assert!(ctx.region(r5).is_committed());
    ctx.region_decode_reset(r5).unwrap();
    assert_eq!(ctx.region(r5).decode_state(), DecodeState::Reset);
}

#[test]
fn region_delete_requires_disabled() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let d = ctx.decoders(ctx.bus(b).port())[0];
    let regions = ctx.regions(d);
    let r0 = regions[0];
    let r5 = regions[1];

    ctx.region_enable(r5).unwrap();
    assert!(matches!(ctx.region_delete(r5), Err(Error::Busy(_))));

    ctx.region_delete(r0).unwrap();
    // Model the kernel dropping the deleted device node.
    fs::remove_dir_all(fx.path("devices/root0/decoder0.0/region0")).unwrap();
    let after: Vec<String> = ctx
        .regions(d)
        .into_iter()
        .map(|r| ctx.region(r).devname().to_owned())
        .collect();
    assert!(!after.contains(&"region0".to_owned()));
}

// ============================================================================
// Endpoint decoder programming
// ============================================================================

#[test]
fn endpoint_decoder_programming_gates() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let root = ctx.bus(b).port();
    let root_dec = ctx.decoders(root)[0];
    let p1 = ctx.child_ports(root)[0];
    let ep = ctx.endpoints(p1)[0];
    let ep_dec = ctx.decoders(ep)[0];

    ctx.decoder_set_dpa_size(ep_dec, 0x1000).unwrap();
    assert_eq!(ctx.decoder(ep_dec).dpa_size(), Some(0x1000));
    ctx.decoder_set_mode(ep_dec, Mode::Ram).unwrap();
    assert_eq!(ctx.decoder(ep_dec).mode(), Some(Mode::Ram));

    assert!(matches!(
        ctx.decoder_set_dpa_size(root_dec, 0x1000),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        ctx.decoder_set_mode(ep_dec, Mode::Mixed),
        Err(Error::InvalidArgument(_))
    ));

    let m = ctx.memdevs()[0];
    assert_eq!(ctx.decoder_memdev(ep_dec), Some(m));
    assert_eq!(ctx.decoder_memdev(root_dec), None);
}

// ============================================================================
// Invalidation
// ============================================================================

#[test]
fn memdev_disable_invalidates_the_port_hierarchy() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let root = ctx.bus(b).port();
    let m = ctx.memdevs()[0];
    let old_p1 = ctx.child_ports(root)[0];
    let old_ep = ctx.memdev_endpoint(m).unwrap();

    ctx.memdev_disable_invalidate(m).unwrap();
    assert!(!ctx.memdev_is_enabled(m));
    // Disabled memdevs resolve no endpoint.
    assert_eq!(ctx.memdev_endpoint(m), None);

    // The hierarchy below the bus was rebuilt: fresh handles, and the old
    // ones are off every enumeration.
    let new_p1 = ctx.child_ports(root)[0];
    assert_ne!(new_p1, old_p1);

    ctx.memdev_enable(m).unwrap();
    let new_ep = ctx.memdev_endpoint(m).unwrap();
    assert_ne!(new_ep, old_ep);
    assert_eq!(ctx.port(new_ep).devname(), "endpoint2");
}

#[test]
fn port_disable_refuses_while_hosting_enabled_memdevs() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let root = ctx.bus(b).port();
    let p1 = ctx.child_ports(root)[0];

    assert!(matches!(
        ctx.port_disable_invalidate(root, false),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(ctx.port_disable_invalidate(p1, false), Err(Error::Busy(_))));

    // Force skips the hosted-memdev check.
    ctx.port_disable_invalidate(p1, true).unwrap();
    let new_p1 = ctx.child_ports(root)[0];
    assert_ne!(new_p1, p1);
}

#[test]
fn bus_disable_drops_the_bus() {
    let fx = Fixture::new();
    let mut ctx = fx.context();

    let b = ctx.buses()[0];
    let m = ctx.memdevs()[0];
    ctx.bus_disable_invalidate(b).unwrap();

    assert!(ctx.buses().is_empty());
    // Memdevs outlive their bus; only the port hierarchy died.
    assert_eq!(ctx.memdevs(), vec![m]);
}
