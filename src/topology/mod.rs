//! In-memory model of the CXL device topology.
//!
//! Entities form a tree: Bus → root Port → switch Ports → Endpoints, with
//! Decoders hanging off every port and Regions off root decoders. All
//! entities live in flat arenas owned by [`CxlContext`](crate::CxlContext);
//! cross-references between them are the typed index handles defined here.
//!
//! Handles stay valid for the life of the context. Invalidation (driver
//! unbind, bus teardown) marks arena slots dead rather than removing them;
//! a dead handle resolves to an entity whose accessors still work on the
//! last-known attribute snapshot, but every enumeration skips it.

pub mod bus;
pub mod decoder;
pub mod memdev;
pub mod port;
pub mod region;

pub use bus::Bus;
pub use decoder::{Decoder, DecoderFlags, Target, TargetKind};
pub use memdev::{partition_align, size_to_volatile, Memdev, PartitionType, Pmem};
pub use port::{Dport, Port, PortKind};
pub use region::{validate_interleave, DecodeState, Mapping, Region};

use crate::error::{Error, Result};

macro_rules! entity_ref {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) usize);
    };
}

entity_ref!(
    /// Handle to a [`Bus`] in the context arena.
    BusRef
);
entity_ref!(
    /// Handle to a [`Port`] (root, switch, or endpoint) in the context arena.
    PortRef
);
entity_ref!(
    /// Handle to a [`Decoder`] in the context arena.
    DecoderRef
);
entity_ref!(
    /// Handle to a [`Region`] in the context arena.
    RegionRef
);
entity_ref!(
    /// Handle to a [`Memdev`] in the context arena.
    MemdevRef
);

/// Decoder/region operating mode, as exposed by the kernel `mode` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// No mode established.
    #[default]
    None,
    /// Both volatile and persistent capacity (not configurable from here).
    Mixed,
    /// Persistent memory.
    Pmem,
    /// Volatile memory.
    Ram,
}

impl Mode {
    pub(crate) fn from_attr(s: &str) -> Mode {
        match s {
            "ram" => Mode::Ram,
            "pmem" => Mode::Pmem,
            "mixed" => Mode::Mixed,
            _ => Mode::None,
        }
    }

    /// Kernel attribute spelling for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::None => "none",
            Mode::Mixed => "mixed",
            Mode::Pmem => "pmem",
            Mode::Ram => "ram",
        }
    }
}

// ============================================================================
// Attribute parsing
// ============================================================================

/// Parse a numeric sysfs attribute, accepting the kernel's `0x` hex form.
pub(crate) fn parse_u64(s: &str) -> Result<u64> {
    let t = s.trim();
    let parsed = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        t.parse::<u64>()
    };
    parsed.map_err(|_| Error::Parse(format!("bad numeric attribute: {t:?}")))
}

pub(crate) fn parse_u32(s: &str) -> Result<u32> {
    let v = parse_u64(s)?;
    u32::try_from(v).map_err(|_| Error::Parse(format!("attribute out of range: {s:?}")))
}

/// Read-and-parse with a sentinel on any failure. Missing attributes are a
/// routine condition (older kernels, unconfigured objects), not an error.
pub(crate) fn attr_u64_or(
    io: &dyn crate::sysfs::AttrIo,
    path: &std::path::Path,
    fallback: u64,
) -> u64 {
    io.read_attr(path)
        .ok()
        .and_then(|s| parse_u64(&s).ok())
        .unwrap_or(fallback)
}

pub(crate) fn attr_u32_or(
    io: &dyn crate::sysfs::AttrIo,
    path: &std::path::Path,
    fallback: u32,
) -> u32 {
    io.read_attr(path)
        .ok()
        .and_then(|s| parse_u32(&s).ok())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_attr_forms() {
        assert_eq!(parse_u64("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_u64("4096").unwrap(), 4096);
        assert_eq!(parse_u64(" 0X2000 ").unwrap(), 0x2000);
        assert!(parse_u64("").is_err());
        assert!(parse_u64("pmem").is_err());
    }

    #[test]
    fn mode_attr_round_trip() {
        for m in [Mode::None, Mode::Mixed, Mode::Pmem, Mode::Ram] {
            assert_eq!(Mode::from_attr(m.as_str()), m);
        }
        assert_eq!(Mode::from_attr("garbage"), Mode::None);
    }
}
