//! Regions: interleaved address ranges bound to a root decoder.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sysfs::{devname_of, AttrIo};
use crate::topology::{attr_u32_or, attr_u64_or, DecoderRef, Mode};

/// Whether a region's decode programming has been committed to hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// The `commit` attribute was unreadable.
    Unknown,
    /// Programmed but not active.
    Reset,
    /// Active in hardware.
    Committed,
}

/// Association between a region and one of its constituent endpoint
/// decoders, by interleave position.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub(crate) decoder: DecoderRef,
    pub(crate) position: u32,
}

impl Mapping {
    /// The endpoint decoder at this position.
    pub fn decoder(&self) -> DecoderRef {
        self.decoder
    }

    /// Interleave position (0..ways).
    pub fn position(&self) -> u32 {
        self.position
    }
}

/// An interleaved address range owned by a root decoder.
#[derive(Debug)]
pub struct Region {
    pub(crate) alive: bool,
    pub(crate) id: u32,
    pub(crate) dev_path: PathBuf,
    pub(crate) decoder: DecoderRef,

    pub(crate) start: u64,
    pub(crate) size: u64,
    pub(crate) uuid: Option<Uuid>,
    pub(crate) interleave_ways: u32,
    pub(crate) interleave_granularity: u32,
    pub(crate) decode_state: DecodeState,
    pub(crate) mode: Mode,

    pub(crate) mappings: Vec<Mapping>,
    pub(crate) mappings_init: bool,
}

impl Region {
    pub(crate) fn from_sysfs(
        io: &dyn AttrIo,
        id: u32,
        dev_path: &Path,
        decoder: DecoderRef,
    ) -> Result<Region> {
        let size = attr_u64_or(io, &dev_path.join("size"), u64::MAX);
        let start = attr_u64_or(io, &dev_path.join("resource"), u64::MAX);

        // A region with an unreadable or malformed uuid is skipped whole;
        // an empty value just means no uuid has been assigned yet.
        let uuid_raw = io.read_attr(&dev_path.join("uuid"))?;
        let uuid = if uuid_raw.is_empty() {
            None
        } else {
            Some(
                Uuid::parse_str(&uuid_raw)
                    .map_err(|_| Error::Parse(format!("{}: bad uuid {uuid_raw:?}", dev_path.display())))?,
            )
        };

        let interleave_granularity =
            attr_u32_or(io, &dev_path.join("interleave_granularity"), u32::MAX);
        let interleave_ways = attr_u32_or(io, &dev_path.join("interleave_ways"), u32::MAX);
        let decode_state = match io.read_attr(&dev_path.join("commit")) {
            Ok(s) if s.trim() == "0" => DecodeState::Reset,
            Ok(_) => DecodeState::Committed,
            Err(_) => DecodeState::Unknown,
        };
        let mode = io
            .read_attr(&dev_path.join("mode"))
            .map(|s| Mode::from_attr(&s))
            .unwrap_or(Mode::None);

        Ok(Region {
            alive: true,
            id,
            dev_path: dev_path.to_path_buf(),
            decoder,
            start,
            size,
            uuid,
            interleave_ways,
            interleave_granularity,
            decode_state,
            mode,
            mappings: Vec::new(),
            mappings_init: false,
        })
    }

    /// Kernel id of this region (the `N` in `regionN`).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Device name (e.g. `region0`).
    pub fn devname(&self) -> &str {
        devname_of(&self.dev_path)
    }

    /// Root decoder this region is bound to.
    pub fn decoder(&self) -> DecoderRef {
        self.decoder
    }

    /// Host physical address base, `u64::MAX` when not yet assigned.
    pub fn resource(&self) -> u64 {
        self.start
    }

    /// Region size in bytes, `u64::MAX` when unknown.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Region uuid, if one has been assigned.
    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn interleave_ways(&self) -> u32 {
        self.interleave_ways
    }

    pub fn interleave_granularity(&self) -> u32 {
        self.interleave_granularity
    }

    /// Decode commitment state as of the last enumeration or setter call.
    pub fn decode_state(&self) -> DecodeState {
        self.decode_state
    }

    pub fn is_committed(&self) -> bool {
        self.decode_state == DecodeState::Committed
    }

    /// Operating mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether this region occupies address space: nonzero-sized and not in
    /// `Reset` state.
    pub(crate) fn is_configured(&self) -> bool {
        self.size != 0 && self.decode_state != DecodeState::Reset
    }

    /// Whether the region driver is currently bound. Queried live.
    pub fn is_enabled(&self, io: &dyn AttrIo) -> bool {
        io.entry_exists(&self.dev_path.join("driver"))
    }

    /// Sysfs path of this region's device directory.
    pub fn path(&self) -> &Path {
        &self.dev_path
    }
}

/// Validate a region size/interleave request against its root decoder.
///
/// The size must divide evenly across the interleave ways, and a requested
/// granularity must equal the root decoder's own granularity unless the
/// region is single-way. Mismatches are hard errors, never auto-corrected.
pub fn validate_interleave(
    size: u64,
    ways: u32,
    granularity: Option<u32>,
    root_granularity: u32,
) -> Result<()> {
    if ways == 0 {
        return Err(Error::invalid("interleave ways must be nonzero"));
    }
    if size % ways as u64 != 0 {
        return Err(Error::invalid(format!(
            "size {size:#x} is not evenly divisible by {ways} ways"
        )));
    }
    if let Some(g) = granularity {
        if ways > 1 && g != root_granularity {
            return Err(Error::invalid(format!(
                "granularity {g} conflicts with root decoder granularity {root_granularity}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_must_divide_by_ways() {
        // 100 bytes across 3 ways leaves a remainder.
        assert!(matches!(
            validate_interleave(100, 3, None, 256),
            Err(Error::InvalidArgument(_))
        ));
        assert!(validate_interleave(96, 3, None, 256).is_ok());
    }

    #[test]
    fn granularity_must_match_root_unless_single_way() {
        assert!(validate_interleave(0x1000, 2, Some(512), 256).is_err());
        assert!(validate_interleave(0x1000, 2, Some(256), 256).is_ok());
        // A single way may pick any granularity.
        assert!(validate_interleave(0x1000, 1, Some(512), 256).is_ok());
        // No requested granularity, nothing to check.
        assert!(validate_interleave(0x1000, 2, None, 256).is_ok());
    }

    #[test]
    fn zero_ways_rejected() {
        assert!(validate_interleave(0x1000, 0, None, 256).is_err());
    }
}
