//! Identifier filtering for listing and bulk operations.
//!
//! A filter string is a separator-delimited list of tokens; an entity
//! passes when any token matches it. Tokens may be bare ids (`3`), device
//! names (`mem3`, `port2`, `decoder2.1`, `region0`, `root4`), host device
//! names (the physical device behind a port, endpoint, or memdev), the
//! kind keywords `root`/`switch`/`endpoint`, or the keyword `all`. An
//! absent filter passes everything.
//!
//! Cross-entity filters ("memdevs under this port", "regions on this
//! decoder") delegate to the underlying entity filter after walking the
//! topology, so one identifier vocabulary covers every listing axis.

use crate::context::CxlContext;
use crate::topology::{parse_u64, BusRef, DecoderRef, MemdevRef, PortKind, PortRef, RegionRef};

/// How a port filter treats the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFilterMode {
    /// Match the named port only.
    Single,
    /// Match the named port or any port below it: a port passes when it or
    /// one of its ancestors matches.
    Ancestry,
}

/// A comma- or space-separated identifier list. Space wins when both
/// separators appear, so `"mem0, mem1"` still splits on the spaces.
fn which_sep(ident: &str) -> char {
    if ident.contains(' ') {
        ' '
    } else {
        ','
    }
}

fn tokens(ident: &str) -> impl Iterator<Item = &str> {
    ident
        .split(which_sep(ident))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn token_matches(token: &str, id: u32, devname: &str) -> bool {
    if token == "all" {
        return true;
    }
    if let Ok(n) = token.parse::<u32>() {
        if n == id {
            return true;
        }
    }
    token == devname
}

/// The literal kind keyword matching ports (and decoders) of that kind.
fn kind_token(kind: PortKind) -> &'static str {
    match kind {
        PortKind::Root => "root",
        PortKind::Switch => "switch",
        PortKind::Endpoint => "endpoint",
    }
}

/// `decoderN.M` tokens also match as a bare `N.M` pair against the port
/// and decoder ids.
fn decoder_token_matches(token: &str, port_id: u32, decoder_id: u32, devname: &str) -> bool {
    if token == "all" {
        return true;
    }
    if let Some((p, d)) = token.split_once('.') {
        if let (Ok(p), Ok(d)) = (p.parse::<u32>(), d.parse::<u32>()) {
            if p == port_id && d == decoder_id {
                return true;
            }
        }
    }
    token == devname
}

// ============================================================================
// Per-entity filters
// ============================================================================

/// Match a bus by id, device name, or provider name.
pub fn bus_matches(ctx: &CxlContext, b: BusRef, ident: Option<&str>) -> bool {
    let Some(ident) = ident else {
        return true;
    };
    let port = ctx.port(ctx.bus(b).port());
    let provider = ctx.bus_provider(b);
    tokens(ident)
        .any(|t| token_matches(t, port.id(), port.devname()) || t == provider)
}

/// Match a port (or endpoint) by id, device name, host device name, or
/// kind keyword, optionally accepting matches anywhere on its ancestor
/// chain.
pub fn port_matches(
    ctx: &CxlContext,
    p: PortRef,
    ident: Option<&str>,
    mode: PortFilterMode,
) -> bool {
    let Some(ident) = ident else {
        return true;
    };
    let mut cur = Some(p);
    while let Some(q) = cur {
        let port = ctx.port(q);
        if tokens(ident).any(|t| {
            token_matches(t, port.id(), port.devname())
                || t == port.host()
                || t == kind_token(port.kind())
        }) {
            return true;
        }
        if mode == PortFilterMode::Single {
            return false;
        }
        cur = port.parent();
    }
    false
}

/// Match a memdev by id, device name, or host device name, ANDed with an
/// optional serial number list. Serial tokens accept decimal or `0x` hex;
/// a token that parses as neither matches nothing.
pub fn memdev_matches(
    ctx: &CxlContext,
    m: MemdevRef,
    ident: Option<&str>,
    serials: Option<&str>,
) -> bool {
    let memdev = ctx.memdev(m);
    if let Some(serials) = serials {
        let serial = memdev.serial();
        if !tokens(serials).any(|t| parse_u64(t).is_ok_and(|v| v == serial)) {
            return false;
        }
    }
    let Some(ident) = ident else {
        return true;
    };
    tokens(ident).any(|t| token_matches(t, memdev.id(), memdev.devname()) || t == memdev.host())
}

/// Match a decoder by `port.decoder` id pair, device name, or the kind
/// keyword of its port.
pub fn decoder_matches(ctx: &CxlContext, d: DecoderRef, ident: Option<&str>) -> bool {
    let Some(ident) = ident else {
        return true;
    };
    let decoder = ctx.decoder(d);
    let port = ctx.port(decoder.port());
    tokens(ident).any(|t| {
        decoder_token_matches(t, port.id(), decoder.id(), decoder.devname())
            || t == kind_token(port.kind())
    })
}

/// Match a region by id or device name.
pub fn region_matches(ctx: &CxlContext, r: RegionRef, ident: Option<&str>) -> bool {
    let Some(ident) = ident else {
        return true;
    };
    let region = ctx.region(r);
    tokens(ident).any(|t| token_matches(t, region.id(), region.devname()))
}

// ============================================================================
// Cross-entity delegation
// ============================================================================

/// Keep ports whose bus passes the bus filter.
pub fn port_matches_bus(ctx: &CxlContext, p: PortRef, bus_ident: Option<&str>) -> bool {
    bus_matches(ctx, ctx.port(p).bus(), bus_ident)
}

/// Keep decoders whose port (or an ancestor of it) passes the port filter.
pub fn decoder_matches_port(ctx: &CxlContext, d: DecoderRef, port_ident: Option<&str>) -> bool {
    port_matches(ctx, ctx.decoder(d).port(), port_ident, PortFilterMode::Ancestry)
}

/// Keep memdevs whose endpoint sits under a port passing the port filter.
/// A memdev with no resolvable endpoint fails any concrete port filter.
pub fn memdev_matches_port(
    ctx: &mut CxlContext,
    m: MemdevRef,
    port_ident: Option<&str>,
) -> bool {
    let Some(ident) = port_ident else {
        return true;
    };
    let Some(ep) = ctx.memdev_endpoint(m) else {
        return false;
    };
    port_matches(ctx, ep, Some(ident), PortFilterMode::Ancestry)
}

/// Keep memdevs whose bus passes the bus filter.
pub fn memdev_matches_bus(ctx: &mut CxlContext, m: MemdevRef, bus_ident: Option<&str>) -> bool {
    let Some(ident) = bus_ident else {
        return true;
    };
    let Some(b) = ctx.memdev_bus(m) else {
        return false;
    };
    bus_matches(ctx, b, Some(ident))
}

/// Keep regions whose root decoder passes the decoder filter.
pub fn region_matches_decoder(
    ctx: &CxlContext,
    r: RegionRef,
    decoder_ident: Option<&str>,
) -> bool {
    decoder_matches(ctx, ctx.region(r).decoder(), decoder_ident)
}

/// Whether a decoder is on the decode path of a memdev: an endpoint
/// decoder belongs to the memdev's own endpoint; root and switch decoders
/// qualify through a target routing to the memdev's host device.
pub fn decoder_maps_memdev(ctx: &mut CxlContext, d: DecoderRef, m: MemdevRef) -> bool {
    let p = ctx.decoder(d).port();
    match ctx.port(p).kind() {
        PortKind::Endpoint => ctx.endpoint_memdev(p) == Some(m),
        _ => ctx.decoder_target_by_memdev(d, m).is_some(),
    }
}

/// Whether any of a region's mappings decode for the memdev.
pub fn region_maps_memdev(ctx: &mut CxlContext, r: RegionRef, m: MemdevRef) -> bool {
    let mappings = ctx.mappings(r);
    mappings
        .iter()
        .any(|mapping| decoder_maps_memdev(ctx, mapping.decoder(), m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separator_preference() {
        assert_eq!(which_sep("mem0,mem1"), ',');
        assert_eq!(which_sep("mem0 mem1"), ' ');
        // Space wins over comma when both are present.
        assert_eq!(which_sep("mem0, mem1"), ' ');
        assert_eq!(which_sep("mem0"), ',');
    }

    #[test]
    fn token_forms() {
        assert!(token_matches("all", 9, "mem9"));
        assert!(token_matches("3", 3, "mem3"));
        assert!(token_matches("mem3", 3, "mem3"));
        assert!(!token_matches("mem3", 5, "mem5"));
        assert!(!token_matches("7", 3, "mem3"));
    }

    #[test]
    fn id_list_matches_member_only() {
        let hit = |id: u32, name: &str| tokens("mem3,mem7").any(|t| token_matches(t, id, name));
        assert!(hit(3, "mem3"));
        assert!(hit(7, "mem7"));
        assert!(!hit(5, "mem5"));
    }

    #[test]
    fn decoder_pair_tokens() {
        assert!(decoder_token_matches("2.1", 2, 1, "decoder2.1"));
        assert!(decoder_token_matches("decoder2.1", 2, 1, "decoder2.1"));
        assert!(!decoder_token_matches("2.1", 2, 3, "decoder2.3"));
        assert!(!decoder_token_matches("1.2", 2, 1, "decoder2.1"));
        assert!(decoder_token_matches("all", 2, 1, "decoder2.1"));
    }

    #[test]
    fn serial_tokens_parse_both_bases() {
        let hit = |list: &str, serial: u64| {
            tokens(list).any(|t| parse_u64(t).is_ok_and(|v| v == serial))
        };
        assert!(hit("0x1234", 0x1234));
        assert!(hit("4660", 0x1234));
        // Ill-formed tokens are skipped, not fatal.
        assert!(hit("bogus,0x1234", 0x1234));
        assert!(!hit("bogus", 0x1234));
    }
}
