//! # cxlctl
//!
//! A user-space control library for CXL memory devices.
//!
//! cxlctl enumerates the kernel's CXL device model from sysfs into a
//! lazily-populated object graph and drives devices through the memdev
//! mailbox character interface.
//!
//! ## Features
//!
//! - **Lazy topology**: buses, ports, decoders, regions, and memdevs are
//!   scanned on first access and cached behind typed handles
//! - **Filtering**: one identifier vocabulary (ids, device names, `all`)
//!   across every listing axis, including cross-entity walks
//! - **Mailbox commands**: query-validated, payload-checked command
//!   construction with byte-exact little-endian codecs
//! - **Lifecycle**: driver bind/unbind with topology invalidation, so
//!   handles stay safe across disable and re-enable
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cxlctl::prelude::*;
//!
//! let mut ctx = CxlContext::new();
//! for m in ctx.memdevs() {
//!     let mut cmd = ctx.cmd_identify(m)?;
//!     cmd.run()?;
//!     println!("{}: {} bytes", ctx.memdev(m).devname(), cmd.identify()?.total_capacity());
//! }
//! ```

#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod context;
pub mod error;
pub mod filter;
pub mod mbox;
pub mod sysfs;
pub mod topology;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::context::CxlContext;
    pub use crate::error::{Error, Result};
    pub use crate::filter::PortFilterMode;
    pub use crate::mbox::{Command, CommandId};
    pub use crate::topology::{BusRef, DecoderRef, MemdevRef, Mode, PortRef, RegionRef};
}

pub use context::CxlContext;
pub use error::{Error, Result};
pub use filter::PortFilterMode;
pub use mbox::transport::{CharDevMailbox, DeviceHandle, MboxTransport};
pub use mbox::wire::{EventLogType, FwTransferAction};
pub use mbox::{AlertEvent, Command, CommandId, Severity};
pub use sysfs::{AttrIo, Sysfs};
pub use topology::{
    BusRef, DecoderRef, MemdevRef, Mode, PartitionType, PortKind, PortRef, RegionRef,
};
