//! Buses: root-level port groupings.
//!
//! A bus is a thin wrapper around exactly one root [`Port`](super::Port);
//! its id, name, and host all come from that port. The only bus-specific
//! attribute is the provider name derived from the platform device.

use crate::topology::PortRef;

/// A root-level grouping of the port hierarchy.
#[derive(Debug)]
pub struct Bus {
    pub(crate) alive: bool,
    pub(crate) port: PortRef,
}

impl Bus {
    /// The root port wrapped by this bus.
    pub fn port(&self) -> PortRef {
        self.port
    }
}

/// Map a platform device name to the provider name reported for a bus.
/// Two aliases are fixed: the ACPI0017 host bridge and the cxl_test mock.
pub(crate) fn provider_alias(host: &str) -> &str {
    match host {
        "ACPI0017:00" => "ACPI.CXL",
        "cxl_acpi.0" => "cxl_test",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::provider_alias;

    #[test]
    fn provider_aliases() {
        assert_eq!(provider_alias("ACPI0017:00"), "ACPI.CXL");
        assert_eq!(provider_alias("cxl_acpi.0"), "cxl_test");
        assert_eq!(provider_alias("pci0000:34"), "pci0000:34");
    }
}
