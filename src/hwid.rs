//! Hardware-ID string parsing.
//!
//! Device instance identifiers look like
//! `USB\VID_2341&PID_0043\85436323631351311141` for USB devices,
//! `FTDIBUS\VID_0403+PID_6001+A6008isPA\0000` for FTDI adapters and
//! `PCI\VEN_8086&DEV_1C3D&...` for PCI devices. Vendor/product IDs and
//! serial numbers are extracted here with plain string work so the
//! enumeration layer only deals with registry/SetupAPI plumbing.

use regex::RegexBuilder;

fn parse_identifier(instance_id: &str, prefixes: [&str; 2]) -> Option<u16> {
    for prefix in prefixes {
        let regex = RegexBuilder::new(&format!(r"{}([0-9a-f]{{4}})", prefix))
            .case_insensitive(true)
            .build()
            .unwrap();
        if let Some(captures) = regex.captures(instance_id) {
            if let Ok(id) = u16::from_str_radix(captures.get(1).unwrap().as_str(), 16) {
                return Some(id);
            }
        }
    }
    None
}

/// Extracts the vendor ID from a device instance identifier
/// (`VID_xxxx` for USB, `VEN_xxxx` for PCI)
pub fn vendor_id(instance_id: &str) -> Option<u16> {
    parse_identifier(instance_id, ["VID_", "VEN_"])
}

/// Extracts the product ID from a device instance identifier
/// (`PID_xxxx` for USB, `DEV_xxxx` for PCI)
pub fn product_id(instance_id: &str) -> Option<u16> {
    parse_identifier(instance_id, ["PID_", "DEV_"])
}

/// Extracts the serial number from a device instance identifier.
///
/// USB devices carry it as the last path segment, unless that segment
/// is a bus-generated identifier (contains `&`, meaning the device
/// reported no serial). FTDI adapters embed it between the last `+`
/// and the following `\`. Returns `None` for every other bus; the
/// caller is expected to retry on the parent device node.
pub fn serial_number(instance_id: &str) -> Option<&str> {
    if instance_id.starts_with("USB\\") {
        let first = instance_id.rfind('\\')?;
        // A trailing `_nn` marks a composite-function suffix, not part
        // of the serial
        let end = match instance_id[first..].find('_') {
            Some(off) if first + off == instance_id.len() - 3 => first + off,
            _ => instance_id.len(),
        };
        if instance_id[first..end].contains('&') {
            return None;
        }
        let serial = &instance_id[first + 1..end];
        (!serial.is_empty()).then(|| serial)
    } else if instance_id.starts_with("FTDIBUS\\") {
        let first = instance_id.rfind('+')?;
        let end = first + instance_id[first..].find('\\')?;
        let serial = &instance_id[first + 1..end];
        (!serial.is_empty()).then(|| serial)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_vid_pid() {
        let id = r"USB\VID_2341&PID_0043\85436323631351311141";
        assert_eq!(vendor_id(id), Some(0x2341));
        assert_eq!(product_id(id), Some(0x0043));
    }

    #[test]
    fn pci_ven_dev_fallback() {
        let id = r"PCI\VEN_8086&DEV_1C3D&SUBSYS_21CF17AA";
        assert_eq!(vendor_id(id), Some(0x8086));
        assert_eq!(product_id(id), Some(0x1C3D));
    }

    #[test]
    fn identifiers_are_case_insensitive() {
        let id = r"usb\vid_0403&pid_6001\A700eYpD";
        assert_eq!(vendor_id(id), Some(0x0403));
        assert_eq!(product_id(id), Some(0x6001));
    }

    #[test]
    fn missing_identifiers() {
        assert_eq!(vendor_id(r"ACPI\PNP0501\1"), None);
        assert_eq!(product_id(r"ACPI\PNP0501\1"), None);
    }

    #[test]
    fn usb_serial_is_last_segment() {
        let id = r"USB\VID_2341&PID_0043\85436323631351311141";
        assert_eq!(serial_number(id), Some("85436323631351311141"));
    }

    #[test]
    fn usb_bus_generated_path_has_no_serial() {
        // Composite devices get a bus-generated `&`-separated path
        let id = r"USB\VID_1A86&PID_7523&MI_00\6&2CC55A73&0&0000";
        assert_eq!(serial_number(id), None);
    }

    #[test]
    fn usb_serial_with_function_suffix() {
        let id = r"USB\VID_0403&PID_6011\FT123456_02";
        assert_eq!(serial_number(id), Some("FT123456"));
    }

    #[test]
    fn ftdibus_serial_between_plus_and_backslash() {
        let id = r"FTDIBUS\VID_0403+PID_6001+A6008isPA\0000";
        assert_eq!(serial_number(id), Some("A6008isPA"));
    }

    #[test]
    fn unknown_bus_has_no_serial() {
        assert_eq!(serial_number(r"ACPI\PNP0501\1"), None);
    }
}
