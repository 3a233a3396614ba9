//! Per-scan registry of discovered printers.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Transport a printer is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrinterKind {
    // Wire tag kept as historically spelled by the host applications.
    #[serde(rename = "bluethoot", alias = "bluetooth")]
    Bluetooth,
    #[serde(rename = "usb")]
    Usb,
}

/// A printer found during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    #[serde(rename = "bleAddress")]
    pub address: String,
    #[serde(rename = "type")]
    pub kind: PrinterKind,
    #[serde(rename = "isConnected")]
    pub connected: bool,
}

impl DeviceRecord {
    /// Composite identity used for de-duplication.
    pub fn key(&self) -> String {
        composite_key(&self.name, &self.address)
    }
}

fn composite_key(name: &str, address: &str) -> String {
    format!("{name}#{address}")
}

/// Deduplicated list of devices reported during the current scan window.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    records: Vec<DeviceRecord>,
    seen: HashSet<String>,
    scanning: bool,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear previous results and open a new scan window.
    pub fn begin_scan(&mut self) {
        self.records.clear();
        self.seen.clear();
        self.scanning = true;
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Record a discovery. Anonymous devices, duplicates, and discoveries
    /// outside a scan window are ignored. Returns whether a record was added.
    pub fn on_device_discovered(&mut self, name: Option<&str>, address: &str) -> bool {
        if !self.scanning {
            return false;
        }
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return false;
        };
        if !self.seen.insert(composite_key(name, address)) {
            return false;
        }

        tracing::info!(name = %name, address = %address, "Discovered device");
        self.records.push(DeviceRecord {
            name: name.to_string(),
            address: address.to_string(),
            kind: PrinterKind::Bluetooth,
            connected: false,
        });
        true
    }

    /// Close the scan window and hand out the accumulated records.
    pub fn close_scan(&mut self) -> Vec<DeviceRecord> {
        self.scanning = false;
        self.seen.clear();
        std::mem::take(&mut self.records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// USB enumeration is not implemented; always empty.
pub fn usb_printers() -> Vec<DeviceRecord> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_and_anonymous_devices_are_dropped() {
        let mut registry = DeviceRegistry::new();
        registry.begin_scan();

        assert!(registry.on_device_discovered(Some("Printer1"), "AA:BB"));
        assert!(!registry.on_device_discovered(Some("Printer1"), "AA:BB"));
        assert!(!registry.on_device_discovered(None, "CC:DD"));
        assert!(!registry.on_device_discovered(Some(""), "EE:FF"));

        let records = registry.close_scan();
        assert_eq!(
            records,
            vec![DeviceRecord {
                name: "Printer1".into(),
                address: "AA:BB".into(),
                kind: PrinterKind::Bluetooth,
                connected: false,
            }]
        );
    }

    #[test]
    fn same_address_under_different_name_is_distinct() {
        let mut registry = DeviceRegistry::new();
        registry.begin_scan();
        registry.on_device_discovered(Some("Printer1"), "AA:BB");
        registry.on_device_discovered(Some("Printer1-renamed"), "AA:BB");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registry_is_rebuilt_per_scan() {
        let mut registry = DeviceRegistry::new();
        registry.begin_scan();
        registry.on_device_discovered(Some("Old"), "11:22");
        assert_eq!(registry.close_scan().len(), 1);
        assert!(registry.is_empty());

        // Outside a window nothing is kept.
        assert!(!registry.on_device_discovered(Some("Late"), "33:44"));

        registry.begin_scan();
        registry.on_device_discovered(Some("Old"), "11:22");
        let records = registry.close_scan();
        assert_eq!(records.len(), 1);
        assert!(!registry.is_scanning());
    }

    #[test]
    fn usb_enumeration_is_empty() {
        assert!(usb_printers().is_empty());
    }

    #[test]
    fn record_wire_shape() {
        let record = DeviceRecord {
            name: "Printer1".into(),
            address: "AA:BB".into(),
            kind: PrinterKind::Bluetooth,
            connected: false,
        };
        assert_eq!(record.key(), "Printer1#AA:BB");
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            serde_json::json!({
                "name": "Printer1",
                "bleAddress": "AA:BB",
                "type": "bluethoot",
                "isConnected": false,
            })
        );
    }

    #[test]
    fn printer_kind_accepts_correct_spelling_on_input() {
        let kind: PrinterKind = serde_json::from_str("\"bluetooth\"").unwrap();
        assert_eq!(kind, PrinterKind::Bluetooth);
        let kind: PrinterKind = serde_json::from_str("\"usb\"").unwrap();
        assert_eq!(kind, PrinterKind::Usb);
    }
}
