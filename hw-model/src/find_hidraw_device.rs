// Licensed under the Apache-2.0 license

use std::path::{Path, PathBuf};

use log::debug;
use walkdir::WalkDir;

use crate::{DeviceData, HwModelError, Result};

pub const SYSFS_DEVICES: &str = "/sys/devices";

/// Walks a sysfs device tree looking for USB devices with a matching
/// vendor/product id that expose a hidraw interface.
#[derive(Clone, Debug)]
pub struct SysfsScanner {
    root: PathBuf,
}

impl Default for SysfsScanner {
    fn default() -> Self {
        Self::new(SYSFS_DEVICES)
    }
}

impl SysfsScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns one entry per enumerated device matching `vid` and any of
    /// `pids`, in walk order.
    pub fn find_devices(&self, vid: u16, pids: &[u16]) -> Vec<DeviceData> {
        let mut devices = vec![];
        let dirs = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir());
        for entry in dirs {
            let node = entry.path();
            if !node.join("dev").is_file() {
                continue;
            }
            let (Some(current_vid), Some(current_pid)) = (
                read_hex_attr(&node.join("idVendor")),
                read_hex_attr(&node.join("idProduct")),
            ) else {
                continue;
            };
            if current_vid != vid || !pids.contains(&current_pid) {
                continue;
            }
            if let Some(hidraw) = find_hidraw_node(node) {
                debug!(
                    "found USB device: vid={current_vid:04x}, pid={current_pid:04x}, device={hidraw}"
                );
                devices.push(DeviceData {
                    hidraw,
                    vid: current_vid,
                    pid: current_pid,
                });
            }
        }
        devices
    }

    /// Like [`Self::find_devices`], but requires exactly one match.
    pub fn find_device(&self, vid: u16, pids: &[u16]) -> Result<DeviceData> {
        narrow(self.find_devices(vid, pids))
    }
}

/// Reduces a scan result to its single entry.
pub fn narrow(mut devices: Vec<DeviceData>) -> Result<DeviceData> {
    match devices.len() {
        0 => Err(HwModelError::NoDevice),
        1 => Ok(devices.remove(0)),
        _ => Err(HwModelError::AmbiguousMatch { devices }),
    }
}

pub fn find_devices(vid: u16, pids: &[u16]) -> Vec<DeviceData> {
    SysfsScanner::default().find_devices(vid, pids)
}

pub fn find_device(vid: u16, pids: &[u16]) -> Result<DeviceData> {
    SysfsScanner::default().find_device(vid, pids)
}

fn read_hex_attr(path: &Path) -> Option<u16> {
    let contents = std::fs::read_to_string(path).ok()?;
    u16::from_str_radix(contents.trim(), 16).ok()
}

/// Searches below a USB device node for a `hidraw/<name>` class directory.
fn find_hidraw_node(usb_node: &Path) -> Option<String> {
    WalkDir::new(usb_node)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .find_map(|entry| {
            let dir = entry.path();
            if !dir.join("device").exists() {
                return None;
            }
            let subsystem = dir.parent()?.file_name()?;
            if subsystem != "hidraw" {
                return None;
            }
            Some(dir.file_name()?.to_string_lossy().into_owned())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PIDS, PID_NK3, PID_NKPK, VID_NITROKEY};
    use std::fs;

    fn add_usb_device(root: &Path, port: &str, vid: &str, pid: &str, hidraw: Option<&str>) {
        let node = root.join("pci0000:00/0000:00:14.0/usb1").join(port);
        fs::create_dir_all(&node).unwrap();
        fs::write(node.join("dev"), "189:3\n").unwrap();
        fs::write(node.join("idVendor"), format!("{vid}\n")).unwrap();
        fs::write(node.join("idProduct"), format!("{pid}\n")).unwrap();
        if let Some(hidraw) = hidraw {
            let iface = node
                .join(format!("{port}:1.0"))
                .join("0003:20A0:42B2.0001/hidraw")
                .join(hidraw);
            fs::create_dir_all(iface.join("device")).unwrap();
            fs::write(iface.join("dev"), "241:0\n").unwrap();
        }
    }

    #[test]
    fn test_find_devices() {
        let dir = tempfile::tempdir().unwrap();
        add_usb_device(dir.path(), "1-1", "20a0", "42b2", Some("hidraw3"));
        add_usb_device(dir.path(), "1-2", "1050", "0407", Some("hidraw1"));

        let scanner = SysfsScanner::new(dir.path());
        assert_eq!(
            scanner.find_devices(VID_NITROKEY, &PIDS),
            vec![DeviceData {
                hidraw: "hidraw3".into(),
                vid: VID_NITROKEY,
                pid: PID_NK3,
            }]
        );
        // No topology change, same answer.
        assert_eq!(
            scanner.find_devices(VID_NITROKEY, &PIDS),
            scanner.find_devices(VID_NITROKEY, &PIDS)
        );
        assert!(scanner.find_devices(VID_NITROKEY, &[PID_NKPK]).is_empty());
    }

    #[test]
    fn test_device_without_hidraw_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        add_usb_device(dir.path(), "1-1", "20a0", "42b2", None);
        let scanner = SysfsScanner::new(dir.path());
        assert!(scanner.find_devices(VID_NITROKEY, &PIDS).is_empty());
        assert!(matches!(
            scanner.find_device(VID_NITROKEY, &PIDS),
            Err(HwModelError::NoDevice)
        ));
    }

    #[test]
    fn test_find_device_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        add_usb_device(dir.path(), "1-1", "20a0", "42b2", Some("hidraw3"));
        add_usb_device(dir.path(), "1-2", "20a0", "42f3", Some("hidraw4"));
        let scanner = SysfsScanner::new(dir.path());
        assert_eq!(scanner.find_devices(VID_NITROKEY, &PIDS).len(), 2);
        match scanner.find_device(VID_NITROKEY, &PIDS) {
            Err(HwModelError::AmbiguousMatch { devices }) => assert_eq!(devices.len(), 2),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(
            scanner.find_device(VID_NITROKEY, &[PID_NKPK]).unwrap().hidraw,
            "hidraw4"
        );
    }

    #[test]
    fn test_missing_root() {
        let scanner = SysfsScanner::new("/nonexistent/sys/devices");
        assert!(scanner.find_devices(VID_NITROKEY, &PIDS).is_empty());
    }
}
