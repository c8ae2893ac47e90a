// Licensed under the Apache-2.0 license

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use log::{debug, info};

use crate::ctaphid::get_serial;
use crate::find_hidraw_device::find_device;
use crate::pin::set_pin;
use crate::{DeviceData, HwModelError, Model, Result, VID_NITROKEY};

/// PIN of a physical device, shared by all handles to it.
pub type SharedPin = Rc<RefCell<Option<String>>>;

/// A physical device connected over USB.
#[derive(Debug)]
pub struct UsbDevice {
    data: DeviceData,
    serial: String,
    pin: SharedPin,
}

impl UsbDevice {
    pub fn new(data: DeviceData, serial: impl Into<String>) -> Self {
        Self {
            data,
            serial: serial.into(),
            pin: SharedPin::default(),
        }
    }

    /// Finds the single connected `model` device and checks that its serial
    /// is one of `serials`.
    pub fn find(model: Model, serials: &[String]) -> Result<Self> {
        let data = find_device(VID_NITROKEY, &[model.pid()])?;
        let serial = get_serial(Path::new("/dev"), &data.hidraw)?;
        debug!("{} has serial {serial}", data.hidraw);
        if !serial_matches(serials, &serial)? {
            return Err(HwModelError::UnexpectedSerial {
                expected: serials.to_vec(),
                found: serial,
            });
        }
        info!("using {} {serial} at /dev/{}", data.model()?.name(), data.hidraw);
        Ok(Self::new(data, serial))
    }

    /// Shares the PIN with other handles to the same device, so a PIN set
    /// through one of them is known to all.
    pub fn with_pin(mut self, pin: SharedPin) -> Self {
        self.pin = pin;
        self
    }

    pub fn set_pin(&mut self, pin: &str) -> Result<()> {
        let old_pin = self.pin();
        set_pin(old_pin.as_deref(), pin)?;
        self.store_pin(pin);
        Ok(())
    }

    fn store_pin(&self, pin: &str) {
        *self.pin.borrow_mut() = Some(pin.into());
    }

    pub fn data(&self) -> &DeviceData {
        &self.data
    }

    pub fn model(&self) -> Result<Model> {
        self.data.model()
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn pin(&self) -> Option<String> {
        self.pin.borrow().clone()
    }
}

fn parse_serial(serial: &str) -> Result<u128> {
    let digits = serial
        .strip_prefix("0x")
        .or_else(|| serial.strip_prefix("0X"))
        .unwrap_or(serial);
    u128::from_str_radix(digits, 16).map_err(|_| HwModelError::InvalidSerial(serial.into()))
}

/// Compares serials numerically, so `0x00ab` matches `AB`.
fn serial_matches(serials: &[String], serial: &str) -> Result<bool> {
    let serial = parse_serial(serial)?;
    for expected in serials {
        if parse_serial(expected)? == serial {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_matches() {
        let serials = vec![
            "0x00112233445566778899AABBCCDDEEFF".to_string(),
            "ab".to_string(),
        ];
        assert!(serial_matches(&serials, "00112233445566778899AABBCCDDEEFF").unwrap());
        assert!(serial_matches(&serials, "00112233445566778899aabbccddeeff").unwrap());
        assert!(serial_matches(&serials, "000000000000000000000000000000AB").unwrap());
        assert!(!serial_matches(&serials, "000000000000000000000000000000AC").unwrap());
        assert!(!serial_matches(&[], "AB").unwrap());
    }

    #[test]
    fn test_invalid_serial() {
        match serial_matches(&["xyz".to_string()], "AB") {
            Err(HwModelError::InvalidSerial(s)) => assert_eq!(s, "xyz"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_pin() {
        let device = UsbDevice::new(DeviceData::default(), "AB");
        assert_eq!(device.pin(), None);
        let device = device.with_pin(Rc::new(RefCell::new(Some("1234".into()))));
        assert_eq!(device.pin().as_deref(), Some("1234"));
        assert_eq!(device.serial(), "AB");
    }

    #[test]
    fn test_pin_shared_between_handles() {
        let pin = SharedPin::default();
        let first = UsbDevice::new(DeviceData::default(), "AB").with_pin(pin.clone());
        first.store_pin("1234");
        drop(first);

        let second = UsbDevice::new(DeviceData::default(), "AB").with_pin(pin.clone());
        assert_eq!(second.pin().as_deref(), Some("1234"));
        second.store_pin("5678");
        assert_eq!(pin.borrow().as_deref(), Some("5678"));
    }
}
