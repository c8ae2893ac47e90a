// Licensed under the Apache-2.0 license

use std::fmt::{Debug, Display};
use std::str::FromStr;

use crate::HwModelError;

/// Identifies a USB device by the port it is connected to (for example "1-1",
/// the bus id the usbip runner exports its virtual device under).
#[derive(Clone, Eq, PartialEq)]
pub struct UsbPortPath {
    pub bus: u8,
    pub ports: Vec<u8>,
}
impl UsbPortPath {
    pub fn new(bus: u8, ports: Vec<u8>) -> Self {
        Self { bus, ports }
    }
}

impl Default for UsbPortPath {
    fn default() -> Self {
        Self::new(1, vec![1])
    }
}

impl FromStr for UsbPortPath {
    type Err = HwModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || HwModelError::InvalidPortPath(s.into());
        let (root, remainder) = s.split_once('-').ok_or_else(err)?;
        let bus = u8::from_str(root).map_err(|_| err())?;
        let ports = remainder
            .split('.')
            .map(|item| u8::from_str(item).map_err(|_| err()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(UsbPortPath { bus, ports })
    }
}

impl Display for UsbPortPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bus)?;
        for (index, item) in self.ports.iter().enumerate() {
            if index == 0 {
                write!(f, "-")?;
            } else {
                write!(f, ".")?;
            }
            write!(f, "{}", item)?;
        }
        Ok(())
    }
}
impl Debug for UsbPortPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_path_parse() {
        assert_eq!(
            UsbPortPath::from_str("1-1").unwrap(),
            UsbPortPath::new(1, vec![1])
        );
        assert_eq!(
            UsbPortPath::from_str("3-1.4.2").unwrap(),
            UsbPortPath::new(3, vec![1, 4, 2])
        );
        assert_eq!(
            UsbPortPath::from_str("1-x").unwrap_err().to_string(),
            "unable to parse USB port path \"1-x\""
        );
        assert_eq!(
            UsbPortPath::from_str("1").unwrap_err().to_string(),
            "unable to parse USB port path \"1\""
        );
    }

    #[test]
    fn test_port_path_display() {
        assert_eq!(UsbPortPath::default().to_string(), "1-1");
        assert_eq!(UsbPortPath::new(2, vec![3, 1]).to_string(), "2-3.1");
    }
}
