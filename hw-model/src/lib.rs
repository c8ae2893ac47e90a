// Licensed under the Apache-2.0 license

pub mod ctaphid;
mod error;
pub mod expect;
mod find_hidraw_device;
mod host;
mod model;
mod model_usb;
mod model_usbip;
pub mod pin;
pub mod process;
mod runner;
mod state_dir;
pub mod testing;
pub mod upgrade;
mod usb_port_path;

pub use error::{HwModelError, Result};
pub use find_hidraw_device::{find_device, find_devices, narrow, SysfsScanner};
pub use host::{module_loaded, SystemHost, UsbipHost, VHCI_MODULE};
pub use model::{Model, PIDS, PID_NK3, PID_NKPK, VID_NITROKEY};
pub use model_usb::{SharedPin, UsbDevice};
pub use model_usbip::{
    spawn_device, LinkState, SimulatorState, SpawnParams, UsbipConfig, UsbipDevice,
};
pub use runner::{runner_args, RunnerProcess, UsbipRunner};
pub use state_dir::StateDir;
pub use upgrade::{DynUpgradeTest, UpgradeEnv, UpgradeTest};
pub use usb_port_path::UsbPortPath;

/// A USB device exposing a hidraw interface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceData {
    /// Name of the hidraw node, e.g. `hidraw3`.
    pub hidraw: String,
    pub vid: u16,
    pub pid: u16,
}

impl DeviceData {
    pub fn model(&self) -> Result<Model> {
        Model::from_vid_pid(self.vid, self.pid)
    }
}

/// The device under test, either connected over USB or simulated and
/// attached over USB/IP.
#[derive(Debug)]
pub enum Device {
    Usb(UsbDevice),
    Usbip(UsbipDevice),
}

impl Device {
    pub fn data(&self) -> &DeviceData {
        match self {
            Self::Usb(device) => device.data(),
            Self::Usbip(device) => device.data(),
        }
    }

    pub fn hidraw(&self) -> &str {
        &self.data().hidraw
    }

    pub fn vid(&self) -> u16 {
        self.data().vid
    }

    pub fn pid(&self) -> u16 {
        self.data().pid
    }

    pub fn model(&self) -> Result<Model> {
        self.data().model()
    }

    pub fn serial(&self) -> &str {
        match self {
            Self::Usb(device) => device.serial(),
            Self::Usbip(device) => device.serial(),
        }
    }

    /// The FIDO2 PIN, `None` if no PIN has been set.
    pub fn pin(&self) -> Option<String> {
        match self {
            Self::Usb(device) => device.pin(),
            Self::Usbip(device) => device.pin().map(String::from),
        }
    }

    pub fn set_pin(&mut self, pin: &str) -> Result<()> {
        match self {
            Self::Usb(device) => device.set_pin(pin),
            Self::Usbip(device) => device.set_pin(pin),
        }
    }

    /// Whether user presence checks wait for [`Device::confirm_user_presence`].
    /// Physical devices wait for a touch instead.
    pub fn user_presence(&self) -> bool {
        match self {
            Self::Usb(_) => false,
            Self::Usbip(device) => device.state().user_presence,
        }
    }

    /// Confirms a pending user presence check. For a physical device the
    /// user has to touch it, so this does nothing.
    pub fn confirm_user_presence(&mut self) -> Result<()> {
        match self {
            Self::Usb(_) => Ok(()),
            Self::Usbip(device) => device.confirm_user_presence(),
        }
    }

    /// Restarts a simulated device. Physical devices are left alone.
    pub fn reboot(&mut self) -> Result<()> {
        match self {
            Self::Usb(_) => Ok(()),
            Self::Usbip(device) => device.reboot(),
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Usbip(_))
    }
}

impl From<UsbDevice> for Device {
    fn from(device: UsbDevice) -> Self {
        Self::Usb(device)
    }
}

impl From<UsbipDevice> for Device {
    fn from(device: UsbipDevice) -> Self {
        Self::Usbip(device)
    }
}

/// 16 random bytes as upper case hex.
pub fn generate_serial() -> String {
    hex::encode_upper(rand::random::<[u8; 16]>())
}
