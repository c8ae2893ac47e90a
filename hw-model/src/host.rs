// Licensed under the Apache-2.0 license

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use log::debug;

use crate::pin::PinCommand;
use crate::process::{check_call, check_output, DEFAULT_TIMEOUT};
use crate::runner::{RunnerProcess, UsbipRunner};
use crate::{
    DeviceData, HwModelError, Model, Result, SimulatorState, SysfsScanner, UsbPortPath,
};

pub const VHCI_MODULE: &str = "vhci_hcd";

/// The operating system services needed to run a virtual device: kernel
/// modules, child processes, the usbip tool and the device tree.
pub trait UsbipHost {
    /// Fails with [`HwModelError::VhciMissing`] unless the vhci-hcd module
    /// is loaded.
    fn check_vhci(&self) -> Result<()>;

    fn binary_exists(&self, path: &Path) -> bool;

    fn spawn_runner(
        &self,
        binary: &Path,
        state: &SimulatorState,
    ) -> Result<Box<dyn RunnerProcess>>;

    /// `usbip list -r <remote>`
    fn list_exported(&self, remote: &str) -> Result<()>;

    /// `usbip attach -r <remote> -b <bus>`
    fn attach(&self, remote: &str, bus: &UsbPortPath) -> Result<()>;

    fn find_devices(&self, vid: u16, pids: &[u16]) -> Vec<DeviceData>;

    /// Path of the device node for `hidraw`.
    fn hidraw_path(&self, hidraw: &str) -> PathBuf;

    fn path_exists(&self, path: &Path) -> bool;

    fn sleep(&self, duration: Duration);

    /// Seeds the attestation material of the currently attached device.
    fn provision(&self, model: Model) -> Result<()>;

    fn set_pin(&self, old_pin: Option<&str>, new_pin: &str) -> Result<()>;
}

/// [`UsbipHost`] backed by the real system.
#[derive(Clone, Debug)]
pub struct SystemHost {
    pub scanner: SysfsScanner,
    pub dev_dir: PathBuf,
    pub vhci_module: String,
    pub timeout: Duration,
    pub pin_command: PinCommand,
    pub attestation_cert: PathBuf,
    pub attestation_key: PathBuf,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            scanner: SysfsScanner::default(),
            dev_dir: "/dev".into(),
            vhci_module: VHCI_MODULE.into(),
            timeout: DEFAULT_TIMEOUT,
            pin_command: PinCommand::default(),
            attestation_cert: "data/fido.cert".into(),
            attestation_key: "data/fido.key".into(),
        }
    }
}

/// Returns true if `lsmod` output lists `module`.
pub fn module_loaded(lsmod: &str, module: &str) -> bool {
    lsmod.lines().any(|line| line.starts_with(module))
}

impl UsbipHost for SystemHost {
    fn check_vhci(&self) -> Result<()> {
        let mods = check_output(&mut Command::new("lsmod"), self.timeout)?;
        if !module_loaded(&mods, &self.vhci_module) {
            return Err(HwModelError::VhciMissing {
                module: self.vhci_module.clone(),
            });
        }
        Ok(())
    }

    fn binary_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn spawn_runner(
        &self,
        binary: &Path,
        state: &SimulatorState,
    ) -> Result<Box<dyn RunnerProcess>> {
        Ok(Box::new(UsbipRunner::spawn(binary, state)?))
    }

    fn list_exported(&self, remote: &str) -> Result<()> {
        check_call(
            Command::new("usbip").args(["list", "-r", remote]),
            self.timeout,
        )
    }

    fn attach(&self, remote: &str, bus: &UsbPortPath) -> Result<()> {
        check_call(
            Command::new("usbip")
                .args(["attach", "-r", remote, "-b"])
                .arg(bus.to_string()),
            self.timeout,
        )
    }

    fn find_devices(&self, vid: u16, pids: &[u16]) -> Vec<DeviceData> {
        self.scanner.find_devices(vid, pids)
    }

    fn hidraw_path(&self, hidraw: &str) -> PathBuf {
        self.dev_dir.join(hidraw)
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn provision(&self, model: Model) -> Result<()> {
        debug!("Provisioning usbip-runner");
        check_call(
            Command::new("nitropy")
                .args([model.command(), "provision", "fido2", "--cert"])
                .arg(&self.attestation_cert)
                .arg("--key")
                .arg(&self.attestation_key),
            self.timeout,
        )
    }

    fn set_pin(&self, old_pin: Option<&str>, new_pin: &str) -> Result<()> {
        self.pin_command.run(old_pin, new_pin)
    }
}
