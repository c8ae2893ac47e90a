// Licensed under the Apache-2.0 license

use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};
use scopeguard::ScopeGuard;

use crate::find_hidraw_device::narrow;
use crate::runner::RunnerProcess;
use crate::{
    generate_serial, DeviceData, HwModelError, Model, Result, UsbPortPath, UsbipHost, PIDS,
    VID_NITROKEY,
};

/// Everything a simulator needs to come back up as the same device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimulatorState {
    /// Internal flash image.
    pub ifs: PathBuf,
    /// External flash image.
    pub efs: Option<PathBuf>,
    /// 32 upper case hex characters.
    pub serial: String,
    /// Wait for SIGUSR1 instead of accepting every user presence check.
    pub user_presence: bool,
    pub pin: Option<String>,
}

impl SimulatorState {
    pub fn new(ifs: impl Into<PathBuf>, serial: impl Into<String>) -> Self {
        Self {
            ifs: ifs.into(),
            efs: None,
            serial: serial.into(),
            user_presence: false,
            pin: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Unattached,
    Spawned,
    Attached,
    Enumerating,
    Ready,
    Rebooting,
    Terminated,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug)]
pub struct UsbipConfig {
    pub bin_dir: PathBuf,
    pub runner: String,
    pub provisioner: String,
    pub remote: String,
    pub bus: UsbPortPath,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub vid: u16,
    pub pids: Vec<u16>,
}

impl Default for UsbipConfig {
    fn default() -> Self {
        Self {
            bin_dir: "./bin".into(),
            runner: "usbip-runner".into(),
            provisioner: "usbip-provisioner".into(),
            remote: "localhost".into(),
            bus: UsbPortPath::default(),
            poll_attempts: 5,
            poll_interval: Duration::from_secs(1),
            vid: VID_NITROKEY,
            pids: PIDS.to_vec(),
        }
    }
}

impl UsbipConfig {
    /// `<bin_dir>/<name>` or `<bin_dir>/<name>-<suffix>`.
    pub fn binary(&self, name: &str, suffix: Option<&str>) -> PathBuf {
        match suffix {
            Some(suffix) => self.bin_dir.join(format!("{name}-{suffix}")),
            None => self.bin_dir.join(name),
        }
    }

    pub fn runner_binary(&self, suffix: Option<&str>) -> PathBuf {
        self.binary(&self.runner, suffix)
    }

    pub fn provisioner_binary(&self, suffix: Option<&str>) -> PathBuf {
        self.binary(&self.provisioner, suffix)
    }
}

/// A simulated device attached through the vhci host controller.
///
/// Dropping the device terminates the simulator.
pub struct UsbipDevice {
    host: Rc<dyn UsbipHost>,
    config: UsbipConfig,
    binary: PathBuf,
    data: DeviceData,
    state: SimulatorState,
    runner: Option<Box<dyn RunnerProcess>>,
    link: LinkState,
}

impl UsbipDevice {
    /// Starts `binary` with `state` and waits until its device is usable.
    pub fn spawn(
        host: Rc<dyn UsbipHost>,
        config: UsbipConfig,
        binary: impl Into<PathBuf>,
        state: SimulatorState,
    ) -> Result<Self> {
        let mut device = Self {
            host,
            config,
            binary: binary.into(),
            data: DeviceData::default(),
            state,
            runner: None,
            link: LinkState::Unattached,
        };
        device.bring_up()?;
        Ok(device)
    }

    fn transition(&mut self, link: LinkState) {
        debug!("{}: {} -> {link}", self.binary.display(), self.link);
        self.link = link;
    }

    fn bring_up(&mut self) -> Result<()> {
        self.host.check_vhci()?;

        let runner = self.host.spawn_runner(&self.binary, &self.state)?;
        let runner = scopeguard::guard(runner, |mut runner| {
            warn!("terminating runner pid={} after failed start", runner.id());
            if let Err(e) = runner.terminate() {
                warn!("failed to terminate runner pid={}: {e}", runner.id());
            }
        });
        self.transition(LinkState::Spawned);

        self.attach()?;
        self.transition(LinkState::Attached);

        self.transition(LinkState::Enumerating);
        let data = self.wait_for_device()?;
        self.wait_for_hidraw(&data)?;

        self.data = data;
        self.runner = Some(ScopeGuard::into_inner(runner));
        self.transition(LinkState::Ready);
        Ok(())
    }

    fn attach(&self) -> Result<()> {
        let remote = &self.config.remote;
        self.host.list_exported(remote)?;
        self.host.attach(remote, &self.config.bus)?;
        // the first attach does not always stick
        if let Err(e) = self.host.attach(remote, &self.config.bus) {
            warn!("repeated usbip attach failed: {e}");
        }
        Ok(())
    }

    fn wait_for_device(&self) -> Result<DeviceData> {
        let attempts = self.config.poll_attempts;
        for attempt in 0..attempts {
            if attempt > 0 {
                self.host.sleep(self.config.poll_interval);
            }
            let devices = self.host.find_devices(self.config.vid, &self.config.pids);
            if !devices.is_empty() {
                return narrow(devices);
            }
            debug!("no device enumerated yet (attempt {}/{attempts})", attempt + 1);
        }
        Err(HwModelError::EnumerationTimeout { attempts })
    }

    fn wait_for_hidraw(&self, data: &DeviceData) -> Result<()> {
        let path = self.host.hidraw_path(&data.hidraw);
        for attempt in 0..self.config.poll_attempts {
            if attempt > 0 {
                self.host.sleep(self.config.poll_interval);
            }
            if self.host.path_exists(&path) {
                return Ok(());
            }
        }
        Err(HwModelError::DeviceNotReady { path })
    }

    /// Restarts the simulator against the same images. The serial stays the
    /// same, the hidraw node may change.
    pub fn reboot(&mut self) -> Result<()> {
        self.transition(LinkState::Rebooting);
        if let Some(mut runner) = self.runner.take() {
            runner.terminate()?;
        }
        self.bring_up()
    }

    /// Stops the simulator. Calling this more than once is fine.
    pub fn terminate(&mut self) -> Result<()> {
        if let Some(mut runner) = self.runner.take() {
            runner.terminate()?;
        }
        if self.link != LinkState::Terminated {
            self.transition(LinkState::Terminated);
        }
        Ok(())
    }

    /// Sets or changes the FIDO2 PIN. The new PIN is kept across reboots.
    pub fn set_pin(&mut self, pin: &str) -> Result<()> {
        self.host.set_pin(self.state.pin.as_deref(), pin)?;
        self.state.pin = Some(pin.into());
        Ok(())
    }

    /// Confirms a pending user presence check. Only valid for simulators
    /// started with `user_presence` set.
    pub fn confirm_user_presence(&mut self) -> Result<()> {
        if !self.state.user_presence {
            return Err(HwModelError::UserPresenceDisabled);
        }
        match &mut self.runner {
            Some(runner) => runner.send_user_presence_signal(),
            None => Err(HwModelError::NotRunning {
                binary: self.binary.clone(),
            }),
        }
    }

    /// Writes the attestation certificate and key to the running device.
    pub fn provision(&self) -> Result<()> {
        self.host.provision(self.model()?)
    }

    pub fn data(&self) -> &DeviceData {
        &self.data
    }

    pub fn model(&self) -> Result<Model> {
        self.data.model()
    }

    pub fn serial(&self) -> &str {
        &self.state.serial
    }

    pub fn pin(&self) -> Option<&str> {
        self.state.pin.as_deref()
    }

    pub fn state(&self) -> &SimulatorState {
        &self.state
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn runner_id(&self) -> Option<u32> {
        self.runner.as_ref().map(|r| r.id())
    }
}

impl Drop for UsbipDevice {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("failed to terminate {}: {e}", self.binary.display());
        }
    }
}

impl fmt::Debug for UsbipDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbipDevice")
            .field("binary", &self.binary)
            .field("data", &self.data)
            .field("state", &self.state)
            .field("runner", &self.runner_id())
            .field("link", &self.link)
            .finish()
    }
}

/// Parameters for [`spawn_device`].
#[derive(Clone, Debug)]
pub struct SpawnParams {
    pub ifs: PathBuf,
    pub efs: Option<PathBuf>,
    /// Generated if not set.
    pub serial: Option<String>,
    pub user_presence: bool,
    /// PIN already stored in the images, e.g. set before an upgrade.
    pub pin: Option<String>,
    pub provision: bool,
    /// Selects `usbip-runner-<suffix>` and `usbip-provisioner-<suffix>`.
    pub suffix: Option<String>,
}

impl SpawnParams {
    pub fn new(ifs: impl Into<PathBuf>) -> Self {
        Self {
            ifs: ifs.into(),
            efs: None,
            serial: None,
            user_presence: false,
            pin: None,
            provision: true,
            suffix: None,
        }
    }
}

/// Spawns a ready-to-use simulated device, provisioning it first unless
/// `params.provision` is false.
pub fn spawn_device(
    host: Rc<dyn UsbipHost>,
    config: &UsbipConfig,
    params: SpawnParams,
) -> Result<UsbipDevice> {
    let suffix = params.suffix.as_deref();
    let runner = config.runner_binary(suffix);
    let provisioner = config.provisioner_binary(suffix);
    let missing = |path: &Path| HwModelError::BinaryMissing {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: path.to_path_buf(),
    };
    if !host.binary_exists(&runner) {
        return Err(missing(&runner));
    }
    if params.provision && !host.binary_exists(&provisioner) {
        return Err(missing(&provisioner));
    }

    let state = SimulatorState {
        ifs: params.ifs,
        efs: params.efs,
        serial: params.serial.unwrap_or_else(generate_serial),
        user_presence: params.user_presence,
        pin: params.pin,
    };

    if params.provision {
        let mut device =
            UsbipDevice::spawn(host.clone(), config.clone(), provisioner, state.clone())?;
        debug!("Provisioning {}", device.binary().display());
        device.provision()?;
        device.terminate()?;
    }
    UsbipDevice::spawn(host, config.clone(), runner, state)
}
