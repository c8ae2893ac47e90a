// Licensed under the Apache-2.0 license

use std::path::PathBuf;
use std::rc::Rc;

use log::{debug, info};
use nitrokey_hil_hw_model::{
    generate_serial, spawn_device, Device, Model, SharedPin, SpawnParams, StateDir, UpgradeEnv,
    UsbDevice, UsbipConfig, UsbipHost,
};

use crate::options::Options;

/// A device acquired for the tests of one module. The simulator is
/// terminated before its state directory goes away.
pub struct ModuleDevice {
    pub device: Device,
    _state: Option<StateDir>,
}

/// Creates the devices and state the tests ask for.
pub struct Fixtures {
    keep_state: bool,
    usb_serials: Option<Vec<String>>,
    model: Model,
    env: UpgradeEnv,
    /// The physical device keeps its PIN, so all handles share it.
    usb_pin: SharedPin,
}

impl Fixtures {
    pub fn new(options: &Options, host: Rc<dyn UsbipHost>) -> Self {
        let config = UsbipConfig {
            bin_dir: options.bin_dir.clone(),
            ..UsbipConfig::default()
        };
        Self {
            keep_state: options.keep_state,
            usb_serials: options.usb_serials().map(<[String]>::to_vec),
            model: options.model.into(),
            env: UpgradeEnv { host, config },
            usb_pin: SharedPin::default(),
        }
    }

    /// The connected device if physical devices are used, otherwise a
    /// freshly provisioned simulator.
    pub fn device(&self, user_presence: bool) -> anyhow::Result<ModuleDevice> {
        if let Some(serials) = &self.usb_serials {
            let device = UsbDevice::find(self.model, serials)?;
            return Ok(ModuleDevice {
                device: self.usb_handle(device).into(),
                _state: None,
            });
        }
        let state = StateDir::new(self.keep_state)?;
        let device = spawn_device(
            self.env.host.clone(),
            &self.env.config,
            SpawnParams {
                efs: Some(state.efs()),
                user_presence,
                ..SpawnParams::new(state.ifs())
            },
        )?;
        info!(
            "spawned {} with serial {} at /dev/{}",
            device.binary().display(),
            device.serial(),
            device.data().hidraw
        );
        Ok(ModuleDevice {
            device: device.into(),
            _state: Some(state),
        })
    }

    fn usb_handle(&self, device: UsbDevice) -> UsbDevice {
        device.with_pin(self.usb_pin.clone())
    }

    /// Releases a module device, terminating a simulator.
    pub fn release(&self, device: ModuleDevice) {
        debug!("releasing /dev/{}", device.device.hidraw());
    }

    pub fn serial(&self) -> String {
        generate_serial()
    }

    /// A fresh internal flash image path. The image lives as long as the
    /// returned directory.
    pub fn ifs(&self) -> anyhow::Result<(StateDir, PathBuf)> {
        let state = StateDir::new(self.keep_state)?;
        let ifs = state.ifs();
        Ok((state, ifs))
    }

    pub fn upgrade_env(&self) -> &UpgradeEnv {
        &self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use nitrokey_hil_hw_model::testing::FakeHost;
    use nitrokey_hil_hw_model::DeviceData;

    #[test]
    fn test_virtual_device() {
        let host = FakeHost::new();
        let options = Options::try_parse_from(["nitrokey-hil", "--bin-dir", "/opt/bin"]).unwrap();
        let fixtures = Fixtures::new(&options, host.clone());
        let module_device = fixtures.device(true).unwrap();
        assert!(module_device.device.is_virtual());
        let log = host.log.take();
        assert!(log.contains("spawn(usbip-provisioner, serial="));
        assert!(log.contains("provision(nk3)"));
        assert!(log.contains("spawn(usbip-runner, serial="));

        fixtures.release(module_device);
        assert_eq!(host.log.take(), "terminate(pid=2)\n");
    }

    #[test]
    fn test_usb_handles_share_pin() {
        let options =
            Options::try_parse_from(["nitrokey-hil", "--use-usb-devices", "AB", "--model", "nkpk"])
                .unwrap();
        let fixtures = Fixtures::new(&options, FakeHost::new());
        assert_eq!(fixtures.model, Model::Nkpk);

        let device = fixtures.usb_handle(UsbDevice::new(DeviceData::default(), "AB"));
        let touch_device = fixtures.usb_handle(UsbDevice::new(DeviceData::default(), "AB"));
        assert_eq!(device.pin(), None);
        *fixtures.usb_pin.borrow_mut() = Some("1234".into());
        assert_eq!(device.pin().as_deref(), Some("1234"));
        assert_eq!(touch_device.pin().as_deref(), Some("1234"));
    }

    #[test]
    fn test_state_dirs() {
        let host = FakeHost::new();
        let options = Options::try_parse_from(["nitrokey-hil"]).unwrap();
        let fixtures = Fixtures::new(&options, host);
        let (state, ifs) = fixtures.ifs().unwrap();
        assert_eq!(ifs, state.path().join("ifs.bin"));
        assert_eq!(fixtures.serial().len(), 32);
    }
}
