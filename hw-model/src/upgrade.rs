// Licensed under the Apache-2.0 license

//! Tests that run in two steps, with a simulated firmware upgrade in
//! between.

use std::path::Path;
use std::rc::Rc;

use log::info;

use crate::{spawn_device, Device, SpawnParams, UsbipConfig, UsbipHost};

/// Binary suffix of the firmware the upgrade starts from.
pub const OLD_SUFFIX: &str = "old";

/// Where [`UpgradeTest::run_upgrade`] spawns its devices.
#[derive(Clone)]
pub struct UpgradeEnv {
    pub host: Rc<dyn UsbipHost>,
    pub config: UsbipConfig,
}

/// A test that is split into a preparation and a verification step.
///
/// The steps do not have to run against the same device session, so the
/// device can be rebooted or upgraded in between. Both steps get a context
/// built from the device; it is torn down by dropping it.
pub trait UpgradeTest {
    type Context<'a>;
    type State;

    fn name(&self) -> String {
        let name = std::any::type_name::<Self>();
        name.rsplit("::").next().unwrap_or(name).to_string()
    }

    fn context<'a>(&self, device: &'a mut Device) -> anyhow::Result<Self::Context<'a>>;

    fn prepare(&self, context: &mut Self::Context<'_>) -> anyhow::Result<Self::State>;

    fn verify(&self, context: &mut Self::Context<'_>, state: Self::State) -> anyhow::Result<()>;

    /// Runs both steps on `device`.
    fn run(&self, device: &mut Device) -> anyhow::Result<()> {
        let mut context = self.context(device)?;
        let state = self.prepare(&mut context)?;
        self.verify(&mut context, state)
    }

    /// Runs `prepare` against the old firmware and `verify` against the
    /// current one, both using the same serial and internal flash image. A
    /// PIN set during `prepare` is still known to the upgraded device.
    fn run_upgrade(&self, env: &UpgradeEnv, serial: &str, ifs: &Path) -> anyhow::Result<()> {
        let (state, pin) = {
            let mut device = Device::from(spawn_device(
                env.host.clone(),
                &env.config,
                SpawnParams {
                    serial: Some(serial.into()),
                    suffix: Some(OLD_SUFFIX.into()),
                    ..SpawnParams::new(ifs)
                },
            )?);
            let mut context = self.context(&mut device)?;
            let state = self.prepare(&mut context)?;
            drop(context);
            (state, device.pin())
        };

        info!("{}: upgrading", self.name());
        let mut device = Device::from(spawn_device(
            env.host.clone(),
            &env.config,
            SpawnParams {
                serial: Some(serial.into()),
                pin,
                provision: false,
                ..SpawnParams::new(ifs)
            },
        )?);
        let mut context = self.context(&mut device)?;
        self.verify(&mut context, state)
    }
}

/// Object safe form of [`UpgradeTest`], so that tests with different
/// contexts and states can be registered side by side.
pub trait DynUpgradeTest {
    fn test_name(&self) -> String;

    fn exec(&self, device: &mut Device) -> anyhow::Result<()>;

    fn exec_upgrade(&self, env: &UpgradeEnv, serial: &str, ifs: &Path) -> anyhow::Result<()>;
}

impl<T: UpgradeTest> DynUpgradeTest for T {
    fn test_name(&self) -> String {
        self.name()
    }

    fn exec(&self, device: &mut Device) -> anyhow::Result<()> {
        self.run(device)
    }

    fn exec_upgrade(&self, env: &UpgradeEnv, serial: &str, ifs: &Path) -> anyhow::Result<()> {
        self.run_upgrade(env, serial, ifs)
    }
}
