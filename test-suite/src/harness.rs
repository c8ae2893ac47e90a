// Licensed under the Apache-2.0 license

use std::path::Path;
use std::time::Instant;

use anyhow::anyhow;
use log::{error, info};
use nitrokey_hil_hw_model::{Device, UpgradeEnv};

use crate::fixtures::{Fixtures, ModuleDevice};
use crate::markers::{skip_reason, Marker};
use crate::options::Options;
use crate::report::{Outcome, Summary};

pub type DeviceTest = Box<dyn Fn(&mut Device) -> anyhow::Result<()>>;
pub type UpgradeTestFn = Box<dyn Fn(&UpgradeEnv, &str, &Path) -> anyhow::Result<()>>;

/// What a test needs to run.
pub enum TestBody {
    /// The module's device.
    Device(DeviceTest),
    /// The module's device, with manual user presence confirmation.
    TouchDevice(DeviceTest),
    /// A fresh serial and internal flash image; spawns its own devices.
    Upgrade(UpgradeTestFn),
}

pub struct TestCase {
    pub name: String,
    pub markers: Vec<Marker>,
    pub body: TestBody,
}

impl TestCase {
    pub fn new(name: impl Into<String>, markers: &[Marker], body: TestBody) -> Self {
        Self {
            name: name.into(),
            markers: markers.to_vec(),
            body,
        }
    }
}

/// A group of tests sharing module scoped devices.
pub struct Module {
    pub name: &'static str,
    pub markers: Vec<Marker>,
    /// Skips every test in the module.
    pub skip: Option<&'static str>,
    pub cases: Vec<TestCase>,
}

impl Module {
    pub fn new(name: &'static str, cases: Vec<TestCase>) -> Self {
        Self {
            name,
            markers: vec![],
            skip: None,
            cases,
        }
    }
}

type DeviceSlot = Option<Result<ModuleDevice, String>>;

/// Acquires the module device on first use. A failed acquisition fails every
/// test that needs the device without retrying.
fn acquire<'a>(
    slot: &'a mut DeviceSlot,
    fixtures: &Fixtures,
    user_presence: bool,
) -> anyhow::Result<&'a mut Device> {
    let acquired =
        slot.get_or_insert_with(|| fixtures.device(user_presence).map_err(|e| format!("{e:#}")));
    match acquired {
        Ok(module_device) => Ok(&mut module_device.device),
        Err(e) => Err(anyhow!("device setup failed: {e}")),
    }
}

pub struct Harness<'a> {
    options: &'a Options,
    fixtures: Fixtures,
}

impl<'a> Harness<'a> {
    pub fn new(options: &'a Options, fixtures: Fixtures) -> Self {
        Self { options, fixtures }
    }

    fn selected(&self, id: &str) -> bool {
        self.options.filters.is_empty() || self.options.filters.iter().any(|f| id.contains(f))
    }

    pub fn run(&mut self, modules: Vec<Module>) -> Summary {
        let mut summary = Summary::default();
        for module in modules {
            self.run_module(module, &mut summary);
        }
        summary
    }

    fn run_module(&mut self, module: Module, summary: &mut Summary) {
        let mut device: DeviceSlot = None;
        let mut touch_device: DeviceSlot = None;

        for case in &module.cases {
            let id = format!("{}::{}", module.name, case.name);
            if !self.selected(&id) {
                continue;
            }
            let markers: Vec<Marker> = module
                .markers
                .iter()
                .chain(&case.markers)
                .copied()
                .collect();
            if let Some(reason) = module.skip.or_else(|| skip_reason(&markers, self.options)) {
                info!("{id} SKIPPED ({reason})");
                summary.record(id, Outcome::Skipped(reason.into()), Default::default());
                continue;
            }

            info!("{id} ...");
            let start = Instant::now();
            let result = match &case.body {
                TestBody::Device(test) => {
                    acquire(&mut device, &self.fixtures, false).and_then(|d| test(d))
                }
                TestBody::TouchDevice(test) => {
                    acquire(&mut touch_device, &self.fixtures, true).and_then(|d| test(d))
                }
                TestBody::Upgrade(test) => self.fixtures.ifs().and_then(|(_state, ifs)| {
                    test(self.fixtures.upgrade_env(), &self.fixtures.serial(), &ifs)
                }),
            };
            let outcome = match result {
                Ok(()) => {
                    info!("{id} PASSED");
                    Outcome::Passed
                }
                Err(e) => {
                    error!("{id} FAILED: {e:#}");
                    Outcome::Failed(format!("{e:#}"))
                }
            };
            summary.record(id, outcome, start.elapsed());
        }

        for slot in [device, touch_device] {
            if let Some(Ok(module_device)) = slot {
                self.fixtures.release(module_device);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use nitrokey_hil_hw_model::testing::FakeHost;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn harness_run(args: &[&str], host: &Rc<FakeHost>, modules: Vec<Module>) -> Summary {
        let options =
            Options::try_parse_from(["nitrokey-hil", "--virtual"].iter().chain(args)).unwrap();
        let fixtures = Fixtures::new(&options, host.clone());
        Harness::new(&options, fixtures).run(modules)
    }

    fn outcomes(summary: &Summary) -> Vec<(String, Outcome)> {
        summary
            .results()
            .iter()
            .map(|r| (r.id.clone(), r.outcome.clone()))
            .collect()
    }

    #[test]
    fn test_module_device_is_shared_and_released() {
        let host = FakeHost::new();
        let seen = Rc::new(RefCell::new(vec![]));
        let cases = (0..2)
            .map(|i| {
                let seen = seen.clone();
                TestCase::new(
                    format!("case{i}"),
                    &[Marker::Basic],
                    TestBody::Device(Box::new(move |device: &mut Device| {
                        seen.borrow_mut().push(device.hidraw().to_string());
                        Ok(())
                    })),
                )
            })
            .collect();
        let summary = harness_run(&[], &host, vec![Module::new("shared", cases)]);

        assert_eq!(*seen.borrow(), ["hidraw2", "hidraw2"]);
        assert!(summary.success());
        let log = host.log.take();
        assert_eq!(log.matches("spawn(usbip-runner,").count(), 1);
        assert!(log.ends_with("terminate(pid=2)\n"));
    }

    #[test]
    fn test_skips_and_failures() {
        let host = FakeHost::new();
        let modules = vec![
            Module::new(
                "basic",
                vec![
                    TestCase::new(
                        "fails",
                        &[Marker::Basic],
                        TestBody::Device(Box::new(|_: &mut Device| Err(anyhow!("boom")))),
                    ),
                    TestCase::new("normal", &[], TestBody::Device(Box::new(|_: &mut Device| Ok(())))),
                    TestCase::new(
                        "hil",
                        &[Marker::Basic, Marker::HilSkip],
                        TestBody::Device(Box::new(|_: &mut Device| Ok(()))),
                    ),
                ],
            ),
            Module {
                skip: Some("--upgrade not set"),
                ..Module::new(
                    "upgrade",
                    vec![TestCase::new(
                        "test",
                        &[Marker::Basic],
                        TestBody::Upgrade(Box::new(|_: &UpgradeEnv, _: &str, _: &Path| Ok(()))),
                    )],
                )
            },
        ];
        let summary = harness_run(&["--hil"], &host, modules);
        assert_eq!(
            outcomes(&summary),
            [
                ("basic::fails".to_string(), Outcome::Failed("boom".into())),
                (
                    "basic::normal".to_string(),
                    Outcome::Skipped("normal test-suite not selected".into())
                ),
                (
                    "basic::hil".to_string(),
                    Outcome::Skipped("does not run on hil".into())
                ),
                (
                    "upgrade::test".to_string(),
                    Outcome::Skipped("--upgrade not set".into())
                ),
            ]
        );
        assert!(!summary.success());
    }

    #[test]
    fn test_failed_device_setup_fails_dependent_tests() {
        let host = FakeHost::new();
        host.vhci_loaded.set(false);
        let cases = vec![
            TestCase::new("a", &[Marker::Basic], TestBody::Device(Box::new(|_: &mut Device| Ok(())))),
            TestCase::new("b", &[Marker::Basic], TestBody::Device(Box::new(|_: &mut Device| Ok(())))),
        ];
        let summary = harness_run(&[], &host, vec![Module::new("m", cases)]);
        assert_eq!(summary.failed(), 2);
        for result in summary.results() {
            match &result.outcome {
                Outcome::Failed(message) => {
                    assert!(message.starts_with("device setup failed: vhci_hcd kernel module"))
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        // the device is set up once per module
        assert_eq!(host.log.take(), "check_vhci()\n");
    }

    #[test]
    fn test_filters_and_upgrade_body() {
        let host = FakeHost::new();
        let ran = Rc::new(RefCell::new(vec![]));
        let ran2 = ran.clone();
        let cases = vec![
            TestCase::new(
                "ssh[ecdsa]",
                &[Marker::Basic],
                TestBody::Upgrade(Box::new(move |env: &UpgradeEnv, serial: &str, ifs: &Path| {
                    assert_eq!(env.config.bin_dir, Path::new("./bin"));
                    assert!(ifs.ends_with("ifs.bin"));
                    ran2.borrow_mut().push(serial.to_string());
                    Ok(())
                })),
            ),
            TestCase::new(
                "secrets",
                &[Marker::Basic],
                TestBody::Upgrade(Box::new(|_: &UpgradeEnv, _: &str, _: &Path| panic!("not selected"))),
            ),
        ];
        let summary = harness_run(&["ssh"], &host, vec![Module::new("upgrade", cases)]);
        assert_eq!(summary.results().len(), 1);
        assert_eq!(summary.passed(), 1);
        assert_eq!(ran.borrow()[0].len(), 32);
        assert_eq!(host.log.take(), "");
    }
}
