/*++

Licensed under the Apache-2.0 license.

File Name:

    fake_host.rs

Abstract:

    File contains a fake implementation of the UsbipHost trait.

--*/
use std::cell::{Cell, RefCell};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::runner::RunnerProcess;
use crate::testing::Log;
use crate::{
    DeviceData, HwModelError, Model, Result, SimulatorState, UsbPortPath, UsbipHost, PID_NK3,
    VID_NITROKEY,
};

/// A UsbipHost that logs all calls and simulates a runner whose device shows
/// up on the bus once it has been attached.
///
/// Every spawned runner gets the next pid, and its device is enumerated as
/// `hidraw<pid>`, so a respawned device has a different hidraw node.
pub struct FakeHost {
    pub log: Log,
    pub vhci_loaded: Cell<bool>,
    pub missing_binaries: RefCell<Vec<PathBuf>>,
    pub fail_duplicate_attach: Cell<bool>,
    /// Number of scans that come back empty after each attach.
    pub enumeration_delay: Cell<u32>,
    /// Number of failed node checks after each attach; `u32::MAX` for never.
    pub hidraw_delay: Cell<u32>,
    /// Devices that are enumerated in addition to the simulated one.
    pub extra_devices: RefCell<Vec<DeviceData>>,
    pub fail_set_pin: Cell<bool>,
    next_pid: Cell<u32>,
    attaches: Cell<u32>,
    pending_scans: Cell<u32>,
    pending_checks: Cell<u32>,
    exported: Rc<RefCell<Option<DeviceData>>>,
    attached: Rc<RefCell<Option<DeviceData>>>,
}

impl FakeHost {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            log: Log::new(),
            vhci_loaded: Cell::new(true),
            missing_binaries: RefCell::new(vec![]),
            fail_duplicate_attach: Cell::new(false),
            enumeration_delay: Cell::new(0),
            hidraw_delay: Cell::new(0),
            extra_devices: RefCell::new(vec![]),
            fail_set_pin: Cell::new(false),
            next_pid: Cell::new(1),
            attaches: Cell::new(0),
            pending_scans: Cell::new(0),
            pending_checks: Cell::new(0),
            exported: Rc::new(RefCell::new(None)),
            attached: Rc::new(RefCell::new(None)),
        })
    }
}

struct FakeRunner {
    pid: u32,
    log: Log,
    exported: Rc<RefCell<Option<DeviceData>>>,
    attached: Rc<RefCell<Option<DeviceData>>>,
    terminated: bool,
}

impl RunnerProcess for FakeRunner {
    fn id(&self) -> u32 {
        self.pid
    }

    fn terminate(&mut self) -> Result<()> {
        if !self.terminated {
            self.terminated = true;
            writeln!(self.log.w(), "terminate(pid={})", self.pid).unwrap();
            *self.exported.borrow_mut() = None;
            *self.attached.borrow_mut() = None;
        }
        Ok(())
    }

    fn send_user_presence_signal(&mut self) -> Result<()> {
        writeln!(self.log.w(), "signal_user_presence(pid={})", self.pid).unwrap();
        Ok(())
    }
}

impl UsbipHost for FakeHost {
    fn check_vhci(&self) -> Result<()> {
        writeln!(self.log.w(), "check_vhci()").unwrap();
        if self.vhci_loaded.get() {
            Ok(())
        } else {
            Err(HwModelError::VhciMissing {
                module: "vhci_hcd".into(),
            })
        }
    }

    fn binary_exists(&self, path: &Path) -> bool {
        !self.missing_binaries.borrow().iter().any(|p| p == path)
    }

    fn spawn_runner(
        &self,
        binary: &Path,
        state: &SimulatorState,
    ) -> Result<Box<dyn RunnerProcess>> {
        let pid = self.next_pid.get();
        self.next_pid.set(pid + 1);
        writeln!(
            self.log.w(),
            "spawn({}, serial={})",
            binary.file_name().unwrap().to_string_lossy(),
            state.serial
        )
        .unwrap();
        *self.exported.borrow_mut() = Some(DeviceData {
            hidraw: format!("hidraw{pid}"),
            vid: VID_NITROKEY,
            pid: PID_NK3,
        });
        self.attaches.set(0);
        Ok(Box::new(FakeRunner {
            pid,
            log: self.log.clone(),
            exported: self.exported.clone(),
            attached: self.attached.clone(),
            terminated: false,
        }))
    }

    fn list_exported(&self, remote: &str) -> Result<()> {
        writeln!(self.log.w(), "list({remote})").unwrap();
        Ok(())
    }

    fn attach(&self, remote: &str, bus: &UsbPortPath) -> Result<()> {
        writeln!(self.log.w(), "attach({remote}, {bus})").unwrap();
        self.attaches.set(self.attaches.get() + 1);
        if self.attaches.get() > 1 && self.fail_duplicate_attach.get() {
            return Err(HwModelError::CommandFailed {
                command: "usbip attach".into(),
                status: Some(1),
                stderr: "port already in use".into(),
            });
        }
        *self.attached.borrow_mut() = self.exported.borrow().clone();
        self.pending_scans.set(self.enumeration_delay.get());
        self.pending_checks.set(self.hidraw_delay.get());
        Ok(())
    }

    fn find_devices(&self, _vid: u16, _pids: &[u16]) -> Vec<DeviceData> {
        writeln!(self.log.w(), "scan()").unwrap();
        if self.pending_scans.get() > 0 {
            self.pending_scans.set(self.pending_scans.get() - 1);
            return vec![];
        }
        let mut devices: Vec<_> = self.attached.borrow().iter().cloned().collect();
        devices.extend(self.extra_devices.borrow().iter().cloned());
        devices
    }

    fn hidraw_path(&self, hidraw: &str) -> PathBuf {
        Path::new("/dev").join(hidraw)
    }

    fn path_exists(&self, path: &Path) -> bool {
        writeln!(self.log.w(), "exists({})", path.display()).unwrap();
        match self.pending_checks.get() {
            0 => true,
            u32::MAX => false,
            n => {
                self.pending_checks.set(n - 1);
                false
            }
        }
    }

    fn sleep(&self, duration: Duration) {
        writeln!(self.log.w(), "sleep({duration:?})").unwrap();
    }

    fn provision(&self, model: Model) -> Result<()> {
        writeln!(self.log.w(), "provision({})", model.command()).unwrap();
        Ok(())
    }

    fn set_pin(&self, old_pin: Option<&str>, new_pin: &str) -> Result<()> {
        writeln!(self.log.w(), "set_pin({old_pin:?}, {new_pin:?})").unwrap();
        if self.fail_set_pin.get() {
            return Err(HwModelError::PromptMismatch {
                command: "nitropy fido2 set-pin".into(),
                expected: "done".into(),
                reason: "EOF",
                output: String::new(),
            });
        }
        Ok(())
    }
}
